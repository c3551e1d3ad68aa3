// Full userdata: a host-owned blob plus associated user values and an
// optional metatable.

use std::any::Any;

use crate::gc::pool::TableRef;
use crate::value::Value;

pub struct Userdata {
    pub data: Box<dyn Any>,
    pub uservalues: Vec<Value>,
    pub(crate) metatable: Option<TableRef>,
}

impl Userdata {
    pub fn new(data: Box<dyn Any>, nuvalue: usize) -> Self {
        Userdata {
            data,
            uservalues: vec![Value::Nil; nuvalue],
            metatable: None,
        }
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable
    }

    pub fn footprint(&self) -> u32 {
        (std::mem::size_of::<Userdata>() + self.uservalues.len() * std::mem::size_of::<Value>())
            as u32
    }
}
