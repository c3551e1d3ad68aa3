// Typed-index arenas for every GC-managed object.
//
// A reference to a collectable object is a u32 index into the slab for its
// type. Slabs recycle slots through a free list, so references stay dense and
// never dangle while the collector keeps the object alive. All VM code
// re-derives objects from these indices instead of holding borrows across
// allocations, which is what makes a GC slice at any allocation point safe.

use crate::gc::header::GcHeader;
use crate::gc::interner::StringTable;
use crate::value::func::{Closure, Upvalue};
use crate::value::string::Str;
use crate::value::table::Table;
use crate::value::userdata::Userdata;
use crate::value::Value;
use crate::vm::thread::Thread;

macro_rules! typed_ref {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            #[inline(always)]
            pub fn index(self) -> u32 {
                self.0
            }
        }
    };
}

typed_ref!(
    /// Reference to an interned or long string.
    StrRef
);
typed_ref!(
    /// Reference to a table.
    TableRef
);
typed_ref!(
    /// Reference to a script or host closure.
    ClosureRef
);
typed_ref!(
    /// Reference to an upvalue cell.
    UpvalRef
);
typed_ref!(
    /// Reference to a thread (coroutine).
    ThreadRef
);
typed_ref!(
    /// Reference to a full userdata.
    UdRef
);

/// A reference to any collectable object; the unit of the collector's
/// work lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcRef {
    Str(StrRef),
    Table(TableRef),
    Closure(ClosureRef),
    Upval(UpvalRef),
    Thread(ThreadRef),
    Userdata(UdRef),
}

/// Header + payload, as stored in a slab slot.
pub struct GcBox<T> {
    pub header: GcHeader,
    pub data: T,
}

pub struct Slab<T> {
    slots: Vec<Option<GcBox<T>>>,
    free: Vec<u32>,
}

impl<T> Slab<T> {
    fn new() -> Self {
        Slab {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, header: GcHeader, data: T) -> u32 {
        let boxed = GcBox { header, data };
        if let Some(idx) = self.free.pop() {
            debug_assert!(self.slots[idx as usize].is_none());
            self.slots[idx as usize] = Some(boxed);
            idx
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Some(boxed));
            idx
        }
    }

    #[inline(always)]
    fn get(&self, idx: u32) -> &GcBox<T> {
        self.slots[idx as usize]
            .as_ref()
            .expect("stale object reference")
    }

    #[inline(always)]
    fn get_mut(&mut self, idx: u32) -> &mut GcBox<T> {
        self.slots[idx as usize]
            .as_mut()
            .expect("stale object reference")
    }

    fn free(&mut self, idx: u32) -> GcBox<T> {
        let boxed = self.slots[idx as usize]
            .take()
            .expect("double free of object slot");
        self.free.push(idx);
        boxed
    }

    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// All object storage for one state.
pub struct ObjectPool {
    pub(crate) strings: Slab<Str>,
    pub(crate) tables: Slab<Table>,
    pub(crate) closures: Slab<Closure>,
    pub(crate) upvalues: Slab<Upvalue>,
    pub(crate) threads: Slab<Thread>,
    pub(crate) userdata: Slab<Userdata>,
    /// Short-string intern table; owned here so the sweeper can unlink dead
    /// strings while it frees them.
    pub(crate) strtab: StringTable,
}

impl ObjectPool {
    pub fn new() -> Self {
        ObjectPool {
            strings: Slab::new(),
            tables: Slab::new(),
            closures: Slab::new(),
            upvalues: Slab::new(),
            threads: Slab::new(),
            userdata: Slab::new(),
            strtab: StringTable::new(),
        }
    }

    // ---- typed accessors ----

    #[inline(always)]
    pub fn str_(&self, r: StrRef) -> &Str {
        &self.strings.get(r.0).data
    }

    #[inline(always)]
    pub fn str_header(&self, r: StrRef) -> &GcHeader {
        &self.strings.get(r.0).header
    }

    #[inline(always)]
    pub fn str_header_mut(&mut self, r: StrRef) -> &mut GcHeader {
        &mut self.strings.get_mut(r.0).header
    }

    /// Tag a pinned special string (reserved word / metamethod name) with
    /// its 1-based index.
    pub(crate) fn str_set_extra(&mut self, r: StrRef, extra: u8) {
        self.strings.get_mut(r.0).data.extra = extra;
    }

    #[inline(always)]
    pub fn table(&self, r: TableRef) -> &Table {
        &self.tables.get(r.0).data
    }

    #[inline(always)]
    pub fn table_mut(&mut self, r: TableRef) -> &mut Table {
        &mut self.tables.get_mut(r.0).data
    }

    #[inline(always)]
    pub fn closure(&self, r: ClosureRef) -> &Closure {
        &self.closures.get(r.0).data
    }

    #[inline(always)]
    pub fn closure_mut(&mut self, r: ClosureRef) -> &mut Closure {
        &mut self.closures.get_mut(r.0).data
    }

    #[inline(always)]
    pub fn upvalue(&self, r: UpvalRef) -> &Upvalue {
        &self.upvalues.get(r.0).data
    }

    #[inline(always)]
    pub fn upvalue_mut(&mut self, r: UpvalRef) -> &mut Upvalue {
        &mut self.upvalues.get_mut(r.0).data
    }

    #[inline(always)]
    pub fn thread(&self, r: ThreadRef) -> &Thread {
        &self.threads.get(r.0).data
    }

    #[inline(always)]
    pub fn thread_mut(&mut self, r: ThreadRef) -> &mut Thread {
        &mut self.threads.get_mut(r.0).data
    }

    #[inline(always)]
    pub fn userdata_(&self, r: UdRef) -> &Userdata {
        &self.userdata.get(r.0).data
    }

    #[inline(always)]
    pub fn userdata_mut(&mut self, r: UdRef) -> &mut Userdata {
        &mut self.userdata.get_mut(r.0).data
    }

    // ---- raw allocation (headers come from the collector) ----

    pub fn alloc_str(&mut self, header: GcHeader, s: Str) -> StrRef {
        StrRef(self.strings.alloc(header, s))
    }

    pub fn alloc_table(&mut self, header: GcHeader, t: Table) -> TableRef {
        TableRef(self.tables.alloc(header, t))
    }

    pub fn alloc_closure(&mut self, header: GcHeader, c: Closure) -> ClosureRef {
        ClosureRef(self.closures.alloc(header, c))
    }

    pub fn alloc_upvalue(&mut self, header: GcHeader, u: Upvalue) -> UpvalRef {
        UpvalRef(self.upvalues.alloc(header, u))
    }

    pub fn alloc_thread(&mut self, header: GcHeader, t: Thread) -> ThreadRef {
        ThreadRef(self.threads.alloc(header, t))
    }

    pub fn alloc_userdata(&mut self, header: GcHeader, u: Userdata) -> UdRef {
        UdRef(self.userdata.alloc(header, u))
    }

    // ---- header access by generic reference ----

    pub fn header(&self, r: GcRef) -> &GcHeader {
        match r {
            GcRef::Str(r) => &self.strings.get(r.0).header,
            GcRef::Table(r) => &self.tables.get(r.0).header,
            GcRef::Closure(r) => &self.closures.get(r.0).header,
            GcRef::Upval(r) => &self.upvalues.get(r.0).header,
            GcRef::Thread(r) => &self.threads.get(r.0).header,
            GcRef::Userdata(r) => &self.userdata.get(r.0).header,
        }
    }

    pub fn header_mut(&mut self, r: GcRef) -> &mut GcHeader {
        match r {
            GcRef::Str(r) => &mut self.strings.get_mut(r.0).header,
            GcRef::Table(r) => &mut self.tables.get_mut(r.0).header,
            GcRef::Closure(r) => &mut self.closures.get_mut(r.0).header,
            GcRef::Upval(r) => &mut self.upvalues.get_mut(r.0).header,
            GcRef::Thread(r) => &mut self.threads.get_mut(r.0).header,
            GcRef::Userdata(r) => &mut self.userdata.get_mut(r.0).header,
        }
    }

    /// Free one object. Strings are also unlinked from the intern table;
    /// external string payloads release through `Drop`.
    pub fn free_object(&mut self, r: GcRef) -> usize {
        match r {
            GcRef::Str(sr) => {
                let hash = self.strings.get(sr.0).data.stored_hash();
                let short = self.strings.get(sr.0).data.is_short();
                if short {
                    self.strtab.remove(hash.unwrap_or(0), sr);
                }
                self.strings.free(sr.0).header.size as usize
            }
            GcRef::Table(r) => self.tables.free(r.0).header.size as usize,
            GcRef::Closure(r) => self.closures.free(r.0).header.size as usize,
            GcRef::Upval(r) => self.upvalues.free(r.0).header.size as usize,
            GcRef::Thread(r) => self.threads.free(r.0).header.size as usize,
            GcRef::Userdata(r) => self.userdata.free(r.0).header.size as usize,
        }
    }

    /// Raw equality at the value level. Needs the pool for long-string
    /// byte comparison.
    pub fn raw_eq(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => x == y,
            (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
                crate::value::float_to_exact_int(y) == Some(x)
            }
            (Value::LightUserdata(x), Value::LightUserdata(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => {
                if x == y {
                    return true;
                }
                let (sa, sb) = (self.str_(x), self.str_(y));
                // Two distinct short strings are never byte-equal.
                if sa.is_short() || sb.is_short() {
                    return false;
                }
                sa.as_bytes() == sb.as_bytes()
            }
            (Value::Table(x), Value::Table(y)) => x == y,
            (Value::Closure(x), Value::Closure(y)) => x == y,
            (Value::HostFn(x), Value::HostFn(y)) => std::ptr::fn_addr_eq(x, y),
            (Value::Thread(x), Value::Thread(y)) => x == y,
            (Value::Userdata(x), Value::Userdata(y)) => x == y,
            _ => false,
        }
    }
}
