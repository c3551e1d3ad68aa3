// The load and dump protocols. Compilation and the chunk byte codec are
// external components reached through the hooks on the state; this module
// owns the reader/writer driving, mode policing, and result placement.

use std::rc::Rc;

use crate::value::func::Proto;
use crate::value::Value;
use crate::vm::error::Error;
use crate::vm::Lua;

/// Pull-style chunk source: return slices until `None`.
pub trait Reader {
    fn next_chunk(&mut self) -> Option<&[u8]>;
}

/// A reader over one in-memory buffer.
pub struct SliceReader<'a> {
    data: Option<&'a [u8]>,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceReader { data: Some(data) }
    }
}

impl<'a> Reader for SliceReader<'a> {
    fn next_chunk(&mut self) -> Option<&[u8]> {
        self.data.take()
    }
}

/// What kinds of chunk `load` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Text,
    Binary,
    Both,
}

/// First byte of a precompiled chunk.
pub const BINARY_SIGNATURE: u8 = 0x1B;

impl Lua {
    /// Load a chunk: drain the reader, dispatch to the codec (binary) or
    /// the compiler (text), and leave the resulting closure on the stack.
    /// On failure the error value is left instead and `Syntax` returned.
    pub fn load(
        &mut self,
        reader: &mut dyn Reader,
        chunk_name: &str,
        mode: LoadMode,
    ) -> Result<(), Error> {
        let mut source = Vec::new();
        while let Some(chunk) = reader.next_chunk() {
            if chunk.is_empty() {
                break;
            }
            source.extend_from_slice(chunk);
        }

        let is_binary = source.first() == Some(&BINARY_SIGNATURE);
        let allowed = match mode {
            LoadMode::Both => true,
            LoadMode::Text => !is_binary,
            LoadMode::Binary => is_binary,
        };
        if !allowed {
            let what = if is_binary { "binary" } else { "text" };
            let msg = format!("attempt to load a {} chunk (mode is wrong)", what);
            return self.load_failed(&msg);
        }

        let compiled: Result<Rc<Proto>, String> = if is_binary {
            match self.codec.take() {
                Some(mut codec) => {
                    let r = codec.undump(&source, chunk_name);
                    self.codec = Some(codec);
                    r
                }
                None => Err(format!("{}: no chunk codec installed", chunk_name)),
            }
        } else {
            match self.compiler.take() {
                Some(mut compiler) => {
                    let r = compiler.compile(&source, chunk_name);
                    self.compiler = Some(compiler);
                    r
                }
                None => Err(format!("{}: no compiler installed", chunk_name)),
            }
        };

        match compiled {
            Ok(proto) => {
                let closure = self.create_main_closure(proto);
                let top = self.th().top;
                let _ = self.ensure_stack_abs(top + 1);
                self.th_mut().push(closure);
                Ok(())
            }
            Err(msg) => self.load_failed(&msg),
        }
    }

    fn load_failed(&mut self, msg: &str) -> Result<(), Error> {
        let v = self.create_string_str(msg);
        let top = self.th().top;
        let _ = self.ensure_stack_abs(top + 1);
        self.th_mut().push(v);
        self.th_mut().error_value = v;
        Err(Error::Syntax)
    }

    /// Dump the script closure on top of the stack through the writer. A
    /// nonzero writer status aborts and is returned; -1 means the value is
    /// not dumpable or no codec is installed.
    pub fn dump(&mut self, writer: &mut dyn FnMut(&[u8]) -> i32, strip: bool) -> i32 {
        let proto = {
            let v = self.get_value(-1);
            let Some(cr) = v.as_closure_ref() else {
                return -1;
            };
            match self.pool.closure(cr).as_script() {
                Some(sc) => sc.proto.clone(),
                None => return -1,
            }
        };
        match self.codec.take() {
            Some(mut codec) => {
                let status = codec.dump(&proto, writer, strip);
                self.codec = Some(codec);
                status
            }
            None => -1,
        }
    }

    pub fn set_compiler(&mut self, c: Option<Box<dyn crate::vm::ChunkCompiler>>) {
        self.compiler = c;
    }

    pub fn set_codec(&mut self, c: Option<Box<dyn crate::vm::ProtoCodec>>) {
        self.codec = c;
    }
}
