use std::rc::Rc;

use crate::api::{upvalue_index, GcOp};
use crate::limits::MULTRET;
use crate::value::func::{Proto, UpvalDesc};
use crate::value::Value;
use crate::vm::error::{Error, VmResult};
use crate::vm::opcode::Instr;
use crate::vm::Lua;

pub struct ProtoBuilder {
    code: Vec<Instr>,
    constants: Vec<Value>,
    protos: Vec<Rc<Proto>>,
    upvals: Vec<UpvalDesc>,
    num_params: u8,
    is_vararg: bool,
    max_stack: u8,
}

impl ProtoBuilder {
    pub fn new(num_params: u8, max_stack: u8) -> Self {
        ProtoBuilder {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvals: Vec::new(),
            num_params,
            is_vararg: false,
            max_stack,
        }
    }

    /// Declare the first upvalue as the environment (globals) slot.
    pub fn env(mut self) -> Self {
        self.upvals.push(UpvalDesc {
            in_stack: false,
            index: 0,
        });
        self
    }

    pub fn upval(mut self, in_stack: bool, index: u8) -> Self {
        self.upvals.push(UpvalDesc { in_stack, index });
        self
    }

    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self
    }

    pub fn child(mut self, p: Rc<Proto>) -> Self {
        self.protos.push(p);
        self
    }

    /// Intern a string constant; the collector is expected to be stopped
    /// while protos are assembled (see `main_closure`).
    pub fn kstr(&mut self, lua: &mut Lua, s: &str) -> u32 {
        let v = lua.create_string_str(s);
        self.kval(v)
    }

    pub fn kfloat(&mut self, f: f64) -> u32 {
        self.kval(Value::Float(f))
    }

    pub fn kint(&mut self, i: i64) -> u32 {
        self.kval(Value::Int(i))
    }

    pub fn kval(&mut self, v: Value) -> u32 {
        self.constants.push(v);
        (self.constants.len() - 1) as u32
    }

    pub fn code(mut self, code: Vec<Instr>) -> Self {
        self.code = code;
        self
    }

    pub fn build(self) -> Rc<Proto> {
        let line_info = vec![1u32; self.code.len()];
        Rc::new(Proto {
            code: self.code,
            constants: self.constants,
            protos: self.protos,
            upvals: self.upvals,
            line_info,
            source: "test".into(),
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack: self.max_stack,
        })
    }
}

/// Build a top-level closure with the collector paused, anchored on the
/// stack before collection resumes (proto constants are only reachable
/// through closures).
pub fn push_main(lua: &mut Lua, build: impl FnOnce(&mut Lua) -> Rc<Proto>) {
    lua.gc(GcOp::Stop);
    let proto = build(lua);
    let closure = lua.create_main_closure(proto);
    lua.check_stack(1);
    lua.th_mut().push(closure);
    lua.gc(GcOp::Restart);
}

/// Push a main closure and run it with no arguments and no results.
pub fn run_main(lua: &mut Lua, build: impl FnOnce(&mut Lua) -> Rc<Proto>) -> VmResult<()> {
    push_main(lua, build);
    lua.call(0, 0)
}

/// Collected `print` output, one line per call.
pub fn out_lines(lua: &mut Lua) -> Vec<String> {
    let mut lines = Vec::new();
    lua.get_global("_OUT").expect("_OUT table");
    let n = lua.raw_len(-1);
    for i in 1..=n as i64 {
        lua.raw_get_i(-1, i);
        lines.push(lua.to_rust_string(-1).unwrap_or_default());
        lua.pop(1);
    }
    lua.pop(1);
    lines
}

pub fn out_text(lua: &mut Lua) -> String {
    let mut s = out_lines(lua).join("\n");
    if !s.is_empty() {
        s.push('\n');
    }
    s
}

// ================= host library =================

fn l_print(lua: &mut Lua) -> VmResult<u32> {
    let n = lua.arg_count();
    let mut pieces = Vec::with_capacity(n);
    for i in 1..=n as i32 {
        match lua.to_rust_string(i) {
            Some(s) => pieces.push(s),
            None => pieces.push(lua.display_value(lua.get_value(i))),
        }
    }
    let line = pieces.join("\t");
    lua.get_global("_OUT")?;
    let len = lua.raw_len(-1);
    lua.push_string(&line);
    lua.raw_set_i(-2, len as i64 + 1)?;
    lua.pop(1);
    Ok(0)
}

fn l_type(lua: &mut Lua) -> VmResult<u32> {
    let name = lua.get_value(1).type_name();
    lua.push_string(name);
    Ok(1)
}

fn l_error(lua: &mut Lua) -> VmResult<u32> {
    let v = lua.get_value(1);
    Err(lua.throw_value(v))
}

fn l_assert(lua: &mut Lua) -> VmResult<u32> {
    if lua.get_value(1).is_falsy() {
        let msg = lua
            .to_rust_string(2)
            .unwrap_or_else(|| "assertion failed!".to_string());
        return Err(lua.rt_error(&msg));
    }
    Ok(lua.arg_count() as u32)
}

fn pcall_cont(lua: &mut Lua, _ctx: i64, status: Result<(), Error>) -> VmResult<u32> {
    lua.push_bool(status.is_ok());
    lua.insert(1);
    Ok(lua.get_top() as u32)
}

fn l_pcall(lua: &mut Lua) -> VmResult<u32> {
    let n = lua.arg_count();
    match lua.pcall_k(n - 1, MULTRET, 0, pcall_cont, 0) {
        Ok(()) => pcall_cont(lua, 0, Ok(())),
        Err(Error::Yield) => Err(Error::Yield),
        Err(e) => pcall_cont(lua, 0, Err(e)),
    }
}

fn l_setmetatable(lua: &mut Lua) -> VmResult<u32> {
    lua.push_value(2);
    lua.set_metatable(1)?;
    lua.push_value(1);
    Ok(1)
}

fn l_getmetatable(lua: &mut Lua) -> VmResult<u32> {
    if !lua.get_metatable(1) {
        lua.push_nil();
    }
    Ok(1)
}

fn l_rawget(lua: &mut Lua) -> VmResult<u32> {
    lua.push_value(2);
    lua.raw_get(1);
    Ok(1)
}

fn l_math_type(lua: &mut Lua) -> VmResult<u32> {
    match lua.get_value(1) {
        Value::Int(_) => lua.push_string("integer"),
        Value::Float(_) => lua.push_string("float"),
        _ => lua.push_nil(),
    }
    Ok(1)
}

fn l_co_create(lua: &mut Lua) -> VmResult<u32> {
    let f = lua.get_value(1);
    let co = lua.create_coroutine(f)?;
    lua.check_stack(1);
    lua.th_mut().push(co);
    Ok(1)
}

fn l_co_resume(lua: &mut Lua) -> VmResult<u32> {
    let n = lua.arg_count();
    let Some(co) = lua.to_thread(1) else {
        return Err(lua.rt_error("cannot resume a non-coroutine value"));
    };
    match lua.resume_thread(co, n - 1) {
        Ok(nres) => {
            lua.push_bool(true);
            lua.insert(2);
            Ok(nres as u32 + 1)
        }
        Err(_) => {
            lua.push_bool(false);
            lua.insert(2);
            Ok(2)
        }
    }
}

fn l_co_yield(lua: &mut Lua) -> VmResult<u32> {
    let n = lua.arg_count();
    Err(lua.yield_values(n as u32))
}

fn l_co_status(lua: &mut Lua) -> VmResult<u32> {
    use crate::vm::error::CoStatus;
    let Some(co) = lua.to_thread(1) else {
        return Err(lua.rt_error("coroutine expected"));
    };
    let s = match lua.status_of(co) {
        CoStatus::Suspended => "suspended",
        CoStatus::Running => "running",
        CoStatus::Normal => "normal",
        CoStatus::Dead => "dead",
    };
    lua.push_string(s);
    Ok(1)
}

fn wrap_call(lua: &mut Lua) -> VmResult<u32> {
    let n = lua.arg_count();
    let Some(co) = lua.get_value(upvalue_index(1)).as_thread_ref() else {
        return Err(lua.rt_error("wrapped coroutine missing"));
    };
    match lua.resume_thread(co, n) {
        Ok(nres) => Ok(nres as u32),
        Err(_) => Err(lua.error()),
    }
}

fn l_co_wrap(lua: &mut Lua) -> VmResult<u32> {
    let f = lua.get_value(1);
    let co = lua.create_coroutine(f)?;
    lua.check_stack(1);
    lua.th_mut().push(co);
    lua.push_host_closure(wrap_call, 1);
    Ok(1)
}

fn l_co_close(lua: &mut Lua) -> VmResult<u32> {
    let Some(co) = lua.to_thread(1) else {
        return Err(lua.rt_error("coroutine expected"));
    };
    match lua.close_thread(co) {
        Ok(()) => {
            lua.push_bool(true);
            Ok(1)
        }
        Err(_) => {
            lua.push_bool(false);
            lua.insert(-2);
            Ok(2)
        }
    }
}

/// A state with the test library opened.
pub fn new_lua() -> Box<Lua> {
    let mut lua = Lua::new();
    lua.push_host_fn(l_print);
    lua.set_global("print").unwrap();
    lua.push_host_fn(l_type);
    lua.set_global("type").unwrap();
    lua.push_host_fn(l_error);
    lua.set_global("error").unwrap();
    lua.push_host_fn(l_assert);
    lua.set_global("assert").unwrap();
    lua.push_host_fn(l_pcall);
    lua.set_global("pcall").unwrap();
    lua.push_host_fn(l_setmetatable);
    lua.set_global("setmetatable").unwrap();
    lua.push_host_fn(l_getmetatable);
    lua.set_global("getmetatable").unwrap();
    lua.push_host_fn(l_rawget);
    lua.set_global("rawget").unwrap();

    lua.new_table();
    lua.push_host_fn(l_math_type);
    lua.set_field(-2, "type").unwrap();
    lua.set_global("math").unwrap();

    lua.new_table();
    lua.push_host_fn(l_co_create);
    lua.set_field(-2, "create").unwrap();
    lua.push_host_fn(l_co_resume);
    lua.set_field(-2, "resume").unwrap();
    lua.push_host_fn(l_co_yield);
    lua.set_field(-2, "yield").unwrap();
    lua.push_host_fn(l_co_status);
    lua.set_field(-2, "status").unwrap();
    lua.push_host_fn(l_co_wrap);
    lua.set_field(-2, "wrap").unwrap();
    lua.push_host_fn(l_co_close);
    lua.set_field(-2, "close").unwrap();
    lua.set_global("coroutine").unwrap();

    lua.new_table();
    lua.set_global("_OUT").unwrap();
    lua
}
