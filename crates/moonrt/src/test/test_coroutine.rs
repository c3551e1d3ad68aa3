// Coroutines: value plumbing, status transitions, yields across protected
// frames, close semantics, and non-yieldable boundaries.

use std::cell::Cell;

use crate::test::{new_lua, push_main, ProtoBuilder};
use crate::value::Value;
use crate::vm::error::{CoStatus, VmResult};
use crate::vm::opcode::{ArithOp, Instr};
use crate::vm::Lua;

/// function (a, b) local c = coroutine.yield(a + b); return c * 2 end
fn adder_proto(lua: &mut Lua) -> std::rc::Rc<crate::value::func::Proto> {
    let mut b = ProtoBuilder::new(2, 8).env();
    let kco = b.kstr(lua, "coroutine");
    let kyield = b.kstr(lua, "yield");
    b
        .code(vec![
            Instr::GetTabUp { a: 2, b: 0, k: kco },
            Instr::GetField {
                a: 2,
                b: 2,
                k: kyield,
            },
            Instr::Arith {
                op: ArithOp::Add,
                a: 3,
                b: 0,
                c: 1,
            },
            Instr::Call {
                a: 2,
                nargs: 1,
                nres: 1,
            },
            Instr::LoadInt { a: 3, imm: 2 },
            Instr::Arith {
                op: ArithOp::Mul,
                a: 4,
                b: 2,
                c: 3,
            },
            Instr::Return { a: 4, nres: 1 },
        ])
        .build()
}

#[test]
fn yield_and_resume_transfer_values() {
    let mut lua = new_lua();
    push_main(&mut lua, adder_proto);
    let body = lua.get_value(-1);
    let co_v = lua.create_coroutine(body).unwrap();
    let co = co_v.as_thread_ref().unwrap();
    lua.check_stack(3);
    lua.th_mut().push(co_v); // keep the coroutine rooted

    assert_eq!(lua.status_of(co), CoStatus::Suspended);
    lua.push_integer(3);
    lua.push_integer(4);
    let n = lua.resume_thread(co, 2).unwrap();
    assert_eq!(n, 1);
    assert_eq!(lua.to_integer(-1), Some(7));
    lua.pop(1);
    assert_eq!(lua.status_of(co), CoStatus::Suspended);

    lua.push_integer(10);
    let n = lua.resume_thread(co, 1).unwrap();
    assert_eq!(n, 1);
    assert_eq!(lua.to_integer(-1), Some(20));
    lua.pop(1);
    assert_eq!(lua.status_of(co), CoStatus::Dead);

    // A dead coroutine refuses resumption with a proper message.
    let r = lua.resume_thread(co, 0);
    assert!(r.is_err());
    let msg = lua.to_rust_string(-1).unwrap();
    assert!(msg.contains("dead"), "{}", msg);
    lua.pop(2);
}

#[test]
fn errors_inside_a_coroutine_kill_it() {
    let mut lua = new_lua();
    push_main(&mut lua, |lua| {
        let mut b = ProtoBuilder::new(0, 4).env();
        let kerror = b.kstr(lua, "error");
        let kmsg = b.kstr(lua, "sick");
        b.code(vec![
            Instr::GetTabUp { a: 0, b: 0, k: kerror },
            Instr::LoadK { a: 1, k: kmsg },
            Instr::Call {
                a: 0,
                nargs: 1,
                nres: 0,
            },
            Instr::Return { a: 0, nres: 0 },
        ])
        .build()
    });
    let body = lua.get_value(-1);
    let co_v = lua.create_coroutine(body).unwrap();
    let co = co_v.as_thread_ref().unwrap();
    lua.th_mut().push(co_v);

    let r = lua.resume_thread(co, 0);
    assert!(r.is_err());
    let msg = lua.to_rust_string(-1).unwrap();
    assert!(msg.contains("sick"), "{}", msg);
    assert_eq!(lua.status_of(co), CoStatus::Dead);
    lua.set_top(0);
}

#[test]
fn yield_crosses_a_protected_call_and_recovers() {
    let mut lua = new_lua();
    // Body: return pcall(function() coroutine.yield(1); error("late") end)
    push_main(&mut lua, |lua| {
        let mut inner = ProtoBuilder::new(0, 6).env();
        let kco = inner.kstr(lua, "coroutine");
        let kyield = inner.kstr(lua, "yield");
        let kerror = inner.kstr(lua, "error");
        let klate = inner.kstr(lua, "late");
        let inner = inner
            .code(vec![
                Instr::GetTabUp { a: 0, b: 0, k: kco },
                Instr::GetField {
                    a: 0,
                    b: 0,
                    k: kyield,
                },
                Instr::LoadInt { a: 1, imm: 1 },
                Instr::Call {
                    a: 0,
                    nargs: 1,
                    nres: 0,
                },
                Instr::GetTabUp {
                    a: 0,
                    b: 0,
                    k: kerror,
                },
                Instr::LoadK { a: 1, k: klate },
                Instr::Call {
                    a: 0,
                    nargs: 1,
                    nres: 0,
                },
                Instr::Return { a: 0, nres: 0 },
            ])
            .build();
        let mut outer = ProtoBuilder::new(0, 6).env();
        let kpcall = outer.kstr(lua, "pcall");
        outer
            .child(inner)
            .code(vec![
                Instr::GetTabUp { a: 0, b: 0, k: kpcall },
                Instr::MakeClosure { a: 1, p: 0 },
                Instr::Call {
                    a: 0,
                    nargs: 1,
                    nres: -1,
                },
                Instr::Return { a: 0, nres: -1 },
            ])
            .build()
    });
    let body = lua.get_value(-1);
    let co_v = lua.create_coroutine(body).unwrap();
    let co = co_v.as_thread_ref().unwrap();
    lua.th_mut().push(co_v);

    // First resume reaches the yield inside the protected body.
    let n = lua.resume_thread(co, 0).unwrap();
    assert_eq!(n, 1);
    assert_eq!(lua.to_integer(-1), Some(1));
    lua.pop(1);

    // Second resume: the body errors, pcall catches it inside the
    // coroutine, and the coroutine finishes normally with (false, msg).
    let n = lua.resume_thread(co, 0).unwrap();
    assert_eq!(n, 2);
    assert!(!lua.to_boolean(-2));
    let msg = lua.to_rust_string(-1).unwrap();
    assert!(msg.contains("late"), "{}", msg);
    assert_eq!(lua.status_of(co), CoStatus::Dead);
    lua.set_top(0);
}

#[test]
fn wrap_style_sequencing() {
    let mut lua = new_lua();
    // function() coroutine.yield(1); coroutine.yield(2); return 3 end
    push_main(&mut lua, |lua| {
        let mut b = ProtoBuilder::new(0, 6).env();
        let kco = b.kstr(lua, "coroutine");
        let kyield = b.kstr(lua, "yield");
        let mut code = Vec::new();
        for v in [1i32, 2] {
            code.extend([
                Instr::GetTabUp { a: 0, b: 0, k: kco },
                Instr::GetField {
                    a: 0,
                    b: 0,
                    k: kyield,
                },
                Instr::LoadInt { a: 1, imm: v },
                Instr::Call {
                    a: 0,
                    nargs: 1,
                    nres: 0,
                },
            ]);
        }
        code.push(Instr::LoadInt { a: 0, imm: 3 });
        code.push(Instr::Return { a: 0, nres: 1 });
        b.code(code).build()
    });
    let body = lua.get_value(-1);
    let co_v = lua.create_coroutine(body).unwrap();
    let co = co_v.as_thread_ref().unwrap();
    lua.th_mut().push(co_v);

    for expect in [1i64, 2] {
        let n = lua.resume_thread(co, 0).unwrap();
        assert_eq!(n, 1);
        assert_eq!(lua.to_integer(-1), Some(expect));
        lua.pop(1);
    }
    // The third resume finishes the body.
    let n = lua.resume_thread(co, 0).unwrap();
    assert_eq!(n, 1);
    assert_eq!(lua.to_integer(-1), Some(3));
    lua.pop(1);
    // And the fourth refuses.
    assert!(lua.resume_thread(co, 0).is_err());
    lua.set_top(0);
}

#[test]
fn close_runs_pending_tbc_handlers() {
    thread_local! {
        static CLOSED: Cell<u32> = const { Cell::new(0) };
    }
    fn counter(_lua: &mut Lua) -> VmResult<u32> {
        CLOSED.with(|c| c.set(c.get() + 1));
        Ok(0)
    }
    CLOSED.with(|c| c.set(0));

    let mut lua = new_lua();
    let obj = lua.new_table_raw(0, 0);
    let mt = lua.new_table_raw(0, 0);
    let key = lua.create_string(b"__close");
    lua.pool
        .table_rawset(mt, key, Value::HostFn(counter))
        .unwrap();
    lua.set_metatable_of(Value::Table(obj), Some(mt)).unwrap();
    lua.check_stack(1);
    lua.th_mut().push(Value::Table(obj));
    lua.set_global("obj").unwrap();

    // Body: local x <close> = obj; coroutine.yield(); (never resumed)
    push_main(&mut lua, |lua| {
        let mut b = ProtoBuilder::new(0, 6).env();
        let kobj = b.kstr(lua, "obj");
        let kco = b.kstr(lua, "coroutine");
        let kyield = b.kstr(lua, "yield");
        b.code(vec![
            Instr::GetTabUp { a: 0, b: 0, k: kobj },
            Instr::Tbc { a: 0 },
            Instr::GetTabUp { a: 1, b: 0, k: kco },
            Instr::GetField {
                a: 1,
                b: 1,
                k: kyield,
            },
            Instr::Call {
                a: 1,
                nargs: 0,
                nres: 0,
            },
            Instr::Return { a: 0, nres: 0 },
        ])
        .build()
    });
    let body = lua.get_value(-1);
    let co_v = lua.create_coroutine(body).unwrap();
    let co = co_v.as_thread_ref().unwrap();
    lua.th_mut().push(co_v);

    lua.resume_thread(co, 0).unwrap(); // suspended at the yield
    assert_eq!(CLOSED.with(|c| c.get()), 0);
    lua.close_thread(co).unwrap();
    assert_eq!(CLOSED.with(|c| c.get()), 1);
    assert_eq!(lua.status_of(co), CoStatus::Dead);
    lua.set_top(0);
}

#[test]
fn yield_inside_a_host_metamethod_is_rejected() {
    fn yielding_add(lua: &mut Lua) -> VmResult<u32> {
        Err(lua.yield_values(0))
    }

    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    let mt = lua.new_table_raw(0, 0);
    let key = lua.create_string(b"__add");
    lua.pool
        .table_rawset(mt, key, Value::HostFn(yielding_add))
        .unwrap();
    lua.set_metatable_of(Value::Table(t), Some(mt)).unwrap();
    lua.check_stack(1);
    lua.th_mut().push(Value::Table(t));
    lua.set_global("t").unwrap();

    // Body: return t + 1
    push_main(&mut lua, |lua| {
        let mut b = ProtoBuilder::new(0, 6).env();
        let kt = b.kstr(lua, "t");
        b.code(vec![
            Instr::GetTabUp { a: 0, b: 0, k: kt },
            Instr::LoadInt { a: 1, imm: 1 },
            Instr::Arith {
                op: ArithOp::Add,
                a: 2,
                b: 0,
                c: 1,
            },
            Instr::Return { a: 2, nres: 1 },
        ])
        .build()
    });
    let body = lua.get_value(-1);
    let co_v = lua.create_coroutine(body).unwrap();
    let co = co_v.as_thread_ref().unwrap();
    lua.th_mut().push(co_v);

    let r = lua.resume_thread(co, 0);
    assert!(r.is_err());
    let msg = lua.to_rust_string(-1).unwrap();
    assert!(msg.contains("yield"), "{}", msg);
    lua.set_top(0);
}

#[test]
fn main_thread_cannot_yield() {
    let mut lua = new_lua();
    let e = lua.yield_values(0);
    assert_eq!(e, crate::vm::error::Error::Runtime);
    let msg = lua.display_value(lua.th().error_value);
    assert!(msg.contains("outside a coroutine"), "{}", msg);
    assert!(!lua.yieldable());
}
