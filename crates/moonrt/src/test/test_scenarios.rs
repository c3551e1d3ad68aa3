// End-to-end programs, hand-assembled, checked against their exact output.

use crate::test::{new_lua, out_text, run_main, ProtoBuilder};
use crate::vm::opcode::{ArithOp, Instr};

#[test]
fn basic_table_and_length() {
    // local t = {} for i = 1, 5 do t[i] = i * i end print(t[3], #t)
    let mut lua = new_lua();
    run_main(&mut lua, |lua| {
        let mut b = ProtoBuilder::new(0, 10).env();
        let kprint = b.kstr(lua, "print");
        b.code(vec![
            Instr::NewTable {
                a: 0,
                narr: 0,
                nrec: 0,
            },
            Instr::LoadInt { a: 1, imm: 1 },
            Instr::LoadInt { a: 2, imm: 5 },
            Instr::LoadInt { a: 3, imm: 1 },
            Instr::ForPrep { a: 1, jump: 3 },
            Instr::Arith {
                op: ArithOp::Mul,
                a: 5,
                b: 4,
                c: 4,
            },
            Instr::SetTable { a: 0, b: 4, c: 5 },
            Instr::ForLoop { a: 1, back: 3 },
            Instr::GetTabUp {
                a: 1,
                b: 0,
                k: kprint,
            },
            Instr::GetIndex { a: 2, b: 0, i: 3 },
            Instr::Len { a: 3, b: 0 },
            Instr::Call {
                a: 1,
                nargs: 2,
                nres: 0,
            },
            Instr::Return { a: 0, nres: 0 },
        ])
        .build()
    })
    .unwrap();
    assert_eq!(out_text(&mut lua), "9\t5\n");
}

#[test]
fn oo_via_metatable_index() {
    // local base = {greet = function(self) return "hi, "..self.name end}
    // local m = {__index = base}
    // local obj = setmetatable({name = "world"}, m)
    // print(obj:greet())
    let mut lua = new_lua();
    run_main(&mut lua, |lua| {
        let mut greet = ProtoBuilder::new(1, 6);
        let khi = greet.kstr(lua, "hi, ");
        let kname = greet.kstr(lua, "name");
        let greet = greet
            .code(vec![
                Instr::LoadK { a: 1, k: khi },
                Instr::GetField {
                    a: 2,
                    b: 0,
                    k: kname,
                },
                Instr::Concat { a: 1, n: 2 },
                Instr::Return { a: 1, nres: 1 },
            ])
            .build();

        let mut b = ProtoBuilder::new(0, 12).env();
        let kgreet = b.kstr(lua, "greet");
        let kindex = b.kstr(lua, "__index");
        let ksetmt = b.kstr(lua, "setmetatable");
        let kname = b.kstr(lua, "name");
        let kworld = b.kstr(lua, "world");
        let kprint = b.kstr(lua, "print");
        b.child(greet)
            .code(vec![
                Instr::NewTable {
                    a: 0,
                    narr: 0,
                    nrec: 1,
                }, // base
                Instr::MakeClosure { a: 1, p: 0 },
                Instr::SetField {
                    a: 0,
                    k: kgreet,
                    c: 1,
                },
                Instr::NewTable {
                    a: 1,
                    narr: 0,
                    nrec: 1,
                }, // m
                Instr::SetField {
                    a: 1,
                    k: kindex,
                    c: 0,
                },
                Instr::GetTabUp {
                    a: 2,
                    b: 0,
                    k: ksetmt,
                },
                Instr::NewTable {
                    a: 3,
                    narr: 0,
                    nrec: 1,
                },
                Instr::LoadK { a: 4, k: kworld },
                Instr::SetField {
                    a: 3,
                    k: kname,
                    c: 4,
                },
                Instr::Move { a: 4, b: 1 },
                Instr::Call {
                    a: 2,
                    nargs: 2,
                    nres: 1,
                }, // obj in r2
                Instr::GetTabUp {
                    a: 3,
                    b: 0,
                    k: kprint,
                },
                Instr::SelfField {
                    a: 4,
                    b: 2,
                    k: kgreet,
                },
                Instr::Call {
                    a: 4,
                    nargs: 1,
                    nres: -1,
                },
                Instr::Call {
                    a: 3,
                    nargs: -1,
                    nres: 0,
                },
                Instr::Return { a: 0, nres: 0 },
            ])
            .build()
    })
    .unwrap();
    assert_eq!(out_text(&mut lua), "hi, world\n");
}

#[test]
fn protected_call_preserves_error_objects() {
    // local ok, e = pcall(function() error({code = 42}) end)
    // print(ok, type(e), e.code)
    let mut lua = new_lua();
    run_main(&mut lua, |lua| {
        let mut inner = ProtoBuilder::new(0, 6).env();
        let kerror = inner.kstr(lua, "error");
        let kcode = inner.kstr(lua, "code");
        let inner = inner
            .code(vec![
                Instr::GetTabUp {
                    a: 0,
                    b: 0,
                    k: kerror,
                },
                Instr::NewTable {
                    a: 1,
                    narr: 0,
                    nrec: 1,
                },
                Instr::LoadInt { a: 2, imm: 42 },
                Instr::SetField {
                    a: 1,
                    k: kcode,
                    c: 2,
                },
                Instr::Call {
                    a: 0,
                    nargs: 1,
                    nres: 0,
                },
                Instr::Return { a: 0, nres: 0 },
            ])
            .build();

        let mut b = ProtoBuilder::new(0, 12).env();
        let kpcall = b.kstr(lua, "pcall");
        let kprint = b.kstr(lua, "print");
        let ktype = b.kstr(lua, "type");
        let kcode = b.kstr(lua, "code");
        b.child(inner)
            .code(vec![
                Instr::GetTabUp {
                    a: 0,
                    b: 0,
                    k: kpcall,
                },
                Instr::MakeClosure { a: 1, p: 0 },
                Instr::Call {
                    a: 0,
                    nargs: 1,
                    nres: 2,
                }, // ok = r0, e = r1
                Instr::GetTabUp {
                    a: 2,
                    b: 0,
                    k: kprint,
                },
                Instr::Move { a: 3, b: 0 },
                Instr::GetTabUp { a: 4, b: 0, k: ktype },
                Instr::Move { a: 5, b: 1 },
                Instr::Call {
                    a: 4,
                    nargs: 1,
                    nres: 1,
                },
                Instr::GetField {
                    a: 5,
                    b: 1,
                    k: kcode,
                },
                Instr::Call {
                    a: 2,
                    nargs: 3,
                    nres: 0,
                },
                Instr::Return { a: 0, nres: 0 },
            ])
            .build()
    })
    .unwrap();
    assert_eq!(out_text(&mut lua), "false\ttable\t42\n");
}

#[test]
fn coroutine_yield_resume_plumbing() {
    // local co = coroutine.create(function(a, b)
    //   local c = coroutine.yield(a + b); return c * 2 end)
    // print(coroutine.resume(co, 3, 4))
    // print(coroutine.resume(co, 10))
    let mut lua = new_lua();
    run_main(&mut lua, |lua| {
        let mut body = ProtoBuilder::new(2, 8).env();
        let kco = body.kstr(lua, "coroutine");
        let kyield = body.kstr(lua, "yield");
        let body = body
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
            .build();

        let mut b = ProtoBuilder::new(0, 12).env();
        let kco = b.kstr(lua, "coroutine");
        let kcreate = b.kstr(lua, "create");
        let kresume = b.kstr(lua, "resume");
        let kprint = b.kstr(lua, "print");
        b.child(body)
            .code(vec![
                Instr::GetTabUp { a: 0, b: 0, k: kco },
                Instr::GetField {
                    a: 1,
                    b: 0,
                    k: kcreate,
                },
                Instr::MakeClosure { a: 2, p: 0 },
                Instr::Call {
                    a: 1,
                    nargs: 1,
                    nres: 1,
                }, // co in r1
                // print(coroutine.resume(co, 3, 4))
                Instr::GetTabUp {
                    a: 2,
                    b: 0,
                    k: kprint,
                },
                Instr::GetTabUp { a: 3, b: 0, k: kco },
                Instr::GetField {
                    a: 3,
                    b: 3,
                    k: kresume,
                },
                Instr::Move { a: 4, b: 1 },
                Instr::LoadInt { a: 5, imm: 3 },
                Instr::LoadInt { a: 6, imm: 4 },
                Instr::Call {
                    a: 3,
                    nargs: 3,
                    nres: -1,
                },
                Instr::Call {
                    a: 2,
                    nargs: -1,
                    nres: 0,
                },
                // print(coroutine.resume(co, 10))
                Instr::GetTabUp {
                    a: 2,
                    b: 0,
                    k: kprint,
                },
                Instr::GetTabUp { a: 3, b: 0, k: kco },
                Instr::GetField {
                    a: 3,
                    b: 3,
                    k: kresume,
                },
                Instr::Move { a: 4, b: 1 },
                Instr::LoadInt { a: 5, imm: 10 },
                Instr::Call {
                    a: 3,
                    nargs: 2,
                    nres: -1,
                },
                Instr::Call {
                    a: 2,
                    nargs: -1,
                    nres: 0,
                },
                Instr::Return { a: 0, nres: 0 },
            ])
            .build()
    })
    .unwrap();
    assert_eq!(out_text(&mut lua), "true\t7\ntrue\t20\n");
}

#[test]
fn integer_float_coexistence() {
    // print(1 // 0.5, 1 / 0.5, math.type(1 + 1), math.type(1 + 1.0))
    let mut lua = new_lua();
    run_main(&mut lua, |lua| {
        let mut b = ProtoBuilder::new(0, 12).env();
        let kprint = b.kstr(lua, "print");
        let kmath = b.kstr(lua, "math");
        let ktype = b.kstr(lua, "type");
        let khalf = b.kfloat(0.5);
        let kone = b.kfloat(1.0);
        b.code(vec![
            Instr::GetTabUp {
                a: 0,
                b: 0,
                k: kprint,
            },
            // r1 = 1 // 0.5
            Instr::LoadInt { a: 1, imm: 1 },
            Instr::LoadK { a: 2, k: khalf },
            Instr::Arith {
                op: ArithOp::IDiv,
                a: 1,
                b: 1,
                c: 2,
            },
            // r2 = 1 / 0.5
            Instr::LoadInt { a: 2, imm: 1 },
            Instr::LoadK { a: 3, k: khalf },
            Instr::Arith {
                op: ArithOp::Div,
                a: 2,
                b: 2,
                c: 3,
            },
            // r3 = math.type(1 + 1)
            Instr::GetTabUp { a: 3, b: 0, k: kmath },
            Instr::GetField { a: 3, b: 3, k: ktype },
            Instr::LoadInt { a: 4, imm: 1 },
            Instr::LoadInt { a: 5, imm: 1 },
            Instr::Arith {
                op: ArithOp::Add,
                a: 4,
                b: 4,
                c: 5,
            },
            Instr::Call {
                a: 3,
                nargs: 1,
                nres: 1,
            },
            // r4 = math.type(1 + 1.0)
            Instr::GetTabUp { a: 4, b: 0, k: kmath },
            Instr::GetField { a: 4, b: 4, k: ktype },
            Instr::LoadInt { a: 5, imm: 1 },
            Instr::LoadK { a: 6, k: kone },
            Instr::Arith {
                op: ArithOp::Add,
                a: 5,
                b: 5,
                c: 6,
            },
            Instr::Call {
                a: 4,
                nargs: 1,
                nres: 1,
            },
            Instr::Call {
                a: 0,
                nargs: 4,
                nres: 0,
            },
            Instr::Return { a: 0, nres: 0 },
        ])
        .build()
    })
    .unwrap();
    assert_eq!(out_text(&mut lua), "2.0\t2.0\tinteger\tfloat\n");
}

#[test]
fn close_fires_in_reverse_order_on_error_unwind() {
    // local log = {}
    // local function mk(tag)
    //   return setmetatable({}, {__close = function() log[#log+1] = tag end})
    // end
    // local ok = pcall(function()
    //   local a <close> = mk("A"); local b <close> = mk("B"); error("x")
    // end)
    // print(ok, log[1], log[2])
    let mut lua = new_lua();
    run_main(&mut lua, |lua| {
        // __close handler: upvalues are [log (mk's upvalue 1), tag (mk's
        // local 0)].
        let closer = ProtoBuilder::new(2, 6)
            .upval(false, 1)
            .upval(true, 0)
            .code(vec![
                Instr::GetUpval { a: 2, b: 0 }, // log
                Instr::Len { a: 3, b: 2 },
                Instr::LoadInt { a: 4, imm: 1 },
                Instr::Arith {
                    op: ArithOp::Add,
                    a: 3,
                    b: 3,
                    c: 4,
                },
                Instr::GetUpval { a: 4, b: 1 }, // tag
                Instr::SetTable { a: 2, b: 3, c: 4 },
                Instr::Return { a: 0, nres: 0 },
            ])
            .build();

        // mk(tag): upvalues are [env, log (main's local 0)].
        let mut mk = ProtoBuilder::new(1, 8).env().upval(true, 0);
        let ksetmt = mk.kstr(lua, "setmetatable");
        let kclose = mk.kstr(lua, "__close");
        let mk = mk
            .child(closer)
            .code(vec![
                Instr::GetTabUp {
                    a: 1,
                    b: 0,
                    k: ksetmt,
                },
                Instr::NewTable {
                    a: 2,
                    narr: 0,
                    nrec: 0,
                },
                Instr::NewTable {
                    a: 3,
                    narr: 0,
                    nrec: 1,
                },
                Instr::MakeClosure { a: 4, p: 0 },
                Instr::SetField {
                    a: 3,
                    k: kclose,
                    c: 4,
                },
                Instr::Call {
                    a: 1,
                    nargs: 2,
                    nres: 1,
                },
                Instr::Return { a: 1, nres: 1 },
            ])
            .build();

        // pcall body: upvalues are [env, mk (main's local 1)].
        let mut body = ProtoBuilder::new(0, 8).env().upval(true, 1);
        let ka = body.kstr(lua, "A");
        let kb = body.kstr(lua, "B");
        let kerror = body.kstr(lua, "error");
        let kx = body.kstr(lua, "x");
        let body = body
            .code(vec![
                Instr::GetUpval { a: 0, b: 1 },
                Instr::LoadK { a: 1, k: ka },
                Instr::Call {
                    a: 0,
                    nargs: 1,
                    nres: 1,
                },
                Instr::Tbc { a: 0 },
                Instr::GetUpval { a: 1, b: 1 },
                Instr::LoadK { a: 2, k: kb },
                Instr::Call {
                    a: 1,
                    nargs: 1,
                    nres: 1,
                },
                Instr::Tbc { a: 1 },
                Instr::GetTabUp {
                    a: 2,
                    b: 0,
                    k: kerror,
                },
                Instr::LoadK { a: 3, k: kx },
                Instr::Call {
                    a: 2,
                    nargs: 1,
                    nres: 0,
                },
                Instr::Return { a: 0, nres: 0 },
            ])
            .build();

        let mut b = ProtoBuilder::new(0, 12).env();
        let kpcall = b.kstr(lua, "pcall");
        let kprint = b.kstr(lua, "print");
        b.child(mk)
            .child(body)
            .code(vec![
                Instr::NewTable {
                    a: 0,
                    narr: 0,
                    nrec: 0,
                }, // log
                Instr::MakeClosure { a: 1, p: 0 }, // mk
                Instr::GetTabUp {
                    a: 2,
                    b: 0,
                    k: kpcall,
                },
                Instr::MakeClosure { a: 3, p: 1 }, // pcall body
                Instr::Call {
                    a: 2,
                    nargs: 1,
                    nres: 1,
                }, // ok in r2
                Instr::GetTabUp {
                    a: 3,
                    b: 0,
                    k: kprint,
                },
                Instr::Move { a: 4, b: 2 },
                Instr::GetIndex { a: 5, b: 0, i: 1 },
                Instr::GetIndex { a: 6, b: 0, i: 2 },
                Instr::Call {
                    a: 3,
                    nargs: 3,
                    nres: 0,
                },
                Instr::Return { a: 0, nres: 0 },
            ])
            .build()
    })
    .unwrap();
    assert_eq!(out_text(&mut lua), "false\tB\tA\n");
}
