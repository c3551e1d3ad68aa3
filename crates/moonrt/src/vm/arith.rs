// Numeric operator semantics: integer ops wrap (two's complement), `idiv`
// and `mod` are floor operations, `/` and `^` always produce floats, shifts
// by >= 64 bits give 0 and negative shift counts reverse direction.

use crate::value::{float_to_exact_int, Value};
use crate::vm::opcode::ArithOp;

/// Why a numeric fast path refused the operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithFail {
    /// At least one operand is not a number (after string coercion).
    NotNumber,
    /// A bitwise op met a float with no exact integer value.
    NoIntRepr,
    /// Integer division or modulo by zero.
    DivByZero,
}

#[inline]
pub fn int_arith(op: ArithOp, a: i64, b: i64) -> Result<i64, ArithFail> {
    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::IDiv => {
            if b == 0 {
                return Err(ArithFail::DivByZero);
            }
            floor_div(a, b)
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(ArithFail::DivByZero);
            }
            floor_mod(a, b)
        }
        ArithOp::BAnd => a & b,
        ArithOp::BOr => a | b,
        ArithOp::BXor => a ^ b,
        ArithOp::Shl => shift_left(a, b),
        ArithOp::Shr => shift_left(a, b.wrapping_neg()),
        // Always float.
        ArithOp::Div | ArithOp::Pow => unreachable!("float-only operator"),
    })
}

/// Floor division; the pair (idiv, mod) satisfies
/// `(a idiv b) * b + (a mod b) == a` with `sign(mod) == sign(b)`.
#[inline]
pub fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

#[inline]
pub fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        r.wrapping_add(b)
    } else {
        r
    }
}

/// Shift left by `n`; negative `n` shifts right. Counts at or past the bit
/// width produce zero. Right shifts are logical (unsigned).
#[inline]
pub fn shift_left(a: i64, n: i64) -> i64 {
    if n >= 0 {
        if n >= 64 {
            0
        } else {
            ((a as u64) << n) as i64
        }
    } else if n <= -64 {
        0
    } else {
        ((a as u64) >> -n) as i64
    }
}

#[inline]
pub fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::IDiv => (a / b).floor(),
        ArithOp::Mod => float_mod(a, b),
        ArithOp::Pow => a.powf(b),
        _ => unreachable!("integer-only operator"),
    }
}

/// Floating modulo with the sign of the divisor.
#[inline]
pub fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

/// True when the operator has no integer version.
#[inline]
pub fn float_only(op: ArithOp) -> bool {
    matches!(op, ArithOp::Div | ArithOp::Pow)
}

#[inline]
pub fn is_bitwise(op: ArithOp) -> bool {
    matches!(
        op,
        ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
    )
}

/// The integer a value represents for bitwise ops: Int directly, Float only
/// when exact.
#[inline]
pub fn value_to_shift_int(v: Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(i),
        Value::Float(f) => float_to_exact_int(f),
        _ => None,
    }
}

/// Numeric comparison across Int/Float without rounding surprises at the
/// 2^63 boundary.
pub fn num_lt(a: Value, b: Value) -> Option<bool> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x < y),
        (Value::Float(x), Value::Float(y)) => Some(x < y),
        (Value::Int(x), Value::Float(y)) => Some(int_lt_float(x, y)),
        (Value::Float(x), Value::Int(y)) => Some(float_lt_int(x, y)),
        _ => None,
    }
}

pub fn num_le(a: Value, b: Value) -> Option<bool> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x <= y),
        (Value::Float(x), Value::Float(y)) => Some(x <= y),
        (Value::Int(x), Value::Float(y)) => Some(int_le_float(x, y)),
        (Value::Float(x), Value::Int(y)) => Some(float_le_int(x, y)),
        _ => None,
    }
}

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

// Mixed comparisons go through floor/ceil so the float is never rounded
// toward the integer; doubles in (-2^63, 2^63) floor/ceil to exact i64s.

fn int_lt_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        true
    } else if f <= -TWO_POW_63 {
        false
    } else {
        i < f.ceil() as i64
    }
}

fn float_lt_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        false
    } else if f < -TWO_POW_63 {
        true
    } else {
        (f.floor() as i64) < i
    }
}

fn int_le_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        true
    } else if f < -TWO_POW_63 {
        false
    } else {
        i <= f.floor() as i64
    }
}

fn float_le_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        false
    } else if f <= -TWO_POW_63 {
        true
    } else {
        (f.ceil() as i64) <= i
    }
}
