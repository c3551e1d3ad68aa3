// Number <-> string conversions.
//
// Integer formatting is canonical decimal. Float formatting first tries the
// shortest representation that round-trips, then falls back to 17 significant
// digits; a trailing ".0" is appended when the text would otherwise read back
// as an integer. Parsing accepts decimal and hex integers, decimal floats,
// and hex floats ("0x1.8p3"), preferring Int when the value is exact.

use crate::value::{float_to_exact_int, Value};

pub fn int_to_string(i: i64) -> String {
    let mut buf = itoa::Buffer::new();
    buf.format(i).to_string()
}

pub fn float_to_string(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    let mut out = format_sig(f, 13);
    if out.parse::<f64>() != Ok(f) {
        out = format_sig(f, 16);
    }
    if !out.contains(['.', 'e', 'E']) {
        out.push_str(".0");
    }
    out
}

/// %g-style rendering with `prec + 1` significant digits.
fn format_sig(f: f64, prec: usize) -> String {
    let exp_form = format!("{:.*e}", prec, f);
    // "d.dddde±x" -> mantissa and decimal exponent
    let epos = exp_form.find('e').expect("exponent marker");
    let mut mantissa = exp_form[..epos].to_string();
    let exp: i32 = exp_form[epos + 1..].parse().expect("exponent digits");
    // Strip trailing zeros of the fraction.
    if mantissa.contains('.') {
        while mantissa.ends_with('0') {
            mantissa.pop();
        }
        if mantissa.ends_with('.') {
            mantissa.pop();
        }
    }
    if exp >= -4 && exp < prec as i32 + 1 {
        fixed_form(&mantissa, exp)
    } else {
        format!("{}e{}{:02}", mantissa, if exp < 0 { "-" } else { "+" }, exp.abs())
    }
}

fn fixed_form(mantissa: &str, exp: i32) -> String {
    let neg = mantissa.starts_with('-');
    let digits: String = mantissa.chars().filter(|c| c.is_ascii_digit()).collect();
    let mut out = String::new();
    if neg {
        out.push('-');
    }
    let point = exp + 1; // digits before the decimal point
    if point <= 0 {
        out.push_str("0.");
        for _ in 0..-point {
            out.push('0');
        }
        out.push_str(&digits);
    } else if (point as usize) >= digits.len() {
        out.push_str(&digits);
        for _ in 0..(point as usize - digits.len()) {
            out.push('0');
        }
    } else {
        out.push_str(&digits[..point as usize]);
        out.push('.');
        out.push_str(&digits[point as usize..]);
    }
    out
}

/// Parse a complete string as a number, Lua-style. Surrounding ASCII
/// whitespace is allowed; "inf"/"nan" literals are not.
pub fn parse_number(s: &str) -> Option<Value> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    let (neg, body) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if body.is_empty() {
        return None;
    }
    if body.len() > 1 && (body.starts_with("0x") || body.starts_with("0X")) {
        return parse_hex(&body[2..], neg);
    }
    // Decimal: integer first, then float. Reject anything Rust would accept
    // beyond Lua's grammar (inf, nan, underscores are already impossible).
    if body.bytes().all(|b| b.is_ascii_digit()) {
        return match i64::from_str_radix(body, 10) {
            Ok(i) => Some(Value::Int(if neg { i.wrapping_neg() } else { i })),
            // Overflowing integer constants read as floats.
            Err(_) => {
                let f: f64 = body.parse().ok()?;
                Some(Value::Float(if neg { -f } else { f }))
            }
        };
    }
    if !body
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return None;
    }
    let f: f64 = body.parse().ok()?;
    Some(Value::Float(if neg { -f } else { f }))
}

/// Hex integer (wrapping) or hex float with binary exponent.
fn parse_hex(body: &str, neg: bool) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    let bytes = body.as_bytes();
    if !body.contains(['.', 'p', 'P']) {
        // Integer: wraps around like the language's hex literals.
        let mut acc: u64 = 0;
        for &b in bytes {
            let d = (b as char).to_digit(16)?;
            acc = acc.wrapping_mul(16).wrapping_add(d as u64);
        }
        let i = acc as i64;
        return Some(Value::Int(if neg { i.wrapping_neg() } else { i }));
    }
    // Hex float: hexdigits[.hexdigits][p[+-]decdigits]
    let mut mantissa: f64 = 0.0;
    let mut exp: i32 = 0;
    let mut i = 0;
    let mut any = false;
    while i < bytes.len() {
        match (bytes[i] as char).to_digit(16) {
            Some(d) => {
                mantissa = mantissa * 16.0 + d as f64;
                any = true;
                i += 1;
            }
            None => break,
        }
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() {
            match (bytes[i] as char).to_digit(16) {
                Some(d) => {
                    mantissa = mantissa * 16.0 + d as f64;
                    exp -= 4;
                    any = true;
                    i += 1;
                }
                None => break,
            }
        }
    }
    if !any {
        return None;
    }
    if i < bytes.len() {
        if bytes[i] != b'p' && bytes[i] != b'P' {
            return None;
        }
        i += 1;
        let mut eneg = false;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            eneg = bytes[i] == b'-';
            i += 1;
        }
        if i >= bytes.len() {
            return None;
        }
        let mut e: i32 = 0;
        while i < bytes.len() {
            let d = (bytes[i] as char).to_digit(10)?;
            e = e.saturating_mul(10).saturating_add(d as i32);
            i += 1;
        }
        exp += if eneg { -e } else { e };
    }
    let f = mantissa * (exp as f64).exp2();
    Some(Value::Float(if neg { -f } else { f }))
}

/// String -> integer, accepting floats with exact integer value.
pub fn parse_integer(s: &str) -> Option<i64> {
    match parse_number(s)? {
        Value::Int(i) => Some(i),
        Value::Float(f) => float_to_exact_int(f),
        _ => None,
    }
}
