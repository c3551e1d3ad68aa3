// Table engine: raw access, key normalization, rehash, borders, traversal,
// and the fast-metamethod cache.

use crate::test::new_lua;
use crate::value::table::{normalize_key, KeyError};
use crate::value::Value;
use crate::vm::metamethod::Tm;

#[test]
fn set_then_get_round_trips() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    let key = lua.create_string(b"k");
    lua.pool.table_rawset(t, key, Value::Int(7)).unwrap();
    assert!(lua.pool.raw_eq(lua.pool.table_rawget(t, key), Value::Int(7)));

    lua.pool.table_rawset(t, Value::Int(1), Value::Bool(true)).unwrap();
    assert!(matches!(
        lua.pool.table_rawget(t, Value::Int(1)),
        Value::Bool(true)
    ));

    // Negative and far-out integer keys live in the hash part.
    lua.pool.table_rawset(t, Value::Int(-5), Value::Int(50)).unwrap();
    lua.pool
        .table_rawset(t, Value::Int(1 << 40), Value::Int(40))
        .unwrap();
    assert!(lua.pool.raw_eq(lua.pool.table_rawget(t, Value::Int(-5)), Value::Int(50)));
    assert!(lua
        .pool
        .raw_eq(lua.pool.table_rawget(t, Value::Int(1 << 40)), Value::Int(40)));
}

#[test]
fn float_keys_with_integer_value_normalize() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    lua.pool
        .table_rawset(t, Value::Float(2.0), Value::Int(22))
        .unwrap();
    assert!(lua.pool.raw_eq(lua.pool.table_rawget(t, Value::Int(2)), Value::Int(22)));
    lua.pool
        .table_rawset(t, Value::Int(3), Value::Int(33))
        .unwrap();
    assert!(lua
        .pool
        .raw_eq(lua.pool.table_rawget(t, Value::Float(3.0)), Value::Int(33)));
    // A fractional float key is its own key.
    lua.pool
        .table_rawset(t, Value::Float(2.5), Value::Int(25))
        .unwrap();
    assert!(lua
        .pool
        .raw_eq(lua.pool.table_rawget(t, Value::Float(2.5)), Value::Int(25)));
}

#[test]
fn nil_and_nan_keys_are_rejected() {
    assert_eq!(normalize_key(Value::Nil), Err(KeyError::NilKey));
    assert_eq!(normalize_key(Value::Float(f64::NAN)), Err(KeyError::NanKey));

    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    assert!(lua.pool.table_rawset(t, Value::Nil, Value::Int(1)).is_err());
    assert!(lua
        .pool
        .table_rawset(t, Value::Float(f64::NAN), Value::Int(1))
        .is_err());
    // Reads with bad keys are simply absent.
    assert!(lua.pool.table_rawget(t, Value::Nil).is_nil());
    assert!(lua.pool.table_rawget(t, Value::Float(f64::NAN)).is_nil());
}

#[test]
fn setting_nil_removes_the_key() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    let key = lua.create_string(b"gone");
    lua.pool.table_rawset(t, key, Value::Int(1)).unwrap();
    lua.pool.table_rawset(t, key, Value::Nil).unwrap();
    assert!(lua.pool.table_rawget(t, key).is_nil());

    lua.pool.table_rawset(t, Value::Int(4), Value::Int(4)).unwrap();
    lua.pool.table_rawset(t, Value::Int(4), Value::Nil).unwrap();
    assert!(lua.pool.table_rawget(t, Value::Int(4)).is_nil());
    // Removing an absent key is a no-op.
    lua.pool.table_rawset(t, Value::Int(9), Value::Nil).unwrap();
}

#[test]
fn length_returns_a_border() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    for i in 1..=5 {
        lua.pool.table_rawset(t, Value::Int(i), Value::Int(i)).unwrap();
    }
    assert_eq!(lua.pool.table_length(t), 5);

    // With a hole the result is any border.
    lua.pool.table_rawset(t, Value::Int(3), Value::Nil).unwrap();
    let n = lua.pool.table_length(t);
    let at = |i: i64| !lua.pool.table_rawget(t, Value::Int(i)).is_nil();
    assert!(n == 0 || at(n), "slot n must be non-empty, n = {}", n);
    assert!(!at(n + 1), "slot n+1 must be empty, n = {}", n);

    let empty = lua.new_table_raw(0, 0);
    assert_eq!(lua.pool.table_length(empty), 0);
}

#[test]
fn border_found_past_the_array_part() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(4, 0);
    for i in 1..=20 {
        lua.pool.table_rawset(t, Value::Int(i), Value::Int(i)).unwrap();
    }
    assert_eq!(lua.pool.table_length(t), 20);
}

#[test]
fn rehash_preserves_all_live_pairs() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    let mut keys = Vec::new();
    for i in 0..64 {
        let k = if i % 3 == 0 {
            Value::Int(i)
        } else if i % 3 == 1 {
            lua.create_string(format!("k{}", i).as_bytes())
        } else {
            Value::Float(i as f64 + 0.5)
        };
        keys.push(k);
        lua.pool.table_rawset(t, k, Value::Int(i)).unwrap();
    }
    for (i, &k) in keys.iter().enumerate() {
        assert!(
            lua.pool.raw_eq(lua.pool.table_rawget(t, k), Value::Int(i as i64)),
            "key {} lost its value",
            i
        );
    }
}

#[test]
fn rehash_migrates_dense_integer_keys_into_the_array() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    for i in 1..=32 {
        lua.pool.table_rawset(t, Value::Int(i), Value::Int(i * i)).unwrap();
    }
    let table = lua.pool.table(t);
    assert!(table.array.len() >= 16, "array part should have grown");
    for i in 1..=32 {
        assert!(lua
            .pool
            .raw_eq(lua.pool.table_rawget(t, Value::Int(i)), Value::Int(i * i)));
    }
}

#[test]
fn next_visits_every_pair_once() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    for i in 1..=4 {
        lua.pool.table_rawset(t, Value::Int(i), Value::Int(10 * i)).unwrap();
    }
    let ka = lua.create_string(b"a");
    let kb = lua.create_string(b"b");
    lua.pool.table_rawset(t, ka, Value::Int(100)).unwrap();
    lua.pool.table_rawset(t, kb, Value::Int(200)).unwrap();

    let mut seen = Vec::new();
    let mut key = None;
    while let Some((k, v)) = lua.pool.table_next(t, key).unwrap() {
        seen.push((k, v));
        key = Some(k);
    }
    assert_eq!(seen.len(), 6);
    // Array part first, ascending.
    for (i, (k, _)) in seen.iter().take(4).enumerate() {
        assert!(lua.pool.raw_eq(*k, Value::Int(i as i64 + 1)));
    }
}

#[test]
fn next_tolerates_value_updates_mid_traversal() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    for i in 1..=8 {
        lua.pool.table_rawset(t, Value::Int(i), Value::Int(i)).unwrap();
    }
    let mut key = None;
    let mut count = 0;
    while let Some((k, _)) = lua.pool.table_next(t, key).unwrap() {
        // Updating an existing key's value during traversal is allowed.
        lua.pool.table_rawset(t, k, Value::Int(0)).unwrap();
        key = Some(k);
        count += 1;
    }
    assert_eq!(count, 8);
}

#[test]
fn next_rejects_foreign_keys() {
    let mut lua = new_lua();
    let t = lua.new_table_raw(0, 0);
    lua.pool.table_rawset(t, Value::Int(1), Value::Int(1)).unwrap();
    assert!(lua.pool.table_next(t, Some(Value::Int(99))).is_err());
}

#[test]
fn fast_metamethod_cache_invalidated_by_string_writes() {
    let mut lua = new_lua();
    let mt = lua.new_table_raw(0, 0);
    // First miss populates the known-absent bit.
    assert!(lua.get_tm(mt, Tm::Index).is_nil());
    assert!(lua.pool.table(mt).flags & (1 << (Tm::Index as u8)) != 0);

    // Writing any string key clears the cache.
    let key = lua.create_string(b"__index");
    let handler = lua.create_table(0, 0);
    lua.pool.table_rawset(mt, key, handler).unwrap();
    assert_eq!(lua.pool.table(mt).flags, 0);
    assert!(!lua.get_tm(mt, Tm::Index).is_nil());
}

#[test]
fn index_set_through_newindex_table_chain() {
    let mut lua = new_lua();
    let backing = lua.new_table_raw(0, 0);
    let proxy = lua.new_table_raw(0, 0);
    let mt = lua.new_table_raw(0, 0);
    let key = lua.create_string(b"__newindex");
    lua.pool.table_rawset(mt, key, Value::Table(backing)).unwrap();
    lua.set_metatable_of(Value::Table(proxy), Some(mt)).unwrap();

    let field = lua.create_string(b"x");
    lua.index_set(Value::Table(proxy), field, Value::Int(5)).unwrap();
    // The write landed on the backing table, not the proxy.
    assert!(lua.pool.table_rawget(proxy, field).is_nil());
    assert!(lua.pool.raw_eq(lua.pool.table_rawget(backing, field), Value::Int(5)));

    // Existing keys bypass the metamethod.
    lua.pool.table_rawset(proxy, field, Value::Int(1)).unwrap();
    lua.index_set(Value::Table(proxy), field, Value::Int(2)).unwrap();
    assert!(lua.pool.raw_eq(lua.pool.table_rawget(proxy, field), Value::Int(2)));
}
