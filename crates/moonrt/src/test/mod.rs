// Test support: a hand-assembly builder for Protos and a tiny host library
// (print with captured output, pcall, error, setmetatable, coroutine ops)
// registered through the public API, standing in for the out-of-scope
// compiler and standard libraries.

mod support;

mod test_coroutine;
mod test_scenarios;
mod test_table;

pub(crate) use support::*;
