//! CLI command implementations.

pub mod check_valgrind;
pub mod run;
