//! Tier-0 scenarios.
//!
//! - `monitor` - open and close a controller monitor over D-Bus
//! - `agent` - agent unit lifecycle seen from both sides
//! - `valgrind` - the same cluster under valgrind, logs verified on collection

pub mod agent;
pub mod monitor;
#[cfg(test)]
mod valgrind;
