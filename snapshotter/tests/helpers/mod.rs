// Shared helpers for integration tests. Each test binary uses a subset.
#![allow(dead_code)]

pub mod daemon_guard;
pub mod fake_table;
pub mod polling;
