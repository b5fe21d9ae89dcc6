// lib.rs
//
// Library root. The binary in main.rs and the integration tests and
// benchmarks all go through these modules.

pub mod backend;
pub mod build;
pub mod config;
pub mod disk_cache;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod loader;
pub mod overlay;
pub mod parser_pool;
pub mod perf;
pub mod revalidation;
pub mod state;
pub mod toolchain;
pub mod unit;
pub mod unit_cache;
pub mod utf16;
pub mod warmup;
pub mod workspace_index;

// test_utils is available in test builds and when the `test-support` feature is enabled.
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
