//! Device-backed test harness for the Arclight GPU layer.
//!
//! Scenario tests that need real hardware are marked
//! `#[ignore = "Requires GPU hardware"]`; run them with
//! `cargo test -p arclight-test -- --ignored` on a machine with a GPU.

pub mod harness;

pub use harness::TransferHarness;

use arclight_gpu::GpuError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Data mismatch: {0}")]
    Mismatch(String),
}

pub type Result<T> = std::result::Result<T, TestError>;
