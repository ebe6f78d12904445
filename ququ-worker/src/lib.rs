//! ququ FunASR worker library
//!
//! This module re-exports the worker's modules for the binary and for
//! integration testing.

pub mod config;
pub mod ipc;
pub mod lifecycle;
pub mod pipeline;
pub mod protocol;
pub mod reclaim;
pub mod shutdown;
pub mod state;
pub mod version;

pub use ipc::Worker;
