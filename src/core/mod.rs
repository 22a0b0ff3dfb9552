//! Core types for the stackpar engine.
//!
//! This module contains the foundational pieces every other module builds on:
//! - Stack and plane shapes, and the [`ImageStack`] array itself
//! - Size estimation for allocation feasibility checks
//! - Host facts and the injected free-memory probe
//! - Configuration and error types

pub mod config;
pub mod error;
pub mod host;
pub mod size;
pub mod stack;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{StackError, StackResult};
pub use host::{FixedMemory, HostInfo, MemoryProbe, SystemMemory};
pub use size::{fits_in_memory, full_size_kb, required_bytes};
pub use stack::{ImageStack, PlaneShape, StackShape};
