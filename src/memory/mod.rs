//! Shared memory segments.
//!
//! This module owns every OS-level shared memory object the engine creates:
//! - [`SharedArray`]: typed view over a named segment, released exactly once
//! - [`SharedBufferManager`]: memory-checked allocation and a live registry

pub mod manager;
pub mod shared;

pub use manager::{SharedBufferManager, MAX_SEGMENT_NAME_LEN, SEGMENT_PREFIX};
pub use shared::{Ownership, SegmentHandle, SharedArray};
