//! Allocation of shared memory arrays.

use crate::core::error::{StackError, StackResult};
use crate::core::host::MemoryProbe;
use crate::core::size;
use crate::core::stack::{ImageStack, StackShape};
use crate::memory::shared::{Segment, SharedArray};
use bytemuck::Pod;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Prefix of every segment name created by this crate.
pub const SEGMENT_PREFIX: &str = "/stackpar-";

/// Longest segment name accepted by every supported platform (macOS
/// `PSHMNAMLEN`), leading slash included.
pub const MAX_SEGMENT_NAME_LEN: usize = 31;

/// Names of the segments a manager has created and not yet released.
#[derive(Debug, Default)]
pub(crate) struct SegmentRegistry {
    live: Mutex<HashSet<String>>,
}

impl SegmentRegistry {
    fn insert(&self, name: String) {
        self.live.lock().insert(name);
    }

    pub(crate) fn remove(&self, name: &str) {
        self.live.lock().remove(name);
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.live.lock().iter().cloned().collect();
        names.sort();
        names
    }

    fn len(&self) -> usize {
        self.live.lock().len()
    }
}

/// Creates [`SharedArray`]s after checking that they fit into free memory.
///
/// The manager keeps a registry of the segments it handed out so callers can
/// verify that nothing outlived a dispatch.
pub struct SharedBufferManager {
    probe: Arc<dyn MemoryProbe>,
    registry: Arc<SegmentRegistry>,
}

/// A fresh segment name: the prefix plus 64 random bits in hex.
fn segment_name() -> String {
    format!("{}{:016x}", SEGMENT_PREFIX, Uuid::new_v4().as_u128() as u64)
}

impl SharedBufferManager {
    /// Create a manager that consults `probe` before every allocation.
    pub fn new(probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            probe,
            registry: Arc::new(SegmentRegistry::default()),
        }
    }

    /// Allocate a zeroed shared array large enough for `shape`.
    ///
    /// Fails with [`StackError::OutOfMemory`] before touching the OS when the
    /// array would not fit into the memory reported free by the probe.
    pub fn allocate<T: Pod>(&self, shape: &[usize]) -> StackResult<SharedArray<T>> {
        let elem = std::mem::size_of::<T>();
        let required = size::required_bytes(shape, elem)?;
        let available = self.probe.free_bytes();
        if !size::fits_in_memory(shape, elem, available)? {
            return Err(StackError::OutOfMemory { required, available });
        }

        let byte_len = usize::try_from(required).map_err(|_| StackError::OutOfMemory {
            required,
            available: usize::MAX as u64,
        })?;
        let len = byte_len / elem;

        let name = segment_name();
        info!(
            "Requested shared array with shape={:?}, size={} KB, element size={}",
            shape,
            size::full_size_kb(shape, elem)?,
            elem
        );

        let segment = Segment::create(&name, byte_len)?;
        self.registry.insert(name.clone());
        debug!("Created shared segment {} ({} bytes)", name, byte_len);

        Ok(SharedArray::owned(segment, name, len, Arc::clone(&self.registry)))
    }

    /// Allocate a zeroed, shared-memory-backed stack.
    pub fn allocate_stack(&self, shape: StackShape) -> StackResult<ImageStack> {
        let array = self.allocate::<f32>(&shape.dims())?;
        ImageStack::from_shared(shape, array)
    }

    /// Release `array`. Equivalent to [`SharedArray::release`], provided for
    /// symmetry with [`allocate`](Self::allocate).
    pub fn release<T: Pod>(&self, array: &mut SharedArray<T>) {
        array.release();
    }

    /// Names of segments allocated here and not yet released.
    pub fn live_segments(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Number of segments allocated here and not yet released.
    pub fn live_count(&self) -> usize {
        self.registry.len()
    }

    /// Free memory as currently reported by the probe.
    pub fn free_bytes(&self) -> u64 {
        self.probe.free_bytes()
    }
}

impl std::fmt::Debug for SharedBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferManager")
            .field("live", &self.registry.len())
            .finish()
    }
}
