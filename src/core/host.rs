//! Host facts consumed by the engine.
//!
//! Nothing in the engine queries the operating system directly: free memory
//! comes through a [`MemoryProbe`] and the core count through [`HostInfo`],
//! both handed in by whoever builds the engine. Tests substitute
//! [`FixedMemory`] to simulate memory pressure.

use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of "bytes of free system memory".
pub trait MemoryProbe: Send + Sync {
    /// Bytes currently available for new allocations.
    fn free_bytes(&self) -> u64;
}

/// A probe reporting a fixed (but adjustable) amount of free memory.
#[derive(Debug)]
pub struct FixedMemory {
    bytes: AtomicU64,
}

impl FixedMemory {
    /// Report `bytes` free until changed.
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    /// A probe that never limits allocation.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    /// Change the reported amount.
    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemory {
    fn free_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Reads `MemAvailable` from `/proc/meminfo`.
///
/// Where that file does not exist the probe cannot say anything useful and
/// reports `u64::MAX`, leaving the OS to refuse oversized segments itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl SystemMemory {
    fn read_meminfo() -> Option<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_mem_available(&meminfo)
    }
}

impl MemoryProbe for SystemMemory {
    fn free_bytes(&self) -> u64 {
        match Self::read_meminfo() {
            Some(bytes) => bytes,
            None => {
                warn!("Could not read MemAvailable from /proc/meminfo; not limiting shared allocations");
                u64::MAX
            }
        }
    }
}

/// Extract `MemAvailable` (reported in kB) as bytes.
fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Facts about the machine, determined once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    /// Number of logical cores available to this process.
    pub logical_cores: usize,
}

impl HostInfo {
    /// Query the current machine.
    pub fn detect() -> Self {
        let logical_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { logical_cores }
    }

    /// Host description with a fixed core count.
    pub fn with_cores(logical_cores: usize) -> Self {
        Self {
            logical_cores: logical_cores.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mem_available() {
        let meminfo = "MemTotal:       16314428 kB\nMemFree:         1096636 kB\nMemAvailable:    9861388 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(9_861_388 * 1024));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_fixed_memory() {
        let probe = FixedMemory::new(0);
        assert_eq!(probe.free_bytes(), 0);
        probe.set(4096);
        assert_eq!(probe.free_bytes(), 4096);
    }

    #[test]
    fn test_host_info() {
        assert!(HostInfo::detect().logical_cores >= 1);
        assert_eq!(HostInfo::with_cores(0).logical_cores, 1);
    }
}
