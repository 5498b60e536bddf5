//! Device-parallel map over batch shards
//!
//! Each "device" is a rayon task working on its own shard with its own graph.
//! Results come back in device order so they can be averaged like a `pmean`.

use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DeviceError {
    #[error("At least one device is required")]
    NoDevices,
    #[error("Expected one shard per device ({devices}), got {shards}")]
    ShardCountMismatch { devices: usize, shards: usize },
}

/// The set of devices a step is replicated across
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Devices {
    count: usize,
}

impl Devices {
    pub fn new(count: usize) -> Result<Self, DeviceError> {
        if count == 0 {
            return Err(DeviceError::NoDevices);
        }
        Ok(Self { count })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Runs `f(device_index, shard)` for every shard in parallel
    pub fn pmap<I, T, F>(&self, shards: Vec<I>, f: F) -> Result<Vec<T>, DeviceError>
    where
        I: Send,
        T: Send,
        F: Fn(usize, I) -> T + Sync,
    {
        if shards.len() != self.count {
            return Err(DeviceError::ShardCountMismatch {
                devices: self.count,
                shards: shards.len(),
            });
        }
        Ok(shards
            .into_par_iter()
            .enumerate()
            .map(|(device, shard)| f(device, shard))
            .collect())
    }
}
