//! Ephemeral UDP port allocation

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Hands out UDP ports from a fixed inclusive range
///
/// Cloning shares the same pool.
#[derive(Clone)]
pub struct PortAllocator {
    inner: Arc<Mutex<PortPool>>,
}

struct PortPool {
    min: u16,
    max: u16,
    in_use: BTreeSet<u16>,
    /// Next port to try, so freed ports are not reused immediately
    cursor: u16,
}

impl PortAllocator {
    /// Create an allocator over `min..=max`
    pub fn new(min: u16, max: u16) -> Result<Self> {
        if min == 0 || min > max {
            return Err(Error::InvalidConfig(format!(
                "invalid UDP port range {}-{}",
                min, max
            )));
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(PortPool {
                min,
                max,
                in_use: BTreeSet::new(),
                cursor: min,
            })),
        })
    }

    /// Reserve a free port
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when every port in the range is leased.
    pub fn allocate(&self) -> Result<PortLease> {
        let mut pool = self.inner.lock();
        let span = u32::from(pool.max - pool.min) + 1;

        for offset in 0..span {
            let candidate = pool.min + ((u32::from(pool.cursor - pool.min) + offset) % span) as u16;
            if pool.in_use.insert(candidate) {
                pool.cursor = if candidate == pool.max {
                    pool.min
                } else {
                    candidate + 1
                };
                debug!(port = candidate, "Leased UDP port");
                return Ok(PortLease {
                    port: candidate,
                    pool: Arc::clone(&self.inner),
                });
            }
        }

        Err(Error::ResourceExhausted(format!(
            "no free UDP port in {}-{}",
            pool.min, pool.max
        )))
    }

    /// Number of ports currently leased
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use.len()
    }

    /// Number of ports still available
    pub fn available(&self) -> usize {
        let pool = self.inner.lock();
        (usize::from(pool.max - pool.min) + 1) - pool.in_use.len()
    }
}

impl fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = self.inner.lock();
        f.debug_struct("PortAllocator")
            .field("min", &pool.min)
            .field("max", &pool.max)
            .field("in_use", &pool.in_use.len())
            .finish()
    }
}

/// A leased UDP port, returned to the pool when dropped
pub struct PortLease {
    port: u16,
    pool: Arc<Mutex<PortPool>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.lock().in_use.remove(&self.port);
        debug!(port = self.port, "Released UDP port");
    }
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortLease").field(&self.port).finish()
    }
}
