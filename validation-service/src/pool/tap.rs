//! TAP device pool (§4.2, §5 "Shared resources"). A fixed-size free set
//! of host-side device names, pre-created by the network provisioner
//! (§6 "Host preconditions") and only checked out/returned here — the
//! pool never creates or destroys a device.

use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum TapPoolError {
    #[error("TAP pool exhausted")]
    Exhausted,
}

pub struct TapPool {
    free: Mutex<VecDeque<String>>,
    total: usize,
}

/// RAII handle: returning the device is exactly-once, performed by
/// `Drop` so every exit path (success, error, panic) releases it back
/// to the pool, matching the data-model invariant "returning it is
/// exactly-once on every exit path".
pub struct TapHandle {
    device: Option<String>,
    pool: std::sync::Weak<TapPool>,
}

impl TapHandle {
    pub fn device(&self) -> &str {
        self.device.as_deref().expect("device taken only by Drop")
    }
}

impl Drop for TapHandle {
    fn drop(&mut self) {
        if let (Some(device), Some(pool)) = (self.device.take(), self.pool.upgrade()) {
            pool.free.lock().unwrap().push_back(device);
        }
    }
}

impl TapPool {
    /// Builds a pool from a prefix and count, e.g. `tap-val0..tap-val3`
    /// for `prefix="tap-val"`, `count=4`. Fails to start (per §4.2,
    /// "refuses to start if fewer than W TAPs are available") by
    /// returning `None` when `count == 0`.
    pub fn new(prefix: &str, count: usize) -> Option<std::sync::Arc<Self>> {
        if count == 0 {
            return None;
        }
        let free = (0..count).map(|i| format!("{prefix}{i}")).collect();
        Some(std::sync::Arc::new(Self {
            free: Mutex::new(free),
            total: count,
        }))
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn checkout(self: &std::sync::Arc<Self>) -> Result<TapHandle, TapPoolError> {
        let mut free = self.free.lock().unwrap();
        let device = free.pop_front().ok_or(TapPoolError::Exhausted)?;
        Ok(TapHandle {
            device: Some(device),
            pool: std::sync::Arc::downgrade(self),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_reduces_available_and_drop_returns_it() {
        let pool = TapPool::new("tap-val", 2).unwrap();
        assert_eq!(pool.available(), 2);
        {
            let handle = pool.checkout().unwrap();
            assert_eq!(pool.available(), 1);
            assert!(handle.device().starts_with("tap-val"));
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn exhausted_pool_refuses_further_checkout() {
        let pool = TapPool::new("tap-val", 1).unwrap();
        let _first = pool.checkout().unwrap();
        assert!(matches!(pool.checkout(), Err(TapPoolError::Exhausted)));
    }

    #[test]
    fn zero_capacity_pool_fails_to_start() {
        assert!(TapPool::new("tap-val", 0).is_none());
    }
}
