//! Byte-budget backpressure.
//!
//! Writers reserve bytes before buffering data and release them once the
//! data is gone. `reserve` suspends until the budget allows the request.
//! Waiters are not served FIFO: on every release each waiter re-checks, and
//! any request that now fits is granted.

use crate::error::{CdkError, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

pub struct ReservationManager {
    total_capacity_bytes: u64,
    remaining: Mutex<u64>,
    released: Notify,
}

impl ReservationManager {
    pub fn new(total_capacity_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            total_capacity_bytes,
            remaining: Mutex::new(total_capacity_bytes),
            released: Notify::new(),
        })
    }

    fn remaining(&self) -> MutexGuard<'_, u64> {
        self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total_capacity_bytes(&self) -> u64 {
        self.total_capacity_bytes
    }

    /// Snapshot of unreserved bytes. May be stale by the time it is read.
    pub fn remaining_capacity_bytes(&self) -> u64 {
        *self.remaining()
    }

    /// Wait until `bytes` are available, then take them.
    ///
    /// Fails immediately if `bytes` exceeds the total capacity, since such a
    /// request could never be granted.
    pub async fn reserve(self: &Arc<Self>, bytes: u64, reserver: &str) -> Result<Reservation> {
        self.check_capacity(bytes)?;

        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reservation) = self.try_take(bytes) {
                tracing::trace!("{} reserved {} bytes", reserver, bytes);
                return Ok(reservation);
            }

            tracing::debug!(
                "{} waiting for {} bytes ({} of {} remaining)",
                reserver,
                bytes,
                self.remaining_capacity_bytes(),
                self.total_capacity_bytes
            );
            notified.await;
        }
    }

    /// Take `bytes` if they are available right now.
    pub fn try_reserve(self: &Arc<Self>, bytes: u64) -> Result<Option<Reservation>> {
        self.check_capacity(bytes)?;
        Ok(self.try_take(bytes))
    }

    fn check_capacity(&self, bytes: u64) -> Result<()> {
        if bytes > self.total_capacity_bytes {
            return Err(CdkError::CapacityExceeded {
                requested: bytes,
                capacity: self.total_capacity_bytes,
            });
        }
        Ok(())
    }

    fn try_take(self: &Arc<Self>, bytes: u64) -> Option<Reservation> {
        let mut remaining = self.remaining();
        if *remaining < bytes {
            return None;
        }
        *remaining -= bytes;
        Some(Reservation {
            bytes,
            manager: Some(Arc::clone(self)),
        })
    }

    /// Return `bytes` to the pool and wake every waiter to re-check.
    pub fn release(&self, bytes: u64) -> Result<()> {
        {
            let mut remaining = self.remaining();
            let restored = remaining
                .checked_add(bytes)
                .filter(|restored| *restored <= self.total_capacity_bytes)
                .ok_or(CdkError::ReleaseOverflow {
                    released: bytes,
                    remaining: *remaining,
                    capacity: self.total_capacity_bytes,
                })?;
            *remaining = restored;
        }
        self.released.notify_waiters();
        Ok(())
    }
}

impl fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationManager")
            .field("total_capacity_bytes", &self.total_capacity_bytes)
            .field("remaining_capacity_bytes", &self.remaining_capacity_bytes())
            .finish()
    }
}

/// Bytes held against a [`ReservationManager`]. Released exactly once:
/// explicitly through [`Reservation::release`], or on drop.
#[must_use = "dropping a reservation releases it immediately"]
pub struct Reservation {
    bytes: u64,
    manager: Option<Arc<ReservationManager>>,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn release(mut self) -> Result<()> {
        match self.manager.take() {
            Some(manager) => manager.release(self.bytes),
            None => Ok(()),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            if let Err(e) = manager.release(self.bytes) {
                tracing::error!("Failed to release reservation on drop: {}", e);
            }
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("bytes", &self.bytes)
            .field("released", &self.manager.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reserve_and_release() {
        let manager = ReservationManager::new(1000);

        let reservation = manager.reserve(900, "test").await.unwrap();
        assert_eq!(reservation.bytes(), 900);
        assert_eq!(manager.remaining_capacity_bytes(), 100);

        reservation.release().unwrap();
        assert_eq!(manager.remaining_capacity_bytes(), 1000);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let manager = ReservationManager::new(1000);
        {
            let _reservation = manager.reserve(400, "test").await.unwrap();
            assert_eq!(manager.remaining_capacity_bytes(), 600);
        }
        assert_eq!(manager.remaining_capacity_bytes(), 1000);
    }

    #[tokio::test]
    async fn test_blocks_until_enough_released() {
        let manager = ReservationManager::new(1000);
        let held = manager.reserve(900, "held").await.unwrap();
        std::mem::forget(held);
        assert_eq!(manager.remaining_capacity_bytes(), 100);

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reserve(200, "waiter").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // 150 available: still not enough
        manager.release(50).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // 250 available
        manager.release(100).unwrap();
        let reservation = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should be granted")
            .unwrap()
            .unwrap();
        assert_eq!(reservation.bytes(), 200);
        assert_eq!(manager.remaining_capacity_bytes(), 50);
    }

    #[tokio::test]
    async fn test_reserve_more_than_capacity_fails_immediately() {
        let manager = ReservationManager::new(1000);
        let held = manager.reserve(1000, "held").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), manager.reserve(1001, "big"))
            .await
            .expect("must not block");
        assert!(matches!(
            result,
            Err(CdkError::CapacityExceeded {
                requested: 1001,
                capacity: 1000
            })
        ));
        drop(held);
    }

    #[tokio::test]
    async fn test_smaller_waiter_granted_ahead_of_larger() {
        let manager = ReservationManager::new(100);
        let held = manager.reserve(100, "held").await.unwrap();
        std::mem::forget(held);

        let large = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reserve(80, "large").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let small = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.reserve(30, "small").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Only the later, smaller request fits
        manager.release(40).unwrap();
        let small = tokio::time::timeout(Duration::from_secs(5), small)
            .await
            .expect("small waiter should be granted")
            .unwrap()
            .unwrap();
        assert!(!large.is_finished());
        assert_eq!(manager.remaining_capacity_bytes(), 10);

        manager.release(60).unwrap();
        drop(small);
        let large = tokio::time::timeout(Duration::from_secs(5), large)
            .await
            .expect("large waiter should be granted")
            .unwrap()
            .unwrap();
        assert_eq!(manager.remaining_capacity_bytes(), 20);
        drop(large);
        assert_eq!(manager.remaining_capacity_bytes(), 100);
    }

    #[test]
    fn test_try_reserve() {
        let manager = ReservationManager::new(10);
        let first = manager.try_reserve(8).unwrap().unwrap();
        assert!(manager.try_reserve(3).unwrap().is_none());
        assert!(manager.try_reserve(11).is_err());
        first.release().unwrap();
        assert!(manager.try_reserve(3).unwrap().is_some());
    }

    #[test]
    fn test_release_beyond_capacity_fails() {
        let manager = ReservationManager::new(10);
        assert!(matches!(
            manager.release(1),
            Err(CdkError::ReleaseOverflow { .. })
        ));
        assert_eq!(manager.remaining_capacity_bytes(), 10);
    }
}
