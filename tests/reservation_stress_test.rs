#[cfg(test)]
mod tests {
    use cdk_load::state::ReservationManager;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserve_release_pairs() -> anyhow::Result<()> {
        const CAPACITY: u64 = 1_000;
        const TASKS: usize = 100;
        const PAIRS_PER_TASK: usize = 1_000;

        let manager = ReservationManager::new(CAPACITY);
        let in_use = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let handles = (0..TASKS).map(|_| {
            let manager = manager.clone();
            let in_use = in_use.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                for _ in 0..PAIRS_PER_TASK {
                    let reservation = manager.reserve(10, "stress").await?;
                    let now = in_use.fetch_add(10, Ordering::SeqCst) + 10;
                    peak.fetch_max(now, Ordering::SeqCst);
                    in_use.fetch_sub(10, Ordering::SeqCst);
                    reservation.release()?;
                }
                Ok::<_, cdk_load::CdkError>(())
            })
        });

        let results = tokio::time::timeout(Duration::from_secs(60), join_all(handles)).await?;
        for result in results {
            result??;
        }

        assert_eq!(manager.remaining_capacity_bytes(), CAPACITY);
        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_contended_large_reservations_all_complete() -> anyhow::Result<()> {
        let manager = ReservationManager::new(100);

        let handles = (1..=50u64).map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let reservation = manager.reserve(i * 2, "contended").await?;
                tokio::time::sleep(Duration::from_millis(1)).await;
                drop(reservation);
                Ok::<_, cdk_load::CdkError>(())
            })
        });

        let results = tokio::time::timeout(Duration::from_secs(30), join_all(handles)).await?;
        for result in results {
            result??;
        }
        assert_eq!(manager.remaining_capacity_bytes(), 100);
        Ok(())
    }
}
