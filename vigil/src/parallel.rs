//! Bounded concurrent fan-out for per-item model calls.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Runs `f` over every item with at most `limit` futures in flight.
/// Results come back in input order; each item's outcome is independent,
/// so one failure never cancels its siblings.
pub async fn map_bounded<T, F, Fut, O>(items: Vec<T>, limit: usize, f: F) -> Vec<O>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = O>,
{
    stream::iter(items.into_iter().map(f))
        .buffered(limit.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_input_order() {
        let out = map_bounded(vec![3u64, 1, 2], 2, |n| async move {
            tokio::time::sleep(Duration::from_millis(n * 5)).await;
            n * 10
        })
        .await;
        assert_eq!(out, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn honors_concurrency_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<u32> = (0..20).collect();
        map_bounded(items, 3, |_| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn failures_do_not_cancel_siblings() {
        let out: Vec<Result<u32, String>> = map_bounded(vec![1u32, 2, 3], 2, |n| async move {
            if n == 2 {
                Err("boom".to_string())
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(out[0], Ok(1));
        assert!(out[1].is_err());
        assert_eq!(out[2], Ok(3));
    }
}
