use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinSet;

/// Runs `work(i)` for every `i` in `0..pieces` on at most `parallelism`
/// concurrent workers and waits for all of them.
pub async fn parallelize_until<F>(parallelism: usize, pieces: usize, work: F)
where
    F: Fn(usize) + Send + Sync + 'static,
{
    if pieces == 0 {
        return;
    }

    let work = Arc::new(work);
    let next = Arc::new(AtomicUsize::new(0));
    let mut workers = JoinSet::new();

    for _ in 0..parallelism.clamp(1, pieces) {
        let work = work.clone();
        let next = next.clone();
        workers.spawn(async move {
            loop {
                let piece = next.fetch_add(1, Ordering::Relaxed);
                if piece >= pieces {
                    break;
                }
                work(piece);
            }
        });
    }

    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!("scheduling worker failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn every_piece_runs_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        parallelize_until(3, 20, move |i| sink.lock().unwrap().push(i)).await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn zero_pieces_is_a_no_op() {
        parallelize_until(4, 0, |_| panic!("no piece should run")).await;
    }

    #[tokio::test]
    async fn zero_parallelism_still_makes_progress() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        parallelize_until(0, 5, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
