use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Serialized single-consumer work queue. Everything enqueued runs in FIFO
/// order on one task, so user callbacks for a connection never overlap.
pub(crate) struct Processor {
    tx: mpsc::UnboundedSender<Job>,
}

impl Processor {
    pub(crate) fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Processor { tx }
    }

    /// Enqueues work; returns immediately. Jobs submitted after the
    /// processor is dropped are discarded.
    pub(crate) fn enqueue(&self, job: impl Future<Output = ()> + Send + 'static) {
        let _ = self.tx.send(Box::pin(job));
    }
}

#[cfg(test)]
mod processor_test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order() {
        let processor = Processor::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel(1);

        for i in 0..100usize {
            let order = Arc::clone(&order);
            let done_tx = done_tx.clone();
            processor.enqueue(async move {
                if let Ok(mut order) = order.lock() {
                    order.push(i);
                    if i == 99 {
                        let _ = done_tx.try_send(());
                    }
                }
            });
        }

        done_rx.recv().await.expect("all jobs ran");
        let order = order.lock().unwrap().clone();
        assert_eq!(order, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_serialized_even_with_awaits() {
        let processor = Processor::new();
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel(1);

        for i in 0..10usize {
            let running = Arc::clone(&running);
            let overlapped = Arc::clone(&overlapped);
            let done_tx = done_tx.clone();
            processor.enqueue(async move {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                if i == 9 {
                    let _ = done_tx.try_send(());
                }
            });
        }

        done_rx.recv().await.expect("all jobs ran");
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }
}
