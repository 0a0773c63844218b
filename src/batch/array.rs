//! Array batcher: items accumulate in arrival order and flush as one slice.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{run_isolated, BatchError, BatcherConfig};

/// Consumes flushed batches, e.g. by bulk-inserting them.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync {
    /// Process one batch. An error retains the batch for the next trigger.
    async fn process(&self, batch: &[T]) -> anyhow::Result<()>;
}

/// Channel-fed batcher that preserves arrival order within each flush.
pub struct ArrayBatcher<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> ArrayBatcher<T> {
    /// Start the batcher worker.
    pub fn spawn(
        name: &'static str,
        config: BatcherConfig,
        processor: Arc<dyn BatchProcessor<T>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let worker = tokio::spawn(worker_loop(name, config, processor, rx));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue an item, blocking when the channel is at capacity.
    pub async fn push(&self, item: T) -> Result<(), BatchError> {
        let tx = self.tx.lock().clone().ok_or(BatchError::Closed)?;
        tx.send(item).await.map_err(|_| BatchError::Closed)
    }

    /// A cloneable sender feeding this batcher.
    pub fn sender(&self) -> Option<mpsc::Sender<T>> {
        self.tx.lock().clone()
    }

    /// Close the input and wait for the worker to drain its buffer.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("array batcher worker ended abnormally: {}", e);
            }
        }
    }
}

async fn worker_loop<T: Clone + Send + Sync + 'static>(
    name: &'static str,
    config: BatcherConfig,
    processor: Arc<dyn BatchProcessor<T>>,
    mut rx: mpsc::Receiver<T>,
) {
    let mut buf: Vec<T> = Vec::new();
    loop {
        let flush_now = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    buf.push(item);
                    buf.len() >= config.trigger_size
                }
                None => {
                    if !buf.is_empty() {
                        flush(name, &config, &processor, &mut buf).await;
                    }
                    break;
                }
            },
            _ = tokio::time::sleep(config.flush_delay), if !buf.is_empty() => true,
        };
        if flush_now && !buf.is_empty() {
            flush(name, &config, &processor, &mut buf).await;
        }
    }
}

async fn flush<T: Clone + Send + Sync + 'static>(
    name: &str,
    config: &BatcherConfig,
    processor: &Arc<dyn BatchProcessor<T>>,
    buf: &mut Vec<T>,
) {
    let items = Arc::new(std::mem::take(buf));
    let task_processor = processor.clone();
    let task_items = items.clone();
    let flushed =
        run_isolated(name, async move { task_processor.process(&task_items[..]).await }).await;
    if !flushed {
        // Retain for the next trigger; the hard cap bounds growth.
        *buf = Arc::try_unwrap(items).unwrap_or_else(|shared| (*shared).clone());
        if buf.len() > config.max_size {
            log::error!(
                "batcher '{}': dropping {} items over the max batch size",
                name,
                buf.len()
            );
            buf.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Collector {
        flushed: Mutex<Vec<i32>>,
        batches: AtomicUsize,
        fail_first: AtomicUsize,
        panic_first: AtomicUsize,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                flushed: Mutex::new(Vec::new()),
                batches: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                panic_first: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BatchProcessor<i32> for Collector {
        async fn process(&self, batch: &[i32]) -> anyhow::Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("induced failure");
            }
            if self.panic_first.load(Ordering::SeqCst) > 0 {
                self.panic_first.fetch_sub(1, Ordering::SeqCst);
                panic!("induced panic");
            }
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.flushed.lock().extend_from_slice(batch);
            Ok(())
        }
    }

    fn config(trigger: usize, delay_ms: u64) -> BatcherConfig {
        BatcherConfig {
            trigger_size: trigger,
            flush_delay: Duration::from_millis(delay_ms),
            max_size: 100,
            channel_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_flush_on_trigger_size() {
        let collector = Collector::new();
        let batcher = ArrayBatcher::spawn("test", config(3, 10_000), collector.clone());

        for i in 0..3 {
            batcher.push(i).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*collector.flushed.lock(), vec![0, 1, 2]);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_on_inactivity() {
        let collector = Collector::new();
        let batcher = ArrayBatcher::spawn("test", config(100, 30), collector.clone());

        batcher.push(7).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(*collector.flushed.lock(), vec![7]);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_drain_on_shutdown() {
        let collector = Collector::new();
        let batcher = ArrayBatcher::spawn("test", config(100, 10_000), collector.clone());

        batcher.push(1).await.unwrap();
        batcher.push(2).await.unwrap();
        batcher.shutdown().await;

        assert_eq!(*collector.flushed.lock(), vec![1, 2]);
        assert!(matches!(batcher.push(3).await, Err(BatchError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_flush_retries_without_duplicates() {
        let collector = Collector::new();
        collector.fail_first.store(1, Ordering::SeqCst);
        let batcher = ArrayBatcher::spawn("test", config(2, 20), collector.clone());

        batcher.push(1).await.unwrap();
        batcher.push(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        // One failed attempt, then the retained batch flushed exactly once.
        assert_eq!(*collector.flushed.lock(), vec![1, 2]);
        assert_eq!(collector.batches.load(Ordering::SeqCst), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let collector = Collector::new();
        collector.panic_first.store(1, Ordering::SeqCst);
        let batcher = ArrayBatcher::spawn("test", config(2, 20), collector.clone());

        batcher.push(1).await.unwrap();
        batcher.push(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        // The pipeline survived the panic and still delivered the batch.
        assert_eq!(*collector.flushed.lock(), vec![1, 2]);
        batcher.push(3).await.unwrap();
        batcher.shutdown().await;
        assert_eq!(*collector.flushed.lock(), vec![1, 2, 3]);
    }
}
