//! Map batcher: items accumulate as a key → multiplicity map.
//!
//! Built for the "which session IDs changed in this interval?" pattern,
//! where only the set of touched keys matters and arrival order does not.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{run_isolated, BatchError, BatcherConfig};

/// Consumes flushed multiplicity maps.
#[async_trait]
pub trait MapBatchProcessor<T>: Send + Sync {
    /// Process one batch. An error retains the batch for the next trigger.
    async fn process(&self, batch: &HashMap<T, u64>) -> anyhow::Result<()>;
}

/// Channel-fed batcher that deduplicates items into a multiplicity map.
pub struct MapBatcher<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> MapBatcher<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Start the batcher worker.
    pub fn spawn(
        name: &'static str,
        config: BatcherConfig,
        processor: Arc<dyn MapBatchProcessor<T>>,
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
                log::error!("map batcher worker ended abnormally: {}", e);
            }
        }
    }
}

async fn worker_loop<T>(
    name: &'static str,
    config: BatcherConfig,
    processor: Arc<dyn MapBatchProcessor<T>>,
    mut rx: mpsc::Receiver<T>,
) where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    let mut buf: HashMap<T, u64> = HashMap::new();
    loop {
        let flush_now = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    *buf.entry(item).or_default() += 1;
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

async fn flush<T>(
    name: &str,
    config: &BatcherConfig,
    processor: &Arc<dyn MapBatchProcessor<T>>,
    buf: &mut HashMap<T, u64>,
) where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    let items = Arc::new(std::mem::take(buf));
    let task_processor = processor.clone();
    let task_items = items.clone();
    let flushed =
        run_isolated(name, async move { task_processor.process(&*task_items).await }).await;
    if !flushed {
        let retained = Arc::try_unwrap(items).unwrap_or_else(|shared| (*shared).clone());
        for (key, count) in retained {
            *buf.entry(key).or_default() += count;
        }
        if buf.len() > config.max_size {
            log::error!(
                "batcher '{}': dropping {} keys over the max batch size",
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
    use std::time::Duration;

    struct Collector {
        flushed: Mutex<Vec<HashMap<String, u64>>>,
    }

    #[async_trait]
    impl MapBatchProcessor<String> for Collector {
        async fn process(&self, batch: &HashMap<String, u64>) -> anyhow::Result<()> {
            self.flushed.lock().push(batch.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_multiplicity_counting() {
        let collector = Arc::new(Collector {
            flushed: Mutex::new(Vec::new()),
        });
        let batcher = MapBatcher::spawn(
            "test",
            BatcherConfig {
                trigger_size: 2,
                flush_delay: Duration::from_secs(10),
                max_size: 100,
                channel_capacity: 16,
            },
            collector.clone(),
        );

        batcher.push("a".to_string()).await.unwrap();
        batcher.push("a".to_string()).await.unwrap();
        batcher.push("a".to_string()).await.unwrap();
        batcher.push("b".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let flushed = collector.flushed.lock();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].get("a"), Some(&3));
        assert_eq!(flushed[0].get("b"), Some(&1));
        drop(flushed);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_drain_on_shutdown() {
        let collector = Arc::new(Collector {
            flushed: Mutex::new(Vec::new()),
        });
        let batcher = MapBatcher::spawn(
            "test",
            BatcherConfig {
                trigger_size: 100,
                flush_delay: Duration::from_secs(10),
                max_size: 100,
                channel_capacity: 16,
            },
            collector.clone(),
        );

        batcher.push("x".to_string()).await.unwrap();
        batcher.shutdown().await;

        assert_eq!(collector.flushed.lock().len(), 1);
    }
}
