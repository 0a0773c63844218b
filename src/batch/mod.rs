//! # Batching Pipelines
//!
//! Generic channel-to-chunk processors that coalesce high-frequency events
//! into chunked writes:
//! - [`ArrayBatcher`]: buffers items in arrival order
//! - [`MapBatcher`]: buffers items as a multiplicity map
//!
//! Flush triggers are shared by both shapes: buffer reached the trigger
//! size, the inactivity timer fired with a non-empty buffer, or the input
//! channel closed. A failed flush retains the buffer for the next trigger;
//! a buffer past the hard maximum is dropped with an error log. Processor
//! callbacks run under panic isolation so one bad batch cannot kill the
//! pipeline task.
//!
//! Input channels are bounded; a full channel blocks the sender, which is
//! the intended backpressure under overload.

use std::time::Duration;

use thiserror::Error;

pub mod array;
pub mod map;

pub use array::{ArrayBatcher, BatchProcessor};
pub use map::{MapBatchProcessor, MapBatcher};

/// Batcher errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    /// The processor callback panicked; the pipeline stays alive.
    #[error("batch processor panicked")]
    ProcessorPanic,

    /// The input channel is closed; the batcher is shutting down.
    #[error("batcher input channel is closed")]
    Closed,
}

/// Tuning knobs shared by both batcher shapes.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Flush as soon as the buffer reaches this many entries.
    pub trigger_size: usize,

    /// Flush a non-empty buffer after this much inactivity.
    pub flush_delay: Duration,

    /// Hard cap; a retained buffer growing past this is dropped.
    pub max_size: usize,

    /// Input channel capacity; senders block when it is full.
    pub channel_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            trigger_size: 64,
            flush_delay: Duration::from_secs(2),
            max_size: 4096,
            channel_capacity: 1024,
        }
    }
}

/// Run one processor invocation in its own task so a panic is contained.
/// Returns whether the flush succeeded; failures are logged here.
pub(crate) async fn run_isolated<F>(name: &str, fut: F) -> bool
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::error!("batcher '{}': flush failed: {:#}", name, e);
            false
        }
        Err(join_error) => {
            if join_error.is_panic() {
                log::error!("batcher '{}': {}", name, BatchError::ProcessorPanic);
            } else {
                log::error!("batcher '{}': flush task cancelled", name);
            }
            false
        }
    }
}
