//! Batches message log entries so the store sees one write per batch
//! instead of one per recipient.
//!
//! Logs are advisory: a failed batch write is reported and dropped, never
//! propagated into the send loop.

use bulksend_core::store::RecipientStore;
use bulksend_core::types::MessageLogEntry;
use tracing::{debug, error};

pub(crate) struct LogBuffer {
    entries: Vec<MessageLogEntry>,
    batch_size: usize,
}

impl LogBuffer {
    pub(crate) fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            entries: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    /// Buffer an entry and flush once the batch is full.
    pub(crate) async fn push(&mut self, entry: MessageLogEntry, store: &dyn RecipientStore) {
        self.entries.push(entry);
        if self.entries.len() >= self.batch_size {
            self.flush(store).await;
        }
    }

    pub(crate) async fn flush(&mut self, store: &dyn RecipientStore) {
        if self.entries.is_empty() {
            return;
        }

        let count = self.entries.len();
        match store.create_message_logs_batch(&self.entries).await {
            Ok(()) => {
                metrics::counter!("dispatch.log_flushed").increment(count as u64);
                debug!(count, "Message log batch flushed");
            }
            Err(e) => {
                metrics::counter!("dispatch.log_flush_errors").increment(1);
                error!(error = %e, count, "Failed to flush message log batch, entries dropped");
            }
        }
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
