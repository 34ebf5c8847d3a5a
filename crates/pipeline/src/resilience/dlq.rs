use std::sync::Arc;

use tracing::warn;

use crate::store::{overflow_queue, DeadLetterEntry, DeadLetterOutcome, Store};
use crate::{metrics, Result};

/// Capped dead letter queue over the shared store. Entries past the cap land
/// on a paired `<queue>:overflow` queue so the primary stays bounded and
/// inspectable.
pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
    capacity: usize,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        Self { store, capacity }
    }

    pub async fn push(&self, queue: &str, entry: &DeadLetterEntry) -> Result<DeadLetterOutcome> {
        let outcome = self.store.push_dead_letter(queue, entry, self.capacity).await?;
        match &outcome {
            DeadLetterOutcome::Stored(len) => {
                metrics::DEAD_LETTERS_TOTAL.with_label_values(&[queue]).inc();
                warn!("Dead-lettered job on '{}' ({} entries)", queue, len);
            }
            DeadLetterOutcome::Overflowed(len) => {
                metrics::DEAD_LETTERS_TOTAL
                    .with_label_values(&[&overflow_queue(queue)])
                    .inc();
                warn!(
                    "Dead letter queue '{}' full, job moved to overflow ({} entries)",
                    queue, len
                );
            }
        }
        Ok(outcome)
    }

    pub async fn len(&self, queue: &str) -> Result<usize> {
        self.store.dead_letter_len(queue).await
    }

    pub async fn entries(&self, queue: &str, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        self.store.list_dead_letters(queue, limit).await
    }
}
