pub mod history;
pub mod lookup;
pub mod relation;
pub mod reverse;

use crate::change::Change;
use crate::config::PropagationConfig;
use crate::metadata::Registry;
use crate::record::StoreError;
use crate::storage::{HistoryStore, StorageError};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum PropagationError {
    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Failed(String),
}

/// Result of applying one change. Soft failures (history) are reported here
/// instead of failing the change.
#[derive(Debug, Default)]
pub struct ChangeOutcome {
    pub history_error: Option<String>,
}

/// The propagation core: applies one canonical change to every piece of
/// denormalized state that depends on it, in a fixed order.
pub struct Engine {
    registry: Arc<Registry>,
    history: Arc<dyn HistoryStore>,
    config: PropagationConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<Registry>,
        history: Arc<dyn HistoryStore>,
        config: PropagationConfig,
    ) -> Self {
        Self {
            registry,
            history,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Runs the propagation steps for one change: lookup snapshots, reverse
    /// lookups, relation aggregates, then history. Any step error (except
    /// history, which is soft) fails the change so the processor can retry it.
    pub async fn apply_change(&self, change: &Change) -> Result<ChangeOutcome, PropagationError> {
        lookup::update_lookup_references(&self.registry, change, &self.config).await?;
        reverse::process_reverse_lookups(&self.registry, change, &self.config).await?;
        relation::update_relation_references(
            &self.registry,
            self.history.as_ref(),
            change,
            &self.config,
        )
        .await?;

        let history_error =
            match history::record_change(&self.registry, self.history.as_ref(), change).await {
                Ok(_) => None,
                Err(e) => {
                    warn!(
                        change_id = %change.id,
                        document = %change.document,
                        error = %e,
                        "history write failed, continuing"
                    );
                    Some(e.to_string())
                }
            };

        Ok(ChangeOutcome { history_error })
    }
}
