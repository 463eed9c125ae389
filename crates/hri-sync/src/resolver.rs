use std::sync::Arc;

use hri_core::{DimensionKey, ReviewRecord};
use hri_storage::{ReviewStore, StoreError};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("looking up {key}: {err}")]
    Lookup {
        key: String,
        #[source]
        err: StoreError,
    },
    #[error("creating {key}: {err}")]
    Create {
        key: String,
        #[source]
        err: StoreError,
    },
    #[error("{key} conflicted on insert but is not visible on re-read")]
    Vanished { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedIds {
    pub hotel_id: i64,
    pub platform_id: i64,
    pub reviewer_id: i64,
}

/// Maps natural keys to dimension row ids, creating rows on first sight.
///
/// Holds no locks: when two callers create the same key concurrently the
/// backend's unique constraint rejects one of them, and the loser re-reads the
/// winner's row.
#[derive(Clone)]
pub struct EntityResolver {
    store: Arc<dyn ReviewStore>,
}

impl EntityResolver {
    pub fn new(store: Arc<dyn ReviewStore>) -> Self {
        Self { store }
    }

    #[instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn resolve(&self, key: &DimensionKey) -> Result<i64, ResolveError> {
        if let Some(id) = self.find(key).await? {
            return Ok(id);
        }
        match self.store.insert_dimension(key).await {
            Ok(id) => Ok(id),
            Err(err) if err.is_unique_violation() => {
                debug!("lost create race, re-reading");
                self.find(key).await?.ok_or_else(|| ResolveError::Vanished {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(ResolveError::Create {
                key: key.to_string(),
                err,
            }),
        }
    }

    /// Resolves hotel, platform and reviewer, in that order.
    pub async fn resolve_record(&self, record: &ReviewRecord) -> Result<ResolvedIds, ResolveError> {
        let hotel_id = self.resolve(&record.hotel_key()).await?;
        let platform_id = self.resolve(&record.platform_key()).await?;
        let reviewer_id = self.resolve(&record.reviewer_key()).await?;
        Ok(ResolvedIds {
            hotel_id,
            platform_id,
            reviewer_id,
        })
    }

    async fn find(&self, key: &DimensionKey) -> Result<Option<i64>, ResolveError> {
        self.store
            .find_dimension(key)
            .await
            .map_err(|err| ResolveError::Lookup {
                key: key.to_string(),
                err,
            })
    }
}
