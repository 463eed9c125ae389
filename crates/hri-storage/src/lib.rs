//! Storage backends for review ingestion: the relational review store and
//! object-storage access for daily snapshots.
//!
//! Every pipeline component receives an explicit `Arc<dyn ReviewStore>`. Race
//! arbitration between concurrent writers happens entirely inside the backend:
//! uniqueness constraints reject the losing insert with
//! [`StoreError::UniqueViolation`] and the rating aggregate is bumped by a single
//! atomic statement.

use async_trait::async_trait;
use hri_core::{DimensionKey, NewReview, RatingsSummary, Review, ReviewDetail};
use thiserror::Error;

mod memory;
mod object;
mod pg;

pub use memory::{Fault, MemoryReviewStore};
#[cfg(feature = "s3")]
pub use object::S3ObjectStore;
pub use object::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpObjectStore, HttpObjectStoreConfig,
    MemoryObjectStore, ObjectReader, ObjectStore, ObjectStoreError, RetryDisposition,
};
pub use pg::PgReviewStore;

pub const CRATE_NAME: &str = "hri-storage";

/// Postgres SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint `{constraint}` violated")]
    UniqueViolation { constraint: String },
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return StoreError::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        StoreError::Database(err)
    }
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Id of the dimension row with this natural key, if one exists.
    async fn find_dimension(&self, key: &DimensionKey) -> Result<Option<i64>, StoreError>;

    /// Creates the dimension row. Fails with `UniqueViolation` if the natural key exists.
    async fn insert_dimension(&self, key: &DimensionKey) -> Result<i64, StoreError>;

    async fn review_exists(&self, hotel_review_id: i64) -> Result<bool, StoreError>;

    /// Fails with `UniqueViolation` if `hotel_review_id` is already stored.
    async fn insert_review(&self, review: &NewReview) -> Result<Review, StoreError>;

    /// Folds one rating into the hotel's summary, creating it on first use.
    /// Must be atomic with respect to concurrent callers for the same hotel.
    async fn increment_summary(&self, hotel_id: i64, rating: f64)
        -> Result<RatingsSummary, StoreError>;

    /// Recomputes the summary from stored reviews. `None` if the hotel has none.
    async fn rebuild_summary(&self, hotel_id: i64) -> Result<Option<RatingsSummary>, StoreError>;

    async fn summary(&self, hotel_id: i64) -> Result<Option<RatingsSummary>, StoreError>;

    async fn count_reviews(&self, hotel_id: i64) -> Result<i64, StoreError>;

    async fn count_hotels(&self) -> Result<i64, StoreError>;

    /// Most recent reviews for a hotel, newest `review_date` first.
    async fn recent_reviews(
        &self,
        hotel_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReviewDetail>, StoreError>;
}
