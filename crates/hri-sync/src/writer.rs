use std::sync::Arc;

use hri_core::{NewReview, RatingsSummary, Review, ReviewRecord};
use hri_storage::{ReviewStore, StoreError};
use thiserror::Error;
use tracing::debug;

use crate::resolver::ResolvedIds;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("checking review {hotel_review_id}: {err}")]
    Lookup {
        hotel_review_id: i64,
        #[source]
        err: StoreError,
    },
    #[error("inserting review {hotel_review_id}: {err}")]
    Insert {
        hotel_review_id: i64,
        #[source]
        err: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Inserted(Review),
    /// The business key was already stored, possibly by a concurrent worker.
    Duplicate,
}

/// Stores at most one review per `hotel_review_id`.
#[derive(Clone)]
pub struct ReviewWriter {
    store: Arc<dyn ReviewStore>,
}

impl ReviewWriter {
    pub fn new(store: Arc<dyn ReviewStore>) -> Self {
        Self { store }
    }

    pub async fn write(
        &self,
        ids: &ResolvedIds,
        record: &ReviewRecord,
    ) -> Result<WriteOutcome, WriteError> {
        let hotel_review_id = record.hotel_review_id;
        let exists = self
            .store
            .review_exists(hotel_review_id)
            .await
            .map_err(|err| WriteError::Lookup {
                hotel_review_id,
                err,
            })?;
        if exists {
            debug!(hotel_review_id, "review already stored");
            return Ok(WriteOutcome::Duplicate);
        }

        let review = NewReview {
            hotel_id: ids.hotel_id,
            platform_id: ids.platform_id,
            reviewer_id: ids.reviewer_id,
            hotel_review_id,
            rating: record.rating,
            title: record.title.clone(),
            text: record.text.clone(),
            review_date: record.review_date,
        };
        match self.store.insert_review(&review).await {
            Ok(stored) => Ok(WriteOutcome::Inserted(stored)),
            Err(err) if err.is_unique_violation() => {
                debug!(hotel_review_id, "review inserted concurrently");
                Ok(WriteOutcome::Duplicate)
            }
            Err(err) => Err(WriteError::Insert {
                hotel_review_id,
                err,
            }),
        }
    }
}

/// Folds newly inserted reviews into the per-hotel rating summary.
#[derive(Clone)]
pub struct AggregateMaintainer {
    store: Arc<dyn ReviewStore>,
}

impl AggregateMaintainer {
    pub fn new(store: Arc<dyn ReviewStore>) -> Self {
        Self { store }
    }

    /// Only call for [`WriteOutcome::Inserted`]; duplicates must not be counted.
    pub async fn apply(&self, review: &Review) -> Result<RatingsSummary, StoreError> {
        self.store
            .increment_summary(review.hotel_id, review.rating)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::EntityResolver;
    use chrono::{TimeZone, Utc};
    use hri_core::ReviewerKey;
    use hri_storage::{Fault, MemoryReviewStore};

    fn record(hotel_review_id: i64, rating: f64) -> ReviewRecord {
        ReviewRecord {
            hotel_external_id: 1,
            hotel_name: "Hotel One".into(),
            platform: "Agoda".into(),
            reviewer: ReviewerKey {
                country_name: "India".into(),
                review_group_name: "Solo".into(),
                room_type_name: "Deluxe".into(),
            },
            hotel_review_id,
            rating,
            title: "Nice".into(),
            text: "Clean rooms".into(),
            review_date: Utc.with_ymd_and_hms(2025, 4, 10, 0, 0, 0).single().expect("ts"),
        }
    }

    async fn ids_for(store: &Arc<MemoryReviewStore>, record: &ReviewRecord) -> ResolvedIds {
        EntityResolver::new(store.clone())
            .resolve_record(record)
            .await
            .expect("resolve")
    }

    #[tokio::test]
    async fn second_write_of_same_business_key_is_duplicate() {
        let store = Arc::new(MemoryReviewStore::new());
        let writer = ReviewWriter::new(store.clone());
        let record = record(555, 4.5);
        let ids = ids_for(&store, &record).await;

        let first = writer.write(&ids, &record).await.expect("first");
        assert!(matches!(first, WriteOutcome::Inserted(ref r) if r.hotel_review_id == 555));
        assert_eq!(writer.write(&ids, &record).await.expect("second"), WriteOutcome::Duplicate);
        assert_eq!(store.review_count(), 1);
    }

    #[tokio::test]
    async fn insert_conflict_after_check_is_duplicate() {
        let store = Arc::new(MemoryReviewStore::new());
        let record = record(777, 3.0);
        let ids = ids_for(&store, &record).await;
        store.inject(Fault::LoseReviewRace(777));

        let outcome = ReviewWriter::new(store.clone())
            .write(&ids, &record)
            .await
            .expect("write");
        assert_eq!(outcome, WriteOutcome::Duplicate);
        assert_eq!(store.reviews_for_business_key(777), 1);
    }

    #[tokio::test]
    async fn transient_failure_surfaces_as_error() {
        let store = Arc::new(MemoryReviewStore::new());
        let record = record(888, 3.0);
        let ids = ids_for(&store, &record).await;
        store.inject(Fault::Unavailable(888));

        let err = ReviewWriter::new(store.clone())
            .write(&ids, &record)
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Lookup { .. }));
        assert_eq!(store.review_count(), 0);
    }

    #[tokio::test]
    async fn aggregate_tracks_inserted_ratings() {
        let store = Arc::new(MemoryReviewStore::new());
        let writer = ReviewWriter::new(store.clone());
        let aggregates = AggregateMaintainer::new(store.clone());

        let mut last = None;
        for (id, rating) in [(1, 4.5), (2, 3.5)] {
            let record = record(id, rating);
            let ids = ids_for(&store, &record).await;
            if let WriteOutcome::Inserted(review) = writer.write(&ids, &record).await.expect("write") {
                last = Some(aggregates.apply(&review).await.expect("apply"));
            }
        }

        let summary = last.expect("summary");
        assert_eq!(summary.total_reviews, 2);
        assert_eq!(summary.total_rating, 8.0);
        assert_eq!(summary.average_rating, 4.0);
    }
}
