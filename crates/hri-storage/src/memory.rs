use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use hri_core::{
    DimensionKey, DimensionKind, Hotel, NewReview, Platform, RatingsSummary, Review, ReviewDetail,
    Reviewer, ReviewerKey,
};

use crate::{ReviewStore, StoreError};

/// Scripted backend misbehaviour, consumed by the first operation it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A concurrent writer commits the same natural key just before this insert.
    LoseRace(DimensionKind),
    /// The insert reports a conflict but no row becomes visible.
    PhantomConflict(DimensionKind),
    /// A concurrent writer commits this business key just before the review insert.
    LoseReviewRace(i64),
    /// Every operation touching this business key fails transiently, once.
    Unavailable(i64),
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    hotels: HashMap<i64, Hotel>,
    platforms: HashMap<String, Platform>,
    reviewers: HashMap<ReviewerKey, Reviewer>,
    reviews: HashMap<i64, Review>,
    summaries: HashMap<i64, RatingsSummary>,
    faults: Vec<Fault>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let index = self.faults.iter().position(matches)?;
        Some(self.faults.remove(index))
    }

    fn find(&self, key: &DimensionKey) -> Option<i64> {
        match key {
            DimensionKey::Hotel { external_id, .. } => self.hotels.get(external_id).map(|h| h.id),
            DimensionKey::Platform { name } => self.platforms.get(name).map(|p| p.id),
            DimensionKey::Reviewer(reviewer) => self.reviewers.get(reviewer).map(|r| r.id),
        }
    }

    fn create(&mut self, key: &DimensionKey) -> i64 {
        let id = self.allocate_id();
        match key {
            DimensionKey::Hotel { external_id, name } => {
                self.hotels.insert(
                    *external_id,
                    Hotel {
                        id,
                        external_id: *external_id,
                        name: name.clone(),
                    },
                );
            }
            DimensionKey::Platform { name } => {
                self.platforms.insert(name.clone(), Platform { id, name: name.clone() });
            }
            DimensionKey::Reviewer(reviewer) => {
                self.reviewers.insert(
                    reviewer.clone(),
                    Reviewer {
                        id,
                        country_name: reviewer.country_name.clone(),
                        review_group_name: reviewer.review_group_name.clone(),
                        room_type_name: reviewer.room_type_name.clone(),
                    },
                );
            }
        }
        id
    }

    fn store_review(&mut self, review: &NewReview) -> Review {
        let stored = Review {
            id: self.allocate_id(),
            hotel_id: review.hotel_id,
            platform_id: review.platform_id,
            reviewer_id: review.reviewer_id,
            hotel_review_id: review.hotel_review_id,
            rating: review.rating,
            title: review.title.clone(),
            text: review.text.clone(),
            review_date: review.review_date,
            created_at: Utc::now(),
        };
        self.reviews.insert(review.hotel_review_id, stored.clone());
        stored
    }

    fn references_exist(&self, review: &NewReview) -> bool {
        self.hotels.values().any(|h| h.id == review.hotel_id)
            && self.platforms.values().any(|p| p.id == review.platform_id)
            && self.reviewers.values().any(|r| r.id == review.reviewer_id)
    }
}

fn constraint_for(kind: DimensionKind) -> &'static str {
    match kind {
        DimensionKind::Hotel => "hotels_external_id_key",
        DimensionKind::Platform => "platforms_name_key",
        DimensionKind::Reviewer => "reviewers_identity_key",
    }
}

fn unique_violation(constraint: &str) -> StoreError {
    StoreError::UniqueViolation {
        constraint: constraint.to_string(),
    }
}

/// In-process backend with the same constraints as the Postgres schema.
///
/// Each trait call is one atomic step; nothing spans calls, so callers race
/// exactly as they would against a real database.
#[derive(Debug, Default)]
pub struct MemoryReviewStore {
    tables: Mutex<Tables>,
}

impl MemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn review_count(&self) -> usize {
        self.lock().reviews.len()
    }

    pub fn reviews_for_business_key(&self, hotel_review_id: i64) -> usize {
        usize::from(self.lock().reviews.contains_key(&hotel_review_id))
    }

    pub fn platform_count(&self) -> usize {
        self.lock().platforms.len()
    }

    pub fn reviewer_count(&self) -> usize {
        self.lock().reviewers.len()
    }

    pub fn summaries(&self) -> Vec<RatingsSummary> {
        self.lock().summaries.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(tables: &mut Tables, hotel_review_id: i64) -> Result<(), StoreError> {
        match tables.take_fault(|f| *f == Fault::Unavailable(hotel_review_id)) {
            Some(_) => Err(StoreError::Unavailable(format!(
                "injected failure for review {hotel_review_id}"
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ReviewStore for MemoryReviewStore {
    async fn find_dimension(&self, key: &DimensionKey) -> Result<Option<i64>, StoreError> {
        Ok(self.lock().find(key))
    }

    async fn insert_dimension(&self, key: &DimensionKey) -> Result<i64, StoreError> {
        let kind = key.kind();
        let mut tables = self.lock();
        match tables.take_fault(|f| {
            matches!(f, Fault::LoseRace(k) | Fault::PhantomConflict(k) if *k == kind)
        }) {
            Some(Fault::LoseRace(_)) => {
                if tables.find(key).is_none() {
                    tables.create(key);
                }
                return Err(unique_violation(constraint_for(kind)));
            }
            Some(_) => return Err(unique_violation(constraint_for(kind))),
            None => {}
        }
        if tables.find(key).is_some() {
            return Err(unique_violation(constraint_for(kind)));
        }
        Ok(tables.create(key))
    }

    async fn review_exists(&self, hotel_review_id: i64) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        Self::check_available(&mut tables, hotel_review_id)?;
        Ok(tables.reviews.contains_key(&hotel_review_id))
    }

    async fn insert_review(&self, review: &NewReview) -> Result<Review, StoreError> {
        let mut tables = self.lock();
        Self::check_available(&mut tables, review.hotel_review_id)?;
        if !tables.references_exist(review) {
            return Err(StoreError::Unavailable(format!(
                "review {} references a missing dimension row",
                review.hotel_review_id
            )));
        }
        if tables
            .take_fault(|f| *f == Fault::LoseReviewRace(review.hotel_review_id))
            .is_some()
            && !tables.reviews.contains_key(&review.hotel_review_id)
        {
            tables.store_review(review);
        }
        if tables.reviews.contains_key(&review.hotel_review_id) {
            return Err(unique_violation("reviews_hotel_review_id_key"));
        }
        Ok(tables.store_review(review))
    }

    async fn increment_summary(
        &self,
        hotel_id: i64,
        rating: f64,
    ) -> Result<RatingsSummary, StoreError> {
        let now = Utc::now();
        let mut tables = self.lock();
        let next = match tables.summaries.get(&hotel_id) {
            Some(current) => current.with_review(rating, now),
            None => RatingsSummary::first(hotel_id, rating, now),
        };
        tables.summaries.insert(hotel_id, next.clone());
        Ok(next)
    }

    async fn rebuild_summary(&self, hotel_id: i64) -> Result<Option<RatingsSummary>, StoreError> {
        let mut tables = self.lock();
        let (count, total) = tables
            .reviews
            .values()
            .filter(|r| r.hotel_id == hotel_id)
            .fold((0i64, 0f64), |(count, total), r| (count + 1, total + r.rating));
        if count == 0 {
            return Ok(None);
        }
        let summary = RatingsSummary {
            hotel_id,
            total_reviews: count,
            total_rating: total,
            average_rating: total / count as f64,
            last_updated: Utc::now(),
        };
        tables.summaries.insert(hotel_id, summary.clone());
        Ok(Some(summary))
    }

    async fn summary(&self, hotel_id: i64) -> Result<Option<RatingsSummary>, StoreError> {
        Ok(self.lock().summaries.get(&hotel_id).cloned())
    }

    async fn count_reviews(&self, hotel_id: i64) -> Result<i64, StoreError> {
        let tables = self.lock();
        Ok(tables.reviews.values().filter(|r| r.hotel_id == hotel_id).count() as i64)
    }

    async fn count_hotels(&self) -> Result<i64, StoreError> {
        Ok(self.lock().hotels.len() as i64)
    }

    async fn recent_reviews(
        &self,
        hotel_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReviewDetail>, StoreError> {
        let tables = self.lock();
        let mut reviews: Vec<&Review> = tables
            .reviews
            .values()
            .filter(|r| r.hotel_id == hotel_id)
            .collect();
        reviews.sort_by(|a, b| b.review_date.cmp(&a.review_date).then(b.id.cmp(&a.id)));

        let platform_names: HashMap<i64, &str> = tables
            .platforms
            .values()
            .map(|p| (p.id, p.name.as_str()))
            .collect();
        let reviewers: HashMap<i64, &Reviewer> =
            tables.reviewers.values().map(|r| (r.id, r)).collect();

        Ok(reviews
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|r| {
                let reviewer = reviewers.get(&r.reviewer_id);
                ReviewDetail {
                    hotel_review_id: r.hotel_review_id,
                    rating: r.rating,
                    title: r.title.clone(),
                    text: r.text.clone(),
                    review_date: r.review_date,
                    platform: platform_names
                        .get(&r.platform_id)
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                    country_name: reviewer.map(|v| v.country_name.clone()).unwrap_or_default(),
                    review_group_name: reviewer
                        .map(|v| v.review_group_name.clone())
                        .unwrap_or_default(),
                    room_type_name: reviewer.map(|v| v.room_type_name.clone()).unwrap_or_default(),
                }
            })
            .collect())
    }
}
