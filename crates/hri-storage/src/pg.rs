use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hri_core::{DimensionKey, NewReview, RatingsSummary, Review, ReviewDetail};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::{ReviewStore, StoreError};

type SummaryRow = (i64, i64, f64, f64, DateTime<Utc>);

const SUMMARY_COLUMNS: &str = "hotel_id, total_reviews, total_rating, average_rating, last_updated";

fn summary_from_row((hotel_id, total_reviews, total_rating, average_rating, last_updated): SummaryRow) -> RatingsSummary {
    RatingsSummary {
        hotel_id,
        total_reviews,
        total_rating,
        average_rating,
        last_updated,
    }
}

/// Postgres-backed review store. Relies on the constraints in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgReviewStore {
    pool: PgPool,
}

impl PgReviewStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to review database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying review schema migrations")
    }
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn find_dimension(&self, key: &DimensionKey) -> Result<Option<i64>, StoreError> {
        let id = match key {
            DimensionKey::Hotel { external_id, .. } => {
                sqlx::query_scalar::<_, i64>("SELECT id FROM hotels WHERE external_id = $1")
                    .bind(external_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            DimensionKey::Platform { name } => {
                sqlx::query_scalar::<_, i64>("SELECT id FROM platforms WHERE name = $1")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await?
            }
            DimensionKey::Reviewer(reviewer) => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM reviewers \
                     WHERE country_name = $1 AND review_group_name = $2 AND room_type_name = $3",
                )
                .bind(&reviewer.country_name)
                .bind(&reviewer.review_group_name)
                .bind(&reviewer.room_type_name)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(id)
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn insert_dimension(&self, key: &DimensionKey) -> Result<i64, StoreError> {
        let id = match key {
            DimensionKey::Hotel { external_id, name } => {
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO hotels (external_id, name) VALUES ($1, $2) RETURNING id",
                )
                .bind(external_id)
                .bind(name)
                .fetch_one(&self.pool)
                .await?
            }
            DimensionKey::Platform { name } => {
                sqlx::query_scalar::<_, i64>("INSERT INTO platforms (name) VALUES ($1) RETURNING id")
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?
            }
            DimensionKey::Reviewer(reviewer) => {
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO reviewers (country_name, review_group_name, room_type_name) \
                     VALUES ($1, $2, $3) RETURNING id",
                )
                .bind(&reviewer.country_name)
                .bind(&reviewer.review_group_name)
                .bind(&reviewer.room_type_name)
                .fetch_one(&self.pool)
                .await?
            }
        };
        debug!(id, "created dimension row");
        Ok(id)
    }

    async fn review_exists(&self, hotel_review_id: i64) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM reviews WHERE hotel_review_id = $1)",
        )
        .bind(hotel_review_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_review(&self, review: &NewReview) -> Result<Review, StoreError> {
        let (id, created_at) = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            "INSERT INTO reviews \
             (hotel_id, platform_id, reviewer_id, hotel_review_id, rating, review_title, review_text, review_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING id, created_at",
        )
        .bind(review.hotel_id)
        .bind(review.platform_id)
        .bind(review.reviewer_id)
        .bind(review.hotel_review_id)
        .bind(review.rating)
        .bind(&review.title)
        .bind(&review.text)
        .bind(review.review_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(Review {
            id,
            hotel_id: review.hotel_id,
            platform_id: review.platform_id,
            reviewer_id: review.reviewer_id,
            hotel_review_id: review.hotel_review_id,
            rating: review.rating,
            title: review.title.clone(),
            text: review.text.clone(),
            review_date: review.review_date,
            created_at,
        })
    }

    async fn increment_summary(
        &self,
        hotel_id: i64,
        rating: f64,
    ) -> Result<RatingsSummary, StoreError> {
        // One statement: the row lock taken by ON CONFLICT serializes writers for the same hotel.
        let sql = format!(
            "INSERT INTO ratings_summaries AS s ({SUMMARY_COLUMNS}) \
             VALUES ($1, 1, $2, $2, now()) \
             ON CONFLICT (hotel_id) DO UPDATE SET \
                 total_reviews = s.total_reviews + 1, \
                 total_rating = s.total_rating + EXCLUDED.total_rating, \
                 average_rating = (s.total_rating + EXCLUDED.total_rating) / (s.total_reviews + 1), \
                 last_updated = now() \
             RETURNING {SUMMARY_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SummaryRow>(&sql)
            .bind(hotel_id)
            .bind(rating)
            .fetch_one(&self.pool)
            .await?;
        Ok(summary_from_row(row))
    }

    async fn rebuild_summary(&self, hotel_id: i64) -> Result<Option<RatingsSummary>, StoreError> {
        let sql = format!(
            "INSERT INTO ratings_summaries AS s ({SUMMARY_COLUMNS}) \
             SELECT hotel_id, COUNT(*), SUM(rating), AVG(rating), now() \
             FROM reviews WHERE hotel_id = $1 GROUP BY hotel_id \
             ON CONFLICT (hotel_id) DO UPDATE SET \
                 total_reviews = EXCLUDED.total_reviews, \
                 total_rating = EXCLUDED.total_rating, \
                 average_rating = EXCLUDED.average_rating, \
                 last_updated = EXCLUDED.last_updated \
             RETURNING {SUMMARY_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SummaryRow>(&sql)
            .bind(hotel_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(summary_from_row))
    }

    async fn summary(&self, hotel_id: i64) -> Result<Option<RatingsSummary>, StoreError> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM ratings_summaries WHERE hotel_id = $1");
        let row = sqlx::query_as::<_, SummaryRow>(&sql)
            .bind(hotel_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(summary_from_row))
    }

    async fn count_reviews(&self, hotel_id: i64) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM reviews WHERE hotel_id = $1")
            .bind(hotel_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_hotels(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM hotels")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn recent_reviews(
        &self,
        hotel_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ReviewDetail>, StoreError> {
        type DetailRow = (i64, f64, String, String, DateTime<Utc>, String, String, String, String);

        let rows = sqlx::query_as::<_, DetailRow>(
            "SELECT r.hotel_review_id, r.rating, r.review_title, r.review_text, r.review_date, \
                    p.name, v.country_name, v.review_group_name, v.room_type_name \
             FROM reviews r \
             JOIN platforms p ON p.id = r.platform_id \
             JOIN reviewers v ON v.id = r.reviewer_id \
             WHERE r.hotel_id = $1 \
             ORDER BY r.review_date DESC, r.id DESC \
             LIMIT $2 OFFSET $3",
        )
        .bind(hotel_id)
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(hotel_review_id, rating, title, text, review_date, platform, country_name, review_group_name, room_type_name)| {
                    ReviewDetail {
                        hotel_review_id,
                        rating,
                        title,
                        text,
                        review_date,
                        platform,
                        country_name,
                        review_group_name,
                        room_type_name,
                    }
                },
            )
            .collect())
    }
}
