//! Core domain model and JL record parsing for hotel review ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hri-core";

/// Review date stored when a record carries an unparsable date under [`DatePolicy::Sentinel`].
pub const SENTINEL_REVIEW_DATE: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hotel {
    pub id: i64,
    pub external_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reviewer {
    pub id: i64,
    pub country_name: String,
    pub review_group_name: String,
    pub room_type_name: String,
}

/// Persisted review. Created once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    pub hotel_id: i64,
    pub platform_id: i64,
    pub reviewer_id: i64,
    pub hotel_review_id: i64,
    pub rating: f64,
    pub title: String,
    pub text: String,
    pub review_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Review insert payload once every dimension has been resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReview {
    pub hotel_id: i64,
    pub platform_id: i64,
    pub reviewer_id: i64,
    pub hotel_review_id: i64,
    pub rating: f64,
    pub title: String,
    pub text: String,
    pub review_date: DateTime<Utc>,
}

/// Rolling per-hotel rating aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingsSummary {
    pub hotel_id: i64,
    pub total_reviews: i64,
    pub total_rating: f64,
    pub average_rating: f64,
    pub last_updated: DateTime<Utc>,
}

impl RatingsSummary {
    pub fn first(hotel_id: i64, rating: f64, now: DateTime<Utc>) -> Self {
        Self {
            hotel_id,
            total_reviews: 1,
            total_rating: rating,
            average_rating: rating,
            last_updated: now,
        }
    }

    /// Summary after folding in one more accepted review.
    pub fn with_review(&self, rating: f64, now: DateTime<Utc>) -> Self {
        let total_reviews = self.total_reviews + 1;
        let total_rating = self.total_rating + rating;
        Self {
            hotel_id: self.hotel_id,
            total_reviews,
            total_rating,
            average_rating: total_rating / total_reviews as f64,
            last_updated: now,
        }
    }
}

/// Recent review joined with its reviewer, as served to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDetail {
    pub hotel_review_id: i64,
    pub rating: f64,
    pub title: String,
    pub text: String,
    pub review_date: DateTime<Utc>,
    pub platform: String,
    pub country_name: String,
    pub review_group_name: String,
    pub room_type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReviewerKey {
    pub country_name: String,
    pub review_group_name: String,
    pub room_type_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimensionKind {
    Hotel,
    Platform,
    Reviewer,
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionKind::Hotel => f.write_str("hotel"),
            DimensionKind::Platform => f.write_str("platform"),
            DimensionKind::Reviewer => f.write_str("reviewer"),
        }
    }
}

/// Natural key of a dimension row.
///
/// Hotels are identified by `external_id` alone; `name` is only the value written
/// when the row is first created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimensionKey {
    Hotel { external_id: i64, name: String },
    Platform { name: String },
    Reviewer(ReviewerKey),
}

impl DimensionKey {
    pub fn kind(&self) -> DimensionKind {
        match self {
            DimensionKey::Hotel { .. } => DimensionKind::Hotel,
            DimensionKey::Platform { .. } => DimensionKind::Platform,
            DimensionKey::Reviewer(_) => DimensionKind::Reviewer,
        }
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionKey::Hotel { external_id, .. } => write!(f, "hotel:{external_id}"),
            DimensionKey::Platform { name } => write!(f, "platform:{name}"),
            DimensionKey::Reviewer(key) => write!(
                f,
                "reviewer:{}/{}/{}",
                key.country_name, key.review_group_name, key.room_type_name
            ),
        }
    }
}

/// Canonical record decoded from one JL line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub hotel_external_id: i64,
    pub hotel_name: String,
    pub platform: String,
    pub reviewer: ReviewerKey,
    pub hotel_review_id: i64,
    pub rating: f64,
    pub title: String,
    pub text: String,
    pub review_date: DateTime<Utc>,
}

impl ReviewRecord {
    pub fn hotel_key(&self) -> DimensionKey {
        DimensionKey::Hotel {
            external_id: self.hotel_external_id,
            name: self.hotel_name.clone(),
        }
    }

    pub fn platform_key(&self) -> DimensionKey {
        DimensionKey::Platform {
            name: self.platform.clone(),
        }
    }

    pub fn reviewer_key(&self) -> DimensionKey {
        DimensionKey::Reviewer(self.reviewer.clone())
    }
}

/// What to do with a record whose `reviewDate` is missing or not RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatePolicy {
    #[default]
    Reject,
    Sentinel,
}

impl FromStr for DatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(DatePolicy::Reject),
            "sentinel" => Ok(DatePolicy::Sentinel),
            other => Err(format!("unknown date policy `{other}` (expected reject|sentinel)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("record does not match schema: {0}")]
    Schema(#[source] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl RecordError {
    fn from_serde(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Data => RecordError::Schema(err),
            _ => RecordError::InvalidJson(err),
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        RecordError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(serde_json::Number),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLine {
    hotel_id: NumberOrText,
    platform: String,
    hotel_name: String,
    comment: RawComment,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawComment {
    hotel_review_id: NumberOrText,
    rating: NumberOrText,
    review_title: Option<String>,
    review_comments: Option<String>,
    review_date: Option<String>,
    reviewer_info: RawReviewerInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReviewerInfo {
    country_name: Option<String>,
    review_group_name: Option<String>,
    room_type_name: Option<String>,
}

// Larger magnitudes lose integer precision as f64.
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

fn integer_field(field: &'static str, value: &NumberOrText) -> Result<i64, RecordError> {
    match value {
        NumberOrText::Number(n) => {
            if let Some(v) = n.as_i64() {
                return Ok(v);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() <= MAX_EXACT_FLOAT_INT => Ok(f as i64),
                _ => Err(RecordError::invalid(field, format!("{n} is not an integer"))),
            }
        }
        NumberOrText::Text(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|err| RecordError::invalid(field, format!("`{text}`: {err}"))),
    }
}

fn rating_field(value: &NumberOrText) -> Result<f64, RecordError> {
    const FIELD: &str = "comment.rating";
    let rating = match value {
        NumberOrText::Number(n) => n
            .as_f64()
            .ok_or_else(|| RecordError::invalid(FIELD, format!("{n} is not representable")))?,
        NumberOrText::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|err| RecordError::invalid(FIELD, format!("`{text}`: {err}")))?,
    };
    if !rating.is_finite() || rating < 0.0 {
        return Err(RecordError::invalid(FIELD, format!("{rating} is out of range")));
    }
    Ok(rating)
}

fn clean(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

fn review_date(raw: Option<&str>, policy: DatePolicy) -> Result<DateTime<Utc>, RecordError> {
    const FIELD: &str = "comment.reviewDate";
    let parsed = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(DateTime::parse_from_rfc3339);
    match (parsed, policy) {
        (Some(Ok(ts)), _) => Ok(ts.with_timezone(&Utc)),
        (other, DatePolicy::Sentinel) => {
            tracing::debug!(raw = ?raw, present = other.is_some(), "substituting sentinel review date");
            Ok(SENTINEL_REVIEW_DATE)
        }
        (None, DatePolicy::Reject) => Err(RecordError::invalid(FIELD, "missing")),
        (Some(Err(err)), DatePolicy::Reject) => Err(RecordError::invalid(FIELD, err.to_string())),
    }
}

/// Decode and validate one JL line into a [`ReviewRecord`].
pub fn parse_record(line: &[u8], policy: DatePolicy) -> Result<ReviewRecord, RecordError> {
    let raw: RawLine = serde_json::from_slice(line).map_err(RecordError::from_serde)?;

    let hotel_external_id = integer_field("hotelId", &raw.hotel_id)?;
    let platform = raw.platform.trim().to_string();
    if platform.is_empty() {
        return Err(RecordError::invalid("platform", "empty"));
    }

    let comment = raw.comment;
    let hotel_review_id = integer_field("comment.hotelReviewId", &comment.hotel_review_id)?;
    let rating = rating_field(&comment.rating)?;
    let review_date = review_date(comment.review_date.as_deref(), policy)?;

    Ok(ReviewRecord {
        hotel_external_id,
        hotel_name: raw.hotel_name.trim().to_string(),
        platform,
        reviewer: ReviewerKey {
            country_name: clean(comment.reviewer_info.country_name),
            review_group_name: clean(comment.reviewer_info.review_group_name),
            room_type_name: clean(comment.reviewer_info.room_type_name),
        },
        hotel_review_id,
        rating,
        title: clean(comment.review_title),
        text: clean(comment.review_comments),
        review_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn line(hotel_id: &str, review_id: &str, rating: &str, date: &str) -> String {
        format!(
            r#"{{"hotelId":{hotel_id},"platform":" Agoda ","hotelName":"Oscar Saigon Hotel","comment":{{"hotelReviewId":{review_id},"rating":{rating},"reviewTitle":" Nice stay ","reviewComments":"Clean rooms.","reviewDate":{date},"reviewerInfo":{{"countryName":"India","reviewGroupName":"Solo traveler","roomTypeName":"Deluxe"}}}}}}"#
        )
    }

    #[test]
    fn parses_canonical_record_and_trims_strings() {
        let raw = line("10984", "948353737", "6.4", r#""2025-04-10T05:37:00+07:00""#);
        let record = parse_record(raw.as_bytes(), DatePolicy::Reject).expect("parse");

        assert_eq!(record.hotel_external_id, 10984);
        assert_eq!(record.platform, "Agoda");
        assert_eq!(record.title, "Nice stay");
        assert_eq!(record.hotel_review_id, 948353737);
        assert!((record.rating - 6.4).abs() < f64::EPSILON);
        assert_eq!(record.reviewer.room_type_name, "Deluxe");
        assert_eq!(
            record.review_date,
            Utc.with_ymd_and_hms(2025, 4, 9, 22, 37, 0).single().expect("ts")
        );
    }

    #[test]
    fn numeric_fields_accept_string_encodings() {
        let raw = line(r#""7""#, r#""555""#, r#""4.5""#, r#""2025-01-01T00:00:00Z""#);
        let record = parse_record(raw.as_bytes(), DatePolicy::Reject).expect("parse");
        assert_eq!(record.hotel_external_id, 7);
        assert_eq!(record.hotel_review_id, 555);
        assert_eq!(record.rating, 4.5);
    }

    #[test]
    fn integral_float_ids_are_accepted_but_fractions_rejected() {
        let ok = line("12.0", "1", "3", r#""2025-01-01T00:00:00Z""#);
        assert_eq!(
            parse_record(ok.as_bytes(), DatePolicy::Reject)
                .expect("parse")
                .hotel_external_id,
            12
        );

        let bad = line("12.5", "1", "3", r#""2025-01-01T00:00:00Z""#);
        let err = parse_record(bad.as_bytes(), DatePolicy::Reject).unwrap_err();
        assert!(matches!(err, RecordError::InvalidField { field: "hotelId", .. }));
    }

    #[test]
    fn malformed_json_is_classified() {
        let err = parse_record(br#"{"hotelId": 1, "platform": "#, DatePolicy::Reject).unwrap_err();
        assert!(matches!(err, RecordError::InvalidJson(_)));
    }

    #[test]
    fn missing_required_field_is_a_schema_error() {
        let err = parse_record(
            br#"{"hotelId":1,"platform":"Agoda","comment":{"hotelReviewId":1,"rating":3,"reviewerInfo":{}}}"#,
            DatePolicy::Sentinel,
        )
        .unwrap_err();
        assert!(matches!(err, RecordError::Schema(_)));
    }

    #[test]
    fn type_mismatch_on_required_field_is_rejected() {
        let err = parse_record(
            br#"{"hotelId":1,"platform":42,"hotelName":"X","comment":{"hotelReviewId":1,"rating":3,"reviewerInfo":{}}}"#,
            DatePolicy::Sentinel,
        )
        .unwrap_err();
        assert!(matches!(err, RecordError::Schema(_)));
    }

    #[test]
    fn optional_fields_default_to_empty() {
        let record = parse_record(
            br#"{"hotelId":1,"platform":"Agoda","hotelName":"X","comment":{"hotelReviewId":9,"rating":3,"reviewDate":"2025-01-01T00:00:00Z","reviewerInfo":{"countryName":null}}}"#,
            DatePolicy::Reject,
        )
        .expect("parse");
        assert_eq!(record.title, "");
        assert_eq!(record.text, "");
        assert_eq!(record.reviewer.country_name, "");
    }

    #[test]
    fn unparsable_date_follows_policy() {
        let raw = line("1", "2", "3", r#""last tuesday""#);
        let err = parse_record(raw.as_bytes(), DatePolicy::Reject).unwrap_err();
        assert!(matches!(
            err,
            RecordError::InvalidField { field: "comment.reviewDate", .. }
        ));

        let record = parse_record(raw.as_bytes(), DatePolicy::Sentinel).expect("sentinel");
        assert_eq!(record.review_date, SENTINEL_REVIEW_DATE);
    }

    #[test]
    fn negative_rating_is_rejected() {
        let raw = line("1", "2", "-1", r#""2025-01-01T00:00:00Z""#);
        let err = parse_record(raw.as_bytes(), DatePolicy::Reject).unwrap_err();
        assert!(matches!(err, RecordError::InvalidField { field: "comment.rating", .. }));
    }

    #[test]
    fn summary_fold_keeps_average_consistent() {
        let now = Utc::now();
        let summary = RatingsSummary::first(1, 4.5, now).with_review(3.5, now);
        assert_eq!(summary.total_reviews, 2);
        assert_eq!(summary.total_rating, 8.0);
        assert_eq!(summary.average_rating, 4.0);
    }

    #[test]
    fn date_policy_parses_from_config_strings() {
        assert_eq!("Sentinel".parse::<DatePolicy>(), Ok(DatePolicy::Sentinel));
        assert_eq!(" reject ".parse::<DatePolicy>(), Ok(DatePolicy::Reject));
        assert!("drop".parse::<DatePolicy>().is_err());
    }
}
