//! Typed wrappers for the weather, location and insight endpoints.
//!
//! Arguments are validated locally; invalid input fails with
//! [`ApiError::InvalidRequest`] without touching the network. Reads retry
//! twice; creating or changing an insight is never retried.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use ratewise_core::ApiError;

use crate::client::{ApiClient, RequestConfig};
use crate::retry::{RetryConfig, DEFAULT_MAX_DELAY_MS};

const MIN_QUERY_LENGTH: usize = 2;
const DEFAULT_SEARCH_LIMIT: u32 = 10;
const MAX_TAGS: usize = 5;

/// Retry policy for weather reads.
pub fn weather_retry() -> RetryConfig {
    RetryConfig::new(2, 1000, DEFAULT_MAX_DELAY_MS)
}

/// Retry policy for location search.
pub fn locations_retry() -> RetryConfig {
    RetryConfig::new(2, 500, DEFAULT_MAX_DELAY_MS)
}

/// Retry policy for insight reads.
pub fn insights_retry() -> RetryConfig {
    RetryConfig::new(2, 1000, DEFAULT_MAX_DELAY_MS)
}

pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), ApiError> {
    let valid = lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon);
    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidRequest(
            "Invalid coordinates. Latitude must be between -90 and 90, \
             longitude between -180 and 180."
                .to_string(),
        ))
    }
}

fn require_id(id: &str) -> Result<&str, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::InvalidRequest("Insight id is required.".to_string()));
    }
    Ok(id)
}

/// Sort order for insight listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightSort {
    #[default]
    Recent,
    Popular,
}

impl InsightSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightSort::Recent => "recent",
            InsightSort::Popular => "popular",
        }
    }
}

/// Filters for [`ApiClient::list_insights`].
#[derive(Debug, Clone, PartialEq)]
pub struct InsightQuery {
    pub location: Option<String>,
    pub tags: Vec<String>,
    pub limit: u32,
    pub offset: u32,
    pub sort: InsightSort,
}

impl Default for InsightQuery {
    fn default() -> Self {
        Self {
            location: None,
            tags: Vec::new(),
            limit: 20,
            offset: 0,
            sort: InsightSort::default(),
        }
    }
}

impl InsightQuery {
    fn to_request_config(&self) -> RequestConfig {
        let mut config = RequestConfig::new().with_retry(insights_retry());
        if let Some(location) = &self.location {
            config = config.with_query("location", location);
        }
        for tag in &self.tags {
            config = config.with_query("tags", tag);
        }
        config
            .with_query("limit", self.limit)
            .with_query("offset", self.offset)
            .with_query("sort", self.sort.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightAuthor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightLocation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub country: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub condition: String,
    pub rainfall_24h: f64,
}

/// Body of a new insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInsightRequest {
    pub author: InsightAuthor,
    pub location: InsightLocation,
    pub weather_snapshot: WeatherSnapshot,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CreateInsightRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        let invalid = |message: &str| Err(ApiError::InvalidRequest(message.to_string()));

        let author = self.author.name.trim().chars().count();
        if author < 2 {
            return invalid("Author name must be at least 2 characters.");
        }
        if self.author.name.chars().count() > 100 {
            return invalid("Author name must be at most 100 characters.");
        }
        if self.location.name.trim().is_empty() {
            return invalid("Location name is required.");
        }
        validate_coordinates(self.location.lat, self.location.lon)?;

        let content = self.content.trim().chars().count();
        if content < 10 {
            return invalid("Content must be at least 10 characters.");
        }
        if self.content.chars().count() > 1000 {
            return invalid("Content must be at most 1000 characters.");
        }

        if self.tags.len() > MAX_TAGS {
            return invalid("At most 5 tags are allowed.");
        }
        if self
            .tags
            .iter()
            .any(|tag| !(2..=30).contains(&tag.chars().count()))
        {
            return invalid("Each tag must be between 2 and 30 characters.");
        }
        Ok(())
    }
}

impl ApiClient {
    /// Current conditions and forecast for a location.
    pub async fn get_weather<T: DeserializeOwned>(
        &self,
        lat: f64,
        lon: f64,
        location_name: &str,
    ) -> Result<T, ApiError> {
        validate_coordinates(lat, lon)?;
        if location_name.trim().is_empty() {
            return Err(ApiError::InvalidRequest("Location name is required.".to_string()));
        }

        let config = RequestConfig::new()
            .with_retry(weather_retry())
            .with_query("lat", lat)
            .with_query("lon", lon)
            .with_query("location_name", location_name)
            .on_retry(|retry| {
                tracing::info!("[Weather] attempt {} after {:?}", retry.attempt + 2, retry.delay)
            });
        self.get("/api/v1/weather", config).await
    }

    pub async fn get_forecast<T: DeserializeOwned>(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<T, ApiError> {
        validate_coordinates(lat, lon)?;
        let config = RequestConfig::new()
            .with_retry(weather_retry())
            .with_query("lat", lat)
            .with_query("lon", lon);
        self.get("/api/v1/weather/forecast", config).await
    }

    pub async fn get_current_weather<T: DeserializeOwned>(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<T, ApiError> {
        validate_coordinates(lat, lon)?;
        let config = RequestConfig::new()
            .with_retry(weather_retry())
            .with_query("lat", lat)
            .with_query("lon", lon);
        self.get("/api/v1/weather/current", config).await
    }

    /// Search locations by name. `q` must have at least two characters.
    pub async fn search_locations<T: DeserializeOwned>(
        &self,
        q: &str,
        limit: Option<u32>,
    ) -> Result<T, ApiError> {
        let q = q.trim();
        if q.chars().count() < MIN_QUERY_LENGTH {
            return Err(ApiError::InvalidRequest(format!(
                "Query must be at least {} characters.",
                MIN_QUERY_LENGTH
            )));
        }

        let config = RequestConfig::new()
            .with_retry(locations_retry())
            .with_query("q", q)
            .with_query("limit", limit.unwrap_or(DEFAULT_SEARCH_LIMIT));
        self.get("/api/v1/locations/search", config).await
    }

    /// Location nearest to a coordinate.
    pub async fn reverse_geocode<T: DeserializeOwned>(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<T, ApiError> {
        validate_coordinates(lat, lon)?;
        let config = RequestConfig::new()
            .with_retry(weather_retry())
            .with_query("lat", lat)
            .with_query("lon", lon);
        self.get("/api/v1/locations/reverse", config).await
    }

    pub async fn list_insights<T: DeserializeOwned>(
        &self,
        query: &InsightQuery,
    ) -> Result<T, ApiError> {
        self.get("/api/v1/insights", query.to_request_config()).await
    }

    pub async fn get_insight<T: DeserializeOwned>(&self, id: &str) -> Result<T, ApiError> {
        let id = require_id(id)?;
        let config = RequestConfig::new().with_retry(insights_retry());
        self.get(&format!("/api/v1/insights/{}", id), config).await
    }

    /// Publish a new insight. Never retried.
    pub async fn create_insight<T: DeserializeOwned>(
        &self,
        request: &CreateInsightRequest,
    ) -> Result<T, ApiError> {
        request.validate()?;
        self.post("/api/v1/insights", request, RequestConfig::new()).await
    }

    /// Replace fields of an existing insight. Never retried.
    pub async fn update_insight<T: DeserializeOwned>(
        &self,
        id: &str,
        changes: &serde_json::Value,
    ) -> Result<T, ApiError> {
        let id = require_id(id)?;
        self.post(&format!("/api/v1/insights/{}", id), changes, RequestConfig::new())
            .await
    }

    pub async fn delete_insight(&self, id: &str) -> Result<(), ApiError> {
        let id = require_id(id)?;
        let _: serde_json::Value = self
            .post(
                &format!("/api/v1/insights/{}/delete", id),
                &serde_json::Value::Null,
                RequestConfig::new(),
            )
            .await?;
        Ok(())
    }
}
