// Flight search provider: wire schema, client trait and the HTTP client.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::model::ItineraryDetail;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("API error: {status_code} - {message}")]
    ApiResponseError { status_code: u16, message: String },

    #[error("Provider reported failure: {0}")]
    Unsuccessful(String),

    #[error("Unparseable payload: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingRequiredField(&'static str),

    #[error("Client error: {0}")]
    ClientError(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        UpstreamError::NetworkError(e.to_string())
    }
}

// Every provider response: a status flag, an optional message and a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub status: Option<bool>,
    pub message: Option<serde_json::Value>,
    pub timestamp: Option<i64>,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    // Payload of a successful response. A false or absent status is a
    // failure even when data is present.
    pub fn into_data(self) -> Result<T, UpstreamError> {
        if self.status != Some(true) {
            let message = match self.message {
                Some(serde_json::Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => "no message".to_string(),
            };
            return Err(UpstreamError::Unsuccessful(message));
        }
        self.data.ok_or(UpstreamError::MissingRequiredField("data"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireStop {
    #[serde(alias = "displayCode")]
    pub display_code: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireCarrier {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLeg {
    pub id: Option<String>,
    pub origin: Option<WireStop>,
    pub destination: Option<WireStop>,
    pub departure: NaiveDateTime,
    pub arrival: NaiveDateTime,
    #[serde(alias = "durationInMinutes")]
    pub duration: Option<i64>,
    pub carriers: Option<Vec<WireCarrier>>,
    pub stops: Option<Vec<WireStop>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePrice {
    #[serde(alias = "amount")]
    pub raw: Option<f64>,
    pub formatted: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireItinerary {
    pub id: String,
    pub price: Option<WirePrice>,
    pub legs: Option<Vec<WireLeg>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub origin: String,
    pub destination: String,
    pub date: NaiveDate,
    pub return_date: NaiveDate,
    pub adults: u32,
    pub wait_time_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailQuery {
    pub itinerary_id: String,
    pub origin: String,
    pub destination: String,
    pub date: NaiveDate,
    pub return_date: NaiveDate,
    pub adults: u32,
}

// The paid provider. Implementations must report a false status or a
// non-2xx response as an error rather than returning partial data.
#[async_trait]
pub trait FlightApi: Send + Sync + 'static {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<WireItinerary>, UpstreamError>;

    async fn itinerary_details(&self, query: &DetailQuery) -> Result<ItineraryDetail, UpstreamError>;
}

pub struct HttpFlightApi {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpFlightApi {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| UpstreamError::ClientError(format!("invalid api key: {}", e)))?;
            headers.insert("X-RapidAPI-Key", value);
        }
        if let Some(host) = &config.api_host {
            let value = HeaderValue::from_str(host)
                .map_err(|e| UpstreamError::ClientError(format!("invalid api host: {}", e)))?;
            headers.insert("X-RapidAPI-Host", value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()
            .map_err(|e| UpstreamError::ClientError(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let url = self.url(path);
        debug!(url = %url, "calling flight provider");

        let response = self.client.get(&url).query(params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "flight provider returned an error status");
            return Err(UpstreamError::ApiResponseError {
                status_code: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let envelope: ApiEnvelope<T> =
            serde_json::from_str(&body).map_err(|e| UpstreamError::ParseError(e.to_string()))?;
        envelope.into_data()
    }
}

#[async_trait]
impl FlightApi for HttpFlightApi {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<WireItinerary>, UpstreamError> {
        let params = [
            ("origin", query.origin.clone()),
            ("destination", query.destination.clone()),
            ("date", query.date.to_string()),
            ("returnDate", query.return_date.to_string()),
            ("adults", query.adults.to_string()),
            ("waitTime", query.wait_time_ms.to_string()),
        ];
        self.get(&self.config.search_path, &params).await
    }

    async fn itinerary_details(&self, query: &DetailQuery) -> Result<ItineraryDetail, UpstreamError> {
        let params = [
            ("itineraryId", query.itinerary_id.clone()),
            ("origin", query.origin.clone()),
            ("destination", query.destination.clone()),
            ("date", query.date.to_string()),
            ("returnDate", query.return_date.to_string()),
            ("adults", query.adults.to_string()),
        ];
        self.get(&self.config.detail_path, &params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> HttpFlightApi {
        HttpFlightApi::new(UpstreamConfig {
            base_url: server.uri(),
            api_key: Some("secret".to_string()),
            ..UpstreamConfig::default()
        })
        .unwrap()
    }

    fn search_query() -> SearchQuery {
        SearchQuery {
            origin: "LAX".to_string(),
            destination: "NRT".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            return_date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
            adults: 1,
            wait_time_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_search_sends_params_and_parses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flights/search"))
            .and(query_param("origin", "LAX"))
            .and(query_param("returnDate", "2024-05-10"))
            .and(query_param("waitTime", "500"))
            .and(header("X-RapidAPI-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                "message": "ok",
                "timestamp": 1700000000,
                "data": [{
                    "id": "it-1",
                    "price": { "raw": 500.0 },
                    "legs": [{
                        "origin": { "displayCode": "LAX" },
                        "destination": { "displayCode": "NRT" },
                        "departure": "2024-05-01T10:00:00",
                        "arrival": "2024-05-02T16:00:00",
                        "stops": [{ "displayCode": "HNL" }]
                    }]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let results = api(&server).search(&search_query()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "it-1");
    }

    #[tokio::test]
    async fn test_false_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flights/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": false,
                "message": [{ "date": "date must be in the future" }],
                "data": []
            })))
            .mount(&server)
            .await;

        let err = api(&server).search(&search_query()).await.unwrap_err();
        match err {
            UpstreamError::Unsuccessful(msg) => assert!(msg.contains("future")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_2xx_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too many requests"))
            .mount(&server)
            .await;

        let err = api(&server).search(&search_query()).await.unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::ApiResponseError { status_code: 429, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_required_field_is_parse_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flights/detail"))
            .and(query_param("itineraryId", "it-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": true,
                // Legs without departure timestamps
                "data": { "legs": [{ "arrival": "2024-05-02T16:00:00" }] }
            })))
            .mount(&server)
            .await;

        let query = DetailQuery {
            itinerary_id: "it-1".to_string(),
            origin: "LAX".to_string(),
            destination: "NRT".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            return_date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
            adults: 2,
        };
        let err = api(&server).itinerary_details(&query).await.unwrap_err();
        assert!(matches!(err, UpstreamError::ParseError(_)));
    }

    #[test]
    fn test_envelope_without_data() {
        let envelope: ApiEnvelope<Vec<WireItinerary>> =
            serde_json::from_str(r#"{"status": true}"#).unwrap();
        assert!(matches!(
            envelope.into_data(),
            Err(UpstreamError::MissingRequiredField("data"))
        ));
    }
}
