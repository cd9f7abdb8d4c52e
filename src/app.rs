// Process-wide services with an explicit start/shutdown lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::airports::{AirportIndex, AirportLookup};
use crate::cache::ResponseCache;
use crate::config::AppConfig;
use crate::error::LayoverError;
use crate::layovers::{IntentionStore, IntentionView, LayoverBoard, MemoryIntentionStore};
use crate::model::EnrichedItinerary;
use crate::quota::{QuotaGuard, Scope};
use crate::search::{FlightSearch, SearchRequest};
use crate::upstream::{FlightApi, HttpFlightApi};

pub struct App {
    config: AppConfig,
    cache: Arc<ResponseCache>,
    quota: Arc<QuotaGuard>,
    airports: Arc<dyn AirportLookup>,
    search: FlightSearch,
    board: LayoverBoard,
}

impl App {
    // Load airport data, build the HTTP provider client and wire everything.
    pub async fn start(config: AppConfig) -> Result<Self, LayoverError> {
        let airports = match &config.airports.path {
            Some(path) => AirportIndex::from_path(path)?,
            None => AirportIndex::fetch(&config.airports.url).await?,
        };
        let api = HttpFlightApi::new(config.upstream.clone())?;

        Ok(Self::with_services(
            config,
            Arc::new(api),
            Arc::new(airports),
            Arc::new(MemoryIntentionStore::new()),
        ))
    }

    // Wire the services around already-built collaborators. A configured
    // cache snapshot is restored here; an unreadable one is skipped.
    pub fn with_services(
        config: AppConfig,
        api: Arc<dyn FlightApi>,
        airports: Arc<dyn AirportLookup>,
        intentions: Arc<dyn IntentionStore>,
    ) -> Self {
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        if let Some(path) = config.cache.snapshot_path.as_deref() {
            if path.exists() {
                if let Err(e) = cache.restore(path) {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable cache snapshot");
                }
            }
        }

        let quota = Arc::new(QuotaGuard::new(config.quota.clone()));
        let search = FlightSearch::new(
            api,
            cache.clone(),
            quota.clone(),
            airports.clone(),
            intentions.clone(),
            config.search.clone(),
        );
        let board = LayoverBoard::new(intentions, airports.clone());

        info!("layover services started");
        Self {
            config,
            cache,
            quota,
            airports,
            search,
            board,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn quota(&self) -> &Arc<QuotaGuard> {
        &self.quota
    }

    pub fn airports(&self) -> &Arc<dyn AirportLookup> {
        &self.airports
    }

    pub fn board(&self) -> &LayoverBoard {
        &self.board
    }

    pub async fn search(
        &self,
        user_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<EnrichedItinerary>, LayoverError> {
        self.search.search(user_id, request).await
    }

    // Record a layover intention. Uploads are throttled per user and never
    // wait for capacity.
    pub fn add_intention(
        &self,
        user_id: &str,
        iata: &str,
        arrive: DateTime<Utc>,
        depart: DateTime<Utc>,
    ) -> Result<(), LayoverError> {
        self.quota.try_admit(Scope::Upload, user_id)?;
        self.board.add(user_id, iata, arrive, depart)
    }

    pub fn remove_intention(
        &self,
        user_id: &str,
        iata: &str,
        arrive: DateTime<Utc>,
        depart: DateTime<Utc>,
    ) -> bool {
        self.board.remove(user_id, iata, arrive, depart)
    }

    pub fn intentions(&self, user_id: &str) -> Vec<IntentionView> {
        self.board.list(user_id)
    }

    pub fn matches(&self, user_id: &str, iata: &str) -> Result<Vec<String>, LayoverError> {
        self.board.matches(user_id, iata)
    }

    // Persist the cache when a snapshot path is configured.
    pub fn shutdown(self) -> Result<(), LayoverError> {
        if let Some(path) = self.config.cache.snapshot_path.as_deref() {
            self.cache.snapshot(path)?;
        }
        info!("layover services stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::airports::tests::sample_index;
    use crate::cache::CacheKey;
    use crate::model::ItineraryDetail;
    use crate::upstream::{DetailQuery, SearchQuery, UpstreamError, WireItinerary};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::TimeZone;

    struct Offline;

    #[async_trait]
    impl FlightApi for Offline {
        async fn search(&self, _: &SearchQuery) -> Result<Vec<WireItinerary>, UpstreamError> {
            Err(UpstreamError::NetworkError("offline".to_string()))
        }

        async fn itinerary_details(&self, _: &DetailQuery) -> Result<ItineraryDetail, UpstreamError> {
            Err(UpstreamError::NetworkError("offline".to_string()))
        }
    }

    fn app(config: AppConfig) -> App {
        App::with_services(
            config,
            Arc::new(Offline),
            Arc::new(sample_index()),
            Arc::new(MemoryIntentionStore::new()),
        )
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.cache.snapshot_path = Some(dir.path().join("cache.bin"));

        let first = app(config.clone());
        let key = CacheKey::from_params([("origin", "LAX")]);
        first.cache().put(key.clone(), Bytes::from_static(b"cached"), None);
        first.shutdown().unwrap();

        let second = app(config);
        assert_eq!(second.cache().get(&key), Some(Bytes::from_static(b"cached")));
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, b"nope").unwrap();

        let mut config = AppConfig::default();
        config.cache.snapshot_path = Some(path);

        let app = app(config);
        assert_eq!(app.cache().stats().items_count, 0);
    }

    #[test]
    fn test_uploads_are_throttled_without_waiting() {
        let mut config = AppConfig::default();
        config.quota.upload_per_user.max_requests = 2;
        let app = app(config);

        app.add_intention("alice", "LAX", at(10), at(12)).unwrap();
        app.add_intention("alice", "HNL", at(10), at(12)).unwrap();
        let err = app.add_intention("alice", "NRT", at(10), at(12)).unwrap_err();
        assert!(err.is_rate_limited());

        assert_eq!(app.intentions("alice").len(), 2);
        assert!(app.add_intention("bob", "LAX", at(11), at(13)).is_ok());
        assert_eq!(app.matches("alice", "LAX").unwrap(), vec!["bob".to_string()]);

        assert!(app.remove_intention("bob", "LAX", at(11), at(13)));
        assert!(app.matches("alice", "LAX").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_surfaces_as_upstream_error() {
        let app = app(AppConfig::default());
        let date = chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let request = SearchRequest::new("LAX", "NRT", date, date);

        let err = app.search("alice", &request).await.unwrap_err();
        assert_eq!(err.status_code(), 502);
    }
}
