// Fetch orchestration: one search request in, a ranked, detail-enriched and
// popularity-annotated page out.
//
// Every upstream call goes cache first, then quota, then network. Detail
// fetches for a page run concurrently but the page order is fixed by score
// before they start, and any failed detail fails the whole page.

use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::airports::AirportLookup;
use crate::cache::{CacheKey, ResponseCache};
use crate::config::SearchConfig;
use crate::error::LayoverError;
use crate::layovers::{annotate_popularity, IntentionStore};
use crate::model::{EnrichedItinerary, Itinerary, ItineraryDetail};
use crate::quota::{QuotaGuard, Scope};
use crate::scoring;
use crate::upstream::{DetailQuery, FlightApi, SearchQuery, WireItinerary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub origin: String,
    pub destination: String,
    pub date: NaiveDate,
    pub return_date: NaiveDate,
    pub adults: u32,
    pub max_wait_ms: u32,
    pub page: usize,
}

impl SearchRequest {
    pub fn new(
        origin: impl Into<String>,
        destination: impl Into<String>,
        date: NaiveDate,
        return_date: NaiveDate,
    ) -> Self {
        Self {
            origin: canonical_code(&origin.into()),
            destination: canonical_code(&destination.into()),
            date,
            return_date,
            adults: 1,
            max_wait_ms: SearchConfig::default().default_wait_ms,
            page: 1,
        }
    }

    pub fn with_page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    pub fn with_adults(mut self, adults: u32) -> Self {
        self.adults = adults;
        self
    }

    pub fn with_max_wait_ms(mut self, max_wait_ms: u32) -> Self {
        self.max_wait_ms = max_wait_ms;
        self
    }

    // Same request with trimmed, uppercased airport codes
    pub fn normalized(&self) -> SearchRequest {
        SearchRequest {
            origin: canonical_code(&self.origin),
            destination: canonical_code(&self.destination),
            ..self.clone()
        }
    }

    // Key for the ranked search result. Adults and wait time do not change
    // which itineraries exist, so they stay out of the key.
    pub fn search_key(&self) -> CacheKey {
        CacheKey::from_params([
            ("origin", canonical_code(&self.origin)),
            ("dest", canonical_code(&self.destination)),
            ("date", self.date.to_string()),
            ("return_date", self.return_date.to_string()),
        ])
    }

    pub fn detail_key(&self, itinerary_id: &str) -> CacheKey {
        CacheKey::from_params([
            ("itinerary_id", itinerary_id.to_string()),
            ("origin", canonical_code(&self.origin)),
            ("dest", canonical_code(&self.destination)),
            ("date", self.date.to_string()),
            ("return_date", self.return_date.to_string()),
        ])
    }

    fn search_query(&self) -> SearchQuery {
        SearchQuery {
            origin: canonical_code(&self.origin),
            destination: canonical_code(&self.destination),
            date: self.date,
            return_date: self.return_date,
            adults: self.adults,
            wait_time_ms: self.max_wait_ms,
        }
    }

    fn detail_query(&self, itinerary_id: &str) -> DetailQuery {
        DetailQuery {
            itinerary_id: itinerary_id.to_string(),
            origin: canonical_code(&self.origin),
            destination: canonical_code(&self.destination),
            date: self.date,
            return_date: self.return_date,
            adults: self.adults,
        }
    }
}

fn canonical_code(code: &str) -> String {
    code.trim().to_uppercase()
}

// Drop itineraries that cannot be scored. Nothing rejected here ever
// reaches the scoring engine.
pub fn filter_scorable(results: Vec<WireItinerary>) -> Vec<Itinerary> {
    let total = results.len();
    let valid: Vec<Itinerary> = results.into_iter().filter_map(Itinerary::from_wire).collect();
    if valid.len() < total {
        debug!(dropped = total - valid.len(), kept = valid.len(), "dropped itineraries without layovers");
    }
    valid
}

// The slice for a 1-based `page`. Pages past the end are empty.
pub fn paginate<T>(items: &[T], page: usize, page_size: usize) -> &[T] {
    let start = page.saturating_sub(1).saturating_mul(page_size);
    if start >= items.len() {
        return &[];
    }
    let end = start.saturating_add(page_size).min(items.len());
    &items[start..end]
}

pub struct FlightSearch {
    api: Arc<dyn FlightApi>,
    cache: Arc<ResponseCache>,
    quota: Arc<QuotaGuard>,
    airports: Arc<dyn AirportLookup>,
    intentions: Arc<dyn IntentionStore>,
    config: SearchConfig,
}

impl FlightSearch {
    pub fn new(
        api: Arc<dyn FlightApi>,
        cache: Arc<ResponseCache>,
        quota: Arc<QuotaGuard>,
        airports: Arc<dyn AirportLookup>,
        intentions: Arc<dyn IntentionStore>,
        config: SearchConfig,
    ) -> Self {
        Self {
            api,
            cache,
            quota,
            airports,
            intentions,
            config,
        }
    }

    // Checks the request and hands back its normalized form
    pub fn validate(&self, request: &SearchRequest) -> Result<SearchRequest, LayoverError> {
        let request = request.normalized();
        for (side, code) in [("origin", &request.origin), ("destination", &request.destination)] {
            if code.chars().count() != 3 {
                return Err(LayoverError::invalid(format!("invalid {} IATA code: {}", side, code)));
            }
            if self.airports.by_iata(code).is_none() {
                return Err(LayoverError::invalid(format!("unknown {} airport: {}", side, code)));
            }
        }

        if request.date > request.return_date {
            return Err(LayoverError::invalid("return date is before departure date"));
        }
        if request.adults == 0 {
            return Err(LayoverError::invalid("at least one adult is required"));
        }
        if request.max_wait_ms > self.config.max_wait_ms {
            return Err(LayoverError::invalid(format!(
                "max wait must be at most {}ms",
                self.config.max_wait_ms
            )));
        }
        if request.page == 0 {
            return Err(LayoverError::invalid("page numbers start at 1"));
        }

        Ok(request)
    }

    // Every valid itinerary for the request, best layover first.
    pub async fn ranked(
        &self,
        user_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<Itinerary>, LayoverError> {
        let key = request.search_key();
        if let Some(cached) = self.cache.get_json::<Vec<Itinerary>>(&key) {
            debug!(origin = %request.origin, dest = %request.destination, "search cache hit");
            return Ok(cached);
        }

        self.quota.admit(Scope::Search, user_id).await?;

        let results = self.api.search(&request.search_query()).await.map_err(|e| {
            error!(
                origin = %request.origin,
                dest = %request.destination,
                date = %request.date,
                error = %e,
                "flight search failed"
            );
            LayoverError::from(e)
        })?;

        let ranked = scoring::rank(filter_scorable(results), self.airports.as_ref());
        self.cache
            .put_json(key, &ranked, Some(self.cache.config().search_ttl()))?;

        info!(
            origin = %request.origin,
            dest = %request.destination,
            itineraries = ranked.len(),
            "flight search fetched"
        );
        Ok(ranked)
    }

    async fn detail(
        &self,
        user_id: &str,
        request: &SearchRequest,
        itinerary_id: &str,
    ) -> Result<ItineraryDetail, LayoverError> {
        let key = request.detail_key(itinerary_id);
        if let Some(cached) = self.cache.get_json::<ItineraryDetail>(&key) {
            return Ok(cached);
        }

        self.quota.admit(Scope::Detail, user_id).await?;

        let detail = self
            .api
            .itinerary_details(&request.detail_query(itinerary_id))
            .await
            .map_err(|e| {
                error!(
                    itinerary_id,
                    origin = %request.origin,
                    dest = %request.destination,
                    error = %e,
                    "itinerary detail fetch failed"
                );
                LayoverError::from(e)
            })?;

        self.cache
            .put_json(key, &detail, Some(self.cache.config().detail_ttl()))?;
        Ok(detail)
    }

    // Run one search for `user_id` and return the requested page.
    pub async fn search(
        &self,
        user_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<EnrichedItinerary>, LayoverError> {
        let normalized = self.validate(request)?;
        let request = &normalized;

        let ranked = self.ranked(user_id, request).await?;
        let page = paginate(&ranked, request.page, self.config.page_size);

        // `buffered` yields in input order and drives every fetch to
        // completion, so a failure never cancels its siblings
        let fetched: Vec<Result<ItineraryDetail, LayoverError>> = stream::iter(page)
            .map(|itinerary| self.detail(user_id, request, &itinerary.id))
            .buffered(self.config.detail_concurrency.max(1))
            .collect()
            .await;

        let details = fetched.into_iter().collect::<Result<Vec<_>, _>>()?;

        let mut results: Vec<EnrichedItinerary> = page
            .iter()
            .cloned()
            .zip(details)
            .map(|(itinerary, detail)| EnrichedItinerary {
                itinerary,
                detail,
                popularity: 0,
            })
            .collect();

        annotate_popularity(self.intentions.as_ref(), &mut results);
        Ok(results)
    }
}
