// Layover intentions: storage, airport popularity and traveler matching.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::airports::{Airport, AirportLookup};
use crate::error::LayoverError;
use crate::model::EnrichedItinerary;

// Minimum slack between two windows for travelers to count as a match.
pub const MIN_OVERLAP_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoverIntention {
    pub user_id: String,
    pub iata_code: String,
    pub arrive: DateTime<Utc>,
    pub depart: DateTime<Utc>,
}

impl LayoverIntention {
    pub fn new(
        user_id: impl Into<String>,
        iata_code: impl Into<String>,
        arrive: DateTime<Utc>,
        depart: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            iata_code: iata_code.into().to_uppercase(),
            arrive,
            depart,
        }
    }

    // Whether `other` could plausibly meet the owner of `self`: the other
    // departs at least the threshold after we arrive, or arrives at least
    // the threshold before we depart. Deliberately looser than interval
    // overlap: [12:20, 14:00] still matches [10:00, 12:00] via the first test.
    pub fn could_meet(&self, other: &LayoverIntention) -> bool {
        let threshold = Duration::minutes(MIN_OVERLAP_MINUTES);

        let departs_after_arrival =
            other.depart > self.arrive && other.depart - self.arrive >= threshold;
        let arrives_before_departure =
            other.arrive < self.depart && self.depart - other.arrive >= threshold;

        departs_after_arrival || arrives_before_departure
    }
}

// Persistent record of who plans to be where.
pub trait IntentionStore: Send + Sync {
    // Fails with a conflict when the exact intention already exists.
    fn insert(&self, intention: LayoverIntention) -> Result<(), LayoverError>;

    // Delete by exact match. Returns whether anything was removed.
    fn remove(&self, intention: &LayoverIntention) -> bool;

    fn for_user(&self, user_id: &str) -> Vec<LayoverIntention>;

    fn at_airport(&self, iata_code: &str) -> Vec<LayoverIntention>;

    // Number of stored intentions per airport, for the requested codes only.
    fn count_by_airport(&self, codes: &[&str]) -> HashMap<String, u64>;
}

#[derive(Debug, Default)]
pub struct MemoryIntentionStore {
    rows: RwLock<Vec<LayoverIntention>>,
}

impl MemoryIntentionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IntentionStore for MemoryIntentionStore {
    fn insert(&self, intention: LayoverIntention) -> Result<(), LayoverError> {
        let mut rows = self.rows.write();
        if rows.contains(&intention) {
            return Err(LayoverError::Conflict(format!(
                "layover at {} already recorded for {}",
                intention.iata_code, intention.user_id
            )));
        }
        rows.push(intention);
        Ok(())
    }

    fn remove(&self, intention: &LayoverIntention) -> bool {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|row| row != intention);
        rows.len() != before
    }

    fn for_user(&self, user_id: &str) -> Vec<LayoverIntention> {
        self.rows
            .read()
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect()
    }

    fn at_airport(&self, iata_code: &str) -> Vec<LayoverIntention> {
        self.rows
            .read()
            .iter()
            .filter(|row| row.iata_code == iata_code)
            .cloned()
            .collect()
    }

    fn count_by_airport(&self, codes: &[&str]) -> HashMap<String, u64> {
        let wanted: HashSet<&str> = codes.iter().copied().collect();
        let mut counts = HashMap::new();
        for row in self.rows.read().iter() {
            if wanted.contains(row.iata_code.as_str()) {
                *counts.entry(row.iata_code.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

// Sets `popularity` on every result to the summed interest of each layover
// airport it passes through. One grouped count covers the whole batch; an
// airport visited twice is credited twice.
pub fn annotate_popularity(store: &dyn IntentionStore, results: &mut [EnrichedItinerary]) {
    let codes: Vec<&str> = results
        .iter()
        .flat_map(|r| r.itinerary.layover_codes())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let counts = if codes.is_empty() {
        HashMap::new()
    } else {
        store.count_by_airport(&codes)
    };

    for result in results.iter_mut() {
        result.popularity = result
            .itinerary
            .layover_codes()
            .map(|code| counts.get(code).copied().unwrap_or(0))
            .sum();
    }
}

// Other users whose window at `iata_code` could overlap the user's own.
// Empty when the user has no intention there. Each user appears once, in
// the order their first qualifying intention was stored.
pub fn find_matches(store: &dyn IntentionStore, user_id: &str, iata_code: &str) -> Vec<String> {
    let iata_code = iata_code.to_uppercase();
    let Some(mine) = store
        .for_user(user_id)
        .into_iter()
        .find(|i| i.iata_code == iata_code)
    else {
        return vec![];
    };

    let mut seen = HashSet::new();
    let matches: Vec<String> = store
        .at_airport(&iata_code)
        .into_iter()
        .filter(|other| other.user_id != user_id)
        .filter(|other| mine.could_meet(other))
        .filter_map(|other| seen.insert(other.user_id.clone()).then_some(other.user_id))
        .collect();

    debug!(user_id, iata = %iata_code, matches = matches.len(), "matched layovers");
    matches
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentionView {
    pub iata: String,
    pub airport: Airport,
    pub arrive: DateTime<Utc>,
    pub depart: DateTime<Utc>,
}

// Caller-facing intention operations, validated against airport data.
pub struct LayoverBoard {
    store: Arc<dyn IntentionStore>,
    airports: Arc<dyn AirportLookup>,
}

impl LayoverBoard {
    pub fn new(store: Arc<dyn IntentionStore>, airports: Arc<dyn AirportLookup>) -> Self {
        Self { store, airports }
    }

    fn require_airport(&self, iata: &str) -> Result<Airport, LayoverError> {
        self.airports
            .by_iata(iata)
            .ok_or_else(|| LayoverError::NotFound(format!("airport {}", iata)))
    }

    pub fn add(
        &self,
        user_id: &str,
        iata: &str,
        arrive: DateTime<Utc>,
        depart: DateTime<Utc>,
    ) -> Result<(), LayoverError> {
        let airport = self.require_airport(iata)?;
        self.store
            .insert(LayoverIntention::new(user_id, airport.iata, arrive, depart))?;
        info!(user_id, iata, "layover intention added");
        Ok(())
    }

    pub fn remove(
        &self,
        user_id: &str,
        iata: &str,
        arrive: DateTime<Utc>,
        depart: DateTime<Utc>,
    ) -> bool {
        self.store
            .remove(&LayoverIntention::new(user_id, iata, arrive, depart))
    }

    // The user's intentions with their airport; ones whose airport no longer
    // resolves are left out.
    pub fn list(&self, user_id: &str) -> Vec<IntentionView> {
        self.store
            .for_user(user_id)
            .into_iter()
            .filter_map(|i| {
                let airport = self.airports.by_iata(&i.iata_code)?;
                Some(IntentionView {
                    iata: i.iata_code,
                    airport,
                    arrive: i.arrive,
                    depart: i.depart,
                })
            })
            .collect()
    }

    pub fn matches(&self, user_id: &str, iata: &str) -> Result<Vec<String>, LayoverError> {
        let airport = self.require_airport(iata)?;
        Ok(find_matches(self.store.as_ref(), user_id, &airport.iata))
    }

    pub fn store(&self) -> &Arc<dyn IntentionStore> {
        &self.store
    }
}
