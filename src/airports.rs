use std::{collections::HashMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_LOOKUP_LIMIT: usize = 10;

#[derive(Error, Debug)]
pub enum AirportError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Airport {
    pub iata: String,
    pub name: String,
    pub city: String,
    pub state: Option<String>,
    pub country: String,
    pub lat: f64,
    pub long: f64,
}

impl Airport {
    pub fn coords(&self) -> (f64, f64) {
        (self.lat, self.long)
    }
}

// Read-only airport reference data.
pub trait AirportLookup: Send + Sync {
    fn by_iata(&self, code: &str) -> Option<Airport>;

    // Case-insensitive substring match on name, code or city.
    fn by_name(&self, query: &str, limit: usize) -> Vec<Airport>;

    // Nearest first by squared lat/long distance. Not geodesic.
    fn by_coords(&self, lat: f64, long: f64, limit: usize) -> Vec<Airport>;
}

// One record of the bulk airports file; coordinates arrive as strings
#[derive(Debug, Deserialize)]
struct BulkAirport {
    code: String,
    lat: serde_json::Value,
    lon: serde_json::Value,
    name: String,
    city: String,
    state: Option<String>,
    country: String,
}

fn parse_coord(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl BulkAirport {
    fn into_airport(self) -> Option<Airport> {
        if self.code.chars().count() != 3 {
            return None;
        }
        let lat = parse_coord(&self.lat)?;
        let long = parse_coord(&self.lon)?;

        Some(Airport {
            iata: self.code.to_uppercase(),
            name: self.name,
            city: self.city,
            state: self.state.filter(|s| !s.is_empty()),
            country: self.country,
            lat,
            long,
        })
    }
}

// In-memory airport store, loaded once and never mutated afterwards.
#[derive(Debug, Default)]
pub struct AirportIndex {
    airports: Vec<Airport>,
    by_code: HashMap<String, usize>,
}

impl AirportIndex {
    pub fn new(records: impl IntoIterator<Item = Airport>) -> Self {
        let mut index = Self::default();
        for airport in records {
            if index.by_code.contains_key(&airport.iata) {
                warn!(iata = %airport.iata, "duplicate airport code ignored");
                continue;
            }
            index.by_code.insert(airport.iata.clone(), index.airports.len());
            index.airports.push(airport);
        }
        index
    }

    pub fn from_json(raw: &str) -> Result<Self, AirportError> {
        let records: Vec<BulkAirport> = serde_json::from_str(raw)?;
        let total = records.len();

        let airports: Vec<Airport> = records
            .into_iter()
            .filter_map(|r| {
                let code = r.code.clone();
                let airport = r.into_airport();
                if airport.is_none() {
                    warn!(code = %code, "skipping malformed airport record");
                }
                airport
            })
            .collect();

        let index = Self::new(airports);
        info!(loaded = index.len(), total, "airport index built");
        Ok(index)
    }

    pub fn from_path(path: &Path) -> Result<Self, AirportError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub async fn fetch(url: &str) -> Result<Self, AirportError> {
        info!(url, "downloading airport data");
        let raw = reqwest::get(url).await?.error_for_status()?.text().await?;
        Self::from_json(&raw)
    }

    pub fn len(&self) -> usize {
        self.airports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.airports.is_empty()
    }
}

impl AirportLookup for AirportIndex {
    fn by_iata(&self, code: &str) -> Option<Airport> {
        self.by_code
            .get(&code.to_uppercase())
            .map(|&i| self.airports[i].clone())
    }

    fn by_name(&self, query: &str, limit: usize) -> Vec<Airport> {
        let needle = query.to_lowercase();
        self.airports
            .iter()
            .filter(|a| {
                a.name.to_lowercase().contains(&needle)
                    || a.iata.to_lowercase().contains(&needle)
                    || a.city.to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    fn by_coords(&self, lat: f64, long: f64, limit: usize) -> Vec<Airport> {
        let mut ranked: Vec<(f64, &Airport)> = self
            .airports
            .iter()
            .map(|a| {
                let d = (a.lat - lat) * (a.lat - lat) + (a.long - long) * (a.long - long);
                (d, a)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        ranked
            .into_iter()
            .take(limit)
            .map(|(_, a)| a.clone())
            .collect()
    }
}
