// Domain types handed back to callers and stored in the response cache.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::upstream::{WireItinerary, WireLeg, WireStop};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub code: Option<String>,
    pub name: Option<String>,
}

impl From<WireStop> for Stop {
    fn from(stop: WireStop) -> Self {
        Self {
            code: stop.display_code.filter(|c| !c.is_empty()),
            name: stop.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: Option<f64>,
    pub formatted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub origin: Option<Stop>,
    pub destination: Option<Stop>,
    pub departure: NaiveDateTime,
    pub arrival: NaiveDateTime,
    pub duration_minutes: Option<i64>,
    pub carriers: Vec<String>,
    // Intermediate stops, never empty for a surfaced leg.
    pub stops: Vec<Stop>,
    pub layover_hours: f64,
}

impl Leg {
    // None when the leg has no intermediate stop to lay over at
    fn from_wire(leg: WireLeg) -> Option<Self> {
        let stops: Vec<Stop> = leg.stops?.into_iter().map(Stop::from).collect();
        if stops.is_empty() {
            return None;
        }

        Some(Self {
            origin: leg.origin.map(Stop::from),
            destination: leg.destination.map(Stop::from),
            departure: leg.departure,
            arrival: leg.arrival,
            duration_minutes: leg.duration,
            carriers: leg
                .carriers
                .unwrap_or_default()
                .into_iter()
                .filter_map(|c| c.name)
                .collect(),
            stops,
            layover_hours: 0.0,
        })
    }

    // `[origin, *stops, destination]`, skipping absent endpoints.
    pub fn stop_sequence(&self) -> Vec<&Stop> {
        self.origin
            .iter()
            .chain(self.stops.iter())
            .chain(self.destination.iter())
            .collect()
    }

    pub fn total_hours(&self) -> f64 {
        (self.arrival - self.departure).num_seconds() as f64 / 3600.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Itinerary {
    pub id: String,
    pub price: Option<Price>,
    pub legs: Vec<Leg>,
    pub layover_hours: f64,
}

impl Itinerary {
    // Validates a parsed search result. Itineraries without legs, or with
    // any leg lacking intermediate stops, are rejected.
    pub fn from_wire(itinerary: WireItinerary) -> Option<Self> {
        let legs = itinerary
            .legs?
            .into_iter()
            .map(Leg::from_wire)
            .collect::<Option<Vec<_>>>()?;
        if legs.is_empty() {
            return None;
        }

        Some(Self {
            id: itinerary.id,
            price: itinerary.price.map(|p| Price {
                amount: p.raw,
                formatted: p.formatted,
            }),
            legs,
            layover_hours: 0.0,
        })
    }

    // Codes of every intermediate stop, once per occurrence.
    pub fn layover_codes(&self) -> impl Iterator<Item = &str> {
        self.legs
            .iter()
            .flat_map(|leg| leg.stops.iter())
            .filter_map(|stop| stop.code.as_deref())
    }
}

// Itinerary detail payload, kept close to the provider's shape

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailStop {
    pub id: String,
    pub name: String,
    pub display_code: String,
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Carrier {
    pub id: String,
    pub name: Option<String>,
    pub display_code: Option<String>,
    pub logo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    pub origin: DetailStop,
    pub destination: DetailStop,
    pub duration: Option<i64>,
    pub day_change: Option<i64>,
    pub flight_number: Option<String>,
    pub departure: NaiveDateTime,
    pub arrival: NaiveDateTime,
    pub marketing_carrier: Option<Carrier>,
    pub operating_carrier: Option<Carrier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layover {
    pub segment_id: String,
    pub origin: DetailStop,
    pub destination: DetailStop,
    pub duration: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegDetail {
    pub id: Option<String>,
    pub origin: Option<DetailStop>,
    pub destination: Option<DetailStop>,
    pub departure: NaiveDateTime,
    pub arrival: NaiveDateTime,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub layovers: Vec<Layover>,
    pub duration: Option<i64>,
    pub stop_count: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItineraryDetail {
    #[serde(default)]
    pub legs: Vec<LegDetail>,
}

// One result row: the ranked itinerary, its detail and its popularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedItinerary {
    #[serde(flatten)]
    pub itinerary: Itinerary,
    pub detail: ItineraryDetail,
    pub popularity: u64,
}
