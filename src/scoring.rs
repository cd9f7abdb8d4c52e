// Layover scoring.
//
// A leg's score approximates its ground time: the scheduled door-to-door
// duration minus an estimate of the time spent in the air. Air time comes
// from the great-circle distance over every hop and an empirical cruise
// speed that grows with distance.

use tracing::debug;

use crate::airports::AirportLookup;
use crate::model::{Itinerary, Leg};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

// Linear fit through 722 km -> 395 km/h and 5445 km -> 551 km/h
const SPEED_SLOPE: f64 = 0.033029853906415;
const SPEED_INTERCEPT_KMH: f64 = 371.15244547957;

// Haversine distance in km between two `(lat, long)` points in degrees.
pub fn calculate_distance(p1: (f64, f64), p2: (f64, f64)) -> f64 {
    let (lat1, lon1) = p1;
    let (lat2, lon2) = p2;

    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

// Average speed in km/h for a trip of `distance_km`.
pub fn estimated_speed(distance_km: f64) -> f64 {
    SPEED_SLOPE * distance_km + SPEED_INTERCEPT_KMH
}

pub fn estimated_flight_hours(distance_km: f64) -> f64 {
    if distance_km <= 0.0 {
        return 0.0;
    }
    distance_km / estimated_speed(distance_km)
}

// Sum of hop distances along `[origin, *stops, destination]`. Hops with a
// code that does not resolve add nothing.
pub fn leg_distance(leg: &Leg, airports: &dyn AirportLookup) -> f64 {
    let coords: Vec<Option<(f64, f64)>> = leg
        .stop_sequence()
        .into_iter()
        .map(|stop| {
            stop.code
                .as_deref()
                .and_then(|code| airports.by_iata(code))
                .map(|a| a.coords())
        })
        .collect();

    coords
        .windows(2)
        .filter_map(|pair| match (pair[0], pair[1]) {
            (Some(a), Some(b)) => Some(calculate_distance(a, b)),
            _ => None,
        })
        .sum()
}

pub fn leg_layover_hours(leg: &Leg, airports: &dyn AirportLookup) -> f64 {
    let distance = leg_distance(leg, airports);
    leg.total_hours() - estimated_flight_hours(distance)
}

// Fill in per-leg and per-itinerary scores. The itinerary score is the mean
// over its legs; callers only pass validated itineraries with legs.
pub fn score_itinerary(itinerary: &mut Itinerary, airports: &dyn AirportLookup) {
    for leg in itinerary.legs.iter_mut() {
        leg.layover_hours = leg_layover_hours(leg, airports);
    }

    let total: f64 = itinerary.legs.iter().map(|l| l.layover_hours).sum();
    itinerary.layover_hours = total / itinerary.legs.len().max(1) as f64;
}

// Score every itinerary and sort best first. The sort is stable, so ties
// keep the provider's order.
pub fn rank(mut itineraries: Vec<Itinerary>, airports: &dyn AirportLookup) -> Vec<Itinerary> {
    for itinerary in itineraries.iter_mut() {
        score_itinerary(itinerary, airports);
    }
    itineraries.sort_by(|a, b| b.layover_hours.total_cmp(&a.layover_hours));

    debug!(count = itineraries.len(), "ranked itineraries");
    itineraries
}
