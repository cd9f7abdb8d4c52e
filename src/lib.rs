// Layover-maximizing flight search: quota-guarded upstream calls, a
// content-addressed response cache, layover scoring and layover matching.

pub mod airports;
pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod layovers;
pub mod model;
pub mod quota;
pub mod scoring;
pub mod search;
pub mod upstream;

// Re-export key types for convenience
pub use airports::{Airport, AirportIndex, AirportLookup};
pub use app::App;
pub use cache::{CacheKey, CacheStats, ResponseCache};
pub use config::AppConfig;
pub use error::LayoverError;
pub use layovers::{IntentionStore, LayoverBoard, LayoverIntention, MemoryIntentionStore};
pub use model::{EnrichedItinerary, Itinerary, ItineraryDetail};
pub use quota::{QuotaGuard, Scope};
pub use search::{FlightSearch, SearchRequest};
pub use upstream::{FlightApi, HttpFlightApi, UpstreamError};
