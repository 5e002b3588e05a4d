//! Reverse geocoding: (lat, lng) -> postal code
//!
//! Two-level strategy: a cheap bbox prefilter against every supported
//! country's static rectangle (candidates sorted ascending by bbox area, so
//! the most geographically specific country is tried first where rectangles
//! overlap), then exact point-in-polygon tests against that country's
//! lazily loaded boundary set.

pub mod countries;
pub mod geocoder;
pub mod store;

pub use countries::{Bbox, CountrySpec, SUPPORTED_COUNTRIES};
pub use geocoder::{GeocodeOutcome, ReverseGeocoder};
pub use store::GeoPolygonStore;
