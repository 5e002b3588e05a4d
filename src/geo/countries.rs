//! Supported-country table: bounding boxes and property schemas
//!
//! Each country's boundary file carries its own property naming (the
//! national statistics offices do not agree on anything), so every entry is
//! tagged with the schema its properties follow. `normalize_properties`
//! dispatches on that tag and returns the engine's uniform `GeoInfo`.

use crate::types::GeoInfo;
use serde_json::Value;

/// Axis-aligned bounding rectangle used as a cheap prefilter before exact
/// polygon containment tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl Bbox {
    pub const fn new(min_lat: f64, min_lng: f64, max_lat: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            min_lng,
            max_lat,
            max_lng,
        }
    }

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }

    /// Degree-squared area, only ever used for relative ordering.
    pub fn area(&self) -> f64 {
        (self.max_lat - self.min_lat) * (self.max_lng - self.min_lng)
    }
}

/// Property naming convention of a country's boundary file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertySchema {
    /// Spain, INE export: COD_POSTAL / NOMBRE / PROVINCIA / CCAA
    Ine,
    /// Portugal, CTT export: CP / LOCALIDADE / DISTRITO / REGIAO
    Ctt,
    /// France, INSEE export: code_postal / nom_commune / departement / region
    Insee,
    /// DACH exports: plz / ort / kreis / land
    Plz,
    /// UK and Ireland: postcode / post_town / county / region
    Postcode,
    /// GeoNames-style fallback: postal_code / place_name / admin_name2 /
    /// admin_name1
    GeoNames,
}

#[derive(Debug, Clone, Copy)]
pub struct CountrySpec {
    /// ISO-2 code
    pub code: &'static str,
    pub name: &'static str,
    pub bbox: Bbox,
    pub schema: PropertySchema,
}

/// The supported set. Bboxes overlap (coasts, enclaves, overseas islands);
/// the geocoder compensates by trying smaller rectangles first.
pub const SUPPORTED_COUNTRIES: &[CountrySpec] = &[
    CountrySpec { code: "ES", name: "Spain", bbox: Bbox::new(27.6, -18.2, 43.9, 4.4), schema: PropertySchema::Ine },
    CountrySpec { code: "PT", name: "Portugal", bbox: Bbox::new(36.9, -9.6, 42.2, -6.2), schema: PropertySchema::Ctt },
    CountrySpec { code: "FR", name: "France", bbox: Bbox::new(41.3, -5.2, 51.1, 9.6), schema: PropertySchema::Insee },
    CountrySpec { code: "DE", name: "Germany", bbox: Bbox::new(47.2, 5.8, 55.1, 15.1), schema: PropertySchema::Plz },
    CountrySpec { code: "IT", name: "Italy", bbox: Bbox::new(36.6, 6.6, 47.1, 18.6), schema: PropertySchema::GeoNames },
    CountrySpec { code: "GB", name: "United Kingdom", bbox: Bbox::new(49.9, -8.7, 60.9, 1.8), schema: PropertySchema::Postcode },
    CountrySpec { code: "IE", name: "Ireland", bbox: Bbox::new(51.4, -10.6, 55.5, -5.9), schema: PropertySchema::Postcode },
    CountrySpec { code: "NL", name: "Netherlands", bbox: Bbox::new(50.7, 3.3, 53.6, 7.3), schema: PropertySchema::GeoNames },
    CountrySpec { code: "BE", name: "Belgium", bbox: Bbox::new(49.5, 2.5, 51.6, 6.4), schema: PropertySchema::GeoNames },
    CountrySpec { code: "LU", name: "Luxembourg", bbox: Bbox::new(49.4, 5.7, 50.2, 6.6), schema: PropertySchema::GeoNames },
    CountrySpec { code: "CH", name: "Switzerland", bbox: Bbox::new(45.8, 5.9, 47.9, 10.5), schema: PropertySchema::Plz },
    CountrySpec { code: "AT", name: "Austria", bbox: Bbox::new(46.3, 9.5, 49.1, 17.2), schema: PropertySchema::Plz },
    CountrySpec { code: "PL", name: "Poland", bbox: Bbox::new(49.0, 14.1, 54.9, 24.2), schema: PropertySchema::GeoNames },
    CountrySpec { code: "CZ", name: "Czechia", bbox: Bbox::new(48.5, 12.0, 51.1, 18.9), schema: PropertySchema::GeoNames },
    CountrySpec { code: "SK", name: "Slovakia", bbox: Bbox::new(47.7, 16.8, 49.7, 22.6), schema: PropertySchema::GeoNames },
    CountrySpec { code: "HU", name: "Hungary", bbox: Bbox::new(45.7, 16.1, 48.6, 22.9), schema: PropertySchema::GeoNames },
    CountrySpec { code: "RO", name: "Romania", bbox: Bbox::new(43.6, 20.2, 48.3, 29.8), schema: PropertySchema::GeoNames },
    CountrySpec { code: "BG", name: "Bulgaria", bbox: Bbox::new(41.2, 22.3, 44.3, 28.7), schema: PropertySchema::GeoNames },
    CountrySpec { code: "GR", name: "Greece", bbox: Bbox::new(34.8, 19.3, 41.8, 28.3), schema: PropertySchema::GeoNames },
    CountrySpec { code: "HR", name: "Croatia", bbox: Bbox::new(42.3, 13.4, 46.6, 19.5), schema: PropertySchema::GeoNames },
    CountrySpec { code: "SI", name: "Slovenia", bbox: Bbox::new(45.4, 13.3, 46.9, 16.6), schema: PropertySchema::GeoNames },
    CountrySpec { code: "DK", name: "Denmark", bbox: Bbox::new(54.5, 8.0, 57.8, 15.2), schema: PropertySchema::GeoNames },
    CountrySpec { code: "SE", name: "Sweden", bbox: Bbox::new(55.3, 10.9, 69.1, 24.2), schema: PropertySchema::GeoNames },
    CountrySpec { code: "NO", name: "Norway", bbox: Bbox::new(57.9, 4.6, 71.2, 31.1), schema: PropertySchema::GeoNames },
];

pub fn spec_for(code: &str) -> Option<&'static CountrySpec> {
    SUPPORTED_COUNTRIES.iter().find(|c| c.code == code)
}

pub fn is_supported(code: &str) -> bool {
    spec_for(code).is_some()
}

/// Postal codes show up as strings or bare numbers depending on the export.
fn prop_string(props: &Value, key: &str) -> Option<String> {
    match props.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn prop_or_empty(props: &Value, key: &str) -> String {
    prop_string(props, key).unwrap_or_default()
}

/// Normalize one boundary feature's raw properties into `GeoInfo`.
///
/// Returns None when the postal code is missing, which drops the feature at
/// load time (a polygon without a postal code is useless to the scorer).
pub fn normalize_properties(spec: &CountrySpec, props: &Value) -> Option<GeoInfo> {
    let (postal, city, province, region) = match spec.schema {
        PropertySchema::Ine => ("COD_POSTAL", "NOMBRE", "PROVINCIA", "CCAA"),
        PropertySchema::Ctt => ("CP", "LOCALIDADE", "DISTRITO", "REGIAO"),
        PropertySchema::Insee => ("code_postal", "nom_commune", "departement", "region"),
        PropertySchema::Plz => ("plz", "ort", "kreis", "land"),
        PropertySchema::Postcode => ("postcode", "post_town", "county", "region"),
        PropertySchema::GeoNames => ("postal_code", "place_name", "admin_name2", "admin_name1"),
    };
    Some(GeoInfo {
        postal_code: prop_string(props, postal)?,
        city: prop_or_empty(props, city),
        province: prop_or_empty(props, province),
        region: prop_or_empty(props, region),
    })
}
