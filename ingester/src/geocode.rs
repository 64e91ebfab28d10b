//! Offline reverse geocoding: (lat, lon) → country + subdivision.
//!
//! The pipeline only needs coarse, topic-safe location codes, so the bundled
//! implementation is a nearest-centroid lookup over an embedded gazetteer of
//! first-level subdivisions. The trait is the seam — the dataset behind it is
//! replaceable without touching the correlation engine, and tests swap in a
//! fixed-answer fake.

/// Raw geocode result: ISO 3166-1 alpha-2 country code plus the subdivision's
/// human name (e.g. `("US", "New Jersey")`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoRef {
    pub country: String,
    pub subdivision: String,
}

pub trait ReverseGeocode: Send + Sync {
    fn reverse(&self, lat: f64, lon: f64) -> Option<GeoRef>;
}

/// Lowercase a topic segment, map spaces to `-`, strip apostrophes.
pub fn sanitize_segment(name: &str) -> String {
    name.to_lowercase().replace(' ', "-").replace('\'', "")
}

/// Collapse a geocode result to the `(country_code, subdivision_code)` pair
/// used in rows and topics; any failure degrades to `"unknown"` for both.
pub fn topic_codes(geo: Option<GeoRef>) -> (String, String) {
    match geo {
        Some(g) => (g.country.to_lowercase(), sanitize_segment(&g.subdivision)),
        None => ("unknown".to_string(), "unknown".to_string()),
    }
}

struct GazetteerEntry {
    lat: f64,
    lon: f64,
    country: &'static str,
    subdivision: &'static str,
}

/// First-level subdivision centroids for the regions the mesh network covers
/// today. Coarse on purpose: readings are attributed, not mapped.
const GAZETTEER: &[GazetteerEntry] = &[
    // United States
    GazetteerEntry { lat: 36.78, lon: -119.42, country: "US", subdivision: "California" },
    GazetteerEntry { lat: 42.90, lon: -75.50, country: "US", subdivision: "New York" },
    GazetteerEntry { lat: 40.06, lon: -74.41, country: "US", subdivision: "New Jersey" },
    GazetteerEntry { lat: 31.00, lon: -99.00, country: "US", subdivision: "Texas" },
    GazetteerEntry { lat: 47.40, lon: -120.50, country: "US", subdivision: "Washington" },
    GazetteerEntry { lat: 39.00, lon: -105.50, country: "US", subdivision: "Colorado" },
    GazetteerEntry { lat: 27.99, lon: -81.76, country: "US", subdivision: "Florida" },
    GazetteerEntry { lat: 40.00, lon: -89.00, country: "US", subdivision: "Illinois" },
    GazetteerEntry { lat: 42.26, lon: -71.81, country: "US", subdivision: "Massachusetts" },
    GazetteerEntry { lat: 43.93, lon: -120.56, country: "US", subdivision: "Oregon" },
    GazetteerEntry { lat: 34.17, lon: -111.93, country: "US", subdivision: "Arizona" },
    GazetteerEntry { lat: 32.64, lon: -83.44, country: "US", subdivision: "Georgia" },
    GazetteerEntry { lat: 40.88, lon: -77.80, country: "US", subdivision: "Pennsylvania" },
    GazetteerEntry { lat: 44.35, lon: -85.41, country: "US", subdivision: "Michigan" },
    GazetteerEntry { lat: 35.56, lon: -79.39, country: "US", subdivision: "North Carolina" },
    GazetteerEntry { lat: 37.52, lon: -78.85, country: "US", subdivision: "Virginia" },
    GazetteerEntry { lat: 44.50, lon: -89.50, country: "US", subdivision: "Wisconsin" },
    GazetteerEntry { lat: 46.35, lon: -94.20, country: "US", subdivision: "Minnesota" },
    GazetteerEntry { lat: 39.33, lon: -111.68, country: "US", subdivision: "Utah" },
    GazetteerEntry { lat: 21.09, lon: -157.50, country: "US", subdivision: "Hawaii" },
    // Canada
    GazetteerEntry { lat: 50.00, lon: -85.00, country: "CA", subdivision: "Ontario" },
    GazetteerEntry { lat: 53.73, lon: -127.65, country: "CA", subdivision: "British Columbia" },
    GazetteerEntry { lat: 52.94, lon: -73.55, country: "CA", subdivision: "Quebec" },
    GazetteerEntry { lat: 53.93, lon: -116.58, country: "CA", subdivision: "Alberta" },
    // Europe
    GazetteerEntry { lat: 52.36, lon: -1.17, country: "GB", subdivision: "England" },
    GazetteerEntry { lat: 56.49, lon: -4.20, country: "GB", subdivision: "Scotland" },
    GazetteerEntry { lat: 48.79, lon: 11.50, country: "DE", subdivision: "Bavaria" },
    GazetteerEntry { lat: 51.43, lon: 7.66, country: "DE", subdivision: "North Rhine-Westphalia" },
    GazetteerEntry { lat: 52.52, lon: 13.40, country: "DE", subdivision: "Berlin" },
    GazetteerEntry { lat: 48.68, lon: 9.19, country: "DE", subdivision: "Baden-Wurttemberg" },
    GazetteerEntry { lat: 48.85, lon: 2.35, country: "FR", subdivision: "Ile-de-France" },
    GazetteerEntry { lat: 45.75, lon: 4.85, country: "FR", subdivision: "Auvergne-Rhone-Alpes" },
    GazetteerEntry { lat: 52.13, lon: 5.29, country: "NL", subdivision: "Utrecht" },
    GazetteerEntry { lat: 52.23, lon: 21.01, country: "PL", subdivision: "Masovian" },
    GazetteerEntry { lat: 50.06, lon: 19.94, country: "PL", subdivision: "Lesser Poland" },
    GazetteerEntry { lat: 50.08, lon: 14.44, country: "CZ", subdivision: "Prague" },
    GazetteerEntry { lat: 50.45, lon: 30.52, country: "UA", subdivision: "Kyiv" },
    GazetteerEntry { lat: 40.42, lon: -3.70, country: "ES", subdivision: "Madrid" },
    GazetteerEntry { lat: 45.46, lon: 9.19, country: "IT", subdivision: "Lombardy" },
    GazetteerEntry { lat: 47.38, lon: 8.54, country: "CH", subdivision: "Zurich" },
    GazetteerEntry { lat: 48.21, lon: 16.37, country: "AT", subdivision: "Vienna" },
    GazetteerEntry { lat: 59.33, lon: 18.07, country: "SE", subdivision: "Stockholm" },
    GazetteerEntry { lat: 59.91, lon: 10.75, country: "NO", subdivision: "Oslo" },
    GazetteerEntry { lat: 60.17, lon: 24.94, country: "FI", subdivision: "Uusimaa" },
    // Oceania
    GazetteerEntry { lat: -32.00, lon: 147.00, country: "AU", subdivision: "New South Wales" },
    GazetteerEntry { lat: -37.00, lon: 144.00, country: "AU", subdivision: "Victoria" },
    GazetteerEntry { lat: -22.00, lon: 144.00, country: "AU", subdivision: "Queensland" },
    GazetteerEntry { lat: -26.00, lon: 121.00, country: "AU", subdivision: "Western Australia" },
    GazetteerEntry { lat: -36.85, lon: 174.76, country: "NZ", subdivision: "Auckland" },
    GazetteerEntry { lat: -41.29, lon: 174.78, country: "NZ", subdivision: "Wellington" },
    GazetteerEntry { lat: -43.53, lon: 172.64, country: "NZ", subdivision: "Canterbury" },
    GazetteerEntry { lat: -39.49, lon: 176.91, country: "NZ", subdivision: "Hawke's Bay" },
    // Asia / Americas / Africa
    GazetteerEntry { lat: 35.68, lon: 139.69, country: "JP", subdivision: "Tokyo" },
    GazetteerEntry { lat: 25.03, lon: 121.56, country: "TW", subdivision: "Taipei" },
    GazetteerEntry { lat: 1.35, lon: 103.82, country: "SG", subdivision: "Singapore" },
    GazetteerEntry { lat: 3.14, lon: 101.69, country: "MY", subdivision: "Kuala Lumpur" },
    GazetteerEntry { lat: -23.55, lon: -46.63, country: "BR", subdivision: "Sao Paulo" },
    GazetteerEntry { lat: 19.43, lon: -99.13, country: "MX", subdivision: "Mexico City" },
    GazetteerEntry { lat: -33.92, lon: 18.42, country: "ZA", subdivision: "Western Cape" },
    GazetteerEntry { lat: 12.97, lon: 77.59, country: "IN", subdivision: "Karnataka" },
];

/// Nearest-centroid geocoder over the embedded gazetteer.
pub struct OfflineGeocoder;

impl OfflineGeocoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OfflineGeocoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseGeocode for OfflineGeocoder {
    fn reverse(&self, lat: f64, lon: f64) -> Option<GeoRef> {
        if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
            return None;
        }
        let best = GAZETTEER.iter().min_by(|a, b| {
            let da = centroid_distance_sq(lat, lon, a);
            let db = centroid_distance_sq(lat, lon, b);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })?;
        Some(GeoRef {
            country: best.country.to_string(),
            subdivision: best.subdivision.to_string(),
        })
    }
}

/// Squared equirectangular distance, good enough for picking a centroid.
fn centroid_distance_sq(lat: f64, lon: f64, entry: &GazetteerEntry) -> f64 {
    let dlat = lat - entry.lat;
    // Shorter of the two ways around the antimeridian
    let mut dlon = (lon - entry.lon).abs() % 360.0;
    if dlon > 180.0 {
        dlon = 360.0 - dlon;
    }
    let dlon = dlon * ((lat.to_radians() + entry.lat.to_radians()) / 2.0).cos();
    dlat * dlat + dlon * dlon
}
