//! Geo partitioning: place name in, ordered zone grid out.
//!
//! The grid always spans the same total distance; a larger grid dimension
//! means finer cells over that same area, not a wider sweep. Center
//! resolution degrades gracefully: static city table, then the geocoder
//! if one is attached, then a hard default. A wrong center still
//! discovers something; an aborted run discovers nothing.

use async_trait::async_trait;
use placerake_harvester::session::Zone;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_GRID_SIZE: usize = 10;
pub const MAX_GRID_SIZE: usize = 55;

/// Total latitude/longitude span of the grid in degrees, about 10 km.
const TOTAL_SPAN_DEG: f64 = 0.09;

/// Used when neither the city table nor the geocoder can place the name.
pub const FALLBACK_COORDS: (f64, f64) = (48.8566, 2.3522);

/// Cities resolvable without a network round trip.
const CITY_TABLE: &[(&str, f64, f64)] = &[
    ("paris", 48.8566, 2.3522),
    ("marseille", 43.2965, 5.3698),
    ("lyon", 45.7640, 4.8357),
    ("toulouse", 43.6047, 1.4442),
    ("nice", 43.7102, 7.2620),
    ("nantes", 47.2184, -1.5536),
    ("montpellier", 43.6108, 3.8767),
    ("strasbourg", 48.5734, 7.7521),
    ("bordeaux", 44.8378, -0.5792),
    ("lille", 50.6292, 3.0573),
    ("rennes", 48.1173, -1.6778),
    ("reims", 49.2583, 4.0317),
    ("toulon", 43.1242, 5.9280),
    ("grenoble", 45.1885, 5.7245),
    ("dijon", 47.3220, 5.0415),
    ("angers", 47.4784, -0.5632),
];

/// Optional external place-name lookup.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, place: &str) -> Option<(f64, f64)>;
}

#[derive(Deserialize)]
struct NominatimHit {
    lat: String,
    lon: String,
}

/// Geocoder backed by the Nominatim search API.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new() -> Self {
        Self::with_base_url("https://nominatim.openstreetmap.org".to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            // Nominatim's usage policy requires an identifying agent
            .user_agent("placerake/0.3")
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }
}

impl Default for NominatimGeocoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn resolve(&self, place: &str) -> Option<(f64, f64)> {
        let url = format!("{}/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("q", place), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!("Geocoder returned {} for {:?}", response.status(), place);
            return None;
        }
        let hits: Vec<NominatimHit> = response.json().await.ok()?;
        let hit = hits.into_iter().next()?;
        let lat: f64 = hit.lat.parse().ok()?;
        let lng: f64 = hit.lon.parse().ok()?;
        Some((lat, lng))
    }
}

pub struct GeoPartitioner {
    grid_size: usize,
    geocoder: Option<Arc<dyn Geocoder>>,
}

impl GeoPartitioner {
    pub fn new(grid_size: usize) -> Self {
        Self {
            grid_size: grid_size.clamp(1, MAX_GRID_SIZE),
            geocoder: None,
        }
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    /// City table, then the geocoder, then [`FALLBACK_COORDS`].
    pub async fn resolve_center(&self, place: &str) -> (f64, f64) {
        if let Some(coords) = lookup_city(place) {
            return coords;
        }
        if let Some(ref geocoder) = self.geocoder {
            if let Some(coords) = geocoder.resolve(place).await {
                debug!("Geocoded {:?} to {:?}", place, coords);
                return coords;
            }
            warn!("Geocoding failed for {:?}, using default center", place);
        } else {
            warn!("Unknown place {:?} and no geocoder, using default center", place);
        }
        FALLBACK_COORDS
    }

    /// Row-major G x G grid of zone centers around `center`. Longitude
    /// steps are widened by 1/cos(lat) so cells stay square on the
    /// ground instead of narrowing away from the equator.
    pub fn grid(&self, center: (f64, f64)) -> Vec<Zone> {
        let g = self.grid_size;
        let cell_lat = TOTAL_SPAN_DEG / g as f64;
        let cell_lng = cell_lat / center.0.to_radians().cos().max(0.01);
        let half = (g as f64 - 1.0) / 2.0;

        let mut zones = Vec::with_capacity(g * g);
        for row in 0..g {
            for col in 0..g {
                zones.push(Zone {
                    center_lat: center.0 + (row as f64 - half) * cell_lat,
                    center_lng: center.1 + (col as f64 - half) * cell_lng,
                    index: zones.len(),
                });
            }
        }
        zones
    }

}

/// First comma-separated component against the city table, lowercased
/// with hyphens and underscores treated as spaces.
fn lookup_city(place: &str) -> Option<(f64, f64)> {
    let key = place
        .split(',')
        .next()?
        .trim()
        .to_lowercase()
        .replace(['-', '_'], " ");
    CITY_TABLE
        .iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, lat, lng)| (*lat, *lng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn grid_covers_fixed_span_at_any_resolution() {
        let center = (45.0, 5.0);
        for g in [1, 4, 10, 25] {
            let zones = GeoPartitioner::new(g).grid(center);
            assert_eq!(zones.len(), g * g);

            let lats: Vec<f64> = zones.iter().map(|z| z.center_lat).collect();
            let span = lats.iter().cloned().fold(f64::MIN, f64::max)
                - lats.iter().cloned().fold(f64::MAX, f64::min);
            let expected = TOTAL_SPAN_DEG * (g as f64 - 1.0) / g as f64;
            assert!((span - expected).abs() < 1e-9, "span wrong for g={g}");
        }
    }

    #[test]
    fn grid_is_centered_and_ordered() {
        let zones = GeoPartitioner::new(3).grid((10.0, 20.0));
        assert_eq!(zones[4].center_lat, 10.0);
        assert_eq!(zones[4].center_lng, 20.0);
        for (i, zone) in zones.iter().enumerate() {
            assert_eq!(zone.index, i);
        }
        // Row-major: first zone is the south-west corner.
        assert!(zones[0].center_lat < zones[8].center_lat);
        assert!(zones[0].center_lng < zones[2].center_lng);
    }

    #[test]
    fn longitude_cells_widen_with_latitude() {
        let zones = GeoPartitioner::new(2).grid((45.0, 5.0));
        let lat_step = zones[2].center_lat - zones[0].center_lat;
        let lng_step = zones[1].center_lng - zones[0].center_lng;
        assert!(lng_step > lat_step);
        let expected = lat_step / 45.0_f64.to_radians().cos();
        assert!((lng_step - expected).abs() < 1e-9);
    }

    #[test]
    fn city_lookup_normalises_separators() {
        assert_eq!(lookup_city("PARIS, France"), Some((48.8566, 2.3522)));
        assert_eq!(lookup_city("saint-nazaire"), None);
    }

    #[test]
    fn grid_size_is_clamped() {
        assert_eq!(GeoPartitioner::new(0).grid_size(), 1);
        assert_eq!(GeoPartitioner::new(500).grid_size(), MAX_GRID_SIZE);
    }

    #[tokio::test]
    async fn city_table_bypasses_geocoder() {
        let partitioner = GeoPartitioner::new(10);
        let center = partitioner.resolve_center("Lyon, France").await;
        assert_eq!(center, (45.7640, 4.8357));
    }

    #[tokio::test]
    async fn unknown_place_without_geocoder_uses_default() {
        let partitioner = GeoPartitioner::new(10);
        let center = partitioner.resolve_center("Atlantis").await;
        assert_eq!(center, FALLBACK_COORDS);
    }

    #[tokio::test]
    async fn geocoder_resolves_unknown_place() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "Brive-la-Gaillarde"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"lat": "45.1585", "lon": "1.5335", "display_name": "Brive"}]"#,
            ))
            .mount(&server)
            .await;

        let geocoder = Arc::new(NominatimGeocoder::with_base_url(server.uri()));
        let partitioner = GeoPartitioner::new(10).with_geocoder(geocoder);
        let center = partitioner.resolve_center("Brive-la-Gaillarde").await;
        assert_eq!(center, (45.1585, 1.5335));
    }

    #[tokio::test]
    async fn geocoder_failure_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let geocoder = Arc::new(NominatimGeocoder::with_base_url(server.uri()));
        let partitioner = GeoPartitioner::new(10).with_geocoder(geocoder);
        let center = partitioner.resolve_center("Atlantis").await;
        assert_eq!(center, FALLBACK_COORDS);
    }
}
