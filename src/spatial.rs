//! Viewport queries over geohash-indexed documents.
//!
//! Each document stores a geohash string plus its coordinates. A viewport maps
//! to the longest geohash prefix whose cell contains all of it, that prefix
//! becomes one range query, and the matches are filtered back to the viewport.
//! Small pans and zooms reuse the previous result instead of querying again.

use std::sync::Arc;
use tracing::debug;

use crate::config::SpatialConfig;
use crate::error::Result;
use crate::remote::{Document, Filter, Query, RemoteStore};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLng {
  pub lat: f64,
  pub lng: f64,
}

impl LatLng {
  pub fn new(lat: f64, lng: f64) -> Self {
    Self { lat, lng }
  }

  /// Great-circle distance in kilometres.
  pub fn distance_km(&self, other: &LatLng) -> f64 {
    let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (other.lng - self.lng).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
  }
}

/// Geohash of `point` with `precision` characters.
pub fn geohash(point: LatLng, precision: usize) -> String {
  let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
  let (mut lng_lo, mut lng_hi) = (-180.0_f64, 180.0_f64);
  let mut hash = String::with_capacity(precision);
  let mut bits = 0usize;
  let mut bit_count = 0;
  let mut lng_turn = true;

  while hash.len() < precision {
    let (value, lo, hi) = if lng_turn {
      (point.lng, &mut lng_lo, &mut lng_hi)
    } else {
      (point.lat, &mut lat_lo, &mut lat_hi)
    };
    let mid = (*lo + *hi) / 2.0;
    if value >= mid {
      bits = (bits << 1) | 1;
      *lo = mid;
    } else {
      bits <<= 1;
      *hi = mid;
    }
    lng_turn = !lng_turn;
    bit_count += 1;

    if bit_count == 5 {
      hash.push(BASE32[bits] as char);
      bits = 0;
      bit_count = 0;
    }
  }
  hash
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub south: f64,
  pub west: f64,
  pub north: f64,
  pub east: f64,
}

impl BoundingBox {
  pub fn contains(&self, point: &LatLng) -> bool {
    (self.south..=self.north).contains(&point.lat) && (self.west..=self.east).contains(&point.lng)
  }

  /// Longest geohash, at most `precision` characters, whose cell contains
  /// the whole box. Empty when the box straddles top-level cells.
  pub fn prefix(&self, precision: usize) -> String {
    let south_west = geohash(LatLng::new(self.south, self.west), precision);
    let north_east = geohash(LatLng::new(self.north, self.east), precision);
    south_west
      .chars()
      .zip(north_east.chars())
      .take_while(|(a, b)| a == b)
      .map(|(c, _)| c)
      .collect()
  }
}

/// The visible map area: a center and the span of degrees shown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
  pub center: LatLng,
  pub lat_span: f64,
  pub lng_span: f64,
}

impl Viewport {
  pub fn new(center: LatLng, lat_span: f64, lng_span: f64) -> Self {
    Self {
      center,
      lat_span: lat_span.abs(),
      lng_span: lng_span.abs(),
    }
  }

  /// Clamped to valid coordinates. Viewports crossing the antimeridian are
  /// cut at it.
  pub fn bounds(&self) -> BoundingBox {
    BoundingBox {
      south: (self.center.lat - self.lat_span / 2.0).max(-90.0),
      north: (self.center.lat + self.lat_span / 2.0).min(90.0),
      west: (self.center.lng - self.lng_span / 2.0).max(-180.0),
      east: (self.center.lng + self.lng_span / 2.0).min(180.0),
    }
  }
}

/// A document located on the map.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoEntity {
  pub document: Document,
  pub location: LatLng,
  /// Distance from the viewport center, in kilometres.
  pub distance_km: f64,
}

/// What the last remote query covered.
#[derive(Debug, Clone)]
pub struct SpatialQueryWindow {
  pub viewport: Viewport,
  pub bounds: BoundingBox,
  pub precision: usize,
  pub prefix: String,
  pub results: Vec<GeoEntity>,
}

/// Debounced viewport query over one collection.
pub struct SpatialIndexQuery {
  store: Arc<dyn RemoteStore>,
  collection: String,
  config: SpatialConfig,
  window: Option<SpatialQueryWindow>,
}

impl SpatialIndexQuery {
  pub fn new(store: Arc<dyn RemoteStore>, collection: impl Into<String>, config: SpatialConfig) -> Self {
    Self {
      store,
      collection: collection.into(),
      config,
      window: None,
    }
  }

  /// The window of the last remote query, if any.
  pub fn window(&self) -> Option<&SpatialQueryWindow> {
    self.window.as_ref()
  }

  /// Forget the last window so the next call queries again.
  pub fn invalidate(&mut self) {
    self.window = None;
  }

  /// Entities inside `viewport`, nearest to its center first.
  ///
  /// When `viewport` is within the move and zoom thresholds of the last
  /// queried viewport the previous result is returned without touching the
  /// store.
  pub async fn query_region(&mut self, viewport: Viewport) -> Result<Vec<GeoEntity>> {
    if let Some(window) = &self.window {
      if !self.exceeds_thresholds(&window.viewport, &viewport) {
        debug!("viewport within thresholds, reusing last result");
        return Ok(window.results.clone());
      }
    }

    let bounds = viewport.bounds();
    let prefix = bounds.prefix(self.config.precision());
    if prefix.len() < self.config.precision() {
      debug!(from = self.config.precision(), to = prefix.len(), "coarsened geohash precision");
    }
    debug!(prefix = %prefix, "querying viewport");

    let query = Query::collection(self.collection.clone())
      .filter(Filter::ge(self.config.geohash_field.clone(), prefix.clone()))
      .filter(Filter::lt(self.config.geohash_field.clone(), format!("{}~", prefix)))
      .limit(self.config.scan_limit);
    let documents = self.store.query(&query).await?;

    let mut results: Vec<GeoEntity> = documents
      .into_iter()
      .filter_map(|doc| self.locate(doc, &viewport))
      .filter(|entity| bounds.contains(&entity.location))
      .collect();
    results.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    results.truncate(self.config.result_cap);

    self.window = Some(SpatialQueryWindow {
      viewport,
      bounds,
      precision: prefix.len(),
      prefix,
      results: results.clone(),
    });
    Ok(results)
  }

  fn exceeds_thresholds(&self, last: &Viewport, next: &Viewport) -> bool {
    let relative = |delta: f64, span: f64| if span > 0.0 { delta.abs() / span } else { f64::INFINITY };

    let moved = relative(next.center.lat - last.center.lat, last.lat_span)
      .max(relative(next.center.lng - last.center.lng, last.lng_span));
    let zoomed = relative(next.lat_span - last.lat_span, last.lat_span)
      .max(relative(next.lng_span - last.lng_span, last.lng_span));

    moved > self.config.move_threshold || zoomed > self.config.zoom_threshold
  }

  fn locate(&self, document: Document, viewport: &Viewport) -> Option<GeoEntity> {
    let lat = document.get_f64(&self.config.lat_field).ok()?;
    let lng = document.get_f64(&self.config.lng_field).ok()?;
    let location = LatLng::new(lat, lng);
    Some(GeoEntity {
      distance_km: viewport.center.distance_km(&location),
      location,
      document,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::{Fields, MemoryStore, Operation};
  use serde_json::json;

  #[test]
  fn test_geohash_known_values() {
    assert_eq!(geohash(LatLng::new(57.64911, 10.40744), 11), "u4pruydqqvj");
    assert_eq!(geohash(LatLng::new(42.6, -5.6), 5), "ezs42");
  }

  #[test]
  fn test_prefix_covers_points_inside_box() {
    let viewport = Viewport::new(LatLng::new(48.85, 2.35), 0.01, 0.01);
    let prefix = viewport.bounds().prefix(6);
    assert_eq!(prefix, "u09tv");

    for point in [LatLng::new(48.846, 2.346), LatLng::new(48.854, 2.354), viewport.center] {
      let hash = geohash(point, 9);
      assert!(hash.starts_with(prefix.as_str()), "{}", hash);
    }
  }

  #[test]
  fn test_prefix_is_empty_across_top_level_cells() {
    let straddling = Viewport::new(LatLng::new(0.0, 0.0), 1.0, 1.0);
    assert_eq!(straddling.bounds().prefix(6), "");
  }

  #[test]
  fn test_precision_is_limited_to_geohash_maximum() {
    let config = SpatialConfig {
      precision: 40,
      ..SpatialConfig::default()
    };
    assert_eq!(config.precision(), 12);

    let tiny = Viewport::new(LatLng::new(48.85, 2.35), 1e-9, 1e-9);
    assert!(tiny.bounds().prefix(config.precision()).len() <= 12);
  }

  fn place(store: &MemoryStore, id: &str, lat: f64, lng: f64) {
    let mut fields = Fields::new();
    fields.insert("lat".into(), json!(lat));
    fields.insert("lng".into(), json!(lng));
    fields.insert("geohash".into(), json!(geohash(LatLng::new(lat, lng), 9)));
    store.seed(&format!("places/{}", id), fields);
  }

  fn paris() -> Viewport {
    Viewport::new(LatLng::new(48.85, 2.35), 0.01, 0.01)
  }

  #[tokio::test]
  async fn test_results_are_filtered_sorted_and_capped() {
    let store = Arc::new(MemoryStore::new());
    place(&store, "near", 48.851, 2.351);
    place(&store, "nearest", 48.8501, 2.3501);
    place(&store, "same_cell", 48.853, 2.358);
    place(&store, "outside", 48.90, 2.35);
    place(&store, "elsewhere", -33.86, 151.2);

    let mut spatial = SpatialIndexQuery::new(store.clone(), "places", SpatialConfig::default());
    let found = spatial.query_region(paris()).await.unwrap();
    let ids: Vec<&str> = found.iter().map(|e| e.document.id()).collect();
    assert_eq!(ids, vec!["nearest", "near"]);

    let config = SpatialConfig {
      result_cap: 1,
      ..SpatialConfig::default()
    };
    let mut capped = SpatialIndexQuery::new(store, "places", config);
    let found = capped.query_region(paris()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].document.id(), "nearest");
  }

  #[tokio::test]
  async fn test_small_viewport_changes_do_not_requery() {
    let store = Arc::new(MemoryStore::new());
    place(&store, "a", 48.851, 2.351);
    let mut spatial = SpatialIndexQuery::new(store.clone(), "places", SpatialConfig::default());

    spatial.query_region(paris()).await.unwrap();
    let initial = store.calls(Operation::Query);
    assert_eq!(initial, 1);

    // Pan by 10% of the span, then zoom out by 10%.
    let panned = Viewport::new(LatLng::new(48.851, 2.351), 0.01, 0.01);
    let zoomed = Viewport::new(LatLng::new(48.85, 2.35), 0.011, 0.011);
    assert_eq!(spatial.query_region(panned).await.unwrap().len(), 1);
    spatial.query_region(zoomed).await.unwrap();
    assert_eq!(store.calls(Operation::Query), initial);

    // Pan by half the span.
    let moved = Viewport::new(LatLng::new(48.855, 2.35), 0.01, 0.01);
    spatial.query_region(moved).await.unwrap();
    let window = spatial.window().unwrap();
    assert_eq!(window.viewport, moved);
    assert_eq!(window.prefix, "u09tv");
    assert_eq!(store.calls(Operation::Query), initial + 1);
  }

  #[tokio::test]
  async fn test_invalidate_forces_requery() {
    let store = Arc::new(MemoryStore::new());
    let mut spatial = SpatialIndexQuery::new(store.clone(), "places", SpatialConfig::default());

    spatial.query_region(paris()).await.unwrap();
    let initial = store.calls(Operation::Query);
    spatial.invalidate();
    spatial.query_region(paris()).await.unwrap();
    assert_eq!(store.calls(Operation::Query), 2 * initial);
  }

  #[tokio::test]
  async fn test_large_viewport_coarsens_precision() {
    let store = Arc::new(MemoryStore::new());
    let mut spatial = SpatialIndexQuery::new(store.clone(), "places", SpatialConfig::default());

    let wide = Viewport::new(LatLng::new(48.5, 2.5), 1.0, 1.0);
    spatial.query_region(wide).await.unwrap();

    let window = spatial.window().unwrap();
    assert_eq!(window.precision, 2);
    assert_eq!(window.prefix, "u0");
    assert_eq!(store.calls(Operation::Query), 1);
  }
}
