//! Geographic primitives: points, areas, great-circle distance.
//!
//! Geometry here is deliberately simple — axis-aligned bounding boxes,
//! even-odd ray casting, and Haversine distance on a spherical Earth.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = 111_000.0;

/// A geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub alt: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Self { lat, lon, alt }
    }
}

/// Great-circle distance between two points in meters (Haversine).
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Box area in square degrees (coverage bookkeeping, not a geodesic area).
    pub fn area_deg2(&self) -> f64 {
        (self.max_lat - self.min_lat).max(0.0) * (self.max_lon - self.min_lon).max(0.0)
    }
}

/// A polygonal operating area with an altitude band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub polygon: Vec<GeoPoint>,
    #[serde(default)]
    pub min_altitude: f64,
    #[serde(default = "default_max_altitude")]
    pub max_altitude: f64,
}

fn default_max_altitude() -> f64 {
    100.0
}

impl Area {
    pub fn new(polygon: Vec<GeoPoint>, min_altitude: f64, max_altitude: f64) -> Self {
        Self {
            polygon,
            min_altitude,
            max_altitude,
        }
    }

    /// Rectangle spanning the given bounds, inheriting this area's altitude band.
    pub fn rect(&self, min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            polygon: vec![
                GeoPoint::new(min_lat, min_lon, self.min_altitude),
                GeoPoint::new(max_lat, min_lon, self.min_altitude),
                GeoPoint::new(max_lat, max_lon, self.min_altitude),
                GeoPoint::new(min_lat, max_lon, self.min_altitude),
            ],
            min_altitude: self.min_altitude,
            max_altitude: self.max_altitude,
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.polygon.len() < 3 {
            return Err(CoreError::Validation(format!(
                "polygon requires at least 3 vertices, got {}",
                self.polygon.len()
            )));
        }
        for p in &self.polygon {
            if !(-90.0..=90.0).contains(&p.lat) || !(-180.0..=180.0).contains(&p.lon) {
                return Err(CoreError::Validation(format!(
                    "vertex out of range: lat={}, lon={}",
                    p.lat, p.lon
                )));
            }
        }
        if self.max_altitude < self.min_altitude {
            return Err(CoreError::Validation(format!(
                "altitude band inverted: [{}, {}]",
                self.min_altitude, self.max_altitude
            )));
        }
        Ok(())
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let mut bb = BoundingBox {
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
        };
        for p in &self.polygon {
            bb.min_lat = bb.min_lat.min(p.lat);
            bb.max_lat = bb.max_lat.max(p.lat);
            bb.min_lon = bb.min_lon.min(p.lon);
            bb.max_lon = bb.max_lon.max(p.lon);
        }
        bb
    }

    /// Arithmetic mean of the polygon vertices.
    pub fn centroid(&self) -> GeoPoint {
        if self.polygon.is_empty() {
            return GeoPoint::new(0.0, 0.0, 0.0);
        }
        let n = self.polygon.len() as f64;
        GeoPoint::new(
            self.polygon.iter().map(|p| p.lat).sum::<f64>() / n,
            self.polygon.iter().map(|p| p.lon).sum::<f64>() / n,
            self.polygon[0].alt,
        )
    }

    /// Even-odd ray cast: does the polygon contain the point?
    pub fn contains(&self, point: &GeoPoint) -> bool {
        let poly = &self.polygon;
        if poly.len() < 3 {
            return false;
        }

        let mut inside = false;
        let n = poly.len();
        let (mut p1x, mut p1y) = (poly[0].lon, poly[0].lat);
        for i in 1..=n {
            let (p2x, p2y) = (poly[i % n].lon, poly[i % n].lat);
            if point.lat > p1y.min(p2y) && point.lat <= p1y.max(p2y) && point.lon <= p1x.max(p2x) {
                let crosses = if (p1y - p2y).abs() > f64::EPSILON {
                    let xinters = (point.lat - p1y) * (p2x - p1x) / (p2y - p1y) + p1x;
                    (p1x - p2x).abs() < f64::EPSILON || point.lon <= xinters
                } else {
                    (p1x - p2x).abs() < f64::EPSILON
                };
                if crosses {
                    inside = !inside;
                }
            }
            p1x = p2x;
            p1y = p2y;
        }
        inside
    }
}
