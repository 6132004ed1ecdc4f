//! Polygon decomposition into per-UAV sub-areas.
//!
//! Three methods: equal latitude strips, capability-weighted strips, and a
//! sampled Voronoi assignment. Sub-areas cover the parent polygon's
//! bounding box without requiring disjointness — coverage is a hint, not a
//! contract — and every sub-area inherits the parent's altitude band.

use crate::error::{CoreError, CoreResult};
use crate::types::{haversine_m, Area, GeoPoint};

/// Grid spacing for Voronoi sampling, in degrees (~100 m).
const VORONOI_GRID_STEP_DEG: f64 = 0.001;

/// Guard against division by zero in weighted Voronoi distances.
const WEIGHT_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitMethod {
    Equal,
    CapabilityWeighted,
    Voronoi,
}

/// Per-vehicle inputs to the weighted methods.
#[derive(Debug, Clone)]
pub struct UavPlanInfo {
    pub uav_id: String,
    pub position: Option<GeoPoint>,
    /// Remaining charge fraction in [0, 1].
    pub battery_ratio: f64,
    /// Load fraction in [0, 1].
    pub workload: f64,
}

impl UavPlanInfo {
    /// Split weight: healthier, less loaded vehicles take more area.
    fn weight(&self) -> f64 {
        0.6 * self.battery_ratio + 0.4 * (1.0 - self.workload)
    }
}

/// Split `area` into one sub-area per vehicle.
pub fn split_area(area: &Area, method: SplitMethod, uavs: &[UavPlanInfo]) -> CoreResult<Vec<Area>> {
    area.validate()?;
    if uavs.is_empty() {
        return Err(CoreError::Validation("split requires at least one UAV".into()));
    }
    if uavs.len() == 1 {
        return Ok(vec![area.clone()]);
    }

    match method {
        SplitMethod::Equal => Ok(split_equal(area, uavs.len())),
        SplitMethod::CapabilityWeighted => Ok(split_weighted(area, uavs)),
        SplitMethod::Voronoi => Ok(split_voronoi(area, uavs)),
    }
}

/// N horizontal strips of equal latitude extent over the bounding box.
fn split_equal(area: &Area, parts: usize) -> Vec<Area> {
    let bb = area.bounding_box();
    let lat_step = (bb.max_lat - bb.min_lat) / parts as f64;

    (0..parts)
        .map(|i| {
            let lo = bb.min_lat + i as f64 * lat_step;
            let hi = bb.min_lat + (i + 1) as f64 * lat_step;
            area.rect(lo, hi, bb.min_lon, bb.max_lon)
        })
        .collect()
}

/// Latitude strips proportional to normalised vehicle weights.
fn split_weighted(area: &Area, uavs: &[UavPlanInfo]) -> Vec<Area> {
    let bb = area.bounding_box();
    let lat_range = bb.max_lat - bb.min_lat;

    let mut weights: Vec<f64> = uavs.iter().map(UavPlanInfo::weight).collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        let uniform = 1.0 / weights.len() as f64;
        weights.iter_mut().for_each(|w| *w = uniform);
    } else {
        weights.iter_mut().for_each(|w| *w /= total);
    }

    let mut sub_areas = Vec::with_capacity(uavs.len());
    let mut current_lat = bb.min_lat;
    for weight in weights {
        let hi = current_lat + lat_range * weight;
        sub_areas.push(area.rect(current_lat, hi, bb.min_lon, bb.max_lon));
        current_lat = hi;
    }
    sub_areas
}

/// Sampled Voronoi: walk a regular grid inside the polygon, assign each
/// sample to the vehicle minimising `distance / (weight + eps)`, then
/// return the bounding box of every vehicle's sample group.
///
/// A vehicle with no position defaults to the area centroid so it still
/// receives a cell.
fn split_voronoi(area: &Area, uavs: &[UavPlanInfo]) -> Vec<Area> {
    let bb = area.bounding_box();
    let centroid = area.centroid();

    let seeds: Vec<GeoPoint> = uavs
        .iter()
        .map(|u| u.position.unwrap_or(centroid))
        .collect();
    let weights: Vec<f64> = uavs.iter().map(UavPlanInfo::weight).collect();

    let mut groups: Vec<Vec<GeoPoint>> = vec![Vec::new(); uavs.len()];

    let mut lat = bb.min_lat;
    while lat < bb.max_lat {
        let mut lon = bb.min_lon;
        while lon < bb.max_lon {
            let sample = GeoPoint::new(lat, lon, area.min_altitude);
            if area.contains(&sample) {
                let mut best = 0usize;
                let mut best_cost = f64::INFINITY;
                for (i, seed) in seeds.iter().enumerate() {
                    let cost = haversine_m(&sample, seed) / (weights[i] + WEIGHT_EPSILON);
                    if cost < best_cost {
                        best_cost = cost;
                        best = i;
                    }
                }
                groups[best].push(sample);
            }
            lon += VORONOI_GRID_STEP_DEG;
        }
        lat += VORONOI_GRID_STEP_DEG;
    }

    groups
        .into_iter()
        .map(|points| {
            if points.is_empty() {
                // No samples landed on this vehicle; fall back to the full
                // bounding box so the coverage hint still holds.
                return area.rect(bb.min_lat, bb.max_lat, bb.min_lon, bb.max_lon);
            }
            let min_lat = points.iter().map(|p| p.lat).fold(f64::INFINITY, f64::min);
            let max_lat = points.iter().map(|p| p.lat).fold(f64::NEG_INFINITY, f64::max);
            let min_lon = points.iter().map(|p| p.lon).fold(f64::INFINITY, f64::min);
            let max_lon = points.iter().map(|p| p.lon).fold(f64::NEG_INFINITY, f64::max);
            area.rect(min_lat, max_lat, min_lon, max_lon)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side_deg: f64) -> Area {
        Area::new(
            vec![
                GeoPoint::new(0.0, 0.0, 0.0),
                GeoPoint::new(side_deg, 0.0, 0.0),
                GeoPoint::new(side_deg, side_deg, 0.0),
                GeoPoint::new(0.0, side_deg, 0.0),
            ],
            10.0,
            120.0,
        )
    }

    fn uav(id: &str, battery: f64, workload: f64) -> UavPlanInfo {
        UavPlanInfo {
            uav_id: id.into(),
            position: None,
            battery_ratio: battery,
            workload,
        }
    }

    fn lat_extent(a: &Area) -> f64 {
        let bb = a.bounding_box();
        bb.max_lat - bb.min_lat
    }

    #[test]
    fn test_equal_split_strip_count_and_extent() {
        let area = square(1.0);
        let uavs = vec![uav("a", 1.0, 0.0), uav("b", 1.0, 0.0), uav("c", 1.0, 0.0)];
        let subs = split_area(&area, SplitMethod::Equal, &uavs).unwrap();
        assert_eq!(subs.len(), 3);
        for sub in &subs {
            assert!((lat_extent(sub) - 1.0 / 3.0).abs() < 1e-9);
            assert_eq!(sub.min_altitude, 10.0);
            assert_eq!(sub.max_altitude, 120.0);
        }
    }

    #[test]
    fn test_weighted_split_proportional_to_weights() {
        // Batteries 100/50/25 with zero workload: weights are
        // 0.6*b + 0.4, normalised.
        let area = square(1.0);
        let uavs = vec![uav("a", 1.0, 0.0), uav("b", 0.5, 0.0), uav("c", 0.25, 0.0)];
        let subs = split_area(&area, SplitMethod::CapabilityWeighted, &uavs).unwrap();
        assert_eq!(subs.len(), 3);

        let raw = [0.6 * 1.0 + 0.4, 0.6 * 0.5 + 0.4, 0.6 * 0.25 + 0.4];
        let total: f64 = raw.iter().sum();
        for (sub, w) in subs.iter().zip(raw.iter()) {
            let expected = w / total;
            assert!(
                (lat_extent(sub) - expected).abs() < 1e-9,
                "extent {} vs expected {}",
                lat_extent(sub),
                expected
            );
        }
    }

    #[test]
    fn test_weighted_split_covers_bounding_box() {
        let area = square(1.0);
        let uavs = vec![uav("a", 0.9, 0.1), uav("b", 0.4, 0.7)];
        let subs = split_area(&area, SplitMethod::CapabilityWeighted, &uavs).unwrap();

        let covered: f64 = subs.iter().map(lat_extent).sum();
        assert!((covered - 1.0).abs() < 1e-9);

        // Coverage hint: sum of sub-area boxes >= parent box.
        let parent = area.bounding_box().area_deg2();
        let total: f64 = subs.iter().map(|s| s.bounding_box().area_deg2()).sum();
        assert!(total >= parent - 1e-9);
    }

    #[test]
    fn test_zero_weights_fall_back_to_uniform() {
        let area = square(1.0);
        let uavs = vec![uav("a", 0.0, 1.0), uav("b", 0.0, 1.0)];
        let subs = split_area(&area, SplitMethod::CapabilityWeighted, &uavs).unwrap();
        assert!((lat_extent(&subs[0]) - 0.5).abs() < 1e-9);
        assert!((lat_extent(&subs[1]) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_voronoi_assigns_samples_to_nearest_seed() {
        // Two vehicles at opposite corners of a small square; each should
        // end up with a cell on its own side.
        let area = square(0.01);
        let mut a = uav("a", 1.0, 0.0);
        a.position = Some(GeoPoint::new(0.001, 0.005, 0.0));
        let mut b = uav("b", 1.0, 0.0);
        b.position = Some(GeoPoint::new(0.009, 0.005, 0.0));

        let subs = split_area(&area, SplitMethod::Voronoi, &[a, b]).unwrap();
        assert_eq!(subs.len(), 2);

        let bb_a = subs[0].bounding_box();
        let bb_b = subs[1].bounding_box();
        assert!(bb_a.max_lat <= bb_b.max_lat);
        assert!(bb_a.min_lat <= bb_b.min_lat);
    }

    #[test]
    fn test_single_uav_returns_whole_area() {
        let area = square(1.0);
        let subs = split_area(&area, SplitMethod::Voronoi, &[uav("a", 1.0, 0.0)]).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0], area);
    }

    #[test]
    fn test_empty_uav_list_rejected() {
        let area = square(1.0);
        assert!(split_area(&area, SplitMethod::Equal, &[]).is_err());
    }
}
