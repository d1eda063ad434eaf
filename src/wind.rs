//! Inverse-distance-weighted wind field over fleet samples.

use serde::Serialize;
use serde_json::Value;

use crate::fleet::Vehicle;

/// Keeps the weight finite when a grid point sits on a sample.
pub const IDW_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindSample {
    pub lat: f64,
    pub lng: f64,
    pub u: f64,
    pub v: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindVector {
    pub lat: f64,
    pub lng: f64,
    /// Degrees, `atan2(v, u)`.
    pub angle: f64,
    pub magnitude: f64,
}

/// Upper bound on grid points a single field may hold.
pub const MAX_GRID_POINTS: usize = 250_000;

fn steps(min: f64, max: f64, step: f64) -> Option<usize> {
    let span = ((max - min) / step + 1e-9).floor();
    if !span.is_finite() || span >= MAX_GRID_POINTS as f64 {
        return None;
    }
    (span as usize).checked_add(1)
}

struct Bounds {
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
}

fn bounds(samples: &[WindSample]) -> Option<Bounds> {
    let mut b = Bounds {
        min_lat: f64::INFINITY,
        max_lat: f64::NEG_INFINITY,
        min_lng: f64::INFINITY,
        max_lng: f64::NEG_INFINITY,
    };
    for s in samples {
        b.min_lat = b.min_lat.min(s.lat);
        b.max_lat = b.max_lat.max(s.lat);
        b.min_lng = b.min_lng.min(s.lng);
        b.max_lng = b.max_lng.max(s.lng);
    }
    [b.min_lat, b.max_lat, b.min_lng, b.max_lng]
        .iter()
        .all(|c| c.is_finite())
        .then_some(b)
}

/// `(rows, cols)` of the grid `interpolate` would build, or `None` when the
/// input is unusable or the grid exceeds [`MAX_GRID_POINTS`].
pub fn grid_shape(samples: &[WindSample], grid_step: f64) -> Option<(usize, usize)> {
    if samples.is_empty() || !grid_step.is_finite() || grid_step <= 0.0 {
        return None;
    }
    let b = bounds(samples)?;
    let rows = steps(b.min_lat, b.max_lat, grid_step)?;
    let cols = steps(b.min_lng, b.max_lng, grid_step)?;
    rows.checked_mul(cols)
        .filter(|points| *points <= MAX_GRID_POINTS)
        .map(|_| (rows, cols))
}

/// Grid over the samples' bounding box at `grid_step` degrees. Cost is
/// grid points × samples; grids past [`MAX_GRID_POINTS`] yield nothing.
pub fn interpolate(samples: &[WindSample], grid_step: f64) -> Vec<WindVector> {
    let (Some((rows, cols)), Some(b)) = (grid_shape(samples, grid_step), bounds(samples)) else {
        return Vec::new();
    };
    let mut field = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        let lat = b.min_lat + row as f64 * grid_step;
        for col in 0..cols {
            let lng = b.min_lng + col as f64 * grid_step;
            field.push(vector_at(samples, lat, lng));
        }
    }
    field
}

fn vector_at(samples: &[WindSample], lat: f64, lng: f64) -> WindVector {
    let (mut u, mut v, mut total) = (0.0, 0.0, 0.0);
    for s in samples {
        let distance = ((s.lat - lat).powi(2) + (s.lng - lng).powi(2)).sqrt();
        let weight = 1.0 / (distance + IDW_EPSILON);
        u += weight * s.u;
        v += weight * s.v;
        total += weight;
    }
    u /= total;
    v /= total;
    WindVector {
        lat,
        lng,
        angle: v.atan2(u).to_degrees(),
        magnitude: (u * u + v * v).sqrt(),
    }
}

fn number(vehicle: &Vehicle, names: &[&str]) -> Option<f64> {
    names
        .iter()
        .find_map(|name| vehicle.field(name).and_then(Value::as_f64))
        .filter(|n| n.is_finite())
}

/// Samples from vehicles reporting wind components at a usable position.
/// Zero coordinates mean "no fix yet" and are skipped.
pub fn samples_from_fleet(fleet: &[Vehicle]) -> Vec<WindSample> {
    fleet
        .iter()
        .filter_map(|vehicle| {
            let (lat, lng) = vehicle.position()?;
            if lat == 0.0 || lng == 0.0 {
                return None;
            }
            Some(WindSample {
                lat,
                lng,
                u: number(vehicle, &["u-wind", "u"])?,
                v: number(vehicle, &["v-wind", "v"])?,
            })
        })
        .collect()
}

/// `[lat, lng, value]` triples for a scalar field such as `temperature`.
pub fn heat_points(fleet: &[Vehicle], field: &str) -> Vec<[f64; 3]> {
    fleet
        .iter()
        .filter_map(|vehicle| {
            let (lat, lng) = vehicle.position()?;
            let value = number(vehicle, &[field])?;
            Some([lat, lng, value])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn vehicle(id: &str, data: Value) -> Vehicle {
        Vehicle {
            id: id.to_string(),
            data: data.as_object().cloned().unwrap(),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn single_sample_is_reproduced_everywhere() {
        let sample = WindSample {
            lat: 37.86,
            lng: -122.31,
            u: 3.0,
            v: 4.0,
        };
        let field = interpolate(&[sample], 0.01);
        assert_eq!(field.len(), 1);
        for vector in field {
            assert!((vector.magnitude - 5.0).abs() < 1e-9);
            assert!((vector.angle - 4f64.atan2(3.0).to_degrees()).abs() < 1e-9);
        }
    }

    #[test]
    fn grid_covers_the_bounding_box() {
        let samples = [
            WindSample { lat: 0.0, lng: 0.0, u: 1.0, v: 0.0 },
            WindSample { lat: 1.0, lng: 2.0, u: 0.0, v: 1.0 },
        ];
        let field = interpolate(&samples, 0.5);
        assert_eq!(field.len(), 3 * 5);
        assert_eq!((field[0].lat, field[0].lng), (0.0, 0.0));
        let last = field.last().unwrap();
        assert!((last.lat - 1.0).abs() < 1e-9 && (last.lng - 2.0).abs() < 1e-9);

        // Each corner is dominated by the sample sitting on it.
        assert!(field[0].angle.abs() < 1.0);
        assert!((last.angle - 90.0).abs() < 1.0);
    }

    #[test]
    fn tiny_steps_over_a_wide_fleet_are_bounded() {
        let samples = [
            WindSample { lat: 37.0, lng: -122.0, u: 1.0, v: 0.0 },
            WindSample { lat: 38.0, lng: -121.0, u: 0.0, v: 1.0 },
        ];
        assert!(grid_shape(&samples, 1e-12).is_none());
        assert!(interpolate(&samples, 1e-12).is_empty());
        assert!(grid_shape(&samples, 1e-3).is_none());
        assert_eq!(grid_shape(&samples, 0.01), Some((101, 101)));
    }

    #[test]
    fn degenerate_input_yields_nothing() {
        let sample = WindSample { lat: 1.0, lng: 1.0, u: 1.0, v: 1.0 };
        assert!(interpolate(&[], 0.1).is_empty());
        assert!(interpolate(&[sample], 0.0).is_empty());
        assert!(interpolate(&[sample], f64::NAN).is_empty());
    }

    #[test]
    fn fleet_samples_skip_missing_wind_and_zero_fixes() {
        let fleet = vec![
            vehicle("A", json!({"latitude": 37.0, "longitude": -122.0, "u-wind": 1.0, "v-wind": 2.0})),
            vehicle("B", json!({"latitude": 0.0, "longitude": 0.0, "u": 1.0, "v": 2.0})),
            vehicle("C", json!({"latitude": 37.1, "longitude": -122.1})),
            vehicle("D", json!({"lat": 37.2, "lng": -122.2, "u": -1.0, "v": 0.5})),
        ];
        let samples = samples_from_fleet(&fleet);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].u, -1.0);
    }

    #[test]
    fn heat_points_use_the_named_field() {
        let fleet = vec![
            vehicle("A", json!({"latitude": 37.0, "longitude": -122.0, "temperature": 18.0})),
            vehicle("B", json!({"latitude": 37.1, "longitude": -122.1})),
        ];
        assert_eq!(heat_points(&fleet, "temperature"), vec![[37.0, -122.0, 18.0]]);
    }
}
