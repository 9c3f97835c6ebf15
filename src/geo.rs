//! Geographic coordinates and the delay model.
//!
//! All distances are expressed directly as one-way delay in milliseconds:
//! the haversine arc length in metres maps to delay as `d / 100_000 * 2`.
//! Two points closer than 0.1° on both axes are treated as co-located and
//! contribute zero geographic delay.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Queuing/switching overhead multiplier applied to the geographic delay.
pub const PROPAGATION_COEFF: f64 = 3.0;

/// Fixed per-hop processing budget in milliseconds. The simulated
/// processing delay splits this into a 200 ms base plus bounded noise.
pub const FIXED_DELAY_MS: f64 = 250.0;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoord {
    /// Latitude in degrees, in `[-90, 90]`.
    pub lat: f64,
    /// Longitude in degrees, in `[-180, 180]`.
    pub lon: f64,
}

impl GeoCoord {
    pub fn new(lat: f64, lon: f64) -> Self {
        GeoCoord { lat, lon }
    }

    /// Whether both components are inside their valid ranges.
    pub fn in_range(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// One-way geographic delay between two coordinates, in milliseconds.
///
/// Returns 0 when the points are within 0.1° of each other on both axes.
pub fn haversine_delay_ms(a: GeoCoord, b: GeoCoord) -> f64 {
    if (a.lat - b.lat).abs() < 0.1 && (a.lon - b.lon).abs() < 0.1 {
        return 0.0;
    }

    let lat_a = a.lat.to_radians();
    let lon_a = a.lon.to_radians();
    let lat_b = b.lat.to_radians();
    let lon_b = b.lon.to_radians();

    // Spherical law of cosines; clamp guards float drift outside [-1, 1].
    let c = (lat_a.cos() * lat_b.cos() * (lon_a - lon_b).cos() + lat_a.sin() * lat_b.sin())
        .clamp(-1.0, 1.0);

    let metres = c.acos() * EARTH_RADIUS_M;
    metres / 100_000.0 * 2.0
}

/// Euclidean distance between two equal-length vectors.
pub fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Serialization delay for `data_bytes` over a `bandwidth_bps` link, in ms.
pub fn transmission_delay_ms(data_bytes: f64, bandwidth_bps: f64) -> f64 {
    data_bytes * 8.0 / bandwidth_bps * 1000.0
}

/// Full propagation delay between two nodes: geographic delay scaled by the
/// queuing/switching coefficient, plus transmission delay.
pub fn propagation_delay_ms(
    a: GeoCoord,
    b: GeoCoord,
    bandwidth_bps: f64,
    data_bytes: f64,
) -> f64 {
    haversine_delay_ms(a, b) * PROPAGATION_COEFF + transmission_delay_ms(data_bytes, bandwidth_bps)
}

/// Propagation delay without the queuing coefficient (geographic delay
/// counted once). Used for the source's own first hop by overlays that
/// model the root as directly connected to its relay set.
pub fn direct_propagation_delay_ms(
    a: GeoCoord,
    b: GeoCoord,
    bandwidth_bps: f64,
    data_bytes: f64,
) -> f64 {
    haversine_delay_ms(a, b) + transmission_delay_ms(data_bytes, bandwidth_bps)
}

/// Per-emission processing delay: 200 ms base plus `N(50, 10)` noise
/// clipped to `[0, 100]` ms. Deterministic for a seeded generator.
pub fn processing_delay_ms<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let noise_dist = Normal::new(50.0, 10.0).expect("constant parameters are valid");
    let noise: f64 = noise_dist.sample(rng);
    (FIXED_DELAY_MS - 50.0) + noise.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn colocated_points_have_zero_delay() {
        let a = GeoCoord::new(10.0, 20.0);
        let b = GeoCoord::new(10.05, 20.09);
        assert_eq!(haversine_delay_ms(a, b), 0.0);
    }

    #[test]
    fn antipodal_points_have_maximal_delay() {
        let a = GeoCoord::new(0.0, 0.0);
        let b = GeoCoord::new(0.0, 180.0);
        let d = haversine_delay_ms(a, b);
        // Half the equatorial circumference, as delay.
        let expected = std::f64::consts::PI * EARTH_RADIUS_M / 100_000.0 * 2.0;
        assert!((d - expected).abs() < 1.0, "got {d}");
    }

    #[test]
    fn delay_is_symmetric() {
        let a = GeoCoord::new(48.86, 2.35);
        let b = GeoCoord::new(40.71, -74.0);
        assert_eq!(haversine_delay_ms(a, b), haversine_delay_ms(b, a));
    }

    #[test]
    fn transmission_delay_scales_with_size() {
        // 300 bytes over 33 Mbps ≈ 0.073 ms.
        let d = transmission_delay_ms(300.0, 33_000_000.0);
        assert!((d - 0.0727).abs() < 1e-3, "got {d}");
        assert_eq!(
            transmission_delay_ms(600.0, 33_000_000.0),
            2.0 * d
        );
    }

    #[test]
    fn colocated_propagation_is_transmission_only() {
        let a = GeoCoord::new(0.0, 0.0);
        let b = GeoCoord::new(0.0, 0.05);
        let d = propagation_delay_ms(a, b, 33_000_000.0, 300.0);
        assert_eq!(d, transmission_delay_ms(300.0, 33_000_000.0));
    }

    #[test]
    fn direct_variant_drops_the_coefficient() {
        let a = GeoCoord::new(0.0, 0.0);
        let b = GeoCoord::new(0.0, 10.0);
        let geo = haversine_delay_ms(a, b);
        let tx = transmission_delay_ms(300.0, 33_000_000.0);
        let full = propagation_delay_ms(a, b, 33_000_000.0, 300.0);
        let direct = direct_propagation_delay_ms(a, b, 33_000_000.0, 300.0);
        assert!((full - (3.0 * geo + tx)).abs() < 1e-9);
        assert!((direct - (geo + tx)).abs() < 1e-9);
    }

    #[test]
    fn processing_delay_stays_in_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..1000 {
            let d = processing_delay_ms(&mut rng);
            assert!((200.0..=300.0).contains(&d), "got {d}");
        }
    }

    #[test]
    fn processing_delay_is_deterministic_per_seed() {
        let mut a = ChaCha8Rng::seed_from_u64(42);
        let mut b = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(processing_delay_ms(&mut a), processing_delay_ms(&mut b));
        }
    }

    #[test]
    fn euclidean_matches_pythagoras() {
        assert_eq!(euclidean(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
    }
}
