//! Geodetic to Cartesian conversion for the spatial pair search.

use nalgebra::Vector3;

/// WGS84 semi-major axis in meters.
const WGS84_A: f64 = 6_378_137.0;

/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Converts geodetic coordinates on the WGS84 ellipsoid to Earth-centered
/// Cartesian coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpsTransform;

impl GpsTransform {
    pub fn new() -> Self {
        Self
    }

    /// Convert `[latitude (deg), longitude (deg), altitude (m)]` to ECEF.
    pub fn ell_to_xyz(&self, ell: &Vector3<f64>) -> Vector3<f64> {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        let lat = ell.x.to_radians();
        let lon = ell.y.to_radians();
        let alt = ell.z;

        let sin_lat = lat.sin();
        let cos_lat = lat.cos();
        // Prime vertical radius of curvature at this latitude.
        let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();

        Vector3::new(
            (n + alt) * cos_lat * lon.cos(),
            (n + alt) * cos_lat * lon.sin(),
            (n * (1.0 - e2) + alt) * sin_lat,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equator_prime_meridian() {
        let transform = GpsTransform::new();
        let xyz = transform.ell_to_xyz(&Vector3::new(0.0, 0.0, 0.0));
        assert!((xyz.x - WGS84_A).abs() < 1e-6);
        assert!(xyz.y.abs() < 1e-6);
        assert!(xyz.z.abs() < 1e-6);
    }

    #[test]
    fn test_north_pole() {
        let transform = GpsTransform::new();
        let xyz = transform.ell_to_xyz(&Vector3::new(90.0, 0.0, 0.0));
        // At the pole, x and y vanish and z equals the semi-minor axis.
        let b = WGS84_A * (1.0 - WGS84_F);
        assert!(xyz.x.abs() < 1e-6);
        assert!(xyz.y.abs() < 1e-6);
        assert!((xyz.z - b).abs() < 1e-3);
    }

    #[test]
    fn test_altitude_moves_radially() {
        let transform = GpsTransform::new();
        let ground = transform.ell_to_xyz(&Vector3::new(45.0, 10.0, 0.0));
        let raised = transform.ell_to_xyz(&Vector3::new(45.0, 10.0, 100.0));
        let delta = (raised - ground).norm();
        assert!((delta - 100.0).abs() < 1e-6);
    }
}
