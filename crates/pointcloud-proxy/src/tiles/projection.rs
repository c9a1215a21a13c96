//! WGS84 to Swiss LV95 (EPSG:2056) transforms.
//!
//! [`SwissObliqueMercator`] is the rigorous route: geocentric datum shift
//! from WGS84 onto the Bessel 1841 ellipsoid, followed by the Swiss oblique
//! conformal cylindrical projection. [`SwissApproximate`] is the published
//! polynomial approximation, accurate to about a metre inside Switzerland
//! and meaningless far outside it.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
use std::fmt::Debug;

/// LV95 false easting
const FALSE_EASTING: f64 = 2_600_000.0;
/// LV95 false northing
const FALSE_NORTHING: f64 = 1_200_000.0;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_E2: f64 = 0.006_694_379_990_14;

const BESSEL_A: f64 = 6_377_397.155;
const BESSEL_E2: f64 = 0.006_674_372_230_614;

/// CH1903 origin minus WGS84 origin, geocentric metres
const DATUM_SHIFT: [f64; 3] = [-674.374, -15.056, -405.346];

const MAX_ITERATIONS: usize = 20;
const CONVERGENCE_RAD: f64 = 1e-12;

/// A forward/inverse transform between WGS84 degrees and projected metres.
///
/// Returning `None` signals the transform is unavailable for that input;
/// callers fall back to another projection.
pub trait Projection: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// `(lat, lon)` in degrees to `(easting, northing)` in metres.
    fn forward(&self, lat: f64, lon: f64) -> Option<(f64, f64)>;

    /// `(easting, northing)` in metres to `(lat, lon)` in degrees.
    fn inverse(&self, easting: f64, northing: f64) -> Option<(f64, f64)>;
}

/// Rigorous Swiss oblique Mercator on Bessel 1841 with a WGS84 datum shift.
#[derive(Debug, Clone)]
pub struct SwissObliqueMercator {
    e: f64,
    lambda0: f64,
    alpha: f64,
    b0: f64,
    k: f64,
    r: f64,
}

impl Default for SwissObliqueMercator {
    fn default() -> Self {
        Self::new()
    }
}

impl SwissObliqueMercator {
    pub fn new() -> Self {
        // Old observatory of Bern, Bessel coordinates
        let phi0 = dms_to_rad(46.0, 57.0, 8.66);
        let lambda0 = dms_to_rad(7.0, 26.0, 22.50);

        let e2 = BESSEL_E2;
        let e = e2.sqrt();
        let sin_phi0 = phi0.sin();

        let r = BESSEL_A * (1.0 - e2).sqrt() / (1.0 - e2 * sin_phi0 * sin_phi0);
        let alpha = (1.0 + e2 / (1.0 - e2) * phi0.cos().powi(4)).sqrt();
        let b0 = (sin_phi0 / alpha).asin();
        let k = (FRAC_PI_4 + b0 / 2.0).tan().ln() - alpha * (FRAC_PI_4 + phi0 / 2.0).tan().ln()
            + alpha * e / 2.0 * ((1.0 + e * sin_phi0) / (1.0 - e * sin_phi0)).ln();

        Self {
            e,
            lambda0,
            alpha,
            b0,
            k,
            r,
        }
    }

    /// Bessel geodetic radians to LV95 metres.
    fn project_bessel(&self, phi: f64, lambda: f64) -> (f64, f64) {
        let e = self.e;
        let sin_phi = phi.sin();

        let s = self.alpha * (FRAC_PI_4 + phi / 2.0).tan().ln()
            - self.alpha * e / 2.0 * ((1.0 + e * sin_phi) / (1.0 - e * sin_phi)).ln()
            + self.k;
        let b = 2.0 * (s.exp().atan() - FRAC_PI_4);
        let l = self.alpha * (lambda - self.lambda0);

        let l_bar = (l.sin() / (self.b0.sin() * b.tan() + self.b0.cos() * l.cos())).atan();
        let b_bar = (self.b0.cos() * b.sin() - self.b0.sin() * b.cos() * l.cos()).asin();

        let y = self.r * l_bar;
        let x = self.r / 2.0 * ((1.0 + b_bar.sin()) / (1.0 - b_bar.sin())).ln();
        (y + FALSE_EASTING, x + FALSE_NORTHING)
    }

    /// LV95 metres to Bessel geodetic radians.
    fn unproject_bessel(&self, easting: f64, northing: f64) -> Option<(f64, f64)> {
        let y = easting - FALSE_EASTING;
        let x = northing - FALSE_NORTHING;

        let l_bar = y / self.r;
        let b_bar = 2.0 * ((x / self.r).exp().atan() - FRAC_PI_4);

        let b = (self.b0.cos() * b_bar.sin() + self.b0.sin() * b_bar.cos() * l_bar.cos()).asin();
        let l = (l_bar.sin() / (self.b0.cos() * l_bar.cos() - self.b0.sin() * b_bar.tan())).atan();

        let lambda = self.lambda0 + l / self.alpha;

        let e = self.e;
        let base = ((FRAC_PI_4 + b / 2.0).tan().ln() - self.k) / self.alpha;
        let mut phi = b;
        for _ in 0..MAX_ITERATIONS {
            let s = base + e * (FRAC_PI_4 + (e * phi.sin()).asin() / 2.0).tan().ln();
            let next = 2.0 * s.exp().atan() - FRAC_PI_2;
            if (next - phi).abs() < CONVERGENCE_RAD {
                return finite_pair(next, lambda);
            }
            phi = next;
        }
        None
    }
}

impl Projection for SwissObliqueMercator {
    fn name(&self) -> &'static str {
        "lv95-rigorous"
    }

    fn forward(&self, lat: f64, lon: f64) -> Option<(f64, f64)> {
        if !lat.is_finite() || !lon.is_finite() || lat.abs() >= 90.0 {
            return None;
        }
        let wgs = geodetic_to_ecef(lat.to_radians(), lon.to_radians(), WGS84_A, WGS84_E2);
        let ch = [
            wgs[0] + DATUM_SHIFT[0],
            wgs[1] + DATUM_SHIFT[1],
            wgs[2] + DATUM_SHIFT[2],
        ];
        let (phi, lambda) = ecef_to_geodetic(ch, BESSEL_A, BESSEL_E2)?;
        let (e, n) = self.project_bessel(phi, lambda);
        finite_pair(e, n)
    }

    fn inverse(&self, easting: f64, northing: f64) -> Option<(f64, f64)> {
        if !easting.is_finite() || !northing.is_finite() {
            return None;
        }
        let (phi, lambda) = self.unproject_bessel(easting, northing)?;
        let ch = geodetic_to_ecef(phi, lambda, BESSEL_A, BESSEL_E2);
        let wgs = [
            ch[0] - DATUM_SHIFT[0],
            ch[1] - DATUM_SHIFT[1],
            ch[2] - DATUM_SHIFT[2],
        ];
        let (lat, lon) = ecef_to_geodetic(wgs, WGS84_A, WGS84_E2)?;
        finite_pair(lat.to_degrees(), lon.to_degrees())
    }
}

/// swisstopo's closed-form approximation, valid only around Switzerland.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwissApproximate;

impl Projection for SwissApproximate {
    fn name(&self) -> &'static str {
        "lv95-approximate"
    }

    fn forward(&self, lat: f64, lon: f64) -> Option<(f64, f64)> {
        // Auxiliary values in units of 10000 arc seconds relative to Bern
        let phi = (lat * 3600.0 - 169_028.66) / 10_000.0;
        let lambda = (lon * 3600.0 - 26_782.5) / 10_000.0;

        let e = 2_600_072.37 + 211_455.93 * lambda
            - 10_938.51 * lambda * phi
            - 0.36 * lambda * phi.powi(2)
            - 44.54 * lambda.powi(3);
        let n = 1_200_147.07 + 308_807.95 * phi + 3_745.25 * lambda.powi(2) + 76.63 * phi.powi(2)
            - 194.56 * lambda.powi(2) * phi
            + 119.79 * phi.powi(3);
        finite_pair(e, n)
    }

    fn inverse(&self, easting: f64, northing: f64) -> Option<(f64, f64)> {
        let y = (easting - FALSE_EASTING) / 1_000_000.0;
        let x = (northing - FALSE_NORTHING) / 1_000_000.0;

        let lambda = 2.677_909_4 + 4.728_982 * y + 0.791_484 * y * x + 0.130_6 * y * x.powi(2)
            - 0.043_6 * y.powi(3);
        let phi = 16.902_389_2 + 3.238_272 * x
            - 0.270_978 * y.powi(2)
            - 0.002_528 * x.powi(2)
            - 0.044_7 * y.powi(2) * x
            - 0.014_0 * x.powi(3);

        // Results are in units of 10000 arc seconds
        finite_pair(phi * 100.0 / 36.0, lambda * 100.0 / 36.0)
    }
}

fn dms_to_rad(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    (degrees + minutes / 60.0 + seconds / 3600.0).to_radians()
}

fn finite_pair(a: f64, b: f64) -> Option<(f64, f64)> {
    (a.is_finite() && b.is_finite()).then_some((a, b))
}

/// Geodetic radians (height zero) to geocentric metres.
fn geodetic_to_ecef(phi: f64, lambda: f64, a: f64, e2: f64) -> [f64; 3] {
    let sin_phi = phi.sin();
    let n = a / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    [
        n * phi.cos() * lambda.cos(),
        n * phi.cos() * lambda.sin(),
        n * (1.0 - e2) * sin_phi,
    ]
}

/// Geocentric metres to geodetic radians, discarding the height.
fn ecef_to_geodetic(xyz: [f64; 3], a: f64, e2: f64) -> Option<(f64, f64)> {
    let [x, y, z] = xyz;
    let p = (x * x + y * y).sqrt();
    let lambda = y.atan2(x);

    let mut phi = z.atan2(p * (1.0 - e2));
    for _ in 0..MAX_ITERATIONS {
        let sin_phi = phi.sin();
        let n = a / (1.0 - e2 * sin_phi * sin_phi).sqrt();
        let h = p / phi.cos() - n;
        let next = z.atan2(p * (1.0 - e2 * n / (n + h)));
        if (next - phi).abs() < CONVERGENCE_RAD {
            return finite_pair(next, lambda);
        }
        phi = next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn dms(d: f64, m: f64, s: f64) -> f64 {
        d + m / 60.0 + s / 3600.0
    }

    /// Reference point from swisstopo's published worked example.
    fn reference_point() -> (f64, f64) {
        (dms(46.0, 2.0, 38.87), dms(8.0, 43.0, 49.79))
    }

    #[rstest]
    #[case::rigorous(Box::new(SwissObliqueMercator::new()) as Box<dyn Projection>)]
    #[case::approximate(Box::new(SwissApproximate) as Box<dyn Projection>)]
    fn test_forward_matches_reference(#[case] projection: Box<dyn Projection>) {
        let (lat, lon) = reference_point();
        let (e, n) = projection.forward(lat, lon).unwrap();
        assert!((e - 2_700_000.0).abs() < 2.0, "{}: e = {e}", projection.name());
        assert!((n - 1_100_000.0).abs() < 2.0, "{}: n = {n}", projection.name());
    }

    #[test]
    fn test_rigorous_origin_maps_near_false_origin() {
        // The projection centre is defined on Bessel; WGS84 coordinates of
        // the old Bern observatory differ by a few arc seconds.
        let (e, n) = SwissObliqueMercator::new()
            .forward(dms(46.0, 57.0, 4.97), dms(7.0, 26.0, 19.07))
            .unwrap();
        assert!((e - FALSE_EASTING).abs() < 50.0, "e = {e}");
        assert!((n - FALSE_NORTHING).abs() < 50.0, "n = {n}");
    }

    #[rstest]
    #[case::rigorous(Box::new(SwissObliqueMercator::new()) as Box<dyn Projection>, 1e-7)]
    #[case::approximate(Box::new(SwissApproximate) as Box<dyn Projection>, 5e-5)]
    fn test_round_trip(#[case] projection: Box<dyn Projection>, #[case] tolerance: f64) {
        for (lat, lon) in [(46.95, 7.44), (45.9, 6.0), (47.8, 10.5), (46.5, 8.9)] {
            let (e, n) = projection.forward(lat, lon).unwrap();
            let (lat2, lon2) = projection.inverse(e, n).unwrap();
            assert!((lat - lat2).abs() < tolerance, "{}: lat {lat} vs {lat2}", projection.name());
            assert!((lon - lon2).abs() < tolerance, "{}: lon {lon} vs {lon2}", projection.name());
        }
    }

    #[test]
    fn test_projections_agree_within_region() {
        let precise = SwissObliqueMercator::new();
        for (lat, lon) in [(46.95, 7.44), (46.2, 6.15), (47.4, 8.55), (46.0, 8.95)] {
            let (e1, n1) = precise.forward(lat, lon).unwrap();
            let (e2, n2) = SwissApproximate.forward(lat, lon).unwrap();
            assert!((e1 - e2).abs() < 5.0 && (n1 - n2).abs() < 5.0);
        }
    }

    #[test]
    fn test_rigorous_rejects_invalid_input() {
        let precise = SwissObliqueMercator::new();
        assert!(precise.forward(f64::NAN, 7.0).is_none());
        assert!(precise.forward(90.0, 7.0).is_none());
        assert!(precise.inverse(f64::INFINITY, 1_200_000.0).is_none());
    }
}
