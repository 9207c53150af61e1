use nalgebra::{Matrix3, Point3};

use crate::config::DEFAULT_RESIDUAL_TOLERANCE;
use crate::ray::{Ray, RaySet};

/// Two rays are considered parallel below this normal-denominator size.
const PARALLEL_EPS: f64 = 1e-12;

/// Combines one pre-grouped ray set per marker into reconstructed 3D
/// points. Grouping (which ray from camera A matches which from camera B)
/// is the caller's concern.
#[derive(Debug, Clone)]
pub struct Triangulator {
    /// Mean perpendicular distance (world units) above which a group is
    /// rejected instead of forced into a bad fix.
    residual_tolerance: f64,
}

impl Default for Triangulator {
    fn default() -> Self {
        Self {
            residual_tolerance: DEFAULT_RESIDUAL_TOLERANCE,
        }
    }
}

impl Triangulator {
    pub fn new(residual_tolerance: f64) -> Self {
        Self { residual_tolerance }
    }

    /// One marker per valid group; divergent or degenerate groups are
    /// omitted, never averaged into a bad point.
    pub fn triangulate(&self, groups: &[RaySet]) -> Vec<Point3<f64>> {
        groups
            .iter()
            .filter_map(|group| self.solve_group(group))
            .collect()
    }

    /// Estimate the point for one correspondence group.
    ///
    /// Two rays use the midpoint of the shortest segment between the skew
    /// lines; three or more solve the least-squares normal equations. The
    /// group is rejected when its mean perpendicular residual exceeds the
    /// tolerance.
    pub fn solve_group(&self, rays: &[Ray]) -> Option<Point3<f64>> {
        let point = match rays.len() {
            0 | 1 => return None,
            2 => skew_midpoint(&rays[0], &rays[1])?,
            _ => least_squares_point(rays)?,
        };

        let residual =
            rays.iter().map(|r| r.distance_to(&point)).sum::<f64>() / rays.len() as f64;
        // written so a NaN residual fails the gate too
        if !(residual <= self.residual_tolerance) {
            log::debug!(
                "ray group diverges, mean residual {:.3} > {:.3}",
                residual,
                self.residual_tolerance
            );
            return None;
        }
        Some(point)
    }
}

/// Midpoint of the shortest segment between two skew lines. `None` for a
/// parallel pair.
pub fn skew_midpoint(a: &Ray, b: &Ray) -> Option<Point3<f64>> {
    let d1 = a.direction.into_inner();
    let d2 = b.direction.into_inner();
    let w0 = a.origin - b.origin;

    // unit directions: d1·d1 = d2·d2 = 1
    let dot = d1.dot(&d2);
    let denom = 1.0 - dot * dot;
    if denom.abs() < PARALLEL_EPS {
        return None;
    }

    let e1 = d1.dot(&w0);
    let e2 = d2.dot(&w0);
    let t1 = (dot * e2 - e1) / denom;
    let t2 = (e2 - dot * e1) / denom;

    let p1 = a.at(t1);
    let p2 = b.at(t2);
    Some(Point3::from((p1.coords + p2.coords) / 2.0))
}

/// Closed-form least-squares point: minimizes the sum of squared
/// perpendicular distances by solving the normal equations built from each
/// ray's projector `I - d·dᵀ`. `None` when the system is singular (all rays
/// parallel).
pub fn least_squares_point(rays: &[Ray]) -> Option<Point3<f64>> {
    let mut lhs = Matrix3::zeros();
    let mut rhs = nalgebra::Vector3::zeros();
    for ray in rays {
        let d = ray.direction.into_inner();
        let projector = Matrix3::identity() - d * d.transpose();
        lhs += projector;
        rhs += projector * ray.origin.coords;
    }
    lhs.lu().solve(&rhs).map(Point3::from)
}
