use nalgebra::{Point3, Unit, Vector3};

/// One sight line from a camera through a detected marker: "the marker lies
/// somewhere along this line". Produced fresh every tick, no cross-tick
/// identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Ray {
    /// Camera position, world space.
    pub origin: Point3<f64>,
    /// Unit direction, world space.
    pub direction: Unit<Vector3<f64>>,
}

impl Ray {
    pub fn new(origin: Point3<f64>, direction: Vector3<f64>) -> Self {
        Self {
            origin,
            direction: Unit::new_normalize(direction),
        }
    }

    /// Perpendicular distance from `point` to this line.
    pub fn distance_to(&self, point: &Point3<f64>) -> f64 {
        let to_point = point - self.origin;
        (to_point - self.direction.into_inner() * to_point.dot(&self.direction)).norm()
    }

    /// Point at parameter `t` along the line.
    pub fn at(&self, t: f64) -> Point3<f64> {
        self.origin + self.direction.into_inner() * t
    }
}

/// All rays one camera produced for one tick, in blob discovery order.
/// The order is not stable across frames; consumers must not rely on index
/// identity.
pub type RaySet = Vec<Ray>;

#[test]
fn distance_to_line() {
    let ray = Ray::new(Point3::origin(), Vector3::x());
    assert!((ray.distance_to(&Point3::new(10.0, 3.0, 4.0)) - 5.0).abs() < 1e-12);
    assert!(ray.distance_to(&Point3::new(-7.0, 0.0, 0.0)).abs() < 1e-12);
}
