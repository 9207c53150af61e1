use nalgebra::{Matrix3, Point2, Rotation3, Vector3};
use opencv::core::{Mat, Point2d, Vector};

use crate::camera::Camera;
use crate::error::Result;
use crate::image_processor::Blob;
use crate::ray::{Ray, RaySet};

/// Sight line for one blob centroid.
///
/// The camera's direction-to-center is swung about the vertical axis by
/// `-cx * anglePerPixel`, then about the horizontal axis by
/// `-cy * anglePerPixel`, where `(cx, cy)` is the centroid offset from the
/// frame center. Angles are degrees (the per-pixel resolution is
/// `fov / frame diagonal`). A centroid exactly at the frame center yields
/// the direction-to-center unchanged.
pub fn project(camera: &mut Camera, centroid: Point2<f64>, cols: i32, rows: i32) -> Ray {
    let app = camera.angle_per_pixel(cols, rows);
    let cx = centroid.x - cols as f64 / 2.0;
    let cy = centroid.y - rows as f64 / 2.0;

    let swing = Rotation3::from_axis_angle(&Vector3::z_axis(), (-cx * app).to_radians());
    let tilt = Rotation3::from_axis_angle(&Vector3::x_axis(), (-cy * app).to_radians());
    let direction = tilt * (swing * camera.direction_to_center().into_inner());

    Ray::new(camera.position(), direction)
}

/// One ray per blob, same order as the input.
pub fn project_set(camera: &mut Camera, blobs: &[Blob], cols: i32, rows: i32) -> RaySet {
    blobs
        .iter()
        .map(|blob| project(camera, blob.centroid, cols, rows))
        .collect()
}

/// Lens-distortion correction for a raw pixel, radial + tangential model.
/// Optional pre-step before [`project`]; pure `pixel -> pixel`.
pub fn undistort_pixel(
    pixel: Point2<f64>,
    intrinsics: &Matrix3<f64>,
    distortion: &[f64; 5],
) -> Result<Point2<f64>> {
    let k = Mat::from_slice_2d(&[
        [intrinsics[(0, 0)], intrinsics[(0, 1)], intrinsics[(0, 2)]],
        [intrinsics[(1, 0)], intrinsics[(1, 1)], intrinsics[(1, 2)]],
        [intrinsics[(2, 0)], intrinsics[(2, 1)], intrinsics[(2, 2)]],
    ])?;
    let dist = Mat::from_exact_iter(distortion.iter().copied())?;

    let src = Vector::<Point2d>::from_slice(&[Point2d::new(pixel.x, pixel.y)]);
    let mut dst = Vector::<Point2d>::new();
    opencv::calib3d::undistort_points(
        &src,
        &mut dst,
        &k,
        &dist,
        &opencv::core::no_array(),
        &opencv::core::no_array(),
    )?;

    // back from normalized coordinates to pixels
    let p = dst.get(0)?;
    let fx = intrinsics[(0, 0)];
    let fy = intrinsics[(1, 1)];
    let cx = intrinsics[(0, 2)];
    let cy = intrinsics[(1, 2)];
    Ok(Point2::new(p.x * fx + cx, p.y * fy + cy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn camera_looking_along_x() -> Camera {
        // room center at (2, 0, 0) seen from the origin
        Camera::new(
            "c",
            0,
            Point3::origin(),
            nalgebra::Vector3::new(4.0, 0.0, 0.0),
            60.0,
        )
    }

    #[test]
    fn center_pixel_keeps_direction_to_center() {
        let mut cam = camera_looking_along_x();
        let ray = project(&mut cam, Point2::new(320.0, 240.0), 640, 480);
        assert_eq!(ray.origin, cam.position());
        let expected = cam.direction_to_center().into_inner();
        assert!((ray.direction.into_inner() - expected).norm() < 1e-12);
    }

    #[test]
    fn horizontal_offset_swings_by_angle_per_pixel() {
        let mut cam = camera_looking_along_x();
        let app = cam.angle_per_pixel(640, 480);
        let ray = project(&mut cam, Point2::new(320.0 + 10.0, 240.0), 640, 480);
        // direction-to-center is +x, perpendicular to the swing axis, so the
        // angle between the two directions is exactly the applied rotation
        let cos = ray.direction.dot(&cam.direction_to_center());
        let expected = (10.0 * app).to_radians();
        assert!((cos.acos() - expected).abs() < 1e-9);
    }

    #[test]
    fn undistort_with_zero_coefficients_is_identity() {
        let k = Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0);
        let p = undistort_pixel(Point2::new(100.0, 50.0), &k, &[0.0; 5]).unwrap();
        assert!((p - Point2::new(100.0, 50.0)).norm() < 1e-6);
    }
}
