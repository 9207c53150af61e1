use std::sync::Arc;

use nalgebra::Point2;
use opencv::{
    core::{self, Mat, Point, Ptr, Scalar, Size, Vector},
    imgproc::{self, LINE_8},
    prelude::*,
    video::{self, BackgroundSubtractorMOG2},
};

use crate::config::*;
use crate::error::Result;

/// Snapshot of everything the per-frame pipeline reads from a Camera.
/// Taken at the top of each capture iteration so live controls and
/// calibration never race the worker mid-frame.
#[derive(Debug, Clone, Default)]
pub struct FilterParams {
    /// Binary cut for marker extraction, 255 = white/foreground.
    pub threshold: u8,
    /// Static background plate for differencing.
    pub background: Option<Arc<Mat>>,
    /// Optional region-of-interest mask, 8UC1.
    pub roi_mask: Option<Arc<Mat>>,
    /// Adaptive MOG2 subtraction instead of static differencing.
    pub use_adaptive_subtraction: bool,
    /// Produce an annotated preview frame for the GUI.
    pub preview: bool,
}

/// A filtered image region reduced to its area-weighted centroid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    /// Pixel-space centroid, `(m10/m00, m01/m00)`.
    pub centroid: Point2<f64>,
    pub area: f64,
}

/// Per-camera filtering pipeline turning one raw color frame into marker
/// blobs. Owns the morphology kernel and the adaptive background model, so
/// one instance is bound to one camera stream.
pub struct ImageProcessor {
    kernel: Mat,
    subtractor: Ptr<BackgroundSubtractorMOG2>,
    preview: Option<Mat>,
}

impl ImageProcessor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            kernel: imgproc::get_structuring_element(
                imgproc::MORPH_ELLIPSE,
                Size::new(MORPH_KERNEL_SIZE, MORPH_KERNEL_SIZE),
                Point::new(-1, -1),
            )?,
            subtractor: video::create_background_subtractor_mog2(50, 16.0, false)?,
            preview: None,
        })
    }

    /// Run the full filter chain and return surviving blobs in contour
    /// discovery order. The order is not stable across frames.
    pub fn process(&mut self, frame: &Mat, params: &FilterParams) -> Result<Vec<Blob>> {
        // 1. restrict to the region of interest
        let work = match &params.roi_mask {
            Some(roi) => {
                let mut masked = Mat::default();
                frame.copy_to_masked(&mut masked, roi.as_ref())?;
                masked
            }
            None => frame.clone(),
        };

        // 2. foreground extraction
        let foreground = if params.use_adaptive_subtraction {
            let mut mask = Mat::default();
            BackgroundSubtractorMOG2Trait::apply(&mut self.subtractor, &work, &mut mask, -1.0)?;
            let mut fg = Mat::default();
            work.copy_to_masked(&mut fg, &mask)?;
            fg
        } else if let Some(background) = &params.background {
            let mut diff = Mat::default();
            core::absdiff(&work, background.as_ref(), &mut diff)?;
            let mut diff_gray = Mat::default();
            imgproc::cvt_color(&diff, &mut diff_gray, imgproc::COLOR_BGR2GRAY, 0)?;
            let mut mask = Mat::default();
            imgproc::threshold(
                &diff_gray,
                &mut mask,
                FOREGROUND_DIFF_CUT,
                255.0,
                imgproc::THRESH_BINARY,
            )?;
            let mut fg = Mat::default();
            work.copy_to_masked(&mut fg, &mask)?;
            fg
        } else {
            // no background model yet, filter the raw frame
            work
        };

        // 3. single channel + speckle suppression
        let mut gray = Mat::default();
        imgproc::cvt_color(&foreground, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
        let mut blurred = Mat::default();
        imgproc::median_blur(&gray, &mut blurred, MEDIAN_BLUR_APERTURE)?;

        // 4. marker cut
        let mut binary = Mat::default();
        imgproc::threshold(
            &blurred,
            &mut binary,
            params.threshold as f64,
            255.0,
            imgproc::THRESH_BINARY,
        )?;

        // 5. open to kill isolated noise pixels
        let mut opened = Mat::default();
        imgproc::morphology_ex(
            &binary,
            &mut opened,
            imgproc::MORPH_OPEN,
            &self.kernel,
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        // 6. external contours only, full boundary
        let mut contours = Vector::<Vector<Point>>::new();
        imgproc::find_contours(
            &opened,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_NONE,
            Point::default(),
        )?;

        // 7. area filter + centroids
        let (kept, blobs) = Self::measure(&contours)?;

        self.preview = if params.preview {
            Some(Self::draw_preview(frame, &kept, &blobs)?)
        } else {
            None
        };

        Ok(blobs)
    }

    /// Annotated frame from the last [`process`](Self::process) call, if
    /// preview was requested. Taking it leaves `None` behind.
    pub fn take_preview(&mut self) -> Option<Mat> {
        self.preview.take()
    }

    fn area_in_range(area: f64) -> bool {
        area > MIN_BLOB_AREA && area <= MAX_BLOB_AREA
    }

    /// Area-filter into a materialized copy (never remove-by-index while
    /// scanning) and reduce each survivor to its moment centroid.
    fn measure(contours: &Vector<Vector<Point>>) -> Result<(Vector<Vector<Point>>, Vec<Blob>)> {
        let mut kept = Vector::<Vector<Point>>::new();
        let mut blobs = Vec::new();
        for contour in contours.iter() {
            let area = imgproc::contour_area(&contour, false)?;
            if !Self::area_in_range(area) {
                continue;
            }
            let m = imgproc::moments(&contour, false)?;
            let cx = m.m10 / m.m00;
            let cy = m.m01 / m.m00;
            if cx.is_nan() || cy.is_nan() {
                log::debug!("degenerate contour dropped, area {}", area);
                continue;
            }
            kept.push(contour);
            blobs.push(Blob {
                centroid: Point2::new(cx, cy),
                area,
            });
        }
        Ok((kept, blobs))
    }

    fn draw_preview(frame: &Mat, kept: &Vector<Vector<Point>>, blobs: &[Blob]) -> Result<Mat> {
        let mut preview = frame.clone();
        imgproc::draw_contours(
            &mut preview,
            kept,
            -1,
            Scalar::new(0.0, 0.0, 255.0, 0.0),
            imgproc::FILLED,
            LINE_8,
            &core::no_array(),
            i32::MAX,
            Point::default(),
        )?;
        for blob in blobs {
            imgproc::circle(
                &mut preview,
                Point::new(blob.centroid.x as i32, blob.centroid.y as i32),
                1,
                Scalar::new(255.0, 0.0, 0.0, 0.0),
                2,
                LINE_8,
                0,
            )?;
        }
        // frame center reference dot
        let center = Point::new(preview.cols() / 2, preview.rows() / 2);
        imgproc::circle(
            &mut preview,
            center,
            1,
            Scalar::new(0.0, 255.0, 0.0, 0.0),
            2,
            LINE_8,
            0,
        )?;
        Ok(preview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::CV_8UC3;

    fn rect_contour(w: i32, h: i32) -> Vector<Point> {
        Vector::from_slice(&[
            Point::new(0, 0),
            Point::new(w, 0),
            Point::new(w, h),
            Point::new(0, h),
        ])
    }

    #[test]
    fn area_bounds_are_exclusive_low_inclusive_high() {
        assert!(!ImageProcessor::area_in_range(20.0));
        assert!(ImageProcessor::area_in_range(20.0 + 1e-9));
        assert!(ImageProcessor::area_in_range(500.0));
        assert!(!ImageProcessor::area_in_range(500.0 + 1e-9));
    }

    #[test]
    fn measure_filters_by_polygon_area() {
        let mut contours = Vector::<Vector<Point>>::new();
        contours.push(rect_contour(10, 10)); // area 100, kept
        contours.push(rect_contour(5, 4)); // area 20, boundary, dropped
        contours.push(rect_contour(25, 20)); // area 500, boundary, kept
        contours.push(rect_contour(50, 11)); // area 550, dropped

        let (kept, blobs) = ImageProcessor::measure(&contours).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].area, 100.0);
        assert_eq!(blobs[1].area, 500.0);
        // centroid of the 10x10 square polygon
        assert!((blobs[0].centroid - Point2::new(5.0, 5.0)).norm() < 1e-9);
    }

    #[test]
    fn bright_square_yields_one_blob() {
        let mut frame =
            Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(0.0)).unwrap();
        imgproc::rectangle(
            &mut frame,
            opencv::core::Rect::new(20, 20, 10, 10),
            Scalar::all(255.0),
            imgproc::FILLED,
            LINE_8,
            0,
        )
        .unwrap();

        let mut processor = ImageProcessor::new().unwrap();
        let params = FilterParams {
            threshold: 128,
            ..Default::default()
        };
        let blobs = processor.process(&frame, &params).unwrap();
        assert_eq!(blobs.len(), 1);
        assert!((blobs[0].centroid.x - 24.5).abs() < 1.0);
        assert!((blobs[0].centroid.y - 24.5).abs() < 1.0);
    }

    #[test]
    fn dark_frame_yields_no_blobs() {
        let frame = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(0.0)).unwrap();
        let mut processor = ImageProcessor::new().unwrap();
        let params = FilterParams {
            threshold: 128,
            ..Default::default()
        };
        assert!(processor.process(&frame, &params).unwrap().is_empty());
    }
}
