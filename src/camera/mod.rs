mod video_source;
pub use video_source::UsbFrameSource;

use std::sync::Arc;

use nalgebra::{Point3, Unit, Vector3};
use opencv::core::Mat;

use crate::error::Result;
use crate::image_processor::FilterParams;

/// Picture controls forwarded to the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureControl {
    Brightness,
    Contrast,
    Saturation,
    Sharpness,
}

/// One physical capture device: open by index, pull one frame on demand,
/// release. Implementations own the device handle exclusively.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;
    /// Pull the next frame. Only valid while open.
    fn grab(&mut self) -> Result<Mat>;
    fn release(&mut self);
    /// Device index, for reporting.
    fn device_id(&self) -> i32;
    /// `value` is a GUI-range 0..100 knob; implementations rescale.
    fn set_control(&mut self, _control: PictureControl, _value: i32) -> Result<()> {
        Ok(())
    }
}

/// A fixed, calibrated camera of the capture rig.
///
/// Pose and field of view are configured with the room; threshold, background
/// plate and ROI are mutated by calibration and live controls. Workers never
/// touch this directly per tick, they take a [`FilterParams`] snapshot under
/// the owning lock instead.
#[derive(Debug, Clone)]
pub struct Camera {
    pub name: String,
    pub usb_id: i32,
    position: Point3<f64>,
    room_dimensions: Vector3<f64>,
    direction_to_center: Unit<Vector3<f64>>,
    /// Field of view, degrees.
    fov: f64,
    /// Cached (cols, rows) -> degrees per pixel; cleared when fov changes.
    angle_per_pixel: Option<((i32, i32), f64)>,
    pub threshold: u8,
    background: Option<Arc<Mat>>,
    roi_mask: Option<Arc<Mat>>,
    pub use_adaptive_subtraction: bool,
    pub enabled: bool,
    pub preview: bool,
    /// Picture-control writes staged for the worker, which owns the device
    /// handle while running and applies these at the top of an iteration.
    pending_controls: Vec<(PictureControl, i32)>,
}

impl Camera {
    pub fn new(
        name: impl Into<String>,
        usb_id: i32,
        position: Point3<f64>,
        room_dimensions: Vector3<f64>,
        fov: f64,
    ) -> Self {
        Self {
            name: name.into(),
            usb_id,
            position,
            room_dimensions,
            direction_to_center: Self::direction_to(room_dimensions, position),
            fov,
            angle_per_pixel: None,
            threshold: 255,
            background: None,
            roi_mask: None,
            use_adaptive_subtraction: false,
            enabled: true,
            preview: false,
            pending_controls: Vec::new(),
        }
    }

    /// Stage a 0..100 picture-control write for the owning worker.
    pub fn stage_control(&mut self, control: PictureControl, value: i32) {
        self.pending_controls.push((control, value));
    }

    /// Drain staged picture-control writes, oldest first.
    pub fn take_pending_controls(&mut self) -> Vec<(PictureControl, i32)> {
        std::mem::take(&mut self.pending_controls)
    }

    fn direction_to(room_dimensions: Vector3<f64>, position: Point3<f64>) -> Unit<Vector3<f64>> {
        let center = Point3::from(room_dimensions / 2.0);
        let v = center - position;
        if v.norm() == 0.0 {
            // camera sitting in the room center, aim along +z until moved
            Unit::new_unchecked(Vector3::z())
        } else {
            Unit::new_normalize(v)
        }
    }

    pub fn position(&self) -> Point3<f64> {
        self.position
    }

    pub fn set_position(&mut self, position: Point3<f64>) {
        self.position = position;
        self.direction_to_center = Self::direction_to(self.room_dimensions, position);
    }

    pub fn room_dimensions(&self) -> Vector3<f64> {
        self.room_dimensions
    }

    pub fn set_room_dimensions(&mut self, dimensions: Vector3<f64>) {
        self.room_dimensions = dimensions;
        self.direction_to_center = Self::direction_to(dimensions, self.position);
    }

    pub fn direction_to_center(&self) -> Unit<Vector3<f64>> {
        self.direction_to_center
    }

    pub fn fov(&self) -> f64 {
        self.fov
    }

    pub fn set_fov(&mut self, fov: f64) {
        self.fov = fov;
        self.angle_per_pixel = None;
    }

    /// Degrees of view per pixel, amortized over the frame diagonal.
    /// Recomputed exactly when fov or the frame resolution changes.
    pub fn angle_per_pixel(&mut self, cols: i32, rows: i32) -> f64 {
        match self.angle_per_pixel {
            Some((cached, app)) if cached == (cols, rows) => app,
            _ => {
                let diagonal = ((cols * cols + rows * rows) as f64).sqrt();
                let app = self.fov / diagonal;
                self.angle_per_pixel = Some(((cols, rows), app));
                app
            }
        }
    }

    pub fn background(&self) -> Option<Arc<Mat>> {
        self.background.clone()
    }

    pub fn set_background(&mut self, plate: Mat) {
        self.background = Some(Arc::new(plate));
    }

    pub fn roi_mask(&self) -> Option<Arc<Mat>> {
        self.roi_mask.clone()
    }

    pub fn set_roi_mask(&mut self, mask: Mat) {
        self.roi_mask = Some(Arc::new(mask));
    }

    pub fn clear_roi_mask(&mut self) {
        self.roi_mask = None;
    }

    /// Copy-on-write snapshot of everything the per-frame pipeline reads.
    pub fn filter_params(&self) -> FilterParams {
        FilterParams {
            threshold: self.threshold,
            background: self.background.clone(),
            roi_mask: self.roi_mask.clone(),
            use_adaptive_subtraction: self.use_adaptive_subtraction,
            preview: self.preview,
        }
    }

    /// Fixed-order record line: `name posX posY posZ usbId fov`.
    pub fn save_record(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.name, self.position.x, self.position.y, self.position.z, self.usb_id, self.fov
        )
    }

    /// Parse a [`save_record`](Self::save_record) line. Room dimensions are
    /// project-level state and come from the caller.
    pub fn from_record(line: &str, room_dimensions: Vector3<f64>) -> anyhow::Result<Self> {
        let mut fields = line.split_whitespace();
        let mut next = || {
            fields
                .next()
                .ok_or_else(|| anyhow::anyhow!("truncated camera record: {:?}", line))
        };
        let name = next()?.to_string();
        let x: f64 = next()?.parse()?;
        let y: f64 = next()?.parse()?;
        let z: f64 = next()?.parse()?;
        let usb_id: i32 = next()?.parse()?;
        let fov: f64 = next()?.parse()?;
        Ok(Self::new(name, usb_id, Point3::new(x, y, z), room_dimensions, fov))
    }
}
