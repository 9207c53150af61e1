use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio;

use super::{FrameSource, PictureControl};
use crate::error::{CaptureError, Result};

/// [`FrameSource`] over a USB webcam via opencv's VideoCapture.
pub struct UsbFrameSource {
    usb_id: i32,
    capture: Option<videoio::VideoCapture>,
}

impl UsbFrameSource {
    pub fn new(usb_id: i32) -> Self {
        Self {
            usb_id,
            capture: None,
        }
    }
}

impl FrameSource for UsbFrameSource {
    fn open(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let capture = videoio::VideoCapture::new(self.usb_id, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(CaptureError::DeviceUnavailable(self.usb_id));
        }
        log::info!("opened capture device {}", self.usb_id);
        self.capture = Some(capture);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.capture.is_some()
    }

    fn grab(&mut self) -> Result<Mat> {
        let capture = self
            .capture
            .as_mut()
            .ok_or(CaptureError::DeviceUnavailable(self.usb_id))?;
        let mut frame = Mat::default();
        if !capture.read(&mut frame)? || frame.empty() {
            return Err(CaptureError::FrameDropped(self.usb_id));
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                log::warn!("release of device {} failed: {}", self.usb_id, e);
            }
        }
    }

    fn device_id(&self) -> i32 {
        self.usb_id
    }

    fn set_control(&mut self, control: PictureControl, value: i32) -> Result<()> {
        let capture = self
            .capture
            .as_mut()
            .ok_or(CaptureError::DeviceUnavailable(self.usb_id))?;
        let prop = match control {
            PictureControl::Brightness => videoio::CAP_PROP_BRIGHTNESS,
            PictureControl::Contrast => videoio::CAP_PROP_CONTRAST,
            PictureControl::Saturation => videoio::CAP_PROP_SATURATION,
            PictureControl::Sharpness => videoio::CAP_PROP_SHARPNESS,
        };
        capture.set(prop, value as f64 / 100.0)?;
        Ok(())
    }
}

impl Drop for UsbFrameSource {
    fn drop(&mut self) {
        self.release();
    }
}
