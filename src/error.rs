use thiserror::Error;

/// Recoverable failures of the capture/calibration core.
///
/// Degenerate blobs, unresolved calibration bounds and divergent ray groups
/// are *not* errors: the first is silently dropped, the other two are
/// reported as flagged values by their producers.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The capture device at this index failed to open. The camera stays
    /// disabled; nothing retries automatically.
    #[error("capture device {0} unavailable")]
    DeviceUnavailable(i32),

    /// Calibration was invoked while the camera was not streaming.
    #[error("camera is not active, calibration aborted")]
    CalibrationNotReady,

    /// The device stopped delivering frames mid-stream.
    #[error("capture device {0} returned no frame")]
    FrameDropped(i32),

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
