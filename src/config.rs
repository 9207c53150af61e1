#![allow(dead_code)]

/// Contour area bounds for a marker blob, pixels².
/// A blob survives iff `MIN_BLOB_AREA < area <= MAX_BLOB_AREA`.
pub const MIN_BLOB_AREA: f64 = 20.0;
pub const MAX_BLOB_AREA: f64 = 500.0;

/// Binary cut applied to the background difference before re-masking.
pub const FOREGROUND_DIFF_CUT: f64 = 20.0;

/// Side of the elliptical morphology kernel.
pub const MORPH_KERNEL_SIZE: i32 = 3;
/// Aperture of the speckle median blur.
pub const MEDIAN_BLUR_APERTURE: i32 = 3;

/// Max iterations of the background mean-stability loop.
pub const BACKGROUND_MEAN_MAX_ITERS: usize = 10;
/// Per-channel mean movement below which the scene counts as settled.
pub const BACKGROUND_MEAN_TOLERANCE: f64 = 1.0;
/// Frames sampled while building the background plate.
pub const BACKGROUND_SAMPLE_FRAMES: usize = 50;
/// Leading samples folded into the plate by per-pixel maximum.
pub const BACKGROUND_ENVELOPE_FRAMES: usize = 15;

/// Frames pulled and discarded before the threshold search, so
/// auto-exposure settles.
pub const CALIB_WARMUP_FRAMES: usize = 15;
/// Threshold search does not descend below this noise floor.
pub const THRESHOLD_SEARCH_FLOOR: u8 = 20;
/// Back-off below the first qualifying threshold, against LED flicker.
pub const THRESHOLD_FLICKER_MARGIN: u8 = 10;

/// Mean perpendicular residual (world units) above which a ray group is
/// rejected instead of forced into a point.
pub const DEFAULT_RESIDUAL_TOLERANCE: f64 = 5.0;
