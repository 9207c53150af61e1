//! Camera auto-calibration: background plate acquisition and
//! marker-count-driven threshold search.
//!
//! Both procedures run synchronously on the calling thread and need the
//! device handle, so they can only run while the camera's worker is idle
//! (the worker owns the handle while running).

use opencv::core::{self, Mat};

use crate::camera::{Camera, FrameSource};
use crate::config::*;
use crate::error::{CaptureError, Result};
use crate::image_processor::{FilterParams, ImageProcessor};

/// Outcome of the auto-threshold search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdSearch {
    /// Operating threshold, biased toward the low end of the stable band.
    pub threshold: u8,
    /// Upper bound of the stable band (first qualifying value, less the
    /// flicker margin).
    pub upper: u8,
    /// Threshold at which the blob count started to grow past the bound
    /// count (the noise floor).
    pub lower: u8,
    /// `false` when the search exhausted the range; the threshold is then a
    /// degenerate accept-all value and should not be trusted.
    pub resolved: bool,
}

/// Acquire a background plate from an idle scene.
///
/// First waits for the stream to settle: samples frames until all three
/// channel means move by at most [`BACKGROUND_MEAN_TOLERANCE`] between
/// consecutive frames, capped at [`BACKGROUND_MEAN_MAX_ITERS`]. Then samples
/// [`BACKGROUND_SAMPLE_FRAMES`] more frames, folding the leading
/// [`BACKGROUND_ENVELOPE_FRAMES`] of them into the plate by per-pixel,
/// per-channel maximum, so a marker briefly present during calibration is
/// painted over by later brighter samples.
pub fn calibrate_background(source: &mut dyn FrameSource) -> Result<Mat> {
    if !source.is_open() {
        return Err(CaptureError::CalibrationNotReady);
    }

    let mut plate = source.grab()?;
    let mut last_mean = core::mean(&plate, &core::no_array())?;
    plate = source.grab()?;
    let mut mean = core::mean(&plate, &core::no_array())?;

    let mut iters = 0;
    while iters < BACKGROUND_MEAN_MAX_ITERS
        && (0..3).any(|c| (last_mean[c] - mean[c]).abs() > BACKGROUND_MEAN_TOLERANCE)
    {
        plate = source.grab()?;
        last_mean = mean;
        mean = core::mean(&plate, &core::no_array())?;
        iters += 1;
    }
    log::info!("background mean settled in {} iterations", iters);

    for i in 0..BACKGROUND_SAMPLE_FRAMES {
        let sample = source.grab()?;
        if i < BACKGROUND_ENVELOPE_FRAMES {
            let mut folded = Mat::default();
            core::max(&plate, &sample, &mut folded)?;
            plate = folded;
        }
    }

    Ok(plate)
}

/// Search the 8-bit threshold space for a stable operating threshold, given
/// a target marker count (0 accepts any nonzero count).
///
/// Pulls [`CALIB_WARMUP_FRAMES`] throwaway frames so auto-exposure settles,
/// then re-filters one captured frame at candidate thresholds. The chosen
/// threshold is written back to the camera.
pub fn calibrate_threshold(
    source: &mut dyn FrameSource,
    camera: &mut Camera,
    processor: &mut ImageProcessor,
    target: usize,
) -> Result<ThresholdSearch> {
    if !source.is_open() {
        return Err(CaptureError::CalibrationNotReady);
    }

    for _ in 0..CALIB_WARMUP_FRAMES {
        let _ = source.grab()?;
    }
    let frame = source.grab()?;

    let base = camera.filter_params();
    let outcome = search_threshold(
        |t| {
            let params = FilterParams {
                threshold: t,
                preview: false,
                ..base.clone()
            };
            match processor.process(&frame, &params) {
                Ok(blobs) => blobs.len(),
                Err(e) => {
                    log::warn!("filter failed at threshold {}: {}", t, e);
                    0
                }
            }
        },
        target,
    );

    if outcome.resolved {
        log::info!(
            "{}: threshold band [{}, {}], operating at {}",
            camera.name,
            outcome.lower,
            outcome.upper,
            outcome.threshold
        );
    } else {
        log::warn!("{}: threshold search exhausted, value unreliable", camera.name);
    }
    camera.threshold = outcome.threshold;
    Ok(outcome)
}

/// Pure bound search over a blob-count function of the threshold.
///
/// Top-down: from 255, descend until the count qualifies (nonzero, and equal
/// to `target` when `target != 0`), back off [`THRESHOLD_FLICKER_MARGIN`]
/// and record the upper bound, then keep descending until the count grows
/// past the count observed at the upper bound; that is the lower bound.
/// Operating threshold = `lower + (upper + lower) / 8`.
pub fn search_threshold(mut count_at: impl FnMut(u8) -> usize, target: usize) -> ThresholdSearch {
    let mut t: u8 = 255;
    let mut qualifying = None;
    while t > THRESHOLD_SEARCH_FLOOR {
        let n = count_at(t);
        if n > 0 && (target == 0 || n == target) {
            qualifying = Some(t);
            break;
        }
        t -= 1;
    }

    let Some(found) = qualifying else {
        return ThresholdSearch {
            threshold: 0,
            upper: 0,
            lower: 0,
            resolved: false,
        };
    };

    // marker brightness flickers (LED rotation); step into the band
    let upper = found.saturating_sub(THRESHOLD_FLICKER_MARGIN);
    let bound_count = count_at(upper);

    let mut lower: u8 = 0;
    let mut t = upper;
    while t > 0 {
        t -= 1;
        if count_at(t) > bound_count {
            lower = t;
            break;
        }
    }

    let threshold = (lower as u16 + (upper as u16 + lower as u16) / 8).min(255) as u8;
    ThresholdSearch {
        threshold,
        upper,
        lower,
        resolved: true,
    }
}
