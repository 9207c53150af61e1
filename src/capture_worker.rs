use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use opencv::core::Mat;
use opencv::prelude::*;
use parking_lot::{Condvar, Mutex};

use crate::camera::{Camera, FrameSource, PictureControl};
use crate::error::{CaptureError, Result};
use crate::image_processor::ImageProcessor;
use crate::ray::RaySet;
use crate::ray_projector;

type RayCallback = Box<dyn Fn(&RaySet) + Send>;

/// Latest-value mailbox between one worker and the aggregation thread.
/// The worker is the only writer; readers copy out under the lock.
#[derive(Default)]
struct Mailbox {
    latest: Mutex<Option<RaySet>>,
    ready: Condvar,
}

/// Owns one camera's capture loop on a dedicated thread.
///
/// `Idle -> Running -> Idle`: while running, the worker holds the device
/// handle exclusively and publishes one [`RaySet`] per frame; while idle,
/// the handle lives here so calibration can borrow it. Dropping a running
/// worker performs an implicit [`stop`](Self::stop).
pub struct CaptureWorker {
    camera: Arc<Mutex<Camera>>,
    mailbox: Arc<Mailbox>,
    running: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<RayCallback>>>,
    preview: Arc<Mutex<Option<Mat>>>,
    source: Option<Box<dyn FrameSource>>,
    handle: Option<JoinHandle<Box<dyn FrameSource>>>,
}

impl CaptureWorker {
    pub fn new(camera: Camera, source: Box<dyn FrameSource>) -> Self {
        Self {
            camera: Arc::new(Mutex::new(camera)),
            mailbox: Arc::new(Mailbox::default()),
            running: Arc::new(AtomicBool::new(false)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            preview: Arc::new(Mutex::new(None)),
            source: Some(source),
            handle: None,
        }
    }

    /// Shared handle to the camera, for live parameter controls. Writers
    /// take the lock; the worker snapshots at the top of each iteration.
    pub fn camera(&self) -> Arc<Mutex<Camera>> {
        self.camera.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Borrow the device handle for calibration. Only available while idle.
    pub fn source_mut(&mut self) -> Option<&mut (dyn FrameSource + 'static)> {
        self.reclaim_source();
        self.source.as_deref_mut()
    }

    /// Register a callback invoked synchronously from the worker thread for
    /// every published ray set.
    pub fn subscribe(&self, callback: impl Fn(&RaySet) + Send + 'static) {
        self.subscribers.lock().push(Box::new(callback));
    }

    /// Enter `Running`; no-op when already running. A device that fails to
    /// open is reported, the camera is left disabled and the worker stays
    /// idle.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.reclaim_source();
        let Some(source) = self.source.take() else {
            log::error!("no capture source to start");
            return;
        };

        let device_id = source.device_id();
        self.running.store(true, Ordering::Release);

        let camera = self.camera.clone();
        let mailbox = self.mailbox.clone();
        let running = self.running.clone();
        let subscribers = self.subscribers.clone();
        let preview = self.preview.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("capture-{}", device_id))
            .spawn(move || {
                capture_loop(source, camera, mailbox, running, subscribers, preview)
            });
        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                log::error!("failed to spawn capture thread for device {}: {}", device_id, e);
                self.running.store(false, Ordering::Release);
            }
        }
    }

    /// Request loop exit, wait for the current iteration to finish and take
    /// the device handle back. Published state is cleared.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.reclaim_source();
    }

    /// Most recent ray set without waiting.
    pub fn latest_rays(&self) -> Option<RaySet> {
        self.mailbox.latest.lock().clone()
    }

    /// Block until the worker publishes a new ray set or the timeout
    /// elapses, then return whatever is current.
    pub fn wait_for_rays(&self, timeout: Duration) -> Option<RaySet> {
        let mut guard = self.mailbox.latest.lock();
        let _ = self.mailbox.ready.wait_for(&mut guard, timeout);
        guard.clone()
    }

    /// Annotated preview of the last processed frame, when enabled.
    pub fn take_preview(&self) -> Option<Mat> {
        self.preview.lock().take()
    }

    /// Forward a 0..100 picture control to the device. While running, the
    /// worker owns the handle, so the write is staged on the shared camera
    /// and applied by the loop at the top of its next iteration.
    pub fn set_control(&mut self, control: PictureControl, value: i32) -> Result<()> {
        if self.is_running() {
            self.camera.lock().stage_control(control, value);
            return Ok(());
        }
        let id = self.camera.lock().usb_id;
        match self.source_mut() {
            Some(source) => source.set_control(control, value),
            None => Err(CaptureError::DeviceUnavailable(id)),
        }
    }

    /// Join a finished or stopping thread and park the source here again.
    fn reclaim_source(&mut self) {
        if self.is_running() {
            return;
        }
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => log::error!("capture thread panicked"),
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
        if let Some(source) = self.source.as_mut() {
            source.release();
        }
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    camera: Arc<Mutex<Camera>>,
    mailbox: Arc<Mailbox>,
    running: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<RayCallback>>>,
    preview: Arc<Mutex<Option<Mat>>>,
) -> Box<dyn FrameSource> {
    let device_id = source.device_id();

    if !source.is_open() {
        if let Err(e) = source.open() {
            log::error!("device {} unavailable: {}", device_id, e);
            camera.lock().enabled = false;
            running.store(false, Ordering::Release);
            return source;
        }
    }

    let mut processor = match ImageProcessor::new() {
        Ok(p) => p,
        Err(e) => {
            log::error!("pipeline init failed for device {}: {}", device_id, e);
            running.store(false, Ordering::Release);
            return source;
        }
    };

    log::info!("capture loop for device {} running", device_id);

    while running.load(Ordering::Acquire) {
        let (params, controls) = {
            let mut cam = camera.lock();
            (cam.filter_params(), cam.take_pending_controls())
        };
        for (control, value) in controls {
            if let Err(e) = source.set_control(control, value) {
                log::warn!("device {} rejected {:?}={}: {}", device_id, control, value, e);
            }
        }

        let frame = match source.grab() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("device {} stopped delivering frames: {}", device_id, e);
                break;
            }
        };

        let blobs = match processor.process(&frame, &params) {
            Ok(blobs) => blobs,
            Err(e) => {
                log::warn!("filter failed on device {}: {}", device_id, e);
                continue;
            }
        };

        let rays = {
            let mut cam = camera.lock();
            ray_projector::project_set(&mut cam, &blobs, frame.cols(), frame.rows())
        };

        if params.preview {
            *preview.lock() = processor.take_preview();
        }

        {
            let mut slot = mailbox.latest.lock();
            *slot = Some(rays.clone());
            mailbox.ready.notify_all();
        }
        for callback in subscribers.lock().iter() {
            callback(&rays);
        }
    }

    running.store(false, Ordering::Release);
    // clear tick-scoped state and wake any waiting aggregator
    *mailbox.latest.lock() = None;
    mailbox.ready.notify_all();
    log::info!("capture loop for device {} stopped", device_id);

    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};
    use opencv::core::{Scalar, CV_8UC3};
    use std::sync::atomic::AtomicUsize;

    /// Device stand-in that counts opens and releases and serves black
    /// frames.
    struct MockSource {
        opens: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        controls: Arc<Mutex<Vec<(PictureControl, i32)>>>,
        open: bool,
    }

    impl MockSource {
        fn new(opens: Arc<AtomicUsize>, releases: Arc<AtomicUsize>) -> Self {
            Self {
                opens,
                releases,
                controls: Arc::new(Mutex::new(Vec::new())),
                open: false,
            }
        }

        fn controls(&self) -> Arc<Mutex<Vec<(PictureControl, i32)>>> {
            self.controls.clone()
        }
    }

    impl FrameSource for MockSource {
        fn open(&mut self) -> Result<()> {
            self.open = true;
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn grab(&mut self) -> Result<Mat> {
            if !self.open {
                return Err(CaptureError::DeviceUnavailable(7));
            }
            Ok(Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(0.0)).unwrap())
        }

        fn release(&mut self) {
            if self.open {
                self.open = false;
                self.releases.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn device_id(&self) -> i32 {
            7
        }

        fn set_control(&mut self, control: PictureControl, value: i32) -> Result<()> {
            self.controls.lock().push((control, value));
            Ok(())
        }
    }

    fn test_camera() -> Camera {
        Camera::new(
            "mock",
            7,
            Point3::new(0.0, 0.0, 1.0),
            Vector3::new(4.0, 4.0, 2.0),
            60.0,
        )
    }

    #[test]
    fn publishes_ray_sets_while_running() {
        let opens = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(MockSource::new(opens, releases));

        let mut worker = CaptureWorker::new(test_camera(), source);
        worker.start();
        assert!(worker.is_running());

        // a black frame carries no markers, so the published set is empty
        let rays = worker.wait_for_rays(Duration::from_secs(5));
        assert_eq!(rays, Some(Vec::new()));

        worker.stop();
        assert!(!worker.is_running());
        // stored state is tick-scoped and cleared on stop
        assert_eq!(worker.latest_rays(), None);
    }

    #[test]
    fn stop_then_drop_releases_the_device_once() {
        let opens = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(MockSource::new(opens.clone(), releases.clone()));

        let mut worker = CaptureWorker::new(test_camera(), source);
        worker.start();
        let _ = worker.wait_for_rays(Duration::from_secs(5));
        worker.stop();
        drop(worker);

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(releases.load(Ordering::SeqCst), opens.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_while_running_stops_the_thread() {
        let opens = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(MockSource::new(opens.clone(), releases.clone()));

        let mut worker = CaptureWorker::new(test_camera(), source);
        worker.start();
        let _ = worker.wait_for_rays(Duration::from_secs(5));
        drop(worker);

        assert_eq!(releases.load(Ordering::SeqCst), opens.load(Ordering::SeqCst));
    }

    #[test]
    fn start_twice_is_a_no_op() {
        let opens = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(MockSource::new(opens.clone(), releases.clone()));

        let mut worker = CaptureWorker::new(test_camera(), source);
        worker.start();
        worker.start();
        let _ = worker.wait_for_rays(Duration::from_secs(5));
        worker.stop();

        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn controls_staged_while_running_reach_the_device() {
        let opens = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(MockSource::new(opens, releases));
        let applied = source.controls();

        let mut worker = CaptureWorker::new(test_camera(), source);
        worker.start();
        let _ = worker.wait_for_rays(Duration::from_secs(5));

        worker.set_control(PictureControl::Brightness, 40).unwrap();

        // the loop drains staged writes at the top of a following iteration
        let mut reached = false;
        for _ in 0..500 {
            if applied.lock().contains(&(PictureControl::Brightness, 40)) {
                reached = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        worker.stop();
        assert!(reached);
    }

    #[test]
    fn controls_pass_through_while_idle() {
        let opens = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(MockSource::new(opens, releases));
        let applied = source.controls();

        let mut worker = CaptureWorker::new(test_camera(), source);
        worker.set_control(PictureControl::Contrast, 55).unwrap();
        assert_eq!(applied.lock().as_slice(), &[(PictureControl::Contrast, 55)]);
    }

    #[test]
    fn subscribers_see_published_sets() {
        let opens = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = Box::new(MockSource::new(opens, releases));

        let mut worker = CaptureWorker::new(test_camera(), source);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_callback = seen.clone();
        worker.subscribe(move |_| {
            seen_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        worker.start();
        let _ = worker.wait_for_rays(Duration::from_secs(5));
        worker.stop();

        assert!(seen.load(Ordering::SeqCst) > 0);
    }
}
