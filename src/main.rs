mod calibrator;
mod camera;
mod capture_worker;
mod config;
mod error;
mod image_processor;
mod ray;
mod ray_projector;
mod room;
mod triangulator;

use std::time::Duration;

use opencv::highgui;

use crate::camera::UsbFrameSource;
use crate::capture_worker::CaptureWorker;
use crate::ray::RaySet;
use crate::triangulator::Triangulator;

const TICK: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "configs/room.json".to_string());
    let config = room::RoomConfig::load(&path)?;
    log::info!("room \"{}\", {} cameras", config.name, config.cameras.len());

    let mut workers: Vec<CaptureWorker> = config
        .build_cameras()
        .into_iter()
        .map(|cam| {
            let source = Box::new(UsbFrameSource::new(cam.usb_id));
            CaptureWorker::new(cam, source)
        })
        .collect();
    for worker in &mut workers {
        worker.start();
    }

    let triangulator = Triangulator::default();

    loop {
        if workers.iter().all(|w| !w.is_running()) {
            log::warn!("no active cameras, shutting down");
            break;
        }

        let sets: Vec<RaySet> = workers
            .iter()
            .filter(|w| w.is_running())
            .filter_map(|w| w.wait_for_rays(TICK))
            .collect();

        // index grouping: a stand-in correspondence policy, good enough for
        // a single marker per camera
        let group_count = sets.iter().map(|s| s.len()).min().unwrap_or(0);
        let groups: Vec<RaySet> = (0..group_count)
            .map(|i| sets.iter().map(|s| s[i].clone()).collect())
            .collect();

        let markers = triangulator.triangulate(&groups);
        if !markers.is_empty() {
            log::info!(
                "tick: {} markers {:?}",
                markers.len(),
                markers
                    .iter()
                    .map(|m| (m.x, m.y, m.z))
                    .collect::<Vec<_>>()
            );
        }

        for worker in &workers {
            if let Some(preview) = worker.take_preview() {
                let name = worker.camera().lock().name.clone();
                highgui::imshow(&name, &preview)?;
            }
        }
        if highgui::wait_key(1)? == 27 {
            break;
        }
    }

    for worker in &mut workers {
        worker.stop();
    }
    Ok(())
}
