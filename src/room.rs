//! Room/project configuration and camera persistence.
//!
//! Two formats coexist: a JSON project file for whole-room setup, and the
//! plain-text camera record block (`name posX posY posZ usbId fov`, one
//! camera per line) the capture tools exchange.

use std::io::{BufRead, Write};
use std::path::Path;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::Camera;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraRecord {
    pub name: String,
    pub position: [f64; 3],
    pub usb_id: i32,
    pub fov: f64,
}

impl CameraRecord {
    pub fn to_camera(&self, room_dimensions: Vector3<f64>) -> Camera {
        Camera::new(
            self.name.clone(),
            self.usb_id,
            Point3::new(self.position[0], self.position[1], self.position[2]),
            room_dimensions,
            self.fov,
        )
    }
}

impl From<&Camera> for CameraRecord {
    fn from(camera: &Camera) -> Self {
        let p = camera.position();
        Self {
            name: camera.name.clone(),
            position: [p.x, p.y, p.z],
            usb_id: camera.usb_id,
            fov: camera.fov(),
        }
    }
}

/// A configured capture room: scene bounds plus the camera rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub name: String,
    /// Width, length, height.
    pub dimensions: [f64; 3],
    pub cameras: Vec<CameraRecord>,
}

impl RoomConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn dimensions(&self) -> Vector3<f64> {
        Vector3::new(self.dimensions[0], self.dimensions[1], self.dimensions[2])
    }

    pub fn build_cameras(&self) -> Vec<Camera> {
        let dims = self.dimensions();
        self.cameras.iter().map(|r| r.to_camera(dims)).collect()
    }
}

/// Write the plain-text camera record block.
pub fn write_records<W: Write>(cameras: &[Camera], mut out: W) -> anyhow::Result<()> {
    for camera in cameras {
        writeln!(out, "{}", camera.save_record())?;
    }
    Ok(())
}

/// Read a camera record block written by [`write_records`]; blank lines are
/// skipped.
pub fn read_records<R: BufRead>(
    input: R,
    room_dimensions: Vector3<f64>,
) -> anyhow::Result<Vec<Camera>> {
    let mut cameras = Vec::new();
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        cameras.push(Camera::from_record(&line, room_dimensions)?);
    }
    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig() -> (Vector3<f64>, Vec<Camera>) {
        let dims = Vector3::new(4.0, 4.0, 3.0);
        let cameras = vec![
            Camera::new("Cam1", 0, Point3::new(1.0, 2.0, 3.0), dims, 60.0),
            Camera::new("Cam2", 1, Point3::new(0.0, 0.5, 1.5), dims, 78.5),
        ];
        (dims, cameras)
    }

    #[test]
    fn record_block_round_trips() {
        let (dims, cameras) = rig();
        let mut buf = Vec::new();
        write_records(&cameras, &mut buf).unwrap();

        let parsed = read_records(buf.as_slice(), dims).unwrap();
        assert_eq!(parsed.len(), 2);
        for (a, b) in cameras.iter().zip(&parsed) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.position(), b.position());
            assert_eq!(a.usb_id, b.usb_id);
            assert_eq!(a.fov(), b.fov());
        }
    }

    #[test]
    fn room_config_round_trips_through_json() {
        let (_, cameras) = rig();
        let config = RoomConfig {
            name: "studio".into(),
            dimensions: [4.0, 4.0, 3.0],
            cameras: cameras.iter().map(CameraRecord::from).collect(),
        };

        let json = serde_json::to_string(&config).unwrap();
        let back: RoomConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "studio");
        assert_eq!(back.cameras, config.cameras);

        let built = back.build_cameras();
        assert_eq!(built[1].name, "Cam2");
        assert_eq!(built[1].fov(), 78.5);
    }
}
