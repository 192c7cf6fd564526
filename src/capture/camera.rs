//! Camera abstraction.
//!
//! Device drivers belong to the host platform. This crate only needs "open a
//! stream" and "grab the current still", plus a directory-backed camera for
//! replaying recorded frames.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use image::DynamicImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("no camera device available: {0}")]
    DeviceUnavailable(String),
    #[error("frame capture failed: {0}")]
    Capture(String),
}

impl CameraError {
    /// Acquisition failures need a manual retry; capture failures are
    /// per-frame and the stream stays usable.
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(
            self,
            CameraError::PermissionDenied(_) | CameraError::DeviceUnavailable(_)
        )
    }
}

/// An open camera stream. Dropping it releases the device.
pub trait Camera: Send {
    fn grab(&mut self) -> Result<DynamicImage, CameraError>;
}

/// Opens camera streams on demand.
pub trait CameraProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn Camera>, CameraError>;
}

const SUPPORTED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Replays still images from a directory in file-name order, looping forever.
pub struct DirectoryCamera {
    dir: PathBuf,
}

impl DirectoryCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl CameraProvider for DirectoryCamera {
    fn open(&self) -> Result<Box<dyn Camera>, CameraError> {
        let files = list_images(&self.dir)?;
        if files.is_empty() {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} contains no images",
                self.dir.display()
            )));
        }
        log::info!(
            "Opened directory camera at {} ({} frames)",
            self.dir.display(),
            files.len()
        );
        Ok(Box::new(DirectoryStream { files, cursor: 0 }))
    }
}

struct DirectoryStream {
    files: Vec<PathBuf>,
    cursor: usize,
}

impl Camera for DirectoryStream {
    fn grab(&mut self) -> Result<DynamicImage, CameraError> {
        let path = &self.files[self.cursor % self.files.len()];
        self.cursor = self.cursor.wrapping_add(1);
        image::open(path).map_err(|err| CameraError::Capture(format!("{}: {err}", path.display())))
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CameraError> {
    let entries = fs::read_dir(dir).map_err(|err| match err.kind() {
        io::ErrorKind::PermissionDenied => {
            CameraError::PermissionDenied(format!("{}: {err}", dir.display()))
        }
        _ => CameraError::DeviceUnavailable(format!("{}: {err}", dir.display())),
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn missing_directory_is_device_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let camera = DirectoryCamera::new(dir.path().join("nope"));

        let err = camera.open().err().unwrap();
        assert!(matches!(err, CameraError::DeviceUnavailable(_)));
        assert!(err.is_acquisition_failure());
    }

    #[test]
    fn empty_directory_is_device_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectoryCamera::new(dir.path()).open().err().unwrap();
        assert!(matches!(err, CameraError::DeviceUnavailable(_)));
    }

    #[test]
    fn replays_frames_in_name_order_and_loops() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]))
            .save(dir.path().join("a.png"))
            .unwrap();
        RgbImage::from_pixel(6, 6, Rgb([0, 255, 0]))
            .save(dir.path().join("b.png"))
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut stream = DirectoryCamera::new(dir.path()).open().unwrap();
        let widths: Vec<u32> = (0..3).map(|_| stream.grab().unwrap().width()).collect();
        assert_eq!(widths, vec![4, 6, 4]);
    }
}
