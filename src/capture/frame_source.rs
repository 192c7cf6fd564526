use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};

use crate::models::Frame;

use super::camera::{Camera, CameraError, CameraProvider};

/// Hands out scoped camera leases.
#[derive(Clone)]
pub struct FrameSource {
    provider: Arc<dyn CameraProvider>,
}

impl FrameSource {
    pub fn new(provider: Arc<dyn CameraProvider>) -> Self {
        Self { provider }
    }

    /// Opens the camera. Permission and device failures come back as-is; the
    /// caller decides whether to ask the user to retry.
    pub fn acquire(&self) -> Result<CameraLease, CameraError> {
        let camera = self.provider.open()?;
        info!("Camera stream acquired");
        Ok(CameraLease {
            camera: Some(camera),
            next_seq: 0,
            last_error: None,
        })
    }
}

/// An acquired camera stream. The device is released on `release()` or on
/// drop, whichever happens first.
pub struct CameraLease {
    camera: Option<Box<dyn Camera>>,
    next_seq: u64,
    last_error: Option<String>,
}

impl CameraLease {
    pub fn is_active(&self) -> bool {
        self.camera.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Grabs and encodes the current still. `None` when the stream has been
    /// released or the grab failed; failures are remembered in `last_error`.
    pub fn capture_frame(&mut self) -> Option<Frame> {
        let camera = self.camera.as_mut()?;

        let image = match camera.grab() {
            Ok(image) => image,
            Err(err) => {
                warn!("camera grab failed: {err}");
                self.last_error = Some(err.to_string());
                return None;
            }
        };

        let seq = self.next_seq;
        match Frame::from_image(seq, Utc::now(), &image) {
            Ok(frame) => {
                self.next_seq += 1;
                self.last_error = None;
                Some(frame)
            }
            Err(err) => {
                warn!("frame encoding failed: {err:?}");
                self.last_error = Some(err.to_string());
                None
            }
        }
    }

    pub fn release(&mut self) {
        if self.camera.take().is_some() {
            info!("Camera stream released");
        }
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Lease shared between the detection loop and its blocking capture workers.
pub type SharedLease = Arc<Mutex<CameraLease>>;

pub fn share(lease: CameraLease) -> SharedLease {
    Arc::new(Mutex::new(lease))
}

fn lock(lease: &SharedLease) -> MutexGuard<'_, CameraLease> {
    lease.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs the grab on a blocking worker so camera I/O never stalls the runtime.
pub async fn capture_shared(lease: &SharedLease) -> Result<Option<Frame>> {
    let lease = Arc::clone(lease);
    tokio::task::spawn_blocking(move || lock(&lease).capture_frame())
        .await
        .context("capture worker join failed")
}

pub fn release_shared(lease: &SharedLease) {
    lock(lease).release();
}
