use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::capture::{capture_shared, phash::compute_hamming_distance, phash::compute_phash, SharedLease};
use crate::config::EnrollmentSettings;
use crate::models::Frame;

/// Upper bound on grabs per requested frame before giving up.
const ATTEMPTS_PER_FRAME: usize = 4;

/// Collects enrollment stills from an acquired camera.
pub struct EnrollmentCapture {
    lease: SharedLease,
    interval: Duration,
    min_pose_distance: u32,
}

impl EnrollmentCapture {
    pub fn new(lease: SharedLease, settings: &EnrollmentSettings) -> Self {
        Self {
            lease,
            interval: Duration::from_millis(settings.capture_interval_ms),
            min_pose_distance: settings.min_pose_distance,
        }
    }

    /// Grabs up to `count` frames at least `capture_interval_ms` apart. A
    /// frame too similar to the last kept one is discarded. May return fewer
    /// frames than asked for once the attempt budget runs out.
    pub async fn capture_n(&self, count: usize) -> Result<Vec<Frame>> {
        let mut kept: Vec<Frame> = Vec::with_capacity(count);
        let mut last_hash: Option<String> = None;
        let max_attempts = count.saturating_mul(ATTEMPTS_PER_FRAME);

        for attempt in 0..max_attempts {
            if kept.len() >= count {
                break;
            }
            if attempt > 0 {
                tokio::time::sleep(self.interval).await;
            }

            let Some(frame) = capture_shared(&self.lease).await? else {
                if !self.lease_active() {
                    bail!("camera released during enrollment capture");
                }
                continue;
            };

            if self.min_pose_distance > 0 {
                let hash = hash_frame(&frame).await?;
                if let Some(previous) = &last_hash {
                    let distance = compute_hamming_distance(previous, &hash);
                    if distance < self.min_pose_distance {
                        debug!("frame {} too close to previous pose ({distance})", frame.seq);
                        continue;
                    }
                }
                last_hash = Some(hash);
            }

            kept.push(frame);
        }

        if kept.len() < count {
            warn!("captured {} of {count} enrollment frames", kept.len());
        }
        Ok(kept)
    }

    fn lease_active(&self) -> bool {
        self.lease
            .lock()
            .map(|lease| lease.is_active())
            .unwrap_or(false)
    }
}

async fn hash_frame(frame: &Frame) -> Result<String> {
    let frame = frame.clone();
    tokio::task::spawn_blocking(move || frame.decode().map(|image| compute_phash(&image)))
        .await
        .context("pose hash worker join failed")?
}
