pub mod attendance;
pub mod capture;
pub mod config;
pub mod db;
pub mod enrollment;
pub mod models;
pub mod monitor;
pub mod overlay;
pub mod recognition;
mod utils;

#[cfg(test)]
mod test_support;

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use attendance::HttpAttendanceNotifier;
use capture::{share, DirectoryCamera, FrameSource};
use config::{AppConfig, BackendKind, ConfigStore, CONFIG_PATH_ENV};
use db::Database;
use enrollment::{EnrollmentCapture, EnrollmentClient};
use models::Identity;
use monitor::MonitorController;
use recognition::{
    GrayscaleEmbedder, HttpRecognizer, LocalMatcher, ManifestClient, Recognizer, StreamRecognizer,
};

const DEFAULT_CONFIG_FILE: &str = "attendify.json";

enum Command {
    Monitor,
    Enroll { student_id: String, name: String },
}

fn parse_command(args: &[String]) -> Result<Command> {
    match args.first().map(String::as_str) {
        None | Some("monitor") => Ok(Command::Monitor),
        Some("enroll") => {
            let student_id = args
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("usage: attendify enroll <student-id> <name>"))?;
            let name = args[2..].join(" ");
            if name.trim().is_empty() {
                bail!("usage: attendify enroll <student-id> <name>");
            }
            Ok(Command::Enroll { student_id, name })
        }
        Some(other) => bail!("unknown command '{other}' (expected monitor or enroll)"),
    }
}

pub fn run() -> Result<()> {
    let debug_mode = std::env::var("ATTENDIFY_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    env_logger::Builder::new()
        .filter_level(if debug_mode {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    info!("Attendify starting up...");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;

    let config_path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = load_config(config_path)?;
    config.apply_env_overrides();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    runtime.block_on(async move {
        match command {
            Command::Monitor => run_monitor(config).await,
            Command::Enroll { student_id, name } => run_enroll(config, student_id, name).await,
        }
    })
}

/// Reads the config file, writing the defaults out on first run so there is
/// a template to edit.
fn load_config(path: PathBuf) -> Result<AppConfig> {
    let store = ConfigStore::new(path)?;
    if !store.path().exists() {
        store.update(store.config())?;
        info!("Wrote default config to {}", store.path().display());
    }
    Ok(store.config())
}

fn frame_source(config: &AppConfig) -> Result<FrameSource> {
    let dir = config
        .camera
        .frames_dir
        .clone()
        .ok_or_else(|| anyhow!("no camera configured; set camera.frames_dir or ATTENDIFY_FRAMES_DIR"))?;
    Ok(FrameSource::new(Arc::new(DirectoryCamera::new(dir))))
}

/// Builds the configured backend. A local matcher that cannot load its
/// references yet keeps retrying in the background until `cancel` fires.
async fn build_recognizer(
    config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Recognizer>> {
    let backend = &config.backend;
    let recognizer: Arc<dyn Recognizer> = match backend.kind {
        BackendKind::Http => Arc::new(HttpRecognizer::new(
            &backend.base_url,
            backend.request_timeout(),
        )?),
        BackendKind::Stream => Arc::new(StreamRecognizer::connect(backend)),
        BackendKind::Local => {
            let matcher = Arc::new(LocalMatcher::new(
                Arc::new(GrayscaleEmbedder::default()),
                config.detection.match_threshold,
                config.detection.max_reference_images,
            ));
            let manifest = ManifestClient::new(&backend.base_url, backend.request_timeout())?;
            match matcher.refresh(&manifest).await {
                Ok(count) => info!("Local matcher ready with {count} identities"),
                Err(err) => {
                    // Monitoring still starts; the loop idles until references load.
                    warn!("Local matcher not ready: {err:#}");
                    let retry = backend.manifest_retry();
                    let matcher = Arc::clone(&matcher);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        matcher.refresh_until_ready(&manifest, retry, &cancel).await;
                    });
                }
            }
            matcher
        }
    };
    Ok(recognizer)
}

async fn recover_interrupted_sessions(db: &Database) -> Result<()> {
    let incomplete = db.get_incomplete_sessions().await?;
    for session in &incomplete {
        warn!(
            "Recovered incomplete session {}; marking as Interrupted",
            session.id
        );
    }
    if !incomplete.is_empty() {
        db.interrupt_incomplete_sessions(Utc::now()).await?;
    }
    Ok(())
}

async fn run_monitor(config: AppConfig) -> Result<()> {
    let database = Database::new(config.database_path.clone())?;
    recover_interrupted_sessions(&database).await?;

    let background = CancellationToken::new();
    let _background_guard = background.clone().drop_guard();
    let recognizer = build_recognizer(&config, &background).await?;
    let notifier = Arc::new(HttpAttendanceNotifier::new(
        &config.backend.base_url,
        config.backend.request_timeout(),
    )?);

    let controller = MonitorController::new(
        frame_source(&config)?,
        recognizer,
        notifier,
        Some(database),
        config.detection.clone(),
    );

    let session = controller.start_session().await?;
    let mut marks = controller.subscribe_marks();
    let mut health = controller.subscribe_health();
    info!("Monitoring {session}; press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            mark = marks.recv() => match mark {
                Ok(mark) => info!(
                    "Present: {} ({}) at {}",
                    mark.identity.display_name, mark.identity.id, mark.marked_at
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("missed {missed} mark events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Recognition backend health: {:?}", *health.borrow());
            }
        }
    }

    let summary = controller.end_session().await?;
    info!(
        "Session {session} closed: {} frames processed, {} skipped, {} marked",
        summary.state.frames_processed, summary.state.skipped_cycles, summary.state.marked_count
    );
    Ok(())
}

async fn run_enroll(config: AppConfig, student_id: String, name: String) -> Result<()> {
    let identity = Identity::new(student_id, name);
    let source = frame_source(&config)?;
    let lease = tokio::task::spawn_blocking(move || source.acquire())
        .await
        .context("camera open worker join failed")??;

    let capture = EnrollmentCapture::new(share(lease), &config.enrollment);
    let frames = capture.capture_n(config.enrollment.min_frames).await?;

    let client = EnrollmentClient::new(
        &config.backend.base_url,
        config.backend.request_timeout(),
        config.enrollment.min_frames,
    )?;
    let receipt = client.submit(&identity, &frames).await?;
    info!(
        "Enrolled {} ({}): {}",
        identity.display_name,
        identity.id,
        receipt
            .message
            .unwrap_or_else(|| format!("{} frames accepted", frames.len()))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert!(matches!(parse_command(&[]).unwrap(), Command::Monitor));
        assert!(matches!(parse_command(&args(&["monitor"])).unwrap(), Command::Monitor));

        match parse_command(&args(&["enroll", "s-7", "Grace", "Hopper"])).unwrap() {
            Command::Enroll { student_id, name } => {
                assert_eq!(student_id, "s-7");
                assert_eq!(name, "Grace Hopper");
            }
            Command::Monitor => panic!("expected enroll"),
        }

        assert!(parse_command(&args(&["enroll", "s-7"])).is_err());
        assert!(parse_command(&args(&["dance"])).is_err());
    }

    #[test]
    fn frame_source_requires_a_directory() {
        assert!(frame_source(&AppConfig::default()).is_err());
    }

    #[tokio::test]
    async fn local_backend_keeps_retrying_the_manifest() {
        let stub = crate::test_support::spawn_http_stub(vec![
            (503, r#"{"detail":"warming up"}"#.into()),
            (200, r#"{"people":[]}"#.into()),
        ])
        .await;
        let mut config = AppConfig::default();
        config.backend.kind = BackendKind::Local;
        config.backend.base_url = stub.base_url.clone();
        config.backend.manifest_retry_ms = 20;
        let cancel = CancellationToken::new();

        let recognizer = build_recognizer(&config, &cancel).await.unwrap();
        assert!(!recognizer.is_ready());

        for _ in 0..200 {
            if recognizer.is_ready() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(recognizer.is_ready());
        cancel.cancel();
    }

    #[test]
    fn first_run_writes_a_config_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendify.json");
        let config = load_config(path.clone()).unwrap();
        assert_eq!(config, AppConfig::default());

        let written: AppConfig = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, AppConfig::default());
    }

    #[tokio::test]
    async fn recovery_interrupts_running_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("journal.sqlite3")).unwrap();
        db.insert_session(&db::MonitorSession::started("crashed", Utc::now()))
            .await
            .unwrap();

        recover_interrupted_sessions(&db).await.unwrap();

        let session = db.get_session("crashed").await.unwrap().unwrap();
        assert_eq!(session.status, db::SessionStatus::Interrupted);
    }
}
