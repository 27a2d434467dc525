// src/main.rs

//! keygrab entry-point: Windows service or console fallback.
//!
//! 1. Load `keygrab.toml` & set up structured logging
//! 2. Register with the SCM (or run as a console fallback)
//! 3. Launch the detection loop on its own thread
//! 4. Wait for Stop / Shutdown, then stop scanning and exit cleanly

// ───── std / 3rd-party imports ──────────────────────────────────────────────
#[cfg(windows)]
use anyhow::Context;
#[cfg(windows)]
use chrono::Local;
#[cfg(windows)]
use fern::Dispatch;
#[cfg(windows)]
use log::LevelFilter;
#[cfg(windows)]
use std::{
    path::{Path, PathBuf},
    process,
    sync::Arc,
    thread,
};

// ───── local imports ────────────────────────────────────────────────────────
#[cfg(windows)]
use keygrab::comms::events::LogSink;
#[cfg(windows)]
use keygrab::config::{self, types::LoggingConfig, Config};
#[cfg(windows)]
use keygrab::{inspect, KeyGrabber};

// ───── helpers ──────────────────────────────────────────────────────────────

/// Print an error with context and terminate the process.
#[cfg(windows)]
macro_rules! fatal {
    ($ctx:expr, $($arg:tt)+) => {{
        eprintln!(
            "[{}][ERROR][{}] {}",
            chrono::Local::now().to_rfc3339(),
            $ctx,
            format!($($arg)+)
        );
        std::process::exit(1);
    }};
}

/// Directory that contains the running executable.
#[cfg(windows)]
fn exe_dir() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot determine exe path")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("executable must live in some directory")
}

/// Configure global logging as requested in `[logging]`.
#[cfg(windows)]
fn setup_logging(exe_dir: &Path, logging: &LoggingConfig) -> Result<(), fern::InitError> {
    let level = match logging.level.to_uppercase().as_str() {
        "ERROR" => LevelFilter::Error,
        "WARN" => LevelFilter::Warn,
        "DEBUG" => LevelFilter::Debug,
        "TRACE" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    let log_path = logging
        .enable
        .then(|| exe_dir.join(logging.file.as_deref().unwrap_or("keygrab.log")));

    let mut dispatch = Dispatch::new()
        .format(|out, msg, record| {
            out.finish(format_args!(
                "[{}][{:5}][{}][pid={}][tid={:?}] {}",
                Local::now().to_rfc3339(),
                record.level(),
                record.target(),
                process::id(),
                thread::current().id(),
                msg
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(path) = log_path {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

/// A running detection loop.
#[cfg(windows)]
struct Engine {
    grabber:  Arc<KeyGrabber>,
    detector: thread::JoinHandle<()>,
}

#[cfg(windows)]
impl Engine {
    /// Loads config, sets up logging and starts the detection thread.
    fn start() -> anyhow::Result<Self> {
        let exe_dir = exe_dir()?;
        let cfg: Config = config::load(&exe_dir.join("keygrab.toml")).context("loading keygrab.toml")?;
        setup_logging(&exe_dir, &cfg.logging).context("logging setup failed")?;
        log::info!("keygrab bootstrap initiated");

        let inspector: Arc<dyn inspect::ProcessInspector> = Arc::from(inspect::native());
        let grabber = Arc::new(KeyGrabber::new(cfg, inspector, Arc::new(LogSink)));
        let detector = {
            let grabber = Arc::clone(&grabber);
            thread::Builder::new()
                .name("detector".into())
                .spawn(move || grabber.run())
                .context("spawning detection thread")?
        };
        Ok(Self { grabber, detector })
    }

    fn stop(self) {
        log::warn!("Shutdown initiated");
        self.grabber.shutdown();
        if self.detector.join().is_err() {
            log::error!("detection thread panicked");
        }
        let stats = self.grabber.store().stats();
        log::info!(
            "keygrab stopped cleanly ({} inserted, {} claimed, {} purged)",
            stats.inserted,
            stats.claimed,
            stats.purged
        );
    }
}

// ───── service logic ────────────────────────────────────────────────────────

#[cfg(windows)]
mod service {
    use super::Engine;
    use std::{ffi::OsString, sync::mpsc, time::Duration};
    use windows_service::{
        define_windows_service,
        service::{
            ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
            ServiceType,
        },
        service_control_handler::{self, ServiceControlHandlerResult},
        service_dispatcher,
    };

    pub const SERVICE_NAME: &str = "KeyGrab";

    define_windows_service!(ffi_service_main, service_main);

    pub fn dispatch() -> windows_service::Result<()> {
        service_dispatcher::start(SERVICE_NAME, ffi_service_main)
    }

    // Windows SCM entry point.
    fn service_main(_args: Vec<OsString>) {
        if let Err(e) = run_service() {
            fatal!("service", "{:#}", e);
        }
    }

    fn run_service() -> anyhow::Result<()> {
        let (svc_tx, svc_rx) = mpsc::sync_channel(1);
        let status_handle = service_control_handler::register(SERVICE_NAME, move |ctrl| match ctrl {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                log::warn!("Stop requested via SCM");
                let _ = svc_tx.try_send(());
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            _ => ServiceControlHandlerResult::NotImplemented,
        })?;

        let mut status = ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: ServiceState::StartPending,
            controls_accepted: ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint: Duration::from_secs(30),
            process_id: None,
        };
        status_handle.set_service_status(status.clone())?;

        let engine = Engine::start()?;
        status.current_state = ServiceState::Running;
        status_handle.set_service_status(status.clone())?;
        log::info!("Service running");

        let _ = svc_rx.recv();
        status.current_state = ServiceState::StopPending;
        status_handle.set_service_status(status.clone())?;
        engine.stop();

        status.current_state = ServiceState::Stopped;
        status_handle.set_service_status(status)?;
        Ok(())
    }
}

/// Console mode: scan until the process is killed.
#[cfg(windows)]
fn run_console() -> anyhow::Result<()> {
    let engine = Engine::start()?;
    log::info!("running in console mode");
    if engine.detector.join().is_err() {
        anyhow::bail!("detection thread panicked");
    }
    Ok(())
}

#[cfg(windows)]
fn main() {
    // If registering as a service fails, run as a plain console app.
    if let Err(e) = service::dispatch() {
        eprintln!(
            "[{}][ERROR][main] Not a service: {} – falling back to console.",
            Local::now().to_rfc3339(),
            e
        );
        if let Err(e) = run_console() {
            fatal!("console", "{:#}", e);
        }
    }
}

#[cfg(not(windows))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("keygrab reads client memory through the Win32 API; this platform is unsupported")
}
