mod acquire;
mod control;
mod frame_loop;
mod session;
mod source;
mod surface;

use std::path::PathBuf;
use std::sync::Arc;

use cvd_lens_common::color::Filter;
use cvd_lens_common::config::Config;
use frame_loop::FrameLoop;
use session::{CameraOpener, Command, Session, StatusBoard};
use surface::{RasterSurface, Surface};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Control requests are rare; a short queue is plenty.
const COMMAND_QUEUE: usize = 16;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        url = config.stream.url,
        mode = config.stream.mode,
        refresh_hz = config.display.refresh_hz,
        surfaces = ?config.display.surfaces,
        bind = config.control.bind,
        "starting cvd-lens viewer"
    );

    let initial_filter = config.filter.initial.parse::<Filter>().unwrap_or_else(|e| {
        warn!(error = %e, fallback = %Filter::default(), "invalid initial filter in config");
        Filter::default()
    });

    let mut surfaces: Vec<Box<dyn Surface>> = Vec::new();
    let mut readers = Vec::new();
    for name in &config.display.surfaces {
        let (surface, reader) = RasterSurface::new(name.as_str());
        surfaces.push(Box::new(surface));
        readers.push(reader);
    }

    let frame_loop = FrameLoop::new(surfaces, initial_filter);
    let (board, status) = StatusBoard::new(initial_filter);
    let opener = CameraOpener {
        config: config.stream.clone(),
    };
    let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let session = Session::new(frame_loop, opener, board, config.display.refresh_hz);
    let session_task = tokio::spawn(session.run(command_rx));

    if config.control.autostart && commands.send(Command::Start).await.is_err() {
        error!("session exited before autostart");
        std::process::exit(1);
    }

    let state = Arc::new(control::AppState {
        commands,
        status,
        surfaces: readers,
        jpeg_quality: config.control.jpeg_quality,
    });
    let app = control::router(state);

    let addr = config.control.bind.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    info!(addr, "control server listening");

    // Open MJPEG streams end only when their surface goes away, so shutdown
    // stops the session as well as the listener.
    let session_handle = session_task.abort_handle();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            session_handle.abort();
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "control server failed");
    }

    match session_task.await {
        Err(e) if e.is_panic() => error!(error = %e, "session task panicked"),
        _ => {}
    }
    info!("cvd-lens viewer stopped");
}
