//! The host side of the frame loop: a single task that owns the [`FrameLoop`],
//! ticks it once per display refresh, and applies control commands between
//! ticks. Nothing else touches the loop, so a filter change can never land in
//! the middle of a frame.

use std::time::Duration;

use cvd_lens_common::color::{Filter, UnknownFilter};
use cvd_lens_common::config::{rate_period, StreamConfig};
use futures_util::future::{BoxFuture, OptionFuture};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::acquire::{acquire, AcquisitionError};
use crate::frame_loop::{FrameLoop, LoopError, LoopState, TickOutcome};
use crate::source::VideoSource;

pub const MSG_READY: &str = "Press start to open the camera.";
pub const MSG_REQUESTING: &str = "Requesting camera access...";
pub const MSG_RUNNING: &str = "Camera is running!";
pub const MSG_STOPPED: &str = "Camera stopped.";

pub const DEFAULT_REFRESH_HZ: u32 = 60;

#[derive(Debug)]
pub enum Command {
    /// Acquire the camera and start the frame loop.
    Start,
    SetFilter {
        name: String,
        reply: oneshot::Sender<Result<Filter, UnknownFilter>>,
    },
    /// Pause the source; the loop stops on its next tick.
    Pause,
}

/// What the status channel shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub message: String,
    pub state: LoopState,
    pub filter: Filter,
    pub start_enabled: bool,
    pub frames_rendered: u64,
    pub error_category: Option<String>,
}

/// Publishes [`Status`] updates to any number of readers.
pub struct StatusBoard {
    tx: watch::Sender<Status>,
}

impl StatusBoard {
    pub fn new(filter: Filter) -> (Self, watch::Receiver<Status>) {
        let (tx, rx) = watch::channel(Status {
            message: MSG_READY.into(),
            state: LoopState::Idle,
            filter,
            start_enabled: true,
            frames_rendered: 0,
            error_category: None,
        });
        (Self { tx }, rx)
    }

    pub fn update(&self, f: impl FnOnce(&mut Status)) {
        self.tx.send_modify(f);
    }

    pub fn current(&self) -> Status {
        self.tx.borrow().clone()
    }
}

pub type Opening = BoxFuture<'static, Result<Box<dyn VideoSource>, AcquisitionError>>;

/// Opens a video source on request. The returned future owns everything it
/// needs so the session can keep serving commands while it runs.
pub trait SourceOpener: Send {
    fn open(&mut self) -> Opening;
}

/// Opens the camera described by the `[stream]` config section.
pub struct CameraOpener {
    pub config: StreamConfig,
}

impl SourceOpener for CameraOpener {
    fn open(&mut self) -> Opening {
        let config = self.config.clone();
        Box::pin(async move {
            let source = acquire(&config).await?;
            Ok(Box::new(source) as Box<dyn VideoSource>)
        })
    }
}

pub struct Session<O> {
    frame_loop: FrameLoop,
    opener: O,
    status: StatusBoard,
    refresh: Duration,
    /// Acquisition in flight, polled as its own `select!` branch.
    opening: Option<Opening>,
}

impl<O: SourceOpener> Session<O> {
    /// An unusable `refresh_hz` falls back to [`DEFAULT_REFRESH_HZ`].
    pub fn new(frame_loop: FrameLoop, opener: O, status: StatusBoard, refresh_hz: f64) -> Self {
        let refresh = rate_period(refresh_hz).unwrap_or_else(|| {
            warn!(refresh_hz, fallback = DEFAULT_REFRESH_HZ, "unusable refresh rate");
            Duration::from_secs(1) / DEFAULT_REFRESH_HZ
        });
        Self {
            frame_loop,
            opener,
            status,
            refresh,
            opening: None,
        }
    }

    /// Drive the loop until every command sender is gone.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = refresh_ticker(self.refresh);
        info!(refresh = ?self.refresh, "session started");

        loop {
            let running = self.frame_loop.state() == LoopState::Running;
            let opening = self.opening.is_some();
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => {
                        info!("control channel closed, session exiting");
                        break;
                    }
                },
                Some(opened) = OptionFuture::from(self.opening.as_mut()), if opening => {
                    self.opening = None;
                    if self.finish_start(opened) {
                        ticker.reset();
                    }
                }
                _ = ticker.tick(), if running => self.on_tick(),
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Start => self.begin_start(),
            Command::SetFilter { name, reply } => {
                let result = self.frame_loop.set_filter(&name);
                if let Ok(filter) = result {
                    self.status.update(|s| s.filter = filter);
                }
                // The requester may have given up waiting.
                let _ = reply.send(result);
            }
            Command::Pause => {
                if self.opening.take().is_some() {
                    info!("camera request cancelled");
                    self.status.update(|s| {
                        s.message = MSG_STOPPED.into();
                        s.start_enabled = true;
                    });
                } else if !self.frame_loop.pause_source() {
                    debug!("pause requested with no active source");
                }
            }
        }
    }

    fn begin_start(&mut self) {
        if !self.status.current().start_enabled || self.opening.is_some() {
            warn!("start requested while start control is disabled, ignoring");
            return;
        }
        self.status.update(|s| {
            s.message = MSG_REQUESTING.into();
            s.start_enabled = false;
            s.error_category = None;
        });
        self.opening = Some(self.opener.open());
    }

    /// Returns `true` when the loop was (re)started.
    fn finish_start(&mut self, opened: Result<Box<dyn VideoSource>, AcquisitionError>) -> bool {
        let started = match opened {
            Ok(source) => self.frame_loop.start(source).map_err(|e| {
                error!(error = %e, "frame loop refused source");
                let category = match e {
                    LoopError::SourceNotReady(_) => "SourceNotReady",
                    LoopError::AlreadyRunning => "AlreadyRunning",
                };
                (
                    format!("An error occurred: {category}. Please check the logs for details."),
                    category,
                )
            }),
            Err(e) => {
                error!(error = %e, category = e.category(), "camera acquisition failed");
                Err((e.user_message(), e.category()))
            }
        };

        match started {
            Ok(()) => {
                self.status.update(|s| {
                    s.message = MSG_RUNNING.into();
                    s.state = LoopState::Running;
                    s.filter = self.frame_loop.filter();
                    s.frames_rendered = self.frame_loop.frames_rendered();
                });
                true
            }
            Err((message, category)) => {
                self.status.update(|s| {
                    s.message = message;
                    s.start_enabled = true;
                    s.error_category = Some(category.to_string());
                });
                false
            }
        }
    }

    fn on_tick(&mut self) {
        match self.frame_loop.tick() {
            TickOutcome::Rendered { seq } => {
                let frames = self.frame_loop.frames_rendered();
                trace!(seq, frames, "frame presented");
                self.status.update(|s| s.frames_rendered = frames);
            }
            TickOutcome::Stopped => {
                info!(
                    frames_rendered = self.frame_loop.frames_rendered(),
                    "frame loop stopped"
                );
                self.status.update(|s| {
                    s.message = MSG_STOPPED.into();
                    s.state = self.frame_loop.state();
                    s.start_enabled = true;
                });
            }
        }
    }
}

fn refresh_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    // A slow tick pushes the next one back instead of bursting to catch up.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
