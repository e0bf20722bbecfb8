//! The per-frame pipeline: pull the current frame from the source, transform
//! every pixel through the active filter matrix, and present the result to
//! every output surface.
//!
//! ```text
//!            start()                source paused/ended
//!   Idle ──────────────▶ Running ─────────────────────────▶ Stopped
//!                          │  ▲        tick error               │
//!                          └──┘ tick() ─────────────────▶ Stopped
//!                                                              │
//!   Stopped ──────────────────── start() ──────────────────────┘
//! ```
//!
//! The loop does not schedule itself. The host calls [`FrameLoop::tick`] once
//! per display refresh for as long as [`FrameLoop::state`] is `Running`.

use cvd_lens_common::color::{Filter, UnknownFilter};
use cvd_lens_common::frame::{Dimensions, FrameBuffer};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::source::{PlaybackState, SourceError, VideoSource};
use crate::surface::{Surface, SurfaceError};

const PROGRESS_LOG_INTERVAL: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was rendered; the host should tick again on the next refresh.
    Rendered { seq: u64 },
    /// The loop is not running; do not reschedule.
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("source '{0}' reports zero dimensions and is not producing frames yet")]
    SourceNotReady(String),
    #[error("frame loop is already running")]
    AlreadyRunning,
}

#[derive(Debug, thiserror::Error)]
enum TickError {
    #[error("no source attached")]
    NoSource,
    #[error("source reports zero dimensions")]
    SourceLost,
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

pub struct FrameLoop {
    state: LoopState,
    source: Option<Box<dyn VideoSource>>,
    surfaces: Vec<Box<dyn Surface>>,
    filter: Filter,
    buffer: FrameBuffer,
    frames_rendered: u64,
}

impl FrameLoop {
    pub fn new(surfaces: Vec<Box<dyn Surface>>, filter: Filter) -> Self {
        Self {
            state: LoopState::Idle,
            source: None,
            surfaces,
            filter,
            buffer: FrameBuffer::default(),
            frames_rendered: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Attach `source` and begin running. Allowed from `Idle` or `Stopped`.
    pub fn start(&mut self, source: Box<dyn VideoSource>) -> Result<(), LoopError> {
        if self.state == LoopState::Running {
            return Err(LoopError::AlreadyRunning);
        }
        let dims = source.dimensions();
        if dims.is_empty() {
            return Err(LoopError::SourceNotReady(source.name().to_string()));
        }

        self.buffer.resize(dims);
        self.resize_surfaces(dims);
        info!(
            source = source.name(),
            width = dims.width,
            height = dims.height,
            filter = %self.filter,
            surfaces = self.surfaces.len(),
            "frame loop running"
        );
        self.source = Some(source);
        self.state = LoopState::Running;
        Ok(())
    }

    /// Select the filter used from the next tick on. An unknown name leaves
    /// the current selection in place.
    pub fn set_filter(&mut self, name: &str) -> Result<Filter, UnknownFilter> {
        match name.parse::<Filter>() {
            Ok(filter) => {
                if filter != self.filter {
                    info!(from = %self.filter, to = %filter, "filter changed");
                }
                self.filter = filter;
                Ok(filter)
            }
            Err(e) => {
                warn!(error = %e, current = %self.filter, "rejected filter selection");
                Err(e)
            }
        }
    }

    /// Pause the attached source. Returns `false` if there is none.
    pub fn pause_source(&mut self) -> bool {
        match self.source.as_mut() {
            Some(source) => {
                source.pause();
                true
            }
            None => false,
        }
    }

    /// One unit of per-frame work. Never fails: any error is logged and
    /// stops the loop, leaving the last presented frame on every surface.
    pub fn tick(&mut self) -> TickOutcome {
        if self.state != LoopState::Running {
            return TickOutcome::Stopped;
        }

        let playback = self
            .source
            .as_ref()
            .map_or(PlaybackState::Ended, |s| s.playback());
        if playback != PlaybackState::Playing {
            info!(
                ?playback,
                frames_rendered = self.frames_rendered,
                "source no longer playing, stopping frame loop"
            );
            self.halt();
            return TickOutcome::Stopped;
        }

        match self.render() {
            Ok(seq) => {
                self.frames_rendered += 1;
                if self.frames_rendered % PROGRESS_LOG_INTERVAL == 0 {
                    debug!(frames_rendered = self.frames_rendered, seq, "frames rendered");
                }
                TickOutcome::Rendered { seq }
            }
            Err(e) => {
                error!(
                    error = %e,
                    frames_rendered = self.frames_rendered,
                    "tick failed, stopping frame loop"
                );
                self.halt();
                TickOutcome::Stopped
            }
        }
    }

    fn render(&mut self) -> Result<u64, TickError> {
        // Read once: a selection change applies to whole ticks only.
        let matrix = self.filter.matrix();

        let source = self.source.as_mut().ok_or(TickError::NoSource)?;
        if source.dimensions().is_empty() {
            return Err(TickError::SourceLost);
        }
        source.draw_into(&mut self.buffer)?;

        let dims = self.buffer.dimensions();
        if self.surfaces.iter().any(|s| s.dimensions() != dims) {
            info!(
                width = dims.width,
                height = dims.height,
                "source dimensions changed, resizing surfaces"
            );
            self.resize_surfaces(dims);
        }

        // All or nothing: a surface that refused the resize must not leave
        // the others showing a frame it lacks.
        if let Some(stale) = self.surfaces.iter().find(|s| s.dimensions() != dims) {
            return Err(TickError::Surface(SurfaceError::SizeMismatch {
                surface: stale.name().to_string(),
                expected: stale.dimensions(),
                got: dims,
            }));
        }

        self.buffer.apply_matrix(&matrix);

        for surface in &mut self.surfaces {
            surface.put_image(&self.buffer)?;
        }
        Ok(self.buffer.seq)
    }

    fn resize_surfaces(&mut self, dims: Dimensions) {
        for surface in &mut self.surfaces {
            surface.resize(dims);
        }
    }

    fn halt(&mut self) {
        self.state = LoopState::Stopped;
        // Dropping the source releases its ingest task.
        self.source = None;
    }
}
