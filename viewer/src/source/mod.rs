//! Live frame sources.
//!
//! A source exposes "the current frame" the way a playing video element does:
//! an ingest task decodes frames as they arrive and publishes the newest one
//! into a `watch` channel, and the frame loop samples whatever is latest when
//! it ticks. Frames that arrive between two ticks are superseded, never queued.

pub mod mjpeg;
pub mod pattern;
pub mod polling;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cvd_lens_common::frame::{Dimensions, FrameBuffer, FrameError, TimestampedFrame};
use image::RgbaImage;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Ended,
}

/// Handle to a continuously updating frame source.
///
/// The frame loop only needs to ask for the current dimensions, whether the
/// source is still playing, and to have the current frame drawn into its
/// buffer.
pub trait VideoSource: Send {
    /// Dimensions of the current frame; zero while nothing has arrived.
    fn dimensions(&self) -> Dimensions;

    fn playback(&self) -> PlaybackState;

    /// Rasterize the current frame into `target`, resizing it if needed.
    fn draw_into(&mut self, target: &mut FrameBuffer) -> Result<(), SourceError>;

    /// Stop pulling frames. The next tick observes `Paused` and stops.
    fn pause(&mut self);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source has not produced a frame yet")]
    NoFrame,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Why an ingest task ended or could not deliver its first frame.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("unsupported stream: {0}")]
    StreamFormat(String),
    #[error(transparent)]
    Decode(#[from] FrameError),
    #[error("no frame arrived within {0:?}")]
    Timeout(Duration),
    #[error("stream ended before the first frame")]
    EndedEarly,
    #[error("ingest task failed: {0}")]
    Task(String),
}

type Slot = Option<Arc<TimestampedFrame>>;

/// Publishing side of a [`LiveSource`], owned by the ingest task.
pub struct FrameFeed {
    tx: watch::Sender<Slot>,
    next_seq: u64,
}

impl FrameFeed {
    /// Number of frames published so far.
    pub fn published(&self) -> u64 {
        self.next_seq
    }

    /// `true` once the consuming source has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn publish(&mut self, image: RgbaImage) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let frame = TimestampedFrame::new(image, Utc::now().timestamp_millis(), seq);
        self.tx.send_replace(Some(Arc::new(frame)));
        seq
    }

    /// Decode `data` off the async runtime and publish the result.
    pub async fn publish_jpeg(&mut self, data: Vec<u8>) -> Result<u64, FrameError> {
        let captured_at_ms = Utc::now().timestamp_millis();
        let seq = self.next_seq;
        let frame = tokio::task::spawn_blocking(move || {
            TimestampedFrame::from_jpeg(&data, captured_at_ms, seq)
        })
        .await
        .map_err(|e| FrameError::Decode(e.to_string()))??;
        self.next_seq += 1;
        debug!(
            seq,
            width = frame.image.width(),
            height = frame.image.height(),
            "frame decoded"
        );
        self.tx.send_replace(Some(Arc::new(frame)));
        Ok(seq)
    }
}

/// A source fed by a background ingest task.
#[derive(Debug)]
pub struct LiveSource {
    name: String,
    frames: watch::Receiver<Slot>,
    task: Option<JoinHandle<Result<(), IngestError>>>,
    paused: bool,
}

impl LiveSource {
    /// Spawn `ingest` with a fresh feed. The source reports `Ended` once the
    /// task returns, whatever the reason.
    pub fn spawn<F, Fut>(name: impl Into<String>, ingest: F) -> Self
    where
        F: FnOnce(FrameFeed) -> Fut,
        Fut: Future<Output = Result<(), IngestError>> + Send + 'static,
    {
        let name = name.into();
        let (tx, frames) = watch::channel(None);
        let fut = ingest(FrameFeed { tx, next_seq: 0 });
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            let result = fut.await;
            match &result {
                Ok(()) => info!(source = task_name, "frame ingest ended"),
                Err(e) => warn!(source = task_name, error = %e, "frame ingest failed"),
            }
            result
        });
        Self {
            name,
            frames,
            task: Some(task),
            paused: false,
        }
    }

    /// Wait until the first frame has been published.
    pub async fn first_frame(&mut self, timeout: Duration) -> Result<Dimensions, IngestError> {
        let outcome = {
            let waited =
                tokio::time::timeout(timeout, self.frames.wait_for(Option::is_some)).await;
            match waited {
                Ok(Ok(slot)) => Some(Ok(match &*slot {
                    Some(frame) => frame.dimensions(),
                    None => Dimensions::default(),
                })),
                Ok(Err(_)) => None,
                Err(_) => Some(Err(IngestError::Timeout(timeout))),
            }
        };
        match outcome {
            Some(result) => result,
            None => Err(self.ingest_failure().await),
        }
    }

    async fn ingest_failure(&mut self) -> IngestError {
        match self.task.take() {
            Some(handle) => match handle.await {
                Ok(Err(e)) => e,
                Ok(Ok(())) => IngestError::EndedEarly,
                Err(e) => IngestError::Task(e.to_string()),
            },
            None => IngestError::EndedEarly,
        }
    }

    fn current(&self) -> Slot {
        self.frames.borrow().clone()
    }
}

impl VideoSource for LiveSource {
    fn dimensions(&self) -> Dimensions {
        self.current()
            .map(|f| f.dimensions())
            .unwrap_or_default()
    }

    fn playback(&self) -> PlaybackState {
        if self.paused {
            PlaybackState::Paused
        } else if self.frames.has_changed().is_err() {
            // Sender dropped: the ingest task has returned.
            PlaybackState::Ended
        } else {
            PlaybackState::Playing
        }
    }

    fn draw_into(&mut self, target: &mut FrameBuffer) -> Result<(), SourceError> {
        let frame = self.current().ok_or(SourceError::NoFrame)?;
        target.copy_from_frame(&frame);
        Ok(())
    }

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!(source = self.name, "source paused");
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[tokio::test]
    async fn first_frame_reports_dimensions() {
        let mut source = LiveSource::spawn("test", |mut feed| async move {
            feed.publish(RgbaImage::from_pixel(8, 6, Rgba([1, 2, 3, 255])));
            std::future::pending::<()>().await;
            Ok(())
        });
        let dims = source.first_frame(Duration::from_secs(5)).await.unwrap();
        assert_eq!(dims, Dimensions::new(8, 6));
        assert_eq!(source.dimensions(), Dimensions::new(8, 6));
        assert_eq!(source.playback(), PlaybackState::Playing);

        let mut buf = FrameBuffer::default();
        source.draw_into(&mut buf).unwrap();
        assert_eq!(buf.pixel(7, 5), Some([1, 2, 3, 255]));
    }

    #[tokio::test]
    async fn ingest_error_surfaces_through_first_frame() {
        let mut source = LiveSource::spawn("test", |_feed| async move {
            Err(IngestError::StreamFormat("text/html".into()))
        });
        let err = source.first_frame(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, IngestError::StreamFormat(_)));
    }

    #[tokio::test]
    async fn clean_exit_before_frame_is_ended_early() {
        let mut source = LiveSource::spawn("test", |_feed| async move { Ok(()) });
        let err = source.first_frame(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, IngestError::EndedEarly));
        assert_eq!(source.playback(), PlaybackState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn first_frame_times_out() {
        let mut source = LiveSource::spawn("test", |_feed| async move {
            std::future::pending::<()>().await;
            Ok(())
        });
        let err = source.first_frame(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, IngestError::Timeout(_)));
    }

    #[tokio::test]
    async fn source_ends_when_ingest_returns() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let mut source = LiveSource::spawn("test", |mut feed| async move {
            feed.publish(RgbaImage::new(2, 2));
            let _ = done_rx.await;
            Ok(())
        });
        source.first_frame(Duration::from_secs(5)).await.unwrap();
        assert_eq!(source.playback(), PlaybackState::Playing);

        done_tx.send(()).unwrap();
        // Poll until the task has dropped its feed.
        for _ in 0..100 {
            if source.playback() == PlaybackState::Ended {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.playback(), PlaybackState::Ended);
        // The last frame is still drawable.
        let mut buf = FrameBuffer::default();
        assert!(source.draw_into(&mut buf).is_ok());
    }

    #[tokio::test]
    async fn pause_is_sticky() {
        let mut source = LiveSource::spawn("test", |mut feed| async move {
            feed.publish(RgbaImage::new(2, 2));
            std::future::pending::<()>().await;
            Ok(())
        });
        source.first_frame(Duration::from_secs(5)).await.unwrap();
        source.pause();
        assert_eq!(source.playback(), PlaybackState::Paused);
    }

    #[test]
    fn draw_without_frame_fails() {
        let (_tx, frames) = watch::channel(None);
        let mut source = LiveSource {
            name: "empty".into(),
            frames,
            task: None,
            paused: false,
        };
        assert_eq!(source.dimensions(), Dimensions::default());
        assert!(matches!(
            source.draw_into(&mut FrameBuffer::default()),
            Err(SourceError::NoFrame)
        ));
    }
}
