//! Camera acquisition: open the configured stream and wait for its first
//! frame, classifying every failure into one of the categories the status
//! channel reports.

use std::time::Duration;

use cvd_lens_common::config::{rate_period, StreamConfig};
use cvd_lens_common::frame::Dimensions;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::source::{mjpeg, pattern, polling, IngestError, LiveSource};

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("camera not found: {0}")]
    DeviceNotFound(String),
    #[error("camera acquisition failed ({category}): {detail}")]
    Other {
        category: &'static str,
        detail: String,
    },
}

impl AcquisitionError {
    fn other(category: &'static str, detail: impl ToString) -> Self {
        Self::Other {
            category,
            detail: detail.to_string(),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::DeviceNotFound(_) => "DeviceNotFound",
            Self::Other { category, .. } => category,
        }
    }

    /// Text for the status channel. Details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied(_) => {
                "Camera access was denied. Please check the camera's access settings.".into()
            }
            Self::DeviceNotFound(_) => {
                "No camera was found. Make sure a camera is connected and enabled.".into()
            }
            Self::Other { category, .. } => {
                format!("An error occurred: {category}. Please check the logs for details.")
            }
        }
    }

    fn from_status(status: StatusCode, url: &str) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::PermissionDenied(format!("{url} answered {status}"))
            }
            StatusCode::NOT_FOUND => Self::DeviceNotFound(format!("{url} answered {status}")),
            _ => Self::other("HttpStatus", format!("{url} answered {status}")),
        }
    }

    fn from_request(err: reqwest::Error, url: &str) -> Self {
        if err.is_timeout() {
            Self::other("Timeout", err)
        } else if err.is_connect() {
            Self::DeviceNotFound(format!("could not connect to {url}: {err}"))
        } else if let Some(status) = err.status() {
            Self::from_status(status, url)
        } else {
            Self::other("Transport", err)
        }
    }

    fn from_ingest(err: IngestError, url: &str) -> Self {
        match err {
            IngestError::Http(e) => Self::from_request(e, url),
            IngestError::HttpStatus(status) => Self::from_status(status, url),
            IngestError::StreamFormat(detail) => Self::other("UnsupportedStream", detail),
            IngestError::Decode(e) => Self::other("Decode", e),
            IngestError::Timeout(t) => Self::other("Timeout", format!("no frame within {t:?}")),
            e @ (IngestError::EndedEarly | IngestError::Task(_)) => Self::other("NotReadable", e),
        }
    }
}

/// The stream URL with the capture preferences appended as query parameters.
pub fn stream_url(base: &str, config: &StreamConfig) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!(
        "{base}{sep}quality={}&fps={}&facing={}",
        config.quality, config.fps, config.facing
    )
}

/// Open the camera described by `config` and wait until it produces a frame.
pub async fn acquire(config: &StreamConfig) -> Result<LiveSource, AcquisitionError> {
    let url = match config.mode.as_str() {
        "polling" => stream_url(&polling::frame_url(&config.url), config),
        _ => stream_url(&config.url, config),
    };
    info!(mode = config.mode, url, "requesting camera");

    let mut source = match config.mode.as_str() {
        "mjpeg" => open_mjpeg(&url, config).await?,
        "polling" => open_polling(&url, config).await?,
        "test-pattern" => {
            let dims = Dimensions::new(config.pattern_width, config.pattern_height);
            let interval = frame_interval(config.fps)?;
            LiveSource::spawn("test-pattern", move |feed| {
                pattern::ingest(dims, interval, feed)
            })
        }
        other => {
            return Err(AcquisitionError::other(
                "UnsupportedStream",
                format!("unknown stream mode '{other}', expected 'mjpeg', 'polling' or 'test-pattern'"),
            ))
        }
    };

    let timeout = Duration::from_secs(config.first_frame_timeout_secs);
    let dims = source
        .first_frame(timeout)
        .await
        .map_err(|e| AcquisitionError::from_ingest(e, &url))?;
    info!(width = dims.width, height = dims.height, "camera producing frames");
    Ok(source)
}

fn frame_interval(fps: f64) -> Result<Duration, AcquisitionError> {
    rate_period(fps).ok_or_else(|| {
        AcquisitionError::other("InvalidConfig", format!("stream.fps {fps} is not a usable rate"))
    })
}

fn http_client(config: &StreamConfig) -> Result<reqwest::Client, AcquisitionError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()
        .map_err(|e| AcquisitionError::other("Transport", e))
}

async fn open_mjpeg(url: &str, config: &StreamConfig) -> Result<LiveSource, AcquisitionError> {
    let client = http_client(config)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AcquisitionError::from_request(e, url))?;

    if !response.status().is_success() {
        return Err(AcquisitionError::from_status(response.status(), url));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.to_ascii_lowercase().starts_with("multipart/") {
        return Err(AcquisitionError::other(
            "UnsupportedStream",
            format!("expected a multipart MJPEG stream, got '{content_type}'"),
        ));
    }
    let boundary = mjpeg::boundary_from_content_type(&content_type)
        .unwrap_or_else(|| mjpeg::DEFAULT_BOUNDARY.to_string());
    debug!(content_type, boundary, "MJPEG stream accepted");

    Ok(LiveSource::spawn("mjpeg", move |feed| {
        mjpeg::ingest(response, boundary, feed)
    }))
}

async fn open_polling(url: &str, config: &StreamConfig) -> Result<LiveSource, AcquisitionError> {
    let client = http_client(config)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AcquisitionError::from_request(e, url))?;

    if !response.status().is_success() {
        return Err(AcquisitionError::from_status(response.status(), url));
    }
    let first = response
        .bytes()
        .await
        .map_err(|e| AcquisitionError::from_request(e, url))?;

    let interval = frame_interval(config.fps)?;
    let url = url.to_string();
    Ok(LiveSource::spawn("polling", move |feed| {
        polling::ingest(client, url, interval, first, feed)
    }))
}
