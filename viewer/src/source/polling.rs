use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{FrameFeed, IngestError};

/// Single-frame endpoint next to a stream endpoint (`.../stream` -> `.../frame`).
pub fn frame_url(stream_url: &str) -> String {
    stream_url.replace("/stream", "/frame")
}

/// Polling fallback: periodically fetch single JPEG frames.
///
/// `first` is the body already fetched while acquiring the camera; it is
/// published before the first poll. Any failed request ends the source.
pub async fn ingest(
    client: reqwest::Client,
    url: String,
    interval: Duration,
    first: Bytes,
    mut feed: FrameFeed,
) -> Result<(), IngestError> {
    feed.publish_jpeg(first.to_vec()).await?;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial frame covers it.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if feed.is_closed() {
            debug!("source dropped, stopping polling");
            return Ok(());
        }

        let resp = client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(IngestError::HttpStatus(resp.status()));
        }
        let jpeg = resp.bytes().await?;
        if let Err(e) = feed.publish_jpeg(jpeg.to_vec()).await {
            warn!(error = %e, "failed to decode polled frame, skipping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_url_swaps_stream_suffix() {
        assert_eq!(
            frame_url("http://cam.local:8080/stream"),
            "http://cam.local:8080/frame"
        );
        assert_eq!(frame_url("http://cam.local/live"), "http://cam.local/live");
    }
}
