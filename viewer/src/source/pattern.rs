use std::time::Duration;

use cvd_lens_common::frame::Dimensions;
use image::{Rgba, RgbaImage};
use tracing::debug;

use super::{FrameFeed, IngestError};

/// SMPTE-style bars: white, yellow, cyan, green, magenta, red, blue, black.
const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

/// Render one frame of scrolling colour bars. `phase` shifts the bars left by
/// that many pixels.
pub fn render(dims: Dimensions, phase: u32) -> RgbaImage {
    let bar_width = (dims.width / BARS.len() as u32).max(1);
    RgbaImage::from_fn(dims.width, dims.height, |x, _y| {
        let shifted = (x + phase) % dims.width.max(1);
        let bar = ((shifted / bar_width) as usize).min(BARS.len() - 1);
        let [r, g, b] = BARS[bar];
        Rgba([r, g, b, 255])
    })
}

/// Publish animated colour bars at `interval` until the source is dropped.
pub async fn ingest(
    dims: Dimensions,
    interval: Duration,
    mut feed: FrameFeed,
) -> Result<(), IngestError> {
    if dims.is_empty() {
        return Err(IngestError::StreamFormat(format!(
            "test pattern needs non-zero dimensions, got {dims}"
        )));
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut phase = 0u32;

    loop {
        ticker.tick().await;
        if feed.is_closed() {
            debug!("source dropped, stopping test pattern");
            return Ok(());
        }
        let image = render(dims, phase);
        feed.publish(image);
        phase = (phase + 4) % dims.width;
    }
}
