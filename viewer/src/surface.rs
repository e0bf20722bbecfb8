use std::io::Cursor;
use std::sync::Arc;

use cvd_lens_common::frame::{Dimensions, FrameBuffer};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tokio::sync::watch;

/// A raster target that accepts a full pixel buffer once per tick.
pub trait Surface: Send {
    fn name(&self) -> &str;

    fn dimensions(&self) -> Dimensions;

    /// Set the size the next [`Surface::put_image`] must have. What is on
    /// screen stays until that frame replaces it.
    fn resize(&mut self, dims: Dimensions);

    /// Replace the surface contents with `frame`. Dimensions must match.
    fn put_image(&mut self, frame: &FrameBuffer) -> Result<(), SurfaceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("surface '{surface}' is {expected}, frame is {got}")]
    SizeMismatch {
        surface: String,
        expected: Dimensions,
        got: Dimensions,
    },
    #[error("failed to encode surface image: {0}")]
    Encode(String),
}

/// The image currently shown on a surface.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub dims: Dimensions,
    pub rgba: Vec<u8>,
    /// Source sequence number of the presented frame.
    pub seq: u64,
    /// Number of frames presented since the surface was created.
    pub presented: u64,
}

impl Snapshot {
    /// Encode as JPEG. Alpha is dropped.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, SurfaceError> {
        if self.dims.is_empty() {
            return Err(SurfaceError::Encode("surface is empty".into()));
        }
        let rgb: Vec<u8> = self
            .rgba
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();
        let mut out = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&rgb, self.dims.width, self.dims.height, ExtendedColorType::Rgb8)
            .map_err(|e| SurfaceError::Encode(e.to_string()))?;
        Ok(out.into_inner())
    }
}

/// In-memory surface. The last presented image is published through a
/// `watch` channel so readers (the HTTP control surface) can sample it.
pub struct RasterSurface {
    name: String,
    dims: Dimensions,
    tx: watch::Sender<Snapshot>,
}

impl RasterSurface {
    pub fn new(name: impl Into<String>) -> (Self, SurfaceReader) {
        let name = name.into();
        let (tx, rx) = watch::channel(Snapshot::default());
        let reader = SurfaceReader {
            name: Arc::from(name.as_str()),
            rx,
        };
        (
            Self {
                name,
                dims: Dimensions::default(),
                tx,
            },
            reader,
        )
    }
}

impl Surface for RasterSurface {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> Dimensions {
        self.dims
    }

    fn resize(&mut self, dims: Dimensions) {
        // Readers keep seeing the last presented frame; nothing is published.
        self.dims = dims;
    }

    fn put_image(&mut self, frame: &FrameBuffer) -> Result<(), SurfaceError> {
        if frame.dimensions() != self.dims {
            return Err(SurfaceError::SizeMismatch {
                surface: self.name.clone(),
                expected: self.dims,
                got: frame.dimensions(),
            });
        }
        // Copies into the existing allocation.
        self.tx.send_modify(|snapshot| {
            if snapshot.dims != self.dims {
                snapshot.dims = self.dims;
                snapshot.rgba.resize(self.dims.byte_len(), 0);
            }
            snapshot.rgba.copy_from_slice(frame.as_bytes());
            snapshot.seq = frame.seq;
            snapshot.presented += 1;
        });
        Ok(())
    }
}

/// Read side of a [`RasterSurface`].
#[derive(Debug, Clone)]
pub struct SurfaceReader {
    name: Arc<str>,
    rx: watch::Receiver<Snapshot>,
}

impl SurfaceReader {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last presented image, or `None` before the first presentation.
    pub fn latest(&self) -> Option<Snapshot> {
        let snapshot = self.rx.borrow();
        (snapshot.presented > 0).then(|| snapshot.clone())
    }

    /// Wait for the next presentation. `None` once the surface is gone.
    pub async fn next(&mut self) -> Option<Snapshot> {
        loop {
            self.rx.changed().await.ok()?;
            let snapshot = self.rx.borrow_and_update();
            if snapshot.presented > 0 {
                return Some(snapshot.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(dims: Dimensions, fill: u8) -> FrameBuffer {
        let mut buf = FrameBuffer::new(dims);
        buf.as_bytes_mut().fill(fill);
        buf
    }

    #[test]
    fn put_image_publishes_snapshot() {
        let (mut surface, reader) = RasterSurface::new("filtered");
        assert!(reader.latest().is_none());

        let dims = Dimensions::new(4, 2);
        surface.resize(dims);
        let mut buf = frame(dims, 9);
        buf.seq = 17;
        surface.put_image(&buf).unwrap();

        let snapshot = reader.latest().unwrap();
        assert_eq!(snapshot.dims, dims);
        assert_eq!(snapshot.rgba, buf.as_bytes());
        assert_eq!(snapshot.seq, 17);
        assert_eq!(snapshot.presented, 1);
        assert_eq!(reader.name(), "filtered");
    }

    #[test]
    fn put_image_rejects_wrong_size() {
        let (mut surface, _reader) = RasterSurface::new("mirror");
        surface.resize(Dimensions::new(4, 4));
        let err = surface
            .put_image(&frame(Dimensions::new(2, 2), 0))
            .unwrap_err();
        assert!(matches!(err, SurfaceError::SizeMismatch { .. }));
    }

    #[test]
    fn encodes_jpeg() {
        let (mut surface, reader) = RasterSurface::new("filtered");
        let dims = Dimensions::new(16, 8);
        surface.resize(dims);
        surface.put_image(&frame(dims, 128)).unwrap();
        let jpeg = reader.latest().unwrap().encode_jpeg(85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn empty_snapshot_does_not_encode() {
        assert!(Snapshot::default().encode_jpeg(80).is_err());
    }

    #[test]
    fn resize_keeps_last_presented_frame() {
        let (mut surface, reader) = RasterSurface::new("filtered");
        let dims = Dimensions::new(4, 2);
        surface.resize(dims);
        surface.put_image(&frame(dims, 42)).unwrap();
        let before = reader.latest().unwrap();

        surface.resize(dims);
        surface.resize(Dimensions::new(8, 8));
        let after = reader.latest().unwrap();
        assert_eq!(after.dims, dims);
        assert_eq!(after.rgba, before.rgba);
        assert_eq!(after.presented, 1);

        let bigger = Dimensions::new(8, 8);
        surface.put_image(&frame(bigger, 7)).unwrap();
        let replaced = reader.latest().unwrap();
        assert_eq!(replaced.dims, bigger);
        assert!(replaced.rgba.iter().all(|&b| b == 7));
        assert_eq!(replaced.rgba.len(), bigger.byte_len());
    }

    #[tokio::test]
    async fn resize_does_not_wake_readers() {
        let (mut surface, mut reader) = RasterSurface::new("filtered");
        let dims = Dimensions::new(2, 2);
        surface.resize(dims);
        surface.put_image(&frame(dims, 5)).unwrap();
        reader.next().await.unwrap();

        surface.resize(Dimensions::new(3, 3));
        let woke = tokio::time::timeout(std::time::Duration::from_millis(50), reader.next()).await;
        assert!(woke.is_err(), "resize published a frame");
    }

    #[tokio::test]
    async fn next_waits_for_presentation() {
        let (mut surface, mut reader) = RasterSurface::new("filtered");
        let dims = Dimensions::new(2, 2);
        surface.resize(dims);
        surface.put_image(&frame(dims, 5)).unwrap();
        let snapshot = reader.next().await.unwrap();
        assert_eq!(snapshot.presented, 1);

        drop(surface);
        assert!(reader.next().await.is_none());
    }
}
