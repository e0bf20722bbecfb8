use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{FrameFeed, IngestError};

pub const DEFAULT_BOUNDARY: &str = "frame";
/// Largest part (headers plus JPEG) accepted before the stream is rejected.
pub const MAX_PART_BYTES: usize = 16 * 1024 * 1024;
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

#[derive(Debug, thiserror::Error)]
#[error("multipart part grew past {limit} bytes without a closing boundary")]
pub struct PartTooLarge {
    pub limit: usize,
}

/// Incremental splitter for `multipart/x-mixed-replace` bodies.
pub struct MultipartParser {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
    max_part: usize,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        Self::with_limit(boundary, MAX_PART_BYTES)
    }

    pub fn with_limit(boundary: &str, max_part: usize) -> Self {
        Self {
            delimiter: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
            max_part,
        }
    }

    fn check_limit(&self) -> Result<(), PartTooLarge> {
        if self.buffer.len() > self.max_part {
            return Err(PartTooLarge {
                limit: self.max_part,
            });
        }
        Ok(())
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete part body, if one is buffered. Fails once the
    /// part in progress exceeds the size limit.
    pub fn next_part(&mut self) -> Result<Option<Bytes>, PartTooLarge> {
        let boundary_len = self.delimiter.len();
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.delimiter) {
                        // Discard everything up to and including the boundary
                        let _ = self.buffer.split_to(pos + boundary_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case boundary spans chunks
                        if self.buffer.len() > boundary_len {
                            let _ = self.buffer.split_to(self.buffer.len() - boundary_len);
                        }
                        return Ok(None);
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let Some(pos) = find_subsequence(&self.buffer, HEADER_END) else {
                        self.check_limit()?;
                        return Ok(None);
                    };
                    let _ = self.buffer.split_to(pos + HEADER_END.len());
                    self.jpeg_start = 0;
                    self.state = ParseState::CollectingJpeg;
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) =
                        find_subsequence(&self.buffer[self.jpeg_start..], &self.delimiter)
                    else {
                        // Don't re-scan what has already been searched.
                        self.jpeg_start = self.buffer.len().saturating_sub(boundary_len);
                        self.check_limit()?;
                        return Ok(None);
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // Strip trailing \r\n before boundary
                    let end = if jpeg_end >= 2
                        && self.buffer[jpeg_end - 2] == b'\r'
                        && self.buffer[jpeg_end - 1] == b'\n'
                    {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let part = self.buffer.split_to(jpeg_end + boundary_len);
                    // Already past boundary, go to header parsing
                    self.state = ParseState::SeekingHeaderEnd;
                    return Ok(Some(part.freeze().slice(..end)));
                }
            }
        }
    }
}

/// Extract the `boundary` parameter of a multipart content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        // Some cameras put the leading dashes into the parameter itself.
        let value = value.strip_prefix("--").unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Frame one JPEG as a multipart part, in the layout [`MultipartParser`] reads.
pub fn encode_part(boundary: &str, jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Read an MJPEG response body and publish every decoded part.
///
/// A part that fails to decode is skipped, unless no frame has been published
/// yet; then the stream is treated as unreadable.
pub async fn ingest(
    response: reqwest::Response,
    boundary: String,
    mut feed: FrameFeed,
) -> Result<(), IngestError> {
    info!(status = %response.status(), boundary, "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MultipartParser::new(&boundary);

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk?;
        parser.push(&chunk);

        while let Some(jpeg) = parser
            .next_part()
            .map_err(|e| IngestError::StreamFormat(e.to_string()))?
        {
            if jpeg.is_empty() {
                continue;
            }
            let bytes = jpeg.len();
            match feed.publish_jpeg(jpeg.to_vec()).await {
                Ok(seq) => debug!(seq, bytes, "MJPEG part published"),
                Err(e) if feed.published() == 0 => return Err(e.into()),
                Err(e) => warn!(error = %e, bytes, "failed to decode MJPEG part, skipping"),
            }
        }

        if feed.is_closed() {
            debug!("source dropped, closing MJPEG stream");
            return Ok(());
        }
    }

    Ok(())
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut MultipartParser) -> Vec<Bytes> {
        std::iter::from_fn(|| parser.next_part().unwrap()).collect()
    }

    #[test]
    fn splits_parts_in_one_chunk() {
        let mut body = Vec::new();
        body.extend_from_slice(&encode_part("frame", b"first"));
        body.extend_from_slice(&encode_part("frame", b"second"));
        body.extend_from_slice(&encode_part("frame", b""));

        let mut parser = MultipartParser::new("frame");
        parser.push(&body);
        // The last part stays buffered until the following boundary arrives.
        assert_eq!(collect(&mut parser), vec![&b"first"[..], &b"second"[..]]);
    }

    #[test]
    fn survives_boundary_split_across_chunks() {
        let mut body = Vec::new();
        body.extend_from_slice(b"preamble junk\r\n");
        body.extend_from_slice(&encode_part("frame", b"\xFF\xD8jpeg-bytes\xFF\xD9"));
        body.extend_from_slice(&encode_part("frame", b"tail"));

        let mut parser = MultipartParser::new("frame");
        let mut parts = Vec::new();
        for chunk in body.chunks(3) {
            parser.push(chunk);
            parts.extend(collect(&mut parser));
        }
        assert_eq!(parts, vec![&b"\xFF\xD8jpeg-bytes\xFF\xD9"[..]]);
    }

    #[test]
    fn custom_boundary_is_respected() {
        let mut parser = MultipartParser::new("myboundary");
        parser.push(&encode_part("frame", b"ignored"));
        parser.push(&encode_part("myboundary", b"kept"));
        parser.push(&encode_part("myboundary", b"next"));
        assert_eq!(collect(&mut parser), vec![&b"kept"[..]]);
    }

    #[test]
    fn oversized_part_is_rejected() {
        let mut parser = MultipartParser::with_limit("frame", 64);
        parser.push(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        assert!(parser.next_part().unwrap().is_none());
        parser.push(&[0xAB; 100]);
        let err = parser.next_part().unwrap_err();
        assert_eq!(err.limit, 64);
    }

    #[test]
    fn endless_headers_are_rejected() {
        let mut parser = MultipartParser::with_limit("frame", 64);
        parser.push(b"--frame\r\n");
        parser.push(&[b'x'; 100]);
        assert!(parser.next_part().is_err());
    }

    #[test]
    fn parts_under_the_limit_pass() {
        let mut parser = MultipartParser::with_limit("frame", 64);
        parser.push(&encode_part("frame", &[1; 20]));
        parser.push(&encode_part("frame", &[2; 20]));
        assert_eq!(collect(&mut parser), vec![Bytes::from(vec![1u8; 20])]);
    }

    #[test]
    fn boundary_parameter_parsing() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame"),
            Some("frame".into())
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"--cam\""),
            Some("cam".into())
        );
        assert_eq!(boundary_from_content_type("multipart/x-mixed-replace"), None);
        assert_eq!(boundary_from_content_type("image/jpeg; charset=x"), None);
    }
}
