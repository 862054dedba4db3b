//! Length-prefixed message framing.
//!
//! Each message on the wire is a header block followed by a UTF-8 body:
//!
//! ```text
//! Content-Length: 42\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"tools/list"}
//! ```
//!
//! The reader consumes the header strictly line by line up to the blank
//! separator, then reads exactly the declared number of body bytes. It never
//! peeks ahead, so it behaves the same on every platform's pipes.

use crate::error::FramingError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest header line accepted, including its line terminator.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Largest body accepted.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const CONTENT_LENGTH: &str = "content-length";

/// Build the full wire bytes for one message.
pub fn encode_frame(body: &str) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body.as_bytes());
    frame
}

/// Reads framed messages from a buffered byte stream.
pub struct FrameReader<R> {
    inner: R,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::with_capacity(128),
        }
    }

    /// Read the next message body.
    ///
    /// Returns `Ok(None)` on a clean end of stream between messages.
    pub async fn read_message(&mut self) -> Result<Option<String>, FramingError> {
        let Some(length) = self.read_header().await? else {
            return Ok(None);
        };

        let mut body = vec![0u8; length];
        let mut received = 0;
        while received < length {
            let n = self.inner.read(&mut body[received..]).await?;
            if n == 0 {
                return Err(FramingError::Truncated {
                    expected: length,
                    received,
                });
            }
            received += n;
        }

        Ok(Some(String::from_utf8(body)?))
    }

    /// Consume header lines up to the blank separator and return the declared length.
    async fn read_header(&mut self) -> Result<Option<usize>, FramingError> {
        let mut content_length = None;
        let mut seen_header = false;

        loop {
            self.line.clear();
            let n = (&mut self.inner)
                .take(MAX_HEADER_LINE as u64)
                .read_until(b'\n', &mut self.line)
                .await?;

            if n == 0 {
                return if seen_header {
                    Err(FramingError::TruncatedHeader)
                } else {
                    Ok(None)
                };
            }
            if self.line.last() != Some(&b'\n') {
                return if n >= MAX_HEADER_LINE {
                    Err(FramingError::HeaderTooLong {
                        max: MAX_HEADER_LINE,
                    })
                } else {
                    Err(FramingError::TruncatedHeader)
                };
            }

            let line = std::str::from_utf8(&self.line)
                .map_err(|_| {
                    FramingError::InvalidHeader(String::from_utf8_lossy(&self.line).into_owned())
                })?
                .trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !seen_header {
                    // Stray separator between frames.
                    continue;
                }
                return content_length
                    .map(Some)
                    .ok_or(FramingError::MissingContentLength);
            }

            seen_header = true;
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FramingError::InvalidHeader(line.to_string()))?;
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let value = value.trim();
                let length: usize = value
                    .parse()
                    .map_err(|_| FramingError::InvalidLength(value.to_string()))?;
                if length > MAX_BODY_BYTES {
                    return Err(FramingError::TooLarge {
                        declared: length,
                        max: MAX_BODY_BYTES,
                    });
                }
                content_length = Some(length);
            }
        }
    }
}

/// Writes framed messages to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one message and flush it.
    pub async fn write_message(&mut self, body: &str) -> Result<(), FramingError> {
        self.inner.write_all(&encode_frame(body)).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the underlying stream (EOF for the peer).
    pub async fn shutdown(&mut self) -> Result<(), FramingError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Convenience for readers that are not yet buffered.
pub fn frame_reader<R: AsyncRead + Unpin>(inner: R) -> FrameReader<tokio::io::BufReader<R>> {
    FrameReader::new(tokio::io::BufReader::new(inner))
}
