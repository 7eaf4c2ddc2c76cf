//! Docker multiplexed log framing.
//!
//! ```text
//! [stream type: u8][0, 0, 0][length: u32 BE][payload: length bytes]
//! ```
//!
//! Stream type 2 is stderr; everything else is treated as stdout.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hola_common::protocol::{LogLine, LogStream};
use tokio_util::codec::{Decoder, Encoder};

/// Size of a frame header.
pub const HEADER_LEN: usize = 8;

const STDOUT: u8 = 1;
const STDERR: u8 = 2;

/// One frame of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    /// Stream the payload was written to.
    pub stream: LogStream,
    /// Raw payload, usually one line including its newline.
    pub payload: Bytes,
}

impl LogFrame {
    /// Create a frame.
    pub fn new(stream: LogStream, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            payload: payload.into(),
        }
    }

    /// Append the framed form to `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not fit a 32-bit length.
    pub fn encode(&self, dst: &mut BytesMut) -> io::Result<()> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "log frame too large"))?;

        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_u8(match self.stream {
            LogStream::Stdout => STDOUT,
            LogStream::Stderr => STDERR,
        });
        dst.put_bytes(0, 3);
        dst.put_u32(len);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Turn the frame into a `log_line` payload.
    ///
    /// Trailing newlines are stripped and the first space-delimited token is
    /// taken as the timestamp. A line without a space (or starting with one)
    /// has an empty timestamp and is kept whole as the message.
    #[must_use]
    pub fn to_log_line(&self, container_id: &str) -> LogLine {
        let text = String::from_utf8_lossy(&self.payload);
        let text = text.trim_end_matches('\n');

        let (timestamp, message) = match text.find(' ') {
            Some(idx) if idx > 0 => (&text[..idx], &text[idx + 1..]),
            _ => ("", text),
        };

        LogLine {
            container_id: container_id.to_string(),
            timestamp: timestamp.to_string(),
            stream: self.stream,
            message: message.to_string(),
        }
    }
}

/// Decoder (and encoder) for the multiplexed log format.
///
/// Frames with a zero length or a length above `max_frame` are skipped: the
/// header and exactly `length` payload bytes are discarded, possibly across
/// several reads, so the following header is found where it belongs.
#[derive(Debug)]
pub struct LogFrameCodec {
    max_frame: usize,
    skipping: usize,
}

impl LogFrameCodec {
    /// A codec skipping payloads longer than `max_frame` bytes.
    #[must_use]
    pub const fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            skipping: 0,
        }
    }
}

impl Decoder for LogFrameCodec {
    type Item = LogFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<LogFrame>> {
        loop {
            if self.skipping > 0 {
                let n = self.skipping.min(src.len());
                src.advance(n);
                self.skipping -= n;
                if self.skipping > 0 {
                    return Ok(None);
                }
            }

            if src.len() < HEADER_LEN {
                src.reserve(HEADER_LEN - src.len());
                return Ok(None);
            }

            let stream = if src[0] == STDERR {
                LogStream::Stderr
            } else {
                LogStream::Stdout
            };
            let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
            let len = usize::try_from(len).unwrap_or(usize::MAX);

            if len == 0 || len > self.max_frame {
                tracing::debug!(len, "skipping log frame");
                src.advance(HEADER_LEN);
                self.skipping = len;
                continue;
            }

            if src.len() < HEADER_LEN + len {
                src.reserve(HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(HEADER_LEN);
            let payload = src.split_to(len).freeze();
            return Ok(Some(LogFrame { stream, payload }));
        }
    }
}

impl Encoder<LogFrame> for LogFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: LogFrame, dst: &mut BytesMut) -> io::Result<()> {
        frame.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const MIB: usize = 1024 * 1024;

    fn framed(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![stream_type, 0, 0, 0];
        buf.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn decode_all(codec: &mut LogFrameCodec, bytes: &[u8]) -> Vec<LogFrame> {
        let mut src = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut src).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn decodes_timestamped_line() {
        let bytes = framed(1, b"2024-01-15T10:30:05Z hello\n");
        let frames = decode_all(&mut LogFrameCodec::new(MIB), &bytes);
        assert_eq!(frames.len(), 1);

        let line = frames[0].to_log_line("abc123");
        assert_eq!(line.container_id, "abc123");
        assert_eq!(line.stream, LogStream::Stdout);
        assert_eq!(line.timestamp, "2024-01-15T10:30:05Z");
        assert_eq!(line.message, "hello");
    }

    #[test]
    fn line_without_space_has_no_timestamp() {
        let frame = LogFrame::new(LogStream::Stderr, &b"panic!\n\n"[..]);
        let line = frame.to_log_line("abc");
        assert_eq!(line.timestamp, "");
        assert_eq!(line.message, "panic!");
        assert_eq!(line.stream, LogStream::Stderr);

        let frame = LogFrame::new(LogStream::Stdout, &b" leading space"[..]);
        let line = frame.to_log_line("abc");
        assert_eq!(line.timestamp, "");
        assert_eq!(line.message, " leading space");
    }

    #[test]
    fn only_first_space_splits() {
        let frame = LogFrame::new(LogStream::Stdout, &b"ts a b  c\n"[..]);
        let line = frame.to_log_line("abc");
        assert_eq!(line.timestamp, "ts");
        assert_eq!(line.message, "a b  c");
    }

    #[test]
    fn stderr_discriminator() {
        let mut bytes = framed(2, b"err\n");
        bytes.extend(framed(0, b"in\n"));
        let frames = decode_all(&mut LogFrameCodec::new(MIB), &bytes);
        assert_eq!(frames[0].stream, LogStream::Stderr);
        assert_eq!(frames[1].stream, LogStream::Stdout);
    }

    #[test]
    fn partial_input_waits() {
        let bytes = framed(1, b"hello\n");
        let mut codec = LogFrameCodec::new(MIB);
        let mut src = BytesMut::from(&bytes[..5]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&bytes[5..10]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&bytes[10..]);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"hello\n");
        assert!(src.is_empty());
    }

    #[test]
    fn oversized_and_empty_frames_are_skipped() {
        let mut bytes = framed(1, &[b'x'; 32]);
        bytes.extend(framed(1, b""));
        bytes.extend(framed(1, b"kept\n"));

        let frames = decode_all(&mut LogFrameCodec::new(16), &bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"kept\n");
    }

    #[test]
    fn skip_spans_reads() {
        let mut bytes = framed(1, &[b'x'; 32]);
        bytes.extend(framed(2, b"after\n"));

        let mut codec = LogFrameCodec::new(16);
        let mut src = BytesMut::from(&bytes[..20]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());

        src.extend_from_slice(&bytes[20..]);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.stream, LogStream::Stderr);
        assert_eq!(&frame.payload[..], b"after\n");
    }

    #[test]
    fn encoder_matches_wire_format() {
        let mut dst = BytesMut::new();
        LogFrameCodec::new(MIB)
            .encode(LogFrame::new(LogStream::Stdout, &b"hello world\n"[..]), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], framed(1, b"hello world\n").as_slice());
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_frames(
            lines in prop::collection::vec("[a-z0-9 ]{0,40}", 1..12),
            cut in 1usize..17,
        ) {
            let mut bytes = Vec::new();
            for (i, line) in lines.iter().enumerate() {
                let stream = if i % 2 == 0 { 1 } else { 2 };
                bytes.extend(framed(stream, format!("{line}\n").as_bytes()));
            }

            let whole = decode_all(&mut LogFrameCodec::new(MIB), &bytes);

            let mut codec = LogFrameCodec::new(MIB);
            let mut src = BytesMut::new();
            let mut chunked = Vec::new();
            for chunk in bytes.chunks(cut) {
                src.extend_from_slice(chunk);
                while let Some(frame) = codec.decode(&mut src).unwrap() {
                    chunked.push(frame);
                }
            }

            prop_assert_eq!(whole.len(), lines.len());
            prop_assert_eq!(chunked, whole);
        }
    }
}
