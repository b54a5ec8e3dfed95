//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameDecoder`] is the sans-IO core: bytes go in as they arrive, complete
//! messages come out. [`FrameReader`] and [`FrameWriter`] wrap it for async
//! streams.
//!
//! The decoder never stalls on bad input. A header block without a usable
//! `Content-Length` is skipped up to its separator, an unparsable body is
//! dropped, and an oversized body is discarded as it streams past.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest body we are willing to buffer (64 MiB). Workspace symbol
/// responses from large monorepos get close to this.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Header bytes tolerated without a `\r\n\r\n` separator before the buffer
/// is considered garbage.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// One decoding step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(serde_json::Value),
    /// Input that was skipped to resynchronize; carries the reason.
    Malformed(String),
}

/// Incremental frame decoder over a growable byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes of an oversized body still to be thrown away.
    discard: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, mut bytes: &[u8]) {
        if self.discard > 0 {
            let skip = self.discard.min(bytes.len());
            self.discard -= skip;
            bytes = &bytes[skip..];
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Whether bytes of an incomplete frame are buffered.
    #[must_use]
    pub fn has_partial_frame(&self) -> bool {
        self.discard > 0 || self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Decode the next frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Decoded> {
        let Some(sep) = find_subslice(&self.buf, HEADER_SEPARATOR) else {
            if self.buf.len() > MAX_HEADER_BYTES {
                // Keep a tail that could be the start of a split separator.
                let keep = HEADER_SEPARATOR.len() - 1;
                let dropped = self.buf.len() - keep;
                self.buf.drain(..dropped);
                return Some(Decoded::Malformed(format!(
                    "discarded {dropped} header bytes without a separator"
                )));
            }
            return None;
        };
        let body_start = sep + HEADER_SEPARATOR.len();

        let content_length = match parse_content_length(&self.buf[..sep]) {
            Ok(len) => len,
            Err(reason) => {
                self.buf.drain(..body_start);
                return Some(Decoded::Malformed(reason));
            }
        };

        if content_length > MAX_FRAME_BYTES {
            self.buf.drain(..body_start);
            let buffered = content_length.min(self.buf.len());
            self.buf.drain(..buffered);
            self.discard = content_length - buffered;
            return Some(Decoded::Malformed(format!(
                "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
            )));
        }

        let body_end = body_start + content_length;
        if self.buf.len() < body_end {
            return None;
        }

        let parsed = serde_json::from_slice(&self.buf[body_start..body_end]);
        self.buf.drain(..body_end);
        Some(match parsed {
            Ok(value) => Decoded::Message(value),
            Err(e) => Decoded::Malformed(format!("invalid JSON body: {e}")),
        })
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Extract `Content-Length` from a header block.
///
/// Matches case-insensitively anywhere in a line so a header preceded by
/// leftover garbage on the same line still resynchronizes. The last match
/// wins. Other headers (e.g. `Content-Type`) are ignored.
fn parse_content_length(block: &[u8]) -> Result<usize, String> {
    const KEY: &str = "content-length";

    let text = std::str::from_utf8(block).map_err(|_| "non-UTF-8 header block".to_string())?;
    let mut content_length = None;
    for line in text.split('\n') {
        let lower = line.to_ascii_lowercase();
        let Some(key_pos) = lower.rfind(KEY) else {
            continue;
        };
        let rest = &line[key_pos + KEY.len()..];
        let Some(value) = rest.trim_start().strip_prefix(':') else {
            continue;
        };
        let len = value
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("invalid Content-Length value: {:?}", value.trim()))?;
        content_length = Some(len);
    }
    content_length.ok_or_else(|| "missing Content-Length header".to_string())
}

/// Reads JSON-RPC frames from an async reader.
///
/// Malformed input is logged and skipped; only I/O failures and EOF in the
/// middle of a frame are errors.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK_BYTES].into_boxed_slice(),
        }
    }

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        loop {
            while let Some(decoded) = self.decoder.next_frame() {
                match decoded {
                    Decoded::Message(value) => return Ok(Some(value)),
                    Decoded::Malformed(reason) => {
                        tracing::warn!("Skipping malformed LSP frame: {reason}");
                    }
                }
            }

            let n = self
                .reader
                .read(&mut self.chunk)
                .await
                .context("reading from language server")?;
            if n == 0 {
                if self.decoder.has_partial_frame() {
                    bail!("unexpected EOF in the middle of a frame");
                }
                return Ok(None);
            }
            self.decoder.push(&self.chunk[..n]);
        }
    }
}

/// Encode one message with its `Content-Length` header.
pub fn encode_frame(msg: &serde_json::Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg).context("serializing JSON-RPC frame")?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Writes JSON-RPC frames to an async writer.
///
/// Header and body go out in one `write_all`, so a frame is never split
/// around another writer's output.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing writer")
    }
}
