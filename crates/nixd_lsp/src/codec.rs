//! JSON-RPC framing for the worker pipes.
//!
//! Workers speak the same `Content-Length: N\r\n\r\n{json}` framing as
//! the client transport, but over controller-owned pipes. The client
//! side of the transport belongs to tower-lsp; this codec is only for
//! worker traffic.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on one frame, to keep a misbehaving worker from forcing
/// unbounded allocation.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Read the next frame. `Ok(None)` means the peer closed the pipe.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<Option<serde_json::Value>> {
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    let mut saw_header = false;

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .context("reading frame header")?;
        if read == 0 {
            if saw_header {
                bail!("pipe closed in the middle of a frame header");
            }
            return Ok(None);
        }
        saw_header = true;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            if key.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse()
                        .context("invalid Content-Length value")?,
                );
            }
        }
    }

    let Some(length) = content_length else {
        bail!("frame is missing a Content-Length header");
    };
    if length > MAX_FRAME_BYTES {
        bail!("frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
    }

    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .context("reading frame body")?;
    let value = serde_json::from_slice(&body).context("parsing frame body")?;
    Ok(Some(value))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &serde_json::Value,
) -> Result<()> {
    let body = serde_json::to_string(frame).context("serializing frame")?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer
        .write_all(header.as_bytes())
        .await
        .context("writing frame header")?;
    writer
        .write_all(body.as_bytes())
        .await
        .context("writing frame body")?;
    writer.flush().await.context("flushing frame")?;
    Ok(())
}
