//! Frame codec: 16-byte header + JSON payload.

use gcs_shared::protocol::{MessageHeader, HEADER_LEN};
use gcs_shared::{GcsError, GcsResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum total frame size (header + payload) accepted on read.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(header: MessageHeader, payload: Vec<u8>) -> Self {
        debug_assert_eq!(header.payload_len() as usize, payload.len());
        Frame { header, payload }
    }
}

/// Read one frame. EOF on the very first byte of the header is reported
/// by the caller as a clean shutdown, not an error — callers distinguish
/// this by reading with [`read_frame_or_eof`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> GcsResult<Frame> {
    match read_frame_or_eof(reader).await? {
        Some(frame) => Ok(frame),
        None => Err(GcsError::FrameTruncated("eof before header".into())),
    }
}

/// Read one frame, returning `Ok(None)` on a clean zero-byte EOF before
/// any header bytes were read.
pub async fn read_frame_or_eof<R: AsyncRead + Unpin>(reader: &mut R) -> GcsResult<Option<Frame>> {
    let mut header_buf = [0u8; HEADER_LEN];
    let mut filled = 0usize;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(GcsError::FrameTruncated(format!(
                "eof after {filled} of {HEADER_LEN} header bytes"
            )));
        }
        filled += n;
    }

    let header = MessageHeader::from_bytes(&header_buf);
    if header.size < HEADER_LEN as u32 {
        return Err(GcsError::FrameMalformed(format!(
            "size {} smaller than header length {HEADER_LEN}",
            header.size
        )));
    }
    if header.size > MAX_FRAME_SIZE {
        return Err(GcsError::FrameTooLarge(header.size as usize));
    }

    let payload_len = header.payload_len() as usize;
    let mut payload = vec![0u8; payload_len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| GcsError::FrameTruncated(format!("short payload read: {e}")))?;

    Ok(Some(Frame::new(header, payload)))
}

/// Write one frame as a single contiguous write.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> GcsResult<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    buf.extend_from_slice(&frame.header.to_bytes());
    buf.extend_from_slice(&frame.payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
