use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::protocol::error::ProtocolError;
use crate::protocol::LENGTH_PREFIX_SIZE;
use crate::utils::io::{read_full, write_all};

/// Prefix `payload` with its length. The result is written in one piece so
/// two frames from the same writer can never interleave.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Read one frame payload.
///
/// `Ok(None)` means the peer closed the stream before a complete length
/// prefix arrived, which is a clean end of stream. Closing after the prefix
/// but before the full payload is a [`ProtocolError::Truncated`].
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let got = read_full(reader, &mut prefix).await?;
    if got < LENGTH_PREFIX_SIZE {
        if got > 0 {
            debug!("Stream closed inside length prefix ({} of {} bytes)", got, LENGTH_PREFIX_SIZE);
        }
        return Ok(None);
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; len];
    let received = read_full(reader, &mut payload).await?;
    if received < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            received,
        });
    }

    trace!("Read frame of {} bytes", len);
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let frame = encode_frame(payload)?;
    write_all(writer, &frame).await?;
    trace!("Wrote frame of {} bytes", payload.len());
    Ok(())
}
