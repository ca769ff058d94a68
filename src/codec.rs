use crate::error::FramingError;
use crate::protocol::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the big-endian length prefix.
pub const HEADER_LEN: usize = 4;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Length-prefixed JSON framing.
///
/// A frame is a 4-byte big-endian payload length followed by exactly that
/// many bytes of UTF-8 JSON. The limit applies in both directions and is
/// checked before any payload buffer is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    max_frame_bytes: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Codec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, FramingError> {
        let payload = serde_json::to_vec(message)?;
        self.check_len(payload.len())?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode the first frame in `buf`, returning the message and the unconsumed tail.
    pub fn decode<'a>(&self, buf: &'a [u8]) -> Result<(Message, &'a [u8]), FramingError> {
        if buf.len() < HEADER_LEN {
            return Err(FramingError::Truncated {
                expected: HEADER_LEN,
                received: buf.len(),
            });
        }

        let (header, rest) = buf.split_at(HEADER_LEN);
        let len = Self::declared_len(header);
        self.check_len(len)?;

        if rest.len() < len {
            return Err(FramingError::Truncated {
                expected: len,
                received: rest.len(),
            });
        }

        let (payload, tail) = rest.split_at(len);
        let message = serde_json::from_slice(payload)?;
        Ok((message, tail))
    }

    /// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
    ///
    /// Not cancel-safe: a partially read frame is lost if the future is dropped.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Message>, FramingError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        let received = read_full(reader, &mut header).await?;
        if received == 0 {
            return Ok(None);
        }
        if received < HEADER_LEN {
            return Err(FramingError::Truncated {
                expected: HEADER_LEN,
                received,
            });
        }

        let len = Self::declared_len(&header);
        self.check_len(len)?;

        let mut payload = vec![0u8; len];
        let received = read_full(reader, &mut payload).await?;
        if received < len {
            return Err(FramingError::Truncated {
                expected: len,
                received,
            });
        }

        Ok(Some(serde_json::from_slice(&payload)?))
    }

    pub async fn write_frame<W>(&self, writer: &mut W, message: &Message) -> Result<(), FramingError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn declared_len(header: &[u8]) -> usize {
        u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize
    }

    fn check_len(&self, len: usize) -> Result<(), FramingError> {
        if len == 0 {
            return Err(FramingError::EmptyFrame);
        }
        if len > self.max_frame_bytes {
            return Err(FramingError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        Ok(())
    }
}

/// Encode with the default frame limit.
pub fn encode(message: &Message) -> Result<Vec<u8>, FramingError> {
    Codec::default().encode(message)
}

/// Decode with the default frame limit.
pub fn decode(buf: &[u8]) -> Result<(Message, &[u8]), FramingError> {
    Codec::default().decode(buf)
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
