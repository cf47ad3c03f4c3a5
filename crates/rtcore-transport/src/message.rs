//! Multipart messages and their stream framing.
//!
//! A [`Message`] is an ordered list of frames. Envelopes (peer identities,
//! routing headers, command preambles) are separate frames in front of the
//! opaque payload frames, so they can be stripped and re-inserted without
//! touching the payload bytes.
//!
//! On a byte stream each frame is written as `flags:1 + length:4 (BE) + bytes`.
//! The `MORE` flag is set on every frame except the last one of a message.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};

/// Size of the per-frame header on a byte stream.
pub const FRAME_PREFIX_SIZE: usize = 5;

/// Largest single frame accepted from a stream.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

const FLAG_MORE: u8 = 0x01;

/// An ordered list of frames delivered as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    frames: VecDeque<Bytes>,
}

impl Message {
    /// Creates an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message from a sequence of frames.
    pub fn from_frames<I, B>(frames: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
        }
    }

    /// Appends a frame.
    pub fn push_back(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_back(frame.into());
    }

    /// Prepends a frame.
    pub fn push_front(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_front(frame.into());
    }

    /// Removes and returns the first frame.
    pub fn pop_front(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    /// Returns the first frame without removing it.
    pub fn front(&self) -> Option<&Bytes> {
        self.frames.front()
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when the message has no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Iterates over the frames in order.
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter()
    }

    /// Total payload bytes across all frames.
    pub fn byte_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }

    /// Consumes the message, returning its frames.
    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames.into()
    }
}

/// Writes one message to a byte stream and flushes it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if message.is_empty() {
        return Err(TransportError::InvalidFrame {
            reason: "cannot send a message without frames".to_string(),
        });
    }

    let last = message.len() - 1;
    for (i, frame) in message.iter().enumerate() {
        let len = u32::try_from(frame.len()).map_err(|_| TransportError::PayloadTooLarge {
            size: u32::MAX,
            max_size: MAX_FRAME_SIZE,
        })?;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: len,
                max_size: MAX_FRAME_SIZE,
            });
        }
        let flags = if i < last { FLAG_MORE } else { 0 };
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        prefix[0] = flags;
        prefix[1..].copy_from_slice(&len.to_be_bytes());
        writer.write_all(&prefix).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads one message from a byte stream.
///
/// Returns `Ok(None)` when the stream ends cleanly on a message boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut message = Message::new();
    loop {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        match reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && message.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let flags = prefix[0];
        let len = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]);
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: len,
                max_size: MAX_FRAME_SIZE,
            });
        }

        let mut frame = vec![0u8; len as usize];
        if !frame.is_empty() {
            reader.read_exact(&mut frame).await?;
        }
        message.push_back(frame);

        if flags & FLAG_MORE == 0 {
            return Ok(Some(message));
        }
    }
}
