//! Wire framing for network channels.
//!
//! A frame is a big-endian `u32` body length followed by the JSON-encoded
//! item. The length value [`END_OF_STREAM`] has no body and marks a clean
//! close by the sending side. Handshakes and acknowledgements travel the
//! other way as bare big-endian `u64` counts.

use sl_types::{ChannelError, Item};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const END_OF_STREAM: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Item(Item),
    End,
}

fn limit(max_frame_bytes: usize) -> usize {
    max_frame_bytes.min(END_OF_STREAM as usize - 1)
}

/// Serializes an item into a frame body, enforcing the size limit.
pub fn encode_item(item: &Item, max_frame_bytes: usize) -> Result<Vec<u8>, ChannelError> {
    let body = serde_json::to_vec(item)?;
    let limit = limit(max_frame_bytes);
    if body.len() > limit {
        return Err(ChannelError::FrameTooLarge {
            size: body.len(),
            limit,
        });
    }
    Ok(body)
}

/// Writes a body produced by [`encode_item`].
pub async fn write_body<W>(writer: &mut W, body: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    Ok(())
}

pub async fn write_item<W>(writer: &mut W, item: &Item, max_frame_bytes: usize) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_item(item, max_frame_bytes)?;
    write_body(writer, &body).await
}

pub async fn write_end<W>(writer: &mut W) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(END_OF_STREAM).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Not cancel safe: abandoning the future mid-frame leaves
/// the stream unusable.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Frame, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len == END_OF_STREAM {
        return Ok(Frame::End);
    }
    let limit = limit(max_frame_bytes);
    if len as usize > limit {
        return Err(ChannelError::FrameTooLarge {
            size: len as usize,
            limit,
        });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Frame::Item(serde_json::from_slice(&body)?))
}

/// Accumulates a big-endian `u64` from non-blocking reads that may return
/// it in pieces.
#[derive(Debug, Default)]
pub struct CountReader {
    bytes: [u8; 8],
    filled: usize,
}

impl CountReader {
    /// Feeds newly read bytes, returning every count completed by them.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<u64> {
        let mut counts = Vec::new();
        while !data.is_empty() {
            let take = (8 - self.filled).min(data.len());
            self.bytes[self.filled..self.filled + take].copy_from_slice(&data[..take]);
            self.filled += take;
            data = &data[take..];
            if self.filled == 8 {
                counts.push(u64::from_be_bytes(self.bytes));
                self.filled = 0;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_round_trip_through_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_item(&mut a, &json!({"x": 1}), 1024).await.unwrap();
        write_item(&mut a, &json!("two"), 1024).await.unwrap();
        write_end(&mut a).await.unwrap();

        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), Frame::Item(json!({"x": 1})));
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), Frame::Item(json!("two")));
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), Frame::End);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let err = write_item(&mut a, &json!("a long string"), 4).await.unwrap_err();
        assert!(matches!(err, ChannelError::FrameTooLarge { limit: 4, .. }));
    }

    #[test]
    fn count_reader_handles_split_input() {
        let mut reader = CountReader::default();
        let bytes = [7u64.to_be_bytes(), 9u64.to_be_bytes()].concat();
        assert!(reader.feed(&bytes[..3]).is_empty());
        assert_eq!(reader.feed(&bytes[3..12]), vec![7]);
        assert_eq!(reader.feed(&bytes[12..]), vec![9]);
    }
}
