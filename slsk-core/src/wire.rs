//! Stream framing: split a byte stream into length-prefixed messages (4 bytes LE length + body).

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const LEN_SIZE: usize = 4;

/// Default maximum body length accepted from a peer (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Error splitting a frame off a stream buffer.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame of {0} bytes is too large")]
    TooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Find one frame at the front of `bytes`, returning the whole frame (length
/// prefix included) and the number of bytes consumed. Call with a partial
/// buffer; `NeedMore` means try again once more data has arrived.
pub fn decode_frame(bytes: &[u8], max_len: usize) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max_len {
        return Err(FrameDecodeError::TooLarge(len));
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[..LEN_SIZE + len], LEN_SIZE + len))
}

/// `tokio_util` codec yielding whole frames as [`Bytes`], ready for
/// [`MessageReader::new`](crate::MessageReader::new).
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_len: usize,
}

impl FrameCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameDecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameDecodeError> {
        let consumed = match decode_frame(src, self.max_len) {
            Ok((_, consumed)) => Some(consumed),
            Err(FrameDecodeError::NeedMore) => None,
            Err(e) => return Err(e),
        };
        match consumed {
            Some(consumed) => Ok(Some(src.split_to(consumed).freeze())),
            None => {
                if src.len() >= LEN_SIZE {
                    let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    src.reserve(LEN_SIZE + len - src.len());
                }
                Ok(None)
            }
        }
    }
}

/// Frames produced by [`MessageBuilder::build`](crate::MessageBuilder::build) are
/// already length-prefixed; encoding only checks the limit and copies.
impl Encoder<Bytes> for FrameCodec {
    type Error = FrameDecodeError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameDecodeError> {
        let body = item.len().saturating_sub(LEN_SIZE);
        if body > self.max_len {
            return Err(FrameDecodeError::TooLarge(body));
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MessageBuilder;
    use crate::code::PeerCode;

    fn sample(filename: &str) -> Vec<u8> {
        MessageBuilder::new()
            .write_code(PeerCode::QueueDownload)
            .write_string(filename)
            .build()
    }

    #[test]
    fn whole_frame_is_returned() {
        let frame = sample("a.mp3");
        let (found, n) = decode_frame(&frame, MAX_FRAME_LEN).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(found, &frame[..]);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = sample("a.mp3");
        assert!(matches!(
            decode_frame(&frame[..2], MAX_FRAME_LEN),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..super::LEN_SIZE], MAX_FRAME_LEN),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1], MAX_FRAME_LEN),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_frame_rejected() {
        let frame = sample("a.mp3");
        assert!(matches!(
            decode_frame(&frame, 4),
            Err(FrameDecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn multiple_messages() {
        let fa = sample("a");
        let fb = sample("bb");
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (_, n1) = decode_frame(&buf, MAX_FRAME_LEN).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..], MAX_FRAME_LEN).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m2, &fb[..]);
    }

    #[test]
    fn codec_yields_frames_across_partial_chunks() {
        let fa = sample("first");
        let fb = sample("second");
        let mut codec = FrameCodec::default();
        let mut src = BytesMut::new();
        src.extend_from_slice(&fa[..3]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&fa[3..]);
        src.extend_from_slice(&fb[..7]);
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), Bytes::from(fa));
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&fb[7..]);
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), Bytes::from(fb));
        assert!(src.is_empty());
    }
}
