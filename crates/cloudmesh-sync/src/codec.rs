//! Length-prefixed framing.
//!
//! A frame is `[u32 BE length][u8 token][payload]`, where `length` counts the
//! token byte and the payload. The decoder is incremental: it buffers partial
//! headers and payloads across reads and yields every complete frame in the
//! buffer before asking for more.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;
use crate::messages::Message;

/// Size of the length header.
const HEADER_LEN: usize = 4;

/// Default ceiling on `length`: 64 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One undecoded frame: a command token and its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub token: u8,
    pub payload: Bytes,
}

/// Tokio codec for cloudmesh frames.
///
/// Decodes to [`Frame`] rather than [`Message`] so an unknown token can be
/// reported and skipped without tearing down the stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Create a codec with the given ceiling on `length`.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.clamp(1, u32::MAX as usize),
        }
    }

    /// The ceiling on `length`.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len == 0 {
            return Err(WireError::EmptyFrame);
        }
        if len > self.max_frame_len {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let token = src.get_u8();
        let payload = src.split_to(len - 1).freeze();
        Ok(Some(Frame { token, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len() + 1;
        if len > self.max_frame_len {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u32(len as u32);
        dst.put_u8(frame.token);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_u32(0);
        dst.put_u8(message.token() as u8);
        message.write_payload(dst);

        let len = dst.len() - start - HEADER_LEN;
        if len > self.max_frame_len {
            dst.truncate(start);
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        dst[start..start + HEADER_LEN].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudmesh_core::ItemId;
    use futures_util::StreamExt;
    use proptest::prelude::*;
    use tokio_util::codec::FramedRead;

    fn encode_all(messages: &[Message]) -> BytesMut {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        for message in messages {
            codec.encode(message.clone(), &mut buf).unwrap();
        }
        buf
    }

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_header_layout() {
        let buf = encode_all(&[Message::CurrentTime { millis: 1 }]);
        assert_eq!(&buf[..], &[0, 0, 0, 9, 0x04, 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let messages = vec![
            Message::CurrentTime { millis: 5 },
            Message::FileHashRequest {
                name: "a.bin".into(),
            },
            Message::ObjectRequest {
                collection: "notes".into(),
                id: ItemId::from_bytes([3; 16]),
            },
        ];
        let mut buf = encode_all(&messages);
        let frames = decode_all(&mut FrameCodec::default(), &mut buf);

        let decoded: Vec<Message> = frames
            .into_iter()
            .map(|f| Message::decode(f).unwrap())
            .collect();
        assert_eq!(decoded, messages);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_length_is_an_error() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 17, 0x04][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::FrameTooLarge { len: 17, max: 16 })
        ));
    }

    #[test]
    fn test_absurd_length_does_not_allocate() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0xffu8, 0xff, 0xff, 0xff][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_zero_length_is_an_error() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(codec.decode(&mut buf), Err(WireError::EmptyFrame)));
    }

    #[test]
    fn test_unknown_token_still_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 0x7f, 0xaa][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.token, 0x7f);
        assert!(matches!(
            Message::decode(frame),
            Err(WireError::UnknownToken(0x7f))
        ));
    }

    #[test]
    fn test_encoder_refuses_oversized_message() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        let message = Message::FileHashRequest {
            name: "far-too-long-a-name".into(),
        };
        assert!(codec.encode(message, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_framed_read_over_duplex() {
        use tokio::io::AsyncWriteExt;

        let messages = vec![
            Message::CurrentTime { millis: 1 },
            Message::DeleteList {
                collection: "c".into(),
                ids: vec![ItemId::from_bytes([1; 16])],
            },
        ];
        let bytes = encode_all(&messages).freeze();

        let (mut tx, rx) = tokio::io::duplex(3);
        let writer = tokio::spawn(async move {
            tx.write_all(&bytes).await.unwrap();
        });

        let mut framed = FramedRead::new(rx, FrameCodec::default());
        let mut decoded = Vec::new();
        while let Some(frame) = framed.next().await {
            decoded.push(Message::decode(frame.unwrap()).unwrap());
        }
        writer.await.unwrap();
        assert_eq!(decoded, messages);
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        (any::<u8>(), proptest::collection::vec(any::<u8>(), 0..300)).prop_map(
            |(token, payload)| Frame {
                token,
                payload: Bytes::from(payload),
            },
        )
    }

    proptest! {
        #[test]
        fn prop_any_chunking_reproduces_frames(
            frames in proptest::collection::vec(arb_frame(), 0..12),
            chunk in 1usize..64,
        ) {
            let mut codec = FrameCodec::default();
            let mut wire = BytesMut::new();
            for frame in &frames {
                codec.encode(frame.clone(), &mut wire).unwrap();
            }

            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                decoded.extend(decode_all(&mut codec, &mut buf));
            }

            prop_assert!(buf.is_empty());
            prop_assert_eq!(decoded, frames);
        }
    }
}
