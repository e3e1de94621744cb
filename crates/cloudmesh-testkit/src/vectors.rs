//! Golden wire vectors.
//!
//! Each vector pairs a message with the exact bytes of its frame, header
//! included. Any peer implementation must produce and accept these bytes.

use bytes::{Bytes, BytesMut};

use cloudmesh_core::{Item, ItemId, ItemSummary, Sha1Hash};
use cloudmesh_sync::{FrameCodec, Message};
use tokio_util::codec::Encoder;

/// A golden wire vector.
#[derive(Debug, Clone)]
pub struct WireVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    pub message: Message,
    /// Expected frame bytes (hex).
    pub frame_hex: &'static str,
}

/// Get all golden wire vectors.
pub fn all_vectors() -> Vec<WireVector> {
    vec![
        WireVector {
            name: "CurrentTime one million",
            message: Message::CurrentTime { millis: 1_000_000 },
            frame_hex: "000000090400000000000f4240",
        },
        WireVector {
            name: "CurrentTime negative one",
            message: Message::CurrentTime { millis: -1 },
            frame_hex: "0000000904ffffffffffffffff",
        },
        WireVector {
            name: "DeleteList with one id",
            message: Message::DeleteList {
                collection: "c".into(),
                ids: vec![ItemId::from_bytes([0x11; 16])],
            },
            frame_hex: "0000001a0000000001630000000111111111111111111111111111111111",
        },
        WireVector {
            name: "Empty DeleteList",
            message: Message::DeleteList {
                collection: "notes".into(),
                ids: vec![],
            },
            frame_hex: "0000000e00000000056e6f74657300000000",
        },
        WireVector {
            name: "ObjectList with one summary",
            message: Message::ObjectList {
                collection: "c".into(),
                items: vec![ItemSummary {
                    id: ItemId::from_bytes([0x33; 16]),
                    hash: Sha1Hash::from_bytes([0x44; 20]),
                    timestamp: 1,
                }],
            },
            frame_hex: "0000003a0100000001630000000133333333333333333333333333333333\
                        0000001444444444444444444444444444444444444444440000000000000001",
        },
        WireVector {
            name: "ObjectRequest",
            message: Message::ObjectRequest {
                collection: "ab".into(),
                id: ItemId::from_bytes([0x22; 16]),
            },
            frame_hex: "000000170200000002616222222222222222222222222222222222",
        },
        WireVector {
            name: "ObjectReply carrying hi",
            message: Message::ObjectReply {
                collection: "c".into(),
                item: Item::new(ItemId::from_bytes([0x55; 16]), &b"hi"[..], 5),
            },
            frame_hex: "0000003c0300000001635555555555555555555555555555555500000014\
                        c22b5f9178342609428d6f51b2c5af4c0bde6a420000000000000005000000026869",
        },
        WireVector {
            name: "FileInfo two blocks",
            message: Message::FileInfo {
                name: "f".into(),
                size: 4097,
                hash: Sha1Hash::from_bytes([0x66; 20]),
            },
            frame_hex: "0000002205000000016600000000000010016666666666666666666666666666666666666666",
        },
        WireVector {
            name: "FileHashRequest nested name",
            message: Message::FileHashRequest {
                name: "dir/a.bin".into(),
            },
            frame_hex: "0000000e06000000096469722f612e62696e",
        },
        WireVector {
            name: "FileHashReply block one",
            message: Message::FileHashReply {
                name: "f".into(),
                index: 1,
                hash: Sha1Hash::from_bytes([0x77; 20]),
            },
            frame_hex: "0000002207000000016600000000000000017777777777777777777777777777777777777777",
        },
        WireVector {
            name: "FileBlockRequest block seven",
            message: Message::FileBlockRequest {
                name: "f".into(),
                index: 7,
            },
            frame_hex: "0000000e0800000001660000000000000007",
        },
        WireVector {
            name: "FileBlockReply short block",
            message: Message::FileBlockReply {
                name: "f".into(),
                index: 0,
                data: Bytes::from_static(b"xyz"),
            },
            frame_hex: "0000001510000000016600000000000000000000000378797a",
        },
    ]
}

/// Encode a message as a full frame, in hex.
pub fn encode_hex(message: &Message) -> String {
    let mut buf = BytesMut::new();
    match FrameCodec::default().encode(message.clone(), &mut buf) {
        Ok(()) => hex::encode(&buf),
        Err(e) => format!("encode error: {e}"),
    }
}

/// Check every vector. Returns `(name, matches, actual_hex)` per vector.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| {
            let actual = encode_hex(&v.message);
            (v.name.to_string(), actual == v.frame_hex, actual)
        })
        .collect()
}
