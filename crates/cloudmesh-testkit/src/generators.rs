//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use cloudmesh_core::{Item, ItemId, ItemSummary, Sha1Hash, Version};
use cloudmesh_sync::Message;

/// Generate a random ItemId.
pub fn item_id() -> impl Strategy<Value = ItemId> {
    any::<[u8; 16]>().prop_map(ItemId::from_bytes)
}

/// Generate a random Sha1Hash.
pub fn sha1_hash() -> impl Strategy<Value = Sha1Hash> {
    any::<[u8; 20]>().prop_map(Sha1Hash::from_bytes)
}

/// Generate a timestamp, including negative and extreme values.
pub fn timestamp() -> impl Strategy<Value = i64> {
    prop_oneof![
        3 => 0i64..=2_000_000_000_000i64,
        1 => any::<i64>(),
    ]
}

/// Generate payload bytes of up to `max_len`.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a collection or file name.
pub fn name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9/._-]{0,23}".prop_map(String::from)
}

/// Generate a version. Hashes are drawn from a small set so ties happen.
pub fn version() -> impl Strategy<Value = Version> {
    (
        prop_oneof![Just(0i64), Just(1i64), timestamp()],
        prop_oneof![
            Just(Sha1Hash::from_bytes([0; 20])),
            Just(Sha1Hash::from_bytes([0xff; 20])),
            sha1_hash(),
        ],
    )
        .prop_map(|(timestamp, hash)| Version::new(timestamp, hash))
}

/// Generate an item whose hash matches its payload.
pub fn item() -> impl Strategy<Value = Item> {
    (item_id(), payload(256), timestamp())
        .prop_map(|(id, payload, timestamp)| Item::new(id, payload, timestamp))
}

/// Generate an item summary.
pub fn item_summary() -> impl Strategy<Value = ItemSummary> {
    (item_id(), sha1_hash(), timestamp()).prop_map(|(id, hash, timestamp)| ItemSummary {
        id,
        hash,
        timestamp,
    })
}

/// Generate any protocol message.
pub fn message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (name(), prop::collection::vec(item_id(), 0..8))
            .prop_map(|(collection, ids)| Message::DeleteList { collection, ids }),
        (name(), prop::collection::vec(item_summary(), 0..8))
            .prop_map(|(collection, items)| Message::ObjectList { collection, items }),
        (name(), item_id()).prop_map(|(collection, id)| Message::ObjectRequest { collection, id }),
        (name(), item()).prop_map(|(collection, item)| Message::ObjectReply { collection, item }),
        timestamp().prop_map(|millis| Message::CurrentTime { millis }),
        (name(), any::<u64>(), sha1_hash())
            .prop_map(|(name, size, hash)| Message::FileInfo { name, size, hash }),
        name().prop_map(|name| Message::FileHashRequest { name }),
        (name(), any::<u64>(), sha1_hash())
            .prop_map(|(name, index, hash)| Message::FileHashReply { name, index, hash }),
        (name(), any::<u64>()).prop_map(|(name, index)| Message::FileBlockRequest { name, index }),
        (name(), any::<u64>(), payload(4096)).prop_map(|(name, index, data)| {
            Message::FileBlockReply {
                name,
                index,
                data: Bytes::from(data),
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudmesh_core::{resolve, Resolution};

    /// The version a resolution leaves in place.
    fn winner(local: Version, remote: Version) -> Version {
        match resolve(Some(&local), &remote, false) {
            Resolution::AcceptNewer | Resolution::AcceptHigherHash => remote,
            _ => local,
        }
    }

    proptest! {
        #[test]
        fn test_message_decodes_from_its_frame(msg in message()) {
            let decoded = Message::decode(msg.to_frame()).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn test_resolution_is_commutative(a in version(), b in version()) {
            prop_assert_eq!(winner(a, b), winner(b, a));
        }

        #[test]
        fn test_generated_items_hash_their_payload(item in item()) {
            prop_assert_eq!(item.hash, Sha1Hash::hash(&item.payload));
        }
    }
}
