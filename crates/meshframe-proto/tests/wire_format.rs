//! Wire format tests.
//!
//! Peers written against the same schema must agree on tag names and field
//! casing, so these tests inspect the encoded CBOR map directly rather than
//! only round-tripping.

use ciborium::Value;
use meshframe_proto::{
    AttachmentRef, ChatMessage, FileChunk, Hello, LogicalType, PeerList, WireMessage,
};
use proptest::prelude::*;

fn encoded_map(message: &WireMessage) -> Vec<(String, Value)> {
    let bytes = message.encode().unwrap();
    let value: Value = ciborium::de::from_reader(bytes.as_slice()).unwrap();
    let Value::Map(entries) = value else {
        unreachable!("wire messages encode as maps");
    };
    entries
        .into_iter()
        .map(|(k, v)| (k.as_text().unwrap_or_default().to_string(), v))
        .collect()
}

fn field<'a>(entries: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

#[test]
fn hello_uses_type_tag_and_camel_case() {
    let entries = encoded_map(&WireMessage::Hello(Hello {
        name: "Ada".to_string(),
        device_id: "dev-1".to_string(),
        user_id: "user-1".to_string(),
    }));

    assert_eq!(field(&entries, "type").and_then(Value::as_text), Some("hello"));
    assert_eq!(field(&entries, "deviceId").and_then(Value::as_text), Some("dev-1"));
    assert_eq!(field(&entries, "userId").and_then(Value::as_text), Some("user-1"));
    assert!(field(&entries, "device_id").is_none());
}

#[test]
fn multi_word_variants_are_kebab_case() {
    let peer_list = encoded_map(&WireMessage::PeerList(PeerList { peers: vec!["b".to_string()] }));
    assert_eq!(field(&peer_list, "type").and_then(Value::as_text), Some("peer-list"));

    let chunk = encoded_map(&WireMessage::FileChunk(FileChunk {
        file_id: "f".to_string(),
        chunk_index: 3,
        total_chunks: 4,
        data: vec![1, 2],
    }));
    assert_eq!(field(&chunk, "type").and_then(Value::as_text), Some("file-chunk"));
    assert!(field(&chunk, "chunkIndex").is_some());
    assert!(field(&chunk, "totalChunks").is_some());

    let init = encoded_map(&WireMessage::RatchetInit);
    assert_eq!(field(&init, "type").and_then(Value::as_text), Some("ratchet-init"));
}

#[test]
fn edit_keeps_existing_file_ids() {
    let edit = WireMessage::EditMessage(ChatMessage {
        id: "m-1".to_string(),
        sender_id: "alice".to_string(),
        text: "fixed typo".to_string(),
        timestamp: 1_700_000_000_000,
        reply_to: None,
        attachments: vec![AttachmentRef {
            file_id: "f-2".to_string(),
            name: "new.png".to_string(),
            mime_type: "image/png".to_string(),
            size: 10,
            total_chunks: 1,
            key: [3; 32],
        }],
        is_edited: true,
        existing_file_ids: vec!["f-1".to_string()],
    });

    let entries = encoded_map(&edit);
    assert!(field(&entries, "existingFileIds").is_some());
    assert!(field(&entries, "replyTo").is_none());

    let decoded = WireMessage::decode(&edit.encode().unwrap()).unwrap();
    assert_eq!(decoded.logical_type(), Some(LogicalType::EditMessage));
    assert_eq!(decoded, edit);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// PROPERTY: decoding arbitrary bytes returns Ok or Err, never panics.
    #[test]
    fn prop_decode_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = WireMessage::decode(&bytes);
    }

    /// PROPERTY: user text of any content survives encoding.
    #[test]
    fn prop_chat_text_survives(text in ".*", timestamp in any::<u64>()) {
        let message = WireMessage::Message(ChatMessage {
            id: "id".to_string(),
            sender_id: "s".to_string(),
            text,
            timestamp,
            reply_to: None,
            attachments: vec![],
            is_edited: false,
            existing_file_ids: vec![],
        });
        prop_assert_eq!(WireMessage::decode(&message.encode().unwrap()).unwrap(), message);
    }
}
