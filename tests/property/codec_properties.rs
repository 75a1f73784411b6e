//! Property-based codec tests.
//!
//! Uses proptest to verify:
//! 1. Any frame under the size bound survives encode → decode.
//! 2. Random bytes never cause a panic in `decode` (returns `Err` gracefully).
//! 3. Envelope plaintext payloads survive encode → decode.

use proptest::prelude::*;
use relaywire_proto::codec;
use relaywire_proto::frame::*;

fn arb_username() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

fn arb_key() -> impl Strategy<Value = PublicKeyBytes> {
    any::<[u8; PUBLIC_KEY_LEN]>()
}

fn arb_chunk() -> impl Strategy<Value = Chunk> {
    (
        "[a-zA-Z0-9._-]{1,32}",
        prop::collection::vec(any::<u8>(), 0..4096),
        any::<u32>(),
        any::<bool>(),
    )
        .prop_map(|(name, data, index, last)| Chunk {
            name,
            data,
            index,
            last,
        })
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        (arb_username(), prop::option::of(arb_key()))
            .prop_map(|(username, public_key)| Frame::Hello(Hello {
                username,
                public_key
            })),
        (arb_username(), arb_key(), any::<u64>()).prop_map(|(username, public_key, ts)| {
            Frame::KeyBundle(KeyBundle {
                username,
                public_key,
                signing_key: Some(vec![1; 32]),
                signature: Some(vec![2; 64]),
                timestamp_ms: ts,
            })
        }),
        (arb_username(), ".{0,256}").prop_map(|(from, text)| Frame::Chat(ChatMessage {
            from,
            text,
            kind: MessageKind::User,
        })),
        (
            arb_username(),
            arb_username(),
            any::<[u8; NONCE_LEN]>(),
            prop::collection::vec(any::<u8>(), 16..512),
            prop::option::of(any::<u32>()),
        )
            .prop_map(|(from, to, nonce, ciphertext, chunk_index)| {
                Frame::Envelope(EncryptedEnvelope {
                    from,
                    to,
                    nonce,
                    ciphertext,
                    media_type: MEDIA_CHUNK.to_string(),
                    chunk_index,
                    last: chunk_index.map(|i| i % 2 == 0),
                })
            }),
        (arb_username(), "[a-z.]{1,20}", any::<u64>()).prop_map(|(sender, name, total_size)| {
            Frame::TransferRequest(TransferRequest {
                sender,
                name,
                total_size,
            })
        }),
        arb_chunk().prop_map(Frame::Chunk),
        prop::collection::vec(arb_username(), 0..16)
            .prop_map(|users| Frame::UserList(UserListUpdate { users })),
    ]
}

proptest! {
    #[test]
    fn frame_round_trip(frame in arb_frame()) {
        let bytes = codec::encode(&frame).unwrap();
        let decoded = codec::decode(&bytes).unwrap();
        prop_assert_eq!(frame, decoded);
    }

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = codec::decode(&bytes);
        let _ = codec::decode_direct(&bytes);
    }

    #[test]
    fn direct_chunk_payload_round_trip(chunk in arb_chunk()) {
        let payload = DirectPayload::Chunk(chunk);
        let bytes = codec::encode_direct(&payload).unwrap();
        prop_assert_eq!(codec::decode_direct(&bytes).unwrap(), payload);
    }
}
