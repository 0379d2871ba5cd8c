//! Property-based codec tests.
//!
//! Uses proptest to verify:
//! 1. Any chat or ping envelope survives encode → decode.
//! 2. Random bytes and random strings never cause a panic in `decode`.
//! 3. Any `type` string decodes, unknown ones as `EnvelopeKind::Unknown`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use peerlink_proto::codec;
use peerlink_proto::envelope::{Envelope, EnvelopeKind};
use proptest::prelude::*;

fn arb_token() -> impl Strategy<Value = String> {
    "[0-9a-f]{16}"
}

fn arb_envelope() -> impl Strategy<Value = Envelope> {
    let chat = (".{0,512}", proptest::option::of(arb_token()), arb_token()).prop_map(
        |(text, id, sender)| {
            let mut envelope = Envelope::chat(text).with_sender(sender);
            envelope.id = id;
            envelope
        },
    );
    let ping = (arb_token(), ".{0,40}").prop_map(|(id, sent_at)| Envelope::ping(id, sent_at));
    prop_oneof![chat, ping]
}

proptest! {
    #[test]
    fn envelope_round_trip(envelope in arb_envelope()) {
        let text = codec::encode(&envelope).unwrap();
        let decoded = codec::decode_str(&text).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..1024)) {
        let _ = codec::decode(&bytes);
    }

    #[test]
    fn random_text_never_panics(text in ".{0,256}") {
        let _ = codec::decode_str(&text);
    }

    #[test]
    fn any_type_string_decodes(kind in "[a-z-]{0,24}") {
        let text = serde_json::json!({ "type": kind }).to_string();
        let envelope = codec::decode_str(&text).unwrap();
        prop_assert_eq!(envelope.kind, EnvelopeKind::from_wire(&kind));
        if envelope.kind != EnvelopeKind::Unknown {
            prop_assert_eq!(envelope.kind.as_str(), kind.as_str());
        }
    }
}
