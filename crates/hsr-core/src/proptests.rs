use proptest::prelude::*;
use serde_json::json;

use crate::errors::VerifyError;
use crate::harness::{fixture_certificates, structured_envelope, MessageBuilder};
use crate::message::{MessageStatus, SigningState};
use crate::status_cache::MessageStatusCache;
use crate::types::{certificate_key, MsgId};
use crate::verify::verify_envelope;

#[derive(Debug, Clone)]
enum Write {
    Pending,
    Signed(String),
    Failed(String),
}

fn write_strategy() -> impl Strategy<Value = Write> {
    prop_oneof![
        Just(Write::Pending),
        "[a-f0-9]{1,16}".prop_map(Write::Signed),
        "[a-z ]{1,16}".prop_map(Write::Failed),
    ]
}

fn status_for(write: &Write) -> MessageStatus {
    let state = match write {
        Write::Pending => SigningState::PendingSign,
        Write::Signed(s) => SigningState::Signed { signed_payload: s.clone() },
        Write::Failed(e) => SigningState::Failed { error_message: e.clone() },
    };
    MessageStatus::new(MsgId(1), "r-1", "KEY_LINK_TX_SIGN_REQUEST", json!({}), state).unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Once a message is terminal, no write sequence brings it back to pending.
    #[test]
    fn prop_terminal_status_is_sticky(writes in prop::collection::vec(write_strategy(), 1..24)) {
        let cache = MessageStatusCache::default();
        let rt = runtime();
        let mut seen_terminal = false;
        for write in &writes {
            rt.block_on(cache.record_result(status_for(write)));
            let current = rt.block_on(cache.get(MsgId(1))).unwrap();
            seen_terminal |= !matches!(write, Write::Pending);
            prop_assert_eq!(current.is_terminal(), seen_terminal);
            if !matches!(write, Write::Pending) {
                prop_assert_eq!(&current, &status_for(write));
            }
        }
    }

    #[test]
    fn prop_eviction_never_exceeds_capacity_when_all_reported(
        capacity in 1usize..16,
        count in 0u64..48,
    ) {
        let cache = MessageStatusCache::new(capacity);
        let rt = runtime();
        for id in 0..count {
            let status = MessageStatus::new(
                MsgId(id), "r", "T", json!({}),
                SigningState::Signed { signed_payload: "s".into() },
            ).unwrap();
            rt.block_on(cache.record_result(status));
            rt.block_on(cache.mark_reported(MsgId(id)));
        }
        prop_assert!(rt.block_on(cache.len()) <= capacity);
        if count > 0 {
            prop_assert!(rt.block_on(cache.contains(MsgId(count - 1))));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_verified_msg_id_and_signer_match_envelope(
        msg_id in any::<u64>(),
        tx_id in "[a-z0-9-]{1,24}",
    ) {
        let signed = MessageBuilder::tx_sign(&tx_id).build().unwrap();
        let envelope = structured_envelope(MsgId(msg_id), &signed);
        let verified = verify_envelope(&fixture_certificates(), &envelope).unwrap();

        prop_assert_eq!(verified.transport_metadata.msg_id, MsgId(msg_id));
        prop_assert_eq!(
            verified.verified_by[0].as_str(),
            certificate_key(&signed.signature_info.signing_service_id)
        );
    }

    #[test]
    fn prop_unsupported_major_always_rejected(major in 3u64..10_000, minor in 0u32..100) {
        let version = format!("{major}.{minor}");
        let signed = MessageBuilder::proof_of_ownership("req-1", Some(json!(version.clone()))).build().unwrap();
        let err = verify_envelope(&fixture_certificates(), &structured_envelope(MsgId(1), &signed)).unwrap_err();
        prop_assert_eq!(err, VerifyError::UnsupportedVersion(version));
    }
}
