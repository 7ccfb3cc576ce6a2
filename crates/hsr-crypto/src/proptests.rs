use proptest::prelude::*;

use crate::keys::fixtures::*;
use crate::signature::{ecdsa_der_to_fixed, ecdsa_fixed_to_der, sign_payload};
use crate::{verify_signature, CryptoError, PrivateKey, PublicKey, SignatureEncoding};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_flipping_any_payload_byte_breaks_signature(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        idx in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let sk = PrivateKey::from_pem(RSA_KEY).unwrap();
        let pk = PublicKey::from_pem(RSA_CERT).unwrap();
        let sig = sign_payload(&sk, &payload, SignatureEncoding::Base64).unwrap();
        prop_assert!(verify_signature(&pk, &payload, &sig, SignatureEncoding::Base64).is_ok());

        let mut tampered = payload.clone();
        let i = idx.index(tampered.len());
        tampered[i] ^= flip;
        prop_assert_eq!(
            verify_signature(&pk, &tampered, &sig, SignatureEncoding::Base64),
            Err(CryptoError::SignatureMismatch)
        );
    }

    #[test]
    fn prop_der_form_preserves_scalars(r in any::<[u8; 32]>(), s in any::<[u8; 32]>()) {
        let mut fixed = r.to_vec();
        fixed.extend_from_slice(&s);
        prop_assume!(p256::ecdsa::Signature::from_slice(&fixed).is_ok());
        let der = ecdsa_fixed_to_der(&fixed).unwrap();
        prop_assert_eq!(der[0], 0x30);
        prop_assert!(der.len() <= 72);
        prop_assert_eq!(ecdsa_der_to_fixed(&der).unwrap(), fixed);
    }

    #[test]
    fn prop_der_parser_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..96)) {
        let _ = ecdsa_der_to_fixed(&bytes);
    }

    #[test]
    fn prop_hex_and_base64_carry_the_same_signature(payload in prop::collection::vec(any::<u8>(), 0..64)) {
        let sk = PrivateKey::from_pem(EC_KEY).unwrap();
        let pk = PublicKey::from_pem(EC_CERT).unwrap();
        let b64 = sign_payload(&sk, &payload, SignatureEncoding::Base64).unwrap();
        let raw = SignatureEncoding::Base64.decode(&b64).unwrap();
        let hex = SignatureEncoding::Hex.encode(&raw);
        prop_assert!(verify_signature(&pk, &payload, &hex, SignatureEncoding::Hex).is_ok());
    }
}
