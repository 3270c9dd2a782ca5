// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Quote verification against a predicted PCR state.

use log::{debug, info, warn};
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::VerifyError;
use crate::eventlog::EventLogEntry;
use crate::marshal::QuoteAttestation;
use crate::pcr::{predict_composite_digest, PcrValue};
use crate::types::{Nonce, PcrSelection, TpmQuote, Verdict};

/// A quote together with the trusted AK public key it must be signed with.
#[derive(Debug, Clone)]
pub struct QuoteEvidence {
    pub quote: TpmQuote,
    pub ak_public: RsaPublicKey,
}

/// What the verifier expects the quote to attest.
#[derive(Debug, Clone)]
pub struct ExpectedState {
    pub nonce: Nonce,
    pub selection: PcrSelection,
    pub pcr_digest: PcrValue,
}

/// Run the checks in order: structure, nonce, PCR digest, signature. The
/// first failing check decides the error.
pub fn verify_quote(evidence: &QuoteEvidence, expected: &ExpectedState) -> Result<(), VerifyError> {
    let attestation = QuoteAttestation::parse(&evidence.quote.attestation)
        .map_err(|e| VerifyError::MalformedAttestation(e.to_string()))?;

    if attestation.extra_data != expected.nonce.as_bytes() {
        return Err(VerifyError::NonceMismatch {
            expected: hex::encode(expected.nonce.as_bytes()),
            got: hex::encode(&attestation.extra_data),
        });
    }

    let selection = attestation
        .sha256_selection()
        .map_err(|e| VerifyError::PcrDigestMismatch(e.to_string()))?;
    if selection != expected.selection {
        return Err(VerifyError::PcrDigestMismatch(format!(
            "quoted PCRs {:?}, requested {:?}",
            selection.indices(),
            expected.selection.indices()
        )));
    }
    if attestation.pcr_digest != expected.pcr_digest {
        return Err(VerifyError::PcrDigestMismatch(format!(
            "quoted 0x{}, predicted 0x{}",
            hex::encode(&attestation.pcr_digest),
            hex::encode(expected.pcr_digest)
        )));
    }

    let hashed = Sha256::digest(&evidence.quote.attestation);
    evidence
        .ak_public
        .verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &hashed,
            &evidence.quote.signature,
        )
        .map_err(|e| VerifyError::InvalidSignature(e.to_string()))?;

    debug!(
        "Quote verified, clock {} reset count {}",
        attestation.clock_info.clock, attestation.clock_info.reset_count
    );
    Ok(())
}

/// Replay the measurement log to predict the digest, then verify.
///
/// A quote that does not parse is reported as malformed before the log is
/// looked at. A log that cannot be replayed is
/// [`VerifyError::MalformedPrediction`], never a mismatch of the quote.
pub fn verify_quote_with_eventlog(
    evidence: &QuoteEvidence,
    nonce: &Nonce,
    selection: &PcrSelection,
    entries: &[EventLogEntry],
) -> Result<(), VerifyError> {
    QuoteAttestation::parse(&evidence.quote.attestation)
        .map_err(|e| VerifyError::MalformedAttestation(e.to_string()))?;

    let pcr_digest = predict_composite_digest(entries, selection)
        .map_err(|e| VerifyError::MalformedPrediction(format!("event log replay failed: {e}")))?;
    debug!("Predicted PCR digest 0x{}", hex::encode(pcr_digest));

    verify_quote(
        evidence,
        &ExpectedState {
            nonce: *nonce,
            selection: selection.clone(),
            pcr_digest,
        },
    )
}

impl From<Result<(), VerifyError>> for Verdict {
    fn from(result: Result<(), VerifyError>) -> Self {
        match result {
            Ok(()) => {
                info!("Quote is legit");
                Verdict::legit("the quote is legit")
            }
            Err(e) => {
                warn!("Quote rejected: {e}");
                Verdict::rejected(e.reason())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::rsa_public_key_from_pem;
    use crate::marshal::tests::sample_quote;
    use crate::pcr::PCR_DIGEST_SIZE;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::sign::Signer;
    use rstest::rstest;

    struct Fixture {
        key: PKey<Private>,
        evidence: QuoteEvidence,
        expected: ExpectedState,
    }

    fn sign(key: &PKey<Private>, blob: &[u8]) -> Vec<u8> {
        let mut signer = Signer::new(MessageDigest::sha256(), key).unwrap();
        signer.update(blob).unwrap();
        signer.sign_to_vec().unwrap()
    }

    /// A quote over PCR0 after the firmware extended it with 32 bytes of 0xAA.
    fn fixture() -> Fixture {
        let rsa = Rsa::generate(2048).unwrap();
        let ak_public = rsa_public_key_from_pem(&rsa.public_key_to_pem().unwrap()).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let nonce = Nonce::generate().unwrap();
        let selection = PcrSelection::new([0]).unwrap();
        let log = vec![EventLogEntry::new(0, [0xAA; PCR_DIGEST_SIZE], "firmware")];
        let pcr_digest = predict_composite_digest(&log, &selection).unwrap();

        let attestation = sample_quote(nonce.as_bytes(), &selection, &pcr_digest).marshal();
        let signature = sign(&key, &attestation);

        Fixture {
            key,
            evidence: QuoteEvidence {
                quote: TpmQuote {
                    attestation,
                    signature,
                },
                ak_public,
            },
            expected: ExpectedState {
                nonce,
                selection,
                pcr_digest,
            },
        }
    }

    #[test]
    fn test_genuine_quote_is_legit() {
        let f = fixture();
        verify_quote(&f.evidence, &f.expected).unwrap();

        let verdict = Verdict::from(verify_quote(&f.evidence, &f.expected));
        assert!(verdict.is_legit);
    }

    #[test]
    fn test_eventlog_prediction() {
        let f = fixture();
        let log = vec![EventLogEntry::new(0, [0xAA; PCR_DIGEST_SIZE], "firmware")];
        verify_quote_with_eventlog(&f.evidence, &f.expected.nonce, &f.expected.selection, &log)
            .unwrap();

        let tampered = vec![EventLogEntry::new(0, [0xAB; PCR_DIGEST_SIZE], "firmware")];
        let err = verify_quote_with_eventlog(
            &f.evidence,
            &f.expected.nonce,
            &f.expected.selection,
            &tampered,
        )
        .unwrap_err();
        assert_eq!(err.reason(), "PCR digest mismatch");
    }

    #[test]
    fn test_unreplayable_log_is_not_a_quote_mismatch() {
        let f = fixture();
        let bad_log = vec![EventLogEntry::new(24, [0xAA; PCR_DIGEST_SIZE], "firmware")];
        let err = verify_quote_with_eventlog(
            &f.evidence,
            &f.expected.nonce,
            &f.expected.selection,
            &bad_log,
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::MalformedPrediction(_)));
        assert_eq!(Verdict::from(Err(err)).message, "malformed prediction");

        // A broken quote is still reported as such first.
        let mut broken = f.evidence.clone();
        broken.quote.attestation = vec![0xff, 0x54, 0x43];
        let err = verify_quote_with_eventlog(
            &broken,
            &f.expected.nonce,
            &f.expected.selection,
            &bad_log,
        )
        .unwrap_err();
        assert_eq!(err.reason(), "malformed attestation");
    }

    #[test]
    fn test_other_nonce_is_rejected() {
        let mut f = fixture();
        f.expected.nonce = Nonce::generate().unwrap();
        let err = verify_quote(&f.evidence, &f.expected).unwrap_err();
        assert_eq!(err.reason(), "nonce mismatch");
    }

    #[rstest]
    #[case::nonce(|q: &mut QuoteAttestation| q.extra_data[0] ^= 1, "nonce mismatch")]
    #[case::digest(|q: &mut QuoteAttestation| q.pcr_digest[31] ^= 1, "PCR digest mismatch")]
    #[case::selection(|q: &mut QuoteAttestation| q.pcr_selections[0].bitmap[0] = 0x03, "PCR digest mismatch")]
    fn test_resigned_tampering_is_rejected(
        #[case] tamper: fn(&mut QuoteAttestation),
        #[case] reason: &str,
    ) {
        let mut f = fixture();
        let mut attestation = QuoteAttestation::parse(&f.evidence.quote.attestation).unwrap();
        tamper(&mut attestation);
        f.evidence.quote.attestation = attestation.marshal();
        f.evidence.quote.signature = sign(&f.key, &f.evidence.quote.attestation);

        let verdict = Verdict::from(verify_quote(&f.evidence, &f.expected));
        assert!(!verdict.is_legit);
        assert_eq!(verdict.message, reason);
    }

    #[test]
    fn test_flipped_signature_byte_is_rejected() {
        let mut f = fixture();
        f.evidence.quote.signature[10] ^= 0x01;
        let err = verify_quote(&f.evidence, &f.expected).unwrap_err();
        assert_eq!(err.reason(), "invalid signature");
    }

    #[test]
    fn test_foreign_ak_is_rejected() {
        let mut f = fixture();
        let other = Rsa::generate(2048).unwrap();
        f.evidence.ak_public =
            rsa_public_key_from_pem(&other.public_key_to_pem().unwrap()).unwrap();
        let err = verify_quote(&f.evidence, &f.expected).unwrap_err();
        assert_eq!(err.reason(), "invalid signature");
    }

    #[rstest]
    #[case::empty(0)]
    #[case::header_only(6)]
    #[case::short_by_one(1)]
    fn test_malformed_attestation(#[case] keep: usize) {
        let mut f = fixture();
        let len = f.evidence.quote.attestation.len();
        let keep = if keep == 1 { len - 1 } else { keep };
        f.evidence.quote.attestation.truncate(keep);
        let err = verify_quote(&f.evidence, &f.expected).unwrap_err();
        assert_eq!(err.reason(), "malformed attestation");
    }

    #[test]
    fn test_checks_run_in_order() {
        // Nonce and digest both wrong, signature invalid: the nonce is reported.
        let mut f = fixture();
        f.expected.nonce = Nonce::generate().unwrap();
        f.expected.pcr_digest = [0; PCR_DIGEST_SIZE];
        f.evidence.quote.signature[0] ^= 1;
        let err = verify_quote(&f.evidence, &f.expected).unwrap_err();
        assert!(matches!(err, VerifyError::NonceMismatch { .. }));
    }
}
