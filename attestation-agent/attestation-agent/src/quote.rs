// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! One verification round: the verifier issues a nonce, the attestor quotes
//! over it and the verifier checks the quote against the CI/CD prediction.

use std::fs;
use std::io;

use anyhow::{Context, Result};
use attester::eventlog::parse_tcg_eventlog;
use attester::keys::{read_rsa_public_key, rsa_public_key_from_pem};
use attester::tpm::quote::perform_quote;
use attester::tpm::{AttestationKey, TpmDevice};
use attester::verifier::{verify_quote_with_eventlog, QuoteEvidence};
use attester::{Nonce, PcrSelection, TpmQuote, Verdict, VerifyError};
use log::{error, info, warn};

use crate::config::StorageConfig;
use crate::provision::{read_attestation_key, read_file, write_file};

/// Verifier: issue a fresh nonce and remember it for the verification. Only
/// the latest nonce is outstanding.
pub fn issue_nonce(storage: &StorageConfig) -> Result<Nonce> {
    let nonce = Nonce::generate()?;
    write_file(&storage.resolve(&storage.quote_nonce), nonce.as_bytes())?;
    Ok(nonce)
}

/// Attestor: quote `selection` over `nonce` with the provisioned AK.
pub fn produce_quote(
    device: &mut TpmDevice,
    storage: &StorageConfig,
    selection: &PcrSelection,
    nonce: &Nonce,
) -> Result<TpmQuote> {
    let ek_public = read_rsa_public_key(&storage.resolve(&storage.attestor_ek))?;
    let ak = AttestationKey::from_blob(&read_attestation_key(storage)?)?;

    let quote = perform_quote(device, &ek_public, &ak, selection, nonce)?;
    write_file(&storage.resolve(&storage.quote_attestation), &quote.attestation)?;
    write_file(&storage.resolve(&storage.quote_signature), &quote.signature)?;
    info!("Quoted PCRs {:?}", selection.indices());
    Ok(quote)
}

/// The nonce and quote of the last round, as stored by the two roles.
pub fn load_round(storage: &StorageConfig) -> Result<(Nonce, TpmQuote)> {
    let nonce = Nonce::from_slice(&read_file(&storage.resolve(&storage.quote_nonce))?)?;
    let quote = TpmQuote {
        attestation: read_file(&storage.resolve(&storage.quote_attestation))?,
        signature: read_file(&storage.resolve(&storage.quote_signature))?,
    };
    Ok((nonce, quote))
}

/// Verifier: take the outstanding nonce out of storage. Each issued nonce is
/// good for one verification only.
fn take_issued_nonce(storage: &StorageConfig) -> Result<Option<Nonce>> {
    let path = storage.resolve(&storage.quote_nonce);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    fs::remove_file(&path).with_context(|| format!("consume {}", path.display()))?;
    Ok(Some(Nonce::from_slice(&bytes)?))
}

/// Verifier: check `quote` against the outstanding nonce and the CI/CD
/// prediction. The outstanding nonce is consumed whatever the outcome, so a
/// round cannot be verified twice.
///
/// Problems on the verifier's own side, such as a missing prediction or an
/// unreadable AK key, are logged and reported as a plain rejection.
pub fn check_quote(
    storage: &StorageConfig,
    selection: &PcrSelection,
    nonce: &Nonce,
    quote: TpmQuote,
    ak_pub: &str,
) -> Verdict {
    match try_check_quote(storage, selection, nonce, quote, ak_pub) {
        Ok(verdict) => verdict,
        Err(e) => {
            error!("Quote verification could not run: {e:#}");
            Verdict::rejected("verification failed")
        }
    }
}

fn try_check_quote(
    storage: &StorageConfig,
    selection: &PcrSelection,
    nonce: &Nonce,
    quote: TpmQuote,
    ak_pub: &str,
) -> Result<Verdict> {
    let issued = take_issued_nonce(storage)?;
    if issued.as_ref() != Some(nonce) {
        warn!("Nonce {nonce:?} is not the outstanding one");
        return Ok(Verdict::from(Err::<(), _>(VerifyError::NonceMismatch {
            expected: issued.map_or_else(|| "none".to_string(), |n| hex::encode(n.as_bytes())),
            got: hex::encode(nonce.as_bytes()),
        })));
    }

    let ak_public = rsa_public_key_from_pem(ak_pub.as_bytes()).context("decode AK public key")?;
    let prediction = read_file(&storage.resolve(&storage.cicd_prediction))?;
    let entries = parse_tcg_eventlog(&prediction).context("parse CI/CD prediction")?;

    let evidence = QuoteEvidence { quote, ak_public };
    Ok(verify_quote_with_eventlog(&evidence, nonce, selection, &entries).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_nonce_round_trip_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::under(dir.path());
        let nonce = issue_nonce(&storage).unwrap();
        let quote = TpmQuote {
            attestation: vec![1, 2, 3],
            signature: vec![4, 5],
        };
        write_file(&storage.resolve(&storage.quote_attestation), &quote.attestation).unwrap();
        write_file(&storage.resolve(&storage.quote_signature), &quote.signature).unwrap();

        assert_eq!(load_round(&storage).unwrap(), (nonce, quote));
        assert_ne!(issue_nonce(&storage).unwrap(), nonce);
    }

    #[test]
    fn test_check_quote() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fixtures::storage_with_prediction(dir.path());
        let ak = fixtures::ak();
        let selection = PcrSelection::new([0, 7]).unwrap();
        let nonce = issue_nonce(&storage).unwrap();

        let quote = fixtures::signed_quote(&ak, &nonce, &selection);
        let verdict = check_quote(&storage, &selection, &nonce, quote, &fixtures::ak_pem(&ak));
        assert_eq!(verdict, Verdict::legit("the quote is legit"));
    }

    #[test]
    fn test_round_is_verified_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fixtures::storage_with_prediction(dir.path());
        let ak = fixtures::ak();
        let selection = PcrSelection::new([0, 7]).unwrap();
        let nonce = issue_nonce(&storage).unwrap();
        let quote = fixtures::signed_quote(&ak, &nonce, &selection);

        let first = check_quote(&storage, &selection, &nonce, quote.clone(), &fixtures::ak_pem(&ak));
        assert!(first.is_legit);
        assert!(!storage.resolve(&storage.quote_nonce).exists());

        let replayed = check_quote(&storage, &selection, &nonce, quote, &fixtures::ak_pem(&ak));
        assert_eq!(replayed, Verdict::rejected("nonce mismatch"));
    }

    #[test]
    fn test_nonce_must_be_issued() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fixtures::storage_with_prediction(dir.path());
        let ak = fixtures::ak();
        let selection = PcrSelection::new([0]).unwrap();

        // Well signed over a nonce the verifier never handed out.
        let forged = Nonce::from([0x42; 32]);
        let quote = fixtures::signed_quote(&ak, &forged, &selection);
        let verdict = check_quote(&storage, &selection, &forged, quote.clone(), &fixtures::ak_pem(&ak));
        assert_eq!(verdict, Verdict::rejected("nonce mismatch"));

        let issued = issue_nonce(&storage).unwrap();
        assert_ne!(issued, forged);
        let verdict = check_quote(&storage, &selection, &forged, quote, &fixtures::ak_pem(&ak));
        assert_eq!(verdict, Verdict::rejected("nonce mismatch"));
        assert!(!storage.resolve(&storage.quote_nonce).exists());
    }

    #[test]
    fn test_quote_over_other_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let storage = fixtures::storage_with_prediction(dir.path());
        let ak = fixtures::ak();
        let selection = PcrSelection::new([0]).unwrap();
        let nonce = issue_nonce(&storage).unwrap();

        let quote = fixtures::signed_quote(&ak, &Nonce::from([0x43; 32]), &selection);
        let verdict = check_quote(&storage, &selection, &nonce, quote, &fixtures::ak_pem(&ak));
        assert_eq!(verdict, Verdict::rejected("nonce mismatch"));
    }

    #[test]
    fn test_check_quote_without_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::under(dir.path());
        let ak = fixtures::ak();
        let selection = PcrSelection::new([0]).unwrap();
        let nonce = issue_nonce(&storage).unwrap();

        let quote = fixtures::signed_quote(&ak, &nonce, &selection);
        let verdict = check_quote(&storage, &selection, &nonce, quote, &fixtures::ak_pem(&ak));
        assert_eq!(verdict, Verdict::rejected("verification failed"));
    }
}
