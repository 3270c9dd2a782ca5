// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! One-time provisioning of a device, played out by all four roles.
//!
//! Each step reads what the previous role stored and writes its own output
//! through [`StorageConfig`], so the steps can also be run one at a time.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use attester::credential::{generate_challenge, verify_activation, ChallengeSecret, CredentialChallenge};
use attester::eventlog::parse_tcg_eventlog;
use attester::keys::{read_rsa_public_key, rsa_public_key_from_certificate, write_rsa_public_key};
use attester::marshal::RsaPublicArea;
use attester::tpm::credential::activate_credential;
use attester::tpm::{AttestationKey, TpmDevice};
use attester::AttestationKeyBlob;
use log::{info, warn};
use rsa::RsaPublicKey;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StorageConfig;

pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

pub(crate) fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    serde_json::from_slice(&read_file(path)?).with_context(|| format!("parse {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_file(path, &serde_json::to_vec_pretty(value)?)
}

pub fn read_attestation_key(storage: &StorageConfig) -> Result<AttestationKeyBlob> {
    read_json(&storage.resolve(&storage.attestor_ak))
}

/// CI/CD: store the platform event log as the prediction quotes are checked
/// against. A real pipeline would compute it from the assets it builds.
pub fn snapshot_event_log(storage: &StorageConfig) -> Result<()> {
    let eventlog = read_file(&storage.resolve(&storage.eventlog_source))?;
    let entries = parse_tcg_eventlog(&eventlog).context("platform event log is not usable")?;
    write_file(&storage.resolve(&storage.cicd_prediction), &eventlog)?;
    info!("Stored CI/CD prediction with {} measurements", entries.len());
    Ok(())
}

/// Read the EK public key from the TPM and store it at `path`.
pub fn record_ek(device: &mut TpmDevice, path: &Path) -> Result<RsaPublicKey> {
    let ek_public = device.create_ek()?.public_key()?;
    write_rsa_public_key(path, &ek_public)?;
    info!("Stored EK public key in {}", path.display());
    Ok(ek_public)
}

/// Verifier: accept the EK the attestor reports only if it is the one the
/// manufacturer recorded, and the one certified in TPM NV when a certificate
/// is available.
pub fn verify_ek(storage: &StorageConfig, ek_certificate: Option<&str>) -> Result<RsaPublicKey> {
    let reported = read_rsa_public_key(&storage.resolve(&storage.attestor_ek))?;
    let recorded = read_rsa_public_key(&storage.resolve(&storage.manufacturer_ek))?;
    if reported != recorded {
        bail!("EK reported by the attestor differs from the manufacturer record");
    }

    if let Some(certificate) = ek_certificate {
        let certified = rsa_public_key_from_certificate(certificate.as_bytes())
            .context("decode EK certificate")?;
        if certified != reported {
            bail!("EK reported by the attestor differs from the EK certificate");
        }
        info!("EK matches the EK certificate");
    }

    write_rsa_public_key(&storage.resolve(&storage.verifier_ek), &reported)?;
    Ok(reported)
}

/// Attestor: create the AK under the provisioned EK and store its blob.
pub fn create_attestation_key(
    device: &mut TpmDevice,
    storage: &StorageConfig,
) -> Result<AttestationKey> {
    let ek_public = read_rsa_public_key(&storage.resolve(&storage.attestor_ek))?;
    let ak = device.load_ek(&ek_public)?.create_ak()?;
    write_json(&storage.resolve(&storage.attestor_ak), &ak.to_blob()?)?;
    Ok(ak)
}

/// Verifier: wrap a fresh secret to the verified EK and the attestor's AK.
pub fn issue_challenge(storage: &StorageConfig) -> Result<ChallengeSecret> {
    let ek_public = read_rsa_public_key(&storage.resolve(&storage.verifier_ek))?;
    let blob = read_attestation_key(storage)?;
    let (secret, challenge) = generate_challenge(&ek_public, &blob.ak_public)?;
    write_json(&storage.resolve(&storage.verifier_credential), &challenge)?;
    info!("Issued credential challenge");
    Ok(secret)
}

/// Attestor: open the challenge with the TPM and store the recovered secret.
pub fn answer_challenge(device: &mut TpmDevice, storage: &StorageConfig) -> Result<Vec<u8>> {
    let challenge: CredentialChallenge =
        read_json(&storage.resolve(&storage.verifier_credential))?;
    let ek_public = read_rsa_public_key(&storage.resolve(&storage.attestor_ek))?;
    let ak = AttestationKey::from_blob(&read_attestation_key(storage)?)?;

    let attempt = activate_credential(device, &ek_public, &ak, &challenge)?;
    write_file(&storage.resolve(&storage.attestor_attempt), &attempt)?;
    Ok(attempt)
}

/// Verifier: trust the AK once the attestor proved it lives beside the EK.
pub fn accept_attestation_key(
    storage: &StorageConfig,
    secret: &ChallengeSecret,
) -> Result<RsaPublicKey> {
    let attempt = read_file(&storage.resolve(&storage.attestor_attempt))?;
    verify_activation(secret, &attempt)?;

    let blob = read_attestation_key(storage)?;
    let ak_public = RsaPublicArea::parse(&blob.ak_public)?.to_rsa_public_key()?;
    let path = storage.resolve(&storage.verifier_ak);
    write_rsa_public_key(&path, &ak_public)?;
    info!("AK is trusted, public key stored in {}", path.display());
    Ok(ak_public)
}

/// The whole provisioning sequence.
pub fn run_init(device: &mut TpmDevice, storage: &StorageConfig) -> Result<()> {
    info!("CI/CD: predict digests");
    snapshot_event_log(storage)?;

    info!("Manufacturer: record EK");
    record_ek(device, &storage.resolve(&storage.manufacturer_ek))?;

    info!("Attestor: read EK");
    record_ek(device, &storage.resolve(&storage.attestor_ek))?;

    info!("Verifier: verify EK");
    let ek_certificate = match device.read_ek_certificate() {
        Ok(certificate) => Some(certificate),
        Err(e) => {
            warn!("No EK certificate in TPM NV, checking against the manufacturer record only: {e}");
            None
        }
    };
    verify_ek(storage, ek_certificate.as_deref())?;

    info!("Attestor: create AK");
    create_attestation_key(device, storage)?;

    info!("Verifier: generate credential challenge");
    let secret = issue_challenge(storage)?;

    info!("Attestor: activate credential");
    answer_challenge(device, storage)?;

    info!("Verifier: verify credential");
    accept_attestation_key(storage, &secret)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use attester::keys::rsa_public_key_from_pem;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};

    fn rsa_key() -> (Rsa<openssl::pkey::Private>, RsaPublicKey) {
        let rsa = Rsa::generate(2048).unwrap();
        let public = rsa_public_key_from_pem(&rsa.public_key_to_pem().unwrap()).unwrap();
        (rsa, public)
    }

    fn self_signed(rsa: &Rsa<openssl::pkey::Private>) -> String {
        let pkey = PKey::from_rsa(rsa.clone()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "EK").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();
        String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
    }

    #[test]
    fn test_snapshot_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = StorageConfig::under(dir.path());
        storage.eventlog_source = "platform.bin".into();
        write_file(&storage.resolve(&storage.eventlog_source), &fixtures::platform_eventlog())
            .unwrap();

        snapshot_event_log(&storage).unwrap();
        assert_eq!(
            fs::read(storage.resolve(&storage.cicd_prediction)).unwrap(),
            fixtures::platform_eventlog()
        );
    }

    #[test]
    fn test_snapshot_rejects_unusable_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = StorageConfig::under(dir.path());
        storage.eventlog_source = "platform.bin".into();
        write_file(&storage.resolve(&storage.eventlog_source), b"garbage").unwrap();

        assert!(snapshot_event_log(&storage).is_err());
        assert!(!storage.resolve(&storage.cicd_prediction).exists());
    }

    #[test]
    fn test_verify_ek() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::under(dir.path());
        let (ek_private, ek) = rsa_key();
        write_rsa_public_key(&storage.resolve(&storage.manufacturer_ek), &ek).unwrap();
        write_rsa_public_key(&storage.resolve(&storage.attestor_ek), &ek).unwrap();

        let certificate = self_signed(&ek_private);
        assert_eq!(verify_ek(&storage, Some(&certificate)).unwrap(), ek);
        assert_eq!(
            read_rsa_public_key(&storage.resolve(&storage.verifier_ek)).unwrap(),
            ek
        );
    }

    #[test]
    fn test_verify_ek_rejects_substituted_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::under(dir.path());
        let (_, recorded) = rsa_key();
        let (other_private, reported) = rsa_key();
        write_rsa_public_key(&storage.resolve(&storage.manufacturer_ek), &recorded).unwrap();
        write_rsa_public_key(&storage.resolve(&storage.attestor_ek), &reported).unwrap();
        assert!(verify_ek(&storage, None).is_err());

        // Matching records but a certificate for another key.
        write_rsa_public_key(&storage.resolve(&storage.manufacturer_ek), &reported).unwrap();
        let (foreign_private, _) = rsa_key();
        assert!(verify_ek(&storage, Some(&self_signed(&foreign_private))).is_err());
        assert!(verify_ek(&storage, Some(&self_signed(&other_private))).is_ok());
    }

    #[test]
    fn test_challenge_then_accept() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::under(dir.path());
        let (_, ek) = rsa_key();
        write_rsa_public_key(&storage.resolve(&storage.verifier_ek), &ek).unwrap();
        let (_, ak_public) = fixtures::store_ak_blob(&storage);

        let secret = issue_challenge(&storage).unwrap();
        let challenge: CredentialChallenge =
            read_json(&storage.resolve(&storage.verifier_credential)).unwrap();
        assert!(!challenge.credential_blob.is_empty());

        // A wrong answer leaves the AK untrusted.
        write_file(&storage.resolve(&storage.attestor_attempt), &[0u8; 32]).unwrap();
        assert!(accept_attestation_key(&storage, &secret).is_err());
        assert!(!storage.resolve(&storage.verifier_ak).exists());

        write_file(&storage.resolve(&storage.attestor_attempt), secret.as_bytes()).unwrap();
        assert_eq!(accept_attestation_key(&storage, &secret).unwrap(), ak_public);
        assert_eq!(
            read_rsa_public_key(&storage.resolve(&storage.verifier_ak)).unwrap(),
            ak_public
        );
    }

    #[ignore]
    #[test]
    fn test_run_init_on_tpm() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::under(dir.path());
        let mut device = TpmDevice::open(&Default::default()).unwrap();
        run_init(&mut device, &storage).unwrap();
        assert!(storage.resolve(&storage.verifier_ak).exists());
    }
}
