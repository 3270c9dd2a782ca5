// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Verifier half of the credential activation protocol.
//!
//! This is a software TPM2_MakeCredential: the challenge can only be opened
//! by TPM2_ActivateCredential on the TPM holding the EK private key, with the
//! AK named in the challenge loaded beside it.

use std::fmt;

use log::debug;
use openssl::bn::BigNum;
use openssl::encrypt::Encrypter;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::{Padding, Rsa};
use openssl::sign::Signer;
use openssl::symm::{self, Cipher};
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::error::CredentialError;
use crate::marshal::{object_name, RsaPublicArea};

pub const CREDENTIAL_SECRET_SIZE: usize = 32;
const SEED_SIZE: usize = 32;

const IDENTITY_LABEL: &[u8] = b"IDENTITY\0";
const STORAGE_LABEL: &[u8] = b"STORAGE";
const INTEGRITY_LABEL: &[u8] = b"INTEGRITY";

/// The secret wrapped into a challenge, kept by the verifier until the
/// attestor answers.
#[derive(Clone, PartialEq, Eq)]
pub struct ChallengeSecret([u8; CREDENTIAL_SECRET_SIZE]);

impl ChallengeSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ChallengeSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChallengeSecret(..)")
    }
}

/// What the attestor feeds to TPM2_ActivateCredential.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialChallenge {
    /// Body of the TPM2B_ID_OBJECT: `TPM2B(integrity HMAC) || encIdentity`
    #[serde_as(as = "Base64")]
    pub credential_blob: Vec<u8>,
    /// Body of the TPM2B_ENCRYPTED_SECRET: the OAEP-wrapped seed
    #[serde_as(as = "Base64")]
    pub encrypted_secret: Vec<u8>,
}

/// TPM name of the attestation key described by a marshalled TPMT_PUBLIC.
pub fn ak_name(ak_public_area: &[u8]) -> Result<Vec<u8>, CredentialError> {
    object_name(ak_public_area).map_err(|e| CredentialError::MalformedChallenge(e.to_string()))
}

/// KDFa from TPM 2.0 part 1, section 11.4.10.2, with SHA-256 as the PRF.
pub(crate) fn kdfa(
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>, CredentialError> {
    let size = (bits as usize).div_ceil(8);
    let pkey = PKey::hmac(key)?;

    let mut out = Vec::with_capacity(size);
    let mut counter = 1u32;
    while out.len() < size {
        let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
        signer.update(&counter.to_be_bytes())?;
        signer.update(label)?;
        signer.update(&[0])?;
        signer.update(context_u)?;
        signer.update(context_v)?;
        signer.update(&bits.to_be_bytes())?;
        out.extend_from_slice(&signer.sign_to_vec()?);
        counter += 1;
    }
    out.truncate(size);
    Ok(out)
}

pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, CredentialError> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    for part in parts {
        signer.update(part)?;
    }
    Ok(signer.sign_to_vec()?)
}

/// Wrap `seed` to the EK with RSA-OAEP/SHA-256 and the "IDENTITY" label.
fn wrap_seed(ek: &RsaPublicKey, seed: &[u8]) -> Result<Vec<u8>, CredentialError> {
    let rsa = Rsa::from_public_components(
        BigNum::from_slice(&ek.n().to_bytes_be())?,
        BigNum::from_slice(&ek.e().to_bytes_be())?,
    )?;
    let pkey = PKey::from_rsa(rsa)?;

    let mut encrypter = Encrypter::new(&pkey)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    encrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
    encrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;
    encrypter.set_rsa_oaep_label(IDENTITY_LABEL)?;

    let mut wrapped = vec![0u8; encrypter.encrypt_len(seed)?];
    let len = encrypter.encrypt(seed, &mut wrapped)?;
    wrapped.truncate(len);
    Ok(wrapped)
}

/// TPM2_MakeCredential with a caller supplied seed.
pub fn make_credential(
    ek: &RsaPublicKey,
    ak_name: &[u8],
    secret: &[u8],
    seed: &[u8],
) -> Result<CredentialChallenge, CredentialError> {
    let encrypted_secret = wrap_seed(ek, seed)?;

    let sym_key = kdfa(seed, STORAGE_LABEL, ak_name, &[], 128)?;
    let hmac_key = kdfa(seed, INTEGRITY_LABEL, &[], &[], 256)?;

    let mut plaintext = (secret.len() as u16).to_be_bytes().to_vec();
    plaintext.extend_from_slice(secret);
    let enc_identity = symm::encrypt(
        Cipher::aes_128_cfb128(),
        &sym_key,
        Some(&[0u8; 16]),
        &plaintext,
    )?;
    let integrity = hmac_sha256(&hmac_key, &[&enc_identity, ak_name])?;

    let mut credential_blob = (integrity.len() as u16).to_be_bytes().to_vec();
    credential_blob.extend_from_slice(&integrity);
    credential_blob.extend_from_slice(&enc_identity);

    Ok(CredentialChallenge {
        credential_blob,
        encrypted_secret,
    })
}

/// Issue a fresh challenge binding a random secret to the given EK and AK.
///
/// The AK must be a fixed, restricted signing key, anything else cannot
/// serve as an attestation identity.
pub fn generate_challenge(
    ek: &RsaPublicKey,
    ak_public_area: &[u8],
) -> Result<(ChallengeSecret, CredentialChallenge), CredentialError> {
    let area = RsaPublicArea::parse(ak_public_area)
        .map_err(|e| CredentialError::MalformedChallenge(format!("attestation key: {e}")))?;
    if !area.is_restricted_signing_key() {
        return Err(CredentialError::UnsuitableAttestationKey);
    }
    let name = ak_name(ak_public_area)?;

    let mut secret = [0u8; CREDENTIAL_SECRET_SIZE];
    openssl::rand::rand_bytes(&mut secret)?;
    let mut seed = [0u8; SEED_SIZE];
    openssl::rand::rand_bytes(&mut seed)?;

    let challenge = make_credential(ek, &name, &secret, &seed)?;
    debug!("Issued credential challenge for AK 0x{}", hex::encode(&name));

    Ok((ChallengeSecret(secret), challenge))
}

/// Compare the secret recovered by the attestor with the issued one.
pub fn verify_activation(
    expected: &ChallengeSecret,
    returned: &[u8],
) -> Result<(), CredentialError> {
    if returned.len() == expected.0.len() && openssl::memcmp::eq(&expected.0, returned) {
        Ok(())
    } else {
        Err(CredentialError::SecretMismatch)
    }
}
