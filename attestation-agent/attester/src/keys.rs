// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! PEM/DER key and certificate material exchanged between the roles.
//! Only RSA keys are accepted.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use openssl::pkey::{Id, PKey, Public};
use openssl::x509::X509;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{BigUint, RsaPublicKey};

use crate::error::KeyError;

fn to_rsa_public_key(pkey: PKey<Public>) -> Result<RsaPublicKey, KeyError> {
    if pkey.id() != Id::RSA {
        return Err(KeyError::NotRsa);
    }
    let rsa = pkey.rsa()?;
    RsaPublicKey::new(
        BigUint::from_bytes_be(&rsa.n().to_vec()),
        BigUint::from_bytes_be(&rsa.e().to_vec()),
    )
    .map_err(|e| KeyError::Encoding(e.to_string()))
}

/// Decode a PEM `PUBLIC KEY` (SubjectPublicKeyInfo).
pub fn rsa_public_key_from_pem(pem: &[u8]) -> Result<RsaPublicKey, KeyError> {
    to_rsa_public_key(PKey::public_key_from_pem(pem)?)
}

/// Extract the subject public key of a PEM or DER X.509 certificate.
pub fn rsa_public_key_from_certificate(cert: &[u8]) -> Result<RsaPublicKey, KeyError> {
    let x509 = if cert.starts_with(b"-----BEGIN") {
        X509::from_pem(cert)?
    } else {
        X509::from_der(cert)?
    };
    to_rsa_public_key(x509.public_key()?)
}

/// Accepts either a public key or a certificate.
pub fn rsa_public_key_from_any(material: &[u8]) -> Result<RsaPublicKey, KeyError> {
    if material.starts_with(b"-----BEGIN CERTIFICATE") || !material.starts_with(b"-----") {
        rsa_public_key_from_certificate(material)
    } else {
        rsa_public_key_from_pem(material)
    }
}

pub fn rsa_public_key_to_pem(key: &RsaPublicKey) -> Result<String, KeyError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyError::Encoding(e.to_string()))
}

pub fn certificate_der_to_pem(der: &[u8]) -> Result<String, KeyError> {
    let pem = X509::from_der(der)?.to_pem()?;
    String::from_utf8(pem).map_err(|e| KeyError::Encoding(e.to_string()))
}

pub fn read_rsa_public_key(path: &Path) -> Result<RsaPublicKey> {
    let material =
        fs::read(path).with_context(|| format!("read key material {}", path.display()))?;
    rsa_public_key_from_any(&material)
        .with_context(|| format!("decode key material {}", path.display()))
}

pub fn write_rsa_public_key(path: &Path, key: &RsaPublicKey) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, rsa_public_key_to_pem(key)?)
        .with_context(|| format!("write public key {}", path.display()))
}
