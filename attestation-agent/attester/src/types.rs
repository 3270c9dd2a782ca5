// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use strum::{AsRefStr, EnumString};

use crate::error::PcrError;
use crate::pcr::PCR_BANK_SIZE;

pub const NONCE_SIZE: usize = 32;

/// Freshness token issued by the verifier for one verification round.
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce(#[serde_as(as = "Base64")] [u8; NONCE_SIZE]);

impl Nonce {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; NONCE_SIZE];
        openssl::rand::rand_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let Ok(bytes) = <[u8; NONCE_SIZE]>::try_from(bytes) else {
            bail!(
                "Nonce must be {NONCE_SIZE} bytes, got {} bytes",
                bytes.len()
            );
        };
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; NONCE_SIZE]> for Nonce {
    fn from(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

/// A set of SHA-256 bank PCR indices, kept sorted and deduplicated so that
/// the composite digest is always computed in ascending index order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct PcrSelection(Vec<u32>);

impl PcrSelection {
    pub fn new(indices: impl IntoIterator<Item = u32>) -> Result<Self, PcrError> {
        let mut indices: Vec<u32> = indices.into_iter().collect();
        if let Some(bad) = indices.iter().find(|i| **i as usize >= PCR_BANK_SIZE) {
            return Err(PcrError::IndexOutOfRange(*bad));
        }
        if indices.is_empty() {
            return Err(PcrError::EmptySelection);
        }
        indices.sort_unstable();
        indices.dedup();
        Ok(Self(indices))
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    /// TPMS_PCR_SELECTION bitmap: bit `i % 8` of byte `i / 8` selects PCR `i`.
    pub fn to_bitmap(&self) -> Vec<u8> {
        let mut bitmap = vec![0u8; PCR_BANK_SIZE / 8];
        for index in &self.0 {
            bitmap[*index as usize / 8] |= 1 << (index % 8);
        }
        bitmap
    }

    pub fn from_bitmap(bitmap: &[u8]) -> Result<Self, PcrError> {
        let indices = bitmap.iter().enumerate().flat_map(|(byte, bits)| {
            (0..8u32)
                .filter(move |bit| *bits & (1u8 << bit) != 0)
                .map(move |bit| byte as u32 * 8 + bit)
        });
        Self::new(indices)
    }
}

/// PCRs 0-7, the firmware and boot loader measurements.
impl Default for PcrSelection {
    fn default() -> Self {
        Self((0..8).collect())
    }
}

impl TryFrom<Vec<u32>> for PcrSelection {
    type Error = PcrError;

    fn try_from(indices: Vec<u32>) -> Result<Self, Self::Error> {
        Self::new(indices)
    }
}

impl From<PcrSelection> for Vec<u32> {
    fn from(selection: PcrSelection) -> Self {
        selection.0
    }
}

/// TPM Quote
#[serde_as]
#[derive(Debug, Serialize, Clone, Deserialize, PartialEq)]
pub struct TpmQuote {
    /// Marshalled TPMS_ATTEST, the structure signed by the AK
    #[serde_as(as = "Base64")]
    pub attestation: Vec<u8>,
    /// Raw RSASSA-PKCS1-v1_5 signature over SHA-256(attestation)
    #[serde_as(as = "Base64")]
    pub signature: Vec<u8>,
}

/// Persisted form of an attestation key created under the EK.
///
/// `ak_public` is the marshalled TPMT_PUBLIC and is what the verifier uses to
/// compute the AK name. `ak_private` is the TPM-wrapped private blob, only
/// loadable by the TPM that created it.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttestationKeyBlob {
    pub ak_hash_alg: String,
    pub ak_sign_alg: String,
    #[serde_as(as = "Base64")]
    pub ak_public: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub ak_private: Vec<u8>,
}

/// How leftover TPM objects are handled when the device is opened.
#[derive(
    EnumString, AsRefStr, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FlushPolicy {
    None,
    #[default]
    Transient,
}

/// The boundary-facing result of a verification round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Verdict {
    pub is_legit: bool,
    pub message: String,
}

impl Verdict {
    pub fn legit(message: impl Into<String>) -> Self {
        Self {
            is_legit: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            is_legit: false,
            message: message.into(),
        }
    }
}
