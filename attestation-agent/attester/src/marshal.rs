// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Big-endian TPM 2.0 wire structures the verifier has to read without a TPM:
//! the TPMS_ATTEST produced by TPM2_Quote and the TPMT_PUBLIC of an RSA key.

use rsa::{BigUint, RsaPublicKey};
use scroll::{Pread, BE};
use sha2::{Digest, Sha256};

use crate::error::MarshalError;
use crate::types::PcrSelection;

pub const TPM_GENERATED_VALUE: u32 = 0xff54_4347;
pub const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;

pub const TPM_ALG_RSA: u16 = 0x0001;
pub const TPM_ALG_SHA1: u16 = 0x0004;
pub const TPM_ALG_SHA256: u16 = 0x000B;
pub const TPM_ALG_NULL: u16 = 0x0010;
pub const TPM_ALG_RSASSA: u16 = 0x0014;

pub const OBJECT_FIXED_TPM: u32 = 1 << 1;
pub const OBJECT_RESTRICTED: u32 = 1 << 16;
pub const OBJECT_SIGN_ENCRYPT: u32 = 1 << 18;

const RSA_DEFAULT_EXPONENT: u32 = 65537;

fn read_tpm2b<'a>(bytes: &'a [u8], offset: &mut usize) -> Result<&'a [u8], scroll::Error> {
    let size: u16 = bytes.gread_with(offset, BE)?;
    bytes.gread_with(offset, size as usize)
}

fn write_tpm2b(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn ensure_consumed(bytes: &[u8], offset: usize) -> Result<(), MarshalError> {
    match bytes.len() - offset {
        0 => Ok(()),
        n => Err(MarshalError::TrailingBytes(n)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// One TPMS_PCR_SELECTION of a TPML_PCR_SELECTION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrBankSelection {
    pub hash_alg: u16,
    pub bitmap: Vec<u8>,
}

/// A decoded TPMS_ATTEST of type TPM_ST_ATTEST_QUOTE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteAttestation {
    pub qualified_signer: Vec<u8>,
    /// Qualifying data, the verifier's nonce
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub pcr_selections: Vec<PcrBankSelection>,
    pub pcr_digest: Vec<u8>,
}

impl QuoteAttestation {
    pub fn parse(bytes: &[u8]) -> Result<Self, MarshalError> {
        let mut offset = 0;

        let magic: u32 = bytes.gread_with(&mut offset, BE)?;
        if magic != TPM_GENERATED_VALUE {
            return Err(MarshalError::BadMagic(magic));
        }
        let attest_type: u16 = bytes.gread_with(&mut offset, BE)?;
        if attest_type != TPM_ST_ATTEST_QUOTE {
            return Err(MarshalError::NotAQuote(attest_type));
        }

        let qualified_signer = read_tpm2b(bytes, &mut offset)?.to_vec();
        let extra_data = read_tpm2b(bytes, &mut offset)?.to_vec();
        let clock_info = ClockInfo {
            clock: bytes.gread_with(&mut offset, BE)?,
            reset_count: bytes.gread_with(&mut offset, BE)?,
            restart_count: bytes.gread_with(&mut offset, BE)?,
            safe: bytes.gread_with::<u8>(&mut offset, BE)? != 0,
        };
        let firmware_version: u64 = bytes.gread_with(&mut offset, BE)?;

        let count: u32 = bytes.gread_with(&mut offset, BE)?;
        let mut pcr_selections = Vec::new();
        for _ in 0..count {
            let hash_alg: u16 = bytes.gread_with(&mut offset, BE)?;
            let size: u8 = bytes.gread_with(&mut offset, BE)?;
            let bitmap: &[u8] = bytes.gread_with(&mut offset, size as usize)?;
            pcr_selections.push(PcrBankSelection {
                hash_alg,
                bitmap: bitmap.to_vec(),
            });
        }
        let pcr_digest = read_tpm2b(bytes, &mut offset)?.to_vec();
        ensure_consumed(bytes, offset)?;

        Ok(Self {
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            pcr_selections,
            pcr_digest,
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_GENERATED_VALUE.to_be_bytes());
        out.extend_from_slice(&TPM_ST_ATTEST_QUOTE.to_be_bytes());
        write_tpm2b(&mut out, &self.qualified_signer);
        write_tpm2b(&mut out, &self.extra_data);
        out.extend_from_slice(&self.clock_info.clock.to_be_bytes());
        out.extend_from_slice(&self.clock_info.reset_count.to_be_bytes());
        out.extend_from_slice(&self.clock_info.restart_count.to_be_bytes());
        out.push(self.clock_info.safe as u8);
        out.extend_from_slice(&self.firmware_version.to_be_bytes());
        out.extend_from_slice(&(self.pcr_selections.len() as u32).to_be_bytes());
        for selection in &self.pcr_selections {
            out.extend_from_slice(&selection.hash_alg.to_be_bytes());
            out.push(selection.bitmap.len() as u8);
            out.extend_from_slice(&selection.bitmap);
        }
        write_tpm2b(&mut out, &self.pcr_digest);
        out
    }

    /// The quoted SHA-256 selection. Quotes covering any other bank, or more
    /// than one bank, are not accepted.
    pub fn sha256_selection(&self) -> Result<PcrSelection, MarshalError> {
        match self.pcr_selections.as_slice() {
            [only] if only.hash_alg == TPM_ALG_SHA256 => PcrSelection::from_bitmap(&only.bitmap)
                .map_err(|e| MarshalError::Unsupported(format!("PCR selection: {e}"))),
            [only] => Err(MarshalError::Unsupported(format!(
                "PCR bank 0x{:04x}",
                only.hash_alg
            ))),
            other => Err(MarshalError::Unsupported(format!(
                "quote over {} PCR banks",
                other.len()
            ))),
        }
    }
}

/// The RSA variant of TPMT_PUBLIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicArea {
    pub name_alg: u16,
    pub object_attributes: u32,
    pub auth_policy: Vec<u8>,
    /// (algorithm, key bits, mode) of the symmetric definition, `None` for TPM_ALG_NULL
    pub symmetric: Option<(u16, u16, u16)>,
    /// (scheme, hash) of the signing scheme, `None` for TPM_ALG_NULL
    pub scheme: Option<(u16, u16)>,
    pub key_bits: u16,
    /// Zero stands for the default exponent 65537
    pub exponent: u32,
    pub modulus: Vec<u8>,
}

impl RsaPublicArea {
    pub fn parse(bytes: &[u8]) -> Result<Self, MarshalError> {
        let mut offset = 0;

        let key_type: u16 = bytes.gread_with(&mut offset, BE)?;
        if key_type != TPM_ALG_RSA {
            return Err(MarshalError::Unsupported(format!(
                "public key type 0x{key_type:04x}"
            )));
        }
        let name_alg: u16 = bytes.gread_with(&mut offset, BE)?;
        let object_attributes: u32 = bytes.gread_with(&mut offset, BE)?;
        let auth_policy = read_tpm2b(bytes, &mut offset)?.to_vec();

        let symmetric = match bytes.gread_with::<u16>(&mut offset, BE)? {
            TPM_ALG_NULL => None,
            alg => Some((
                alg,
                bytes.gread_with(&mut offset, BE)?,
                bytes.gread_with(&mut offset, BE)?,
            )),
        };
        let scheme = match bytes.gread_with::<u16>(&mut offset, BE)? {
            TPM_ALG_NULL => None,
            alg => Some((alg, bytes.gread_with(&mut offset, BE)?)),
        };
        let key_bits: u16 = bytes.gread_with(&mut offset, BE)?;
        let exponent: u32 = bytes.gread_with(&mut offset, BE)?;
        let modulus = read_tpm2b(bytes, &mut offset)?.to_vec();
        ensure_consumed(bytes, offset)?;

        Ok(Self {
            name_alg,
            object_attributes,
            auth_policy,
            symmetric,
            scheme,
            key_bits,
            exponent,
            modulus,
        })
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_ALG_RSA.to_be_bytes());
        out.extend_from_slice(&self.name_alg.to_be_bytes());
        out.extend_from_slice(&self.object_attributes.to_be_bytes());
        write_tpm2b(&mut out, &self.auth_policy);
        match self.symmetric {
            None => out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes()),
            Some((alg, bits, mode)) => {
                out.extend_from_slice(&alg.to_be_bytes());
                out.extend_from_slice(&bits.to_be_bytes());
                out.extend_from_slice(&mode.to_be_bytes());
            }
        }
        match self.scheme {
            None => out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes()),
            Some((scheme, hash)) => {
                out.extend_from_slice(&scheme.to_be_bytes());
                out.extend_from_slice(&hash.to_be_bytes());
            }
        }
        out.extend_from_slice(&self.key_bits.to_be_bytes());
        out.extend_from_slice(&self.exponent.to_be_bytes());
        write_tpm2b(&mut out, &self.modulus);
        out
    }

    /// An attestation key must never leave its TPM and may only sign
    /// TPM-generated structures.
    pub fn is_restricted_signing_key(&self) -> bool {
        let required = OBJECT_FIXED_TPM | OBJECT_RESTRICTED | OBJECT_SIGN_ENCRYPT;
        self.object_attributes & required == required
    }

    pub fn to_rsa_public_key(&self) -> Result<RsaPublicKey, MarshalError> {
        let exponent = match self.exponent {
            0 => RSA_DEFAULT_EXPONENT,
            e => e,
        };
        RsaPublicKey::new(
            BigUint::from_bytes_be(&self.modulus),
            BigUint::from(exponent),
        )
        .map_err(|e| MarshalError::Unsupported(format!("RSA public key: {e}")))
    }
}

/// TPM object name of a marshalled TPMT_PUBLIC: `nameAlg || H(TPMT_PUBLIC)`.
///
/// Only SHA-256 name algorithms are supported.
pub fn object_name(public_area: &[u8]) -> Result<Vec<u8>, MarshalError> {
    let mut offset = 2;
    let name_alg: u16 = public_area.gread_with(&mut offset, BE)?;
    if name_alg != TPM_ALG_SHA256 {
        return Err(MarshalError::Unsupported(format!(
            "name algorithm 0x{name_alg:04x}"
        )));
    }

    let mut name = name_alg.to_be_bytes().to_vec();
    name.extend_from_slice(&Sha256::digest(public_area));
    Ok(name)
}
