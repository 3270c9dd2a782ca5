// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

use crate::pcr::PCR_BANK_SIZE;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PcrError {
    #[error("PCR index {0} is out of range, the bank holds {PCR_BANK_SIZE} registers")]
    IndexOutOfRange(u32),

    #[error("PCR selection is empty")]
    EmptySelection,
}

/// Errors raised while decoding a TCG binary event log. Any of them rejects
/// the whole log.
#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("event log is truncated: {0}")]
    Truncated(#[from] scroll::Error),

    #[error("event log does not start with a Spec ID Event03 header")]
    MissingSpecIdHeader,

    #[error("event log header does not declare a SHA-256 bank")]
    Sha256BankMissing,

    #[error("event {event}: digest algorithm 0x{algorithm:04x} is not declared in the log header")]
    UndeclaredAlgorithm { event: usize, algorithm: u16 },

    #[error("event {event}: no SHA-256 digest")]
    MissingSha256Digest { event: usize },

    #[error("event {event}: PCR index {pcr} is out of range")]
    PcrIndexOutOfRange { event: usize, pcr: u32 },
}

/// Errors raised while decoding TPM wire structures (TPMS_ATTEST, TPMT_PUBLIC).
#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("structure is truncated: {0}")]
    Truncated(#[from] scroll::Error),

    #[error("magic 0x{0:08x} is not TPM_GENERATED_VALUE")]
    BadMagic(u32),

    #[error("attestation type 0x{0:04x} is not TPM_ST_ATTEST_QUOTE")]
    NotAQuote(u16),

    #[error("{0} trailing bytes after structure")]
    TrailingBytes(usize),

    #[error("unsupported {0}")]
    Unsupported(String),
}

/// The outcome of a failed quote check.
///
/// The first four variants follow the order in which the verifier runs the
/// checks. Each variant maps to a stable reason string through `reason()`.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("malformed attestation: {0}")]
    MalformedAttestation(String),

    #[error("nonce mismatch: got 0x{got}, expected 0x{expected}")]
    NonceMismatch { expected: String, got: String },

    #[error("PCR digest mismatch: {0}")]
    PcrDigestMismatch(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The predicted measurements cannot be replayed. Raised by the
    /// verifier's own input, never by the quote.
    #[error("malformed prediction: {0}")]
    MalformedPrediction(String),
}

impl VerifyError {
    pub fn reason(&self) -> &'static str {
        match self {
            VerifyError::MalformedAttestation(_) => "malformed attestation",
            VerifyError::NonceMismatch { .. } => "nonce mismatch",
            VerifyError::PcrDigestMismatch(_) => "PCR digest mismatch",
            VerifyError::InvalidSignature(_) => "invalid signature",
            VerifyError::MalformedPrediction(_) => "malformed prediction",
        }
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("malformed credential challenge: {0}")]
    MalformedChallenge(String),

    #[error("attestation key is not a fixed, restricted signing key")]
    UnsuitableAttestationKey,

    #[error("credential activation failed: {0}")]
    ActivationFailed(String),

    #[error("returned secret does not match the issued challenge")]
    SecretMismatch,

    #[error("crypto backend failure: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("failed to decode PEM material: {0}")]
    Pem(String),

    #[error("key is not an RSA key")]
    NotRsa,

    #[error("failed to convert RSA key: {0}")]
    Encoding(String),
}

impl From<openssl::error::ErrorStack> for KeyError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        KeyError::Pem(e.to_string())
    }
}
