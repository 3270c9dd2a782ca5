// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! TPM 2.0 identity attestation.
//!
//! The verifier side (`pcr`, `eventlog`, `credential`, `verifier`) is pure
//! software and runs without a TPM. The attestor side lives in `tpm` behind
//! the `tpm-attester` feature.

pub mod credential;
pub mod error;
pub mod eventlog;
pub mod keys;
pub mod marshal;
pub mod pcr;
pub mod types;
pub mod verifier;

#[cfg(feature = "tpm-attester")]
pub mod tpm;

pub use error::*;
pub use types::*;
