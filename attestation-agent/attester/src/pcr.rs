// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Software replay of the SHA-256 PCR bank.
//!
//! Registers start at zero and are extended as `SHA-256(old || digest)`,
//! exactly like TPM2_PCR_Extend. The bank size is fixed to 24 registers,
//! devices exposing a different number of PCRs are not supported.

use log::debug;
use sha2::{Digest, Sha256};

use crate::error::PcrError;
use crate::eventlog::EventLogEntry;
use crate::types::PcrSelection;

pub const PCR_BANK_SIZE: usize = 24;
pub const PCR_DIGEST_SIZE: usize = 32;

pub type PcrValue = [u8; PCR_DIGEST_SIZE];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcrBank {
    registers: [PcrValue; PCR_BANK_SIZE],
}

impl Default for PcrBank {
    fn default() -> Self {
        Self::new()
    }
}

impl PcrBank {
    pub fn new() -> Self {
        Self {
            registers: [[0u8; PCR_DIGEST_SIZE]; PCR_BANK_SIZE],
        }
    }

    pub fn get(&self, index: u32) -> Result<&PcrValue, PcrError> {
        self.registers
            .get(index as usize)
            .ok_or(PcrError::IndexOutOfRange(index))
    }

    pub fn extend(&mut self, index: u32, digest: &PcrValue) -> Result<(), PcrError> {
        let register = self
            .registers
            .get_mut(index as usize)
            .ok_or(PcrError::IndexOutOfRange(index))?;

        let extended: PcrValue = Sha256::new()
            .chain_update(&register[..])
            .chain_update(digest)
            .finalize()
            .into();
        debug!(
            "PCR[{index:2}]+0x{} => 0x{}",
            hex::encode(digest),
            hex::encode(extended)
        );
        *register = extended;

        Ok(())
    }

    /// Replay the entries in log order. The first bad entry aborts the replay.
    pub fn replay(entries: &[EventLogEntry]) -> Result<Self, PcrError> {
        let mut bank = Self::new();
        for entry in entries {
            bank.extend(entry.pcr_index, &entry.digest)?;
        }
        Ok(bank)
    }

    /// SHA-256 over the selected registers concatenated in ascending index
    /// order, the value a TPM2_Quote reports as `pcrDigest`.
    pub fn composite_digest(&self, selection: &PcrSelection) -> Result<PcrValue, PcrError> {
        let mut hasher = Sha256::new();
        for index in selection.indices() {
            hasher.update(self.get(*index)?);
        }
        Ok(hasher.finalize().into())
    }
}

/// Replay `entries` and fold the selected registers into the expected quote
/// digest.
pub fn predict_composite_digest(
    entries: &[EventLogEntry],
    selection: &PcrSelection,
) -> Result<PcrValue, PcrError> {
    PcrBank::replay(entries)?.composite_digest(selection)
}
