// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Decoder for the TCG PC Client crypto-agile binary event log, the format
//! exposed at `/sys/kernel/security/tpm0/binary_bios_measurements`.
//!
//! Only the SHA-256 digest of each event is kept. The decoder fails closed:
//! a log that cannot be fully understood is rejected as a whole.

use std::collections::HashMap;

use log::debug;
use scroll::{Pread, LE};
use strum::{AsRefStr, FromRepr};

use crate::error::EventLogError;
use crate::marshal::{TPM_ALG_SHA1, TPM_ALG_SHA256};
use crate::pcr::{PcrValue, PCR_BANK_SIZE, PCR_DIGEST_SIZE};

pub const TPM_EVENTLOG_FILE_PATH: &str = "/sys/kernel/security/tpm0/binary_bios_measurements";

const SPEC_ID_EVENT_SIGNATURE: &[u8; 16] = b"Spec ID Event03\0";
const SHA1_DIGEST_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, AsRefStr)]
#[repr(u32)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PrebootCert = 0x0000_0000,
    PostCode = 0x0000_0001,
    NoAction = 0x0000_0003,
    Separator = 0x0000_0004,
    Action = 0x0000_0005,
    EventTag = 0x0000_0006,
    SCrtmContents = 0x0000_0007,
    SCrtmVersion = 0x0000_0008,
    CpuMicrocode = 0x0000_0009,
    PlatformConfigFlags = 0x0000_000A,
    TableOfDevices = 0x0000_000B,
    CompactHash = 0x0000_000C,
    Ipl = 0x0000_000D,
    IplPartitionData = 0x0000_000E,
    NonhostCode = 0x0000_000F,
    NonhostConfig = 0x0000_0010,
    NonhostInfo = 0x0000_0011,
    OmitBootDeviceEvents = 0x0000_0012,
    EfiVariableDriverConfig = 0x8000_0001,
    EfiVariableBoot = 0x8000_0002,
    EfiBootServicesApplication = 0x8000_0003,
    EfiBootServicesDriver = 0x8000_0004,
    EfiRuntimeServicesDriver = 0x8000_0005,
    EfiGptEvent = 0x8000_0006,
    EfiAction = 0x8000_0007,
    EfiPlatformFirmwareBlob = 0x8000_0008,
    EfiHandoffTables = 0x8000_0009,
    EfiVariableAuthority = 0x8000_00E0,
}

/// One measurement applied to a PCR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogEntry {
    pub pcr_index: u32,
    pub event_type: u32,
    pub digest: PcrValue,
    /// Informational only, the event data is not covered by any check.
    pub description: String,
}

impl EventLogEntry {
    pub fn new(pcr_index: u32, digest: PcrValue, description: impl Into<String>) -> Self {
        Self {
            pcr_index,
            event_type: EventType::Action as u32,
            digest,
            description: description.into(),
        }
    }
}

fn describe(event_type: u32, data: &[u8]) -> String {
    let name = match EventType::from_repr(event_type) {
        Some(t) => format!("EV_{}", t.as_ref()),
        None => format!("EV_UNKNOWN(0x{event_type:08x})"),
    };

    // Many firmware events carry a short ASCII string, show it when present.
    let text = data.strip_suffix(&[0]).unwrap_or(data);
    if !text.is_empty() && text.len() <= 128 && text.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        format!("{name} {}", String::from_utf8_lossy(text))
    } else {
        name
    }
}

/// Digest sizes declared by the Spec ID Event03 header, keyed by TPM_ALG_ID.
fn parse_spec_id_event(data: &[u8]) -> Result<HashMap<u16, usize>, EventLogError> {
    if data.len() < SPEC_ID_EVENT_SIGNATURE.len()
        || &data[..SPEC_ID_EVENT_SIGNATURE.len()] != SPEC_ID_EVENT_SIGNATURE
    {
        return Err(EventLogError::MissingSpecIdHeader);
    }

    // signature, platformClass, specVersionMinor/Major, specErrata, uintnSize
    let mut offset = SPEC_ID_EVENT_SIGNATURE.len() + 4 + 4;
    let count: u32 = data.gread_with(&mut offset, LE)?;

    let mut sizes = HashMap::new();
    for _ in 0..count {
        let algorithm: u16 = data.gread_with(&mut offset, LE)?;
        let size: u16 = data.gread_with(&mut offset, LE)?;
        sizes.insert(algorithm, size as usize);
    }

    if sizes.get(&TPM_ALG_SHA256) != Some(&PCR_DIGEST_SIZE) {
        return Err(EventLogError::Sha256BankMissing);
    }

    Ok(sizes)
}

/// Decode a crypto-agile event log into the ordered list of SHA-256
/// measurements. `EV_NO_ACTION` events are dropped since the TPM never
/// extends them.
pub fn parse_tcg_eventlog(bytes: &[u8]) -> Result<Vec<EventLogEntry>, EventLogError> {
    let mut offset = 0;

    // The header is a legacy TCG_PCClientPCREvent with a SHA-1 sized digest.
    let _pcr_index: u32 = bytes.gread_with(&mut offset, LE)?;
    let event_type: u32 = bytes.gread_with(&mut offset, LE)?;
    let _digest: &[u8] = bytes.gread_with(&mut offset, SHA1_DIGEST_SIZE)?;
    let size: u32 = bytes.gread_with(&mut offset, LE)?;
    let data: &[u8] = bytes.gread_with(&mut offset, size as usize)?;
    if event_type != EventType::NoAction as u32 {
        return Err(EventLogError::MissingSpecIdHeader);
    }
    let digest_sizes = parse_spec_id_event(data)?;

    let mut entries = Vec::new();
    let mut event = 0usize;
    while offset < bytes.len() {
        event += 1;
        let pcr_index: u32 = bytes.gread_with(&mut offset, LE)?;
        let event_type: u32 = bytes.gread_with(&mut offset, LE)?;
        let count: u32 = bytes.gread_with(&mut offset, LE)?;

        let mut sha256 = None;
        for _ in 0..count {
            let algorithm: u16 = bytes.gread_with(&mut offset, LE)?;
            let size = *digest_sizes
                .get(&algorithm)
                .ok_or(EventLogError::UndeclaredAlgorithm { event, algorithm })?;
            let digest: &[u8] = bytes.gread_with(&mut offset, size)?;
            if algorithm == TPM_ALG_SHA256 {
                sha256 = Some(digest);
            } else if algorithm != TPM_ALG_SHA1 {
                debug!("Event {event}: skipping digest of algorithm 0x{algorithm:04x}");
            }
        }

        let size: u32 = bytes.gread_with(&mut offset, LE)?;
        let data: &[u8] = bytes.gread_with(&mut offset, size as usize)?;

        if event_type == EventType::NoAction as u32 {
            debug!("Event {event}: EV_NO_ACTION is not extended");
            continue;
        }
        if pcr_index as usize >= PCR_BANK_SIZE {
            return Err(EventLogError::PcrIndexOutOfRange {
                event,
                pcr: pcr_index,
            });
        }
        let digest = sha256.ok_or(EventLogError::MissingSha256Digest { event })?;

        let mut value = [0u8; PCR_DIGEST_SIZE];
        value.copy_from_slice(digest);
        entries.push(EventLogEntry {
            pcr_index,
            event_type,
            digest: value,
            description: describe(event_type, data),
        });
    }

    debug!("Decoded {} measurements from event log", entries.len());
    Ok(entries)
}
