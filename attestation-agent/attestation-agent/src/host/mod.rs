// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Browser native messaging: each message is a 4-byte length in native byte
//! order followed by that many bytes of JSON.
//!
//! `nonce`, `attestation` and `signature` travel as base64 strings. Extensions
//! that send them as JSON arrays of byte values are not understood: such a
//! request is answered as a malformed message.

use std::io::{self, Read, Write};

use anyhow::Result;
use attester::{Nonce, TpmQuote};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as, skip_serializing_none};
use thiserror::Error;

use crate::AttestationAgent;

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("frame of {size} bytes exceeds the {capacity} byte buffer")]
    Oversize { size: usize, capacity: usize },

    #[error("stream closed in the middle of a frame")]
    Truncated,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read one frame. `Ok(None)` means the peer closed the stream between
/// frames. An oversize payload is consumed before the error is returned so
/// the next frame starts at the right offset.
pub fn read_frame<R: Read>(reader: &mut R, capacity: usize) -> Result<Option<Vec<u8>>, FramingError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(FramingError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let size = u32::from_ne_bytes(header) as usize;
    if size > capacity {
        let drained = io::copy(&mut reader.by_ref().take(size as u64), &mut io::sink())?;
        if drained < size as u64 {
            return Err(FramingError::Truncated);
        }
        return Err(FramingError::Oversize { size, capacity });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FramingError::Truncated,
        _ => FramingError::Io(e),
    })?;
    Ok(Some(payload))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError> {
    writer.write_all(&(payload.len() as u32).to_ne_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Query {
    GetAkPub,
    GetTpmQuote,
    VerifyTpmQuote,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct IncomingMessage {
    pub query: Query,

    #[serde(default)]
    pub nonce: Option<Nonce>,

    /// Marshalled TPMS_ATTEST
    #[serde_as(as = "Option<Base64>")]
    #[serde(default)]
    pub attestation: Option<Vec<u8>>,

    #[serde_as(as = "Option<Base64>")]
    #[serde(default)]
    pub signature: Option<Vec<u8>>,

    /// PEM encoded AK public key
    #[serde(default)]
    pub ak_pub: Option<String>,

    #[serde(default)]
    pub pcrs: Option<Vec<u32>>,
}

#[skip_serializing_none]
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct OutgoingMessage {
    pub query: Option<Query>,

    pub nonce: Option<Nonce>,

    #[serde_as(as = "Option<Base64>")]
    pub attestation: Option<Vec<u8>>,

    #[serde_as(as = "Option<Base64>")]
    pub signature: Option<Vec<u8>>,

    pub ak_pub: Option<String>,

    pub is_legit: bool,

    pub message: String,
}

impl OutgoingMessage {
    pub fn new(query: Query) -> Self {
        Self {
            query: Some(query),
            ..Default::default()
        }
    }

    pub fn rejected(query: Option<Query>, message: impl Into<String>) -> Self {
        Self {
            query,
            is_legit: false,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_quote(mut self, nonce: Nonce, quote: TpmQuote) -> Self {
        self.nonce = Some(nonce);
        self.attestation = Some(quote.attestation);
        self.signature = Some(quote.signature);
        self
    }
}

/// Answer frames from `reader` until the peer closes the stream.
pub fn serve<R: Read, W: Write>(
    agent: &mut AttestationAgent,
    reader: &mut R,
    writer: &mut W,
) -> Result<()> {
    let capacity = agent.config.host.buffer_size;
    info!("Native messaging host started, buffer size {capacity} bytes");

    loop {
        let response = match read_frame(reader, capacity) {
            Ok(Some(payload)) => {
                debug!("Message of {} bytes received", payload.len());
                agent.handle_frame(&payload)
            }
            Ok(None) => break,
            Err(e @ FramingError::Oversize { .. }) => {
                warn!("{e}");
                OutgoingMessage::rejected(None, "malformed message")
            }
            Err(FramingError::Truncated) => {
                error!("Input closed in the middle of a message");
                break;
            }
            Err(FramingError::Io(e)) => return Err(e.into()),
        };

        write_frame(writer, &serde_json::to_vec(&response)?)?;
    }

    info!("Input closed, native messaging host exits");
    Ok(())
}
