// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::{Path, PathBuf};

use anyhow::Result;
use attester::eventlog::TPM_EVENTLOG_FILE_PATH;
use attester::tpm::TpmConfig;
use attester::PcrSelection;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tpm-attestation.toml";
pub const DEFAULT_STORAGE_ROOT: &str = "/var/lib/tpm-attestation";
pub const DEFAULT_HOST_LOG_FILE: &str = "/tmp/tpm-attest-host.log";

/// Native messaging caps a message sent to the host at this size.
pub const DEFAULT_BUFFER_SIZE: u64 = 8192;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// How to reach the TPM
    #[serde(default)]
    pub tpm: TpmConfig,

    /// Where each role keeps its material
    #[serde(default)]
    pub storage: StorageConfig,

    /// configs about the native messaging host
    #[serde(default)]
    pub host: HostConfig,

    /// PCRs to quote when a request carries no selection
    #[serde(default)]
    pub quote_pcrs: PcrSelection,
}

/// File locations of the four roles. Relative paths are resolved against
/// `root`, absolute ones are used as they are.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,

    /// Platform event log copied into the CI/CD prediction at provisioning
    pub eventlog_source: PathBuf,

    /// CI/CD: event log the quotes are checked against
    pub cicd_prediction: PathBuf,

    /// Manufacturer: EK public key recorded at manufacturing
    pub manufacturer_ek: PathBuf,

    /// Attestor: EK public key read from the TPM
    pub attestor_ek: PathBuf,
    /// Attestor: TPM wrapped AK blob
    pub attestor_ak: PathBuf,
    /// Attestor: secret recovered by credential activation
    pub attestor_attempt: PathBuf,
    pub quote_attestation: PathBuf,
    pub quote_signature: PathBuf,

    /// Verifier: EK public key checked against the manufacturer record
    pub verifier_ek: PathBuf,
    /// Verifier: credential challenge sent to the attestor
    pub verifier_credential: PathBuf,
    /// Verifier: AK public key trusted after credential activation
    pub verifier_ak: PathBuf,
    /// Verifier: nonce issued for the last quote
    pub quote_nonce: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            eventlog_source: PathBuf::from(TPM_EVENTLOG_FILE_PATH),
            cicd_prediction: PathBuf::from("CICD/cicd-prediction.bin"),
            manufacturer_ek: PathBuf::from("Manufacturer/ek.pub"),
            attestor_ek: PathBuf::from("Attestor/ek.pub"),
            attestor_ak: PathBuf::from("Attestor/ak.json"),
            attestor_attempt: PathBuf::from("Attestor/attempt.bin"),
            quote_attestation: PathBuf::from("Attestor/quote-attest.bin"),
            quote_signature: PathBuf::from("Attestor/quote-signature.bin"),
            verifier_ek: PathBuf::from("Verifier/ek.pub"),
            verifier_credential: PathBuf::from("Verifier/credential.json"),
            verifier_ak: PathBuf::from("Verifier/ak.pub"),
            quote_nonce: PathBuf::from("Verifier/nonce-quote.bin"),
        }
    }
}

impl StorageConfig {
    /// All roles rooted in `root`, with the default file names.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Largest accepted message, larger frames are answered as malformed
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// stdout carries the protocol, so the host logs here
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE as usize
}

fn default_log_file() -> PathBuf {
    PathBuf::from(DEFAULT_HOST_LOG_FILE)
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tpm: TpmConfig::default(),
            storage: StorageConfig::default(),
            host: HostConfig::default(),
            quote_pcrs: PcrSelection::default(),
        })
    }
}

/// The config file to load: `config_path` when given, else `fallback` when
/// that file exists.
pub fn config_file_or<'a>(config_path: Option<&'a str>, fallback: &'a str) -> Option<&'a str> {
    config_path.or_else(|| Path::new(fallback).exists().then_some(fallback))
}

impl TryFrom<&str> for Config {
    type Error = config::ConfigError;
    fn try_from(config_path: &str) -> Result<Self, Self::Error> {
        let c = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .set_default("host.buffer_size", DEFAULT_BUFFER_SIZE)?
            .set_default("host.log_file", DEFAULT_HOST_LOG_FILE)?
            .build()?;

        let cfg = c.try_deserialize()?;
        Ok(cfg)
    }
}
