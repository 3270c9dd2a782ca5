// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::OpenOptions;
use std::io;

use anyhow::*;
use attestation_agent::config::{config_file_or, Config, DEFAULT_CONFIG_PATH};
use attestation_agent::{host, AttestationAgent};
use clap::Parser;
use env_logger::{Env, Target};
use log::{info, warn};

/// Native messaging host answering the attestation queries of the browser
/// extension over stdin and stdout.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Configuration file for Attestation Agent
    ///
    /// Example:
    /// `--config-file /etc/tpm-attestation.toml`
    #[arg(short, long)]
    config_file: Option<String>,

    /// Arguments the browser appends when it starts the host, such as the
    /// manifest path and the caller origin. Logged only.
    #[arg(hide = true, trailing_var_arg = true, allow_hyphen_values = true)]
    caller: Vec<String>,
}

pub fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match config_file_or(cli.config_file.as_deref(), DEFAULT_CONFIG_PATH) {
        Some(path) => Config::try_from(path).context("load AA config")?,
        None => Config::new()?,
    };

    // stdout carries the protocol, so logs go to a file.
    let mut logger = env_logger::Builder::from_env(Env::new().default_filter_or("info"));
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.host.log_file);
    match log_file {
        std::result::Result::Ok(file) => {
            logger.target(Target::Pipe(Box::new(file)));
            logger.init();
        }
        std::result::Result::Err(e) => {
            logger.target(Target::Stderr);
            logger.init();
            warn!("Cannot open {}, logging to stderr: {e}", config.host.log_file.display());
        }
    }
    info!("Started by {:?}", cli.caller);

    let mut aa = AttestationAgent::with_config(config);
    host::serve(&mut aa, &mut io::stdin().lock(), &mut io::stdout().lock())
}
