// Copyright (c) 2025 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::*;
use attestation_agent::{provision, quote, AttestationAgent};
use attester::PcrSelection;
use clap::{Parser, Subcommand};
use log::info;

/// Provisioning and verification rounds of TPM identity attestation, played
/// out locally by every role.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Configuration file for Attestation Agent
    ///
    /// Example:
    /// `--config-file /etc/tpm-attestation.toml`
    #[arg(short, long)]
    config_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record the EK, create the AK and prove it with credential activation
    Init,

    /// Issue a nonce and quote the PCRs over it with the AK
    Quote {
        /// PCR indices of the SHA-256 bank, the configured ones when empty
        #[arg(short, long, value_delimiter = ',')]
        pcrs: Vec<u32>,
    },

    /// Verify the last quote against the CI/CD prediction
    Verify {
        /// PCR indices of the SHA-256 bank, the configured ones when empty
        #[arg(short, long, value_delimiter = ',')]
        pcrs: Vec<u32>,
    },
}

fn selection(aa: &AttestationAgent, pcrs: Vec<u32>) -> Result<PcrSelection> {
    if pcrs.is_empty() {
        return Ok(aa.config.quote_pcrs.clone());
    }
    Ok(PcrSelection::new(pcrs)?)
}

pub fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    let mut aa = AttestationAgent::new(cli.config_file.as_deref()).context("start AA")?;

    match cli.command {
        Command::Init => {
            let storage = aa.config.storage.clone();
            provision::run_init(aa.device()?, &storage)?;
            info!("Provisioning complete");
        }
        Command::Quote { pcrs } => {
            let selection = selection(&aa, pcrs)?;
            let (nonce, _) = aa.get_tpm_quote(&selection)?;
            info!("Quote stored, nonce {nonce:?}");
        }
        Command::Verify { pcrs } => {
            let selection = selection(&aa, pcrs)?;
            let (nonce, tpm_quote) = quote::load_round(&aa.config.storage)?;
            let ak_pub = aa.get_ak_pub()?;
            let verdict = aa.verify_tpm_quote(&selection, &nonce, tpm_quote, &ak_pub);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            if !verdict.is_legit {
                bail!("quote rejected: {}", verdict.message);
            }
        }
    }

    Ok(())
}
