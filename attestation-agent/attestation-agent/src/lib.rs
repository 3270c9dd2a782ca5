// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::{bail, Result};
use attester::keys::{read_rsa_public_key, rsa_public_key_to_pem};
use attester::tpm::TpmDevice;
use attester::{Nonce, PcrSelection, TpmQuote, Verdict};
use log::{debug, error, info, warn};

pub mod config;
pub mod host;
pub mod provision;
pub mod quote;

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::host::{IncomingMessage, OutgoingMessage, Query};

/// Attestation Agent (AA for short) answers the attestation queries of a
/// browser extension on behalf of the local TPM. It provides
/// - `get_ak_pub`: the AK public key the verifier trusted at provisioning.
/// - `get_tpm_quote`: a fresh nonce and a TPM quote over it.
/// - `verify_tpm_quote`: whether a quote is genuine and fresh, and whether the
/// quoted PCRs match the CI/CD prediction.
///
/// # Example
///
/// ```no_run
/// use attestation_agent::AttestationAgent;
///
/// // initialize with the default config
/// let mut aa = AttestationAgent::new(None).unwrap();
///
/// let selection = aa.config.quote_pcrs.clone();
/// let (_nonce, _quote) = aa.get_tpm_quote(&selection).unwrap();
/// ```
pub struct AttestationAgent {
    pub config: Config,
    device: Option<TpmDevice>,
}

impl AttestationAgent {
    /// Create a new instance of [AttestationAgent]. Without `config_path` the
    /// config at [`DEFAULT_CONFIG_PATH`] is used when present. The TPM is
    /// opened on first use.
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let config = match crate::config::config_file_or(config_path, DEFAULT_CONFIG_PATH) {
            Some(config_path) => {
                info!("Using AA config file: {config_path}");
                Config::try_from(config_path)?
            }
            None => {
                warn!("No AA config file specified. Using a default configuration.");
                Config::new()?
            }
        };

        Ok(Self::with_config(config))
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            device: None,
        }
    }

    pub fn device(&mut self) -> Result<&mut TpmDevice> {
        if self.device.is_none() {
            self.device = Some(TpmDevice::open(&self.config.tpm)?);
        }
        match self.device.as_mut() {
            Some(device) => Ok(device),
            None => bail!("TPM device is not open"),
        }
    }

    /// PEM of the AK public key trusted at provisioning.
    pub fn get_ak_pub(&self) -> Result<String> {
        let storage = &self.config.storage;
        let ak_public = read_rsa_public_key(&storage.resolve(&storage.verifier_ak))?;
        Ok(rsa_public_key_to_pem(&ak_public)?)
    }

    pub fn get_tpm_quote(&mut self, selection: &PcrSelection) -> Result<(Nonce, TpmQuote)> {
        let nonce = quote::issue_nonce(&self.config.storage)?;
        let storage = self.config.storage.clone();
        let quote = quote::produce_quote(self.device()?, &storage, selection, &nonce)?;
        Ok((nonce, quote))
    }

    pub fn verify_tpm_quote(
        &self,
        selection: &PcrSelection,
        nonce: &Nonce,
        quote: TpmQuote,
        ak_pub: &str,
    ) -> Verdict {
        quote::check_quote(&self.config.storage, selection, nonce, quote, ak_pub)
    }

    /// Answer one decoded message. Failures are reported in the response.
    pub fn handle_message(&mut self, message: IncomingMessage) -> OutgoingMessage {
        let query = message.query;
        let selection = match message.pcrs {
            Some(pcrs) => match PcrSelection::new(pcrs) {
                Ok(selection) => selection,
                Err(e) => {
                    warn!("Bad PCR selection: {e}");
                    return OutgoingMessage::rejected(Some(query), format!("malformed message: {e}"));
                }
            },
            None => self.config.quote_pcrs.clone(),
        };

        match query {
            Query::GetAkPub => match self.get_ak_pub() {
                Ok(ak_pub) => OutgoingMessage {
                    ak_pub: Some(ak_pub),
                    ..OutgoingMessage::new(query)
                },
                Err(e) => {
                    error!("get-ak-pub failed: {e:#}");
                    OutgoingMessage::rejected(Some(query), "AK public key is not available")
                }
            },
            Query::GetTpmQuote => match self.get_tpm_quote(&selection) {
                Ok((nonce, quote)) => OutgoingMessage::new(query).with_quote(nonce, quote),
                Err(e) => {
                    error!("get-tpm-quote failed: {e:#}");
                    OutgoingMessage::rejected(Some(query), "TPM quote failed")
                }
            },
            Query::VerifyTpmQuote => {
                let (Some(nonce), Some(attestation), Some(signature), Some(ak_pub)) = (
                    message.nonce,
                    message.attestation,
                    message.signature,
                    message.ak_pub,
                ) else {
                    return OutgoingMessage::rejected(
                        Some(query),
                        "malformed message: verify-tpm-quote needs nonce, attestation, signature and ak-pub",
                    );
                };

                let quote = TpmQuote {
                    attestation,
                    signature,
                };
                let verdict = self.verify_tpm_quote(&selection, &nonce, quote, &ak_pub);
                OutgoingMessage {
                    is_legit: verdict.is_legit,
                    message: verdict.message,
                    ..OutgoingMessage::new(query)
                }
            }
        }
    }

    /// Decode and answer one native messaging payload.
    pub fn handle_frame(&mut self, payload: &[u8]) -> OutgoingMessage {
        match serde_json::from_slice::<IncomingMessage>(payload) {
            Ok(message) => {
                debug!("Query {:?}", message.query);
                self.handle_message(message)
            }
            Err(e) => {
                warn!("Undecodable message: {e}");
                OutgoingMessage::rejected(None, "malformed message")
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use attester::keys::write_rsa_public_key;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use rstest::rstest;

    use super::*;
    use crate::config::StorageConfig;
    use crate::host::{read_frame, serve, write_frame};

    fn agent(storage: StorageConfig) -> AttestationAgent {
        let mut config = Config::new().unwrap();
        config.storage = storage;
        AttestationAgent::with_config(config)
    }

    fn verify_request(nonce: &Nonce, quote: &TpmQuote, ak_pub: &str, pcrs: &[u32]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "query": "verify-tpm-quote",
            "nonce": nonce,
            "attestation": STANDARD.encode(&quote.attestation),
            "signature": STANDARD.encode(&quote.signature),
            "ak-pub": ak_pub,
            "pcrs": pcrs,
        }))
        .unwrap()
    }

    #[test]
    fn test_get_ak_pub() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::under(dir.path());
        let (_, ak_public) = fixtures::store_ak_blob(&storage);
        write_rsa_public_key(&storage.resolve(&storage.verifier_ak), &ak_public).unwrap();

        let response = agent(storage).handle_frame(br#"{"query":"get-ak-pub"}"#);
        assert_eq!(response.query, Some(Query::GetAkPub));
        let pem = response.ak_pub.unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(
            attester::keys::rsa_public_key_from_pem(pem.as_bytes()).unwrap(),
            ak_public
        );
    }

    #[test]
    fn test_get_ak_pub_before_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let response = agent(StorageConfig::under(dir.path())).handle_frame(br#"{"query":"get-ak-pub"}"#);
        assert_eq!(response.ak_pub, None);
        assert!(!response.is_legit);
        assert_eq!(response.message, "AK public key is not available");
    }

    #[test]
    fn test_verify_tpm_quote() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(fixtures::storage_with_prediction(dir.path()));
        let ak = fixtures::ak();
        let nonce = quote::issue_nonce(&agent.config.storage).unwrap();
        let selection = PcrSelection::new([0, 1, 7]).unwrap();
        let quote = fixtures::signed_quote(&ak, &nonce, &selection);

        let response =
            agent.handle_frame(&verify_request(&nonce, &quote, &fixtures::ak_pem(&ak), &[0, 1, 7]));
        assert_eq!(response.query, Some(Query::VerifyTpmQuote));
        assert!(response.is_legit);
        assert_eq!(response.message, "the quote is legit");
    }

    #[test]
    fn test_verify_tpm_quote_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(fixtures::storage_with_prediction(dir.path()));
        let ak = fixtures::ak();
        let nonce = quote::issue_nonce(&agent.config.storage).unwrap();
        let selection = PcrSelection::new([0]).unwrap();
        let quote = fixtures::signed_quote(&ak, &nonce, &selection);
        let request = verify_request(&nonce, &quote, &fixtures::ak_pem(&ak), &[0]);

        assert!(agent.handle_frame(&request).is_legit);
        let replayed = agent.handle_frame(&request);
        assert!(!replayed.is_legit);
        assert_eq!(replayed.message, "nonce mismatch");
    }

    #[test]
    fn test_verify_tpm_quote_with_unissued_nonce() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(fixtures::storage_with_prediction(dir.path()));
        let ak = fixtures::ak();
        let nonce = Nonce::from([0x24; 32]);
        let quote = fixtures::signed_quote(&ak, &nonce, &PcrSelection::new([0]).unwrap());

        let response =
            agent.handle_frame(&verify_request(&nonce, &quote, &fixtures::ak_pem(&ak), &[0]));
        assert!(!response.is_legit);
        assert_eq!(response.message, "nonce mismatch");
    }

    #[rstest]
    #[case(&[0, 1], "PCR digest mismatch")]
    #[case(&[0, 1, 7, 8], "PCR digest mismatch")]
    fn test_verify_tpm_quote_with_other_selection(#[case] pcrs: &[u32], #[case] reason: &str) {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(fixtures::storage_with_prediction(dir.path()));
        let ak = fixtures::ak();
        let nonce = quote::issue_nonce(&agent.config.storage).unwrap();
        let quote = fixtures::signed_quote(&ak, &nonce, &PcrSelection::new([0, 1, 7]).unwrap());

        let response = agent.handle_frame(&verify_request(&nonce, &quote, &fixtures::ak_pem(&ak), pcrs));
        assert!(!response.is_legit);
        assert_eq!(response.message, reason);
    }

    #[test]
    fn test_verify_tpm_quote_signed_by_other_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(fixtures::storage_with_prediction(dir.path()));
        let nonce = quote::issue_nonce(&agent.config.storage).unwrap();
        let selection = PcrSelection::new([0]).unwrap();
        let quote = fixtures::signed_quote(&fixtures::ak(), &nonce, &selection);

        let response = agent.handle_frame(&verify_request(
            &nonce,
            &quote,
            &fixtures::ak_pem(&fixtures::ak()),
            &[0],
        ));
        assert!(!response.is_legit);
        assert_eq!(response.message, "invalid signature");
    }

    #[rstest]
    #[case(br#"{"query":"verify-tpm-quote"}"#.as_slice(), Some(Query::VerifyTpmQuote))]
    #[case(br#"{"query":"get-ak-pub","pcrs":[24]}"#.as_slice(), Some(Query::GetAkPub))]
    #[case(br#"{"query":"format-disk"}"#.as_slice(), None)]
    #[case(b"not json".as_slice(), None)]
    fn test_malformed_messages(#[case] payload: &[u8], #[case] query: Option<Query>) {
        let dir = tempfile::tempdir().unwrap();
        let response = agent(StorageConfig::under(dir.path())).handle_frame(payload);
        assert_eq!(response.query, query);
        assert!(!response.is_legit);
        assert!(response.message.starts_with("malformed message"));
    }

    #[test]
    fn test_serve_answers_each_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(StorageConfig::under(dir.path()));

        let mut input = Vec::new();
        write_frame(&mut input, &vec![b' '; 8193]).unwrap();
        write_frame(&mut input, b"{}").unwrap();
        write_frame(&mut input, br#"{"query":"get-ak-pub"}"#).unwrap();
        let mut output = Vec::new();
        serve(&mut agent, &mut Cursor::new(input), &mut output).unwrap();

        let mut output = Cursor::new(output);
        let mut responses = Vec::new();
        while let Some(frame) = read_frame(&mut output, 8192).unwrap() {
            responses.push(serde_json::from_slice::<OutgoingMessage>(&frame).unwrap());
        }
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].message, "malformed message");
        assert_eq!(responses[1].message, "malformed message");
        assert_eq!(responses[2].query, Some(Query::GetAkPub));
    }
}
