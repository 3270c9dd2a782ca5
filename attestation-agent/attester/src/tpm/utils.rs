// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//
use anyhow::*;
use rsa as rust_rsa;
use std::str::FromStr;
use tss_esapi::abstraction::public::DecodedKey;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::structures::{
    pcr_selection_list::PcrSelectionListBuilder, pcr_slot::PcrSlot, PcrSelectionList, Public,
};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};

use crate::types::PcrSelection;

/// PCR index to the TPMS_PCR_SELECTION bit of that register.
fn pcr_slot(index: u32) -> Result<PcrSlot> {
    PcrSlot::try_from(1u32 << index).map_err(|e| anyhow!("PCR {index} has no slot: {e}"))
}

/// `TEST_TCTI` wins over the configured TCTI, the kernel resource manager
/// device is the fallback.
pub fn create_tcti(configured: Option<&str>) -> Result<TctiNameConf> {
    let tcti = match std::env::var("TEST_TCTI") {
        std::result::Result::Ok(tctistr) => Some(tctistr),
        std::result::Result::Err(_) => configured.map(str::to_string),
    };

    match tcti {
        None => Ok(TctiNameConf::Device(DeviceConfig::default())),
        Some(tctistr) => TctiNameConf::from_str(&tctistr)
            .with_context(|| format!("Invalid TCTI configuration `{tctistr}`")),
    }
}

pub fn create_pcr_selection_list(selection: &PcrSelection) -> Result<PcrSelectionList> {
    let slots = selection
        .indices()
        .iter()
        .map(|index| pcr_slot(*index))
        .collect::<Result<Vec<_>>>()?;

    PcrSelectionListBuilder::new()
        .with_selection(HashingAlgorithm::Sha256, &slots)
        .build()
        .context("Build PCR selection list failed")
}

pub fn public_to_rsa(public: Public) -> Result<rust_rsa::RsaPublicKey> {
    let decoded_key: DecodedKey = public.try_into()?;
    let DecodedKey::RsaPublicKey(rsa_pk) = decoded_key else {
        bail!("unexpected key type");
    };

    let bytes = rsa_pk.modulus.as_unsigned_bytes_be();
    let n = rust_rsa::BigUint::from_bytes_be(bytes);
    let bytes = rsa_pk.public_exponent.as_unsigned_bytes_be();
    let e = rust_rsa::BigUint::from_bytes_be(bytes);

    let pkey = rust_rsa::RsaPublicKey::new(n, e)?;
    Ok(pkey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_selection_list_uses_sha256_bank() {
        let selection = PcrSelection::new([0, 7, 23]).unwrap();
        let list = create_pcr_selection_list(&selection).unwrap();
        let banks = list.get_selections();
        assert_eq!(banks.len(), 1);
        assert_eq!(banks[0].hashing_algorithm(), HashingAlgorithm::Sha256);
        assert_eq!(
            banks[0].selected(),
            vec![PcrSlot::Slot0, PcrSlot::Slot7, PcrSlot::Slot23]
        );
    }

    #[test]
    fn test_create_tcti_from_config() {
        if std::env::var("TEST_TCTI").is_ok() {
            return;
        }
        assert!(matches!(create_tcti(None).unwrap(), TctiNameConf::Device(_)));
        assert!(matches!(
            create_tcti(Some("mssim:host=localhost,port=2321")).unwrap(),
            TctiNameConf::Mssim(_)
        ));
        assert!(create_tcti(Some("carrier-pigeon")).is_err());
    }
}
