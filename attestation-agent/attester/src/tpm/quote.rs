// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::*;
use log::info;
use rsa::RsaPublicKey;
use tss_esapi::structures::{AttestInfo, Data, Signature, SignatureScheme};
use tss_esapi::traits::Marshall;

use super::utils::create_pcr_selection_list;
use super::{AttestationKey, TpmDevice};
use crate::types::{Nonce, PcrSelection, TpmQuote};

/// TPM2_Quote over the SHA-256 bank with the verifier's nonce as qualifying
/// data. The AK's own scheme (RSASSA/SHA-256) signs the quote.
pub fn perform_quote(
    device: &mut TpmDevice,
    ek_public: &RsaPublicKey,
    attest_key: &AttestationKey,
    selection: &PcrSelection,
    nonce: &Nonce,
) -> Result<TpmQuote> {
    let mut ek = device.load_ek(ek_public)?;
    let mut ak = ek.load_ak(attest_key)?;
    let ak_handle = ak.handle();

    let selection_list = create_pcr_selection_list(selection)?;
    let qualifying_data = Data::try_from(nonce.as_bytes().to_vec())?;

    let (attest, signature) = ak
        .context()
        .execute_with_nullauth_session(|ctx| {
            ctx.quote(
                ak_handle,
                qualifying_data,
                SignatureScheme::Null,
                selection_list,
            )
        })
        .context("Call TPM Quote API failed")?;

    let AttestInfo::Quote { .. } = attest.attested() else {
        bail!("Get Quote failed");
    };
    let Signature::RsaSsa(rsa_sig) = signature else {
        bail!("Wrong Signature");
    };
    info!("Quoted PCRs {:?}", selection.indices());

    Ok(TpmQuote {
        attestation: attest.marshall()?,
        signature: rsa_sig.signature().to_vec(),
    })
}
