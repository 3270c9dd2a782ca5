// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Attestor half of the credential activation protocol.

use anyhow::*;
use log::info;
use rsa::RsaPublicKey;
use tss_esapi::constants::SessionType;
use tss_esapi::handles::AuthHandle;
use tss_esapi::interface_types::session_handles::PolicySession;
use tss_esapi::structures::{EncryptedSecret, IdObject};

use super::{AttestationKey, ScopedHandle, TpmDevice};
use crate::credential::CredentialChallenge;
use crate::error::CredentialError;

/// Recover the secret of `challenge` with TPM2_ActivateCredential.
///
/// The EK is only usable through a policy session that satisfied
/// PolicySecret(TPM_RH_ENDORSEMENT), the AK through a password session.
/// Unwrap failures come back as [`CredentialError::ActivationFailed`].
pub fn activate_credential(
    device: &mut TpmDevice,
    ek_public: &RsaPublicKey,
    attest_key: &AttestationKey,
    challenge: &CredentialChallenge,
) -> Result<Vec<u8>> {
    let id_object = IdObject::try_from(challenge.credential_blob.clone())
        .map_err(|e| CredentialError::MalformedChallenge(format!("credential blob: {e}")))?;
    let encrypted_secret = EncryptedSecret::try_from(challenge.encrypted_secret.clone())
        .map_err(|e| CredentialError::MalformedChallenge(format!("encrypted secret: {e}")))?;

    let mut ek = device.load_ek(ek_public)?;
    let ek_handle = ek.handle();
    let mut ak = ek.load_ak(attest_key)?;
    let ak_handle = ak.handle();

    let mut session = ScopedHandle::start_session(ak.context(), SessionType::Hmac)?;
    let session_handle = session.handle();
    let mut policy = ScopedHandle::start_session(session.context(), SessionType::Policy)?;
    let policy_handle = policy.handle();

    let context = policy.context();
    context
        .execute_with_nullauth_session(|ctx| {
            ctx.policy_secret(
                PolicySession::try_from(policy_handle)?,
                AuthHandle::Endorsement,
                Default::default(),
                Default::default(),
                Default::default(),
                None,
            )
        })
        .context("PolicySecret on the endorsement hierarchy failed")?;

    let secret = context
        .execute_with_sessions((Some(session_handle), Some(policy_handle), None), |ctx| {
            ctx.activate_credential(ak_handle, ek_handle, id_object, encrypted_secret)
        })
        .map_err(|e| CredentialError::ActivationFailed(e.to_string()))?;
    info!("Credential activated");

    Ok(secret.value().to_vec())
}
