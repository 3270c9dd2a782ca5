// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

//! Key hierarchy on a TPM 2.0 device.
//!
//! Every object loaded into the TPM is owned by a [`ScopedHandle`], which
//! borrows the device context and flushes the object when dropped. Children
//! borrow their parent's guard, so they are always flushed first.

use anyhow::*;
use log::{debug, info, warn};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tss_esapi::abstraction::{
    ak::{create_ak, load_ak},
    ek::{create_ek_object, retrieve_ek_pubcert},
    AsymmetricAlgorithmSelection, DefaultKey,
};
use tss_esapi::attributes::SessionAttributesBuilder;
use tss_esapi::constants::{CapabilityType, SessionType};
use tss_esapi::handles::{KeyHandle, ObjectHandle, SessionHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{
    AsymmetricAlgorithm, HashingAlgorithm, SignatureSchemeAlgorithm,
};
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{CapabilityData, Private, Public, SymmetricDefinition};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::Context as TssContext;

use crate::keys::certificate_der_to_pem;
use crate::types::{AttestationKeyBlob, FlushPolicy};

pub mod credential;
pub mod quote;
pub mod utils;

use utils::*;

const AK_HASH_ALG: &str = "Sha256";
const AK_SIGN_ALG: &str = "RsaSsa";

const TPM_TRANSIENT_FIRST: u32 = 0x8000_0000;
const TPM_MAX_HANDLES: u32 = 64;

/// How to reach the TPM and what to clean up when opening it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TpmConfig {
    /// TCTI string such as `device:/dev/tpmrm0` or `mssim:host=localhost,port=2321`
    #[serde(default)]
    pub tcti: Option<String>,

    #[serde(default)]
    pub flush: FlushPolicy,
}

/// TPM objects that can be evicted with TPM2_FlushContext.
pub trait Flushable: Copy + std::fmt::Debug {
    fn object_handle(&self) -> ObjectHandle;
}

impl Flushable for KeyHandle {
    fn object_handle(&self) -> ObjectHandle {
        (*self).into()
    }
}

impl Flushable for AuthSession {
    fn object_handle(&self) -> ObjectHandle {
        SessionHandle::from(*self).into()
    }
}

/// A loaded TPM object, flushed when the guard goes out of scope.
pub struct ScopedHandle<'a, H: Flushable> {
    context: &'a mut TssContext,
    handle: H,
}

impl<'a, H: Flushable> ScopedHandle<'a, H> {
    pub fn new(context: &'a mut TssContext, handle: H) -> Self {
        Self { context, handle }
    }

    pub fn handle(&self) -> H {
        self.handle
    }

    pub fn context(&mut self) -> &mut TssContext {
        &mut *self.context
    }
}

impl<H: Flushable> Drop for ScopedHandle<'_, H> {
    fn drop(&mut self) {
        match self.context.flush_context(self.handle.object_handle()) {
            std::result::Result::Ok(()) => debug!("Flushed {:?}", self.handle),
            std::result::Result::Err(e) => warn!("Failed to flush {:?}: {e}", self.handle),
        }
    }
}

impl<'a> ScopedHandle<'a, AuthSession> {
    /// Start an HMAC or policy session with SHA-256 and AES-128-CFB
    /// parameter encryption.
    pub fn start_session(context: &'a mut TssContext, session_type: SessionType) -> Result<Self> {
        let session = context
            .start_auth_session(
                None,
                None,
                None,
                session_type,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(anyhow!("Failed to start auth session"))?;
        let mut guard = Self::new(context, session);

        let (session_attributes, session_attributes_mask) =
            if matches!(session_type, SessionType::Hmac) {
                SessionAttributesBuilder::new()
                    .with_decrypt(true)
                    .with_encrypt(true)
                    .build()
            } else {
                SessionAttributesBuilder::new().build()
            };
        guard
            .context
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;

        Ok(guard)
    }
}

impl ScopedHandle<'_, KeyHandle> {
    pub fn public_key(&mut self) -> Result<RsaPublicKey> {
        let (public, _, _) = self.context.read_public(self.handle)?;
        public_to_rsa(public)
    }

    /// Create a restricted RSA 2048 signing key (RSASSA, SHA-256) under this
    /// key. The result is not loaded.
    pub fn create_ak(&mut self) -> Result<AttestationKey> {
        let ak = create_ak(
            &mut *self.context,
            self.handle,
            HashingAlgorithm::Sha256,
            SignatureSchemeAlgorithm::RsaSsa,
            None,
            DefaultKey,
        )
        .context("Create attestation key failed")?;
        info!("Created attestation key under the EK");

        Ok(AttestationKey {
            ak_private: ak.out_private,
            ak_public: ak.out_public,
        })
    }

    /// Load `ak` under this key. The child guard borrows this one, so it is
    /// flushed first.
    pub fn load_ak(&mut self, ak: &AttestationKey) -> Result<ScopedHandle<'_, KeyHandle>> {
        let handle = load_ak(
            &mut *self.context,
            self.handle,
            None,
            ak.ak_private.clone(),
            ak.ak_public.clone(),
        )
        .context("Load attestation key failed")?;
        Ok(ScopedHandle::new(&mut *self.context, handle))
    }
}

/// An attestation key as the TPM hands it out: the public area and the
/// private part wrapped by the parent EK.
#[derive(Clone, Debug)]
pub struct AttestationKey {
    pub ak_private: Private,
    pub ak_public: Public,
}

impl AttestationKey {
    pub fn public_key(&self) -> Result<RsaPublicKey> {
        public_to_rsa(self.ak_public.clone())
    }

    /// The marshalled TPMT_PUBLIC, the input of the AK name.
    pub fn public_area(&self) -> Result<Vec<u8>> {
        Ok(self.ak_public.marshall()?)
    }

    pub fn to_blob(&self) -> Result<AttestationKeyBlob> {
        Ok(AttestationKeyBlob {
            ak_hash_alg: AK_HASH_ALG.to_string(),
            ak_sign_alg: AK_SIGN_ALG.to_string(),
            ak_public: self.public_area()?,
            ak_private: self.ak_private.value().to_vec(),
        })
    }

    pub fn from_blob(blob: &AttestationKeyBlob) -> Result<Self> {
        if blob.ak_hash_alg != AK_HASH_ALG || blob.ak_sign_alg != AK_SIGN_ALG {
            bail!(
                "Unexpected AK parameters hash/sign: {}/{}",
                blob.ak_hash_alg,
                blob.ak_sign_alg
            );
        }

        Ok(Self {
            ak_public: Public::unmarshall(&blob.ak_public).context("Unmarshall AK public")?,
            ak_private: Private::try_from(blob.ak_private.clone())
                .context("Unmarshall AK private")?,
        })
    }
}

/// An open TPM. All commands need `&mut self`, which serializes access.
pub struct TpmDevice {
    context: TssContext,
}

impl TpmDevice {
    pub fn open(config: &TpmConfig) -> Result<Self> {
        let tcti = create_tcti(config.tcti.as_deref())?;
        let context = TssContext::new(tcti).context("Open TPM device failed")?;
        let mut device = Self { context };

        if config.flush == FlushPolicy::Transient {
            device.flush_transient()?;
        }
        Ok(device)
    }

    /// Evict every transient object left behind by earlier sessions.
    pub fn flush_transient(&mut self) -> Result<usize> {
        let (capability, _) = self.context.get_capability(
            CapabilityType::Handles,
            TPM_TRANSIENT_FIRST,
            TPM_MAX_HANDLES,
        )?;
        let CapabilityData::Handles(handles) = capability else {
            bail!("Unexpected capability data for TPM_CAP_HANDLES");
        };

        let mut flushed = 0;
        for handle in handles.iter() {
            if let TpmHandle::Transient(_) = handle {
                let object = self.context.tr_from_tpm_public(*handle)?;
                self.context.flush_context(object)?;
                flushed += 1;
            }
        }
        if flushed > 0 {
            info!("Flushed {flushed} transient objects");
        }
        Ok(flushed)
    }

    /// Derive the primary EK from the TCG default RSA template. The same TPM
    /// always yields the same key.
    pub fn create_ek(&mut self) -> Result<ScopedHandle<'_, KeyHandle>> {
        let handle = create_ek_object(&mut self.context, AsymmetricAlgorithm::Rsa, DefaultKey)
            .context("Create EK failed")?;
        Ok(ScopedHandle::new(&mut self.context, handle))
    }

    /// Derive the EK and check it is the one recorded at provisioning.
    pub fn load_ek(&mut self, provisioned: &RsaPublicKey) -> Result<ScopedHandle<'_, KeyHandle>> {
        let mut ek = self.create_ek()?;
        if &ek.public_key()? != provisioned {
            bail!("EK of this TPM does not match the provisioned EK public key");
        }
        Ok(ek)
    }

    /// The EK certificate the manufacturer stored in NV, as PEM.
    pub fn read_ek_certificate(&mut self) -> Result<String> {
        let ek_cert_bytes = retrieve_ek_pubcert(
            &mut self.context,
            AsymmetricAlgorithmSelection::Rsa(RsaKeyBits::Rsa2048),
        )?;
        let ek_cert = certificate_der_to_pem(&ek_cert_bytes).context("Decode EK certificate")?;

        Ok(ek_cert)
    }
}
