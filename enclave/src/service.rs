//! Outer request dispatch for the enclave service.
//!
//! The secure channel carries opaque application payloads; this module
//! gives them meaning. A request is either a scoring call, routed to the
//! [`Executor`], or a one-time model key provisioning call that unlocks a
//! model blob delivered sealed at startup.

use std::sync::{Arc, Mutex};

use zeroize::Zeroize;

use sealed_ml_common::crypto;
use sealed_ml_common::{ChannelError, KeyProvider, KeyType, Result};

use crate::server::RequestCallback;

/// The model-inference engine behind the scoring path.
pub trait Executor: Send + Sync {
    fn execute(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// Builds an executor from a plaintext model blob.
pub type ExecutorLoader = Box<dyn Fn(&[u8]) -> Result<Box<dyn Executor>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    ProvisionModelKey = 0,
    Score = 1,
}

impl RequestType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(RequestType::ProvisionModelKey),
            1 => Ok(RequestType::Score),
            other => Err(ChannelError::UnknownRequestType(other.to_string())),
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Enclave-side application state: the model, its identifier, and the
/// executor once the model is usable.
pub struct ModelService {
    /// Sealed model blob retained until its key is provisioned.
    encrypted_model: Vec<u8>,
    service_identifier: Vec<u8>,
    loader: ExecutorLoader,
    executor: Option<Box<dyn Executor>>,
}

impl ModelService {
    /// Service over a plaintext model; the executor is built immediately.
    pub fn new(model: &[u8], loader: ExecutorLoader) -> Result<Self> {
        let service_identifier = crypto::sha256(model).to_vec();
        let executor = Some(loader(model)?);
        Ok(Self {
            encrypted_model: Vec::new(),
            service_identifier,
            loader,
            executor,
        })
    }

    /// Service over a sealed model (`ciphertext || tag`, zero IV). The
    /// executor is built when the model key arrives via
    /// `ProvisionModelKey`.
    pub fn new_sealed(encrypted_model: &[u8], loader: ExecutorLoader) -> Self {
        Self {
            encrypted_model: encrypted_model.to_vec(),
            service_identifier: crypto::sha256(encrypted_model).to_vec(),
            loader,
            executor: None,
        }
    }

    /// The identifier bound into every handshake: the hash of the model
    /// blob as delivered.
    pub fn service_identifier(&self) -> &[u8] {
        &self.service_identifier
    }

    pub fn is_model_initialized(&self) -> bool {
        self.executor.is_some()
    }

    /// Dispatch one decrypted request payload by its external tag,
    /// overwriting `data` with the reply.
    pub fn handle(&mut self, tag: u8, data: &mut Vec<u8>) -> Result<()> {
        match RequestType::from_tag(tag)? {
            RequestType::Score => {
                let executor = self.executor.as_ref().ok_or_else(|| {
                    ChannelError::Execution("model not initialized".to_string())
                })?;
                let output = executor.execute(data)?;
                *data = output;
                Ok(())
            }
            RequestType::ProvisionModelKey => {
                self.provision_model_key(data)?;
                data.zeroize();
                Ok(())
            }
        }
    }

    fn provision_model_key(&mut self, key: &[u8]) -> Result<()> {
        if self.executor.is_some() {
            return Err(ChannelError::ModelAlreadyInitialized);
        }

        let provider = KeyProvider::static_key(key, KeyType::Curve25519);
        let mut model = unseal_model(&self.encrypted_model, &provider)?;
        self.executor = Some((self.loader)(&model)?);
        model.zeroize();
        self.encrypted_model.clear();
        Ok(())
    }
}

/// Open a sealed model blob: `ciphertext || tag`, zero IV, no additional
/// data.
fn unseal_model(encrypted: &[u8], provider: &KeyProvider) -> Result<Vec<u8>> {
    if encrypted.len() <= crypto::TAG_SIZE {
        return Err(ChannelError::Crypto(
            "not enough encrypted model data".to_string(),
        ));
    }
    let (ciphertext, tag) = encrypted.split_at(encrypted.len() - crypto::TAG_SIZE);
    let iv = [0u8; crypto::IV_SIZE];
    crypto::open(provider.current_key(), &iv, tag, &[], ciphertext)
}

/// Adapt a service into the server's request callback, routing by the
/// request tag carried in the first payload byte.
///
/// The channel callback has no out-of-band tag slot, so the tag travels
/// in-band: a request payload is `tag || body`, and the reply overwrites
/// the whole buffer. This is how a deployment reaches both scoring and
/// model key provisioning through the secure channel.
pub fn dispatch_callback(service: Arc<Mutex<ModelService>>) -> RequestCallback {
    Box::new(move |data| {
        let Some((&tag, payload)) = data.split_first() else {
            return Err(ChannelError::PayloadParse(
                "empty request payload".to_string(),
            ));
        };
        let mut body = payload.to_vec();

        let mut service = service
            .lock()
            .map_err(|_| ChannelError::Execution("service lock poisoned".to_string()))?;
        service.handle(tag, &mut body)?;
        drop(service);

        // The inbound buffer may hold key material (provisioning path).
        data.zeroize();
        *data = body;
        Ok(())
    })
}

/// Adapt a service into the server's request callback, with every channel
/// payload treated as a scoring request. For deployments that never
/// provision over the channel; see [`dispatch_callback`] otherwise.
pub fn scoring_callback(service: Arc<Mutex<ModelService>>) -> RequestCallback {
    Box::new(move |data| {
        let mut service = service
            .lock()
            .map_err(|_| ChannelError::Execution("service lock poisoned".to_string()))?;
        service.handle(RequestType::Score.tag(), data)
    })
}
