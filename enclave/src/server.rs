//! Stateful handshake responder and request dispatcher.
//!
//! The server owns the key provider, the public keys derived from it, and
//! the attestation evidence that embeds them. All three live under one
//! RwLock so a request always observes a consistent (key, version, public
//! keys, evidence) tuple: a response's `key_version` is guaranteed to name
//! a key its ciphertext opens under, even while a refresh runs on another
//! task.

use std::time::SystemTime;

use tokio::sync::RwLock;
use zeroize::Zeroize;

use sealed_ml_common::crypto::{self, IV_SIZE, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use sealed_ml_common::{
    Body, ChannelError, EcPoint, Evidence, EvidenceKind, KeyProvider, KeyRequest, KeyResponse,
    KeyType, Message, Request, Response, Result, SignedServiceIdentity,
};

use crate::attestation::QuoteProducer;

/// Application hook invoked with each decrypted request payload. The hook
/// overwrites the buffer in place with its reply bytes.
pub type RequestCallback = Box<dyn Fn(&mut Vec<u8>) -> Result<()> + Send + Sync>;

struct ServerState {
    provider: KeyProvider,
    public_key: [u8; KEY_SIZE],
    public_signing_key: [u8; KEY_SIZE],
    evidence: Vec<Evidence>,
}

pub struct Server {
    state: RwLock<ServerState>,
    nonce: [u8; NONCE_SIZE],
    service_identifier: Vec<u8>,
    callback: RequestCallback,
    quote_producer: Option<Box<dyn QuoteProducer>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("service_identifier", &self.service_identifier)
            .field("has_quote_producer", &self.quote_producer.is_some())
            .finish()
    }
}

impl Server {
    /// Build a server around an initialized Curve25519 key provider.
    ///
    /// Generates the handshake nonce, derives both public keys, and
    /// produces the initial attestation evidence.
    pub fn new(
        service_identifier: Vec<u8>,
        callback: RequestCallback,
        provider: KeyProvider,
        quote_producer: Option<Box<dyn QuoteProducer>>,
    ) -> Result<Self> {
        if provider.key_type() != KeyType::Curve25519 {
            return Err(ChannelError::Crypto("unsupported key type".to_string()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        crypto::randomize(&mut nonce);

        let (public_key, public_signing_key) = crypto::make_public_keys(provider.current_key())?;
        let evidence = Self::build_evidence(
            quote_producer.as_deref(),
            &public_key,
            &service_identifier,
        )?;

        Ok(Self {
            state: RwLock::new(ServerState {
                provider,
                public_key,
                public_signing_key,
                evidence,
            }),
            nonce,
            service_identifier,
            callback,
            quote_producer,
        })
    }

    fn build_evidence(
        producer: Option<&dyn QuoteProducer>,
        public_key: &[u8; KEY_SIZE],
        service_identifier: &[u8],
    ) -> Result<Vec<Evidence>> {
        let Some(producer) = producer else {
            return Ok(Vec::new());
        };

        let report_data =
            sealed_ml_common::attestation::report_data(public_key, service_identifier);
        let (quote, collateral) = producer.quote(&report_data)?;

        let mut evidence = vec![Evidence {
            kind: EvidenceKind::Quote,
            contents: quote,
        }];
        if let Some(collateral) = collateral {
            evidence.push(Evidence {
                kind: EvidenceKind::Collateral,
                contents: collateral,
            });
        }
        Ok(evidence)
    }

    /// Refresh the active key. On change, the public keys and the evidence
    /// are regenerated before the new version becomes visible to any
    /// handshake.
    pub async fn refresh_key(&self, sync_only: bool) -> Result<bool> {
        let mut state = self.state.write().await;
        let refreshed = state.provider.refresh(sync_only).await?;
        if refreshed {
            let (public_key, public_signing_key) =
                crypto::make_public_keys(state.provider.current_key())?;
            state.evidence = Self::build_evidence(
                self.quote_producer.as_deref(),
                &public_key,
                &self.service_identifier,
            )?;
            state.public_key = public_key;
            state.public_signing_key = public_signing_key;
        }
        Ok(refreshed)
    }

    pub async fn last_key_refresh(&self) -> SystemTime {
        self.state.read().await.provider.last_refreshed()
    }

    pub async fn public_key(&self) -> [u8; KEY_SIZE] {
        self.state.read().await.public_key
    }

    /// Route an incoming message and write the matching response into
    /// `out`, returning the number of bytes written.
    pub async fn respond(&self, in_msg: &[u8], out: &mut [u8]) -> Result<usize> {
        let message = Message::decode(in_msg)?;
        match message.body {
            Body::KeyRequest(r) => self.handle_key_request(&r, out).await,
            Body::Request(r) => self.handle_request(&r, out).await,
            Body::KeyResponse(_) | Body::Response(_) => Err(ChannelError::PayloadParse(
                "message not supposed to be handled by the server".to_string(),
            )),
        }
    }

    async fn handle_key_request(&self, r: &KeyRequest, out: &mut [u8]) -> Result<usize> {
        if r.nonce.len() != NONCE_SIZE {
            return Err(ChannelError::Crypto("invalid client nonce".to_string()));
        }

        let state = self.state.read().await;

        let mut message = self.service_identifier.clone();
        message.extend_from_slice(&r.nonce);
        let signature = crypto::sign(&message, state.provider.current_key())?;

        let response = Message::new(Body::KeyResponse(KeyResponse {
            id: SignedServiceIdentity {
                nonce: self.nonce.to_vec(),
                service_identifier: self.service_identifier.clone(),
                server_share: EcPoint::compressed(state.public_key.to_vec()),
                server_signature_share: EcPoint::compressed(state.public_signing_key.to_vec()),
                signature: signature.to_vec(),
            },
            lifetime_hint: 0,
            key_version: state.provider.current_version(),
            authenticator: state.evidence.clone(),
        }));
        response.encode_into(out)
    }

    async fn handle_request(&self, r: &Request, out: &mut [u8]) -> Result<usize> {
        // A client that has spoken to a replica holding a newer key forces
        // one synchronizing refresh before this request proceeds.
        let needs_sync = {
            let state = self.state.read().await;
            r.key_version > state.provider.current_version()
        };
        if needs_sync {
            self.refresh_key(true).await?;
        }

        let state = self.state.read().await;
        if r.key_version > state.provider.current_version() {
            return Err(ChannelError::Crypto(
                "key still older than client key version after refresh".to_string(),
            ));
        }

        if r.iv.len() != IV_SIZE {
            return Err(ChannelError::Crypto("invalid iv size".to_string()));
        }
        if r.tag.len() != TAG_SIZE {
            return Err(ChannelError::Crypto("invalid tag size".to_string()));
        }
        if r.client_share.xy.len() != KEY_SIZE {
            return Err(ChannelError::Crypto("invalid client share".to_string()));
        }

        let shared = crypto::shared_secret(state.provider.key(r.key_version)?, &r.client_share.xy)?;

        // Inbound: the client sealed with static_iv XOR its dynamic IV.
        let (client_key, client_static_iv) = crypto::derive_traffic_keys(&shared, false)?;
        let mut xor_iv = [0u8; IV_SIZE];
        for i in 0..IV_SIZE {
            xor_iv[i] = client_static_iv[i] ^ r.iv[i];
        }

        let mut payload = crypto::open(&client_key, &xor_iv, &r.tag, &r.additional_data, &r.ciphertext)?;

        (self.callback)(&mut payload)?;

        // Outbound: sealed with the server-direction static IV, sent in
        // the clear.
        let (server_key, server_static_iv) = crypto::derive_traffic_keys(&shared, true)?;
        let (ciphertext, tag) = crypto::seal(&server_key, &server_static_iv, &self.nonce, &payload)?;
        payload.zeroize();

        let response = Message::new(Body::Response(Response {
            key_outdated: state.provider.is_outdated(r.key_version)?,
            iv: server_static_iv.to_vec(),
            tag: tag.to_vec(),
            additional_data: self.nonce.to_vec(),
            ciphertext,
        }));
        response.encode_into(out)
    }
}
