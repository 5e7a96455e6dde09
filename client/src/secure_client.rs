//! Handshake initiator, request sender, and response verifier.
//!
//! One `SecureChannelClient` is one logical conversation: it generates its
//! handshake nonce and ephemeral DH key at construction, derives the
//! directional traffic keys when the server's `KeyResponse` checks out,
//! and seals requests until dropped. Derived key material is zeroized on
//! drop.

use zeroize::{Zeroize, ZeroizeOnDrop};

use sealed_ml_common::crypto::{
    self, IV_SIZE, KEY_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE,
};
use sealed_ml_common::{
    Body, ChannelError, EcPoint, EvidenceKind, KeyProvider, KeyRequest, KeyResponse, Message,
    Request, Response, Result,
};

use crate::attestation_verifier::{AttestationPolicy, QuoteVerifier};

/// What a handled message amounted to.
#[derive(Debug)]
pub enum ClientEvent {
    /// A `KeyResponse` was verified and traffic keys are now negotiated.
    KeyResponse,
    /// An application `Response` decrypted successfully. `key_outdated`
    /// signals that the server has rolled its key and a new handshake
    /// should happen soon.
    Response { payload: Vec<u8>, key_outdated: bool },
}

#[derive(ZeroizeOnDrop)]
pub struct SecureChannelClient {
    #[zeroize(skip)]
    key_provider: KeyProvider,
    #[zeroize(skip)]
    quote_verifier: Option<Box<dyn QuoteVerifier>>,
    #[zeroize(skip)]
    policy: AttestationPolicy,
    #[zeroize(skip)]
    expected_service_identifier: Vec<u8>,
    #[zeroize(skip)]
    key_version: Option<u32>,
    #[zeroize(skip)]
    verbose: bool,

    nonce: [u8; NONCE_SIZE],
    public_key: [u8; KEY_SIZE],
    in_key: Option<[u8; SYMMETRIC_KEY_SIZE]>,
    out_key: Option<[u8; SYMMETRIC_KEY_SIZE]>,
    static_iv: Option<[u8; IV_SIZE]>,
    dynamic_iv: [u8; IV_SIZE],
    server_nonce: Vec<u8>,
}

impl SecureChannelClient {
    /// Build a client around a key provider holding the conversation's
    /// ephemeral DH secret.
    ///
    /// Empty expectations skip the corresponding identity check; a `None`
    /// verifier means quote verification is unavailable on this platform,
    /// which is only acceptable when no expectations are set.
    pub fn new(
        key_provider: KeyProvider,
        quote_verifier: Option<Box<dyn QuoteVerifier>>,
        expected_signer_pem: &str,
        expected_enclave_hash: &[u8],
        expected_service_identifier: &[u8],
        verbose: bool,
    ) -> Result<Self> {
        let mut nonce = [0u8; NONCE_SIZE];
        let mut dynamic_iv = [0u8; IV_SIZE];
        crypto::randomize(&mut nonce);
        crypto::randomize(&mut dynamic_iv);

        let public_key = crypto::curve25519_public(key_provider.current_key())?;

        Ok(Self {
            key_provider,
            quote_verifier,
            policy: AttestationPolicy {
                expected_signer_pem: expected_signer_pem.to_string(),
                expected_enclave_hash: expected_enclave_hash.to_vec(),
                verbose,
            },
            expected_service_identifier: expected_service_identifier.to_vec(),
            key_version: None,
            verbose,
            nonce,
            public_key,
            in_key: None,
            out_key: None,
            static_iv: None,
            dynamic_iv,
            server_nonce: Vec::new(),
        })
    }

    /// Emit a `KeyRequest` opening the conversation.
    pub fn make_key_request(&self, out: &mut [u8]) -> Result<usize> {
        let msg = Message::new(Body::KeyRequest(KeyRequest {
            nonce: self.nonce.to_vec(),
        }));
        msg.encode_into(out)
    }

    /// Decode and dispatch a server message.
    pub fn handle_message(&mut self, msg: &[u8]) -> Result<ClientEvent> {
        let message = Message::decode(msg)?;
        match message.body {
            Body::KeyResponse(r) => self.handle_key_response(&r),
            Body::Response(r) => self.handle_response(&r),
            Body::KeyRequest(_) | Body::Request(_) => Err(ChannelError::PayloadParse(
                "message not supposed to be handled by the client".to_string(),
            )),
        }
    }

    fn handle_key_response(&mut self, r: &KeyResponse) -> Result<ClientEvent> {
        // 1. The signature binds the service identifier to our nonce.
        let mut signed = r.id.service_identifier.clone();
        signed.extend_from_slice(&self.nonce);
        if !crypto::verify(&signed, &r.id.server_signature_share.xy, &r.id.signature)? {
            return Err(ChannelError::Crypto("invalid service signature".to_string()));
        }

        // 2. Attestation evidence.
        let mut quote: Option<&[u8]> = None;
        let mut collateral: &[u8] = &[];
        for evidence in &r.authenticator {
            match evidence.kind {
                EvidenceKind::Quote => quote = Some(&evidence.contents),
                EvidenceKind::Collateral => collateral = &evidence.contents,
            }
        }

        match (quote, &self.quote_verifier) {
            (Some(quote), Some(verifier)) => {
                if !self.policy.requires_quote() {
                    tracing::warn!(
                        "expected enclave signer / hash not provided, skipping identity verification"
                    );
                }
                self.policy.verify(
                    verifier.as_ref(),
                    quote,
                    collateral,
                    &r.id.server_share.xy,
                    &r.id.service_identifier,
                )?;
            }
            (Some(_), None) => {
                if self.policy.requires_quote() {
                    return Err(ChannelError::Attestation(
                        "cannot verify enclave identity without quote verification support"
                            .to_string(),
                    ));
                }
                tracing::warn!("no support for quote verification");
            }
            (None, _) => {
                if self.policy.requires_quote() {
                    return Err(ChannelError::Attestation(
                        "no quote received from server, cannot verify identity".to_string(),
                    ));
                }
                tracing::warn!("no attestation evidence received from server");
            }
        }

        // 3. Service identifier pinning.
        if !self.expected_service_identifier.is_empty() {
            if self.expected_service_identifier != r.id.service_identifier {
                return Err(ChannelError::Attestation(format!(
                    "service identifier mismatch: expected={} actual={}",
                    hex::encode(&self.expected_service_identifier),
                    hex::encode(&r.id.service_identifier)
                )));
            }
            if self.verbose {
                tracing::info!(
                    "service identifier verified: {}",
                    hex::encode(&self.expected_service_identifier)
                );
            }
        }

        // 4. Key derivation. The inbound key is what the server seals
        // replies with; the outbound key and the static IV belong to the
        // client-send direction.
        self.server_nonce = r.id.nonce.clone();
        let mut shared =
            crypto::shared_secret(self.key_provider.current_key(), &r.id.server_share.xy)?;
        let (in_key, _) = crypto::derive_traffic_keys(&shared, true)?;
        let (out_key, static_iv) = crypto::derive_traffic_keys(&shared, false)?;
        shared.zeroize();

        self.in_key = Some(in_key);
        self.out_key = Some(out_key);
        self.static_iv = Some(static_iv);
        self.key_version = Some(r.key_version);

        Ok(ClientEvent::KeyResponse)
    }

    fn handle_response(&self, r: &Response) -> Result<ClientEvent> {
        if r.iv.len() != IV_SIZE {
            return Err(ChannelError::Crypto("invalid iv size".to_string()));
        }
        if r.tag.len() != TAG_SIZE {
            return Err(ChannelError::Crypto("invalid tag size".to_string()));
        }
        let in_key = self.in_key.as_ref().ok_or_else(|| {
            ChannelError::Crypto("no key negotiated; issue a key request first".to_string())
        })?;

        let payload = crypto::open(in_key, &r.iv, &r.tag, &r.additional_data, &r.ciphertext)?;
        Ok(ClientEvent::Response {
            payload,
            key_outdated: r.key_outdated,
        })
    }

    /// Seal an application payload into a `Request`. The message carries
    /// the dynamic IV; the seal used `static_iv XOR dynamic_iv`. The
    /// dynamic IV increments after every request so the effective IV never
    /// repeats under one key.
    pub fn make_request(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<usize> {
        let (Some(out_key), Some(static_iv), Some(key_version)) =
            (&self.out_key, &self.static_iv, self.key_version)
        else {
            return Err(ChannelError::Crypto(
                "no key negotiated; issue a key request first".to_string(),
            ));
        };

        let mut xor_iv = [0u8; IV_SIZE];
        for i in 0..IV_SIZE {
            xor_iv[i] = static_iv[i] ^ self.dynamic_iv[i];
        }

        let (ciphertext, tag) = crypto::seal(out_key, &xor_iv, &self.server_nonce, plaintext)?;

        let msg = Message::new(Body::Request(Request {
            key_version,
            iv: self.dynamic_iv.to_vec(),
            tag: tag.to_vec(),
            client_share: EcPoint::compressed(self.public_key.to_vec()),
            additional_data: self.server_nonce.clone(),
            ciphertext,
        }));
        let written = msg.encode_into(out)?;

        crypto::increment_iv(&mut self.dynamic_iv);
        Ok(written)
    }
}
