//! Cryptographic primitives for the secure channel.
//!
//! Curve25519 Diffie-Hellman and Ed25519 signatures over the same 32-byte
//! secret, AES-256-GCM with detached tags, HKDF-SHA-256 traffic key
//! derivation, and the MRSIGNER digest of an RSA signing key.
//!
//! The dual use of one secret for X25519 and Ed25519 is deliberate: seeds
//! produced by the Curve25519-typed key providers are clamped so the same
//! bytes are a valid scalar for both uses, and the handshake advertises
//! both derived public points.

use aes_gcm::{AeadInPlace, Aes256Gcm, KeyInit, Nonce, Tag};
use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use sha2::{Digest, Sha256};
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};

use crate::error::{ChannelError, Result};

pub const KEY_SIZE: usize = 32;
pub const SYMMETRIC_KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;
pub const IV_SIZE: usize = 12;
pub const SIGNATURE_SIZE: usize = 64;
pub const NONCE_SIZE: usize = 16;
pub const SHA256_SIZE: usize = 32;

/// Fill a buffer from the OS CSPRNG.
pub fn randomize(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Clamp a 32-byte seed into a valid Curve25519 scalar in place
/// (RFC 8032 §5.1.5).
pub fn clamp_curve25519(key: &mut [u8]) -> Result<()> {
    if key.len() != KEY_SIZE {
        return Err(ChannelError::Crypto("invalid key size for clamping".to_string()));
    }
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    Ok(())
}

fn as_key_array(bytes: &[u8], what: &str) -> Result<[u8; KEY_SIZE]> {
    bytes
        .try_into()
        .map_err(|_| ChannelError::Crypto(format!("invalid {} size: {}", what, bytes.len())))
}

/// X25519 basepoint multiplication: public key from a 32-byte secret.
pub fn curve25519_public(secret_key: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let k = as_key_array(secret_key, "secret key")?;
    Ok(x25519(k, X25519_BASEPOINT_BYTES))
}

/// Ed25519 public key from a 32-byte seed.
pub fn ed25519_public(seed: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let k = as_key_array(seed, "signing seed")?;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&k);
    Ok(signing_key.verifying_key().to_bytes())
}

/// Derive both public points the handshake advertises from one secret:
/// the X25519 share and the Ed25519 signature share.
pub fn make_public_keys(secret_key: &[u8]) -> Result<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
    Ok((curve25519_public(secret_key)?, ed25519_public(secret_key)?))
}

/// X25519 shared secret. Fails if either input is not 32 bytes.
pub fn shared_secret(our_secret: &[u8], their_public: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let k = as_key_array(our_secret, "secret key")?;
    let u = as_key_array(their_public, "public key")?;
    Ok(x25519(k, u))
}

/// HKDF-Expand-SHA-256 with the shared secret as PRK.
pub fn hkdf_expand(prk: &[u8], info: &[u8], okm: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::from_prk(prk)
        .map_err(|_| ChannelError::Crypto("invalid HKDF PRK length".to_string()))?;
    hk.expand(info, okm)
        .map_err(|_| ChannelError::Crypto("invalid HKDF output length".to_string()))?;
    Ok(())
}

/// Derive one direction's traffic material from the shared secret.
///
/// `server` selects the labels for the server-to-client direction ("server
/// key" / "server iv"); `false` selects the client-to-server direction.
/// The client's inbound key is the server's outbound key and vice versa.
pub fn derive_traffic_keys(
    shared: &[u8],
    server: bool,
) -> Result<([u8; SYMMETRIC_KEY_SIZE], [u8; IV_SIZE])> {
    if shared.len() != KEY_SIZE {
        return Err(ChannelError::Crypto(
            "invalid shared secret (wrong size)".to_string(),
        ));
    }

    let label_key: &[u8] = if server { b"server key" } else { b"client key" };
    let label_iv: &[u8] = if server { b"server iv" } else { b"client iv" };

    let mut symmetric_key = [0u8; SYMMETRIC_KEY_SIZE];
    let mut static_iv = [0u8; IV_SIZE];
    hkdf_expand(shared, label_key, &mut symmetric_key)?;
    hkdf_expand(shared, label_iv, &mut static_iv)?;
    Ok((symmetric_key, static_iv))
}

/// Increment a 12-byte IV as a big-endian counter, wrapping at the top of
/// the 2^96 space.
pub fn increment_iv(iv: &mut [u8; IV_SIZE]) {
    for i in (0..IV_SIZE).rev() {
        iv[i] = iv[i].wrapping_add(1);
        if iv[i] != 0 {
            break;
        }
    }
}

/// AES-256-GCM seal with a detached 16-byte tag.
pub fn seal(
    key: &[u8],
    iv: &[u8],
    additional_data: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE])> {
    if key.len() != SYMMETRIC_KEY_SIZE {
        return Err(ChannelError::Crypto(format!(
            "invalid AEAD key size: {}",
            key.len()
        )));
    }
    if iv.len() != IV_SIZE {
        return Err(ChannelError::Crypto(format!(
            "invalid AEAD IV size: {}",
            iv.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| ChannelError::Crypto("AEAD context creation failed".to_string()))?;
    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(iv), additional_data, &mut buf)
        .map_err(|_| ChannelError::Crypto("encryption failed".to_string()))?;
    Ok((buf, tag.into()))
}

/// AES-256-GCM open of a detached (ciphertext, tag) pair. Fails with a
/// crypto error on any size mismatch or authentication failure.
pub fn open(
    key: &[u8],
    iv: &[u8],
    tag: &[u8],
    additional_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if key.len() != SYMMETRIC_KEY_SIZE {
        return Err(ChannelError::Crypto(format!(
            "invalid AEAD key size: {}",
            key.len()
        )));
    }
    if iv.len() != IV_SIZE {
        return Err(ChannelError::Crypto(format!(
            "invalid AEAD IV size: {}",
            iv.len()
        )));
    }
    if tag.len() != TAG_SIZE {
        return Err(ChannelError::Crypto(format!(
            "invalid AEAD tag size: {}",
            tag.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| ChannelError::Crypto("AEAD context creation failed".to_string()))?;
    let mut buf = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(iv),
            additional_data,
            &mut buf,
            Tag::from_slice(tag),
        )
        .map_err(|_| ChannelError::Crypto("decryption failed".to_string()))?;
    Ok(buf)
}

/// Ed25519 signature over `message` with a 32-byte seed.
pub fn sign(message: &[u8], seed: &[u8]) -> Result<[u8; SIGNATURE_SIZE]> {
    let k = as_key_array(seed, "signing seed")?;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&k);
    Ok(signing_key.sign(message).to_bytes())
}

/// Ed25519 verification. Returns `Ok(false)` on signature mismatch and an
/// error only on malformed key or signature sizes.
pub fn verify(message: &[u8], public_key: &[u8], signature: &[u8]) -> Result<bool> {
    let pk = as_key_array(public_key, "public key")?;
    let sig: [u8; SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| ChannelError::Crypto(format!("invalid signature size: {}", signature.len())))?;

    let verifying_key = match ed25519_dalek::VerifyingKey::from_bytes(&pk) {
        Ok(vk) => vk,
        Err(_) => return Ok(false),
    };
    let signature = ed25519_dalek::Signature::from_bytes(&sig);
    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// SHA-256 of a single buffer.
pub fn sha256(data: &[u8]) -> [u8; SHA256_SIZE] {
    Sha256::digest(data).into()
}

/// SHA-256 over the concatenation of several buffers, streamed.
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; SHA256_SIZE] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// MRSIGNER of an RSA public signing key in PEM form: the modulus in
/// little-endian byte order, hashed with SHA-256. This matches how SGX
/// derives the signer identity recorded in a quote.
pub fn pem_to_mrsigner(public_key_pem: &str) -> Result<[u8; SHA256_SIZE]> {
    let public_key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| ChannelError::Crypto(format!("RSA public key parse failed: {}", e)))?;
    let modulus_le = public_key.n().to_bytes_le();
    Ok(sha256(&modulus_le))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> [u8; KEY_SIZE] {
        let mut k = [0u8; KEY_SIZE];
        randomize(&mut k);
        k
    }

    #[test]
    fn dh_commutes() {
        let a = random_key();
        let b = random_key();
        let pa = curve25519_public(&a).unwrap();
        let pb = curve25519_public(&b).unwrap();
        assert_eq!(
            shared_secret(&a, &pb).unwrap(),
            shared_secret(&b, &pa).unwrap()
        );
    }

    #[test]
    fn dh_rejects_short_inputs() {
        assert!(shared_secret(&[0u8; 31], &[0u8; 32]).is_err());
        assert!(shared_secret(&[0u8; 32], &[0u8; 33]).is_err());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let mut seed = random_key();
        clamp_curve25519(&mut seed).unwrap();
        let public = ed25519_public(&seed).unwrap();
        let msg = b"service-identifier-and-nonce";
        let sig = sign(msg, &seed).unwrap();
        assert!(verify(msg, &public, &sig).unwrap());
        assert!(!verify(b"different message", &public, &sig).unwrap());
    }

    #[test]
    fn verify_rejects_bad_sizes() {
        assert!(verify(b"m", &[0u8; 31], &[0u8; 64]).is_err());
        assert!(verify(b"m", &[0u8; 32], &[0u8; 63]).is_err());
    }

    #[test]
    fn traffic_keys_directional() {
        let shared = random_key();
        let (server_key, server_iv) = derive_traffic_keys(&shared, true).unwrap();
        let (client_key, client_iv) = derive_traffic_keys(&shared, false).unwrap();
        assert_ne!(server_key, client_key);
        assert_ne!(server_iv, client_iv);

        // Deterministic for a given shared secret.
        let (server_key2, _) = derive_traffic_keys(&shared, true).unwrap();
        assert_eq!(server_key, server_key2);
    }

    #[test]
    fn increment_iv_counts_big_endian() {
        let mut iv = [0u8; IV_SIZE];
        iv[IV_SIZE - 1] = 1;
        increment_iv(&mut iv);
        assert_eq!(iv[IV_SIZE - 1], 2);
        assert!(iv[..IV_SIZE - 1].iter().all(|&b| b == 0));

        let mut iv = [0xFFu8; IV_SIZE];
        increment_iv(&mut iv);
        assert_eq!(iv, [0u8; IV_SIZE]);

        // Carry ripples through the low bytes only.
        let mut iv = [0u8; IV_SIZE];
        iv[IV_SIZE - 1] = 0xFF;
        iv[IV_SIZE - 2] = 0xFF;
        increment_iv(&mut iv);
        assert_eq!(iv[IV_SIZE - 3], 1);
        assert_eq!(iv[IV_SIZE - 2], 0);
        assert_eq!(iv[IV_SIZE - 1], 0);
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = random_key();
        let mut iv = [0u8; IV_SIZE];
        randomize(&mut iv);
        let ad = b"server-nonce";
        let plaintext = b"the payload";

        let (ct, tag) = seal(&key, &iv, ad, plaintext).unwrap();
        assert_eq!(ct.len(), plaintext.len());
        let opened = open(&key, &iv, &tag, ad, &ct).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn open_rejects_any_tamper() {
        let key = random_key();
        let iv = [7u8; IV_SIZE];
        let ad = b"ad";
        let (ct, tag) = seal(&key, &iv, ad, b"payload").unwrap();

        let mut bad_ct = ct.clone();
        bad_ct[0] ^= 1;
        assert!(open(&key, &iv, &tag, ad, &bad_ct).is_err());

        let mut bad_tag = tag;
        bad_tag[0] ^= 1;
        assert!(open(&key, &iv, &bad_tag, ad, &ct).is_err());

        assert!(open(&key, &iv, &tag, b"da", &ct).is_err());

        let mut bad_iv = iv;
        bad_iv[0] ^= 1;
        assert!(open(&key, &bad_iv, &tag, ad, &ct).is_err());

        let mut bad_key = key;
        bad_key[0] ^= 1;
        assert!(open(&bad_key, &iv, &tag, ad, &ct).is_err());
    }

    #[test]
    fn open_rejects_bad_sizes() {
        let key = random_key();
        assert!(seal(&key[..31], &[0u8; IV_SIZE], b"", b"p").is_err());
        assert!(seal(&key, &[0u8; 11], b"", b"p").is_err());
        assert!(open(&key, &[0u8; IV_SIZE], &[0u8; 15], b"", b"c").is_err());
    }

    #[test]
    fn clamped_seed_is_valid_for_both_curves() {
        let mut seed = random_key();
        clamp_curve25519(&mut seed).unwrap();
        assert_eq!(seed[0] & 7, 0);
        assert_eq!(seed[31] & 0x80, 0);
        assert_eq!(seed[31] & 0x40, 0x40);

        let (dh_public, sig_public) = make_public_keys(&seed).unwrap();
        assert_ne!(dh_public, [0u8; KEY_SIZE]);
        assert_ne!(sig_public, [0u8; KEY_SIZE]);
    }

    // The standard debug signing key that unsigned SGX enclaves are signed
    // with on creation, and its published signer digest.
    const DEBUG_SIGN_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----\n\
MIIBoDANBgkqhkiG9w0BAQEFAAOCAY0AMIIBiAKCAYEAukAt/kn+T5FG64MM2dDv\n\
R26WSrDjGu8XDjYisFwBbktinVUFE05mFO9X1GDBlOqS8lqZuq8fhwm4lZFSc01i\n\
m6LlLRp4l+EOAHkhfRl+y4SDPlLbJX2yl5DMJjjTbWLH+Wiu5BzzWZ85Z2tPeS8d\n\
aMnisrv3ZuyVGl+aJPC3x1SCtL4G4yk5+svrGwYemefSBV8sLviVaPmRcmeBV2x6\n\
BLUc8/jgVVt3L9e0fWM3wnb9o9ZxJoIoAX1bFwXRnuP6N2xezEpfSWLgK41scmsN\n\
AkCmsp0WvoeiaD9nsOGfRxZnBpHbZBC0IyzTEPiOI+5NhRQ3QFbdy1kFuJxOoFiZ\n\
4leKZOwLqG264HwPmiTTWA7XXhP4+d/osb4F4BaEXZ7+4EYfbo5yxbjngcVI1oNN\n\
drCZIy9spWXxqfrG3XMfReWteVlYr6GLcbB5fNE8qm9AiX+fAyw5/ACajPAduKqU\n\
+7Q7ZoMNReay/Zkj9VPCAHeGZzLG/MUOC3Xtdjo3IJ/BAgED\n\
-----END PUBLIC KEY-----\n";

    #[test]
    fn mrsigner_of_debug_signing_key() {
        let mrsigner = pem_to_mrsigner(DEBUG_SIGN_PUBLIC_KEY_PEM).unwrap();
        assert_eq!(
            hex::encode(mrsigner),
            "ca9ad7331448980aa28890ce73e433638377f179ab4456b2fe237193193a8d0a"
        );
    }

    #[test]
    fn mrsigner_rejects_garbage() {
        assert!(pem_to_mrsigner("not a pem").is_err());
    }
}
