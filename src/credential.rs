//! Funding credentials
//!
//! A funding credential is the ed25519 keypair that authorises a transfer from
//! the actor's funding account. The actor's identity is the base58 public key.
//!
//! Credentials are held in memory as zeroize-on-drop bytes and are only ever
//! written to storage sealed with ChaCha20-Poly1305 (see [`CredentialSealer`]).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ConquestError, Result};
use crate::grid::ActorId;

/// Ed25519 secret key length
pub const SECRET_KEY_LEN: usize = 32;

/// Secret || public keypair length (the common wallet export format)
pub const KEYPAIR_LEN: usize = 64;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// Fixed sealing key used only in development mode
pub const DEV_SEALING_KEY: [u8; 32] = *b"conquest-dev-only-sealing-key!!!";

/// Secret material authorising payments for one actor
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FundingCredential {
    secret: [u8; SECRET_KEY_LEN],
}

impl std::fmt::Debug for FundingCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FundingCredential")
            .field("actor", &self.actor_id().as_str())
            .finish_non_exhaustive()
    }
}

impl FundingCredential {
    pub fn from_secret_bytes(secret: [u8; SECRET_KEY_LEN]) -> Self {
        Self { secret }
    }

    /// Parse a base58 keypair (64 bytes) or bare secret key (32 bytes)
    pub fn from_base58(encoded: &str) -> Result<Self> {
        let mut bytes = bs58::decode(encoded.trim())
            .into_vec()
            .map_err(|_| ConquestError::Credential("Invalid private key format".into()))?;

        let result = match bytes.len() {
            SECRET_KEY_LEN | KEYPAIR_LEN => {
                let mut secret = [0u8; SECRET_KEY_LEN];
                secret.copy_from_slice(&bytes[..SECRET_KEY_LEN]);
                let credential = Self { secret };
                secret.zeroize();

                if bytes.len() == KEYPAIR_LEN {
                    let derived = credential.signing_key().verifying_key().to_bytes();
                    if derived[..] != bytes[SECRET_KEY_LEN..] {
                        bytes.zeroize();
                        return Err(ConquestError::Credential(
                            "Keypair public half does not match secret".into(),
                        ));
                    }
                }
                Ok(credential)
            }
            n => Err(ConquestError::Credential(format!(
                "Invalid private key length: {n} bytes"
            ))),
        };

        bytes.zeroize();
        result
    }

    /// Generate a fresh credential (tests and tooling)
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng).to_bytes(),
        }
    }

    /// Base58 keypair export, the inverse of [`FundingCredential::from_base58`]
    pub fn to_base58(&self) -> String {
        let signing = self.signing_key();
        let mut keypair = signing.to_keypair_bytes();
        let encoded = bs58::encode(&keypair).into_string();
        keypair.zeroize();
        encoded
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret)
    }

    /// Identity of the funding account (base58 public key)
    pub fn actor_id(&self) -> ActorId {
        let public = self.signing_key().verifying_key();
        ActorId::new(bs58::encode(public.as_bytes()).into_string())
    }

    /// Detached signature over `message`, base58 encoded
    pub fn sign(&self, message: &[u8]) -> String {
        let signature = self.signing_key().sign(message);
        bs58::encode(signature.to_bytes()).into_string()
    }
}

/// Seals credentials for storage in the job table
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CredentialSealer {
    key: [u8; 32],
}

impl CredentialSealer {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Parse a 64-char hex key
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let mut bytes = hex::decode(hex_key.trim())
            .map_err(|e| ConquestError::Config(format!("Sealing key is not hex: {e}")))?;
        if bytes.len() != 32 {
            let len = bytes.len();
            bytes.zeroize();
            return Err(ConquestError::Config(format!(
                "Sealing key must be 32 bytes, got {len}"
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self { key })
    }

    pub fn development() -> Self {
        Self::new(DEV_SEALING_KEY)
    }

    /// Seal to `base64(nonce || ciphertext)`
    pub fn seal(&self, credential: &FundingCredential) -> Result<String> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), credential.secret.as_slice())
            .map_err(|e| ConquestError::Sealing(format!("Encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<FundingCredential> {
        let raw = BASE64
            .decode(sealed)
            .map_err(|e| ConquestError::Sealing(format!("Sealed credential is not base64: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(ConquestError::Sealing("Sealed credential too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let mut plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ConquestError::Sealing("Failed to open sealed credential".into()))?;

        if plaintext.len() != SECRET_KEY_LEN {
            plaintext.zeroize();
            return Err(ConquestError::Sealing("Unexpected credential length".into()));
        }
        let mut secret = [0u8; SECRET_KEY_LEN];
        secret.copy_from_slice(&plaintext);
        plaintext.zeroize();

        let credential = FundingCredential::from_secret_bytes(secret);
        secret.zeroize();
        Ok(credential)
    }
}
