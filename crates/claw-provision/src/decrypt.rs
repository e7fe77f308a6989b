//! Decrypt primitives.
//!
//! The orchestrator only sees the [`Decryptor`] trait:
//! `decrypt(identity, ciphertext, output)`, which either writes the complete
//! plaintext to `output` or leaves `output` untouched.
//!
//! Two implementations are provided:
//! - [`SealedBoxDecryptor`]: X25519 key agreement + ChaCha20-Poly1305, with
//!   the output format `MAGIC || ephemeral_pub || nonce || ciphertext || tag`
//! - [`CommandDecryptor`]: shells out to an `age`-compatible program

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand_core::{OsRng, RngCore};
use subtle::ConstantTimeEq;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{ProvisionError, Result};

/// Size of X25519 keys in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Header identifying a sealed file.
pub const MAGIC: &[u8] = b"claw-seal/v1\n";

const KDF_CONTEXT: &str = "claw-provision 2025 sealed-box v1";

/// Decrypts a ciphertext file with an identity file.
pub trait Decryptor: Send + Sync + fmt::Debug {
    /// Writes the plaintext of `ciphertext` to `output`.
    ///
    /// Implementations must not leave a partial file at `output` on failure.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Decrypt`] with the primitive's diagnostic.
    fn decrypt(&self, identity: &Path, ciphertext: &Path, output: &Path) -> Result<()>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// An X25519 private identity. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    bytes: [u8; KEY_SIZE],
}

impl Identity {
    /// Generates a new random identity.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            bytes: secret.to_bytes(),
        }
    }

    /// Creates an identity from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            ProvisionError::Decrypt(format!(
                "identity must be exactly {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Parses an identity file: `#` comment lines and blank lines are
    /// skipped, the first remaining line is the base64 private key.
    ///
    /// # Errors
    ///
    /// Returns an error if no key line is present or it does not decode.
    pub fn parse(content: &str) -> Result<Self> {
        let line = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .ok_or_else(|| ProvisionError::Decrypt("identity file contains no key".to_string()))?;
        let decoded = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(line)
                .map_err(|e| {
                    ProvisionError::Decrypt(format!("identity is not valid base64: {e}"))
                })?,
        );
        Self::from_bytes(&decoded)
    }

    /// Reads and parses an identity file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Decrypt(format!("cannot read identity '{}': {e}", path.display()))
        })?);
        Self::parse(&content)
    }

    /// Serializes the identity in the format [`Identity::parse`] reads.
    #[must_use]
    pub fn to_file_contents(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "# public key: {}\n{}\n",
            self.recipient().to_base64(),
            base64::engine::general_purpose::STANDARD.encode(self.bytes)
        ))
    }

    /// The matching public recipient.
    #[must_use]
    pub fn recipient(&self) -> Recipient {
        let secret = StaticSecret::from(self.bytes);
        Recipient(PublicKey::from(&secret).to_bytes())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for Identity {}

/// An X25519 public key that ciphertexts are sealed to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Recipient([u8; KEY_SIZE]);

impl Recipient {
    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a recipient from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| ProvisionError::Decrypt(format!("recipient is not valid base64: {e}")))?;
        let bytes: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            ProvisionError::Decrypt(format!(
                "recipient must be exactly {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        let short = &b64[..8.min(b64.len())];
        write!(f, "Recipient({short}...)")
    }
}

fn derive_key(
    shared: &[u8; KEY_SIZE],
    ephemeral: &[u8; KEY_SIZE],
    recipient: &[u8; KEY_SIZE],
) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut material = Zeroizing::new([0u8; KEY_SIZE * 3]);
    material[..KEY_SIZE].copy_from_slice(shared);
    material[KEY_SIZE..KEY_SIZE * 2].copy_from_slice(ephemeral);
    material[KEY_SIZE * 2..].copy_from_slice(recipient);
    Zeroizing::new(blake3::derive_key(KDF_CONTEXT, material.as_slice()))
}

/// Seals `plaintext` to `recipient`.
///
/// Provided so fixtures and tests can produce ciphertext; provisioning
/// itself only ever opens.
///
/// # Errors
///
/// Returns an error if encryption fails.
pub fn seal(recipient: &Recipient, plaintext: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient.0));
    let key = derive_key(shared.as_bytes(), ephemeral_pub.as_bytes(), &recipient.0);

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice())
        .map_err(|e| ProvisionError::Decrypt(format!("failed to create cipher: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| ProvisionError::Decrypt(format!("encryption failed: {e}")))?;

    let mut output =
        Vec::with_capacity(MAGIC.len() + KEY_SIZE + NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(MAGIC);
    output.extend_from_slice(ephemeral_pub.as_bytes());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Opens a sealed buffer with `identity`.
///
/// # Errors
///
/// Returns an error if:
/// - The header is missing or the buffer is too short
/// - The ephemeral key is a low-order point
/// - Authentication fails (wrong identity or tampered data)
pub fn open(identity: &Identity, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let body = sealed
        .strip_prefix(MAGIC)
        .ok_or_else(|| ProvisionError::Decrypt("not a sealed file (bad header)".to_string()))?;
    if body.len() < KEY_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(ProvisionError::Decrypt(format!(
            "ciphertext too short: expected at least {} bytes, got {}",
            KEY_SIZE + NONCE_SIZE + TAG_SIZE,
            body.len()
        )));
    }

    let (ephemeral, rest) = body.split_at(KEY_SIZE);
    let (nonce, encrypted) = rest.split_at(NONCE_SIZE);
    let mut ephemeral_bytes = [0u8; KEY_SIZE];
    ephemeral_bytes.copy_from_slice(ephemeral);

    let secret = StaticSecret::from(identity.bytes);
    let shared = secret.diffie_hellman(&PublicKey::from(ephemeral_bytes));
    if !shared.was_contributory() {
        return Err(ProvisionError::Decrypt(
            "ephemeral key is a low-order point".to_string(),
        ));
    }
    let key = derive_key(
        shared.as_bytes(),
        &ephemeral_bytes,
        identity.recipient().as_bytes(),
    );

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice())
        .map_err(|e| ProvisionError::Decrypt(format!("failed to create cipher: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), encrypted)
        .map(Zeroizing::new)
        .map_err(|_| {
            ProvisionError::Decrypt(
                "authentication failed (wrong identity or corrupt data)".to_string(),
            )
        })
}

/// Writes `contents` next to `output` and renames it into place.
fn write_atomic(output: &Path, contents: &[u8]) -> Result<()> {
    let parent = output.parent().ok_or_else(|| {
        ProvisionError::Decrypt(format!("output '{}' has no parent", output.display()))
    })?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".claw-provision")
        .tempfile_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(output).map_err(|e| ProvisionError::Io(e.error))?;
    Ok(())
}

/// Built-in X25519 + ChaCha20-Poly1305 decryptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SealedBoxDecryptor;

impl SealedBoxDecryptor {
    /// Creates a new decryptor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decryptor for SealedBoxDecryptor {
    fn decrypt(&self, identity: &Path, ciphertext: &Path, output: &Path) -> Result<()> {
        let identity = Identity::from_file(identity)?;
        let sealed = std::fs::read(ciphertext).map_err(|e| {
            ProvisionError::Decrypt(format!("cannot read '{}': {e}", ciphertext.display()))
        })?;
        let plaintext = open(&identity, &sealed)?;
        write_atomic(output, &plaintext)?;
        debug!(output = %output.display(), bytes = plaintext.len(), "sealed file opened");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

/// Runs an `age`-compatible program:
/// `<program> [args] --decrypt --identity <id> --output <tmp> <ciphertext>`.
#[derive(Debug, Clone)]
pub struct CommandDecryptor {
    program: String,
    args: Vec<String>,
}

impl CommandDecryptor {
    /// Creates a decryptor for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra arguments placed before the decrypt flags.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl Decryptor for CommandDecryptor {
    fn decrypt(&self, identity: &Path, ciphertext: &Path, output: &Path) -> Result<()> {
        let parent = output.parent().ok_or_else(|| {
            ProvisionError::Decrypt(format!("output '{}' has no parent", output.display()))
        })?;
        let tmp = tempfile::Builder::new()
            .prefix(".claw-provision")
            .tempfile_in(parent)?;

        let result = Command::new(&self.program)
            .args(&self.args)
            .arg("--decrypt")
            .arg("--identity")
            .arg(identity)
            .arg("--output")
            .arg(tmp.path())
            .arg(ciphertext)
            .output()
            .map_err(|e| ProvisionError::Decrypt(format!("failed to run {}: {e}", self.program)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(ProvisionError::Decrypt(format!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                stderr.trim()
            )));
        }

        tmp.persist(output).map_err(|e| ProvisionError::Io(e.error))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
