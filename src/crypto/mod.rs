//! Password-based authenticated encryption for backup files.
//!
//! Backups are encrypted at rest with AES-256-GCM under a key derived from
//! the operator's password via PBKDF2-HMAC-SHA256. Files are streamed
//! through the cipher as a sequence of 64 KiB STREAM segments, so neither
//! encryption nor decryption ever holds more than one segment in memory.
//! Each segment carries its own authentication tag; the final segment's tag
//! is kept in the catalog row ([`EncryptionMeta`]) rather than on disk, so
//! decryption requires the stored metadata quad.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::{aead::KeyInit, Aes256Gcm, Key};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use crate::errors::{AppError, Result};

pub const ALGORITHM: &str = "aes-256-gcm";
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 210_000;

const SALT_SIZE: usize = 16;
/// STREAM nonce prefix: the 12-byte GCM nonce minus the 32-bit counter and
/// last-segment flag managed by the stream construction.
const NONCE_SIZE: usize = 7;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
/// Plaintext bytes per STREAM segment.
const CHUNK_SIZE: usize = 64 * 1024;

/// Parameters required to decrypt a backup file, stored alongside the
/// catalog row. Absence on a backup means the file is plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMeta {
    /// Cipher identifier; only `aes-256-gcm` is supported.
    pub algorithm: String,
    /// Base64-encoded PBKDF2 salt.
    pub salt: String,
    /// Base64-encoded STREAM nonce prefix.
    pub nonce: String,
    /// Base64-encoded authentication tag of the final segment.
    pub tag: String,
    /// PBKDF2 iteration count used for key derivation.
    pub iterations: u32,
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Key<Aes256Gcm> {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    *Key::<Aes256Gcm>::from_slice(&key)
}

fn check_password(password: &str) -> Result<()> {
    if password.trim().is_empty() {
        return Err(AppError::InvalidInput(
            "encryption password must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn decode_meta_field(value: &str, field: &str, expected_len: usize) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| AppError::Integrity(format!("invalid base64 in {} field: {}", field, e)))?;
    if bytes.len() != expected_len {
        return Err(AppError::Integrity(format!(
            "unexpected {} length: {} bytes",
            field,
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn decryptor_for(
    password: &str,
    meta: &EncryptionMeta,
) -> Result<(DecryptorBE32<Aes256Gcm>, Vec<u8>)> {
    if meta.algorithm != ALGORITHM {
        return Err(AppError::Integrity(format!(
            "unsupported encryption algorithm: {}",
            meta.algorithm
        )));
    }
    let salt = decode_meta_field(&meta.salt, "salt", SALT_SIZE)?;
    let nonce = decode_meta_field(&meta.nonce, "nonce", NONCE_SIZE)?;
    let tag = decode_meta_field(&meta.tag, "tag", TAG_SIZE)?;
    let key = derive_key(password, &salt, meta.iterations);
    let decryptor =
        DecryptorBE32::from_aead(Aes256Gcm::new(&key), GenericArray::from_slice(&nonce));
    Ok((decryptor, tag))
}

/// Encrypts the file at `path` in place and returns the metadata needed to
/// decrypt it later.
///
/// The ciphertext is streamed segment by segment into a temporary sibling
/// file which is renamed over the original only once fully written, so a
/// failure at any point leaves the original file untouched and no stray
/// temp file behind.
pub async fn encrypt_file_in_place(
    path: &Path,
    password: &str,
    iterations: Option<u32>,
) -> Result<EncryptionMeta> {
    check_password(password)?;
    let iterations = iterations.unwrap_or(DEFAULT_PBKDF2_ITERATIONS);

    let salt: [u8; SALT_SIZE] = rand::random();
    let nonce: [u8; NONCE_SIZE] = rand::random();
    let key = derive_key(password, &salt, iterations);
    let encryptor =
        EncryptorBE32::from_aead(Aes256Gcm::new(&key), GenericArray::from_slice(&nonce));

    let tmp_path = temp_sibling(path);
    let tag = match encrypt_to_file(path, &tmp_path, encryptor).await {
        Ok(tag) => tag,
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
    };
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    Ok(EncryptionMeta {
        algorithm: ALGORITHM.to_string(),
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
        tag: BASE64.encode(tag),
        iterations,
    })
}

/// Streams `src` through the cipher into `dst`; returns the final segment's
/// tag, which is stripped from the file.
async fn encrypt_to_file(
    src: &Path,
    dst: &Path,
    mut encryptor: EncryptorBE32<Aes256Gcm>,
) -> Result<Vec<u8>> {
    let mut input = File::open(src).await?;
    let mut remaining = input.metadata().await?.len();
    let mut output = BufWriter::new(File::create(dst).await?);

    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > CHUNK_SIZE as u64 {
        input.read_exact(&mut buf).await?;
        remaining -= CHUNK_SIZE as u64;
        let segment = encryptor
            .encrypt_next(buf.as_slice())
            .map_err(|e| AppError::Backup(format!("encryption failed: {}", e)))?;
        output.write_all(&segment).await?;
    }

    let mut last = vec![0u8; remaining as usize];
    input.read_exact(&mut last).await?;
    let mut segment = encryptor
        .encrypt_last(last.as_slice())
        .map_err(|e| AppError::Backup(format!("encryption failed: {}", e)))?;
    let tag = segment.split_off(segment.len() - TAG_SIZE);
    output.write_all(&segment).await?;
    output.flush().await?;
    Ok(tag)
}

/// Decrypts the file at `path` segment by segment into `out`. A wrong
/// password or corrupted segment fails the tag check and is reported as
/// [`AppError::InvalidPassword`]; nothing is silently truncated.
pub async fn decrypt_file_to_writer<W: AsyncWrite + Unpin>(
    path: &Path,
    password: &str,
    meta: &EncryptionMeta,
    out: &mut W,
) -> Result<()> {
    check_password(password)?;
    let (mut decryptor, tag) = decryptor_for(password, meta)?;

    let mut input = File::open(path).await?;
    let mut remaining = input.metadata().await?.len();

    while remaining > CHUNK_SIZE as u64 {
        let mut segment = vec![0u8; CHUNK_SIZE + TAG_SIZE];
        input.read_exact(&mut segment).await?;
        remaining -= segment.len() as u64;
        let plain = decryptor
            .decrypt_next(segment.as_slice())
            .map_err(|_| AppError::InvalidPassword)?;
        out.write_all(&plain).await?;
    }

    let mut segment = vec![0u8; remaining as usize];
    input.read_exact(&mut segment).await?;
    segment.extend_from_slice(&tag);
    let plain = decryptor
        .decrypt_last(segment.as_slice())
        .map_err(|_| AppError::InvalidPassword)?;
    out.write_all(&plain).await?;
    out.flush().await?;
    Ok(())
}

/// Decrypts the file at `path` into memory. Convenience wrapper for small
/// payloads; large files should use the writer or stream variants.
pub async fn decrypt_file(path: &Path, password: &str, meta: &EncryptionMeta) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decrypt_file_to_writer(path, password, meta, &mut out).await?;
    Ok(out)
}

/// Decrypts the file at `path` to a new file at `out_path`.
pub async fn decrypt_file_to_path(
    path: &Path,
    out_path: &Path,
    password: &str,
    meta: &EncryptionMeta,
) -> Result<()> {
    let mut out = BufWriter::new(File::create(out_path).await?);
    decrypt_file_to_writer(path, password, meta, &mut out).await?;
    Ok(())
}

/// Returns a reader yielding the decrypted plaintext of the file at `path`.
///
/// Setup errors (missing file, bad metadata, blank password) are raised
/// here; a wrong password or corrupted segment surfaces as an
/// `InvalidData` I/O error on the reader, detected on the first segment
/// before any plaintext is produced from it.
pub async fn decrypt_file_to_stream(
    path: &Path,
    password: &str,
    meta: &EncryptionMeta,
) -> Result<impl AsyncRead + Send + Unpin> {
    check_password(password)?;
    let (decryptor, tag) = decryptor_for(password, meta)?;
    let mut input = File::open(path).await?;
    let remaining = input.metadata().await?.len();

    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
    tokio::spawn(async move {
        if let Err(e) = pump_decrypted(&mut input, remaining, decryptor, tag, &tx).await {
            let _ = tx.send(Err(e)).await;
        }
    });
    Ok(StreamReader::new(ReceiverStream::new(rx)))
}

async fn pump_decrypted(
    input: &mut File,
    mut remaining: u64,
    mut decryptor: DecryptorBE32<Aes256Gcm>,
    tag: Vec<u8>,
    tx: &mpsc::Sender<std::io::Result<Bytes>>,
) -> std::io::Result<()> {
    let invalid = || std::io::Error::new(std::io::ErrorKind::InvalidData, AppError::InvalidPassword);

    while remaining > CHUNK_SIZE as u64 {
        let mut segment = vec![0u8; CHUNK_SIZE + TAG_SIZE];
        input.read_exact(&mut segment).await?;
        remaining -= segment.len() as u64;
        let plain = decryptor
            .decrypt_next(segment.as_slice())
            .map_err(|_| invalid())?;
        if tx.send(Ok(Bytes::from(plain))).await.is_err() {
            // Reader went away; stop quietly.
            return Ok(());
        }
    }

    let mut segment = vec![0u8; remaining as usize];
    input.read_exact(&mut segment).await?;
    segment.extend_from_slice(&tag);
    let plain = decryptor
        .decrypt_last(segment.as_slice())
        .map_err(|_| invalid())?;
    let _ = tx.send(Ok(Bytes::from(plain))).await;
    Ok(())
}

/// SHA-256 hex digest of a file as it sits on disk (ciphertext if encrypted).
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "backup".to_string());
    path.with_file_name(format!("{}.{:08x}.enc-tmp", name, rand::random::<u32>()))
}
