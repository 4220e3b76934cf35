//! Compression, encryption and integrity protection for stored objects.
//!
//! Every object is self-describing: a fixed header carries the format
//! version, the object id, the algorithm byte and the nonce, so external
//! object metadata (which some stores silently truncate) is never needed for
//! decoding.
//!
//! Wire format:
//!
//! ```text
//! magic(5) | version(1) | obj_id(8 LE) | alg(1) | nonce(16) | ct_len(8 LE)
//!   | ciphertext | tag(16, encrypted objects only)
//! ```
//!
//! The payload is compressed, then sealed with AES-256-GCM under a per-object
//! subkey `HMAC-SHA256(master_key, obj_id || nonce)`. The header is fed to
//! the AEAD as associated data, so tampering with any header field fails
//! authentication. Because the subkey is unique per object, the GCM nonce can
//! be fixed.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use subtle::ConstantTimeEq;

use crate::{BackendError, ObjectBackend, RetryPolicy};

type HmacSha256 = Hmac<Sha256>;

const MAGIC: &[u8; 5] = b"s3ql_";
const FORMAT_VERSION: u8 = 2;
const NONCE_SIZE: usize = 16;
const HEADER_SIZE: usize = 5 + 1 + 8 + 1 + NONCE_SIZE + 8;
const TAG_SIZE: usize = 16;

const CIPHER_PLAIN: u8 = 0x00;
const CIPHER_AES_GCM: u8 = 0x10;

/// Write-time compression choice. The level is not recorded in the object;
/// decoding only needs the algorithm, which lives in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib(u32),
    Bzip2(u32),
    Lzma(u32),
}

impl Compression {
    pub fn from_name(name: &str, level: u32) -> Result<Self, BackendError> {
        if !(1..=9).contains(&level) {
            return Err(BackendError::InvalidUrl(format!(
                "compression level {level} out of range"
            )));
        }
        match name {
            "none" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib(level)),
            "bzip2" => Ok(Compression::Bzip2(level)),
            "lzma" => Ok(Compression::Lzma(level)),
            _ => Err(BackendError::InvalidUrl(format!(
                "unsupported compression algorithm: {name}"
            ))),
        }
    }

    fn alg_bits(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zlib(_) => 1,
            Compression::Bzip2(_) => 2,
            Compression::Lzma(_) => 3,
        }
    }
}

/// The filesystem master key. All object subkeys are derived from it.
#[derive(Clone, Copy)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Key derived from a user passphrase, used only to wrap the master key.
    pub fn from_passphrase(passphrase: &[u8]) -> Self {
        let digest = Sha256::digest(passphrase);
        Self(digest.into())
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// The object id a backend key encodes: `s3ql_data_<N>` maps to N, every
/// other key (metadata, params, passphrase) to 0.
pub fn object_id_for_key(key: &str) -> u64 {
    key.strip_prefix("s3ql_data_")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn derive_subkey(master: &MasterKey, obj_id: u64, nonce: &[u8; NONCE_SIZE]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as KeyInit>::new_from_slice(master.as_bytes()).expect("HMAC accepts any key length");
    mac.update(&obj_id.to_le_bytes());
    mac.update(nonce);
    mac.finalize().into_bytes().into()
}

fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, BackendError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Zlib(level) => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level));
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        Compression::Bzip2(level) => {
            let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(level));
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        Compression::Lzma(level) => {
            let mut enc = xz2::write::XzEncoder::new(Vec::new(), level);
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
    }
}

fn decompress(alg_bits: u8, data: &[u8]) -> Result<Vec<u8>, BackendError> {
    let mut out = Vec::new();
    match alg_bits {
        0 => out.extend_from_slice(data),
        1 => {
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| BackendError::Corrupted(format!("zlib stream: {e}")))?;
        }
        2 => {
            bzip2::read::BzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| BackendError::Corrupted(format!("bzip2 stream: {e}")))?;
        }
        3 => {
            xz2::read::XzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| BackendError::Corrupted(format!("lzma stream: {e}")))?;
        }
        other => {
            return Err(BackendError::Corrupted(format!(
                "unknown compression algorithm 0x{other:02x}"
            )));
        }
    }
    Ok(out)
}

fn encode_header(
    obj_id: u64,
    alg: u8,
    nonce: &[u8; NONCE_SIZE],
    ct_len: u64,
) -> [u8; HEADER_SIZE] {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    buf.put_slice(MAGIC);
    buf.put_u8(FORMAT_VERSION);
    buf.put_u64_le(obj_id);
    buf.put_u8(alg);
    buf.put_slice(nonce);
    buf.put_u64_le(ct_len);
    buf.as_ref().try_into().expect("header size is fixed")
}

/// Encode `payload` into the self-describing object format.
pub fn encode_object(
    key: Option<&MasterKey>,
    compression: Compression,
    obj_id: u64,
    payload: &[u8],
) -> Result<Vec<u8>, BackendError> {
    let compressed = compress(compression, payload)?;

    match key {
        Some(master) => {
            let mut nonce = [0u8; NONCE_SIZE];
            rand::thread_rng().fill_bytes(&mut nonce);
            let alg = CIPHER_AES_GCM | compression.alg_bits();
            let header = encode_header(obj_id, alg, &nonce, compressed.len() as u64);

            let subkey = derive_subkey(master, obj_id, &nonce);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&subkey));
            let sealed = cipher
                .encrypt(
                    Nonce::from_slice(&[0u8; 12]),
                    Payload {
                        msg: &compressed,
                        aad: &header,
                    },
                )
                .map_err(|_| BackendError::Corrupted("AEAD encryption failed".into()))?;

            let mut out = Vec::with_capacity(HEADER_SIZE + sealed.len());
            out.extend_from_slice(&header);
            out.extend_from_slice(&sealed);
            Ok(out)
        }
        None => {
            let alg = CIPHER_PLAIN | compression.alg_bits();
            let header = encode_header(obj_id, alg, &[0u8; NONCE_SIZE], compressed.len() as u64);
            let mut out = Vec::with_capacity(HEADER_SIZE + compressed.len());
            out.extend_from_slice(&header);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Decode an object, verifying the header against `expected_obj_id` and the
/// AEAD tag when the object is encrypted.
pub fn decode_object(
    key: Option<&MasterKey>,
    expected_obj_id: u64,
    raw: &[u8],
) -> Result<Vec<u8>, BackendError> {
    if raw.len() < HEADER_SIZE {
        return Err(BackendError::Corrupted("object shorter than header".into()));
    }
    let header = &raw[..HEADER_SIZE];
    if &header[..5] != MAGIC {
        return Err(BackendError::Corrupted("bad magic".into()));
    }
    if header[5] != FORMAT_VERSION {
        return Err(BackendError::VersionMismatch(header[5]));
    }
    let obj_id = u64::from_le_bytes(header[6..14].try_into().unwrap());
    if obj_id != expected_obj_id {
        return Err(BackendError::Corrupted(format!(
            "object id {obj_id} does not match its key (expected {expected_obj_id})"
        )));
    }
    let alg = header[14];
    let nonce: [u8; NONCE_SIZE] = header[15..15 + NONCE_SIZE].try_into().unwrap();
    let ct_len = u64::from_le_bytes(header[15 + NONCE_SIZE..HEADER_SIZE].try_into().unwrap());
    let body = &raw[HEADER_SIZE..];

    let encrypted = match alg & 0xf0 {
        CIPHER_PLAIN => false,
        CIPHER_AES_GCM => true,
        other => {
            return Err(BackendError::Corrupted(format!(
                "unknown cipher 0x{other:02x}"
            )));
        }
    };

    let compressed = if encrypted {
        let Some(master) = key else {
            return Err(BackendError::Corrupted(
                "encrypted object but no key available".into(),
            ));
        };
        if body.len() != ct_len as usize + TAG_SIZE {
            return Err(BackendError::Corrupted("object length mismatch".into()));
        }
        let subkey = derive_subkey(master, obj_id, &nonce);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&subkey));
        cipher
            .decrypt(
                Nonce::from_slice(&[0u8; 12]),
                Payload {
                    msg: body,
                    aad: header,
                },
            )
            .map_err(|_| BackendError::Corrupted("checksum mismatch".into()))?
    } else {
        if key.is_some() {
            // A filesystem with a passphrase must never accept unauthenticated
            // objects, or an attacker could substitute plaintext data.
            return Err(BackendError::Corrupted(
                "expected encrypted object, found plain one".into(),
            ));
        }
        if body.len() != ct_len as usize {
            return Err(BackendError::Corrupted("object length mismatch".into()));
        }
        body.to_vec()
    };

    decompress(alg & 0x0f, &compressed)
}

/// Wrap the master key under a passphrase for storage in `s3ql_passphrase`.
pub fn wrap_master_key(passphrase: &[u8], master: &MasterKey) -> Result<Bytes, BackendError> {
    let wrapping = MasterKey::from_passphrase(passphrase);
    let buf = encode_object(Some(&wrapping), Compression::None, 0, master.as_bytes())?;
    Ok(Bytes::from(buf))
}

pub fn unwrap_master_key(passphrase: &[u8], raw: &[u8]) -> Result<MasterKey, BackendError> {
    let wrapping = MasterKey::from_passphrase(passphrase);
    let buf = decode_object(Some(&wrapping), 0, raw)
        .map_err(|_| BackendError::Auth("wrong passphrase".into()))?;
    let bytes: [u8; 32] = buf
        .as_slice()
        .try_into()
        .map_err(|_| BackendError::Corrupted("master key object has wrong size".into()))?;
    Ok(MasterKey::from_bytes(bytes))
}

/// Adds compression + encryption to a raw backend.
///
/// `put`/`get` transform payloads; everything else passes through. The codec
/// work is CPU-bound and runs on the blocking pool so backend calls never
/// stall the async executor.
pub struct ComprencBackend<B> {
    inner: B,
    key: Option<MasterKey>,
    compression: Compression,
}

impl<B: ObjectBackend> ComprencBackend<B> {
    pub fn new(inner: B, key: Option<MasterKey>, compression: Compression) -> Self {
        Self {
            inner,
            key,
            compression,
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: ObjectBackend> ObjectBackend for ComprencBackend<B> {
    async fn lookup(&self, key: &str) -> Result<u64, BackendError> {
        self.inner.lookup(key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, BackendError> {
        let raw = self.inner.get(key).await?;
        let master = self.key;
        let obj_id = object_id_for_key(key);
        let payload =
            tokio::task::spawn_blocking(move || decode_object(master.as_ref(), obj_id, &raw))
                .await
                .map_err(|e| BackendError::Corrupted(format!("codec task failed: {e}")))??;
        Ok(Bytes::from(payload))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<u64, BackendError> {
        let master = self.key;
        let compression = self.compression;
        let obj_id = object_id_for_key(key);
        let encoded = tokio::task::spawn_blocking(move || {
            encode_object(master.as_ref(), compression, obj_id, &data)
        })
        .await
        .map_err(|e| BackendError::Corrupted(format!("codec task failed: {e}")))??;
        self.inner.put(key, Bytes::from(encoded)).await
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.inner.delete(key).await
    }

    async fn delete_multi(&self, keys: &[String]) -> Result<(), BackendError> {
        self.inner.delete_multi(keys).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        self.inner.list(prefix).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        // Copies are only sound between keys that share an object id (the
        // metadata snapshot family, which all use id 0). Data objects are
        // never copied.
        debug_assert_eq!(object_id_for_key(src), object_id_for_key(dst));
        self.inner.copy(src, dst).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        debug_assert_eq!(object_id_for_key(src), object_id_for_key(dst));
        self.inner.rename(src, dst).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.inner.close().await
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy()
    }
}
