//! Path and metadata encryption capabilities.
//!
//! [`GrantEncryptor`] realizes the `Encryptor` capability over an access
//! grant's scoped key store:
//!
//! - Paths are encrypted per segment. Segment keys are derived by
//!   HMAC-SHA256 chaining along the path, and each segment is sealed with
//!   AES-256-GCM under a nonce derived from the segment itself, so equal
//!   paths always encrypt to equal ciphertexts and prefix ranges survive
//!   encryption. Sealed segments are base64url, which keeps encrypted keys
//!   ordered, printable and free of `/`.
//! - Metadata is sealed with a random content key under a zero nonce; the
//!   content key is wrapped under a path-derived key with a random nonce.
//!   The wrap nonce, the sealed blob and the wrapped key are the three
//!   fields persisted on the object row.

use crate::error::{AccessError, AccessResult};
use crate::grant::{AccessGrant, KEY_SIZE, ScopedKey, covers_prefix, segments_below};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use keyhole_core::codec::{to_deep, to_shallow};
use keyhole_core::location::ObjectMetadata;
use rand::RngCore;
use sha2::Sha256;
use std::any::Any;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

const NONCE_SIZE: usize = 12;

/// How one capability's key scope relates to another's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityOrdering {
    /// Both capabilities cover exactly the same scopes.
    Identical,
    /// Every scope of this capability is covered by the other.
    Subset,
    /// This capability covers every scope of the other, and more.
    Superset,
    /// Neither covers the other.
    Disjoint,
}

/// A decryption capability: encrypts and decrypts object paths and metadata
/// blobs, and compares its key scope against other capabilities.
pub trait Encryptor: Send + Sync {
    /// Encrypt the path of an object.
    fn encrypt_path(&self, bucket: &str, path: &str) -> AccessResult<String>;

    /// Decrypt the path of an object.
    fn decrypt_path(&self, bucket: &str, path: &str) -> AccessResult<String>;

    /// Seal `meta.clear` into the three encrypted fields.
    /// The path must be unencrypted.
    fn encrypt_metadata(&self, bucket: &str, path: &str, meta: &mut ObjectMetadata)
    -> AccessResult<()>;

    /// Open the three encrypted fields into `meta.clear`.
    /// The path must be unencrypted.
    fn decrypt_metadata(&self, bucket: &str, path: &str, meta: &mut ObjectMetadata)
    -> AccessResult<()>;

    /// Compare this capability's key scope with another's.
    fn compare(&self, other: &dyn Encryptor) -> CapabilityOrdering;

    /// Downcast support for `compare` implementations.
    fn as_any(&self) -> &dyn Any;
}

fn hmac_tag(key: &[u8; KEY_SIZE], domain: &[u8], data: &[u8]) -> [u8; KEY_SIZE] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(domain);
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Derive the key for a child path segment.
pub(crate) fn derive_child_key(parent: &[u8; KEY_SIZE], segment: &str) -> [u8; KEY_SIZE] {
    hmac_tag(parent, b"path-segment:", segment.as_bytes())
}

/// Derive the metadata content-wrapping key at a path.
fn derive_metadata_key(key_at_path: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    hmac_tag(key_at_path, b"metadata:", &[])
}

/// Seal a single path segment under `key`, deterministically.
pub(crate) fn seal_segment(key: &[u8; KEY_SIZE], segment: &str) -> String {
    let nonce_tag = hmac_tag(key, b"segment-nonce:", segment.as_bytes());
    let nonce = Nonce::from_slice(&nonce_tag[..NONCE_SIZE]);
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is 32 bytes");
    let ciphertext = cipher
        .encrypt(nonce, segment.as_bytes())
        .expect("AES-GCM encryption is infallible for in-memory buffers");

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_tag[..NONCE_SIZE]);
    out.extend_from_slice(&ciphertext);
    URL_SAFE_NO_PAD.encode(out)
}

/// Open a sealed path segment under `key`.
pub(crate) fn open_segment(key: &[u8; KEY_SIZE], sealed: &str) -> AccessResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(sealed)
        .map_err(|_| AccessError::Decrypt)?;
    if bytes.len() <= NONCE_SIZE {
        return Err(AccessError::Decrypt);
    }

    let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is 32 bytes");
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AccessError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| AccessError::Decrypt)
}

fn seal(key: &[u8; KEY_SIZE], nonce: &[u8], plaintext: &[u8]) -> AccessResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is 32 bytes");
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| AccessError::Metadata("cannot seal metadata".to_string()))
}

fn open(key: &[u8; KEY_SIZE], nonce: &[u8], ciphertext: &[u8]) -> AccessResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is 32 bytes");
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AccessError::Decrypt)
}

/// Encryptor over an access grant's scoped key store.
#[derive(Debug, Clone)]
pub struct GrantEncryptor {
    keys: Vec<ScopedKey>,
}

impl GrantEncryptor {
    /// Build an encryptor from a parsed grant.
    pub fn new(grant: &AccessGrant) -> Self {
        Self {
            keys: grant.keys.clone(),
        }
    }

    /// The scoped key with the longest cleartext prefix covering `path`.
    fn key_for_path(&self, bucket: &str, path: &str) -> Option<&ScopedKey> {
        self.keys
            .iter()
            .filter(|k| k.bucket == bucket && covers_prefix(&k.prefix, path))
            .max_by_key(|k| k.prefix.len())
    }

    /// The scoped key with the longest encrypted prefix covering `path`.
    fn key_for_encrypted_path(&self, bucket: &str, path: &str) -> Option<&ScopedKey> {
        self.keys
            .iter()
            .filter(|k| k.bucket == bucket && covers_prefix(&k.encrypted_prefix, path))
            .max_by_key(|k| k.encrypted_prefix.len())
    }

    /// Derive the segment key at `path` below `entry`.
    fn key_at_path(&self, entry: &ScopedKey, path: &str) -> [u8; KEY_SIZE] {
        let mut key = entry.key;
        for segment in segments_below(&entry.prefix, path) {
            key = derive_child_key(&key, segment);
        }
        key
    }
}

impl Encryptor for GrantEncryptor {
    fn encrypt_path(&self, bucket: &str, path: &str) -> AccessResult<String> {
        // An empty path addresses the whole bucket; whether the grant covers
        // that is an authorization question, not an encryption one.
        if path.is_empty() {
            return Ok(String::new());
        }

        let entry = self
            .key_for_path(bucket, path)
            .ok_or_else(|| AccessError::PathNotCovered(path.to_string()))?;

        let mut key = entry.key;
        let mut out = entry.encrypted_prefix.clone();
        for segment in segments_below(&entry.prefix, path) {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&seal_segment(&key, segment));
            key = derive_child_key(&key, segment);
        }
        Ok(out)
    }

    fn decrypt_path(&self, bucket: &str, path: &str) -> AccessResult<String> {
        if path.is_empty() {
            return Ok(String::new());
        }

        let entry = self
            .key_for_encrypted_path(bucket, path)
            .ok_or_else(|| AccessError::PathNotCovered(path.to_string()))?;

        let mut key = entry.key;
        let mut out = entry.prefix.clone();
        for sealed in segments_below(&entry.encrypted_prefix, path) {
            let segment = open_segment(&key, sealed)?;
            key = derive_child_key(&key, &segment);
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&segment);
        }
        Ok(out)
    }

    fn encrypt_metadata(
        &self,
        bucket: &str,
        path: &str,
        meta: &mut ObjectMetadata,
    ) -> AccessResult<()> {
        let entry = self
            .key_for_path(bucket, path)
            .ok_or_else(|| AccessError::PathNotCovered(path.to_string()))?;

        let shallow = match &meta.clear {
            Some(clear) => to_shallow(clear)?.unwrap_or_default(),
            None => BTreeMap::new(),
        };
        let plaintext = serde_json::to_vec(&shallow)
            .map_err(|e| AccessError::Metadata(e.to_string()))?;

        let mut content_key = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut content_key);
        let mut wrap_nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut wrap_nonce);

        let derived = derive_metadata_key(&self.key_at_path(entry, path));
        let wrapped_key = seal(&derived, &wrap_nonce, &content_key)?;
        let blob = seal(&content_key, &[0u8; NONCE_SIZE], &plaintext)?;

        meta.encrypted_nonce = wrap_nonce.to_vec();
        meta.encrypted_blob = blob;
        meta.encrypted_key = wrapped_key;
        Ok(())
    }

    fn decrypt_metadata(
        &self,
        bucket: &str,
        path: &str,
        meta: &mut ObjectMetadata,
    ) -> AccessResult<()> {
        if meta.encrypted_blob.is_empty() {
            meta.clear = None;
            return Ok(());
        }

        let entry = self
            .key_for_path(bucket, path)
            .ok_or_else(|| AccessError::PathNotCovered(path.to_string()))?;
        if meta.encrypted_nonce.len() != NONCE_SIZE {
            return Err(AccessError::Decrypt);
        }

        let derived = derive_metadata_key(&self.key_at_path(entry, path));
        let content_key: [u8; KEY_SIZE] = open(&derived, &meta.encrypted_nonce, &meta.encrypted_key)?
            .try_into()
            .map_err(|_| AccessError::Decrypt)?;
        let plaintext = open(&content_key, &[0u8; NONCE_SIZE], &meta.encrypted_blob)?;

        let shallow: BTreeMap<String, String> = serde_json::from_slice(&plaintext)
            .map_err(|e| AccessError::Metadata(e.to_string()))?;
        meta.clear = to_deep(&shallow)?;
        Ok(())
    }

    fn compare(&self, other: &dyn Encryptor) -> CapabilityOrdering {
        let Some(other) = other.as_any().downcast_ref::<GrantEncryptor>() else {
            return CapabilityOrdering::Disjoint;
        };

        let self_covered = self
            .keys
            .iter()
            .all(|k| other.keys.iter().any(|o| entry_covers(o, k)));
        let other_covered = other
            .keys
            .iter()
            .all(|k| self.keys.iter().any(|s| entry_covers(s, k)));

        match (self_covered, other_covered) {
            (true, true) => CapabilityOrdering::Identical,
            (true, false) => CapabilityOrdering::Subset,
            (false, true) => CapabilityOrdering::Superset,
            (false, false) => CapabilityOrdering::Disjoint,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// True if scope `a` covers scope `b`: same bucket, `a`'s prefix is a
/// path-prefix of `b`'s, and deriving `a`'s key along the extra segments
/// yields `b`'s key.
fn entry_covers(a: &ScopedKey, b: &ScopedKey) -> bool {
    if a.bucket != b.bucket || !covers_prefix(&a.prefix, &b.prefix) {
        return false;
    }
    let mut key = a.key;
    for segment in segments_below(&a.prefix, &b.prefix) {
        key = derive_child_key(&key, segment);
    }
    key == b.key
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn root_encryptor(bucket: &str) -> (AccessGrant, GrantEncryptor) {
        let grant = AccessGrant::root(Uuid::new_v4(), &[bucket]);
        let enc = GrantEncryptor::new(&grant);
        (grant, enc)
    }

    #[test]
    fn path_round_trip() {
        let (_, enc) = root_encryptor("b");
        let sealed = enc.encrypt_path("b", "photos/2024/cat.jpg").unwrap();
        assert_ne!(sealed, "photos/2024/cat.jpg");
        assert_eq!(enc.decrypt_path("b", &sealed).unwrap(), "photos/2024/cat.jpg");
    }

    #[test]
    fn path_encryption_is_deterministic_and_composes() {
        let (_, enc) = root_encryptor("b");
        let full = enc.encrypt_path("b", "a/b/c").unwrap();
        let prefix = enc.encrypt_path("b", "a/b").unwrap();
        assert!(full.starts_with(&format!("{prefix}/")));
        assert_eq!(full, enc.encrypt_path("b", "a/b/c").unwrap());
    }

    #[test]
    fn restricted_grant_decrypts_within_scope_only() {
        let (root, root_enc) = root_encryptor("b");
        let sub = root.restricted(&[("b", "photos")]).unwrap();
        let sub_enc = GrantEncryptor::new(&sub);

        let inside = root_enc.encrypt_path("b", "photos/cat.jpg").unwrap();
        assert_eq!(sub_enc.encrypt_path("b", "photos/cat.jpg").unwrap(), inside);
        assert_eq!(sub_enc.decrypt_path("b", &inside).unwrap(), "photos/cat.jpg");

        let outside = root_enc.encrypt_path("b", "videos/dog.mp4").unwrap();
        assert!(sub_enc.decrypt_path("b", &outside).is_err());
        assert!(sub_enc.encrypt_path("b", "videos/dog.mp4").is_err());
    }

    #[test]
    fn unrelated_grant_cannot_decrypt() {
        let (_, enc_a) = root_encryptor("b");
        let (_, enc_b) = root_encryptor("b");
        let sealed = enc_a.encrypt_path("b", "foo/bar").unwrap();
        assert!(enc_b.decrypt_path("b", &sealed).is_err());
    }

    #[test]
    fn metadata_round_trip() {
        let (_, enc) = root_encryptor("b");
        let clear = json!({"foo": "456", "n": 2, "tags": ["tag1", "tag3"]});
        let mut meta = ObjectMetadata {
            clear: Some(clear.as_object().unwrap().clone()),
            ..Default::default()
        };

        enc.encrypt_metadata("b", "foo.txt", &mut meta).unwrap();
        assert!(!meta.encrypted_blob.is_empty());
        assert!(!meta.encrypted_key.is_empty());

        let mut opened = ObjectMetadata {
            encrypted_nonce: meta.encrypted_nonce.clone(),
            encrypted_blob: meta.encrypted_blob.clone(),
            encrypted_key: meta.encrypted_key.clone(),
            clear: None,
        };
        enc.decrypt_metadata("b", "foo.txt", &mut opened).unwrap();
        assert_eq!(serde_json::Value::Object(opened.clear.unwrap()), clear);
    }

    #[test]
    fn metadata_decrypt_fails_for_wrong_path_or_grant() {
        let (_, enc) = root_encryptor("b");
        let (_, other) = root_encryptor("b");
        let mut meta = ObjectMetadata {
            clear: Some(json!({"k": "v"}).as_object().unwrap().clone()),
            ..Default::default()
        };
        enc.encrypt_metadata("b", "foo.txt", &mut meta).unwrap();

        let mut wrong_path = meta.clone();
        assert!(enc.decrypt_metadata("b", "bar.txt", &mut wrong_path).is_err());
        let mut wrong_grant = meta.clone();
        assert!(other.decrypt_metadata("b", "foo.txt", &mut wrong_grant).is_err());
    }

    #[test]
    fn empty_blob_yields_no_clear_metadata() {
        let (_, enc) = root_encryptor("b");
        let mut meta = ObjectMetadata::default();
        enc.decrypt_metadata("b", "foo.txt", &mut meta).unwrap();
        assert!(meta.clear.is_none());
    }

    #[test]
    fn compare_lattice() {
        let (root, root_enc) = root_encryptor("b");
        let sub = GrantEncryptor::new(&root.restricted(&[("b", "photos")]).unwrap());
        let sub2 = GrantEncryptor::new(&root.restricted(&[("b", "videos")]).unwrap());
        let same = GrantEncryptor::new(&root);

        assert_eq!(root_enc.compare(&same), CapabilityOrdering::Identical);
        assert_eq!(sub.compare(&root_enc), CapabilityOrdering::Subset);
        assert_eq!(root_enc.compare(&sub), CapabilityOrdering::Superset);
        assert_eq!(sub.compare(&sub2), CapabilityOrdering::Disjoint);

        let (_, stranger) = root_encryptor("b");
        assert_eq!(root_enc.compare(&stranger), CapabilityOrdering::Disjoint);
    }

    #[test]
    fn compare_handles_multi_scope_supersets() {
        let (root, _) = root_encryptor("b");
        let narrow = GrantEncryptor::new(&root.restricted(&[("b", "2")]).unwrap());
        let wide = GrantEncryptor::new(&root.restricted(&[("b", "2"), ("b", "3")]).unwrap());

        assert_eq!(wide.compare(&narrow), CapabilityOrdering::Superset);
        assert_eq!(narrow.compare(&wide), CapabilityOrdering::Subset);
    }
}
