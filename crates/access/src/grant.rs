//! Serialized access grants.
//!
//! A grant is a base64url payload carrying the project ID, the set of allowed
//! actions, and a store of path-scoped encryption keys. Grants are minted by
//! the client tooling; the server only parses them. Restricting a grant
//! derives new scoped keys along the path so that a restricted grant compares
//! as a strict subset of its parent.

use crate::encryptor::{derive_child_key, seal_segment};
use crate::error::{AccessError, AccessResult};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Length of a scoped root key in bytes.
pub const KEY_SIZE: usize = 32;

/// An action a grant may permit on object metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Query,
    Write,
    Delete,
}

/// A path-scoped encryption key.
///
/// `prefix` is the cleartext path prefix the key is rooted at (empty for the
/// bucket root); `encrypted_prefix` is its encrypted form, fixed when the key
/// was derived, so encrypted paths compose without re-deriving the parent
/// chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedKey {
    pub bucket: String,
    pub prefix: String,
    pub encrypted_prefix: String,
    #[serde(with = "serde_key")]
    pub key: [u8; KEY_SIZE],
}

mod serde_key {
    use super::KEY_SIZE;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; KEY_SIZE], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; KEY_SIZE], D::Error> {
        let s = String::deserialize(de)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("key must be 32 bytes"))
    }
}

/// A parsed access grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub project_id: Uuid,
    pub actions: BTreeSet<Action>,
    pub keys: Vec<ScopedKey>,
}

impl AccessGrant {
    /// Mint a grant with a fresh random root key for each named bucket,
    /// permitting every action. Used by client tooling and tests.
    pub fn root(project_id: Uuid, buckets: &[&str]) -> Self {
        let keys = buckets
            .iter()
            .map(|bucket| {
                let mut key = [0u8; KEY_SIZE];
                rand::rngs::OsRng.fill_bytes(&mut key);
                ScopedKey {
                    bucket: bucket.to_string(),
                    prefix: String::new(),
                    encrypted_prefix: String::new(),
                    key,
                }
            })
            .collect();

        Self {
            project_id,
            actions: BTreeSet::from([Action::Read, Action::Query, Action::Write, Action::Delete]),
            keys,
        }
    }

    /// Derive a grant restricted to the given `(bucket, path prefix)` scopes.
    ///
    /// Each scope must be covered by one of this grant's keys; the restricted
    /// key is the parent key derived along the extra path segments, so the
    /// result compares as a subset of `self`.
    pub fn restricted(&self, scopes: &[(&str, &str)]) -> AccessResult<Self> {
        let mut keys = Vec::with_capacity(scopes.len());
        for (bucket, prefix) in scopes {
            let parent = self
                .keys
                .iter()
                .filter(|k| k.bucket == *bucket && covers_prefix(&k.prefix, prefix))
                .max_by_key(|k| k.prefix.len())
                .ok_or_else(|| AccessError::PathNotCovered((*prefix).to_string()))?;

            let mut key = parent.key;
            let mut encrypted_prefix = parent.encrypted_prefix.clone();
            for segment in segments_below(&parent.prefix, prefix) {
                let sealed = seal_segment(&key, segment);
                if !encrypted_prefix.is_empty() {
                    encrypted_prefix.push('/');
                }
                encrypted_prefix.push_str(&sealed);
                key = derive_child_key(&key, segment);
            }

            keys.push(ScopedKey {
                bucket: bucket.to_string(),
                prefix: (*prefix).to_string(),
                encrypted_prefix,
                key,
            });
        }

        Ok(Self {
            project_id: self.project_id,
            actions: self.actions.clone(),
            keys,
        })
    }

    /// Restrict the set of allowed actions.
    pub fn with_actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions = actions.into_iter().collect();
        self
    }

    /// Serialize into the opaque bearer form.
    pub fn serialize(&self) -> String {
        let payload = serde_json::to_vec(self).expect("grant serialization is infallible");
        URL_SAFE_NO_PAD.encode(payload)
    }

    /// Parse the opaque bearer form.
    pub fn parse(raw: &str) -> AccessResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|_| AccessError::InvalidGrant("not base64".to_string()))?;
        let grant: AccessGrant = serde_json::from_slice(&bytes)
            .map_err(|e| AccessError::InvalidGrant(e.to_string()))?;
        if grant.keys.is_empty() {
            return Err(AccessError::InvalidGrant("no encryption keys".to_string()));
        }
        Ok(grant)
    }

    /// Whether the grant permits `action`.
    pub fn allows(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }

    /// Whether the grant holds a bucket-root key for `bucket`.
    pub fn has_root_key(&self, bucket: &str) -> bool {
        self.keys
            .iter()
            .any(|k| k.bucket == bucket && k.prefix.is_empty())
    }
}

/// True if `parent` ("" or "a/b") is a path-prefix of `child`.
pub(crate) fn covers_prefix(parent: &str, child: &str) -> bool {
    parent.is_empty()
        || child == parent
        || (child.starts_with(parent) && child.as_bytes().get(parent.len()) == Some(&b'/'))
}

/// The path segments of `child` below `parent`; `parent` must cover `child`.
pub(crate) fn segments_below<'a>(parent: &str, child: &'a str) -> impl Iterator<Item = &'a str> {
    let rest = if parent.is_empty() {
        child
    } else {
        child[parent.len()..].trim_start_matches('/')
    };
    rest.split('/').filter(|s| !s.is_empty())
}
