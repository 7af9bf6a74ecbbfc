//! Access grants and decryption capabilities for Keyhole.
//!
//! An access grant is the opaque bearer credential carried by clients. The
//! server-side projection of a grant is a *capability*: something that can
//! encrypt and decrypt object paths and metadata blobs for the key scopes the
//! grant covers, and that can be compared against other capabilities on a
//! subset/superset lattice. Capabilities for a project are pooled in a
//! [`CapabilityRepository`] which the migration engine fans out over when
//! decrypting externally-written objects.

pub mod caps;
pub mod encryptor;
pub mod error;
pub mod grant;

pub use caps::CapabilityRepository;
pub use encryptor::{CapabilityOrdering, Encryptor, GrantEncryptor};
pub use error::{AccessError, AccessResult};
pub use grant::{AccessGrant, Action, ScopedKey};
