//! Core domain types and shared logic for Keyhole.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Object locations and the identity quadruple used for paging
//! - Object metadata in its encrypted and cleartext forms
//! - The shallow/deep metadata codec and the containment leaf splitter
//! - Opaque page tokens
//! - Configuration types

pub mod codec;
pub mod config;
pub mod error;
pub mod location;
pub mod page_token;

pub use codec::{split_to_leaves, to_deep, to_shallow};
pub use error::{Error, Result};
pub use location::{JsonMap, ObjectInfo, ObjectLocation, ObjectMetadata};
pub use page_token::{format_page_token, parse_page_token};
