//! Opaque page tokens.
//!
//! A token is the base64 encoding of a URL-encoded form carrying the four
//! identity fields of the last-seen object. Tokens are reversible but opaque
//! to clients; a malformed token is a bad request.

use crate::error::{Error, Result};
use crate::location::ObjectLocation;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashMap;
use uuid::Uuid;

/// Encode the identity quadruple of `loc` into an opaque page token.
pub fn format_page_token(loc: &ObjectLocation) -> String {
    let form = form_urlencoded::Serializer::new(String::new())
        .append_pair("projectID", &loc.project_id.to_string())
        .append_pair("bucketName", &loc.bucket)
        .append_pair("objectKey", &loc.object_key)
        .append_pair("version", &loc.version.to_string())
        .finish();
    STANDARD.encode(form)
}

/// Decode a page token back into an object location.
pub fn parse_page_token(token: &str) -> Result<ObjectLocation> {
    let bytes = STANDARD
        .decode(token)
        .map_err(|_| Error::InvalidPageToken("not base64".to_string()))?;

    let fields: HashMap<String, String> = form_urlencoded::parse(&bytes)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let project_id = fields
        .get("projectID")
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| Error::InvalidPageToken("invalid projectID".to_string()))?;

    let bucket = fields
        .get("bucketName")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidPageToken("invalid bucketName".to_string()))?
        .clone();

    let object_key = fields
        .get("objectKey")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidPageToken("invalid objectKey".to_string()))?
        .clone();

    let version = fields
        .get("version")
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| Error::InvalidPageToken("invalid version".to_string()))?;

    Ok(ObjectLocation {
        project_id,
        bucket,
        object_key,
        version,
    })
}
