//! # External Identifier Codecs
//!
//! Opaque identifiers crossing the API boundary:
//! - Site keys: lower-case hex of a 16-byte UUID, length 32
//! - API secrets: the `pc_` prefix followed by a 32-hex UUID
//! - Obfuscated numeric IDs via a salted hashids encoding

use thiserror::Error;

pub mod hasher;
pub mod secret;
pub mod sitekey;

pub use hasher::IdHasher;
pub use secret::{is_valid_secret, secret_from_uuid, uuid_from_secret, SECRET_PREFIX};
pub use sitekey::{is_valid_sitekey, sitekey_from_uuid, uuid_from_sitekey, SITEKEY_LEN};

/// Errors produced by the identifier codecs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The site key has the wrong length or charset.
    #[error("invalid site key")]
    InvalidSiteKey,

    /// The API secret has the wrong prefix, length, or charset.
    #[error("invalid API secret")]
    InvalidSecret,

    /// The obfuscated identifier decoded to an unexpected number of values.
    #[error("unexpected identifier length: {0}")]
    UnexpectedLength(usize),

    /// The obfuscated identifier could not be decoded at all.
    #[error("undecodable identifier")]
    Undecodable,
}

/// Result type for codec operations.
pub type KeyResult<T> = Result<T, KeyError>;
