//! Obfuscated numeric identifiers.
//!
//! Numeric row IDs are exposed to browsers through a salted hashids encoding
//! with a minimum length of 10. Without a salt the hasher degrades to plain
//! decimal formatting, which keeps development setups working.

use harsh::Harsh;

use super::{KeyError, KeyResult};

/// Minimum length of an encoded identifier.
const MIN_LENGTH: usize = 10;

/// Salted identifier obfuscator with a decimal fallback.
pub struct IdHasher {
    harsh: Option<Harsh>,
}

impl IdHasher {
    /// Build a hasher. An empty salt disables obfuscation entirely.
    pub fn new(salt: &str) -> Self {
        let harsh = if salt.is_empty() {
            None
        } else {
            match Harsh::builder().salt(salt).length(MIN_LENGTH).build() {
                Ok(h) => Some(h),
                Err(e) => {
                    log::warn!("identifier hasher disabled: {}", e);
                    None
                }
            }
        };
        Self { harsh }
    }

    /// Encode a numeric ID. Falls back to decimal when no salt is configured.
    pub fn encode(&self, id: i64) -> String {
        match &self.harsh {
            Some(h) => h.encode(&[id as u64]),
            None => id.to_string(),
        }
    }

    /// Decode an external identifier back to the numeric ID.
    ///
    /// A ciphertext that decodes to more than one value is rejected with
    /// [`KeyError::UnexpectedLength`].
    pub fn decode(&self, encoded: &str) -> KeyResult<i64> {
        match &self.harsh {
            Some(h) => {
                let values = h.decode(encoded).map_err(|_| KeyError::Undecodable)?;
                if values.len() != 1 {
                    return Err(KeyError::UnexpectedLength(values.len()));
                }
                Ok(values[0] as i64)
            }
            None => encoded.parse().map_err(|_| KeyError::Undecodable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip_salted() {
        let hasher = IdHasher::new("pepper");
        let encoded = hasher.encode(42);
        assert!(encoded.len() >= MIN_LENGTH);
        assert_ne!(encoded, "42");
        assert_eq!(hasher.decode(&encoded).unwrap(), 42);
    }

    #[test]
    fn test_decimal_fallback() {
        let hasher = IdHasher::new("");
        assert_eq!(hasher.encode(1337), "1337");
        assert_eq!(hasher.decode("1337").unwrap(), 1337);
        assert_eq!(hasher.decode("x"), Err(KeyError::Undecodable));
    }

    #[test]
    fn test_garbage_rejected() {
        let hasher = IdHasher::new("pepper");
        assert!(hasher.decode("!!!").is_err());
    }

    #[test]
    fn test_salts_differ() {
        let a = IdHasher::new("salt-a");
        let b = IdHasher::new("salt-b");
        assert_ne!(a.encode(7), b.encode(7));
    }

    proptest! {
        #[test]
        fn prop_round_trip(id in 0i64..i64::MAX) {
            let hasher = IdHasher::new("pepper");
            prop_assert_eq!(hasher.decode(&hasher.encode(id)).unwrap(), id);
        }
    }
}
