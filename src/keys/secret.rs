//! API secret codec: the `pc_` prefix followed by a 32-hex per-key UUID.

use uuid::Uuid;

use super::sitekey::SITEKEY_LEN;
use super::{KeyError, KeyResult};

/// Prefix carried by every API secret.
pub const SECRET_PREFIX: &str = "pc_";

/// Render an API key's external ID as a secret string.
pub fn secret_from_uuid(id: &Uuid) -> String {
    format!("{}{}", SECRET_PREFIX, hex::encode(id.as_bytes()))
}

/// Parse an API secret back into the underlying UUID.
pub fn uuid_from_secret(secret: &str) -> KeyResult<Uuid> {
    let body = secret
        .strip_prefix(SECRET_PREFIX)
        .ok_or(KeyError::InvalidSecret)?;
    if body.len() != SITEKEY_LEN {
        return Err(KeyError::InvalidSecret);
    }
    let mut bytes = [0u8; 16];
    hex::decode_to_slice(body, &mut bytes).map_err(|_| KeyError::InvalidSecret)?;
    Ok(Uuid::from_bytes(bytes))
}

/// Whether a string has the shape of an API secret.
pub fn is_valid_secret(secret: &str) -> bool {
    uuid_from_secret(secret).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip() {
        let id = Uuid::new_v4();
        let secret = secret_from_uuid(&id);
        assert!(secret.starts_with(SECRET_PREFIX));
        assert_eq!(uuid_from_secret(&secret).unwrap(), id);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(uuid_from_secret(""), Err(KeyError::InvalidSecret));
        assert_eq!(
            uuid_from_secret("aaaaaaaabbbbccccddddeeeeeeeeeeee"),
            Err(KeyError::InvalidSecret)
        );
        assert_eq!(uuid_from_secret("pc_tooshort"), Err(KeyError::InvalidSecret));
        assert_eq!(
            uuid_from_secret("pc_aaaaaaaabbbbccccddddeeeeeeeeeeeZ"),
            Err(KeyError::InvalidSecret)
        );
    }

    proptest! {
        #[test]
        fn prop_round_trip(bytes: [u8; 16]) {
            let id = Uuid::from_bytes(bytes);
            prop_assert_eq!(uuid_from_secret(&secret_from_uuid(&id)).unwrap(), id);
        }
    }
}
