//! Site key codec: 32 lower-case hex characters derived from a 16-byte UUID.

use uuid::Uuid;

use super::{KeyError, KeyResult};

/// Length of a site key in characters.
pub const SITEKEY_LEN: usize = 32;

/// Render a property's external ID as a site key.
pub fn sitekey_from_uuid(id: &Uuid) -> String {
    hex::encode(id.as_bytes())
}

/// Parse a site key back into the underlying UUID.
pub fn uuid_from_sitekey(sitekey: &str) -> KeyResult<Uuid> {
    if !is_valid_sitekey(sitekey) {
        return Err(KeyError::InvalidSiteKey);
    }
    let mut bytes = [0u8; 16];
    hex::decode_to_slice(sitekey, &mut bytes).map_err(|_| KeyError::InvalidSiteKey)?;
    Ok(Uuid::from_bytes(bytes))
}

/// A site key is exactly 32 characters from `[0-9a-fA-F]`.
pub fn is_valid_sitekey(sitekey: &str) -> bool {
    sitekey.len() == SITEKEY_LEN && sitekey.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip() {
        let id = Uuid::new_v4();
        let sitekey = sitekey_from_uuid(&id);
        assert_eq!(sitekey.len(), SITEKEY_LEN);
        assert_eq!(uuid_from_sitekey(&sitekey).unwrap(), id);
    }

    #[test]
    fn test_upper_case_accepted() {
        let id = Uuid::new_v4();
        let sitekey = sitekey_from_uuid(&id).to_uppercase();
        assert!(is_valid_sitekey(&sitekey));
        assert_eq!(uuid_from_sitekey(&sitekey).unwrap(), id);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(!is_valid_sitekey(""));
        assert!(!is_valid_sitekey("aaaaaaaabbbbccccddddeeeeeeeeeee")); // 31 chars
        assert!(!is_valid_sitekey("aaaaaaaabbbbccccddddeeeeeeeeeeeZ"));
        assert_eq!(uuid_from_sitekey("nope"), Err(KeyError::InvalidSiteKey));
    }

    proptest! {
        #[test]
        fn prop_round_trip(bytes: [u8; 16]) {
            let id = Uuid::from_bytes(bytes);
            prop_assert_eq!(uuid_from_sitekey(&sitekey_from_uuid(&id)).unwrap(), id);
        }
    }
}
