//! Name validators for user-facing labels.

use crate::db::{StoreError, StoreResult};

const MAX_NAME_LEN: usize = 255;

fn validate_name(name: &str, extra: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidInput("name is empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(StoreError::InvalidInput(format!(
            "name is longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    for c in name.chars() {
        if c.is_alphanumeric() || c.is_whitespace() || extra.contains(c) {
            continue;
        }
        return Err(StoreError::InvalidInput(format!(
            "name contains forbidden character {:?}",
            c
        )));
    }
    Ok(())
}

/// Validate an organization name.
pub fn validate_org_name(name: &str) -> StoreResult<()> {
    validate_name(name, "'-_&.:()[]")
}

/// Validate a property name. Same rules as organizations minus `&`.
pub fn validate_property_name(name: &str) -> StoreResult<()> {
    validate_name(name, "'-_.:()[]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_reasonable_names() {
        for name in ["Acme Corp", "R&D (internal)", "a.b:c [x] - _ 'quoted'"] {
            assert!(validate_org_name(name).is_ok(), "{}", name);
        }
        assert!(validate_property_name("landing-page v2").is_ok());
    }

    #[test]
    fn test_rejects_empty_and_too_long() {
        assert!(validate_org_name("").is_err());
        assert!(validate_org_name(&"x".repeat(256)).is_err());
        assert!(validate_org_name(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn test_rejects_forbidden_characters() {
        assert!(validate_org_name("bad\u{0}name").is_err());
        assert!(validate_org_name("semi;colon").is_err());
        assert!(validate_org_name("slash/name").is_err());
    }

    #[test]
    fn test_property_names_reject_ampersand() {
        assert!(validate_org_name("R&D").is_ok());
        assert!(validate_property_name("R&D").is_err());
    }

    #[test]
    fn test_unicode_letters_are_allowed() {
        assert!(validate_org_name("Büro München").is_ok());
    }
}
