//! Email masking for logs and operator-facing output.

/// How many leading characters of a local part stay visible.
fn keep_len(len: usize) -> usize {
    (len / 2).clamp(1, 5)
}

/// Mask the local part of an email address.
///
/// Keeps roughly the first half of the local part (at most 5 characters),
/// replaces the rest with `x`, and abbreviates masks longer than 5 with `..`.
pub fn mask_email(email: &str) -> String {
    let (local, rest) = match email.split_once('@') {
        Some((local, rest)) => (local, Some(rest)),
        None => (email, None),
    };
    if local.is_empty() {
        return email.to_string();
    }

    let keep = keep_len(local.chars().count());
    let masked = local.chars().count() - keep;
    let mut out: String = local.chars().take(keep).collect();
    for _ in 0..masked.min(5) {
        out.push('x');
    }
    if masked > 5 {
        out.push_str("..");
    }
    if let Some(rest) = rest {
        out.push('@');
        out.push_str(rest);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_lengths() {
        for (len, expected) in [(1, 1), (2, 1), (3, 1), (4, 2), (5, 2), (6, 3), (7, 3), (15, 5)] {
            assert_eq!(keep_len(len), expected, "local-part length {}", len);
        }
    }

    #[test]
    fn test_short_local_part_untouched() {
        assert_eq!(mask_email("1@bar.com"), "1@bar.com");
    }

    #[test]
    fn test_masking() {
        assert_eq!(mask_email("1234@bar.com"), "12xx@bar.com");
        assert_eq!(mask_email("12@bar.com"), "1x@bar.com");
    }

    #[test]
    fn test_long_mask_abbreviated() {
        assert_eq!(mask_email("123456789012345@bar.com"), "12345xxxxx..@bar.com");
    }

    #[test]
    fn test_no_at_sign() {
        assert_eq!(mask_email("nobody"), "nobxxx");
        assert_eq!(mask_email(""), "");
    }
}
