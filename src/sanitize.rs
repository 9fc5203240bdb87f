//! Credential sanitization.
//!
//! Pasted-in credentials frequently carry zero-width or non-breaking spaces
//! that cause opaque "malformed credential" rejections from the object
//! store. Every boundary that accepts a credential field — on paste, on
//! decrypt-for-use, on re-encrypt — runs it back through [`sanitize`].

use crate::error::{BackupError, Result};

/// Strip leading/trailing whitespace, then remove every Unicode whitespace
/// or control codepoint anywhere in the string. Fails with
/// [`BackupError::InvalidCredential`] if the result is empty.
pub fn sanitize(field_name: &str, s: &str) -> Result<String> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();

    if cleaned.is_empty() {
        return Err(BackupError::InvalidCredential(field_name.to_string()));
    }

    Ok(cleaned)
}

/// Endpoints and other host-like fields are only leading/trailing trimmed;
/// interior characters (including dots in domain names) are preserved.
pub fn sanitize_endpoint(field_name: &str, s: &str) -> Result<String> {
    let trimmed = s.trim().to_string();
    if trimmed.is_empty() {
        return Err(BackupError::InvalidCredential(field_name.to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_interior_whitespace_and_control_chars() {
        let dirty = "  AKIA\u{200b}EXAMPLE\u{0007}KEY  ";
        let clean = sanitize("access_key", dirty).unwrap();
        assert_eq!(clean, "AKIAEXAMPLEKEY");
        assert!(!clean.chars().any(|c| c.is_whitespace() || c.is_control()));
    }

    #[test]
    fn empty_after_cleaning_fails() {
        let err = sanitize("secret_key", "   \u{200b}\u{200b}  ").unwrap_err();
        assert!(matches!(err, BackupError::InvalidCredential(_)));
    }

    #[test]
    fn endpoint_keeps_interior_dots_and_dashes() {
        let endpoint = sanitize_endpoint("endpoint", "  s3.us-west-002.backblazeb2.com  ").unwrap();
        assert_eq!(endpoint, "s3.us-west-002.backblazeb2.com");
    }

    #[test]
    fn endpoint_rejects_blank() {
        assert!(sanitize_endpoint("endpoint", "   ").is_err());
    }
}
