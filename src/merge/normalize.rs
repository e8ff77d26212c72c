//! Canonical forms for patient identity fields.
//!
//! Everything here is pure. Input that cannot be normalized is handed back
//! unchanged so that callers decide whether it is usable as a match key.

/// Lower-case and collapse every run of whitespace into a single space.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds the comparable full name from the split name columns.
pub fn normalize_full_name(first_name: &str, last_name: &str) -> String {
    normalize_name(&format!("{first_name} {last_name}"))
}

/// Digits only. A value without a single digit is returned trimmed but
/// otherwise untouched.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        raw.trim().to_string()
    } else {
        digits
    }
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// True when a normalized phone is usable as an exact-match key.
pub fn is_phone_key(normalized: &str) -> bool {
    !normalized.is_empty() && normalized.chars().all(|c| c.is_ascii_digit())
}

/// True when a normalized email is usable as an exact-match key.
pub fn is_email_key(normalized: &str) -> bool {
    normalized.len() > 2 && normalized.contains('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_lowercased_and_collapsed() {
        assert_eq!(normalize_name("  Maria   GARCIA\tLopez "), "maria garcia lopez");
        assert_eq!(normalize_name(""), "");
        assert_eq!(normalize_full_name(" Ana ", "  Ruiz"), "ana ruiz");
    }

    #[test]
    fn phone_keeps_only_digits() {
        assert_eq!(normalize_phone("+1 (555) 123-4567"), "15551234567");
        assert_eq!(normalize_phone("555.1234"), "5551234");
        assert!(is_phone_key(&normalize_phone("555 1234")));
    }

    #[test]
    fn malformed_phone_passes_through() {
        assert_eq!(normalize_phone("  n/a "), "n/a");
        assert!(!is_phone_key(&normalize_phone("n/a")));
        assert!(!is_phone_key(&normalize_phone("")));
    }

    #[test]
    fn email_is_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  Maria.Garcia@Example.COM "), "maria.garcia@example.com");
        assert!(is_email_key("a@b"));
        assert!(!is_email_key("not-an-email"));
        assert!(!is_email_key(""));
    }
}
