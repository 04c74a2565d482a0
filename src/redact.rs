/// Redaction utilities for logging
///
/// Masks destination identities (chat ids, channel handles) so logs stay
/// useful for debugging without publishing where messages go.

/// Redact an identity, keeping only the last 4 characters visible.
/// A leading sign or `@` is kept so channel ids stay recognisable.
/// Example: "-1001234567890" -> "-*********7890"
pub fn identity(id: &str) -> String {
    let (prefix, rest) = match id.chars().next() {
        Some(c @ ('-' | '@')) => (c.to_string(), &id[c.len_utf8()..]),
        _ => (String::new(), id),
    };

    let chars: Vec<char> = rest.chars().collect();
    if chars.len() <= 4 {
        // Too short to meaningfully redact
        return format!("{}{}", prefix, "*".repeat(chars.len()));
    }

    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", prefix, "*".repeat(chars.len() - 4), visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_numeric_channel() {
        assert_eq!(identity("-1001234567890"), "-*********7890");
        assert_eq!(identity("123456789"), "*****6789");
    }

    #[test]
    fn test_identity_handle() {
        assert_eq!(identity("@sunset_channel"), "@**********nnel");
    }

    #[test]
    fn test_identity_short() {
        assert_eq!(identity("1234"), "****");
        assert_eq!(identity("-12"), "-**");
        assert_eq!(identity(""), "");
    }

    #[test]
    fn test_identity_unicode() {
        assert_eq!(identity("канал-приветствие"), "*************твие");
    }
}
