//! User and room name validation.
//!
//! Names end up inside composite store keys and transport channel names
//! (`echo:<user>`), so the key delimiters `:`, `{` and `}` are rejected along
//! with C0 controls and DEL.

use crate::error::ChatError;

/// Returns true if `c` may appear in a user or room name.
#[inline]
fn is_name_char(c: char) -> bool {
    !matches!(c, '\u{0000}'..='\u{001F}' | '\u{007F}' | ':' | '{' | '}')
}

/// Check whether `name` is a valid user or room name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_name_char)
}

/// Validate a name, failing with [`ChatError::InvalidName`].
pub fn validate_name(name: &str) -> Result<(), ChatError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ChatError::InvalidName(name.to_string()))
    }
}

/// Validate every name in `names`, failing on the first invalid one.
pub fn validate_names<S: AsRef<str>>(names: &[S]) -> Result<(), ChatError> {
    names.iter().try_for_each(|n| validate_name(n.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_ordinary_names() {
        assert!(is_valid_name("alice"));
        assert!(is_valid_name("room with spaces"));
        assert!(is_valid_name("ключ"));
        assert!(is_valid_name("#general"));
    }

    #[test]
    fn rejects_delimiters_and_controls() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("echo:alice"));
        assert!(!is_valid_name("{room}"));
        assert!(!is_valid_name("tab\there"));
        assert!(!is_valid_name("del\u{7f}"));
        assert_eq!(
            validate_name("a:b"),
            Err(ChatError::InvalidName("a:b".to_string()))
        );
    }

    #[test]
    fn validates_lists() {
        assert!(validate_names(&["bob", "carol"]).is_ok());
        assert_eq!(
            validate_names(&["bob", "x}"]),
            Err(ChatError::InvalidName("x}".to_string()))
        );
    }

    proptest! {
        #[test]
        fn names_without_forbidden_chars_are_valid(name in "[^\\x00-\\x1F\\x7F:{}]{1,32}") {
            prop_assert!(is_valid_name(&name));
        }

        #[test]
        fn any_forbidden_char_invalidates(
            prefix in "[a-z]{0,8}",
            bad in prop::sample::select(vec!['\u{0}', '\n', '\u{1F}', '\u{7F}', ':', '{', '}']),
            suffix in "[a-z]{0,8}",
        ) {
            let name = format!("{prefix}{bad}{suffix}");
            prop_assert!(!is_valid_name(&name));
        }
    }
}
