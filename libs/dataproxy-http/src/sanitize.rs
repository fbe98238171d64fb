//! Metric label sanitization.

use thiserror::Error;

/// Reasons a string cannot become a metric label value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanitizeError {
    #[error("label name cannot be empty")]
    Empty,
    #[error("label name only contains invalid chars: '{0}'")]
    NoValidChars(String),
}

/// Normalise an arbitrary name into a Prometheus-safe label value.
///
/// ASCII letters and `_` are kept, spaces become `_`, digits are kept unless
/// they would lead the result, and everything else is dropped. The output
/// only contains characters this function keeps unchanged, so sanitizing it
/// again returns it as is.
///
/// # Errors
/// Returns `SanitizeError` when the input is empty or nothing survives.
pub fn sanitize_label_name(name: &str) -> Result<String, SanitizeError> {
    if name.is_empty() {
        return Err(SanitizeError::Empty);
    }

    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '_' => out.push(c),
            '0'..='9' if !out.is_empty() => out.push(c),
            ' ' => out.push('_'),
            _ => {}
        }
    }

    if out.is_empty() {
        return Err(SanitizeError::NoValidChars(name.to_owned()));
    }
    Ok(out)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_replaces_spaces_and_drops_punctuation() {
        assert_eq!(sanitize_label_name("My DB!").unwrap(), "My_DB");
        assert_eq!(
            sanitize_label_name("prometheus-prod (eu)").unwrap(),
            "prometheusprod_eu"
        );
    }

    #[test]
    fn test_leading_digits_are_dropped() {
        assert_eq!(sanitize_label_name("1st source").unwrap(), "st_source");
        assert_eq!(sanitize_label_name("!9lives").unwrap(), "lives");
        assert_eq!(sanitize_label_name("db2").unwrap(), "db2");
    }

    #[test]
    fn test_rejects_empty_and_all_invalid() {
        assert_eq!(sanitize_label_name(""), Err(SanitizeError::Empty));
        assert_eq!(
            sanitize_label_name("123-!"),
            Err(SanitizeError::NoValidChars("123-!".to_owned()))
        );
        assert!(sanitize_label_name("\u{c4}\u{d6}\u{dc}").is_err());
    }

    #[test]
    fn test_idempotent() {
        for input in [
            "My DB!",
            "loki",
            "Elastic Search 7",
            "_1",
            "!1a",
            "\u{fc}n\u{ef}code name",
            "a  b",
            "x-y_z 9",
        ] {
            let once = sanitize_label_name(input).unwrap();
            let twice = sanitize_label_name(&once).unwrap();
            assert_eq!(once, twice, "sanitizing {input:?} twice changed the value");
        }
    }
}
