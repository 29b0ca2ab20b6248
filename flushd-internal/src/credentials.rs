use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Credential fields an application can be identified with. Anything else is discarded.
pub const FIELDS: [&str; 6] = [
    "app_id",
    "app_key",
    "referrer",
    "user_id",
    "user_key",
    "access_token",
];

const ESCAPE: char = '\\';
const PAIR_SEPARATOR: char = ',';
const FIELD_SEPARATOR: char = ':';

/// The set of credential fields identifying an application against a service.
///
/// Fields are kept ordered by name, so two `Credentials` built from the same
/// pairs always produce the same canonical string, regardless of input order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials {
    creds: BTreeMap<String, String>,
}

impl Credentials {
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let creds = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| FIELDS.contains(&k.as_str()))
            .collect();
        Self { creds }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.creds.get(field).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.creds.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.creds.is_empty()
    }

    /// OAuth applications are identified by an access token.
    pub fn is_oauth(&self) -> bool {
        self.creds.contains_key("access_token")
    }

    /// Canonical `field:value,field:value` form, sorted by field name, with
    /// separators inside values escaped.
    pub fn to_sorted_escaped_string(&self) -> String {
        self.creds
            .iter()
            .map(|(field, value)| format!("{}:{}", escape(field), escape(value)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the canonical form produced by [`Credentials::to_sorted_escaped_string`].
    ///
    /// Pairs without a field separator are skipped.
    pub fn from_escaped(s: &str) -> Self {
        let pairs = split_unescaped(s, PAIR_SEPARATOR)
            .into_iter()
            .filter_map(|pair| {
                let mut parts = split_unescaped(pair, FIELD_SEPARATOR).into_iter();
                let field = parts.next()?;
                // Only the first unescaped separator splits field from value
                let value_start = field.len() + FIELD_SEPARATOR.len_utf8();
                let value = pair.get(value_start..)?;
                parts.next()?;
                Some((unescape(field), unescape(value)))
            });
        Self::new(pairs)
    }
}

impl Display for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sorted_escaped_string())
    }
}

fn is_escapable(c: char) -> bool {
    c == PAIR_SEPARATOR || c == FIELD_SEPARATOR || c == ESCAPE
}

/// Escape the pair and field separators, and the backslash itself, with a backslash.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if is_escapable(c) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Reverse [`escape`]. A backslash not followed by an escapable character is kept as is.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            if let Some(&next) = chars.peek() {
                if is_escapable(next) {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Split `s` on every occurrence of `sep` that is not escaped.
/// The returned parts are still escaped.
pub fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (idx, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == ESCAPE {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..idx]);
            start = idx + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_are_discarded() {
        let creds = Credentials::new([("app_id", "a1"), ("app_key", "k1"), ("color", "red")]);
        assert_eq!(creds.get("app_id"), Some("a1"));
        assert_eq!(creds.get("color"), None);
        assert_eq!(creds.iter().count(), 2);
    }

    #[test]
    fn test_sorted_escaped_string() {
        let creds = Credentials::new([("user_key", "uk"), ("app_id", "a,b:c")]);
        assert_eq!(
            creds.to_sorted_escaped_string(),
            "app_id:a\\,b\\:c,user_key:uk"
        );
    }

    #[test]
    fn test_equal_regardless_of_insertion_order() {
        let a = Credentials::new([("app_id", "a"), ("app_key", "k")]);
        let b = Credentials::new([("app_key", "k"), ("app_id", "a")]);
        assert_eq!(a, b);
        assert_eq!(a.to_sorted_escaped_string(), b.to_sorted_escaped_string());
    }

    #[test]
    fn test_from_escaped_with_special_chars() {
        let creds = Credentials::new([
            ("app_id", "id:with,separators"),
            ("app_key", "plain"),
            ("referrer", "back\\slash"),
        ]);
        let parsed = Credentials::from_escaped(&creds.to_sorted_escaped_string());
        assert_eq!(parsed, creds);
        assert_eq!(parsed.get("referrer"), Some("back\\slash"));
    }

    #[test]
    fn test_from_escaped_skips_pairs_without_separator() {
        let parsed = Credentials::from_escaped("app_id:a,garbage,user_key:uk");
        assert_eq!(parsed, Credentials::new([("app_id", "a"), ("user_key", "uk")]));
    }

    #[test]
    fn test_is_oauth() {
        assert!(Credentials::new([("access_token", "t")]).is_oauth());
        assert!(!Credentials::new([("app_id", "a")]).is_oauth());
    }

    #[test]
    fn test_split_unescaped() {
        assert_eq!(split_unescaped("a,b\\,c,d", ','), vec!["a", "b\\,c", "d"]);
        assert_eq!(split_unescaped("", ','), vec![""]);
        assert_eq!(unescape("b\\,c\\:d\\e"), "b,c:d\\e");
        // An escaped backslash does not escape the separator after it
        assert_eq!(split_unescaped("x\\\\,y", ','), vec!["x\\\\", "y"]);
        assert_eq!(unescape("x\\\\"), "x\\");
    }

    #[test]
    fn test_value_ending_in_backslash_round_trips() {
        let creds = Credentials::new([("app_id", "x\\"), ("app_key", "k:\\")]);
        let escaped = creds.to_sorted_escaped_string();
        assert_eq!(escaped, "app_id:x\\\\,app_key:k\\:\\\\");
        assert_eq!(Credentials::from_escaped(&escaped), creds);
    }
}
