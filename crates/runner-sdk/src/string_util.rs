use anyhow::Result;
use serde::Serialize;

/// String helpers.
pub struct StringUtil;

impl StringUtil {
    /// Serialize a value to a pretty-printed JSON string.
    pub fn convert_to_json<T: Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string_pretty(value)?)
    }

    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"$true"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"$false"` (case-insensitive).
    /// Returns `None` for unrecognized values.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "$true" => Some(true),
            "0" | "false" | "$false" => Some(false),
            _ => None,
        }
    }

    /// Truncate `value` to at most `max_chars` characters.
    pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
        match value.char_indices().nth(max_chars) {
            Some((idx, _)) => &value[..idx],
            None => value,
        }
    }

    /// Split on CR and LF, dropping empty pieces.
    pub fn split_lines(value: &str) -> impl Iterator<Item = &str> {
        value.split(['\r', '\n']).filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_to_bool_values() {
        assert_eq!(StringUtil::convert_to_bool("TRUE"), Some(true));
        assert_eq!(StringUtil::convert_to_bool("1"), Some(true));
        assert_eq!(StringUtil::convert_to_bool("$false"), Some(false));
        assert_eq!(StringUtil::convert_to_bool(""), None);
        assert_eq!(StringUtil::convert_to_bool("yes"), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(StringUtil::truncate_chars("héllo", 2), "hé");
        assert_eq!(StringUtil::truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn convert_to_json_is_pretty() {
        let json = StringUtil::convert_to_json(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(json, "{\n  \"a\": 1\n}");
    }

    #[test]
    fn split_lines_skips_empty() {
        let parts: Vec<&str> = StringUtil::split_lines("a\r\nb\n\nc").collect();
        assert_eq!(parts, vec!["a", "b", "c"]);
    }
}
