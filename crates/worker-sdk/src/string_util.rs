/// String helpers used across the worker crates.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"yes"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"no"` (case-insensitive).
    /// Returns `None` for anything else, including the empty string.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        }
    }

    /// Return `line` terminated by exactly the newline the caller supplied, or
    /// with a single `\n` appended when it had none.
    pub fn ensure_trailing_newline(line: impl Into<String>) -> String {
        let mut line = line.into();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        line
    }

    /// Replace characters that are invalid in file names with `_`.
    ///
    /// Covers `< > : " / \ | ? *` and ASCII control characters, plus a leading
    /// `.` so a name can never resolve to `.` or `..`.
    pub fn format_into_safe_filename(name: &str) -> String {
        const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
        let mut result: String = name
            .chars()
            .map(|ch| {
                if INVALID.contains(&ch) || (ch as u32) < 0x20 {
                    '_'
                } else {
                    ch
                }
            })
            .collect();
        if result.starts_with('.') {
            result.replace_range(0..1, "_");
        }
        result
    }

    /// Turn a parameter key such as `build.git-branch` into an environment
    /// variable name (`BUILD_GIT_BRANCH`).
    pub fn to_env_name(key: &str) -> String {
        key.chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    ch.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_to_bool_values() {
        assert_eq!(StringUtil::convert_to_bool("TRUE"), Some(true));
        assert_eq!(StringUtil::convert_to_bool(" 1 "), Some(true));
        assert_eq!(StringUtil::convert_to_bool("no"), Some(false));
        assert_eq!(StringUtil::convert_to_bool(""), None);
        assert_eq!(StringUtil::convert_to_bool("maybe"), None);
    }

    #[test]
    fn trailing_newline_is_added_once() {
        assert_eq!(StringUtil::ensure_trailing_newline("hello"), "hello\n");
        assert_eq!(StringUtil::ensure_trailing_newline("hello\n"), "hello\n");
        assert_eq!(StringUtil::ensure_trailing_newline(""), "\n");
    }

    #[test]
    fn safe_filename() {
        assert_eq!(StringUtil::format_into_safe_filename("a/b:c"), "a_b_c");
        assert_eq!(StringUtil::format_into_safe_filename(".."), "_.");
        assert_eq!(StringUtil::format_into_safe_filename("v1.2"), "v1.2");
    }

    #[test]
    fn env_name() {
        assert_eq!(StringUtil::to_env_name("build.git-branch"), "BUILD_GIT_BRANCH");
        assert_eq!(StringUtil::to_env_name("path"), "PATH");
    }
}
