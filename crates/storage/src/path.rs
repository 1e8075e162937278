//! Path validation and sanitization.
//!
//! Destination paths are assembled from ticket metadata that we don't
//! control. [`sanitize_segment`] turns any string into one harmless path
//! component, and [`validate`] makes sure an assembled relative path can
//! never leave the directory it gets joined onto.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Replacement for characters that can't appear in a path segment.
const REPLACEMENT: char = '_';
/// Characters rejected by at least one common filesystem (NTFS is the
/// strictest), plus both separators.
const ILLEGAL: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
/// DOS device names that Windows refuses as file or directory names, with or
/// without an extension.
const RESERVED: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9", "LPT1",
    "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];
/// Generous but finite; most filesystems cap a component at 255 bytes.
const MAX_SEGMENT_BYTES: usize = 200;

/// Turns an arbitrary string into a single, portable path segment.
///
/// - separators and characters illegal on Windows become `_`,
/// - control characters become `_`,
/// - surrounding whitespace and trailing dots are trimmed (Windows silently
///   drops trailing dots and spaces, which would merge distinct folders),
/// - empty or dot-only results become `_`,
/// - reserved device names (`CON`, `NUL`, `COM1`, ...) get a `_` suffix,
/// - overly long values are cut at a character boundary.
///
/// # Examples
///
/// ```
/// use docket_storage::sanitize_segment;
/// assert_eq!(sanitize_segment("Acme / Invoices"), "Acme _ Invoices");
/// assert_eq!(sanitize_segment("../../etc"), ".._.._etc");
/// assert_eq!(sanitize_segment("  "), "_");
/// assert_eq!(sanitize_segment("con"), "con_");
/// ```
pub fn sanitize_segment(value: &str) -> String {
    let replaced: String =
        value.chars().map(|c| if c.is_control() || ILLEGAL.contains(&c) { REPLACEMENT } else { c }).collect();
    let trimmed = replaced.trim();
    let mut end = trimmed.len().min(MAX_SEGMENT_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let mut segment = trimmed[..end].trim_end_matches(['.', ' ']).to_string();
    if segment.is_empty() {
        return REPLACEMENT.to_string();
    }
    let stem_len = segment.find('.').unwrap_or(segment.len());
    if RESERVED.iter().any(|r| r.eq_ignore_ascii_case(&segment[..stem_len])) {
        segment.insert(stem_len, REPLACEMENT);
    }
    segment
}

/// Validates a relative path for security and correctness.
/// Ensures that paths don't escape their root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Returns
/// Returns the normalized path if valid, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath)
/// if invalid.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use docket_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("Acme/Invoices/4521/20241217").is_ok());
/// assert!(validate_path("a/../b").is_ok()); // (never leaves the root)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err()); // (leaves the root)
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("wrong/../still-wrong/.././Acme//./4521/").unwrap(),
///     Path::new("Acme/4521")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    // Rust's component parser deals with repeated separators and `.` for us,
    // and keeps working for non-UTF8 names.
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls; reject them explicitly.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            // A drive letter or UNC prefix would replace the root on join.
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Acme", "Acme")]
    #[case("  Acme Corp  ", "Acme Corp")]
    #[case("A/B\\C", "A_B_C")]
    #[case("what?*", "what__")]
    #[case("<script>", "_script_")]
    #[case("tab\there", "tab_here")]
    #[case("trailing dots...", "trailing dots")]
    #[case("..", "_")]
    #[case(".", "_")]
    #[case("", "_")]
    #[case("NUL", "NUL_")]
    #[case("com1.txt", "com1_.txt")]
    #[case("Console", "Console")]
    #[case("日本語の案件", "日本語の案件")]
    fn test_sanitize_segment(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_segment(input), expected);
    }

    #[test]
    fn test_sanitize_segment_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        let segment = sanitize_segment(&long);
        assert!(segment.len() <= MAX_SEGMENT_BYTES);
        assert!(segment.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_sanitized_segments_always_validate() {
        for nasty in ["..", "../..", "/", "\\\\server\\share", "C:", "a\0b", "   ", "..."] {
            let segment = sanitize_segment(nasty);
            let validated = validate(&segment).unwrap();
            assert_eq!(validated.components().count(), 1, "{nasty:?} became {segment:?}");
        }
    }

    #[test]
    fn test_valid_paths() {
        assert_eq!(validate(Path::new("Acme/Invoices/4521")).unwrap(), Path::new("Acme/Invoices/4521"));
        assert_eq!(validate(Path::new("simple")).unwrap(), Path::new("simple"));
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(validate(Path::new("a//b//c")).unwrap(), Path::new("a/b/c"));
        assert_eq!(validate(Path::new("a/./b/./c")).unwrap(), Path::new("a/b/c"));
        assert_eq!(validate(Path::new("a/b/..")).unwrap(), Path::new("a"));
        assert_eq!(validate(Path::new("a/b/c/")).unwrap(), Path::new("a/b/c"));
    }

    #[test]
    fn test_traversal_attempts() {
        assert!(validate(Path::new("../etc/passwd")).is_err());
        assert!(validate(Path::new("a/../../b")).is_err());
        assert!(validate(Path::new("..")).is_err());
    }

    #[test]
    fn test_invalid_and_empty() {
        assert!(validate(Path::new("a\0b")).is_err());
        assert!(validate(Path::new("")).is_err());
        assert!(validate(Path::new("./.")).is_err());
        assert!(validate(Path::new("//")).is_err());
    }
}
