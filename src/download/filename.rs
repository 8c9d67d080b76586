//! Filename derivation and sanitization for URL-derived destinations.

use std::path::{Component, Path, PathBuf};

use url::Url;

/// Name used when the URL path has no usable last segment.
const FALLBACK_FILENAME: &str = "download";

/// Upper bound on numeric suffixes tried before falling back to a timestamp.
const MAX_SUFFIX: usize = 1000;

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Basename of the URL path, percent-decoded and sanitized.
///
/// Falls back to `download` when the path ends in `/` or is empty.
pub(crate) fn filename_from_url(url: &Url) -> String {
    let Some(last) = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
    else {
        return FALLBACK_FILENAME.to_string();
    };

    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    let sanitized = sanitize_filename(&decoded);
    if sanitized.trim_matches('_').is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Joins `filename` under `dir`, adding a numeric suffix while `taken` reports a clash.
///
/// Example: `file.bin`, then `file_2.bin`, `file_3.bin`, ...
pub(crate) fn unique_destination(
    dir: &Path,
    filename: &str,
    taken: impl Fn(&Path) -> bool,
) -> PathBuf {
    let base_path = dir.join(filename);
    if !taken(&base_path) {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    };

    for i in 2..MAX_SUFFIX {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !taken(&candidate) {
            return candidate;
        }
    }

    let timestamp = chrono::Utc::now().timestamp_millis();
    dir.join(format!("{stem}_{timestamp}{ext}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.bin"), "file_name.bin");
        assert_eq!(sanitize_filename("file\\name.bin"), "file_name.bin");
        assert_eq!(sanitize_filename("file:name.bin"), "file_name.bin");
        assert_eq!(sanitize_filename("file<name>.bin"), "file_name_.bin");
        assert_eq!(sanitize_filename("file|name.bin"), "file_name.bin");
    }

    #[test]
    fn test_sanitize_filename_rewrites_dot_segments() {
        assert_eq!(sanitize_filename("."), "_");
        assert_eq!(sanitize_filename(".."), "__");
    }

    #[test]
    fn test_sanitize_filename_preserves_valid_chars() {
        assert_eq!(sanitize_filename("file (1).iso"), "file (1).iso");
        assert_eq!(sanitize_filename("日本語.zip"), "日本語.zip");
    }

    #[test]
    fn test_filename_from_url_uses_last_segment() {
        let url = Url::parse("https://example.com/releases/v1/file.tar.gz?token=x").unwrap();
        assert_eq!(filename_from_url(&url), "file.tar.gz");
    }

    #[test]
    fn test_filename_from_url_decodes_percent_escapes() {
        let url = Url::parse("https://example.com/my%20file.bin").unwrap();
        assert_eq!(filename_from_url(&url), "my file.bin");
    }

    #[test]
    fn test_filename_from_url_decoded_separator_is_sanitized() {
        let url = Url::parse("https://example.com/a%2F..%2Fetc").unwrap();
        let name = filename_from_url(&url);
        assert!(!name.contains('/'), "{name}");
    }

    #[test]
    fn test_filename_from_url_empty_path_falls_back() {
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(filename_from_url(&url), "download");
        let url = Url::parse("https://example.com/dir/").unwrap();
        assert_eq!(filename_from_url(&url), "download");
    }

    #[test]
    fn test_unique_destination_no_conflict() {
        let dir = Path::new("/data");
        let path = unique_destination(dir, "a.bin", |_| false);
        assert_eq!(path, PathBuf::from("/data/a.bin"));
    }

    #[test]
    fn test_unique_destination_multiple_conflicts() {
        let dir = Path::new("/data");
        let taken: HashSet<PathBuf> = ["/data/a.bin", "/data/a_2.bin"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let path = unique_destination(dir, "a.bin", |p| taken.contains(p));
        assert_eq!(path, PathBuf::from("/data/a_3.bin"));
    }

    #[test]
    fn test_unique_destination_without_extension() {
        let dir = Path::new("/data");
        let path = unique_destination(dir, "download", |p| p == Path::new("/data/download"));
        assert_eq!(path, PathBuf::from("/data/download_2"));
    }
}
