//! Filename extraction, sanitization, and category classification.
//!
//! Server-supplied names (Content-Disposition) and URL path segments are
//! untrusted input; everything that ends up on disk goes through
//! [`sanitize_filename`] first.

use std::path::{Path, PathBuf};

use url::Url;

/// Parses a filename out of a Content-Disposition header value.
///
/// The RFC 5987 `filename*=charset''percent-encoded` form takes
/// precedence over the plain `filename="..."` form.
#[must_use]
pub fn parse_content_disposition(header: &str) -> Option<String> {
    // Try filename*= first (RFC 5987 encoded)
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        // Format: charset'language'encoded_value
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = encoded[..end].trim();
            if let Ok(decoded) = urlencoding::decode(encoded_name) {
                let decoded = decoded.into_owned();
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
        }
    }

    // Fall back to regular filename=
    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();

        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                let name = &stripped[..end];
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let name = value[..end].trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }

    None
}

/// Extracts the last path segment of a URL as a candidate filename.
///
/// Returns `None` for empty paths (`https://host/`) and names without
/// substance after sanitization.
#[must_use]
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let decoded = urlencoding::decode(segment)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_else(|_| segment.to_string());
    let sanitized = sanitize_filename(&decoded);
    (!sanitized.is_empty()).then_some(sanitized)
}

/// Replaces path separators, control characters, and other characters
/// that are unsafe in filenames; collapses runs of replacements.
#[must_use]
pub fn sanitize_filename(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    // A bare dot-name would escape into hidden-file territory.
    out.trim_matches(['_', '.', ' ']).to_string()
}

/// The lowercase extension of a filename, with the leading dot.
#[must_use]
pub fn file_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Classifies a file extension into a download category.
#[must_use]
pub fn categorize_extension(extension: &str) -> &'static str {
    match extension {
        ".mp3" | ".wav" | ".flac" | ".aac" | ".ogg" | ".wma" | ".m4a" | ".opus" | ".mid" => {
            "Music"
        }
        ".mp4" | ".avi" | ".mkv" | ".mov" | ".wmv" | ".flv" | ".webm" | ".mpg" | ".mpeg"
        | ".3gp" | ".m4v" => "Video",
        ".exe" | ".msi" | ".apk" | ".deb" | ".rpm" | ".bin" | ".run" | ".sh" | ".bat"
        | ".dmg" | ".iso" => "Programs",
        ".doc" | ".docx" | ".pdf" | ".xls" | ".xlsx" | ".ppt" | ".pptx" | ".txt" | ".rtf"
        | ".odt" | ".csv" => "Documents",
        ".zip" | ".rar" | ".7z" | ".tar" | ".gz" | ".bz2" | ".xz" | ".cab" => "Compressed",
        _ => "General",
    }
}

/// Classifies a filename into a download category.
#[must_use]
pub fn categorize_filename(name: &str) -> &'static str {
    categorize_extension(&file_extension(name))
}

/// Finds an unused path next to `target` by appending ` (1)`..` (9999)`
/// before the extension, falling back to a unix-timestamp suffix.
#[must_use]
pub fn resolve_unique_path(target: &Path) -> PathBuf {
    if !target.exists() {
        return target.to_path_buf();
    }

    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = target.parent().unwrap_or_else(|| Path::new(""));

    for i in 1..10_000 {
        let candidate = dir.join(format!("{stem} ({i}){extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(format!("{stem}_{timestamp}{extension}"))
}
