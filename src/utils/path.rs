//! Virtual path helpers. Virtual paths are slash-delimited, rooted at `/`,
//! and never carry a trailing slash (except the root itself).

const MAX_NAME_LEN: usize = 255;

/// Make a user-supplied name safe to use as a single path segment.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_start_matches('.');
    let truncated: String = trimmed.chars().take(MAX_NAME_LEN).collect();

    if truncated.trim().is_empty() {
        "unnamed".to_string()
    } else {
        truncated
    }
}

/// Collapse repeated slashes, drop the trailing slash and make the path absolute.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    normalize_path(&format!("{}/{}", parent, name))
}

/// Parent of a virtual path. The parent of `/` is `/`.
pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

pub fn basename(path: &str) -> String {
    let normalized = normalize_path(path);
    normalized
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Remote names may legally contain `/`; inside the virtual tree it would
/// read as a separator.
pub fn remote_name_segment(name: &str) -> String {
    name.replace('/', "-")
}
