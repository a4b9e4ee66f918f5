//! Template path validation and resolution.
//!
//! Template paths use `/` as separator regardless of the host system. A
//! leading `/` anchors a path to the template root; relative paths are
//! resolved against the directory of the containing file. Resolution
//! collapses `..` segments and fails with
//! [`VelaError::InvalidPath`] when a path would escape the root.

use vela_core::{VelaError, VelaResult};

/// Whether `path` is a syntactically valid template path: non-empty, no
/// empty or `.` elements, no control characters, and not ending with a
/// separator. `..` elements are allowed; resolution collapses them.
#[must_use]
pub fn valid_path(path: &str) -> bool {
    if path.is_empty() || path.ends_with('/') {
        return false;
    }
    if path.bytes().any(|b| b < 0x20 || b == 0x7F) {
        return false;
    }
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    trimmed.split('/').all(|elem| !elem.is_empty() && elem != ".")
}

/// Resolve `path` against the absolute directory `dir` (which must start
/// with `/`), collapsing `..` segments. Fails with `InvalidPath` if the
/// result would escape the template root.
pub fn to_absolute_path(dir: &str, path: &str) -> VelaResult<String> {
    let mut elements: Vec<&str> = Vec::new();
    for elem in dir.split('/').chain(path.split('/')) {
        match elem {
            "" | "." => {}
            ".." => {
                if elements.pop().is_none() {
                    return Err(VelaError::InvalidPath);
                }
            }
            _ => elements.push(elem),
        }
    }
    if elements.is_empty() {
        return Err(VelaError::InvalidPath);
    }
    Ok(format!("/{}", elements.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        assert!(valid_path("index.html"));
        assert!(valid_path("/partials/header.html"));
        assert!(valid_path("../shared/footer.html"));
        assert!(!valid_path(""));
        assert!(!valid_path("dir/"));
        assert!(!valid_path("a//b"));
        assert!(!valid_path("./a"));
        assert!(!valid_path("a\nb"));
    }

    #[test]
    fn test_resolution() {
        assert_eq!(to_absolute_path("/", "index.html").unwrap(), "/index.html");
        assert_eq!(
            to_absolute_path("/pages/", "post.html").unwrap(),
            "/pages/post.html"
        );
        assert_eq!(
            to_absolute_path("/pages/", "../shared/base.html").unwrap(),
            "/shared/base.html"
        );
    }

    #[test]
    fn test_escape_is_rejected() {
        assert_eq!(
            to_absolute_path("/", "../evil.html"),
            Err(VelaError::InvalidPath)
        );
        assert_eq!(
            to_absolute_path("/pages/", "../../../etc.html"),
            Err(VelaError::InvalidPath)
        );
    }
}
