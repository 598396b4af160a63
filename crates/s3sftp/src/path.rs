//! Path translation from client paths to storage keys.
//!
//! Client paths are always normalized as absolute paths before they are joined
//! under a namespace root, so `..` can never climb above the root.

/// Name of the zero-length object that marks a directory.
pub const DIR_MARKER: &str = ".dir";

/// Lexically normalize a client path into an absolute canonical form.
///
/// `.` segments and empty segments are dropped, `..` pops the previous
/// segment and clamps at `/`. The result always starts with `/` and never
/// ends with one unless it is the root.
pub fn normalize(path: &str) -> String {
    let segments = segments(path);
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Normalize a path fragment without the leading separator.
///
/// Used for namespace and username components of an identity root.
pub fn normalize_relative(path: &str) -> String {
    segments(path).join("/")
}

fn segments(path: &str) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out
}

/// Returns the last segment of a canonical path, or the path itself for `/`.
pub fn basename(path: &str) -> &str {
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name,
        _ => path,
    }
}

/// Storage-key namespace owned by one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: String,
}

impl Namespace {
    /// Create a namespace rooted at an already-normalized, non-empty key prefix.
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// The root key, without a trailing separator.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Resolve a client path to the storage key of the object it names.
    pub fn key(&self, path: &str) -> String {
        self.key_for_canonical(&normalize(path))
    }

    /// Resolve a client path to its directory marker key.
    pub fn marker_key(&self, path: &str) -> String {
        format!("{}/{}", self.key(path), DIR_MARKER)
    }

    /// Resolve a client path to the prefix under which its children live.
    pub fn dir_prefix(&self, path: &str) -> String {
        format!("{}/", self.key(path))
    }

    fn key_for_canonical(&self, canonical: &str) -> String {
        match canonical.trim_start_matches('/') {
            "" => self.root.clone(),
            relative => format!("{}/{}", self.root, relative),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("."), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("docs"), "/docs");
        assert_eq!(normalize("/docs/"), "/docs");
        assert_eq!(normalize("//docs///readme.txt"), "/docs/readme.txt");
        assert_eq!(normalize("/docs/./a/../b"), "/docs/b");
    }

    #[test]
    fn test_parent_segments_clamp_at_root() {
        assert_eq!(normalize(".."), "/");
        assert_eq!(normalize("../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize("/a/../../../b"), "/b");
    }

    #[test]
    fn test_keys_stay_under_root() {
        let ns = Namespace::new("alice");
        for path in [
            "..",
            "../bob/secret",
            "/../../bob",
            "docs/../../../bob/.dir",
            "./../alice2/x",
        ] {
            let key = ns.key(path);
            assert!(
                key == "alice" || key.starts_with("alice/"),
                "{path} escaped to {key}"
            );
        }
    }

    #[test]
    fn test_key_resolution() {
        let ns = Namespace::new("tenants/alice");
        assert_eq!(ns.key("/"), "tenants/alice");
        assert_eq!(ns.key("/docs/readme.txt"), "tenants/alice/docs/readme.txt");
        assert_eq!(ns.marker_key("/docs"), "tenants/alice/docs/.dir");
        assert_eq!(ns.dir_prefix("/"), "tenants/alice/");
        assert_eq!(ns.dir_prefix("docs/"), "tenants/alice/docs/");
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/"), "/");
        assert_eq!(basename("/docs"), "docs");
        assert_eq!(basename("/docs/readme.txt"), "readme.txt");
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("/alice/"), "alice");
        assert_eq!(normalize_relative("../tenants//a"), "tenants/a");
        assert_eq!(normalize_relative("/"), "");
    }
}
