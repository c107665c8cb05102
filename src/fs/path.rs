//! Path normalization for archive entries and queries.
//!
//! Two normalizers exist and they are intentionally separate functions:
//!
//! - [`normalize_path`] is used while building an index. Archives cannot
//!   escape their own root, so leading `..` segments are clamped at `/`.
//! - [`normalize_query_path`] is used while resolving a query relative to
//!   some base inside the tree. Leading `..` segments are kept so they can
//!   later be resolved against a base that is not the root.

/// Maximum length of a single path component reported to the kernel.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Normalize an archive path, clamping `..` at the root.
///
/// Accepts absolute or relative input and always returns an absolute path.
pub fn normalize_path(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    join_parts(&parts)
}

/// Normalize a query path without clamping leading `..` segments.
///
/// A `..` pops the previous normal segment when there is one; otherwise it
/// is preserved, e.g. `../` becomes `/..`.
pub fn normalize_query_path(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(last) if *last != ".." => {
                    parts.pop();
                }
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    join_parts(&parts)
}

fn join_parts(parts: &[&str]) -> String {
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Split a normalized path into `(parent, name)`.
///
/// Returns `None` for the root.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    if path == "/" || path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(("/", &path[1..])),
        Some(pos) => Some((&path[..pos], &path[pos + 1..])),
        None => Some(("/", path)),
    }
}

/// Join a normalized parent directory and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Components of a normalized path. The root has none.
pub fn path_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Every proper ancestor of a normalized path, root first.
///
/// `/a/b/c` yields `/`, `/a`, `/a/b`. The root has no ancestors.
pub fn ancestors(path: &str) -> Vec<String> {
    let components = path_components(path);
    if components.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(components.len());
    out.push("/".to_string());
    let mut current = String::new();
    for component in &components[..components.len() - 1] {
        current.push('/');
        current.push_str(component);
        out.push(current.clone());
    }
    out
}

/// Strip `prefix` from a normalized `path`, returning the remainder as a
/// normalized absolute path.
///
/// Matching is per component: `/ab` is not under `/a`.
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_path_examples() {
        let cases = [
            ("/", "/"),
            ("//", "/"),
            ("a", "/a"),
            ("a/", "/a"),
            ("//a//", "/a"),
            (".", "/"),
            ("/./", "/"),
            ("./././a/.././", "/"),
            ("../", "/"),
            ("../.././..", "/"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_path(input), expected, "input {:?}", input);
        }
    }

    #[test]
    fn test_normalize_query_path_examples() {
        let cases = [
            ("/", "/"),
            ("//", "/"),
            ("a", "/a"),
            ("a/", "/a"),
            ("//a//", "/a"),
            (".", "/"),
            ("/./", "/"),
            ("./././a/.././", "/"),
            ("../", "/.."),
            ("../.././..", "/../../.."),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_query_path(input), expected, "input {:?}", input);
        }
    }

    #[test]
    fn test_normalizers_differ_only_on_leading_parent() {
        assert_eq!(normalize_path("../foo"), "/foo");
        assert_eq!(normalize_query_path("../foo"), "/../foo");
        assert_eq!(normalize_path("a/b/../c"), normalize_query_path("a/b/../c"));
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/"), None);
        assert_eq!(split_path("/data"), Some(("/", "data")));
        assert_eq!(split_path("/data/files/test.txt"), Some(("/data/files", "test.txt")));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }

    #[test]
    fn test_ancestors() {
        assert!(ancestors("/").is_empty());
        assert_eq!(ancestors("/a"), vec!["/"]);
        assert_eq!(ancestors("/a/b/c"), vec!["/", "/a", "/a/b"]);
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("/a/b", "/a"), Some("/b"));
        assert_eq!(strip_prefix("/a", "/a"), Some("/"));
        assert_eq!(strip_prefix("/ab", "/a"), None);
        assert_eq!(strip_prefix("/x", "/"), Some("/x"));
    }

    proptest! {
        #[test]
        fn prop_normalize_path_idempotent(raw in "[a-c./]{0,24}") {
            let once = normalize_path(&raw);
            prop_assert_eq!(normalize_path(&once), once.clone());
            prop_assert!(once.starts_with('/'));
            prop_assert!(!once.contains("//"));
        }

        #[test]
        fn prop_normalize_query_path_idempotent(raw in "[a-c./]{0,24}") {
            let once = normalize_query_path(&raw);
            prop_assert_eq!(normalize_query_path(&once), once);
        }

        #[test]
        fn prop_clamped_path_has_no_dot_segments(raw in "[a-c./]{0,24}") {
            let normalized = normalize_path(&raw);
            prop_assert!(path_components(&normalized).iter().all(|c| *c != "." && *c != ".."));
        }
    }
}
