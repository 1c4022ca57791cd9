//! Relative path helpers
//!
//! Working-copy and repository paths are `/`-separated, relative, and never
//! carry a leading or trailing slash. The empty string is the root.

use std::cmp::Ordering;

/// Join a parent relpath and a child component
pub fn join(parent: &str, child: &str) -> String {
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => parent.to_string(),
        _ => format!("{}/{}", parent, child),
    }
}

/// Parent of `path`; the root's parent is the root
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

/// Last component of `path`
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// True if `ancestor` is `path` or one of its ancestors
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// True if `ancestor` is a strict ancestor of `path`
pub fn is_strict_ancestor(ancestor: &str, path: &str) -> bool {
    ancestor != path && is_ancestor(ancestor, path)
}

/// The remainder of `path` below `ancestor`, if it lies beneath it
pub fn skip_ancestor<'a>(ancestor: &str, path: &'a str) -> Option<&'a str> {
    if ancestor.is_empty() {
        return Some(path);
    }
    if path == ancestor {
        return Some("");
    }
    if is_ancestor(ancestor, path) {
        return Some(&path[ancestor.len() + 1..]);
    }
    None
}

/// Longest common ancestor of two relpaths
pub fn common_ancestor<'a>(a: &'a str, b: &str) -> &'a str {
    let mut last = 0;
    let mut ai = a.split('/');
    let mut bi = b.split('/');
    let mut consumed = 0;
    loop {
        match (ai.next(), bi.next()) {
            (Some(x), Some(y)) if x == y && !x.is_empty() => {
                consumed += x.len();
                last = consumed;
                consumed += 1;
            }
            _ => break,
        }
    }
    &a[..last]
}

/// Longest common ancestor of all paths; `None` for an empty iterator
pub fn longest_common_ancestor<'a, I>(paths: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut iter = paths.into_iter();
    let first = iter.next()?;
    let mut lca = first.to_string();
    for path in iter {
        lca = common_ancestor(&lca, path).to_string();
    }
    Some(lca)
}

/// Ordering that sorts parents before children and compares segment by
/// segment, so `a/b` sorts before `a-b` and `a.b`.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    let mut ai = a.split('/').filter(|s| !s.is_empty());
    let mut bi = b.split('/').filter(|s| !s.is_empty());
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Number of components in `path`
pub fn depth_of(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('/').count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_split() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("a/b", "c"), "a/b/c");
        assert_eq!(dirname("a/b/c"), "a/b");
        assert_eq!(dirname("a"), "");
        assert_eq!(basename("a/b/c"), "c");
        assert_eq!(basename("a"), "a");
        assert_eq!(depth_of(""), 0);
        assert_eq!(depth_of("a/b"), 2);
    }

    #[test]
    fn test_ancestry() {
        assert!(is_ancestor("", "a"));
        assert!(is_ancestor("a", "a"));
        assert!(is_ancestor("a", "a/b"));
        assert!(!is_ancestor("a", "ab"));
        assert!(!is_strict_ancestor("a", "a"));
        assert_eq!(skip_ancestor("a", "a/b/c"), Some("b/c"));
        assert_eq!(skip_ancestor("a", "a"), Some(""));
        assert_eq!(skip_ancestor("a", "b"), None);
        assert_eq!(skip_ancestor("", "x/y"), Some("x/y"));
    }

    #[test]
    fn test_common_ancestor() {
        assert_eq!(common_ancestor("a/b/c", "a/b/d"), "a/b");
        assert_eq!(common_ancestor("a/bc", "a/b"), "a");
        assert_eq!(common_ancestor("x", "y"), "");
        assert_eq!(
            longest_common_ancestor(["trunk/a", "trunk/b/c", "trunk/b"]),
            Some("trunk".to_string())
        );
        assert_eq!(longest_common_ancestor(std::iter::empty()), None);
    }

    #[test]
    fn test_compare_paths_is_segment_wise() {
        let mut paths = vec!["a-b", "a/b", "a", "", "a.b", "a/b/c", "b"];
        paths.sort_by(|x, y| compare_paths(x, y));
        assert_eq!(paths, vec!["", "a", "a/b", "a/b/c", "a-b", "a.b", "b"]);
    }
}
