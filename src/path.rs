//! Volume paths
//!
//! Paths are `/`-separated; `\` is accepted as a separator too. Every path
//! is taken from the root, a leading separator is optional. `.` segments are
//! dropped and `..` steps back up, but never above the root.

use crate::core::directory::entry::validate_name;
use crate::core::error::{Result, SlabError};

pub const SEPARATOR: char = '/';

/// Validated segments of `path`, root first
pub fn segments(path: &str) -> Result<Vec<String>> {
    let mut parts: Vec<String> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(SlabError::InvalidName(path.to_string()));
                }
            }
            name => {
                validate_name(name)?;
                parts.push(name.to_string());
            }
        }
    }
    Ok(parts)
}

/// Parent segments and final name. The root has no name.
pub fn split_parent(path: &str) -> Result<(Vec<String>, String)> {
    let mut parts = segments(path)?;
    let name = parts
        .pop()
        .ok_or_else(|| SlabError::InvalidArgument("the root directory has no name".into()))?;
    Ok((parts, name))
}

/// Canonical absolute form, `/` for the root
pub fn normalise(path: &str) -> Result<String> {
    Ok(from_segments(&segments(path)?))
}

pub fn from_segments<S: AsRef<str>>(parts: &[S]) -> String {
    if parts.is_empty() {
        return SEPARATOR.to_string();
    }
    parts.iter().fold(String::new(), |mut out, part| {
        out.push(SEPARATOR);
        out.push_str(part.as_ref());
        out
    })
}

pub fn join(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches(SEPARATOR);
    format!("{}{}{}", parent, SEPARATOR, name)
}

/// True when `path` is `ancestor` or lies below it
pub fn is_within(path: &[String], ancestor: &[String]) -> bool {
    path.len() >= ancestor.len() && path[..ancestor.len()] == *ancestor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments() {
        assert_eq!(segments("/a/b/c.txt").unwrap(), vec!["a", "b", "c.txt"]);
        assert_eq!(segments("a\\b").unwrap(), vec!["a", "b"]);
        assert_eq!(segments("//a/./b/../c/").unwrap(), vec!["a", "c"]);
        assert!(segments("/").unwrap().is_empty());
        assert!(segments("").unwrap().is_empty());
    }

    #[test]
    fn test_above_root_rejected() {
        assert!(matches!(segments("/a/../.."), Err(SlabError::InvalidName(_))));
        assert!(segments("/bad\0name").is_err());
    }

    #[test]
    fn test_split_and_normalise() {
        let (parent, name) = split_parent("/x/y/z").unwrap();
        assert_eq!(parent, vec!["x", "y"]);
        assert_eq!(name, "z");
        assert!(split_parent("/").is_err());

        assert_eq!(normalise("a//b/").unwrap(), "/a/b");
        assert_eq!(normalise("/").unwrap(), "/");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn test_is_within() {
        let a = segments("/a").unwrap();
        let ab = segments("/a/b").unwrap();
        assert!(is_within(&ab, &a));
        assert!(is_within(&a, &a));
        assert!(!is_within(&a, &ab));
        assert!(is_within(&a, &[]));
    }
}
