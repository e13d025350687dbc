//! Minimal path objects: a root, an ordered list of names, and absoluteness

use std::fmt;

use crate::config::CaseSensitivity;
use crate::error::{FsError, FsResult};

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Parsed path. Never contains `.`, `..` or empty elements.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FsPath {
    root: usize,
    root_name: String,
    elements: Vec<String>,
    absolute: bool,
}

impl FsPath {
    /// Parse `input` against the configured `roots`. Input that does not start
    /// with a root name is relative and is anchored at the first root.
    pub fn parse(input: &str, roots: &[String], collation: CaseSensitivity) -> FsResult<Self> {
        if roots.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let mut matched: Option<(usize, usize)> = None;
        for (ordinal, name) in roots.iter().enumerate() {
            let Some(len) = root_prefix_len(input, name, collation) else {
                continue;
            };
            if matched.map_or(true, |(_, best)| len > best) {
                matched = Some((ordinal, len));
            }
        }

        let (root, rest, absolute) = match matched {
            Some((ordinal, len)) => (ordinal, &input[len..], true),
            None => (0, input, false),
        };

        let mut elements = Vec::new();
        for part in rest.split(is_separator) {
            push_element(&mut elements, part)?;
        }
        Ok(Self {
            root,
            root_name: roots[root].clone(),
            elements,
            absolute,
        })
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.elements.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<FsPath> {
        if self.elements.is_empty() {
            return None;
        }
        Some(self.with_elements(self.elements[..self.elements.len() - 1].to_vec()))
    }

    /// Append `child`, normalizing `.` and `..` in it.
    pub fn join(&self, child: &str) -> FsResult<FsPath> {
        let mut elements = self.elements.clone();
        for part in child.split(is_separator) {
            push_element(&mut elements, part)?;
        }
        Ok(self.with_elements(elements))
    }

    /// Whether `self` is `other` or lies beneath it, under `collation`.
    pub fn starts_with(&self, other: &FsPath, collation: CaseSensitivity) -> bool {
        self.root == other.root
            && self.elements.len() >= other.elements.len()
            && self
                .elements
                .iter()
                .zip(&other.elements)
                .all(|(a, b)| collation.names_equal(a, b))
    }

    pub(crate) fn with_elements(&self, elements: Vec<String>) -> FsPath {
        FsPath {
            root: self.root,
            root_name: self.root_name.clone(),
            elements,
            absolute: true,
        }
    }

    pub(crate) fn from_parts(root: usize, root_name: &str, elements: Vec<String>) -> FsPath {
        FsPath {
            root,
            root_name: root_name.to_string(),
            elements,
            absolute: true,
        }
    }
}

/// Apply one raw path element to `elements`.
pub(crate) fn push_element(elements: &mut Vec<String>, part: &str) -> FsResult<()> {
    match part {
        "" | "." => {}
        ".." => {
            elements.pop();
        }
        name => {
            if name.contains('\0') {
                return Err(FsError::InvalidName);
            }
            elements.push(name.to_string());
        }
    }
    Ok(())
}

fn root_prefix_len(input: &str, root: &str, collation: CaseSensitivity) -> Option<usize> {
    if root.chars().all(is_separator) {
        return input.starts_with(is_separator).then_some(1);
    }
    let head = input.get(..root.len())?;
    if !collation.names_equal(head, root) {
        return None;
    }
    match input[root.len()..].chars().next() {
        None => Some(root.len()),
        Some(c) if is_separator(c) => Some(root.len() + 1),
        Some(_) => None,
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.absolute {
            return write!(f, "{}", self.elements.join("/"));
        }
        if self.root_name.ends_with(is_separator) {
            write!(f, "{}{}", self.root_name, self.elements.join("/"))
        } else if self.elements.is_empty() {
            write!(f, "{}/", self.root_name)
        } else {
            write!(f, "{}/{}", self.root_name, self.elements.join("/"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix() -> Vec<String> {
        vec!["/".to_string()]
    }

    #[test]
    fn test_parse_absolute() {
        let p = FsPath::parse("/a//b/./c/", &unix(), CaseSensitivity::Sensitive).unwrap();
        assert!(p.is_absolute());
        assert_eq!(p.elements(), &["a", "b", "c"]);
        assert_eq!(p.to_string(), "/a/b/c");
    }

    #[test]
    fn test_parse_dot_dot() {
        let p = FsPath::parse("/a/b/../../../c", &unix(), CaseSensitivity::Sensitive).unwrap();
        assert_eq!(p.elements(), &["c"]);
    }

    #[test]
    fn test_parse_relative() {
        let p = FsPath::parse("a\\b", &unix(), CaseSensitivity::Sensitive).unwrap();
        assert!(!p.is_absolute());
        assert_eq!(p.root(), 0);
        assert_eq!(p.to_string(), "a/b");
    }

    #[test]
    fn test_named_roots() {
        let roots = vec!["C:".to_string(), "D:".to_string()];
        let p = FsPath::parse("d:\\Users\\me", &roots, CaseSensitivity::InsensitivePreserving)
            .unwrap();
        assert_eq!(p.root(), 1);
        assert_eq!(p.elements(), &["Users", "me"]);
        assert_eq!(p.to_string(), "D:/Users/me");

        let root = FsPath::parse("C:", &roots, CaseSensitivity::InsensitivePreserving).unwrap();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "C:/");
    }

    #[test]
    fn test_parent_and_file_name() {
        let p = FsPath::parse("/a/b", &unix(), CaseSensitivity::Sensitive).unwrap();
        assert_eq!(p.file_name(), Some("b"));
        let parent = p.parent().unwrap();
        assert_eq!(parent.to_string(), "/a");
        assert!(parent.parent().unwrap().parent().is_none());
    }

    #[test]
    fn test_starts_with() {
        let a = FsPath::parse("/A/b/c", &unix(), CaseSensitivity::Sensitive).unwrap();
        let b = FsPath::parse("/a/B", &unix(), CaseSensitivity::Sensitive).unwrap();
        assert!(!a.starts_with(&b, CaseSensitivity::Sensitive));
        assert!(a.starts_with(&b, CaseSensitivity::InsensitivePreserving));
    }

    #[test]
    fn test_invalid_name() {
        let err = FsPath::parse("/a\0b", &unix(), CaseSensitivity::Sensitive).unwrap_err();
        assert!(matches!(err, FsError::InvalidName));
    }
}
