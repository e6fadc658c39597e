//! File trees exchanged between the AI, collaborators and the sandbox.
//!
//! A tree is a mapping from opaque keys to either a file leaf
//! (`{"file": {"contents": "..."}}`) or a further mapping. There is no
//! directory entity: nesting exists only through the mapping structure.
//!
//! Trees are always whole snapshots. Consumers replace their previous tree
//! with a new one and never merge.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A whole-snapshot file tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree(BTreeMap<String, FileNode>);

/// One entry of a [`FileTree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileNode {
    File(FileEntry),
    Directory(FileTree),
}

/// Wire form of a file leaf: `{"file": {"contents": "..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
    pub file: FileContents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileContents {
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("empty path segment in {0:?}")]
    EmptySegment(String),
    #[error("absolute path not allowed: {0:?}")]
    Absolute(String),
    #[error("path escapes the tree root: {0:?}")]
    Traversal(String),
    #[error("NUL byte in path {0:?}")]
    Nul(String),
    #[error("path {0:?} appears more than once")]
    Duplicate(String),
    #[error("{file:?} is a file but {path:?} needs it to be a directory")]
    FileAsDirectory { file: String, path: String },
}

impl FileNode {
    pub fn file(contents: impl Into<String>) -> Self {
        FileNode::File(FileEntry {
            file: FileContents {
                contents: contents.into(),
            },
        })
    }

    pub fn contents(&self) -> Option<&str> {
        match self {
            FileNode::File(entry) => Some(&entry.file.contents),
            FileNode::Directory(_) => None,
        }
    }
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) the node stored under `key`.
    pub fn insert(&mut self, key: impl Into<String>, node: FileNode) -> Option<FileNode> {
        self.0.insert(key.into(), node)
    }

    /// Builder form of [`FileTree::insert`] for file leaves.
    pub fn with_file(mut self, key: impl Into<String>, contents: impl Into<String>) -> Self {
        self.insert(key, FileNode::file(contents));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Top-level entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &FileNode)> {
        self.0.iter()
    }

    /// Look up a file by its flattened path (`"src/app.js"`).
    ///
    /// Keys are opaque, so a key may itself contain `/`. The lookup tries the
    /// longest matching key at each level before descending.
    pub fn get(&self, path: &str) -> Option<&str> {
        if let Some(node) = self.0.get(path) {
            return node.contents();
        }
        let mut split_at = path.len();
        while let Some(idx) = path[..split_at].rfind('/') {
            let (head, rest) = (&path[..idx], &path[idx + 1..]);
            if let Some(FileNode::Directory(sub)) = self.0.get(head)
                && let Some(found) = sub.get(rest)
            {
                return Some(found);
            }
            split_at = idx;
        }
        None
    }

    /// Every file as `(flattened path, contents)`, sorted by path.
    pub fn files(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn paths(&self) -> Vec<String> {
        self.files().into_iter().map(|(path, _)| path).collect()
    }

    pub fn file_count(&self) -> usize {
        self.0
            .values()
            .map(|node| match node {
                FileNode::File(_) => 1,
                FileNode::Directory(sub) => sub.file_count(),
            })
            .sum()
    }

    fn collect_files<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a str)>) {
        for (key, node) in &self.0 {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}/{key}")
            };
            match node {
                FileNode::File(entry) => out.push((path, entry.file.contents.as_str())),
                FileNode::Directory(sub) => sub.collect_files(&path, out),
            }
        }
    }

    /// Check that every key can be materialised under a root directory
    /// without escaping it, and that no two entries land on the same path
    /// or use a file as a directory once flattened.
    pub fn validate(&self) -> Result<(), TreeError> {
        self.validate_keys()?;

        let paths = self.paths();
        let mut files = BTreeSet::new();
        for path in &paths {
            if !files.insert(path.as_str()) {
                return Err(TreeError::Duplicate(path.clone()));
            }
        }
        for path in &paths {
            for (idx, _) in path.match_indices('/') {
                let ancestor = &path[..idx];
                if files.contains(ancestor) {
                    return Err(TreeError::FileAsDirectory {
                        file: ancestor.to_string(),
                        path: path.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_keys(&self) -> Result<(), TreeError> {
        for (key, node) in &self.0 {
            validate_key(key)?;
            if let FileNode::Directory(sub) = node {
                sub.validate_keys()?;
            }
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), TreeError> {
    if key.contains('\0') {
        return Err(TreeError::Nul(key.to_string()));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(TreeError::Absolute(key.to_string()));
    }
    for segment in key.split(['/', '\\']) {
        match segment {
            "" => return Err(TreeError::EmptySegment(key.to_string())),
            "." | ".." => return Err(TreeError::Traversal(key.to_string())),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_and_nested_entries() {
        let json = r#"{
            "app.js": { "file": { "contents": "console.log(1)" } },
            "src": {
                "lib.js": { "file": { "contents": "module.exports = {}" } }
            }
        }"#;
        let tree: FileTree = serde_json::from_str(json).unwrap();
        assert_eq!(tree.file_count(), 2);
        assert_eq!(tree.get("app.js"), Some("console.log(1)"));
        assert_eq!(tree.get("src/lib.js"), Some("module.exports = {}"));
        assert_eq!(tree.paths(), vec!["app.js", "src/lib.js"]);
    }

    #[test]
    fn directory_holding_a_key_named_file_stays_a_directory() {
        let json = r#"{ "docs": { "file": { "file": { "contents": "x" } } } }"#;
        let tree: FileTree = serde_json::from_str(json).unwrap();
        assert_eq!(tree.get("docs/file"), Some("x"));
    }

    #[test]
    fn keys_with_slashes_are_opaque() {
        let tree = FileTree::new().with_file("public/index.html", "<h1>hi</h1>");
        assert_eq!(tree.get("public/index.html"), Some("<h1>hi</h1>"));
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn serialises_back_to_wire_shape() {
        let tree = FileTree::new().with_file("a.txt", "A");
        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(value["a.txt"]["file"]["contents"], "A");
    }

    #[test]
    fn rejects_escaping_keys() {
        let bad = FileTree::new().with_file("../etc/passwd", "x");
        assert_eq!(
            bad.validate(),
            Err(TreeError::Traversal("../etc/passwd".to_string()))
        );

        let abs = FileTree::new().with_file("/abs", "x");
        assert!(matches!(abs.validate(), Err(TreeError::Absolute(_))));

        let mut nested = FileTree::new();
        nested.insert("dir", FileNode::Directory(FileTree::new().with_file("a//b", "x")));
        assert!(matches!(nested.validate(), Err(TreeError::EmptySegment(_))));
    }

    #[test]
    fn rejects_paths_that_collide_once_flattened() {
        let file_then_dir = FileTree::new()
            .with_file("lib", "a file")
            .with_file("lib/x.js", "x");
        assert_eq!(
            file_then_dir.validate(),
            Err(TreeError::FileAsDirectory {
                file: "lib".to_string(),
                path: "lib/x.js".to_string(),
            })
        );

        let mut twice = FileTree::new().with_file("src/a.js", "flat");
        twice.insert("src", FileNode::Directory(FileTree::new().with_file("a.js", "nested")));
        assert_eq!(twice.validate(), Err(TreeError::Duplicate("src/a.js".to_string())));

        let mut nested = FileTree::new().with_file("src/index.js", "x");
        nested.insert("src", FileNode::Directory(FileTree::new().with_file("util.js", "y")));
        assert!(nested.validate().is_ok());
    }
}
