//! Logical name to filesystem location resolution across the two roots
use crate::error::{BuildError, BuildResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Where a logical name was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Found under the read-only source root
    Source(PathBuf),
    /// Found under the writable output root
    Output(PathBuf),
    /// Found under neither root
    NotFound,
}

impl Resolved {
    /// Concrete path, if the name was found
    pub fn into_path(self) -> Option<PathBuf> {
        match self {
            Self::Source(path) | Self::Output(path) => Some(path),
            Self::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Resolves logical names against the source root, then the output root
#[derive(Debug, Clone)]
pub struct PathResolver {
    source_root: PathBuf,
    output_root: PathBuf,
}

impl PathResolver {
    /// Create a resolver over the two roots
    pub fn new(source_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            output_root: output_root.into(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Look a name up in the source root, then the output root
    pub fn resolve(&self, name: &str) -> Resolved {
        let source = self.source_root.join(name);
        if source.exists() {
            return Resolved::Source(source);
        }
        let output = self.output_root.join(name);
        if output.exists() {
            return Resolved::Output(output);
        }
        Resolved::NotFound
    }

    /// Resolve a name that `target` cannot be built without
    pub fn require(&self, target: &str, name: &str) -> BuildResult<PathBuf> {
        self.resolve(name)
            .into_path()
            .ok_or_else(|| BuildError::missing_source(target, name))
    }

    /// Whether the name exists verbatim under the source root
    pub fn exists_in_source(&self, name: &str) -> bool {
        self.source_root.join(name).exists()
    }

    /// Location of `name` under the output root, without touching the filesystem
    pub fn output_location(&self, name: &str) -> PathBuf {
        self.output_root.join(name)
    }

    /// Location of `name` under the output root, with its parent directories created
    ///
    /// Concurrent callers may race on the same directory; an existing
    /// directory is not an error.
    pub fn output_path(&self, name: &str) -> BuildResult<PathBuf> {
        let path = self.output_root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn roots() -> (TempDir, PathResolver) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        let output = dir.path().join("out");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&output).unwrap();
        let resolver = PathResolver::new(source, output);
        (dir, resolver)
    }

    #[test]
    fn test_source_root_wins() {
        let (_dir, resolver) = roots();
        fs::write(resolver.source_root().join("a.png"), b"s").unwrap();
        fs::write(resolver.output_root().join("a.png"), b"o").unwrap();

        assert_eq!(
            resolver.resolve("a.png"),
            Resolved::Source(resolver.source_root().join("a.png"))
        );
    }

    #[test]
    fn test_falls_back_to_output_root() {
        let (_dir, resolver) = roots();
        fs::write(resolver.output_root().join("a.4bpp"), b"o").unwrap();

        let resolved = resolver.resolve("a.4bpp");
        assert_eq!(
            resolved,
            Resolved::Output(resolver.output_root().join("a.4bpp"))
        );
        assert!(resolved.is_found());
    }

    #[test]
    fn test_not_found_and_require() {
        let (_dir, resolver) = roots();
        assert_eq!(resolver.resolve("nope.bin"), Resolved::NotFound);
        match resolver.require("out.bin", "nope.bin") {
            Err(BuildError::MissingSource { target, name }) => {
                assert_eq!(target, "out.bin");
                assert_eq!(name, "nope.bin");
            }
            other => panic!("Expected MissingSource, got {:?}", other),
        }
    }

    #[test]
    fn test_output_path_creates_parents_twice() {
        let (_dir, resolver) = roots();
        let first = resolver.output_path("deep/nested/x.4bpp").unwrap();
        let second = resolver.output_path("deep/nested/y.4bpp").unwrap();
        assert!(first.parent().unwrap().is_dir());
        assert_eq!(first.parent(), second.parent());
        assert!(!first.exists());
    }
}
