use crate::{FileRef, FileRoot};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown external repository `@{repository}` for {file}")]
    UnknownRoot { repository: String, file: String },
}

/// Maps logical [`FileRoot`]s onto absolute filesystem locations.
///
/// Resolution is a pure string join over the configured roots; it never touches the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    workspace_root: PathBuf,
    output_base: PathBuf,
    external: BTreeMap<String, PathBuf>,
}

impl PathResolver {
    pub fn new(workspace_root: impl Into<PathBuf>, output_base: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            output_base: output_base.into(),
            external: BTreeMap::new(),
        }
    }

    pub fn with_external_repository(
        mut self,
        name: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Self {
        self.external.insert(name.into(), root.into());
        self
    }

    pub fn with_external_repositories<I, N, P>(mut self, repositories: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<PathBuf>,
    {
        for (name, root) in repositories {
            self.external.insert(name.into(), root.into());
        }
        self
    }

    /// Register every repository materialized under `<output_base>/external/`.
    ///
    /// Explicitly configured repositories take precedence over discovered ones. A missing
    /// `external/` directory is not an error.
    pub fn discover_external_repositories(mut self) -> io::Result<Self> {
        let external_dir = self.output_base.join("external");
        let entries = match fs::read_dir(&external_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(self),
            Err(err) => return Err(err),
        };

        let mut discovered = 0usize;
        for entry in entries {
            let entry = entry?;
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    tracing::debug!(
                        target = "qsync.resolver",
                        path = %entry.path().display(),
                        error = %err,
                        "failed to stat external repository entry"
                    );
                    continue;
                }
            };
            if !(file_type.is_dir() || file_type.is_symlink()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            self.external.entry(name).or_insert_with(|| {
                discovered += 1;
                entry.path()
            });
        }

        tracing::debug!(
            target = "qsync.resolver",
            output_base = %self.output_base.display(),
            discovered,
            "discovered external repositories"
        );
        Ok(self)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn output_base(&self) -> &Path {
        &self.output_base
    }

    pub fn external_repositories(&self) -> &BTreeMap<String, PathBuf> {
        &self.external
    }

    pub fn resolve(&self, file: &FileRef) -> Result<PathBuf, ResolveError> {
        let base = match file.root() {
            FileRoot::Workspace => &self.workspace_root,
            FileRoot::Output => &self.output_base,
            FileRoot::External(repository) => {
                self.external
                    .get(repository)
                    .ok_or_else(|| ResolveError::UnknownRoot {
                        repository: repository.clone(),
                        file: file.relative_path().to_string(),
                    })?
            }
        };
        Ok(join_relative(base, file.relative_path()))
    }
}

fn join_relative(base: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(base.to_path_buf(), |path, segment| path.join(segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PathResolver {
        PathResolver::new("/ws", "/out").with_external_repository("maven", "/out/external/maven")
    }

    #[test]
    fn resolves_each_root() {
        let resolver = resolver();
        assert_eq!(
            resolver
                .resolve(&FileRef::workspace("java/A.java").unwrap())
                .unwrap(),
            Path::new("/ws").join("java").join("A.java")
        );
        assert_eq!(
            resolver
                .resolve(&FileRef::output("bazel-out/lib.jar").unwrap())
                .unwrap(),
            Path::new("/out").join("bazel-out").join("lib.jar")
        );
        assert_eq!(
            resolver
                .resolve(&FileRef::external("maven", "guava.jar").unwrap())
                .unwrap(),
            Path::new("/out/external/maven").join("guava.jar")
        );
    }

    #[test]
    fn unknown_external_repository_is_an_error() {
        let err = resolver()
            .resolve(&FileRef::external("npm", "left-pad/index.js").unwrap())
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownRoot {
                repository: "npm".to_string(),
                file: "left-pad/index.js".to_string(),
            }
        );
    }
}
