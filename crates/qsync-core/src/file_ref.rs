use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical root a [`FileRef`] is relative to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRoot {
    /// The primary workspace (source tree).
    Workspace,
    /// The build tool's output base (generated files, compiled artifacts).
    Output,
    /// A materialized external repository.
    External(String),
}

impl fmt::Display for FileRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileRoot::Workspace => f.write_str("workspace"),
            FileRoot::Output => f.write_str("output"),
            FileRoot::External(repo) => write!(f, "external:{repo}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileRefError {
    #[error("file path is empty")]
    Empty,
    #[error("file path {path:?} must be relative to its root")]
    Absolute { path: String },
    #[error("file path {path:?} escapes its root")]
    EscapesRoot { path: String },
    #[error("external repository name must not be empty")]
    EmptyRepository,
}

/// A file identified by a logical root and a `/`-separated relative path.
///
/// Two refs are equal iff both root and relative path match; the absolute location is derived by
/// a [`crate::PathResolver`] and never takes part in equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawFileRef", into = "RawFileRef")]
pub struct FileRef {
    root: FileRoot,
    relative_path: String,
}

#[derive(Serialize, Deserialize)]
struct RawFileRef {
    root: FileRoot,
    path: String,
}

impl TryFrom<RawFileRef> for FileRef {
    type Error = FileRefError;

    fn try_from(raw: RawFileRef) -> Result<Self, Self::Error> {
        FileRef::new(raw.root, &raw.path)
    }
}

impl From<FileRef> for RawFileRef {
    fn from(file: FileRef) -> Self {
        RawFileRef {
            root: file.root,
            path: file.relative_path,
        }
    }
}

impl FileRef {
    pub fn new(root: FileRoot, relative_path: &str) -> Result<Self, FileRefError> {
        if let FileRoot::External(repo) = &root {
            if repo.trim().is_empty() {
                return Err(FileRefError::EmptyRepository);
            }
        }
        let relative_path = normalize_relative(relative_path)?;
        Ok(Self {
            root,
            relative_path,
        })
    }

    pub fn workspace(relative_path: &str) -> Result<Self, FileRefError> {
        Self::new(FileRoot::Workspace, relative_path)
    }

    pub fn output(relative_path: &str) -> Result<Self, FileRefError> {
        Self::new(FileRoot::Output, relative_path)
    }

    pub fn external(repository: &str, relative_path: &str) -> Result<Self, FileRefError> {
        Self::new(FileRoot::External(repository.to_string()), relative_path)
    }

    pub fn root(&self) -> &FileRoot {
        &self.root
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// Directory portion of the relative path (`""` for files directly under the root).
    pub fn parent_dir(&self) -> &str {
        match self.relative_path.rfind('/') {
            Some(idx) => &self.relative_path[..idx],
            None => "",
        }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root, self.relative_path)
    }
}

fn normalize_relative(raw: &str) -> Result<String, FileRefError> {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(FileRefError::Empty);
    }
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(FileRefError::Absolute {
            path: raw.to_string(),
        });
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(FileRefError::EscapesRoot {
                    path: raw.to_string(),
                })
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(FileRefError::Empty);
    }
    Ok(segments.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
