use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, path::Path, str::FromStr, sync::Arc};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("label is empty")]
    Empty,

    #[error("label {label:?} must start with `//`")]
    MissingPrefix { label: String },

    #[error("label {label:?} names external repository `@{repository}`; a workspace label is required")]
    ExternalRepository { label: String, repository: String },

    #[error("label {label:?} has an invalid repository name")]
    InvalidRepository { label: String },

    #[error("label {label:?} has an invalid package: {reason}")]
    InvalidPackage { label: String, reason: &'static str },

    #[error("label {label:?} has an invalid target name: {reason}")]
    InvalidName { label: String, reason: &'static str },
}

/// Canonical identifier of a build target: `//package/path:name`.
///
/// Equality, ordering and hashing follow the canonical string form. Labels parsed with
/// [`Label::parse`] always belong to the primary workspace; [`Label::parse_with_repository`]
/// additionally accepts `@repo//...` labels, which keep their repository prefix in the canonical
/// form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    repr: Arc<str>,
    /// Byte offset of the leading `//`.
    package_start: u32,
    /// Byte offset of the `:` separating package and name.
    colon: u32,
}

impl Label {
    /// Parse a label that must belong to the primary workspace.
    ///
    /// `@//pkg:name` and `@@//pkg:name` name the main repository explicitly and are normalized to
    /// `//pkg:name`. Any other repository qualifier is rejected.
    pub fn parse(input: &str) -> Result<Self, LabelError> {
        parse_label(input, false)
    }

    /// Parse a label that may reference an external repository (`@repo//pkg:name`).
    pub fn parse_with_repository(input: &str) -> Result<Self, LabelError> {
        parse_label(input, true)
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }

    /// External repository name, or `None` for workspace labels.
    pub fn repository(&self) -> Option<&str> {
        let start = self.package_start as usize;
        if start == 0 {
            None
        } else {
            Some(&self.repr[1..start])
        }
    }

    pub fn is_external(&self) -> bool {
        self.package_start != 0
    }

    /// Package portion without the leading `//` (`""` for the root package).
    pub fn package_str(&self) -> &str {
        &self.repr[self.package_start as usize + 2..self.colon as usize]
    }

    pub fn package(&self) -> PackagePath {
        PackagePath(Arc::from(self.package_str()))
    }

    pub fn name(&self) -> &str {
        &self.repr[self.colon as usize + 1..]
    }
}

fn parse_label(input: &str, allow_external: bool) -> Result<Label, LabelError> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(LabelError::Empty);
    }

    let (repository, rest) = match raw.strip_prefix('@') {
        Some(qualified) => {
            let qualified = qualified.strip_prefix('@').unwrap_or(qualified);
            let Some(idx) = qualified.find("//") else {
                return Err(LabelError::MissingPrefix {
                    label: raw.to_string(),
                });
            };
            (&qualified[..idx], &qualified[idx..])
        }
        None => ("", raw),
    };

    let Some(body) = rest.strip_prefix("//") else {
        return Err(LabelError::MissingPrefix {
            label: raw.to_string(),
        });
    };

    if !repository.is_empty() {
        if !repository
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '+'))
        {
            return Err(LabelError::InvalidRepository {
                label: raw.to_string(),
            });
        }
        if !allow_external {
            return Err(LabelError::ExternalRepository {
                label: raw.to_string(),
                repository: repository.to_string(),
            });
        }
    }

    let (package, name) = match body.split_once(':') {
        Some((package, name)) => (package, name),
        // `//foo/bar` is shorthand for `//foo/bar:bar`.
        None => (body, body.rsplit('/').next().unwrap_or(body)),
    };

    if let Err(reason) = validate_package(package) {
        return Err(LabelError::InvalidPackage {
            label: raw.to_string(),
            reason,
        });
    }
    if let Err(reason) = validate_name(name) {
        return Err(LabelError::InvalidName {
            label: raw.to_string(),
            reason,
        });
    }

    let repr = if repository.is_empty() {
        format!("//{package}:{name}")
    } else {
        format!("@{repository}//{package}:{name}")
    };
    let package_start = if repository.is_empty() {
        0
    } else {
        repository.len() + 1
    };
    let colon = package_start + 2 + package.len();

    Ok(Label {
        repr: Arc::from(repr),
        package_start: package_start as u32,
        colon: colon as u32,
    })
}

fn validate_package(package: &str) -> Result<(), &'static str> {
    if package.is_empty() {
        return Ok(());
    }
    for segment in package.split('/') {
        match segment {
            "" => return Err("empty path segment"),
            "." | ".." => return Err("relative path segment"),
            _ => {}
        }
        if segment
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '@' | ':' | '\\'))
        {
            return Err("illegal character");
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty name");
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err("malformed path");
    }
    if name.contains(':') {
        return Err("more than one `:`");
    }
    if name.split('/').any(|segment| segment == "..") {
        return Err("relative path segment");
    }
    if name.chars().any(|c| c.is_whitespace() || c == '\\') {
        return Err("illegal character");
    }
    Ok(())
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({})", self.repr)
    }
}

impl FromStr for Label {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::parse(s)
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.repr)
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        // Dependency edges routinely point into external repositories; callers that need a
        // workspace label check `is_external` themselves.
        Label::parse_with_repository(&raw).map_err(serde::de::Error::custom)
    }
}

/// Workspace-relative package path (`""` is the root package).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackagePath(Arc<str>);

impl PackagePath {
    pub fn root() -> Self {
        Self(Arc::from(""))
    }

    pub fn new(path: &str) -> Result<Self, LabelError> {
        let path = path.trim();
        let path = path.strip_prefix("//").unwrap_or(path);
        validate_package(path).map_err(|reason| LabelError::InvalidPackage {
            label: path.to_string(),
            reason,
        })?;
        Ok(Self(Arc::from(path)))
    }

    /// Package for a workspace-relative directory (for example the parent of a BUILD file).
    pub fn from_dir(dir: &Path) -> Result<Self, LabelError> {
        let mut joined = String::new();
        for component in dir.components() {
            let segment = component.as_os_str().to_string_lossy();
            if !joined.is_empty() {
                joined.push('/');
            }
            joined.push_str(&segment);
        }
        Self::new(&joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parent(&self) -> Option<PackagePath> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind('/') {
            Some(idx) => Self(Arc::from(&self.0[..idx])),
            None => Self::root(),
        })
    }

    /// Segment-exact containment: `foo/bar` is inside `foo`, `foo2` is not.
    pub fn is_same_or_descendant_of(&self, ancestor: &PackagePath) -> bool {
        if ancestor.is_root() || self.0 == ancestor.0 {
            return true;
        }
        self.0
            .strip_prefix(&*ancestor.0)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn is_descendant_of(&self, ancestor: &PackagePath) -> bool {
        self.0 != ancestor.0 && self.is_same_or_descendant_of(ancestor)
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}", self.0)
    }
}

impl TryFrom<String> for PackagePath {
    type Error = LabelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PackagePath::new(&value)
    }
}

impl From<PackagePath> for String {
    fn from(value: PackagePath) -> Self {
        value.0.to_string()
    }
}
