use qsync_core::{Label, LabelError, PackagePath};
use std::{fmt, path::Path, str::FromStr};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("target pattern is empty")]
    Empty,

    #[error("target pattern {pattern:?} must start with `//`")]
    MissingPrefix { pattern: String },

    #[error("target pattern {pattern:?} names an external repository")]
    ExternalRepository { pattern: String },

    #[error("target pattern {pattern:?} has an unsupported target suffix `{suffix}`")]
    UnsupportedSuffix { pattern: String, suffix: String },

    #[error("invalid target pattern {pattern:?}: {source}")]
    InvalidLabel {
        pattern: String,
        #[source]
        source: LabelError,
    },

    #[error("invalid project directory {directory:?}: {source}")]
    InvalidDirectory {
        directory: String,
        #[source]
        source: LabelError,
    },

    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<PatternError>,
    },
}

/// Which labels a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetPattern {
    /// `//a/b:target`
    SingleTarget(Label),
    /// `//foo:all`
    SinglePackage(PackagePath),
    /// `//foo:*` or `//foo:all-targets`
    PackageWildcard(PackagePath),
    /// `//foo/...`; `//...` matches the whole workspace.
    RecursiveWildcard(PackagePath),
}

impl TargetPattern {
    pub fn parse(input: &str) -> Result<Self, PatternError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }

        let body = match raw.strip_prefix("@@").or_else(|| raw.strip_prefix('@')) {
            Some(rest) if rest.starts_with("//") => rest,
            Some(_) => {
                return Err(PatternError::ExternalRepository {
                    pattern: raw.to_string(),
                })
            }
            None => raw,
        };
        let Some(path) = body.strip_prefix("//") else {
            return Err(PatternError::MissingPrefix {
                pattern: raw.to_string(),
            });
        };

        let (package, suffix) = match path.rsplit_once(':') {
            Some((package, suffix)) => (package, Some(suffix)),
            None => (path, None),
        };

        let recursive = if package == "..." {
            Some("")
        } else {
            package.strip_suffix("/...")
        };
        if let Some(base) = recursive {
            return match suffix {
                None | Some("all" | "*" | "all-targets") => {
                    Ok(TargetPattern::RecursiveWildcard(package_path(raw, base)?))
                }
                Some(other) => Err(PatternError::UnsupportedSuffix {
                    pattern: raw.to_string(),
                    suffix: other.to_string(),
                }),
            };
        }

        match suffix {
            Some("all") => Ok(TargetPattern::SinglePackage(package_path(raw, package)?)),
            Some("*" | "all-targets") => {
                Ok(TargetPattern::PackageWildcard(package_path(raw, package)?))
            }
            _ => Label::parse(body)
                .map(TargetPattern::SingleTarget)
                .map_err(|source| PatternError::InvalidLabel {
                    pattern: raw.to_string(),
                    source,
                }),
        }
    }

    pub fn matches(&self, label: &Label) -> bool {
        if label.is_external() {
            return false;
        }
        match self {
            TargetPattern::SingleTarget(target) => target == label,
            TargetPattern::SinglePackage(package) | TargetPattern::PackageWildcard(package) => {
                label.package_str() == package.as_str()
            }
            TargetPattern::RecursiveWildcard(package) => {
                label.package().is_same_or_descendant_of(package)
            }
        }
    }

    /// Whether a workspace-relative file sits in a package this pattern covers.
    pub fn matches_path(&self, path: &Path) -> bool {
        let Ok(dir) = PackagePath::from_dir(path.parent().unwrap_or(Path::new(""))) else {
            return false;
        };
        match self {
            TargetPattern::SingleTarget(_) => false,
            TargetPattern::SinglePackage(package) | TargetPattern::PackageWildcard(package) => {
                dir == *package
            }
            TargetPattern::RecursiveWildcard(package) => dir.is_same_or_descendant_of(package),
        }
    }
}

fn package_path(pattern: &str, package: &str) -> Result<PackagePath, PatternError> {
    PackagePath::new(package).map_err(|source| PatternError::InvalidLabel {
        pattern: pattern.to_string(),
        source,
    })
}

impl fmt::Display for TargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPattern::SingleTarget(label) => write!(f, "{label}"),
            TargetPattern::SinglePackage(package) => write!(f, "{package}:all"),
            TargetPattern::PackageWildcard(package) => write!(f, "{package}:*"),
            TargetPattern::RecursiveWildcard(package) if package.is_root() => write!(f, "//..."),
            TargetPattern::RecursiveWildcard(package) => write!(f, "{package}/..."),
        }
    }
}

impl FromStr for TargetPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetPattern::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Include,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub kind: RuleKind,
    pub pattern: TargetPattern,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RuleKind::Include => write!(f, "{}", self.pattern),
            RuleKind::Exclude => write!(f, "-{}", self.pattern),
        }
    }
}

/// Ordered include/exclude rules. The last matching rule decides; no match means excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProjectRules {
    rules: Vec<Rule>,
}

impl ProjectRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, pattern: TargetPattern) -> Self {
        self.push(RuleKind::Include, pattern);
        self
    }

    pub fn exclude(mut self, pattern: TargetPattern) -> Self {
        self.push(RuleKind::Exclude, pattern);
        self
    }

    pub fn push(&mut self, kind: RuleKind, pattern: TargetPattern) {
        self.rules.push(Rule { kind, pattern });
    }

    pub fn extend(&mut self, other: ProjectRules) {
        self.rules.extend(other.rules);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// One pattern per line; `-` marks an exclude, `#` starts a comment.
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let mut rules = Self::default();
        for (idx, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let (kind, pattern) = split_kind(line);
            let pattern = TargetPattern::parse(pattern).map_err(|source| PatternError::Line {
                line: idx + 1,
                source: Box::new(source),
            })?;
            rules.push(kind, pattern);
        }
        Ok(rules)
    }

    /// Rules from project-view directories such as `java/com` and `-java/com/experimental`.
    pub fn from_directories<I, S>(directories: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::default();
        for entry in directories {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let (kind, directory) = split_kind(entry);
            let trimmed = directory.trim_end_matches('/');
            let trimmed = if trimmed == "." { "" } else { trimmed };
            let package =
                PackagePath::new(trimmed).map_err(|source| PatternError::InvalidDirectory {
                    directory: directory.to_string(),
                    source,
                })?;
            rules.push(kind, TargetPattern::RecursiveWildcard(package));
        }
        Ok(rules)
    }

    pub fn classify(&self, label: &Label) -> bool {
        classify(label, self)
    }

    /// Whether a workspace-relative file is inside the project.
    pub fn includes_path(&self, path: &Path) -> bool {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.pattern.matches_path(path))
            .is_some_and(|rule| rule.kind == RuleKind::Include)
    }
}

fn split_kind(entry: &str) -> (RuleKind, &str) {
    match entry.strip_prefix('-') {
        Some(rest) => (RuleKind::Exclude, rest.trim()),
        None => (RuleKind::Include, entry),
    }
}

/// Is `label` part of the project under `rules`?
pub fn classify(label: &Label, rules: &ProjectRules) -> bool {
    rules
        .rules
        .iter()
        .rev()
        .find(|rule| rule.pattern.matches(label))
        .is_some_and(|rule| rule.kind == RuleKind::Include)
}
