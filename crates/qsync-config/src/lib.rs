//! `.qsync.toml` loading and the logging setup shared by qsync binaries.
//!
//! A [`QsyncConfig`] is a plain serde model of the file. Relative paths inside it are resolved
//! against the directory of the file it was read from; the builder methods turn the sections into
//! the option types of the other qsync crates.

mod error;
mod logging;
mod size;

pub use crate::{
    error::ConfigError,
    logging::{init_tracing, LoggingConfig},
    size::{ByteSize, ByteSizeError},
};

use qsync_cache::CacheOptions;
use qsync_core::PathResolver;
use qsync_graph::{ProjectRules, TargetPattern};
use qsync_sync::SyncOptions;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

/// Environment variable naming an explicit config file. Relative values are resolved against the
/// workspace root.
pub const QSYNC_CONFIG_ENV_VAR: &str = "QSYNC_CONFIG_PATH";

const CONFIG_FILE_NAMES: [&str; 2] = [".qsync.toml", "qsync.toml"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QsyncConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default = "WorkspaceConfig::default_root")]
    pub root: PathBuf,

    /// Defaults to `<root>/bazel-out` when unset.
    #[serde(default)]
    pub output_base: Option<PathBuf>,

    /// External repository name to its checkout directory.
    #[serde(default)]
    pub external: BTreeMap<String, PathBuf>,

    /// Also pick up repositories found under `<output_base>/external`.
    #[serde(default = "WorkspaceConfig::default_discover_external")]
    pub discover_external: bool,
}

impl WorkspaceConfig {
    fn default_root() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_discover_external() -> bool {
        true
    }

    pub fn output_base(&self) -> PathBuf {
        self.output_base
            .clone()
            .unwrap_or_else(|| self.root.join("bazel-out"))
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            output_base: None,
            external: BTreeMap::new(),
            discover_external: Self::default_discover_external(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project-view directories; a leading `-` excludes.
    #[serde(default)]
    pub directories: Vec<String>,

    /// Target patterns, applied after `directories`; a leading `-` excludes.
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_dir")]
    pub dir: PathBuf,

    #[serde(default = "CacheConfig::default_max_bytes")]
    pub max_bytes: ByteSize,

    #[serde(default = "CacheConfig::default_verify_digests")]
    pub verify_digests: bool,
}

impl CacheConfig {
    fn default_dir() -> PathBuf {
        PathBuf::from(".qsync/cache")
    }

    fn default_max_bytes() -> ByteSize {
        ByteSize::gib(2)
    }

    fn default_verify_digests() -> bool {
        true
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: Self::default_dir(),
            max_bytes: Self::default_max_bytes(),
            verify_digests: Self::default_verify_digests(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "SyncConfig::default_fetch_parallelism")]
    pub fetch_parallelism: usize,
    #[serde(default = "SyncConfig::default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "SyncConfig::default_fetch_attempts")]
    pub fetch_attempts: u32,
    #[serde(default = "SyncConfig::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "SyncConfig::default_max_targets")]
    pub max_targets: usize,
}

impl SyncConfig {
    fn default_fetch_parallelism() -> usize {
        8
    }

    fn default_fetch_timeout_ms() -> u64 {
        30_000
    }

    fn default_fetch_attempts() -> u32 {
        3
    }

    fn default_retry_backoff_ms() -> u64 {
        200
    }

    fn default_max_targets() -> usize {
        5_000_000
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_parallelism: Self::default_fetch_parallelism(),
            fetch_timeout_ms: Self::default_fetch_timeout_ms(),
            fetch_attempts: Self::default_fetch_attempts(),
            retry_backoff_ms: Self::default_retry_backoff_ms(),
            max_targets: Self::default_max_targets(),
        }
    }
}

impl QsyncConfig {
    /// Parse TOML text. Relative paths are left untouched.
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: QsyncConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file and resolve its relative paths against the file's directory.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::io(path, source))?;
        let mut config = Self::load_from_str(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_relative_paths(base);
        Ok(config)
    }

    /// Make every relative path absolute with respect to `base`.
    pub fn resolve_relative_paths(&mut self, base: &Path) {
        let join = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = normalize(&base.join(&*path));
            }
        };
        join(&mut self.workspace.root);
        if let Some(output_base) = self.workspace.output_base.as_mut() {
            join(output_base);
        }
        self.workspace.external.values_mut().for_each(join);
        join(&mut self.cache.dir);
        if let Some(file) = self.logging.file.as_mut() {
            join(file);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.fetch_parallelism == 0 {
            return Err(ConfigError::invalid(
                "sync.fetch_parallelism",
                "must be at least 1",
            ));
        }
        if self.sync.fetch_attempts == 0 {
            return Err(ConfigError::invalid("sync.fetch_attempts", "must be at least 1"));
        }
        if self.sync.fetch_timeout_ms == 0 {
            return Err(ConfigError::invalid("sync.fetch_timeout_ms", "must be positive"));
        }
        if self.sync.max_targets == 0 {
            return Err(ConfigError::invalid("sync.max_targets", "must be at least 1"));
        }
        if self.cache.max_bytes.as_u64() == 0 {
            return Err(ConfigError::invalid("cache.max_bytes", "must be positive"));
        }
        if let Some(name) = self
            .workspace
            .external
            .keys()
            .find(|name| name.is_empty() || name.contains(['/', '@']))
        {
            return Err(ConfigError::invalid(
                "workspace.external",
                format!("{name:?} is not a repository name"),
            ));
        }
        self.project_rules().map(drop)
    }

    /// Project membership rules: directories first, then target patterns.
    ///
    /// With neither configured, every workspace label is in the project.
    pub fn project_rules(&self) -> Result<ProjectRules, ConfigError> {
        let mut rules = ProjectRules::from_directories(&self.project.directories)
            .map_err(|err| ConfigError::invalid("project.directories", err.to_string()))?;
        let targets = ProjectRules::parse(&self.project.targets.join("\n"))
            .map_err(|err| ConfigError::invalid("project.targets", err.to_string()))?;
        rules.extend(targets);
        if rules.is_empty() {
            let everything = TargetPattern::parse("//...")
                .map_err(|err| ConfigError::invalid("project", err.to_string()))?;
            rules = rules.include(everything);
        }
        Ok(rules)
    }

    /// The resolver for this workspace, including discovered external repositories when enabled.
    pub fn path_resolver(&self) -> Result<PathResolver, ConfigError> {
        let output_base = self.workspace.output_base();
        let resolver = PathResolver::new(&self.workspace.root, &output_base)
            .with_external_repositories(self.workspace.external.clone());
        if !self.workspace.discover_external {
            return Ok(resolver);
        }
        resolver
            .discover_external_repositories()
            .map_err(|source| ConfigError::io(&output_base.join("external"), source))
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            max_bytes: self.cache.max_bytes.as_u64(),
            verify_digests: self.cache.verify_digests,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            fetch_parallelism: self.sync.fetch_parallelism,
            fetch_timeout: Duration::from_millis(self.sync.fetch_timeout_ms),
            fetch_attempts: self.sync.fetch_attempts,
            retry_backoff: Duration::from_millis(self.sync.retry_backoff_ms),
            max_targets: self.sync.max_targets,
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Locate the config file for `workspace_root`: `$QSYNC_CONFIG_PATH` first, then `.qsync.toml`
/// and `qsync.toml` in the root.
pub fn discover_config_path(workspace_root: &Path) -> Option<PathBuf> {
    if let Some(value) = std::env::var_os(QSYNC_CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(value);
        let path = if candidate.is_absolute() {
            candidate
        } else {
            workspace_root.join(candidate)
        };
        return Some(path.canonicalize().unwrap_or(path));
    }

    CONFIG_FILE_NAMES
        .into_iter()
        .map(|name| workspace_root.join(name))
        .find(|path| path.is_file())
        .map(|path| path.canonicalize().unwrap_or(path))
}

/// Load the configuration for a workspace root.
///
/// Without a config file this is [`QsyncConfig::default`] rooted at `workspace_root`, and `None`.
pub fn load_for_workspace(
    workspace_root: &Path,
) -> Result<(QsyncConfig, Option<PathBuf>), ConfigError> {
    let Some(path) = discover_config_path(workspace_root) else {
        let mut config = QsyncConfig::default();
        config.resolve_relative_paths(workspace_root);
        return Ok((config, None));
    };

    tracing::debug!(target = "qsync.config", path = %path.display(), "loading config");
    let config = QsyncConfig::load_from_path(&path)?;
    Ok((config, Some(path)))
}
