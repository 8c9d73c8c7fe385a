use qsync_config::{load_for_workspace, ByteSize, ConfigError, QsyncConfig};
use qsync_core::{FileRef, Label};
use std::{path::PathBuf, time::Duration};

#[test]
fn full_file_parses_and_feeds_every_builder() {
    let text = r#"
        [workspace]
        root = "/ws"
        output_base = "/ob"
        discover_external = false
        [workspace.external]
        maven = "/ext/maven"

        [project]
        directories = ["java/com/example", "-java/com/example/experimental"]
        targets = ["//tools/...", "-//tools/legacy:all"]

        [cache]
        dir = "/var/cache/qsync"
        max_bytes = "512MiB"
        verify_digests = false

        [sync]
        fetch_parallelism = 4
        fetch_timeout_ms = 1500
        fetch_attempts = 5
        retry_backoff_ms = 10
        max_targets = 1000

        [logging]
        level = "debug"
        json = true
        stderr = false
    "#;
    let config = QsyncConfig::load_from_str(text).unwrap();

    let cache = config.cache_options();
    assert_eq!(cache.max_bytes, 512 << 20);
    assert!(!cache.verify_digests);

    let sync = config.sync_options();
    assert_eq!(sync.fetch_parallelism, 4);
    assert_eq!(sync.fetch_timeout, Duration::from_millis(1500));
    assert_eq!(sync.fetch_attempts, 5);
    assert_eq!(sync.retry_backoff, Duration::from_millis(10));
    assert_eq!(sync.max_targets, 1000);

    let rules = config.project_rules().unwrap();
    let in_project = |raw: &str| rules.classify(&Label::parse(raw).unwrap());
    assert!(in_project("//java/com/example/app:app"));
    assert!(!in_project("//java/com/example/experimental:x"));
    assert!(in_project("//tools/gen:gen"));
    assert!(!in_project("//tools/legacy:old"));
    assert!(!in_project("//third_party:guava"));

    let resolver = config.path_resolver().unwrap();
    assert_eq!(
        resolver
            .resolve(&FileRef::external("maven", "guava.jar").unwrap())
            .unwrap(),
        PathBuf::from("/ext/maven/guava.jar")
    );
    assert_eq!(
        resolver
            .resolve(&FileRef::output("bin/app.jar").unwrap())
            .unwrap(),
        PathBuf::from("/ob/bin/app.jar")
    );

    assert!(config.logging.json);
    assert!(!config.logging.stderr);
}

#[test]
fn missing_sections_take_defaults() {
    let config = QsyncConfig::load_from_str("").unwrap();
    assert_eq!(config, QsyncConfig::default());
    assert_eq!(config.cache.max_bytes, ByteSize::gib(2));
    assert_eq!(config.sync.fetch_attempts, 3);
    assert_eq!(config.logging.level, "info");

    let rules = config.project_rules().unwrap();
    assert!(rules.classify(&Label::parse("//anything:at_all").unwrap()));
}

#[test]
fn integer_sizes_are_bytes() {
    let config = QsyncConfig::load_from_str("[cache]\nmax_bytes = 4096\n").unwrap();
    assert_eq!(config.cache.max_bytes, ByteSize(4096));
}

#[test]
fn unknown_keys_are_rejected_without_echoing_them() {
    let err = QsyncConfig::load_from_str("[cache]\nsecret_token = \"hunter2\"\n").unwrap_err();
    let ConfigError::Toml(message) = &err else {
        panic!("expected a toml error, got {err:?}");
    };
    assert!(!message.contains("secret_token"), "{message}");
    assert!(!message.contains("hunter2"), "{message}");
}

#[test]
fn bad_values_are_invalid() {
    let err = QsyncConfig::load_from_str("[sync]\nfetch_attempts = 0\n").unwrap_err();
    assert!(
        matches!(err, ConfigError::Invalid { field: "sync.fetch_attempts", .. }),
        "{err:?}"
    );

    let err = QsyncConfig::load_from_str("[project]\ntargets = [\"tools/...\"]\n").unwrap_err();
    assert!(
        matches!(err, ConfigError::Invalid { field: "project.targets", .. }),
        "{err:?}"
    );

    let err = QsyncConfig::load_from_str("[cache]\nmax_bytes = \"lots\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)), "{err:?}");
}

#[test]
fn relative_paths_resolve_against_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    std::fs::write(
        root.join(".qsync.toml"),
        "[workspace]\nroot = \"src/..\"\n[cache]\ndir = \"cache\"\n[logging]\nfile = \"logs/qsync.log\"\n",
    )
    .unwrap();

    let (config, path) = load_for_workspace(&root).unwrap();
    assert_eq!(path, Some(root.join(".qsync.toml")));
    assert_eq!(config.workspace.root, root);
    assert_eq!(config.cache.dir, root.join("cache"));
    assert_eq!(config.logging.file, Some(root.join("logs/qsync.log")));
    assert_eq!(config.workspace.output_base(), root.join("bazel-out"));
}

#[test]
fn workspace_without_a_config_file_uses_defaults_at_the_root() {
    let dir = tempfile::tempdir().unwrap();
    let (config, path) = load_for_workspace(dir.path()).unwrap();
    assert!(path.is_none());
    assert_eq!(config.workspace.root, dir.path());
    assert_eq!(config.cache.dir, dir.path().join(".qsync/cache"));
}

#[test]
fn discovered_external_repositories_are_added_to_the_resolver() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("bazel-out/external/rules_java")).unwrap();
    let mut config = QsyncConfig::default();
    config.resolve_relative_paths(dir.path());

    let resolver = config.path_resolver().unwrap();
    assert!(resolver.external_repositories().contains_key("rules_java"));
}
