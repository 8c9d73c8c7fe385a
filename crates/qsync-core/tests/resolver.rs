use qsync_core::{FileRef, PathResolver, ResolveError};
use tempfile::tempdir;

#[test]
fn discovers_materialized_external_repositories() {
    let output_base = tempdir().unwrap();
    std::fs::create_dir_all(output_base.path().join("external/maven/v1")).unwrap();
    std::fs::create_dir_all(output_base.path().join("external/rules_java")).unwrap();
    std::fs::write(output_base.path().join("external/@maven.marker"), "").unwrap();

    let resolver = PathResolver::new("/ws", output_base.path())
        .discover_external_repositories()
        .unwrap();

    let repos: Vec<_> = resolver.external_repositories().keys().cloned().collect();
    assert_eq!(repos, vec!["maven".to_string(), "rules_java".to_string()]);

    let jar = FileRef::external("maven", "v1/guava.jar").unwrap();
    assert_eq!(
        resolver.resolve(&jar).unwrap(),
        output_base.path().join("external/maven/v1/guava.jar")
    );
}

#[test]
fn explicit_repositories_win_over_discovered_ones() {
    let output_base = tempdir().unwrap();
    std::fs::create_dir_all(output_base.path().join("external/maven")).unwrap();
    let override_root = tempdir().unwrap();

    let resolver = PathResolver::new("/ws", output_base.path())
        .with_external_repository("maven", override_root.path())
        .discover_external_repositories()
        .unwrap();

    assert_eq!(
        resolver.external_repositories().get("maven").unwrap(),
        override_root.path()
    );
}

#[test]
fn missing_external_dir_leaves_resolver_unchanged() {
    let output_base = tempdir().unwrap();
    let resolver = PathResolver::new("/ws", output_base.path())
        .discover_external_repositories()
        .unwrap();
    assert!(resolver.external_repositories().is_empty());

    let err = resolver
        .resolve(&FileRef::external("maven", "guava.jar").unwrap())
        .unwrap_err();
    assert!(matches!(err, ResolveError::UnknownRoot { .. }));
}
