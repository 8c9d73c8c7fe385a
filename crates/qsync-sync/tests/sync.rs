use qsync_cache::{ArtifactCache, ArtifactFetcher, CacheError, CacheOptions, DirectoryFetcher};
use qsync_core::{
    ArtifactDigest, ArtifactKind, ArtifactRef, FileRef, Label, PathResolver, TargetKind,
    TargetRecord,
};
use qsync_graph::{ProjectRules, TargetPattern};
use qsync_sync::{
    DiagnosticKind, SyncErrorKind, SyncOptions, SyncOrchestrator, SyncPhase, SyncRequest,
};
use qsync_vcs::{FileChange, FileChangeKind, VcsState};
use std::{
    collections::BTreeSet,
    io::Write,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

fn label(raw: &str) -> Label {
    Label::parse(raw).unwrap()
}

fn src(path: &str) -> FileRef {
    FileRef::workspace(path).unwrap()
}

fn record(name: &str, deps: &[&str], sources: &[&str]) -> TargetRecord {
    TargetRecord::new(label(name), TargetKind::Library)
        .with_deps(deps.iter().map(|dep| label(dep)))
        .with_sources(sources.iter().map(|path| src(path)))
}

fn jar(bytes: &[u8], path: FileRef) -> ArtifactRef {
    ArtifactRef {
        digest: ArtifactDigest::of_bytes(bytes),
        kind: ArtifactKind::Jar,
        path,
    }
}

fn rules(patterns: &[&str]) -> ProjectRules {
    patterns.iter().fold(ProjectRules::new(), |rules, pattern| {
        rules.include(TargetPattern::parse(pattern).unwrap())
    })
}

fn fast_options() -> SyncOptions {
    SyncOptions {
        fetch_timeout: Duration::from_secs(5),
        retry_backoff: Duration::from_millis(1),
        ..SyncOptions::default()
    }
}

fn orchestrator(
    dir: &Path,
    fetcher: Arc<dyn ArtifactFetcher>,
    rules: ProjectRules,
    options: SyncOptions,
) -> SyncOrchestrator {
    orchestrator_with_cache(dir, fetcher, rules, options, CacheOptions::default())
}

fn orchestrator_with_cache(
    dir: &Path,
    fetcher: Arc<dyn ArtifactFetcher>,
    rules: ProjectRules,
    options: SyncOptions,
    cache_options: CacheOptions,
) -> SyncOrchestrator {
    let cache = ArtifactCache::open(dir.join("cache"), cache_options, fetcher).unwrap();
    let resolver = PathResolver::new(dir.join("workspace"), dir.join("output_base"));
    SyncOrchestrator::new(cache, resolver, rules, options)
}

/// Fetch directory holding the given objects under their digests.
fn store_with(dir: &Path, objects: &[&[u8]]) -> Arc<DirectoryFetcher> {
    let store = dir.join("store");
    std::fs::create_dir_all(&store).unwrap();
    for bytes in objects {
        std::fs::write(store.join(ArtifactDigest::of_bytes(bytes).as_str()), bytes).unwrap();
    }
    Arc::new(DirectoryFetcher::new(store))
}

fn at(revision: &str) -> VcsState {
    VcsState::new(revision, [])
}

#[tokio::test]
async fn first_sync_publishes_closures_membership_and_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let guava: &[u8] = b"guava classes";
    let fetcher = store_with(dir.path(), &[guava]);
    let sync = orchestrator(dir.path(), fetcher, rules(&["//java/..."]), fast_options());

    let guava_path = FileRef::output("external/maven/guava.jar").unwrap();
    let request = SyncRequest::new(at("r1")).with_records([
        record("//java/app", &["//java/lib"], &["java/app/Main.java"]),
        record("//java/lib", &["//third_party:guava"], &["java/lib/Lib.java"]),
        record("//third_party:guava", &[], &[])
            .with_artifacts([jar(guava, guava_path.clone())]),
    ]);
    let outcome = sync.sync(request).await.unwrap();

    assert!(outcome.is_clean(), "{:?}", outcome.diagnostics);
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.generation(), 1);
    assert!(Arc::ptr_eq(&snapshot, &outcome.snapshot));
    assert!(snapshot.is_in_project(&label("//java/app:app")));
    assert!(snapshot.is_in_project(&label("//java/lib:lib")));
    assert!(!snapshot.is_in_project(&label("//third_party:guava")));
    assert!(!snapshot.is_in_project(&label("//not/synced:x")));
    assert_eq!(
        snapshot.sources_of(&label("//java/app:app")),
        &[src("java/app/Main.java")]
    );

    let closure = snapshot.closure_of(&label("//java/app:app"));
    assert_eq!(
        closure.transitive_sources,
        BTreeSet::from([src("java/app/Main.java"), src("java/lib/Lib.java")])
    );
    assert_eq!(
        closure.transitive_deps,
        BTreeSet::from([label("//java/lib:lib"), label("//third_party:guava")])
    );

    let digest = ArtifactDigest::of_bytes(guava);
    let cached = &outcome.artifacts[&digest];
    assert_eq!(std::fs::read(cached).unwrap(), guava);
    assert_eq!(
        outcome.resolved[&guava_path],
        dir.path()
            .join("output_base")
            .join("external")
            .join("maven")
            .join("guava.jar")
    );
    assert_eq!(sync.phase(), SyncPhase::Published);
}

#[tokio::test]
async fn incremental_sync_touches_only_dependents_and_keeps_old_snapshot_intact() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = store_with(dir.path(), &[]);
    let sync = orchestrator(dir.path(), fetcher, rules(&["//java/..."]), fast_options());

    let first = sync
        .sync(SyncRequest::new(at("r1")).with_records([
            record("//java/a", &["//java/b"], &["java/a/A.java"]),
            record("//java/b", &[], &["java/b/B.java"]),
            record("//java/other", &[], &["java/other/O.java"]),
        ]))
        .await
        .unwrap();

    let second = sync
        .sync(SyncRequest::new(at("r1")).with_records([record(
            "//java/b",
            &[],
            &["java/b/B.java", "java/b/B2.java"],
        )]))
        .await
        .unwrap();

    assert_eq!(
        second.affected,
        BTreeSet::from([label("//java/a:a"), label("//java/b:b")])
    );
    assert_eq!(
        second.snapshot.closure_of(&label("//java/a:a")).transitive_sources,
        BTreeSet::from([
            src("java/a/A.java"),
            src("java/b/B.java"),
            src("java/b/B2.java")
        ])
    );
    assert!(second.snapshot.is_in_project(&label("//java/other:other")));

    // The earlier snapshot is untouched by the later transaction.
    assert_eq!(first.snapshot.generation(), 1);
    assert_eq!(
        first.snapshot.closure_of(&label("//java/a:a")).transitive_sources,
        BTreeSet::from([src("java/a/A.java"), src("java/b/B.java")])
    );
    assert_eq!(second.snapshot.generation(), 2);
}

#[tokio::test]
async fn rule_change_reclassifies_every_label() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = store_with(dir.path(), &[]);
    let sync = orchestrator(dir.path(), fetcher, rules(&["//java/..."]), fast_options());
    sync.sync(SyncRequest::new(at("r1")).with_records([
        record("//java/app", &["//third_party:guava"], &[]),
        record("//third_party:guava", &[], &[]),
    ]))
    .await
    .unwrap();

    sync.set_rules(rules(&["//third_party/..."]));
    // Old rules stay in effect until the next sync publishes.
    assert!(sync.snapshot().is_in_project(&label("//java/app:app")));

    let outcome = sync.sync(SyncRequest::new(at("r1"))).await.unwrap();
    assert!(!outcome.snapshot.is_in_project(&label("//java/app:app")));
    assert!(outcome.snapshot.is_in_project(&label("//third_party:guava")));
    assert_eq!(outcome.affected.len(), 2);

    // Back to incremental classification afterwards.
    let outcome = sync.sync(SyncRequest::new(at("r1"))).await.unwrap();
    assert!(outcome.affected.is_empty());
}

#[tokio::test]
async fn oversized_batch_fails_and_keeps_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = store_with(dir.path(), &[]);
    let options = SyncOptions {
        max_targets: 2,
        ..fast_options()
    };
    let sync = orchestrator(dir.path(), fetcher, rules(&["//..."]), options);
    sync.sync(SyncRequest::new(at("r1")).with_records([record("//a", &[], &[])]))
        .await
        .unwrap();

    let err = sync
        .sync(SyncRequest::new(at("r2")).with_records([
            record("//a", &["//b"], &[]),
            record("//b", &[], &[]),
            record("//c", &[], &[]),
        ]))
        .await
        .unwrap_err();

    assert_eq!(err.stage, SyncPhase::Merging);
    assert_eq!(err.kind, SyncErrorKind::TooManyTargets { count: 3, max: 2 });
    assert_eq!(sync.phase(), SyncPhase::Failed);

    let snapshot = sync.snapshot();
    assert_eq!(snapshot.generation(), 1);
    assert_eq!(snapshot.vcs_state().upstream_revision, "r1");
    assert!(!snapshot.contains(&label("//b:b")));
    assert!(snapshot.graph().get(&label("//a:a")).unwrap().deps.is_empty());
}

#[tokio::test]
async fn artifact_problems_become_diagnostics_on_degraded_labels() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = store_with(dir.path(), &[]);
    let sync = orchestrator(dir.path(), fetcher, rules(&["//..."]), fast_options());

    let outcome = sync
        .sync(SyncRequest::new(at("r1")).with_records([
            record("//lib:missing", &[], &[])
                .with_artifacts([jar(b"never stored", FileRef::output("lib/m.jar").unwrap())]),
            record("//lib:external", &[], &[]).with_artifacts([jar(
                b"elsewhere",
                FileRef::external("unknown_repo", "x.jar").unwrap(),
            )]),
            record("//lib:fine", &[], &[]),
        ]))
        .await
        .unwrap();

    let kinds: Vec<_> = outcome
        .diagnostics
        .iter()
        .map(|d| (d.label.clone().unwrap(), d.kind.clone()))
        .collect();
    assert!(kinds.contains(&(label("//lib:missing"), DiagnosticKind::ArtifactMissing)));
    assert!(kinds.contains(&(
        label("//lib:external"),
        DiagnosticKind::UnknownRoot {
            repository: "unknown_repo".to_string(),
            file: "x.jar".to_string(),
        }
    )));

    let snapshot = &outcome.snapshot;
    assert_eq!(snapshot.generation(), 1);
    assert!(snapshot.is_degraded(&label("//lib:missing")));
    assert!(snapshot.is_degraded(&label("//lib:external")));
    assert!(!snapshot.is_degraded(&label("//lib:fine")));
    assert!(snapshot.contains(&label("//lib:missing")));
    assert!(snapshot.is_in_project(&label("//lib:missing")));
}

/// Fails the first `failures` fetches, then serves `bytes`.
struct FlakyFetcher {
    bytes: Vec<u8>,
    failures: usize,
    calls: AtomicUsize,
}

impl ArtifactFetcher for FlakyFetcher {
    fn fetch(&self, digest: &ArtifactDigest, out: &mut dyn Write) -> qsync_cache::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(CacheError::Fetch {
                digest: digest.clone(),
                message: "remote cache unavailable".to_string(),
            });
        }
        out.write_all(&self.bytes)?;
        Ok(())
    }
}

#[tokio::test]
async fn transient_fetch_failures_are_retried_up_to_the_limit() {
    let bytes = b"retry me".to_vec();
    let request = || {
        SyncRequest::new(at("r1")).with_records([record("//lib", &[], &[])
            .with_artifacts([jar(&bytes, FileRef::output("lib/lib.jar").unwrap())])])
    };

    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FlakyFetcher {
        bytes: bytes.clone(),
        failures: 2,
        calls: AtomicUsize::new(0),
    });
    let sync = orchestrator(dir.path(), fetcher.clone(), rules(&["//..."]), fast_options());
    let outcome = sync.sync(request()).await.unwrap();
    assert!(outcome.is_clean(), "{:?}", outcome.diagnostics);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FlakyFetcher {
        bytes: bytes.clone(),
        failures: 10,
        calls: AtomicUsize::new(0),
    });
    let options = SyncOptions {
        fetch_attempts: 2,
        ..fast_options()
    };
    let sync = orchestrator(dir.path(), fetcher.clone(), rules(&["//..."]), options);
    let outcome = sync.sync(request()).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert!(matches!(
        &outcome.diagnostics[..],
        [diagnostic] if matches!(diagnostic.kind, DiagnosticKind::ArtifactUnavailable { attempts: 2, .. })
    ));
    assert!(outcome.snapshot.is_degraded(&label("//lib:lib")));
}

#[tokio::test]
async fn deleted_build_file_removes_the_package_targets() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = store_with(dir.path(), &[]);
    let sync = orchestrator(dir.path(), fetcher, rules(&["//java/..."]), fast_options());
    sync.sync(SyncRequest::new(at("r1")).with_records([
        record("//java/app", &["//java/lib"], &["java/app/Main.java"]),
        record("//java/lib", &[], &["java/lib/Lib.java"]),
        record("//java/lib:util", &[], &["java/lib/Util.java"]),
    ]))
    .await
    .unwrap();

    let vcs = VcsState::new(
        "r1",
        [FileChange::new("java/lib/BUILD", FileChangeKind::Deleted)],
    );
    let outcome = sync.sync(SyncRequest::new(vcs)).await.unwrap();

    assert!(outcome
        .affected_packages
        .deleted
        .iter()
        .any(|package| package.as_str() == "java/lib"));
    let snapshot = &outcome.snapshot;
    assert!(!snapshot.contains(&label("//java/lib:lib")));
    assert!(!snapshot.contains(&label("//java/lib:util")));
    assert!(!snapshot.is_in_project(&label("//java/lib:lib")));
    // The dependent keeps its edge; the dep is now an external leaf.
    let closure = snapshot.closure_of(&label("//java/app:app"));
    assert_eq!(closure.transitive_deps, BTreeSet::from([label("//java/lib:lib")]));
    assert_eq!(
        closure.transitive_sources,
        BTreeSet::from([src("java/app/Main.java")])
    );
}

#[tokio::test]
async fn upstream_revision_change_marks_everything_affected() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = store_with(dir.path(), &[]);
    let sync = orchestrator(dir.path(), fetcher, rules(&["//..."]), fast_options());
    sync.sync(SyncRequest::new(at("r1")).with_records([
        record("//a", &["//b"], &[]),
        record("//b", &[], &[]),
        record("//c", &[], &[]),
    ]))
    .await
    .unwrap();

    let outcome = sync.sync(SyncRequest::new(at("r2"))).await.unwrap();
    assert!(outcome.changed_paths.full_revision_changed);
    assert_eq!(
        outcome.affected,
        BTreeSet::from([label("//a:a"), label("//b:b"), label("//c:c")])
    );
    assert_eq!(outcome.snapshot.vcs_state().upstream_revision, "r2");
}

#[tokio::test]
async fn dependency_cycle_publishes_with_degraded_labels() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = store_with(dir.path(), &[]);
    let sync = orchestrator(dir.path(), fetcher, rules(&["//..."]), fast_options());

    let outcome = sync
        .sync(SyncRequest::new(at("r1")).with_records([
            record("//a", &["//b"], &["a/A.java"]),
            record("//b", &["//a"], &["b/B.java"]),
            record("//c", &[], &[]),
        ]))
        .await
        .unwrap();

    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| matches!(d.kind, DiagnosticKind::Cycle { .. })));
    let snapshot = &outcome.snapshot;
    assert!(snapshot.is_degraded(&label("//a:a")) || snapshot.is_degraded(&label("//b:b")));
    assert!(!snapshot.is_degraded(&label("//c:c")));
    assert_eq!(
        snapshot.closure_of(&label("//a:a")).transitive_sources,
        BTreeSet::from([src("a/A.java"), src("b/B.java")])
    );

    // An unrelated sync neither reports the cycle again nor clears it.
    let degraded = outcome.snapshot.degraded().clone();
    let next = sync
        .sync(SyncRequest::new(at("r1")).with_records([record("//d", &[], &[])]))
        .await
        .unwrap();
    assert!(next.is_clean(), "{:?}", next.diagnostics);
    assert_eq!(next.snapshot.degraded(), &degraded);
}

#[tokio::test]
async fn removals_and_self_dependencies_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = store_with(dir.path(), &[]);
    let sync = orchestrator(dir.path(), fetcher, rules(&["//..."]), fast_options());
    sync.sync(SyncRequest::new(at("r1")).with_records([
        record("//a", &["//b"], &[]),
        record("//b", &[], &[]),
    ]))
    .await
    .unwrap();

    let outcome = sync
        .sync(
            SyncRequest::new(at("r1"))
                .with_removed([label("//b:b")])
                .with_records([record("//d", &["//d"], &[])]),
        )
        .await
        .unwrap();
    assert!(!outcome.snapshot.contains(&label("//b:b")));
    assert!(outcome.affected.contains(&label("//a:a")));
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::SelfDependency
            && d.label.as_ref() == Some(&label("//d:d"))));
    assert!(outcome.snapshot.is_degraded(&label("//d:d")));
}

#[tokio::test]
async fn published_artifacts_stay_on_disk_past_the_cache_budget() {
    let dir = tempfile::tempdir().unwrap();
    let (first, second): (&[u8], &[u8]) = (b"jar one.", b"jar two.");
    let fetcher = store_with(dir.path(), &[first, second]);
    let cache_options = CacheOptions {
        max_bytes: 10,
        ..CacheOptions::default()
    };
    let sync = orchestrator_with_cache(
        dir.path(),
        fetcher,
        rules(&["//..."]),
        fast_options(),
        cache_options,
    );

    let outcome = sync
        .sync(SyncRequest::new(at("r1")).with_records([
            record("//one", &[], &[])
                .with_artifacts([jar(first, FileRef::output("one/one.jar").unwrap())]),
            record("//two", &[], &[])
                .with_artifacts([jar(second, FileRef::output("two/two.jar").unwrap())]),
        ]))
        .await
        .unwrap();

    assert!(outcome.is_clean(), "{:?}", outcome.diagnostics);
    assert_eq!(outcome.artifacts.len(), 2);
    assert_eq!(outcome.pins.len(), 2);
    for (digest, path) in &outcome.artifacts {
        assert!(path.is_file(), "{digest} was evicted while published");
    }
    assert_eq!(sync.cache().stats().pinned_entries, 2);

    drop(outcome);
    let stats = sync.cache().stats();
    assert_eq!(stats.pinned_entries, 0);
    assert!(stats.total_bytes <= 10, "{stats:?}");
}

#[tokio::test]
async fn degraded_artifact_is_fetched_again_by_an_unrelated_sync() {
    let bytes = b"flaky jar".to_vec();
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FlakyFetcher {
        bytes: bytes.clone(),
        failures: 1,
        calls: AtomicUsize::new(0),
    });
    let options = SyncOptions {
        fetch_attempts: 1,
        ..fast_options()
    };
    let sync = orchestrator(dir.path(), fetcher.clone(), rules(&["//..."]), options);

    let first = sync
        .sync(SyncRequest::new(at("r1")).with_records([record("//lib", &[], &[])
            .with_artifacts([jar(&bytes, FileRef::output("lib/lib.jar").unwrap())])]))
        .await
        .unwrap();
    assert!(first.snapshot.is_degraded(&label("//lib:lib")));
    assert!(first.artifacts.is_empty());

    let second = sync
        .sync(SyncRequest::new(at("r1")).with_records([record("//other", &[], &[])]))
        .await
        .unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert!(second.is_clean(), "{:?}", second.diagnostics);
    assert!(!second.snapshot.is_degraded(&label("//lib:lib")));
    assert!(second
        .artifacts
        .contains_key(&ArtifactDigest::of_bytes(&bytes)));
    assert!(!second.affected.contains(&label("//lib:lib")));
}
