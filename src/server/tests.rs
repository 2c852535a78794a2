use super::*;
use crate::core::config::RepositoryConfig;
use crate::core::types::{BranchId, BranchPoint, ClassId, Feature, ObjectId, Timestamp, Value, Version};
use crate::core::Error;
use crate::delta::{FeatureDelta, RevisionDelta, NO_INDEX};
use crate::revision::Revision;
use crate::storage::UNCHUNKED;

const NAME: Feature = Feature::attribute(1);
const ITEMS: Feature = Feature::reference_list(2);

fn repository() -> Repository {
    Repository::in_memory(&RepositoryConfig::default())
}

fn create(repo: &Repository, name: &str) -> Revision {
    let mut rev = Revision::new(ObjectId::Temp(1), ClassId(1));
    rev.set(NAME.id, Value::from(name));
    let request = CommitRequest {
        branch: BranchId::MAIN,
        new_objects: vec![rev],
        ..Default::default()
    };
    let mut result = repo.commit(0, request).unwrap();
    result.revisions.remove(0)
}

fn rename(base: &Revision, name: &str) -> RevisionDelta {
    let mut delta = RevisionDelta::new(base);
    delta.add_feature_delta(FeatureDelta::Set { feature: NAME, index: NO_INDEX, value: name.into() });
    delta
}

#[test]
fn new_objects_get_permanent_ids_and_first_version() {
    let repo = repository();
    let mut parent = Revision::new(ObjectId::Temp(1), ClassId(1));
    parent.set_list(ITEMS.id, vec![Value::Ref(ObjectId::Temp(2))]);
    let mut child = Revision::new(ObjectId::Temp(2), ClassId(2));
    child.set_container(ObjectId::Null, ObjectId::Temp(1), ITEMS.id.0 as i32);

    let result = repo
        .commit(0, CommitRequest {
            branch: BranchId::MAIN,
            new_objects: vec![parent, child],
            ..Default::default()
        })
        .unwrap();

    let mapping: std::collections::HashMap<_, _> = result.id_mappings.iter().copied().collect();
    let parent_id = mapping[&ObjectId::Temp(1)];
    let child_id = mapping[&ObjectId::Temp(2)];
    assert!(!parent_id.is_temporary() && !child_id.is_temporary());

    let stored = repo
        .store()
        .accessor()
        .read_revision(parent_id, BranchPoint::main_head(), UNCHUNKED)
        .unwrap()
        .unwrap();
    assert_eq!(stored.version(), Version::FIRST);
    assert_eq!(stored.list(ITEMS.id), &[Value::Ref(child_id)]);
    assert_eq!(stored.created(), result.timestamp);
    assert_eq!(result.revisions[1].container(), parent_id);
}

#[test]
fn dirty_commit_bumps_version_and_revises_predecessor() {
    let repo = repository();
    let base = create(&repo, "A");

    let result = repo
        .commit(0, CommitRequest {
            branch: BranchId::MAIN,
            dirty: vec![rename(&base, "B")],
            ..Default::default()
        })
        .unwrap();
    let next = &result.revisions[0];
    assert_eq!(next.version(), Version(2));
    assert_eq!(next.get(NAME.id), Some(&Value::from("B")));

    let accessor = repo.store().accessor();
    let old = accessor
        .read_revision_by_version(base.id(), BranchId::MAIN, Version(1), UNCHUNKED)
        .unwrap()
        .unwrap();
    assert_eq!(old.revised(), result.timestamp.previous());

    // An audit at the first commit still sees "A"
    let audit = accessor
        .read_revision(base.id(), BranchPoint::new(BranchId::MAIN, base.created()), UNCHUNKED)
        .unwrap()
        .unwrap();
    assert_eq!(audit.get(NAME.id), Some(&Value::from("A")));
}

#[test]
fn stale_base_version_is_a_conflict() {
    let repo = repository();
    let base = create(&repo, "A");
    repo.commit(0, CommitRequest { branch: BranchId::MAIN, dirty: vec![rename(&base, "B")], ..Default::default() })
        .unwrap();

    let err = repo
        .commit(0, CommitRequest { branch: BranchId::MAIN, dirty: vec![rename(&base, "C")], ..Default::default() })
        .unwrap_err();
    match err {
        Error::CommitConflict { id, base: edited, head } => {
            assert_eq!(id, base.id());
            assert_eq!(edited, Version(1));
            assert_eq!(head, Version(2));
        }
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[test]
fn conflicting_commit_writes_nothing() {
    let repo = repository();
    let a = create(&repo, "A");
    let b = create(&repo, "B");
    repo.commit(0, CommitRequest { branch: BranchId::MAIN, dirty: vec![rename(&b, "B2")], ..Default::default() })
        .unwrap();

    let err = repo.commit(0, CommitRequest {
        branch: BranchId::MAIN,
        dirty: vec![rename(&a, "A2"), rename(&b, "B3")],
        ..Default::default()
    });
    assert!(err.unwrap_err().is_conflict());

    let current = repo
        .store()
        .accessor()
        .read_revision(a.id(), BranchPoint::main_head(), UNCHUNKED)
        .unwrap()
        .unwrap();
    assert_eq!(current.version(), Version(1));
}

#[test]
fn detached_objects_disappear_from_head() {
    let repo = repository();
    let base = create(&repo, "A");
    repo.commit(0, CommitRequest {
        branch: BranchId::MAIN,
        detached: vec![(base.id(), base.version())],
        ..Default::default()
    })
    .unwrap();

    let accessor = repo.store().accessor();
    assert!(accessor.read_revision(base.id(), BranchPoint::main_head(), UNCHUNKED).unwrap().is_none());

    let err = repo
        .commit(0, CommitRequest { branch: BranchId::MAIN, dirty: vec![rename(&base, "B")], ..Default::default() })
        .unwrap_err();
    assert!(err.is_conflict());
}

#[test]
fn commit_invalidates_interested_sessions_only() {
    let repo = repository();
    let base = create(&repo, "A");

    let (s1, r1) = repo.sessions().open_session("s1");
    let (s2, r2) = repo.sessions().open_session("s2");
    let (s3, r3) = repo.sessions().open_session("s3");
    s1.open_transaction(1, BranchId::MAIN).unwrap();
    s2.open_read_only(1, BranchId::MAIN).unwrap().subscribe(base.id());
    s3.open_read_only(1, BranchId::MAIN).unwrap();

    let result = repo
        .commit(s1.id(), CommitRequest { branch: BranchId::MAIN, dirty: vec![rename(&base, "B")], ..Default::default() })
        .unwrap();

    let event = r2.try_recv().unwrap();
    assert_eq!(event.ids, vec![base.id()]);
    assert_eq!(event.timestamp, result.timestamp);
    assert_eq!(event.committer, s1.id());
    assert!(r2.try_recv().is_err());
    assert!(r1.try_recv().is_err());
    assert!(r3.try_recv().is_err());
}

#[test]
fn load_marks_revisions_loaded_in_the_view() {
    let repo = repository();
    let base = create(&repo, "A");
    let (session, _rx) = repo.sessions().open_session("reader");
    let view = session.open_read_only(7, BranchId::MAIN).unwrap();

    let accessor = repo.store().accessor();
    let loaded = repo
        .load_revisions(&accessor, &view, &[base.id(), ObjectId::Persistent(999)], UNCHUNKED)
        .unwrap();
    assert_eq!(loaded[0].as_ref().map(Revision::version), Some(Version::FIRST));
    assert!(loaded[1].is_none());
    assert!(view.has_loaded(base.id()));
    assert!(!view.has_loaded(ObjectId::Persistent(999)));

    assert!(matches!(
        repo.load_revisions(&accessor, &view, &[ObjectId::Temp(3)], UNCHUNKED),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn audit_view_reads_past_state() {
    let repo = repository();
    let base = create(&repo, "A");
    let audit_time = base.created();
    repo.commit(0, CommitRequest { branch: BranchId::MAIN, dirty: vec![rename(&base, "B")], ..Default::default() })
        .unwrap();

    let (session, _rx) = repo.sessions().open_session("auditor");
    let view = session.open_audit(1, BranchId::MAIN, audit_time).unwrap();
    let accessor = repo.store().accessor();
    let loaded = repo.load_revisions(&accessor, &view, &[base.id()], UNCHUNKED).unwrap();
    assert_eq!(loaded[0].as_ref().and_then(|r| r.get(NAME.id)), Some(&Value::from("A")));

    // Before the object existed
    let early = session.open_audit(2, BranchId::MAIN, Timestamp(audit_time.0 - 10)).unwrap();
    let loaded = repo.load_revisions(&accessor, &early, &[base.id()], UNCHUNKED).unwrap();
    assert!(loaded[0].is_none());
}

#[test]
fn store_fault_fails_commit_and_releases_accessor() {
    let (store, rows) = crate::storage::Store::in_memory(&RepositoryConfig::default());
    let repo = Repository::new(store, &RepositoryConfig::default());
    rows.set_faulty(true);

    let err = repo
        .commit(0, CommitRequest {
            branch: BranchId::MAIN,
            new_objects: vec![Revision::new(ObjectId::Temp(1), ClassId(1))],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert_eq!(repo.store().active_accessors(), 0);
    assert_eq!(repo.store().statement_cache().outstanding(), 0);
}

#[test]
fn chunks_of_committed_list_can_be_loaded() {
    let repo = repository();
    let mut rev = Revision::new(ObjectId::Temp(1), ClassId(1));
    rev.set_list(ITEMS.id, (0..10).map(|i| Value::Ref(ObjectId::Persistent(100 + i))).collect());
    let result = repo
        .commit(0, CommitRequest { branch: BranchId::MAIN, new_objects: vec![rev], ..Default::default() })
        .unwrap();
    let stored = &result.revisions[0];

    let accessor = repo.store().accessor();
    let chunks = repo
        .load_chunks(&accessor, stored.id(), BranchId::MAIN, stored.version(), ITEMS.id, &[(0, 4), (4, 10)])
        .unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.is_complete()));
    assert_eq!(chunks[1].get(0), Some(&Value::Ref(ObjectId::Persistent(104))));
}

#[test]
fn object_changed_twice_in_one_commit_is_rejected() {
    let repo = repository();
    let base = create(&repo, "A");
    let (watcher, pushed) = repo.sessions().open_session("watcher");
    watcher.open_read_only(1, BranchId::MAIN).unwrap().subscribe(base.id());

    let twice = CommitRequest {
        branch: BranchId::MAIN,
        dirty: vec![rename(&base, "B"), rename(&base, "C")],
        ..Default::default()
    };
    assert!(matches!(repo.commit(0, twice), Err(Error::InvalidInput(_))));

    let edited_and_detached = CommitRequest {
        branch: BranchId::MAIN,
        dirty: vec![rename(&base, "B")],
        detached: vec![(base.id(), base.version())],
        ..Default::default()
    };
    assert!(matches!(repo.commit(0, edited_and_detached), Err(Error::InvalidInput(_))));

    let current = repo
        .store()
        .accessor()
        .read_revision(base.id(), BranchPoint::main_head(), UNCHUNKED)
        .unwrap()
        .unwrap();
    assert_eq!(current.version(), Version(1));
    assert_eq!(current.get(NAME.id), Some(&Value::from("A")));
    assert!(pushed.try_recv().is_err());
}

#[test]
fn store_fault_at_any_point_leaves_no_partial_commit() {
    let config = RepositoryConfig::default();
    let (store, rows) = crate::storage::Store::in_memory(&config);
    let repo = Repository::new(store, &config);
    let edited = create(&repo, "A");
    let detached = create(&repo, "B");
    let (watcher, pushed) = repo.sessions().open_session("watcher");
    watcher.open_read_only(1, BranchId::MAIN).unwrap().subscribe(edited.id());
    let stored_rows = rows.revision_count();

    let mut added = Revision::new(ObjectId::Temp(1), ClassId(1));
    added.set_list(ITEMS.id, vec![Value::Ref(edited.id()), Value::Ref(detached.id())]);
    let request = CommitRequest {
        branch: BranchId::MAIN,
        new_objects: vec![added],
        dirty: vec![rename(&edited, "A2")],
        detached: vec![(detached.id(), detached.version())],
    };

    let mut failures = 0;
    for nth in 1..500 {
        rows.fail_operation(nth);
        let outcome = repo.commit(0, request.clone());
        rows.clear_faults();
        let accessor = repo.store().accessor();
        let head = |id| accessor.read_revision(id, BranchPoint::main_head(), UNCHUNKED).unwrap();

        match outcome {
            Err(err) => {
                failures += 1;
                assert!(matches!(err, Error::Storage(_)), "{:?}", err);
                assert_eq!(rows.revision_count(), stored_rows);
                assert_eq!(head(edited.id()).unwrap().get(NAME.id), Some(&Value::from("A")));
                assert_eq!(head(detached.id()).map(|r| r.version()), Some(Version(1)));
                assert!(pushed.try_recv().is_err());
            }
            Ok(result) => {
                assert_eq!(rows.revision_count(), stored_rows + 2);
                assert_eq!(head(edited.id()).unwrap().version(), Version(2));
                assert!(head(detached.id()).is_none());
                assert_eq!(pushed.try_recv().unwrap().timestamp, result.timestamp);
                assert!(failures > 3);
                return;
            }
        }
    }
    panic!("commit never succeeded");
}

#[test]
fn views_on_other_branches_are_not_invalidated() {
    let repo = repository();
    let base = create(&repo, "A");
    let (elsewhere, pushed) = repo.sessions().open_session("elsewhere");
    elsewhere.open_read_only(1, BranchId(2)).unwrap().mark_loaded(base.id());

    repo.commit(0, CommitRequest { branch: BranchId::MAIN, dirty: vec![rename(&base, "B")], ..Default::default() })
        .unwrap();
    assert!(pushed.try_recv().is_err());
}

#[test]
fn commit_duration_is_recorded() {
    let repo = repository();
    let histogram = &crate::system::metrics::Metrics::global().repository.commit_duration;
    let before = histogram.get_sample_count();
    create(&repo, "A");
    assert!(histogram.get_sample_count() > before);
}
