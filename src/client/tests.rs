use super::*;
use crate::core::config::{RepositoryConfig, SessionConfig};
use crate::core::error::Error;
use crate::core::types::{BranchId, ClassId, Feature, ObjectId, Timestamp, Value, Version};
use crate::protocol::{Channel, LocalChannel, Signal};
use crate::server::{Invalidation, Repository};
use bytes::Bytes;
use flume::Receiver;
use std::sync::Arc;
use std::time::Duration;

const NAME: Feature = Feature::attribute(1);
const TAGS: Feature = Feature::attribute_list(2);
const CHILDREN: Feature = Feature::reference_list(3);
const PARENT: Feature = Feature::reference(4);

fn repository() -> Arc<Repository> {
    Arc::new(Repository::in_memory(&RepositoryConfig::default()))
}

fn session(repo: &Arc<Repository>, user: &str) -> ClientSession {
    ClientSession::connect_local(repo.clone(), user, &SessionConfig::default()).unwrap()
}

fn create_named(session: &ClientSession, name: &str) -> ObjectId {
    let mut tx = session.open_transaction(BranchId::MAIN).unwrap();
    let id = tx.new_object(ClassId(1));
    tx.set(id, NAME, name).unwrap();
    let confirmation = tx.commit().unwrap();
    confirmation.id_mappings[0].1
}

/// Wait until the session has processed at least one invalidation
fn await_invalidation(session: &ClientSession) {
    for _ in 0..200 {
        if session.process_invalidations() > 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("no invalidation arrived");
}

#[test]
fn commit_from_one_session_evicts_the_other_sessions_cache() {
    let repo = repository();
    let s1 = session(&repo, "s1");
    let s2 = session(&repo, "s2");
    let o = create_named(&s1, "A");

    let view = s2.open_view(BranchId::MAIN).unwrap();
    view.subscribe(&[o]).unwrap();
    assert_eq!(view.get_revision(o).unwrap().unwrap().get(NAME.id), Some(&Value::from("A")));
    assert!(s2.cached_revision(o, BranchId::MAIN).is_some());

    let mut tx = s1.open_transaction(BranchId::MAIN).unwrap();
    tx.set(o, NAME, "B").unwrap();
    let confirmation = tx.commit().unwrap();

    await_invalidation(&s2);
    assert!(s2.cached_revision(o, BranchId::MAIN).is_none());
    assert!(view.is_invalidated(o));
    assert_eq!(s2.last_update_timestamp(), confirmation.timestamp);

    let fresh = view.get_revision(o).unwrap().unwrap();
    assert_eq!(fresh.get(NAME.id), Some(&Value::from("B")));
    assert_eq!(fresh.version(), Version(2));
    assert!(!view.is_invalidated(o));
}

#[test]
fn committed_objects_get_permanent_ids_everywhere() {
    let repo = repository();
    let s = session(&repo, "writer");
    let mut tx = s.open_transaction(BranchId::MAIN).unwrap();

    let parent = tx.new_object(ClassId(1));
    let child = tx.new_object(ClassId(2));
    tx.append(parent, CHILDREN, child).unwrap();
    tx.set(child, PARENT, parent).unwrap();
    tx.set_container(child, ObjectId::Null, parent, CHILDREN.id.0 as i32).unwrap();
    assert!(tx.is_dirty());

    let confirmation = tx.commit().unwrap();
    assert!(!tx.is_dirty());
    let mapping: std::collections::HashMap<_, _> = confirmation.id_mappings.iter().copied().collect();
    let parent_id = mapping[&parent];
    let child_id = mapping[&child];

    let cached_parent = s.cached_revision(parent_id, BranchId::MAIN).unwrap();
    assert_eq!(cached_parent.version(), Version::FIRST);
    assert_eq!(cached_parent.created(), confirmation.timestamp);
    assert_eq!(cached_parent.list(CHILDREN.id), &[Value::Ref(child_id)]);

    let cached_child = s.cached_revision(child_id, BranchId::MAIN).unwrap();
    assert_eq!(cached_child.get(PARENT.id), Some(&Value::Ref(parent_id)));
    assert_eq!(cached_child.container(), parent_id);

    // Another session sees the same state from the store
    let other = session(&repo, "reader");
    let view = other.open_view(BranchId::MAIN).unwrap();
    assert_eq!(view.get_revision(child_id).unwrap().unwrap(), cached_child);
}

#[test]
fn list_edits_reach_the_repository() {
    let repo = repository();
    let s = session(&repo, "writer");
    let mut tx = s.open_transaction(BranchId::MAIN).unwrap();
    let id = tx.new_object(ClassId(1));
    for tag in ["a", "b", "c"] {
        tx.append(id, TAGS, tag).unwrap();
    }
    let id = tx.commit().unwrap().id_mappings[0].1;

    tx.append(id, TAGS, "d").unwrap();
    tx.remove(id, TAGS, 0).unwrap();
    tx.move_entry(id, TAGS, 2, 0).unwrap();
    tx.set_at(id, TAGS, 1, "B").unwrap();
    let expected = vec![Value::from("d"), Value::from("B"), Value::from("c")];
    assert_eq!(tx.get_revision(id).unwrap().unwrap().list(TAGS.id), &expected[..]);
    tx.commit().unwrap();

    let other = session(&repo, "reader");
    let stored = other.open_view(BranchId::MAIN).unwrap().get_revision(id).unwrap().unwrap();
    assert_eq!(stored.list(TAGS.id), &expected[..]);
    assert_eq!(stored.version(), Version(2));
}

#[test]
fn conflicting_commit_keeps_changes_until_rollback() {
    let repo = repository();
    let s1 = session(&repo, "s1");
    let s2 = session(&repo, "s2");
    let o = create_named(&s1, "A");

    let mut late = s2.open_transaction(BranchId::MAIN).unwrap();
    late.set(o, NAME, "late").unwrap();

    let mut early = s1.open_transaction(BranchId::MAIN).unwrap();
    early.set(o, NAME, "early").unwrap();
    early.commit().unwrap();

    let err = late.commit().unwrap_err();
    assert!(err.is_conflict());
    assert!(err.is_retryable());
    assert!(late.is_dirty());

    late.rollback();
    assert!(!late.is_dirty());
    s2.process_invalidations();
    late.set(o, NAME, "late").unwrap();
    late.commit().unwrap();
    assert_eq!(s2.cached_revision(o, BranchId::MAIN).unwrap().version(), Version(3));
}

#[test]
fn audit_view_reads_the_past_and_is_never_invalidated() {
    let repo = repository();
    let s = session(&repo, "auditor");
    let o = create_named(&s, "A");
    let created = s.cached_revision(o, BranchId::MAIN).unwrap().created();

    let mut tx = s.open_transaction(BranchId::MAIN).unwrap();
    tx.set(o, NAME, "B").unwrap();
    tx.commit().unwrap();

    let audit = s.open_audit(BranchId::MAIN, created).unwrap();
    let past = audit.get_revision(o).unwrap().unwrap();
    assert_eq!(past.get(NAME.id), Some(&Value::from("A")));
    assert_eq!(past.version(), Version::FIRST);

    let before = s.open_audit(BranchId::MAIN, Timestamp(created.0 - 1)).unwrap();
    assert!(before.get_revision(o).unwrap().is_none());

    let other = session(&repo, "writer");
    let mut tx = other.open_transaction(BranchId::MAIN).unwrap();
    tx.set(o, NAME, "C").unwrap();
    tx.commit().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    s.process_invalidations();
    assert!(!audit.is_invalidated(o));
}

#[test]
fn chunked_load_fills_lazy_slots() {
    let repo = repository();
    let s = session(&repo, "reader");
    let mut tx = s.open_transaction(BranchId::MAIN).unwrap();
    let id = tx.new_object(ClassId(1));
    for i in 0..10i64 {
        tx.append(id, TAGS, i).unwrap();
    }
    let id = tx.commit().unwrap().id_mappings[0].1;

    let other = session(&repo, "lazy");
    let view = other.open_view(BranchId::MAIN).unwrap();
    view.set_list_chunk(3);
    let revision = view.get_revision(id).unwrap().unwrap();
    assert_eq!(revision.list(TAGS.id).len(), 10);
    assert!(revision.has_uninitialized());

    let values = view.load_chunk(id, TAGS.id, 3, 10).unwrap();
    assert_eq!(values.len(), 7);
    let filled = other.cached_revision(id, BranchId::MAIN).unwrap();
    assert!(!filled.has_uninitialized());
    assert_eq!(filled.list(TAGS.id)[9], Value::Int(9));
}

#[test]
fn notifications_follow_the_view_flag() {
    let repo = repository();
    let writer = session(&repo, "writer");
    let o = create_named(&writer, "A");

    let reader = session(&repo, "reader");
    let quiet = reader.open_view(BranchId::MAIN).unwrap();
    let loud = reader.open_view(BranchId::MAIN).unwrap();
    quiet.set_invalidation_notification_enabled(false);
    assert!(loud.is_invalidation_notification_enabled());
    loud.get_revision(o).unwrap();

    let mut tx = writer.open_transaction(BranchId::MAIN).unwrap();
    tx.set(o, NAME, "B").unwrap();
    tx.commit().unwrap();

    await_invalidation(&reader);
    let events = loud.take_notifications();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ids, vec![o]);
    assert!(quiet.take_notifications().is_empty());
    assert!(quiet.is_invalidated(o));
}

#[test]
fn detached_object_is_gone_after_commit() {
    let repo = repository();
    let s = session(&repo, "writer");
    let o = create_named(&s, "A");

    let mut tx = s.open_transaction(BranchId::MAIN).unwrap();
    tx.detach(o).unwrap();
    assert!(tx.get_revision(o).unwrap().is_none());
    assert!(matches!(tx.set(o, NAME, "B"), Err(Error::InvalidInput(_))));
    tx.commit().unwrap();

    assert!(s.cached_revision(o, BranchId::MAIN).is_none());
    let view = s.open_view(BranchId::MAIN).unwrap();
    assert!(view.get_revision(o).unwrap().is_none());
}

#[test]
fn temporary_ids_are_unknown_outside_their_transaction() {
    let repo = repository();
    let s = session(&repo, "writer");
    let view = s.open_view(BranchId::MAIN).unwrap();
    let err = view.get_revision(ObjectId::Temp(1)).unwrap_err();
    assert!(err.is_implementation_error());
}

#[test]
fn remote_sessions_are_listed() {
    let repo = repository();
    let alice = session(&repo, "alice");
    let bob = session(&repo, "bob");
    let listing = alice.remote_sessions(false).unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].session_id, bob.id());
    assert_eq!(listing[0].user, "bob");
}

#[test]
fn closed_view_rejects_reads() {
    let repo = repository();
    let s = session(&repo, "reader");
    let view = s.open_view(BranchId::MAIN).unwrap();
    assert_eq!(s.view_count(), 1);
    view.close().unwrap();
    assert_eq!(s.view_count(), 0);
    assert!(matches!(view.get_revision(ObjectId::Persistent(1)), Err(Error::Closed(_))));

    s.close();
    assert!(s.is_closed());
    assert_eq!(repo.sessions().session_count(), 0);
}

/// Forwards everything except commits, which never get an answer
struct StalledCommits {
    inner: LocalChannel,
}

impl Channel for StalledCommits {
    fn exchange(&self, signal: Signal, payload: Bytes, timeout: Duration) -> crate::core::Result<Bytes> {
        if signal == Signal::CommitTransaction {
            std::thread::sleep(timeout);
            return Err(Error::Timeout { millis: timeout.as_millis() as u64 });
        }
        self.inner.exchange(signal, payload, timeout)
    }

    fn invalidations(&self) -> Option<Receiver<Invalidation>> {
        self.inner.invalidations()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn close(&self) {
        self.inner.close()
    }
}

#[test]
fn commit_timeout_leaves_the_transaction_intact() {
    let repo = repository();
    let channel: Arc<dyn Channel> = Arc::new(StalledCommits { inner: LocalChannel::connect(repo.clone()).unwrap() });
    let s = ClientSession::open(channel, "slow", &SessionConfig::default()).unwrap();

    let mut tx = s.open_transaction(BranchId::MAIN).unwrap();
    assert_eq!(tx.commit_timeout(), Transaction::DEFAULT_COMMIT_TIMEOUT);
    tx.set_commit_timeout(Duration::from_millis(20));
    let id = tx.new_object(ClassId(1));

    let err = tx.commit().unwrap_err();
    assert!(matches!(err, Error::Timeout { millis: 20 }));
    assert!(tx.is_dirty());
    assert!(tx.get_revision(id).unwrap().is_some());
}
