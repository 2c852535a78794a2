//! Sessions over the TCP transport

use cdo_repo::core::config::{RepositoryConfig, ServerConfig, SessionConfig};
use cdo_repo::core::types::{BranchId, ClassId, Feature, Value, Version};
use cdo_repo::net::{TcpChannel, TcpServer};
use cdo_repo::protocol::Channel;
use cdo_repo::{ClientSession, Repository};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const NAME: Feature = Feature::attribute(1);
const TAGS: Feature = Feature::attribute_list(2);

struct Running {
    addr: SocketAddr,
    repository: Arc<Repository>,
    stop: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<cdo_repo::Result<()>>,
}

async fn start() -> Running {
    let repository = Arc::new(Repository::in_memory(&RepositoryConfig::default()));
    let config = ServerConfig { bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)), ..ServerConfig::default() };
    let server = TcpServer::new(repository.clone(), config);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = stopped.await;
            })
            .await
    });
    Running { addr, repository, stop, task }
}

fn connect(addr: SocketAddr, user: &str) -> ClientSession {
    let channel: Arc<dyn Channel> = Arc::new(TcpChannel::connect(addr, ServerConfig::default().max_frame_size).unwrap());
    ClientSession::open(channel, user, &SessionConfig::default()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_and_pushed_invalidation_over_tcp() {
    let running = start().await;
    let addr = running.addr;

    tokio::task::spawn_blocking(move || {
        let s1 = connect(addr, "s1");
        let s2 = connect(addr, "s2");
        assert_eq!(s1.repository_name(), "repo1");
        assert_ne!(s1.id(), s2.id());

        let mut tx = s1.open_transaction(BranchId::MAIN).unwrap();
        let temp = tx.new_object(ClassId(1));
        tx.set(temp, NAME, "A").unwrap();
        for tag in ["x", "y", "z"] {
            tx.append(temp, TAGS, tag).unwrap();
        }
        let o = tx.commit().unwrap().id_mappings[0].1;

        let view = s2.open_view(BranchId::MAIN).unwrap();
        view.subscribe(&[o]).unwrap();
        let seen = view.get_revision(o).unwrap().unwrap();
        assert_eq!(seen.list(TAGS.id), &[Value::from("x"), Value::from("y"), Value::from("z")]);

        tx.set(o, NAME, "B").unwrap();
        tx.remove(o, TAGS, 1).unwrap();
        let confirmation = tx.commit().unwrap();

        let mut processed = 0;
        for _ in 0..400 {
            processed = s2.process_invalidations();
            if processed > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(processed, 1);
        assert_eq!(s2.last_update_timestamp(), confirmation.timestamp);

        let fresh = view.get_revision(o).unwrap().unwrap();
        assert_eq!(fresh.version(), Version(2));
        assert_eq!(fresh.get(NAME.id), Some(&Value::from("B")));
        assert_eq!(fresh.list(TAGS.id), &[Value::from("x"), Value::from("z")]);

        s1.close();
        s2.close();
    })
    .await
    .unwrap();

    running.stop.send(()).unwrap();
    running.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn errors_travel_back_and_disconnect_closes_the_session() {
    let running = start().await;
    let addr = running.addr;
    let repository = running.repository.clone();

    tokio::task::spawn_blocking(move || {
        let session = connect(addr, "alice");
        assert_eq!(repository.sessions().session_count(), 1);

        // A conflict is reported without ending the session
        let seed = connect(addr, "seed");
        let mut tx = seed.open_transaction(BranchId::MAIN).unwrap();
        let temp = tx.new_object(ClassId(1));
        tx.set(temp, NAME, "v1").unwrap();
        let o = tx.commit().unwrap().id_mappings[0].1;

        let mut late = session.open_transaction(BranchId::MAIN).unwrap();
        late.set(o, NAME, "late").unwrap();
        tx.set(o, NAME, "early").unwrap();
        tx.commit().unwrap();
        assert!(late.commit().unwrap_err().is_conflict());
        assert!(!session.is_closed());

        let listing = session.remote_sessions(false).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].user, "seed");

        drop(late);
        drop(session);
        for _ in 0..400 {
            if repository.sessions().session_count() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(repository.sessions().session_count(), 1);
        seed.close();
    })
    .await
    .unwrap();

    running.stop.send(()).unwrap();
    running.task.await.unwrap().unwrap();
}
