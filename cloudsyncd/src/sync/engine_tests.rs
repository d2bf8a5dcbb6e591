use super::*;
use crate::sync::item_list::DirectoryLister;
use crate::sync::store::{CacheChanges, memory_store};
use crate::sync::testing::{MockTransport, Performed};
use cloudsync_core::{Listing, ListingError, Method, Request};
use futures_util::future::BoxFuture;
use tempfile::tempdir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn base() -> Url {
    Url::parse("https://dav.example/files/").unwrap()
}

fn config() -> CoreConfig {
    CoreConfig {
        max_running_lanes: 4,
        retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 3),
        wait_poll_interval: Duration::from_millis(10),
    }
}

fn mkdir(path: &str) -> ActionPayload {
    ActionPayload::CreateFolder { path: path.into() }
}

fn delete(path: &str) -> ActionPayload {
    ActionPayload::Delete {
        path: path.into(),
        expected_etag: None,
    }
}

/// Lister whose directories are always empty and carry no anchor.
struct EmptyLister;

impl DirectoryLister for EmptyLister {
    fn list<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<Listing, ListingError>> {
        Box::pin(async {
            Ok(Listing {
                items: Vec::new(),
                sync_anchor: None,
            })
        })
    }
}

/// Lister for a server whose directory anchor never moves.
struct FixedAnchorLister(i64);

impl DirectoryLister for FixedAnchorLister {
    fn list<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<Listing, ListingError>> {
        Box::pin(async move {
            Ok(Listing {
                items: Vec::new(),
                sync_anchor: Some(self.0),
            })
        })
    }
}

struct Harness {
    core: Arc<SyncCore<MockTransport>>,
    transport: MockTransport,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), CoreError>>,
}

impl Harness {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
    }
}

async fn launch(core: SyncCore<MockTransport>, transport: MockTransport) -> Harness {
    let core = Arc::new(core);
    core.start().await.unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let runner = Arc::clone(&core);
    let handle = tokio::spawn(async move {
        runner
            .run(async {
                let _ = stopped.await;
            })
            .await
    });
    Harness {
        core,
        transport,
        stop,
        handle,
    }
}

async fn harness(store: TaskStore, transport: MockTransport) -> Harness {
    let core = SyncCore::new("p", base(), store, transport.clone(), config());
    launch(core, transport).await
}

async fn drained(core: &SyncCore<MockTransport>) {
    for _ in 0..500 {
        if core.records().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("journal never drained: {:?}", core.records().await);
}

async fn reaches(core: &SyncCore<MockTransport>, record_id: RecordId, expected: RecordState) {
    for _ in 0..500 {
        let state = core
            .records()
            .await
            .into_iter()
            .find(|record| record.record_id == record_id)
            .map(|record| record.state);
        if state == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record {record_id} never reached {expected:?}");
}

async fn started(transport: &MockTransport, count: usize) {
    for _ in 0..500 {
        if transport.started().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("transport never saw {count} requests");
}

fn by_method(performed: &[Performed], method: Method) -> Vec<Performed> {
    performed
        .iter()
        .filter(|performed| performed.method == method)
        .cloned()
        .collect()
}

#[tokio::test]
async fn submit_before_start_is_rejected() {
    let core = SyncCore::new("p", base(), memory_store().await, MockTransport::new(), config());
    assert!(matches!(
        core.submit_sync_action(mkdir("/A")).await,
        Err(CoreError::NotStarted)
    ));
}

#[tokio::test]
async fn same_item_records_run_in_submission_order() {
    let transport = MockTransport::new();
    transport.delay("/files/A", Duration::from_millis(50));
    let h = harness(memory_store().await, transport).await;

    h.core.submit_sync_action(mkdir("/A")).await.unwrap();
    h.core.submit_sync_action(delete("/A")).await.unwrap();
    drained(&h.core).await;

    let performed = h.transport.performed();
    let methods: Vec<_> = performed.iter().map(|performed| performed.method).collect();
    assert_eq!(methods, vec![Method::Mkcol, Method::Delete]);
    assert!(performed[1].started >= performed[0].finished);
    h.shutdown().await;
}

#[tokio::test]
async fn unrelated_records_run_concurrently() {
    let transport = MockTransport::new();
    transport.delay("/files/A", Duration::from_millis(100));
    transport.delay("/files/B", Duration::from_millis(100));
    let h = harness(memory_store().await, transport).await;

    h.core.submit_sync_action(mkdir("/A")).await.unwrap();
    h.core.submit_sync_action(mkdir("/B")).await.unwrap();
    drained(&h.core).await;

    let performed = h.transport.performed();
    assert_eq!(performed.len(), 2);
    let (a, b) = (&performed[0], &performed[1]);
    assert!(a.started < b.finished && b.started < a.finished);
    h.shutdown().await;
}

#[tokio::test]
async fn nested_path_waits_for_the_older_lane() {
    let transport = MockTransport::new();
    transport.delay("/files/A", Duration::from_millis(100));
    let h = harness(memory_store().await, transport).await;

    let parent = h.core.submit_sync_action(mkdir("/A")).await.unwrap();
    let child = h.core.submit_sync_action(delete("/A/b/c")).await.unwrap();
    let lanes = h.core.lanes().await;
    assert_eq!(lanes.len(), 2);
    let parent_lane = lanes.iter().find(|lane| lane.records.contains(&parent)).unwrap();
    let child_lane = lanes.iter().find(|lane| lane.records.contains(&child)).unwrap();
    assert!(child_lane.after_lanes.contains(&parent_lane.lane_id));

    drained(&h.core).await;
    let performed = h.transport.performed();
    let mkcol = &by_method(&performed, Method::Mkcol)[0];
    let removal = &by_method(&performed, Method::Delete)[0];
    assert!(removal.started >= mkcol.finished);
    h.shutdown().await;
}

#[tokio::test]
async fn transient_failure_retries_after_backoff() {
    let transport = MockTransport::new();
    transport.respond("/files/A", 503);
    let h = harness(memory_store().await, transport).await;

    h.core.submit_sync_action(mkdir("/A")).await.unwrap();
    drained(&h.core).await;

    let performed = h.transport.performed();
    assert_eq!(performed.len(), 2);
    assert!(performed[1].started.duration_since(performed[0].finished) >= Duration::from_millis(5));
    assert!(h.core.issues().await.unwrap().is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_become_an_issue() {
    let transport = MockTransport::new();
    for _ in 0..4 {
        transport.respond("/files/A", 500);
    }
    let h = harness(memory_store().await, transport).await;

    let record_id = h.core.submit_sync_action(mkdir("/A")).await.unwrap();
    reaches(&h.core, record_id, RecordState::Failed).await;

    assert_eq!(h.transport.performed().len(), 4);
    let issues = h.core.issues().await.unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].record_id, Some(record_id));
    h.shutdown().await;
}

#[tokio::test]
async fn failure_halts_the_lane_until_answered() {
    let transport = MockTransport::new();
    transport.respond("/files/A", 403);
    transport.delay("/files/A", Duration::from_millis(100));
    let h = harness(memory_store().await, transport).await;

    let failing = h.core.submit_sync_action(mkdir("/A")).await.unwrap();
    let behind = h.core.submit_sync_action(delete("/A")).await.unwrap();
    reaches(&h.core, failing, RecordState::Failed).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.transport.performed().len(), 1);
    let lane = h.core.lanes().await.pop().unwrap();
    assert!(lane.halted);
    assert_eq!(lane.records, vec![failing, behind]);

    let issue = h.core.issues().await.unwrap().pop().unwrap();
    assert_eq!(issue.issue.choices, vec![IssueChoice::Retry, IssueChoice::Cancel]);
    assert!(matches!(
        h.core.respond_to_issue(issue.issue_id, IssueChoice::KeepBoth).await,
        Err(CoreError::ChoiceNotOffered { .. })
    ));
    h.core
        .respond_to_issue(issue.issue_id, IssueChoice::Retry)
        .await
        .unwrap();
    assert!(matches!(
        h.core.respond_to_issue(issue.issue_id, IssueChoice::Cancel).await,
        Err(CoreError::IssueAlreadyAnswered(_))
    ));

    drained(&h.core).await;
    let methods: Vec<_> = h
        .transport
        .performed()
        .iter()
        .map(|performed| performed.method)
        .collect();
    assert_eq!(methods, vec![Method::Mkcol, Method::Mkcol, Method::Delete]);
    h.shutdown().await;
}

#[tokio::test]
async fn cancel_from_issue_releases_the_lane() {
    let transport = MockTransport::new();
    transport.respond("/files/A", 403);
    let h = harness(memory_store().await, transport).await;

    let failing = h.core.submit_sync_action(mkdir("/A")).await.unwrap();
    h.core.submit_sync_action(delete("/A")).await.unwrap();
    reaches(&h.core, failing, RecordState::Failed).await;

    let issue = h.core.issues().await.unwrap().pop().unwrap();
    h.core
        .respond_to_issue(issue.issue_id, IssueChoice::Cancel)
        .await
        .unwrap();
    drained(&h.core).await;

    let methods: Vec<_> = h
        .transport
        .performed()
        .iter()
        .map(|performed| performed.method)
        .collect();
    assert_eq!(methods, vec![Method::Mkcol, Method::Delete]);
    assert!(h.core.issues().await.unwrap().is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn precondition_failure_refreshes_then_asks() {
    let store = memory_store().await;
    let transport = MockTransport::new();
    transport.respond("/files/A", 412);
    transport.respond("/files/A", 412);
    let refresher = ItemListReconciler::new("p", store.clone(), Arc::new(EmptyLister));
    let core = SyncCore::new("p", base(), store.clone(), transport.clone(), config())
        .with_refresher(refresher);
    let h = launch(core, transport).await;

    let record_id = h
        .core
        .submit_sync_action(ActionPayload::Delete {
            path: "/A".into(),
            expected_etag: Some("\"v1\"".into()),
        })
        .await
        .unwrap();
    reaches(&h.core, record_id, RecordState::Failed).await;

    assert_eq!(h.transport.performed().len(), 2);
    assert!(store.listing_anchor("p", "/").await.unwrap().is_some());
    let issue = h.core.issues().await.unwrap().pop().unwrap();
    assert_eq!(issue.issue.choices, vec![IssueChoice::Overwrite, IssueChoice::Cancel]);

    h.core
        .respond_to_issue(issue.issue_id, IssueChoice::Overwrite)
        .await
        .unwrap();
    drained(&h.core).await;
    assert_eq!(h.transport.performed().len(), 3);
    h.shutdown().await;
}

#[tokio::test]
async fn refresh_with_unchanged_server_anchor_still_unblocks() {
    let store = memory_store().await;
    store
        .merge_listing("p", "/", 5, &CacheChanges::default())
        .await
        .unwrap();
    let transport = MockTransport::new();
    transport.respond("/files/A", 412);
    transport.respond("/files/A", 412);
    let refresher = ItemListReconciler::new("p", store.clone(), Arc::new(FixedAnchorLister(5)));
    let core = SyncCore::new("p", base(), store.clone(), transport.clone(), config())
        .with_refresher(refresher);
    let h = launch(core, transport).await;

    let record_id = h
        .core
        .submit_sync_action(ActionPayload::Delete {
            path: "/A".into(),
            expected_etag: Some("\"v1\"".into()),
        })
        .await
        .unwrap();
    reaches(&h.core, record_id, RecordState::Failed).await;

    assert_eq!(h.transport.performed().len(), 2);
    assert_eq!(store.listing_anchor("p", "/").await.unwrap(), Some(5));
    assert!(store.refresh_count("p", "/").await.unwrap() >= 1);
    let issue = h.core.issues().await.unwrap().pop().unwrap();
    assert_eq!(issue.issue.choices, vec![IssueChoice::Overwrite, IssueChoice::Cancel]);
    h.shutdown().await;
}

#[tokio::test]
async fn cancel_is_immediate_when_idle_and_deferred_when_in_flight() {
    let transport = MockTransport::new();
    transport.delay("/files/A", Duration::from_millis(100));
    let h = harness(memory_store().await, transport).await;

    let running = h.core.submit_sync_action(mkdir("/A")).await.unwrap();
    let queued = h.core.submit_sync_action(delete("/A")).await.unwrap();
    started(&h.transport, 1).await;

    assert_eq!(h.core.cancel(queued).await.unwrap(), CancelOutcome::Removed);
    assert_eq!(h.core.cancel(running).await.unwrap(), CancelOutcome::Deferred);
    assert!(matches!(
        h.core.cancel(queued).await,
        Err(CoreError::UnknownRecord(_))
    ));

    drained(&h.core).await;
    let methods: Vec<_> = h
        .transport
        .performed()
        .iter()
        .map(|performed| performed.method)
        .collect();
    assert_eq!(methods, vec![Method::Mkcol]);
    h.shutdown().await;
}

#[tokio::test]
async fn events_without_a_record_are_acknowledged() {
    let h = harness(memory_store().await, MockTransport::new()).await;
    let url = base().join("stray").unwrap();
    h.core
        .pipeline()
        .submit(Request::new(Method::Get, url), Some(999))
        .await
        .unwrap();

    for _ in 0..500 {
        if h.core.pipeline().tasks().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.core.pipeline().tasks().await.is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn restart_replays_an_interrupted_request_once() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("sync.db");

    let record_id = {
        let store = TaskStore::open(&db_path).await.unwrap();
        let transport = MockTransport::new();
        transport.hang();
        let h = harness(store.clone(), transport).await;
        let record_id = h.core.submit_sync_action(delete("/A")).await.unwrap();
        started(&h.transport, 1).await;
        reaches(&h.core, record_id, RecordState::Running).await;
        h.shutdown().await;
        store.close().await;
        record_id
    };

    let store = TaskStore::open(&db_path).await.unwrap();
    let restored = store.get_record(record_id).await.unwrap().unwrap();
    assert_eq!(restored.state, RecordState::Running);

    let transport = MockTransport::new();
    let h = harness(store.clone(), transport).await;
    drained(&h.core).await;

    let performed = h.transport.performed();
    assert_eq!(performed.len(), 1);
    assert_eq!(performed[0].method, Method::Delete);
    assert!(h.core.issues().await.unwrap().is_empty());
    assert!(h.core.pipeline().tasks().await.is_empty());
    h.shutdown().await;
}
