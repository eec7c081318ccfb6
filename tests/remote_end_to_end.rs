//! Client sessions against a live server on a loopback port.

use rnsync::http::{router, AppState};
use rnsync::{
    BroadcastListener, BusMessage, ClientConfig, ClientId, DropReason, Effect, EventSource,
    HttpClient, Operation, Permission, Record, RecordApi, RecordService, RecordSession,
    SyncError, TableSession, TableUpdate, Topic,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;

/// Running server; shuts down when dropped.
struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start() -> Self {
        let service = Arc::new(RecordService::in_memory());
        service.seed_user("ann", "Ann Lee", Permission::EDIT).unwrap();
        service.seed_user("bob", "Bob Ray", Permission::EDIT).unwrap();
        service.seed_user("viewer", "Viewer", Permission::NONE).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let state = AppState::new(service, Duration::from_secs(30), Duration::from_secs(2));
                let app = router(state, 8);
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
                    .unwrap();
            });
        });

        Self {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    fn client(&self, username: &str) -> HttpClient {
        let mut config = ClientConfig::new(format!("http://{}", self.addr), username);
        config.poll_timeout_ms = 200;
        HttpClient::new(&config).unwrap()
    }

    fn session(&self, username: &str) -> RecordSession {
        let api: Arc<dyn RecordApi> = Arc::new(self.client(username));
        RecordSession::open(api, rnsync::Actor::new(ClientId::random(), username)).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn wait_for_health(client: &HttpClient) {
    for _ in 0..50 {
        if client.health().is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server did not come up");
}

#[test]
fn test_remote_save_get_delete() {
    let server = TestServer::start();
    let client = server.client("ann");
    wait_for_health(&client);
    let actor = rnsync::Actor::new(ClientId::random(), "ann");

    let outcome = client
        .save(&actor, Record::with_issue_number("1001").with("title", "Crash"), None)
        .unwrap();
    assert_eq!(outcome.operation, Operation::Post);
    assert_eq!(
        client.get("1001").unwrap(),
        Record::with_issue_number("1001").with("title", "Crash")
    );
    assert!(client.exists("1001").unwrap());
    assert_eq!(client.search("crash").unwrap().len(), 1);

    client.delete(&actor, "1001").unwrap();
    assert!(matches!(client.get("1001"), Err(SyncError::NotFound(_))));
    assert!(matches!(
        client.delete(&actor, "1001"),
        Err(SyncError::NotFound(_))
    ));
}

#[test]
fn test_keys_with_reserved_characters() {
    let server = TestServer::start();
    let client = server.client("ann");
    wait_for_health(&client);
    let actor = rnsync::Actor::new(ClientId::random(), "ann");

    client
        .save(&actor, Record::with_issue_number("DTS/12 #a?"), None)
        .unwrap();
    assert!(client.exists("DTS/12 #a?").unwrap());
    assert_eq!(
        client.get("DTS/12 #a?").unwrap().issue_number(),
        Some("DTS/12 #a?")
    );
}

#[test]
fn test_permissions_over_http() {
    let server = TestServer::start();
    let client = server.client("ann");
    wait_for_health(&client);

    assert_eq!(client.permissions("ann").unwrap(), Permission::EDIT);
    assert!(matches!(client.permissions("ghost"), Err(SyncError::NotFound(_))));

    let mut viewer = server.session("viewer");
    assert!(!viewer.can_edit());
    assert!(matches!(
        viewer.create(Record::with_issue_number("1")),
        Err(SyncError::PermissionDenied(_))
    ));
}

#[test]
fn test_broadcast_reaches_other_session() {
    let server = TestServer::start();
    wait_for_health(&server.client("ann"));

    let mut client_a = server.session("ann");
    let mut client_b = server.session("bob");

    let subscription = server
        .client("bob")
        .subscribe(&[Topic::Records], Some(client_b.actor().client_id))
        .unwrap();
    let (mut listener, inbox) =
        BroadcastListener::spawn_channel(subscription, Duration::from_millis(200)).unwrap();

    client_a
        .create(Record::with_issue_number("1001").with("title", "Notes"))
        .unwrap();

    let message = inbox.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(message, BusMessage::RecordChanged { .. }));
    let result = client_b.handle(&message);
    assert_eq!(result.effects[0], Effect::RowUpserted("1001".into()));
    assert!(result.contains(&Effect::Resynced { rows: 1 }));
    assert!(result.notice().unwrap().starts_with("Ann Lee created issue 1001"));

    // B's own edit is excluded server-side
    client_b
        .edit("1001", Record::with_issue_number("1001").with("title", "Edited"))
        .unwrap();
    assert!(inbox.recv_timeout(Duration::from_millis(600)).is_err());

    listener.stop();
    assert!(!listener.is_running());
}

#[test]
fn test_table_reload_on_remote_save() {
    let server = TestServer::start();
    let client = server.client("ann");
    wait_for_health(&client);

    let api_a: Arc<dyn RecordApi> = Arc::new(server.client("ann"));
    let api_b: Arc<dyn RecordApi> = Arc::new(server.client("bob"));
    let actor_a = rnsync::Actor::new(ClientId::random(), "ann");
    let actor_b = rnsync::Actor::new(ClientId::random(), "bob");
    let mut table_a = TableSession::new(api_a, actor_a, Permission::EDIT, "kpi");
    let mut table_b = TableSession::new(api_b, actor_b, Permission::EDIT, "kpi");
    table_b.load().unwrap();

    let subscription = server
        .client("bob")
        .subscribe(&[Topic::Tables], None)
        .unwrap();
    let (mut listener, inbox) =
        BroadcastListener::spawn_channel(subscription, Duration::from_millis(200)).unwrap();

    table_a
        .set_cell(0, 0, rnsync::CellRecord::text("Feature"))
        .unwrap();
    table_a.save().unwrap();

    let message = inbox.recv_timeout(Duration::from_secs(5)).unwrap();
    match table_b.handle(&message) {
        TableUpdate::Reloaded { message, .. } => assert_eq!(message, "table data updated"),
        other => panic!("expected reload, got {:?}", other),
    }
    assert_eq!(table_b.cell_at(0, 0).unwrap().text, "Feature");

    listener.stop();
}

#[test]
fn test_forgotten_subscription_reopens_and_resyncs() {
    let server = TestServer::start();
    wait_for_health(&server.client("ann"));

    let mut client_b = server.session("bob");
    let mut subscription = server
        .client("bob")
        .subscribe(&[Topic::Records], Some(client_b.actor().client_id))
        .unwrap();
    let first_id = subscription.id().unwrap();

    // the server loses the subscription, then a save lands in the gap
    let url = format!("http://{}/subscriptions/{}", server.addr, first_id);
    let response = reqwest::blocking::Client::new().delete(url).send().unwrap();
    assert!(response.status().is_success());
    let ann = rnsync::Actor::new(ClientId::random(), "ann");
    server
        .client("ann")
        .save(&ann, Record::with_issue_number("77"), None)
        .unwrap();

    let batch = subscription.next_batch(Duration::from_millis(100)).unwrap();
    assert_eq!(
        batch,
        vec![BusMessage::Dropped {
            reason: DropReason::IdleTimeout
        }]
    );
    assert!(subscription.id().is_none());

    let result = client_b.handle(&batch[0]);
    assert_eq!(result.effects, vec![Effect::Resynced { rows: 1 }]);
    assert!(client_b.cache().contains("77"));

    assert!(subscription
        .next_batch(Duration::from_millis(100))
        .unwrap()
        .is_empty());
    assert_ne!(subscription.id(), Some(first_id));
    subscription.unsubscribe().unwrap();
}
