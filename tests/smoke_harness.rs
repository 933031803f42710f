use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use frappe_client::realtime::proto::{ClientMessage, ServerMessage};
use frappe_client::state::{AuthResource, CrudHandle};
use frappe_client::{ClientError, FrappeClient, ListOptions};

const TEST_USER: &str = "administrator";
const TEST_PASSWORD: &str = "secret";
const VALID_SESSION: &str = "sid=valid";
const BROKEN_SESSION: &str = "sid=broken";

#[derive(Clone, Default)]
struct MockState {
    docs: Arc<Mutex<HashMap<String, Value>>>,
    doc_counter: Arc<AtomicUsize>,
    observed_list_query: Arc<Mutex<Option<HashMap<String, String>>>>,
    subscribes: Arc<Mutex<HashMap<String, usize>>>,
    unsubscribes: Arc<Mutex<HashMap<String, usize>>>,
    push_tx: Arc<Mutex<Option<mpsc::UnboundedSender<ServerMessage>>>>,
    open_sessions: Arc<AtomicUsize>,
}

impl MockState {
    fn subscribe_count(&self, channel: &str) -> usize {
        self.subscribes
            .lock()
            .expect("lock subscribes")
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    fn unsubscribe_count(&self, channel: &str) -> usize {
        self.unsubscribes
            .lock()
            .expect("lock unsubscribes")
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    fn push(&self, message: ServerMessage) {
        let guard = self.push_tx.lock().expect("lock push sender");
        let sender = guard.as_ref().expect("websocket not connected");
        sender.send(message).expect("push to websocket");
    }

    fn open_session_count(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Drops the server side of the websocket session, forcing the client
    /// to reconnect.
    fn kill_session(&self) {
        *self.push_tx.lock().expect("lock push sender") = None;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_identity_and_crud_flow() {
    let (addr, state, shutdown_tx, server_task) = spawn_server().await;
    let client = FrappeClient::new(&format!("http://{addr}")).expect("build client");

    // Fresh session is Guest.
    assert!(!client.is_logged_in().await);
    assert_eq!(
        client.get_current_user().await.expect("identity"),
        "Guest"
    );

    let password = SecretString::new(TEST_PASSWORD.to_string());
    let login = client.login(TEST_USER, &password).await.expect("login");
    assert_eq!(login.message.as_deref(), Some("Logged In"));
    assert_eq!(login.full_name.as_deref(), Some("Administrator"));

    assert!(client.is_logged_in().await);
    assert_eq!(
        client.get_current_user().await.expect("identity"),
        "Administrator"
    );

    // Whitelisted method call unwraps the message envelope.
    let pong: String = client
        .call("frappe.ping", &json!({}))
        .await
        .expect("ping call");
    assert_eq!(pong, "pong");

    // CRUD round trip against the resource API.
    let created: Value = client
        .create_doc("Task", &json!({"title": "x"}))
        .await
        .expect("create doc");
    let name = created
        .get("name")
        .and_then(Value::as_str)
        .expect("created doc has a name")
        .to_string();

    let fetched: Value = client.get_doc("Task", &name).await.expect("get doc");
    assert_eq!(fetched.get("title").and_then(Value::as_str), Some("x"));

    let updated: Value = client
        .update_doc("Task", &name, &json!({"title": "y"}))
        .await
        .expect("update doc");
    assert_eq!(updated.get("title").and_then(Value::as_str), Some("y"));

    let options = ListOptions::new()
        .fields(["name", "title"])
        .limit(10);
    let listed: Vec<Value> = client.get_list("Task", &options).await.expect("get list");
    assert_eq!(listed.len(), 1);
    let observed_query = state
        .observed_list_query
        .lock()
        .expect("lock query")
        .clone()
        .expect("list query observed");
    assert_eq!(
        observed_query.get("fields").map(String::as_str),
        Some(r#"["name","title"]"#)
    );
    assert_eq!(
        observed_query.get("limit_page_length").map(String::as_str),
        Some("10")
    );

    let ack = client.delete_doc("Task", &name).await.expect("delete doc");
    assert_eq!(ack, "ok");

    let missing = client
        .get_doc::<Value>("Task", &name)
        .await
        .expect_err("deleted doc should be gone");
    match missing {
        ClientError::ServerException {
            status, exc_type, ..
        } => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(exc_type, "DoesNotExistError");
        }
        other => panic!("unexpected error variant: {other:?}"),
    }

    // Logout drops the session cookie.
    client.logout().await.expect("logout");
    assert!(!client.is_logged_in().await);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn is_logged_in_downgrades_identity_failures() {
    let (addr, _state, shutdown_tx, server_task) = spawn_server().await;
    let client = FrappeClient::new(&format!("http://{addr}")).expect("build client");

    // The "broken" user gets a session whose identity endpoint rejects.
    let password = SecretString::new(TEST_PASSWORD.to_string());
    client.login("broken", &password).await.expect("login");

    assert!(client.get_current_user().await.is_err());
    assert!(!client.is_logged_in().await);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_credentials_surface_unchanged() {
    let (addr, _state, shutdown_tx, server_task) = spawn_server().await;
    let client = FrappeClient::new(&format!("http://{addr}")).expect("build client");

    let password = SecretString::new("wrong".to_string());
    let error = client
        .login(TEST_USER, &password)
        .await
        .expect_err("bad credentials");
    match error {
        ClientError::HttpStatus { status, body } => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, "Invalid login credentials");
        }
        other => panic!("unexpected error variant: {other:?}"),
    }

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crud_handle_tracks_loading_and_error_across_steps() {
    let (addr, _state, shutdown_tx, server_task) = spawn_server().await;
    let client = FrappeClient::new(&format!("http://{addr}")).expect("build client");

    let handle = CrudHandle::new(client.clone(), "Task");
    assert!(!handle.snapshot().loading);

    let created = handle.create(&json!({"title": "x"})).await.expect("create");
    let name = created
        .get("name")
        .and_then(Value::as_str)
        .expect("created doc has a name")
        .to_string();
    let snapshot = handle.snapshot();
    assert!(!snapshot.loading);
    assert!(snapshot.error.is_none());

    // Updating a missing document stores the error and rethrows it.
    let error = handle
        .update("MISSING", &json!({"title": "y"}))
        .await
        .expect_err("missing doc");
    assert!(matches!(*error, ClientError::ServerException { .. }));
    let snapshot = handle.snapshot();
    assert!(!snapshot.loading);
    assert!(snapshot.error.is_some());

    // The next action clears the prior error.
    let updated = handle
        .update(&name, &json!({"title": "y"}))
        .await
        .expect("update");
    assert_eq!(updated.get("title").and_then(Value::as_str), Some("y"));
    assert!(handle.snapshot().error.is_none());

    let ack = handle.remove(&name).await.expect("remove");
    assert_eq!(ack, Value::String("ok".to_string()));
    let snapshot = handle.snapshot();
    assert!(!snapshot.loading);
    assert!(snapshot.error.is_none());

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_resource_refreshes_after_login_and_logout() {
    let (addr, _state, shutdown_tx, server_task) = spawn_server().await;
    let client = FrappeClient::new(&format!("http://{addr}")).expect("build client");

    let auth = AuthResource::new(client);
    assert!(auth.snapshot().loading);

    assert_eq!(auth.refresh().await, None);
    assert!(!auth.is_logged_in());

    let password = SecretString::new(TEST_PASSWORD.to_string());
    auth.login(TEST_USER, &password).await.expect("login");
    assert!(auth.is_logged_in());
    assert_eq!(auth.user().as_deref(), Some("Administrator"));

    auth.logout().await.expect("logout");
    assert!(!auth.is_logged_in());
    assert!(!auth.snapshot().loading);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn realtime_subscribe_push_release_and_regeneration() {
    let (addr, state, shutdown_tx, server_task) = spawn_server().await;
    let client = FrappeClient::new(&format!("http://{addr}")).expect("build client");

    // Seed a document, fetch it, then watch it — the push arrives exactly
    // once per server emission.
    let created: Value = client
        .create_doc("Task", &json!({"title": "x"}))
        .await
        .expect("create doc");
    let name = created
        .get("name")
        .and_then(Value::as_str)
        .expect("created doc has a name")
        .to_string();
    let _doc: Value = client.get_doc("Task", &name).await.expect("get doc");

    let channel = format!("doc:Task:{name}");
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Value>();
    let subscription = client
        .realtime()
        .subscribe_doc("Task", Some(&name), move |payload| {
            let _ = events_tx.send(payload.clone());
        })
        .await
        .expect("subscribe doc");
    assert_eq!(subscription.channel(), channel);
    assert_eq!(client.realtime().generation().await, Some(1));

    wait_until(|| state.subscribe_count(&channel) == 1).await;

    state.push(ServerMessage::Event {
        channel: channel.clone(),
        payload: json!({"title": "y"}),
    });
    state.push(ServerMessage::Event {
        channel: channel.clone(),
        payload: json!({"title": "z"}),
    });
    // A push on an unrelated channel must not reach this callback.
    state.push(ServerMessage::Event {
        channel: "doc:Task:OTHER".to_string(),
        payload: json!({"title": "other"}),
    });

    let first = timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("first push")
        .expect("event channel open");
    assert_eq!(first, json!({"title": "y"}));
    let second = timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("second push")
        .expect("event channel open");
    assert_eq!(second, json!({"title": "z"}));
    assert!(
        timeout(Duration::from_millis(200), events_rx.recv())
            .await
            .is_err(),
        "unrelated channel must not be dispatched"
    );

    // Releasing the subscription emits exactly one unsubscribe upstream.
    subscription.unsubscribe();
    wait_until(|| state.unsubscribe_count(&channel) == 1).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(state.unsubscribe_count(&channel), 1);

    state.push(ServerMessage::Event {
        channel: channel.clone(),
        payload: json!({"title": "after-release"}),
    });
    assert!(
        timeout(Duration::from_millis(200), events_rx.recv())
            .await
            .unwrap_or(None)
            .is_none(),
        "released subscription must not fire"
    );

    // Disconnect clears the handle; the next subscribe opens a fresh
    // connection with a new generation.
    client.realtime().disconnect().await;
    assert_eq!(client.realtime().generation().await, None);
    client.realtime().disconnect().await;

    let (room_tx, mut room_rx) = mpsc::unbounded_channel::<Value>();
    let room_subscription = client
        .realtime()
        .subscribe_room("project-room", move |payload| {
            let _ = room_tx.send(payload.clone());
        })
        .await
        .expect("subscribe room");
    assert_eq!(client.realtime().generation().await, Some(2));

    wait_until(|| state.subscribe_count("project-room") == 1).await;
    state.push(ServerMessage::Event {
        channel: "project-room".to_string(),
        payload: json!({"announcement": "hello"}),
    });
    let announced = timeout(Duration::from_secs(2), room_rx.recv())
        .await
        .expect("room push")
        .expect("room channel open");
    assert_eq!(announced, json!({"announcement": "hello"}));

    drop(room_subscription);
    client.realtime().disconnect().await;

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_closes_connection_despite_live_subscription() {
    let (addr, state, shutdown_tx, server_task) = spawn_server().await;
    let client = FrappeClient::new(&format!("http://{addr}")).expect("build client");

    let subscription = client
        .realtime()
        .subscribe_room("lobby", |_payload| {})
        .await
        .expect("subscribe room");
    wait_until(|| state.subscribe_count("lobby") == 1).await;
    assert_eq!(state.open_session_count(), 1);

    // The handle outlives the disconnect; the worker must still close the
    // server-side session instead of idling on the open command queue.
    client.realtime().disconnect().await;
    wait_until(|| state.open_session_count() == 0).await;
    assert!(!client.realtime().is_connected().await);
    assert_eq!(client.realtime().generation().await, None);

    // Releasing the survivor afterwards stays safe and opens nothing new.
    subscription.unsubscribe();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(state.open_session_count(), 0);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_replays_registered_channel_interest() {
    let (addr, state, shutdown_tx, server_task) = spawn_server().await;
    let client = FrappeClient::new(&format!("http://{addr}")).expect("build client");

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Value>();
    let subscription = client
        .realtime()
        .subscribe_room("ticker", move |payload| {
            let _ = events_tx.send(payload.clone());
        })
        .await
        .expect("subscribe room");
    wait_until(|| state.subscribe_count("ticker") == 1).await;

    // Drop the session server-side; the worker reconnects and re-subscribes
    // every channel that is still registered.
    state.kill_session();
    wait_until(|| state.subscribe_count("ticker") == 2).await;

    state.push(ServerMessage::Event {
        channel: "ticker".to_string(),
        payload: json!({"price": 42}),
    });
    let delivered = timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("push after reconnect")
        .expect("event channel open");
    assert_eq!(delivered, json!({"price": 42}));

    subscription.unsubscribe();
    client.realtime().disconnect().await;

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clones_share_one_realtime_connection() {
    let (addr, state, shutdown_tx, server_task) = spawn_server().await;
    let client = FrappeClient::new(&format!("http://{addr}")).expect("build client");
    let clone = client.clone();

    let first = client
        .realtime()
        .subscribe_room("alpha", |_payload| {})
        .await
        .expect("subscribe alpha");
    let second = clone
        .realtime()
        .subscribe_room("beta", |_payload| {})
        .await
        .expect("subscribe beta");

    wait_until(|| state.subscribe_count("alpha") == 1 && state.subscribe_count("beta") == 1).await;
    assert_eq!(state.open_session_count(), 1);
    assert_eq!(client.realtime().generation().await, Some(1));
    assert_eq!(clone.realtime().generation().await, Some(1));

    first.unsubscribe();
    second.unsubscribe();
    client.realtime().disconnect().await;
    assert_eq!(clone.realtime().generation().await, None);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn spawn_server() -> (
    SocketAddr,
    MockState,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let state = MockState::default();
    let app = Router::new()
        .route("/api/method/login", axum::routing::post(login_handler))
        .route("/api/method/logout", axum::routing::post(logout_handler))
        .route(
            "/api/method/frappe.auth.get_logged_in_user",
            get(identity_handler),
        )
        .route("/api/method/frappe.ping", axum::routing::post(ping_handler))
        .route(
            "/api/resource/:doctype",
            get(list_handler).post(create_handler),
        )
        .route(
            "/api/resource/:doctype/:name",
            get(get_doc_handler)
                .put(update_handler)
                .delete(delete_handler),
        )
        .route("/ws", get(ws_handler))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, state, shutdown_tx, task)
}

fn has_session(headers: &HeaderMap, session: &str) -> bool {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|cookies| cookies.contains(session))
}

async fn login_handler(Json(payload): Json<Value>) -> Response {
    let usr = payload.get("usr").and_then(Value::as_str).unwrap_or("");
    let pwd = payload.get("pwd").and_then(Value::as_str).unwrap_or("");

    if usr == "broken" {
        return (
            StatusCode::OK,
            [(header::SET_COOKIE, format!("{BROKEN_SESSION}; Path=/"))],
            Json(json!({"message": "Logged In"})),
        )
            .into_response();
    }

    if usr == TEST_USER && pwd == TEST_PASSWORD {
        return (
            StatusCode::OK,
            [(header::SET_COOKIE, format!("{VALID_SESSION}; Path=/"))],
            Json(json!({
                "message": "Logged In",
                "home_page": "/app",
                "full_name": "Administrator"
            })),
        )
            .into_response();
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "Invalid login credentials"})),
    )
        .into_response()
}

async fn logout_handler() -> Response {
    (
        StatusCode::OK,
        [(header::SET_COOKIE, "sid=deleted; Path=/; Max-Age=0".to_string())],
        Json(json!({"message": ""})),
    )
        .into_response()
}

async fn identity_handler(headers: HeaderMap) -> Response {
    if has_session(&headers, BROKEN_SESSION) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "exc_type": "AuthenticationError",
                "exception": "session is broken"
            })),
        )
            .into_response();
    }
    let user = if has_session(&headers, VALID_SESSION) {
        "Administrator"
    } else {
        "Guest"
    };
    Json(json!({"message": user})).into_response()
}

async fn ping_handler() -> Json<Value> {
    Json(json!({"message": "pong"}))
}

async fn create_handler(
    State(state): State<MockState>,
    Path(_doctype): Path<String>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    let id = state.doc_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let name = format!("TASK-{id:04}");
    let mut doc = payload;
    if let Some(object) = doc.as_object_mut() {
        object.insert("name".to_string(), Value::String(name.clone()));
    }
    state
        .docs
        .lock()
        .expect("lock docs")
        .insert(name, doc.clone());
    Json(json!({"data": doc}))
}

async fn list_handler(
    State(state): State<MockState>,
    Path(_doctype): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    *state.observed_list_query.lock().expect("lock query") = Some(query);
    let docs: Vec<Value> = state.docs.lock().expect("lock docs").values().cloned().collect();
    Json(json!({"data": docs}))
}

async fn get_doc_handler(
    State(state): State<MockState>,
    Path((_doctype, name)): Path<(String, String)>,
) -> Response {
    match state.docs.lock().expect("lock docs").get(&name) {
        Some(doc) => Json(json!({"data": doc})).into_response(),
        None => missing_doc(&name),
    }
}

async fn update_handler(
    State(state): State<MockState>,
    Path((_doctype, name)): Path<(String, String)>,
    Json(patch): Json<Value>,
) -> Response {
    let mut docs = state.docs.lock().expect("lock docs");
    let Some(doc) = docs.get_mut(&name) else {
        return missing_doc(&name);
    };
    if let (Some(target), Some(fields)) = (doc.as_object_mut(), patch.as_object()) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
    Json(json!({"data": doc})).into_response()
}

async fn delete_handler(
    State(state): State<MockState>,
    Path((_doctype, name)): Path<(String, String)>,
) -> Response {
    match state.docs.lock().expect("lock docs").remove(&name) {
        Some(_) => Json(json!({"message": "ok"})).into_response(),
        None => missing_doc(&name),
    }
}

fn missing_doc(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "exc_type": "DoesNotExistError",
            "exception": format!("Task {name} not found")
        })),
    )
        .into_response()
}

async fn ws_handler(State(state): State<MockState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws_session(socket, state))
}

async fn run_ws_session(mut socket: WebSocket, state: MockState) {
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<ServerMessage>();
    *state.push_tx.lock().expect("lock push sender") = Some(push_tx);
    state.open_sessions.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            maybe_push = push_rx.recv() => {
                let Some(message) = maybe_push else { break };
                let payload = message.to_text().expect("encode server message");
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            maybe_frame = socket.next() => {
                match maybe_frame {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(message) = ClientMessage::from_text(&text) else {
                            break;
                        };
                        match message {
                            ClientMessage::Subscribe { channel } => {
                                *state
                                    .subscribes
                                    .lock()
                                    .expect("lock subscribes")
                                    .entry(channel)
                                    .or_insert(0) += 1;
                            }
                            ClientMessage::Unsubscribe { channel } => {
                                *state
                                    .unsubscribes
                                    .lock()
                                    .expect("lock unsubscribes")
                                    .entry(channel)
                                    .or_insert(0) += 1;
                            }
                            ClientMessage::Ping { client_time_ms: _ } => {
                                let pong = ServerMessage::Pong { server_time_ms: 0 }
                                    .to_text()
                                    .expect("encode pong");
                                if socket.send(Message::Text(pong)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.open_sessions.fetch_sub(1, Ordering::SeqCst);
}
