//! Common test utilities and helpers for integration tests
//! Provides fake collaborators for the event processor and a fake PDS server
#![allow(dead_code)]

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use handle_list_sync::api::ListClient;
use handle_list_sync::error::{Result, SyncError};
use handle_list_sync::identity::IdentityResolver;
use handle_list_sync::models::{ListRef, RepoRecord, StreamMessage};
use handle_list_sync::pattern::PatternMatcher;
use handle_list_sync::processor::{IdentityEventProcessor, RetryPolicy};
use handle_list_sync::storage::{Cursor, PersistedState, StateStore};
use handle_list_sync::websocket::StreamSource;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub const OWNER_DID: &str = "did:plc:owner";
pub const LIST_KEY: &str = "3kabcdefghijk";
pub const VALID_PASSWORD: &str = "secret";
pub const REFRESH_TOKEN: &str = "refresh-1";

pub fn test_list() -> ListRef {
    ListRef::new(OWNER_DID, LIST_KEY)
}

pub fn test_matcher() -> PatternMatcher {
    PatternMatcher::new(&["alice.example", "*.bot.example"]).unwrap()
}

/// Test context holding an isolated state file location
pub struct TestContext {
    pub temp_dir: TempDir,
    pub state_path: PathBuf,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let state_path = temp_dir.path().join("data").join("data.json");
        TestContext {
            temp_dir,
            state_path,
        }
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.state_path)
    }

    /// State as currently on disk
    pub fn saved_state(&self) -> PersistedState {
        StateStore::new(&self.state_path)
            .load()
            .expect("Failed to load state")
    }

    pub fn saved_members(&self) -> Vec<String> {
        self.saved_state().list_members.unwrap_or_default()
    }

    /// Processor over an already reconciled, empty list
    pub async fn processor(
        &self,
        resolver: FakeResolver,
        lists: FakeListClient,
    ) -> IdentityEventProcessor<FakeResolver, FakeListClient> {
        let state = PersistedState {
            list_members: Some(Vec::new()),
            ..Default::default()
        };
        IdentityEventProcessor::bootstrap(
            test_matcher(),
            test_list(),
            resolver,
            lists,
            self.store(),
            state,
        )
        .await
        .expect("Failed to bootstrap processor")
        .with_retry(RetryPolicy::immediate(3))
    }
}

// ===== Identity resolver =====

/// Resolver answering from a fixed handle → DID table
#[derive(Clone, Default)]
pub struct FakeResolver {
    table: Arc<Mutex<HashMap<String, String>>>,
    failing: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, handle: &str, did: &str) -> Self {
        self.table
            .lock()
            .unwrap()
            .insert(handle.to_string(), did.to_string());
        self
    }

    /// Make lookups of `handle` fail with a resolution error
    pub fn failing(self, handle: &str) -> Self {
        self.failing.lock().unwrap().push(handle.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityResolver for FakeResolver {
    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>> {
        self.calls.lock().unwrap().push(handle.to_string());

        if self.failing.lock().unwrap().iter().any(|h| h == handle) {
            return Err(SyncError::Resolve(format!("lookup of {} timed out", handle)));
        }
        Ok(self.table.lock().unwrap().get(handle).cloned())
    }
}

// ===== List client =====

#[derive(Default)]
struct ListState {
    added: Vec<(String, String)>,
    create_calls: usize,
    list_calls: usize,
    failures: VecDeque<SyncError>,
}

/// In-memory list client recording every call
#[derive(Clone, Default)]
pub struct FakeListClient {
    state: Arc<Mutex<ListState>>,
    records: Arc<Vec<RepoRecord>>,
    panic_on: Option<String>,
}

impl FakeListClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing records returned by `list_all_records`
    pub fn with_records(mut self, records: Vec<RepoRecord>) -> Self {
        self.records = Arc::new(records);
        self
    }

    /// Errors returned by the next `create_list_item` calls, in order
    pub fn failing_with(self, errors: Vec<SyncError>) -> Self {
        self.state.lock().unwrap().failures.extend(errors);
        self
    }

    /// Panic when asked to add `subject`, simulating a crash mid-write
    pub fn panic_on(mut self, subject: &str) -> Self {
        self.panic_on = Some(subject.to_string());
        self
    }

    pub fn added(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .added
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }

    pub fn added_lists(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .added
            .iter()
            .map(|(_, list)| list.clone())
            .collect()
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }
}

#[async_trait]
impl ListClient for FakeListClient {
    async fn create_list_item(
        &self,
        list: &ListRef,
        subject: &str,
        _created_at: DateTime<Utc>,
    ) -> Result<()> {
        if self.panic_on.as_deref() == Some(subject) {
            panic!("simulated crash while adding {}", subject);
        }

        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        state.added.push((subject.to_string(), list.uri()));
        Ok(())
    }

    async fn list_all_records(&self, _owner: &str, _collection: &str) -> Result<Vec<RepoRecord>> {
        self.state.lock().unwrap().list_calls += 1;
        Ok(self.records.as_ref().clone())
    }
}

pub fn list_item(subject: &str, list_uri: &str, rkey: &str) -> RepoRecord {
    RepoRecord {
        uri: format!("at://{}/app.bsky.graph.listitem/{}", OWNER_DID, rkey),
        cid: None,
        value: json!({
            "$type": "app.bsky.graph.listitem",
            "subject": subject,
            "list": list_uri,
            "createdAt": "2024-09-05T06:11:04.870Z"
        }),
    }
}

// ===== Stream source =====

/// Stream replaying fixed messages
///
/// Once drained it either ends (`Ok(None)`) or, when `hold_open` is set,
/// signals `drained` and waits forever like an idle connection.
pub struct ScriptedStream {
    messages: VecDeque<Result<StreamMessage>>,
    cursor: Option<Cursor>,
    hold_open: bool,
    pub drained: Arc<Notify>,
    pub disconnected: bool,
}

impl ScriptedStream {
    pub fn new(messages: Vec<StreamMessage>) -> Self {
        Self {
            messages: messages.into_iter().map(Ok).collect(),
            cursor: None,
            hold_open: false,
            drained: Arc::new(Notify::new()),
            disconnected: false,
        }
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Append a transport failure after the scripted messages
    pub fn then_fail(mut self, err: SyncError) -> Self {
        self.messages.push_back(Err(err));
        self
    }
}

#[async_trait]
impl StreamSource for ScriptedStream {
    async fn next_message(&mut self) -> Result<Option<StreamMessage>> {
        if self.disconnected {
            return Ok(None);
        }

        match self.messages.pop_front() {
            Some(Ok(message)) => {
                self.cursor = Some(message.cursor);
                Ok(Some(message))
            }
            Some(Err(e)) => Err(e),
            None if self.hold_open => {
                self.drained.notify_one();
                std::future::pending::<()>().await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    async fn disconnect(&mut self) {
        self.disconnected = true;
    }
}

// ===== Fake PDS =====

/// Mutable state behind the fake PDS
#[derive(Default)]
pub struct PdsState {
    pub access_token: String,
    pub records: Vec<Value>,
    pub created: Vec<Value>,
    pub logins: usize,
    pub refreshes: usize,
    /// Respond 503 to this many createRecord calls first
    pub unavailable_creates: usize,
    /// Respond 503 to this many createSession / refreshSession calls first
    pub unavailable_sessions: usize,
    pub list_pages: usize,
}

pub type SharedPds = web::Data<Mutex<PdsState>>;

/// JWT-shaped token whose `exp` claim is `exp`
pub fn jwt_with_exp(exp: i64) -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256K","typ":"at+jwt"}"#);
    let payload = general_purpose::URL_SAFE_NO_PAD
        .encode(format!(r#"{{"scope":"com.atproto.appPass","sub":"{}","exp":{}}}"#, OWNER_DID, exp));
    format!("{}.{}.sig", header, payload)
}

pub fn fresh_access_token() -> String {
    jwt_with_exp(Utc::now().timestamp() + 3600)
}

fn bearer(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn xrpc_error(status: u16, error: &str, message: &str) -> HttpResponse {
    HttpResponse::build(actix_web::http::StatusCode::from_u16(status).unwrap())
        .json(json!({ "error": error, "message": message }))
}

fn session_body(access: &str) -> Value {
    json!({
        "did": OWNER_DID,
        "handle": "owner.example",
        "accessJwt": access,
        "refreshJwt": REFRESH_TOKEN,
    })
}

async fn create_session(pds: SharedPds, body: web::Json<Value>) -> HttpResponse {
    let mut state = pds.lock().unwrap();
    if state.unavailable_sessions > 0 {
        state.unavailable_sessions -= 1;
        return xrpc_error(503, "Unavailable", "try again later");
    }
    if body.get("password").and_then(Value::as_str) != Some(VALID_PASSWORD) {
        return xrpc_error(401, "AuthenticationRequired", "Invalid identifier or password");
    }
    state.logins += 1;
    HttpResponse::Ok().json(session_body(&state.access_token))
}

async fn refresh_session(pds: SharedPds, req: HttpRequest) -> HttpResponse {
    let mut state = pds.lock().unwrap();
    if state.unavailable_sessions > 0 {
        state.unavailable_sessions -= 1;
        return xrpc_error(503, "Unavailable", "try again later");
    }
    if bearer(&req).as_deref() != Some(REFRESH_TOKEN) {
        return xrpc_error(400, "ExpiredToken", "Token has expired");
    }
    state.refreshes += 1;
    HttpResponse::Ok().json(session_body(&state.access_token))
}

async fn create_record(pds: SharedPds, req: HttpRequest, body: web::Json<Value>) -> HttpResponse {
    let mut state = pds.lock().unwrap();
    if bearer(&req) != Some(state.access_token.clone()) {
        return xrpc_error(400, "ExpiredToken", "Token has expired");
    }
    if state.unavailable_creates > 0 {
        state.unavailable_creates -= 1;
        return xrpc_error(503, "Unavailable", "try again later");
    }

    let index = state.created.len();
    state.created.push(body.into_inner());
    HttpResponse::Ok().json(json!({
        "uri": format!("at://{}/app.bsky.graph.listitem/{}", OWNER_DID, index),
        "cid": "bafyreib2rxk3rh6kzwq",
    }))
}

async fn list_records(
    pds: SharedPds,
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let mut state = pds.lock().unwrap();
    if bearer(&req) != Some(state.access_token.clone()) {
        return xrpc_error(400, "ExpiredToken", "Token has expired");
    }
    if query.get("repo").map(String::as_str) != Some(OWNER_DID) {
        return xrpc_error(400, "InvalidRequest", "unknown repo");
    }

    let limit: usize = query
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(50);
    let start: usize = query
        .get("cursor")
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let end = (start + limit).min(state.records.len());
    state.list_pages += 1;

    let records: Vec<Value> = state.records[start.min(end)..end].to_vec();
    let mut body = json!({ "records": records });
    if end < state.records.len() {
        body["cursor"] = json!(end.to_string());
    }
    HttpResponse::Ok().json(body)
}

async fn did_document(path: web::Path<String>, req: HttpRequest) -> HttpResponse {
    let did = path.into_inner();
    if did != OWNER_DID {
        return HttpResponse::NotFound().body("DID not registered");
    }

    let host = req.connection_info().host().to_string();
    HttpResponse::Ok().json(json!({
        "id": did,
        "alsoKnownAs": ["at://owner.example"],
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": format!("http://{}/", host),
        }]
    }))
}

/// Start a fake PDS (plus PLC directory) on a random port
///
/// # Returns
/// A tuple of (server, bind_address, shared state)
pub fn create_fake_pds() -> std::io::Result<(actix_web::dev::Server, String, SharedPds)> {
    let pds: SharedPds = web::Data::new(Mutex::new(PdsState {
        access_token: fresh_access_token(),
        ..Default::default()
    }));
    let pds_clone = pds.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(pds_clone.clone())
            .route(
                "/xrpc/com.atproto.server.createSession",
                web::post().to(create_session),
            )
            .route(
                "/xrpc/com.atproto.server.refreshSession",
                web::post().to(refresh_session),
            )
            .route(
                "/xrpc/com.atproto.repo.createRecord",
                web::post().to(create_record),
            )
            .route(
                "/xrpc/com.atproto.repo.listRecords",
                web::get().to(list_records),
            )
            .route("/{did}", web::get().to(did_document))
    })
    .workers(1)
    .bind("127.0.0.1:0")?;

    let addr = server
        .addrs()
        .first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "No bind address found"))?
        .to_string();

    Ok((server.run(), addr, pds))
}

/// Spawn the fake PDS and wait for it to accept connections
pub async fn spawn_fake_pds() -> (String, SharedPds) {
    let (server, addr, pds) = create_fake_pds().expect("Failed to create fake PDS");
    tokio::spawn(server);

    // Give server a moment to bind
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    (format!("http://{}", addr), pds)
}

// ===== Fake Jetstream =====

pub fn identity_frame(time_us: i64, did: &str, handle: &str) -> String {
    format!(
        r#"{{"did":"{did}","time_us":{time_us},"kind":"identity","identity":{{"did":"{did}","handle":"{handle}","seq":1409753013,"time":"2024-09-05T06:11:04.870Z"}}}}"#
    )
}

pub fn account_frame(time_us: i64, did: &str) -> String {
    format!(
        r#"{{"did":"{did}","time_us":{time_us},"kind":"account","account":{{"active":true,"did":"{did}","seq":1409753014,"time":"2024-09-05T06:11:05.000Z"}}}}"#
    )
}

/// Fake Jetstream serving one batch of frames per connection
///
/// Every connection but the last is closed by the server after its frames;
/// the last one stays open until the client goes away. Request URIs are
/// reported on the returned channel.
pub async fn spawn_fake_jetstream(batches: Vec<Vec<String>>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (uri_tx, uri_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let total = batches.len();
        for (index, frames) in batches.into_iter().enumerate() {
            let (stream, _) = listener.accept().await.unwrap();
            let uri_tx = uri_tx.clone();
            let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                let _ = uri_tx.send(req.uri().to_string());
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();

            for frame in frames {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }

            if index + 1 < total {
                let _ = ws.close(None).await;
            } else {
                while let Some(Ok(_)) = ws.next().await {}
            }
        }
    });

    (format!("ws://{}", addr), uri_rx)
}
