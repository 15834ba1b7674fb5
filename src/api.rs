//! XRPC client for the list owner's PDS
//!
//! Handles session creation and refresh, and the two repo operations the
//! service needs: creating list items and paging through existing ones.

use crate::config::AuthConfig;
use crate::error::{Result, SyncError};
use crate::models::{ListItemRecord, ListRef, RepoRecord, LIST_ITEM_COLLECTION};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

/// Page size for `com.atproto.repo.listRecords`
const LIST_PAGE_SIZE: u32 = 100;

/// Access tokens expiring within this window are refreshed up front
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Remote operations on the managed list
#[async_trait]
pub trait ListClient: Send + Sync {
    /// Create an `app.bsky.graph.listitem` record adding `subject` to `list`
    async fn create_list_item(
        &self,
        list: &ListRef,
        subject: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Fetch every record of `collection` in `owner`'s repo
    async fn list_all_records(&self, owner: &str, collection: &str) -> Result<Vec<RepoRecord>>;
}

/// Session returned by `createSession` / `refreshSession`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub did: String,
    #[serde(default)]
    pub handle: Option<String>,
    pub access_jwt: String,
    pub refresh_jwt: String,
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ListRecordsResponse {
    #[serde(default)]
    records: Vec<RepoRecord>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

/// Authenticated XRPC client bound to one account
pub struct XrpcClient {
    client: Client,
    base_url: String,
    did: String,
    auth: Mutex<AuthConfig>,
    /// Where refreshed tokens are written back, if anywhere
    auth_path: Option<PathBuf>,
}

impl XrpcClient {
    /// Create a client for the PDS at `base_url` acting as `did`
    pub fn new(
        base_url: &str,
        did: &str,
        auth: AuthConfig,
        auth_path: Option<PathBuf>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            did: did.to_string(),
            auth: Mutex::new(auth),
            auth_path,
        })
    }

    /// DID of the account this client acts as
    pub fn did(&self) -> &str {
        &self.did
    }

    /// Make sure a usable access token is available
    ///
    /// Reuses a cached token while it is valid, refreshes it when it expired,
    /// and falls back to a password login otherwise.
    pub async fn check_access(&self) -> Result<()> {
        let mut auth = self.auth.lock().await;

        let valid = auth
            .access_token
            .as_deref()
            .map(|token| !token_expired(token, Utc::now().timestamp()))
            .unwrap_or(false);

        if valid {
            log::debug!("Reusing cached access token for {}", self.did);
            return Ok(());
        }

        self.renew_session(&mut auth).await
    }

    /// Refresh the session, logging in again if the refresh token is unusable
    async fn renew_session(&self, auth: &mut AuthConfig) -> Result<()> {
        if let Some(refresh) = auth.refresh_token.clone() {
            match self.refresh_session(&refresh).await {
                Ok(session) => return self.apply_session(auth, session),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => log::warn!("Session refresh failed, logging in again: {}", e),
            }
        }

        let session = self.create_session(auth).await?;
        self.apply_session(auth, session)
    }

    async fn create_session(&self, auth: &AuthConfig) -> Result<Session> {
        let password = auth.pass.as_deref().ok_or_else(|| {
            SyncError::Config("Missing 'pass' field in the auth file".to_string())
        })?;

        log::info!("Logging in as {}", auth.id);
        let body = json!({ "identifier": auth.id, "password": password });
        let value = self
            .send(Method::POST, "com.atproto.server.createSession", &[], Some(&body), None)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    e
                } else {
                    SyncError::Auth(format!("Login failed: {}", e))
                }
            })?;

        Ok(serde_json::from_value(value)?)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session> {
        log::info!("Refreshing access token");
        let value = self
            .send(
                Method::POST,
                "com.atproto.server.refreshSession",
                &[],
                None,
                Some(refresh_token),
            )
            .await?;

        Ok(serde_json::from_value(value)?)
    }

    fn apply_session(&self, auth: &mut AuthConfig, session: Session) -> Result<()> {
        if session.did != self.did {
            return Err(SyncError::Auth(format!(
                "Logged in as {} but expected {}",
                session.did, self.did
            )));
        }

        auth.access_token = Some(session.access_jwt);
        auth.refresh_token = Some(session.refresh_jwt);

        if let Some(path) = &self.auth_path {
            auth.save(path)?;
        }
        Ok(())
    }

    /// Authenticated call, renewing the session once if the token expired
    async fn call(
        &self,
        method: Method,
        nsid: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let token = self.auth.lock().await.access_token.clone();

        match self
            .send(method.clone(), nsid, query, body, token.as_deref())
            .await
        {
            Err(e) if e.is_expired_token() => {
                log::info!("Access token rejected by PDS, renewing session");
                let token = {
                    let mut auth = self.auth.lock().await;
                    self.renew_session(&mut auth).await?;
                    auth.access_token.clone()
                };
                self.send(method, nsid, query, body, token.as_deref()).await
            }
            other => other,
        }
    }

    async fn send(
        &self,
        method: Method,
        nsid: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Value> {
        let mut request = self
            .client
            .request(method, format!("{}/xrpc/{}", self.base_url, nsid))
            .query(query);

        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }

        let parsed = serde_json::from_str::<XrpcErrorBody>(&text).ok();
        Err(SyncError::Xrpc {
            status: status.as_u16(),
            error: parsed
                .as_ref()
                .and_then(|b| b.error.clone())
                .unwrap_or_else(|| status.to_string()),
            message: parsed.and_then(|b| b.message).unwrap_or(text),
        })
    }
}

#[async_trait]
impl ListClient for XrpcClient {
    async fn create_list_item(
        &self,
        list: &ListRef,
        subject: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let record = ListItemRecord::new(
            subject,
            list,
            &created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        let body = json!({
            "repo": list.owner,
            "collection": LIST_ITEM_COLLECTION,
            "record": record,
        });

        self.call(Method::POST, "com.atproto.repo.createRecord", &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn list_all_records(&self, owner: &str, collection: &str) -> Result<Vec<RepoRecord>> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![
                ("repo", owner.to_string()),
                ("collection", collection.to_string()),
                ("limit", LIST_PAGE_SIZE.to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }

            let value = self
                .call(Method::GET, "com.atproto.repo.listRecords", &query, None)
                .await?;
            let page: ListRecordsResponse = serde_json::from_value(value)?;

            log::debug!("Fetched {} {} records", page.records.len(), collection);
            let done = page.records.is_empty() || page.cursor.is_none();
            records.extend(page.records);

            if done {
                break;
            }
            cursor = page.cursor;
        }

        Ok(records)
    }
}

/// Whether the JWT's `exp` claim is within the refresh margin of `now`.
/// Tokens whose claims cannot be read are treated as expired.
fn token_expired(token: &str, now: i64) -> bool {
    let exp = token
        .split('.')
        .nth(1)
        .and_then(|payload| {
            general_purpose::URL_SAFE_NO_PAD
                .decode(payload.trim_end_matches('='))
                .ok()
        })
        .and_then(|bytes| serde_json::from_slice::<JwtClaims>(&bytes).ok())
        .and_then(|claims| claims.exp);

    match exp {
        Some(exp) => exp <= now + TOKEN_EXPIRY_MARGIN_SECS,
        None => true,
    }
}
