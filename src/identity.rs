/// Handle and DID resolution
///
/// Maps handles to DIDs the way AT Protocol clients do: a DNS TXT record at
/// `_atproto.<handle>` first, then `https://<handle>/.well-known/atproto-did`.
/// Also looks up DID documents to find an account's PDS.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";

/// Maximum length of a DNS name, and so of a handle
const MAX_HANDLE_LEN: usize = 253;

/// Independent handle → DID lookup used to corroborate stream events
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve `handle` to a DID, `Ok(None)` if it does not resolve
    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>>;
}

/// DNS + HTTPS handle resolver
pub struct HandleResolver {
    dns: TokioResolver,
    http: Client,
    plc_directory: String,
}

impl HandleResolver {
    /// Create a resolver using the system DNS configuration
    pub fn new() -> Result<Self> {
        // Try system config, fall back to defaults
        let dns = TokioResolver::builder_tokio()
            .map(|b| b.build())
            .unwrap_or_else(|_| {
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            });

        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            dns,
            http,
            plc_directory: DEFAULT_PLC_DIRECTORY.to_string(),
        })
    }

    /// Use another PLC directory for `did:plc` documents
    pub fn with_plc_directory(mut self, url: &str) -> Self {
        self.plc_directory = url.trim_end_matches('/').to_string();
        self
    }

    async fn resolve_dns(&self, handle: &str) -> Option<String> {
        let name = format!("_atproto.{}.", handle);

        match self.dns.txt_lookup(name.as_str()).await {
            Ok(lookup) => lookup.iter().find_map(|txt| {
                let text: String = txt
                    .txt_data()
                    .iter()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect();
                parse_dns_txt(&text)
            }),
            Err(e) => {
                log::debug!("No DNS record for @{}: {}", handle, e);
                None
            }
        }
    }

    async fn resolve_well_known(&self, handle: &str) -> Option<String> {
        let url = format!("https://{}/.well-known/atproto-did", handle);

        let response = match self.http.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                log::debug!("Well-known lookup for @{} returned {}", handle, r.status());
                return None;
            }
            Err(e) => {
                log::debug!("Well-known lookup for @{} failed: {}", handle, e);
                return None;
            }
        };

        response
            .text()
            .await
            .ok()
            .and_then(|body| parse_well_known(&body))
    }

    /// Find the PDS endpoint of `did` from its DID document
    ///
    /// # Errors
    /// * Unsupported DID method
    /// * Network errors fetching the document
    /// * Documents without an `#atproto_pds` service
    pub async fn pds_endpoint(&self, did: &str) -> Result<String> {
        let url = did_document_url(did, &self.plc_directory)?;

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::Resolve(format!(
                "DID document lookup for {} failed: {}",
                did,
                response.status()
            )));
        }

        let document: Value = response.json().await?;
        pds_from_document(&document).ok_or_else(|| {
            SyncError::Resolve(format!("DID document of {} has no PDS endpoint", did))
        })
    }
}

#[async_trait]
impl IdentityResolver for HandleResolver {
    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>> {
        if !is_valid_handle(handle) {
            log::debug!("Not resolving malformed handle: {:?}", handle);
            return Ok(None);
        }

        if let Some(did) = self.resolve_dns(handle).await {
            return Ok(Some(did));
        }

        Ok(self.resolve_well_known(handle).await)
    }
}

/// Cheap syntax check before putting a handle into DNS names and URLs
fn is_valid_handle(handle: &str) -> bool {
    handle.len() <= MAX_HANDLE_LEN
        && handle.contains('.')
        && handle
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

/// `did=did:plc:...` → `did:plc:...`
fn parse_dns_txt(text: &str) -> Option<String> {
    text.trim()
        .strip_prefix("did=")
        .filter(|did| did.starts_with("did:"))
        .map(str::to_string)
}

fn parse_well_known(body: &str) -> Option<String> {
    let did = body.trim();
    if did.starts_with("did:") && !did.contains(char::is_whitespace) {
        Some(did.to_string())
    } else {
        None
    }
}

fn did_document_url(did: &str, plc_directory: &str) -> Result<String> {
    if did.starts_with("did:plc:") {
        Ok(format!("{}/{}", plc_directory, did))
    } else if let Some(host) = did.strip_prefix("did:web:") {
        Ok(format!(
            "https://{}/.well-known/did.json",
            host.replace("%3A", ":")
        ))
    } else {
        Err(SyncError::Resolve(format!("Unsupported DID method: {}", did)))
    }
}

fn pds_from_document(document: &Value) -> Option<String> {
    document
        .get("service")?
        .as_array()?
        .iter()
        .find(|service| {
            let id = service.get("id").and_then(Value::as_str).unwrap_or_default();
            let kind = service.get("type").and_then(Value::as_str).unwrap_or_default();
            id.ends_with("#atproto_pds") && kind == "AtprotoPersonalDataServer"
        })
        .and_then(|service| service.get("serviceEndpoint"))
        .and_then(Value::as_str)
        .map(|endpoint| endpoint.trim_end_matches('/').to_string())
}
