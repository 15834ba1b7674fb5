/// Main list sync orchestrator
///
/// Loads configuration, credentials and saved state, signs in to the list
/// owner's PDS, reconciles the member set and then feeds Jetstream messages
/// to the event processor until a shutdown signal arrives.

use crate::api::XrpcClient;
use crate::config::{AuthConfig, Config};
use crate::error::{Result, SyncError};
use crate::identity::{HandleResolver, IdentityResolver};
use crate::membership::MembershipStore;
use crate::models::ListRef;
use crate::pattern::PatternMatcher;
use crate::processor::IdentityEventProcessor;
use crate::storage::{PersistedState, StateStore};
use crate::websocket::{subscribe_url, JetstreamClient};
use std::future::Future;
use std::path::{Path, PathBuf};

/// Processor wired to the real network collaborators
pub type LiveProcessor = IdentityEventProcessor<HandleResolver, XrpcClient>;

/// List sync service
pub struct SyncClient {
    config: Config,
    matcher: PatternMatcher,
    auth: AuthConfig,
    auth_path: PathBuf,
    /// Loaded state, handed to the processor by `initialize`
    pending: Option<(StateStore, PersistedState)>,
    /// PLC directory override for DID document lookups
    plc_directory: Option<String>,
    processor: Option<LiveProcessor>,
}

impl SyncClient {
    /// Load and validate all local inputs
    ///
    /// Touches only the filesystem, so every configuration problem is
    /// reported before any connection is made.
    ///
    /// # Errors
    /// * Missing or invalid config / auth files
    /// * Unparseable state file
    pub fn new(config_path: &Path, auth_path: &Path, data_path: &Path) -> Result<Self> {
        let config = Config::load(config_path)?;
        let matcher = PatternMatcher::new(&config.handle_patterns)?;
        subscribe_url(&config.stream_endpoint, None)?;

        let auth = AuthConfig::load(auth_path)?;

        let mut store = StateStore::new(data_path);
        let state = store.load()?;

        Ok(Self {
            config,
            matcher,
            auth,
            auth_path: auth_path.to_path_buf(),
            pending: Some((store, state)),
            plc_directory: None,
            processor: None,
        })
    }

    /// Look up `did:plc` documents at `url` instead of the public directory
    pub fn with_plc_directory(mut self, url: &str) -> Self {
        self.plc_directory = Some(url.to_string());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Member set, once initialized
    pub fn members(&self) -> Option<&MembershipStore> {
        self.processor.as_ref().map(|p| p.members())
    }

    /// Sign in and reconcile the member set
    ///
    /// # Errors
    /// * Owner handle or PDS cannot be resolved
    /// * Login fails
    /// * Listing existing list items fails on a cold start
    pub async fn initialize(&mut self) -> Result<()> {
        let (store, state) = self.pending.take().ok_or_else(|| {
            SyncError::Config("Client is already initialized".to_string())
        })?;
        log::info!("Initializing...");

        let mut resolver = HandleResolver::new()?;
        if let Some(url) = &self.plc_directory {
            resolver = resolver.with_plc_directory(url);
        }
        let did = resolve_owner(&self.auth, &resolver).await?;
        let pds = resolver.pds_endpoint(&did).await?;
        log::info!("List owner {} is hosted at {}", did, pds);

        let xrpc = XrpcClient::new(&pds, &did, self.auth.clone(), Some(self.auth_path.clone()))?;
        xrpc.check_access().await?;

        let list = ListRef::new(&did, &self.config.list_identifier);
        log::info!("Managing list {}", list);

        let processor = IdentityEventProcessor::bootstrap(
            self.matcher.clone(),
            list,
            resolver,
            xrpc,
            store,
            state,
        )
        .await?;

        self.processor = Some(processor);
        Ok(())
    }

    /// Consume the stream until `shutdown` resolves or processing fails
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<()> {
        let processor = self.processor.as_mut().ok_or_else(|| {
            SyncError::Config("Client must be initialized before running".to_string())
        })?;

        let mut stream = JetstreamClient::new(&self.config.stream_endpoint, processor.cursor());
        processor.run(&mut stream, shutdown).await
    }
}

/// DID of the list owner named in the auth file
async fn resolve_owner<R: IdentityResolver>(auth: &AuthConfig, resolver: &R) -> Result<String> {
    if let Some(did) = auth.known_did() {
        return Ok(did.to_string());
    }

    resolver
        .resolve_handle(&auth.id)
        .await?
        .ok_or_else(|| SyncError::Config(format!("Couldn't resolve handle: @{}", auth.id)))
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
