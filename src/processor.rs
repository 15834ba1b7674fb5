//! Identity event processing
//!
//! Turns the stream of identity events into list additions. Each event goes
//! through filter → dedup → verify → add → persist, and the next event is
//! only looked at once the previous one is fully done. The cursor handed to
//! the state store never moves past an event whose add has not completed.

use crate::api::ListClient;
use crate::error::{Result, SyncError};
use crate::identity::IdentityResolver;
use crate::membership::MembershipStore;
use crate::models::{IdentityEvent, ListRef, StreamMessage, StreamPayload, LIST_ITEM_COLLECTION};
use crate::pattern::PatternMatcher;
use crate::storage::{Cursor, PersistedState, StateStore};
use crate::websocket::StreamSource;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;

/// Retry schedule for list-item writes that fail transiently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

/// How processing of a single message ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Not an identity message
    Ignored,
    /// Identity message without a handle
    NoHandle,
    /// Handle matches no configured pattern
    NotMatched,
    /// DID is already on the list
    AlreadyMember,
    /// Handle resolved to another DID (or to nothing)
    VerificationMismatch { resolved: Option<String> },
    /// The PDS refused the record permanently
    Rejected,
    /// List item created and state persisted
    Added,
}

/// Owns the membership set and cursor and applies stream messages to them
pub struct IdentityEventProcessor<R, L> {
    matcher: PatternMatcher,
    list: ListRef,
    resolver: R,
    lists: L,
    store: StateStore,
    members: MembershipStore,
    cursor: Option<Cursor>,
    retry: RetryPolicy,
}

impl<R: IdentityResolver, L: ListClient> IdentityEventProcessor<R, L> {
    /// Build a processor from loaded state
    ///
    /// When the state has no member list yet (first run) the list's current
    /// items are fetched from the PDS and persisted before anything else.
    /// Otherwise the saved members are trusted and nothing is fetched.
    ///
    /// # Errors
    /// * Network errors while listing existing records
    /// * Storage errors persisting the reconciled set
    pub async fn bootstrap(
        matcher: PatternMatcher,
        list: ListRef,
        resolver: R,
        lists: L,
        store: StateStore,
        state: PersistedState,
    ) -> Result<Self> {
        let cold_start = state.list_members.is_none();
        let members = match state.list_members {
            Some(saved) => {
                let members = MembershipStore::from_members(saved);
                log::info!("Loaded {} list members from state", members.len());
                members
            }
            None => fetch_list_members(&lists, &list).await?,
        };

        let processor = Self {
            matcher,
            list,
            resolver,
            lists,
            store,
            members,
            cursor: state.cursor,
            retry: RetryPolicy::default(),
        };

        if cold_start {
            processor.persist()?;
        }

        Ok(processor)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn members(&self) -> &MembershipStore {
        &self.members
    }

    /// Cursor of the last fully processed message
    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    /// Apply one stream message
    ///
    /// On error the cursor is left at the previous message, so the failed
    /// one is delivered again after a restart.
    pub async fn process(&mut self, message: &StreamMessage) -> Result<EventOutcome> {
        let outcome = match &message.payload {
            StreamPayload::Identity(event) => self.process_identity(message.cursor, event).await?,
            StreamPayload::Other { .. } => EventOutcome::Ignored,
        };

        if outcome != EventOutcome::Added {
            self.cursor = Some(message.cursor);
        }
        Ok(outcome)
    }

    async fn process_identity(
        &mut self,
        cursor: Cursor,
        event: &IdentityEvent,
    ) -> Result<EventOutcome> {
        let handle = match event.handle.as_deref() {
            Some(handle) => handle,
            None => return Ok(EventOutcome::NoHandle),
        };

        if !self.matcher.matches(handle) {
            return Ok(EventOutcome::NotMatched);
        }
        if self.members.contains(&event.did) {
            log::debug!("@{} ({}) is already on the list", handle, event.did);
            return Ok(EventOutcome::AlreadyMember);
        }

        // The claimed DID comes straight from the stream; only trust it if
        // the handle independently resolves to the same DID.
        let resolved = match self.resolver.resolve_handle(handle).await {
            Ok(resolved) => resolved,
            Err(e) => {
                log::warn!("Failed to resolve @{}: {}", handle, e);
                None
            }
        };
        if resolved.as_deref() != Some(event.did.as_str()) {
            log::warn!(
                "Error: @{} does not resolve to {} (resolved: {})",
                handle,
                event.did,
                resolved.as_deref().unwrap_or("nothing")
            );
            return Ok(EventOutcome::VerificationMismatch { resolved });
        }

        match self.add_with_retry(&event.did).await {
            Ok(()) => {}
            Err(e) if is_permanent_rejection(&e) => {
                log::error!("PDS rejected list item for @{} ({}): {}", handle, event.did, e);
                return Ok(EventOutcome::Rejected);
            }
            Err(e) => return Err(e),
        }

        self.members.add(&event.did);
        self.cursor = Some(cursor);
        self.persist()?;

        log::info!("Added account to list: @{} ({})", handle, event.did);
        Ok(EventOutcome::Added)
    }

    async fn add_with_retry(&self, did: &str) -> Result<()> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.lists.create_list_item(&self.list, did, Utc::now()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    log::warn!(
                        "Adding {} to list failed (attempt {}/{}): {}",
                        did,
                        attempt,
                        self.retry.max_attempts,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                }
                Err(e) if e.is_transient() => {
                    return Err(SyncError::RemoteWrite(format!(
                        "giving up on {} after {} attempts: {}",
                        did, attempt, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write cursor and members to disk
    pub fn persist(&self) -> Result<()> {
        self.store.save(self.cursor, &self.members)
    }

    /// Consume `stream` until it ends, fails, or `shutdown` resolves
    ///
    /// Shutdown also interrupts a message still in flight (resolution, add,
    /// retry backoff). Such a message has not moved the cursor, so it is
    /// delivered again on the next start. Every exit path saves the state and
    /// then disconnects the stream.
    pub async fn run<S, F>(&mut self, stream: &mut S, shutdown: F) -> Result<()>
    where
        S: StreamSource,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let result = loop {
            let next = tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Stopping...");
                    break Ok(());
                }
                next = stream.next_message() => next,
            };

            match next {
                Ok(Some(message)) => {
                    let processed = tokio::select! {
                        _ = &mut shutdown => {
                            log::info!("Stopping before cursor {} was processed...", message.cursor);
                            break Ok(());
                        }
                        processed = self.process(&message) => processed,
                    };

                    if let Err(e) = processed {
                        log::error!("Processing stopped at cursor {}: {}", message.cursor, e);
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let saved = self.persist();
        stream.disconnect().await;

        result.and(saved)
    }
}

/// Errors where retrying the same record can never succeed
fn is_permanent_rejection(err: &SyncError) -> bool {
    matches!(err, SyncError::Xrpc { status, .. } if (400..500).contains(status) && *status != 429)
        && !err.is_expired_token()
}

/// Current members of `list`, from the owner's list-item records
pub async fn fetch_list_members<L: ListClient>(
    lists: &L,
    list: &ListRef,
) -> Result<MembershipStore> {
    log::info!("Syncing current list items...");

    let list_uri = list.uri();
    let records = lists
        .list_all_records(&list.owner, LIST_ITEM_COLLECTION)
        .await?;

    let members = MembershipStore::from_members(
        records
            .iter()
            .filter_map(|record| record.list_item())
            .filter(|item| item.list == list_uri)
            .map(|item| item.subject),
    );

    log::info!(
        "Found {} list members in {} list item records",
        members.len(),
        records.len()
    );
    Ok(members)
}
