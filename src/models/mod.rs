/// Data models for the list sync service.
/// Wire formats for Jetstream frames and repo records, plus the domain
/// messages handed to the event processor.

pub mod event;
pub mod record;

pub use event::{IdentityEvent, JetstreamEvent, StreamMessage, StreamPayload};
pub use record::{ListItemRecord, ListRef, RepoRecord, LIST_COLLECTION, LIST_ITEM_COLLECTION};
