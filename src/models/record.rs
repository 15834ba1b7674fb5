/// Repository records touched by the service

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const LIST_COLLECTION: &str = "app.bsky.graph.list";
pub const LIST_ITEM_COLLECTION: &str = "app.bsky.graph.listitem";

/// Reference to the managed list: owner DID plus list record key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRef {
    pub owner: String,
    pub rkey: String,
}

impl ListRef {
    pub fn new(owner: &str, rkey: &str) -> Self {
        Self {
            owner: owner.to_string(),
            rkey: rkey.to_string(),
        }
    }

    /// `at://<owner>/app.bsky.graph.list/<rkey>`
    pub fn uri(&self) -> String {
        format!("at://{}/{}/{}", self.owner, LIST_COLLECTION, self.rkey)
    }
}

impl fmt::Display for ListRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// `app.bsky.graph.listitem` record body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItemRecord {
    #[serde(rename = "$type", default = "list_item_type")]
    pub record_type: String,
    pub subject: String,
    pub list: String,
    #[serde(default)]
    pub created_at: String,
}

fn list_item_type() -> String {
    LIST_ITEM_COLLECTION.to_string()
}

impl ListItemRecord {
    pub fn new(subject: &str, list: &ListRef, created_at: &str) -> Self {
        Self {
            record_type: list_item_type(),
            subject: subject.to_string(),
            list: list.uri(),
            created_at: created_at.to_string(),
        }
    }
}

/// One entry of a `com.atproto.repo.listRecords` page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRecord {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: Value,
}

impl RepoRecord {
    /// Decode the value as a list item, `None` for anything malformed
    pub fn list_item(&self) -> Option<ListItemRecord> {
        serde_json::from_value(self.value.clone()).ok()
    }
}
