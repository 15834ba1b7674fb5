/// Configuration management for the list sync service.
/// Loads and validates the YAML config file and the account credential file.

use crate::error::{Result, SyncError};
use crate::storage::write_atomic;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "config/config.yml";
pub const DEFAULT_AUTH_FILE: &str = "config/auth.yml";
pub const DEFAULT_DATA_FILE: &str = "data/data.json";

/// Length of a record key produced by the PDS for new lists (a TID).
const LIST_IDENTIFIER_LEN: usize = 13;

/// Validated service configuration. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Jetstream host name or full ws/wss URL
    pub stream_endpoint: String,
    /// Handle globs, `*` standing for one or more characters
    pub handle_patterns: Vec<String>,
    /// Record key of the managed list
    pub list_identifier: String,
}

impl Config {
    /// Load and validate the config file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SyncError::Config(format!(
                "Missing config file at {}",
                path.display()
            )));
        }

        let text = fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a YAML config document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(text)?;

        let (key, endpoint) = require_field(&doc, &["stream_endpoint", "jetstream_host"])?;
        let stream_endpoint = match endpoint.as_str() {
            Some(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                return Err(SyncError::Config(format!(
                    "Invalid '{}' field in the config file (should be a string): {:?}",
                    key, endpoint
                )))
            }
        };

        let (key, patterns) = require_field(&doc, &["handle_patterns"])?;
        let handle_patterns = patterns
            .as_sequence()
            .filter(|seq| !seq.is_empty())
            .and_then(|seq| {
                seq.iter()
                    .map(|p| p.as_str().filter(|s| !s.is_empty()).map(str::to_string))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| {
                SyncError::Config(format!(
                    "Invalid '{}' field in the config file (should be an array of strings)",
                    key
                ))
            })?;

        let (key, list) = require_field(&doc, &["list_identifier", "list_key"])?;
        let list_identifier = match list.as_str() {
            Some(s) if s.chars().count() == LIST_IDENTIFIER_LEN => s.to_string(),
            _ => {
                return Err(SyncError::Config(format!(
                    "Invalid '{}' field in the config file (should be a {}-character string)",
                    key, LIST_IDENTIFIER_LEN
                )))
            }
        };

        Ok(Config {
            stream_endpoint,
            handle_patterns,
            list_identifier,
        })
    }
}

/// Find the first present, non-null field among `names`.
/// Reports the canonical (first) name when none is set.
fn require_field<'a>(doc: &'a Value, names: &[&'a str]) -> Result<(&'a str, &'a Value)> {
    names
        .iter()
        .find_map(|name| {
            doc.get(*name)
                .filter(|v| !v.is_null())
                .map(|v| (*name, v))
        })
        .ok_or_else(|| {
            SyncError::Config(format!(
                "Missing '{}' field in the config file",
                names[0]
            ))
        })
}

/// Account credentials plus the cached session tokens.
///
/// Tokens are written back to the same file after every login or refresh,
/// so restarts normally reuse the existing session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Handle or DID of the list owner
    #[serde(default)]
    pub id: String,

    /// App password, required only when no usable tokens are cached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,

    /// Explicit DID, skips handle resolution when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AuthConfig {
    /// Load the credential file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SyncError::Config(format!(
                "Missing auth file at {}",
                path.display()
            )));
        }

        let text = fs::read_to_string(path)?;
        let auth: AuthConfig = serde_yaml::from_str(&text)?;

        if auth.id.trim().is_empty() {
            return Err(SyncError::Config(
                "Missing 'id' field in the auth file".to_string(),
            ));
        }

        Ok(auth)
    }

    /// Write the credentials (including refreshed tokens) back to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)?;
        write_atomic(path, text.as_bytes())
    }

    /// DID known without a network lookup, if any
    pub fn known_did(&self) -> Option<&str> {
        self.did
            .as_deref()
            .or_else(|| Some(self.id.as_str()).filter(|id| id.starts_with("did:")))
    }
}
