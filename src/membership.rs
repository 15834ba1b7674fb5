//! In-memory view of the DIDs already on the managed list.

use std::collections::HashSet;

/// Set of list members. Only grows; nothing in the service removes members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipStore {
    members: HashSet<String>,
}

impl MembershipStore {
    pub fn from_members<I: IntoIterator<Item = String>>(members: I) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn contains(&self, did: &str) -> bool {
        self.members.contains(did)
    }

    /// Insert `did`, returning `true` if it was not present before
    pub fn add(&mut self, did: &str) -> bool {
        if self.members.contains(did) {
            return false;
        }
        self.members.insert(did.to_string())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Sorted export for persistence
    pub fn to_vec(&self) -> Vec<String> {
        let mut members: Vec<String> = self.members.iter().cloned().collect();
        members.sort();
        members
    }
}
