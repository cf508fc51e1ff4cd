//! Registered group set and trigger matching.
//!
//! The registry mirrors the `registered_groups` table in memory so the poll
//! loop and the Command Bus can consult it without a store round-trip. Writes
//! go to the store first and only then become visible here.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::storage::{Database, DatabaseError, RegisteredGroup, StoredMessage};

/// In-memory view of every registered group, keyed by folder.
pub struct GroupRegistry {
    db: Database,
    main_folder: String,
    groups: RwLock<HashMap<String, RegisteredGroup>>,
}

impl GroupRegistry {
    /// Load the registry from the store.
    pub async fn load(db: Database, main_folder: impl Into<String>) -> Result<Self, DatabaseError> {
        let registry = Self {
            db,
            main_folder: main_folder.into(),
            groups: RwLock::new(HashMap::new()),
        };
        registry.reload().await?;
        Ok(registry)
    }

    /// Replace the in-memory set with the store's contents.
    pub async fn reload(&self) -> Result<usize, DatabaseError> {
        let groups = self.db.list_groups().await?;
        let count = groups.len();
        let map = groups.into_iter().map(|g| (g.folder.clone(), g)).collect();
        *self.groups.write().await = map;
        info!(count, "Registered groups loaded");
        Ok(count)
    }

    /// Persist a registration and make it visible.
    pub async fn register(&self, group: RegisteredGroup) -> Result<(), DatabaseError> {
        self.db.upsert_group(&group).await?;
        info!(group = %group.folder, jid = %group.jid, name = %group.name, "Group registered");
        self.groups.write().await.insert(group.folder.clone(), group);
        Ok(())
    }

    pub async fn get(&self, folder: &str) -> Option<RegisteredGroup> {
        self.groups.read().await.get(folder).cloned()
    }

    pub async fn by_jid(&self, jid: &str) -> Option<RegisteredGroup> {
        self.groups
            .read()
            .await
            .values()
            .find(|g| g.jid == jid)
            .cloned()
    }

    pub async fn contains(&self, folder: &str) -> bool {
        self.groups.read().await.contains_key(folder)
    }

    /// Every group, sorted by folder.
    pub async fn all(&self) -> Vec<RegisteredGroup> {
        let mut groups: Vec<_> = self.groups.read().await.values().cloned().collect();
        groups.sort_by(|a, b| a.folder.cmp(&b.folder));
        groups
    }

    /// Folder of the administrative group.
    pub fn main_folder(&self) -> &str {
        &self.main_folder
    }

    pub fn is_main(&self, folder: &str) -> bool {
        folder == self.main_folder
    }
}

/// Compiled trigger rule of one group.
#[derive(Debug, Clone)]
pub struct Trigger {
    regex: Option<Regex>,
}

impl Trigger {
    /// Messages trigger when they start with `pattern`, case-insensitively,
    /// followed by a non-word character or the end of the text.
    pub fn new(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Self { regex: None };
        }
        let source = format!(r"^\s*{}(?:\W|$)", regex::escape(pattern));
        match RegexBuilder::new(&source).case_insensitive(true).build() {
            Ok(regex) => Self { regex: Some(regex) },
            Err(e) => {
                warn!(pattern, error = %e, "Unusable trigger pattern");
                Self { regex: None }
            }
        }
    }

    pub fn matches(&self, content: &str) -> bool {
        self.regex.as_ref().is_some_and(|r| r.is_match(content))
    }
}

/// Whether `messages` should start an execution for `group`.
pub fn should_trigger(group: &RegisteredGroup, is_main: bool, messages: &[StoredMessage]) -> bool {
    if messages.is_empty() {
        return false;
    }
    if is_main || !group.requires_trigger {
        return true;
    }
    let trigger = Trigger::new(&group.trigger_pattern);
    messages.iter().any(|m| trigger.matches(&m.content))
}
