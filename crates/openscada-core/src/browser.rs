// ── Browser cache ──
//
// The list of things a client may subscribe to (DA items, AE queries, HD
// items). New sessions get the full list; later changes are pushed to
// every session as increments.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::Attributes;
use crate::session::{Push, Session, SessionRegistry};

/// One browsable entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl BrowserEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            attributes: Attributes::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Entries of one service, pushed to the sessions of its registry.
pub struct BrowserCache {
    entries: Mutex<BTreeMap<String, BrowserEntry>>,
    sessions: Arc<SessionRegistry>,
}

impl BrowserCache {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            sessions,
        }
    }

    /// Add or replace entries and drop `removed` ids, then push the
    /// effective change to all sessions.
    pub fn update(&self, added: Vec<BrowserEntry>, removed: &[String]) {
        let (added, removed) = {
            let mut entries = self.entries.lock();
            let removed: Vec<String> = removed
                .iter()
                .filter(|id| entries.remove(id.as_str()).is_some())
                .cloned()
                .collect();
            let mut changed = Vec::new();
            for entry in added {
                if entries.get(&entry.id) != Some(&entry) {
                    entries.insert(entry.id.clone(), entry.clone());
                    changed.push(entry);
                }
            }
            (changed, removed)
        };
        if added.is_empty() && removed.is_empty() {
            return;
        }
        for session in self.sessions.sessions() {
            session.push(Push::Browser {
                added: added.clone(),
                removed: removed.clone(),
                full: false,
            });
        }
    }

    pub fn add(&self, entry: BrowserEntry) {
        self.update(vec![entry], &[]);
    }

    pub fn remove(&self, id: &str) {
        self.update(Vec::new(), &[id.to_owned()]);
    }

    /// Push the full list to a new session.
    pub fn attach(&self, session: &Session) {
        session.push(Push::Browser {
            added: self.entries(),
            removed: Vec::new(),
            full: true,
        });
    }

    pub fn entries(&self) -> Vec<BrowserEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_get_full_list_then_increments() {
        let registry = Arc::new(SessionRegistry::new("da", None));
        let browser = BrowserCache::new(Arc::clone(&registry));
        browser.add(BrowserEntry::new("a"));

        let (session, mut stream) = registry.create(None, BTreeMap::new()).unwrap();
        browser.attach(&session);
        browser.add(BrowserEntry::new("b"));
        browser.add(BrowserEntry::new("b"));
        browser.remove("a");
        browser.remove("a");
        session.executor().flush().await;

        let pushes: Vec<Push> = std::iter::from_fn(|| stream.try_recv()).collect();
        assert_eq!(
            pushes,
            vec![
                Push::Browser {
                    added: vec![BrowserEntry::new("a")],
                    removed: vec![],
                    full: true
                },
                Push::Browser {
                    added: vec![BrowserEntry::new("b")],
                    removed: vec![],
                    full: false
                },
                Push::Browser {
                    added: vec![],
                    removed: vec!["a".to_owned()],
                    full: false
                },
            ]
        );
    }
}
