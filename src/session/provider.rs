//! Media provider collaborators and the priority-ranked selection table.
//!
//! The table is read on every session start and written only when providers
//! are registered or toggled, so it sits behind an `RwLock`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use base64::Engine;
use uuid::Uuid;

use crate::models::TeleconsultSession;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Room creation failed: {0}")]
    RoomCreation(String),
    #[error("Unknown room: {0}")]
    UnknownRoom(String),
    #[error("Access token could not be issued: {0}")]
    Token(String),
    #[error("Provider not registered: {0}")]
    NotRegistered(String),
    #[error("Provider table lock poisoned")]
    LockPoisoned,
}

pub trait MediaProvider: Send + Sync {
    fn name(&self) -> &str;

    fn create_room(&self, session: &TeleconsultSession) -> Result<String, ProviderError>;

    fn issue_access_token(&self, user_id: &str, room_id: &str) -> Result<String, ProviderError>;

    fn close_room(&self, room_id: &str) -> Result<(), ProviderError>;
}

struct ProviderEntry {
    provider: Arc<dyn MediaProvider>,
    priority: i32,
    active: bool,
}

/// Registered providers in registration order.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<Vec<ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active provider. Re-registering a name replaces the entry
    /// but keeps its original position.
    pub fn register(&self, provider: Arc<dyn MediaProvider>, priority: i32) -> Result<(), ProviderError> {
        let mut entries = self.entries.write().map_err(|_| ProviderError::LockPoisoned)?;
        let name = provider.name().to_string();
        let entry = ProviderEntry {
            provider,
            priority,
            active: true,
        };
        match entries.iter_mut().find(|e| e.provider.name() == name) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        tracing::info!(provider = %name, priority, "Media provider registered");
        Ok(())
    }

    pub fn set_active(&self, name: &str, active: bool) -> Result<(), ProviderError> {
        let mut entries = self.entries.write().map_err(|_| ProviderError::LockPoisoned)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.provider.name() == name)
            .ok_or_else(|| ProviderError::NotRegistered(name.to_string()))?;
        entry.active = active;
        tracing::info!(provider = %name, active, "Media provider availability changed");
        Ok(())
    }

    /// Active providers, highest priority first; ties keep registration order.
    pub fn candidates(&self) -> Result<Vec<Arc<dyn MediaProvider>>, ProviderError> {
        let entries = self.entries.read().map_err(|_| ProviderError::LockPoisoned)?;
        let mut active: Vec<&ProviderEntry> = entries.iter().filter(|e| e.active).collect();
        // Stable sort preserves registration order among equal priorities.
        active.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(active.into_iter().map(|e| e.provider.clone()).collect())
    }

    /// The provider a new session would use right now.
    pub fn select(&self) -> Result<Option<Arc<dyn MediaProvider>>, ProviderError> {
        Ok(self.candidates()?.into_iter().next())
    }

    /// Look up a provider by name, active or not.
    pub fn get(&self, name: &str) -> Result<Option<Arc<dyn MediaProvider>>, ProviderError> {
        let entries = self.entries.read().map_err(|_| ProviderError::LockPoisoned)?;
        Ok(entries
            .iter()
            .find(|e| e.provider.name() == name)
            .map(|e| e.provider.clone()))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.iter().map(|e| e.provider.name().to_string()).collect())
            .unwrap_or_default();
        f.debug_struct("ProviderRegistry").field("providers", &names).finish()
    }
}

/// In-process provider: random room ids and bearer tokens, rooms tracked in memory.
pub struct LocalRoomProvider {
    name: String,
    rooms: Mutex<HashSet<String>>,
}

impl LocalRoomProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rooms: Mutex::new(HashSet::new()),
        }
    }

    pub fn open_rooms(&self) -> usize {
        self.rooms.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl MediaProvider for LocalRoomProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_room(&self, session: &TeleconsultSession) -> Result<String, ProviderError> {
        let room_id = format!("room-{}-{}", session.id.simple(), &Uuid::new_v4().simple().to_string()[..8]);
        self.rooms
            .lock()
            .map_err(|_| ProviderError::RoomCreation("room table lock poisoned".into()))?
            .insert(room_id.clone());
        Ok(room_id)
    }

    fn issue_access_token(&self, user_id: &str, room_id: &str) -> Result<String, ProviderError> {
        if user_id.trim().is_empty() {
            return Err(ProviderError::Token("user id is required".into()));
        }
        let known = self
            .rooms
            .lock()
            .map_err(|_| ProviderError::Token("room table lock poisoned".into()))?
            .contains(room_id);
        if !known {
            return Err(ProviderError::UnknownRoom(room_id.to_string()));
        }
        let bytes: [u8; 32] = rand::random();
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    fn close_room(&self, room_id: &str) -> Result<(), ProviderError> {
        let removed = self
            .rooms
            .lock()
            .map_err(|_| ProviderError::UnknownRoom(room_id.to_string()))?
            .remove(room_id);
        if removed {
            Ok(())
        } else {
            Err(ProviderError::UnknownRoom(room_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str) -> Arc<dyn MediaProvider> {
        Arc::new(LocalRoomProvider::new(name))
    }

    fn names(providers: &[Arc<dyn MediaProvider>]) -> Vec<String> {
        providers.iter().map(|p| p.name().to_string()).collect()
    }

    #[test]
    fn highest_priority_wins_ties_by_registration() {
        let registry = ProviderRegistry::new();
        registry.register(local("alpha"), 5).unwrap();
        registry.register(local("beta"), 10).unwrap();
        registry.register(local("gamma"), 10).unwrap();

        let candidates = registry.candidates().unwrap();
        assert_eq!(names(&candidates), vec!["beta", "gamma", "alpha"]);
        assert_eq!(registry.select().unwrap().unwrap().name(), "beta");
    }

    #[test]
    fn inactive_providers_are_skipped() {
        let registry = ProviderRegistry::new();
        registry.register(local("alpha"), 5).unwrap();
        registry.register(local("beta"), 10).unwrap();
        registry.set_active("beta", false).unwrap();

        assert_eq!(registry.select().unwrap().unwrap().name(), "alpha");
        registry.set_active("alpha", false).unwrap();
        assert!(registry.select().unwrap().is_none());
        assert!(registry.get("beta").unwrap().is_some());
        assert!(matches!(
            registry.set_active("delta", true),
            Err(ProviderError::NotRegistered(_))
        ));
    }

    #[test]
    fn re_register_keeps_position() {
        let registry = ProviderRegistry::new();
        registry.register(local("alpha"), 1).unwrap();
        registry.register(local("beta"), 1).unwrap();
        registry.register(local("alpha"), 1).unwrap();
        assert_eq!(names(&registry.candidates().unwrap()), vec!["alpha", "beta"]);
    }

    #[test]
    fn local_rooms_issue_tokens_until_closed() {
        let provider = LocalRoomProvider::new("local");
        let session = crate::db::repository::session_fixture("pat-1");
        let room = provider.create_room(&session).unwrap();
        assert_eq!(provider.open_rooms(), 1);

        let a = provider.issue_access_token("pat-1", &room).unwrap();
        let b = provider.issue_access_token("dr-lee", &room).unwrap();
        assert_ne!(a, b);

        provider.close_room(&room).unwrap();
        assert_eq!(provider.open_rooms(), 0);
        assert!(matches!(
            provider.issue_access_token("pat-1", &room),
            Err(ProviderError::UnknownRoom(_))
        ));
        assert!(provider.close_room(&room).is_err());
    }
}
