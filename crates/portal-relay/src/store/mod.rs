//! Durable session records: one per controller, keyed by controller id.
//!
//! Connections and routing tables are never persisted; only [`Session`]
//! records survive a restart.

mod file;
mod memory;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;

use std::collections::HashMap;

use async_trait::async_trait;
use portal_common::StoreError;
use serde::{Deserialize, Serialize};

/// Kind of a linked subscriber device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Mobile,
}

/// A subscriber that has paired with a session. Removed only by unpair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedDevice {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub paired_at: i64,
    pub last_seen: i64,
}

/// A session token handed to a subscriber at pairing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub device_id: String,
    pub issued_at: i64,
}

/// One controller and everything paired with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub controller_id: String,
    pub controller_name: String,
    pub pairing_code: String,
    pub pairing_passphrase: String,
    #[serde(default)]
    pub linked_subscribers: Vec<LinkedDevice>,
    /// Never sent to clients.
    #[serde(default)]
    pub issued_tokens: Vec<IssuedToken>,
    /// Proof of ownership for reclaiming `controller_id`. Only the desktop
    /// ever sees it. Empty for records that predate it.
    #[serde(default)]
    pub controller_secret: String,
    pub created_at: i64,
    pub last_activity: i64,
}

impl Session {
    pub fn new(
        controller_id: String,
        controller_name: String,
        pairing_code: String,
        pairing_passphrase: String,
        now: i64,
    ) -> Self {
        Self {
            controller_id,
            controller_name,
            pairing_code,
            pairing_passphrase,
            linked_subscribers: Vec::new(),
            issued_tokens: Vec::new(),
            controller_secret: String::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Link a device and record the token it was given.
    ///
    /// Devices are unique by id: linking an id again replaces the entry.
    pub fn link(&mut self, device: LinkedDevice, token: String, now: i64) {
        self.issued_tokens.push(IssuedToken {
            token,
            device_id: device.id.clone(),
            issued_at: now,
        });
        match self
            .linked_subscribers
            .iter_mut()
            .find(|d| d.id == device.id)
        {
            Some(existing) => *existing = device,
            None => self.linked_subscribers.push(device),
        }
        self.last_activity = now;
    }

    /// Remove a device and revoke its tokens. Returns false if it was not linked.
    pub fn unlink(&mut self, device_id: &str, now: i64) -> bool {
        let before = self.linked_subscribers.len();
        self.linked_subscribers.retain(|d| d.id != device_id);
        if self.linked_subscribers.len() == before {
            return false;
        }
        self.issued_tokens.retain(|t| t.device_id != device_id);
        self.last_activity = now;
        true
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.linked_subscribers.iter().any(|d| d.id == device_id)
    }

    /// The linked device a token was issued to, if it is still linked.
    pub fn device_for_token(&self, token: &str) -> Option<&LinkedDevice> {
        let issued = self.issued_tokens.iter().find(|t| t.token == token)?;
        self.linked_subscribers
            .iter()
            .find(|d| d.id == issued.device_id)
    }

    pub fn device_mut(&mut self, device_id: &str) -> Option<&mut LinkedDevice> {
        self.linked_subscribers.iter_mut().find(|d| d.id == device_id)
    }
}

/// Keyed durable storage for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load every record, keyed by controller id. Called once at startup.
    async fn load_all(&self) -> Result<HashMap<String, Session>, StoreError>;

    /// Durably write one record, replacing any previous version.
    async fn put(&self, session: &Session) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> LinkedDevice {
        LinkedDevice {
            id: id.into(),
            name: format!("{id}'s phone"),
            kind: DeviceKind::Mobile,
            paired_at: 10,
            last_seen: 10,
        }
    }

    fn session() -> Session {
        Session::new(
            "desk".into(),
            "Workstation".into(),
            "123456".into(),
            "apple-banana".into(),
            1,
        )
    }

    #[test]
    fn link_appends_and_records_token() {
        let mut s = session();
        s.link(device("m1"), "t1".into(), 5);
        s.link(device("m2"), "t2".into(), 6);

        assert_eq!(s.linked_subscribers.len(), 2);
        assert_eq!(s.issued_tokens.len(), 2);
        assert_eq!(s.last_activity, 6);
        assert_eq!(s.device_for_token("t2").unwrap().id, "m2");
    }

    #[test]
    fn link_same_id_replaces() {
        let mut s = session();
        s.link(device("m1"), "t1".into(), 5);
        let mut renamed = device("m1");
        renamed.name = "Renamed".into();
        s.link(renamed, "t1b".into(), 6);

        assert_eq!(s.linked_subscribers.len(), 1);
        assert_eq!(s.linked_subscribers[0].name, "Renamed");
        assert_eq!(s.device_for_token("t1").unwrap().id, "m1");
        assert_eq!(s.device_for_token("t1b").unwrap().id, "m1");
    }

    #[test]
    fn unlink_removes_device_and_tokens() {
        let mut s = session();
        s.link(device("m1"), "t1".into(), 5);
        s.link(device("m2"), "t2".into(), 6);

        assert!(s.unlink("m1", 9));
        assert!(!s.has_device("m1"));
        assert!(s.has_device("m2"));
        assert!(s.device_for_token("t1").is_none());
        assert_eq!(s.issued_tokens.len(), 1);
        assert_eq!(s.last_activity, 9);
    }

    #[test]
    fn unlink_unknown_is_noop() {
        let mut s = session();
        s.link(device("m1"), "t1".into(), 5);
        assert!(!s.unlink("nope", 9));
        assert_eq!(s.last_activity, 5);
    }

    #[test]
    fn linked_device_wire_shape() {
        let value = serde_json::to_value(device("m1")).unwrap();
        assert_eq!(value["id"], "m1");
        assert_eq!(value["type"], "mobile");
        assert_eq!(value["pairedAt"], 10);
        assert_eq!(value["lastSeen"], 10);
    }

    #[test]
    fn session_without_tokens_field_still_loads() {
        let json = r#"{
            "controllerId": "desk",
            "controllerName": "Workstation",
            "pairingCode": "123456",
            "pairingPassphrase": "apple",
            "linkedSubscribers": [],
            "createdAt": 1,
            "lastActivity": 2
        }"#;
        let s: Session = serde_json::from_str(json).unwrap();
        assert!(s.issued_tokens.is_empty());
        assert!(s.controller_secret.is_empty());
        assert_eq!(s.last_activity, 2);
    }
}
