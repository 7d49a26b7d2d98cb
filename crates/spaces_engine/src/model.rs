//! Space data model.
//!
//! Active spaces, closed spaces and the durable record that carries both
//! collections to disk.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 1;

/// Host window identifier. Only meaningful while the window is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable space identifier. Survives window close and restore and is
/// never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermanentId(String);

impl PermanentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PermanentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PermanentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PermanentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A space whose window is currently open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub permanent_id: PermanentId,
    pub live_window_id: WindowId,
    pub name: String,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub tab_urls: Vec<String>,
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

impl Space {
    /// The name shown to users: the custom name when set.
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }

    /// Retires this space, keeping its identity, names and tabs.
    pub fn into_closed(self, closed_at: OffsetDateTime) -> ClosedSpace {
        ClosedSpace {
            permanent_id: self.permanent_id,
            name: self.name,
            custom_name: self.custom_name,
            tab_urls: self.tab_urls,
            version: self.version,
            last_modified: self.last_modified,
            closed_at,
        }
    }
}

/// The retained record of a space after its window closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedSpace {
    pub permanent_id: PermanentId,
    pub name: String,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub tab_urls: Vec<String>,
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub closed_at: OffsetDateTime,
}

impl ClosedSpace {
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }

    /// True once `closed_at` is older than the retention window.
    pub fn is_expired(&self, now: OffsetDateTime, retention: Duration) -> bool {
        now - self.closed_at > retention
    }

    /// Reopens this space in `window_id`.
    pub fn into_active(self, window_id: WindowId) -> Space {
        Space {
            permanent_id: self.permanent_id,
            live_window_id: window_id,
            name: self.name,
            custom_name: self.custom_name,
            tab_urls: self.tab_urls,
            version: self.version,
            last_modified: self.last_modified,
        }
    }
}

/// Either side of a space's lifecycle, as returned by store reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SpaceRecord {
    Active(Space),
    Closed(ClosedSpace),
}

impl SpaceRecord {
    pub fn permanent_id(&self) -> &PermanentId {
        match self {
            SpaceRecord::Active(space) => &space.permanent_id,
            SpaceRecord::Closed(space) => &space.permanent_id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            SpaceRecord::Active(space) => space.version,
            SpaceRecord::Closed(space) => space.version,
        }
    }

    pub fn tab_urls(&self) -> &[String] {
        match self {
            SpaceRecord::Active(space) => &space.tab_urls,
            SpaceRecord::Closed(space) => &space.tab_urls,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            SpaceRecord::Active(space) => space.display_name(),
            SpaceRecord::Closed(space) => space.display_name(),
        }
    }

    pub fn live_window_id(&self) -> Option<WindowId> {
        match self {
            SpaceRecord::Active(space) => Some(space.live_window_id),
            SpaceRecord::Closed(_) => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SpaceRecord::Active(_))
    }
}

/// A window as reported by the host, with its tabs in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostWindow {
    pub id: WindowId,
    #[serde(default)]
    pub tab_urls: Vec<String>,
}

impl HostWindow {
    pub fn new(id: u64, tab_urls: &[&str]) -> Self {
        Self {
            id: WindowId(id),
            tab_urls: tab_urls.iter().map(|url| url.to_string()).collect(),
        }
    }
}

/// Why a durable write happened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushReason {
    #[default]
    Scheduled,
    Critical,
    Suspend,
    Shutdown,
    Manual,
}

/// Window bindings at the moment of the last durable write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastKnownState {
    #[serde(default)]
    pub window_ids: BTreeMap<WindowId, PermanentId>,
    #[serde(default)]
    pub reason: FlushReason,
}

/// The single durable record: both collections always travel together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSpaces {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub spaces: BTreeMap<PermanentId, Space>,
    #[serde(default)]
    pub closed_spaces: BTreeMap<PermanentId, ClosedSpace>,
    #[serde(default)]
    pub last_known_state: LastKnownState,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub last_modified: OffsetDateTime,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for StoredSpaces {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            spaces: BTreeMap::new(),
            closed_spaces: BTreeMap::new(),
            last_known_state: LastKnownState::default(),
            last_modified: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_space() -> Space {
        Space {
            permanent_id: PermanentId::from("space-1"),
            live_window_id: WindowId(42),
            name: "Window 42".to_string(),
            custom_name: None,
            tab_urls: vec!["https://example.com".to_string()],
            version: 3,
            last_modified: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_display_name_prefers_custom_name() {
        let mut space = sample_space();
        assert_eq!(space.display_name(), "Window 42");
        space.custom_name = Some("Work".to_string());
        assert_eq!(space.display_name(), "Work", "custom name must win");
    }

    #[test]
    fn test_close_and_reopen_keeps_identity_and_tabs() {
        let space = sample_space();
        let closed = space.clone().into_closed(OffsetDateTime::UNIX_EPOCH);
        assert_eq!(closed.permanent_id, space.permanent_id);
        assert_eq!(closed.tab_urls, space.tab_urls);
        assert_eq!(closed.version, 3, "closing alone must not touch the version");

        let reopened = closed.into_active(WindowId(7));
        assert_eq!(reopened.live_window_id, WindowId(7));
        assert_eq!(reopened.permanent_id, space.permanent_id);
    }

    #[test]
    fn test_closed_space_expiry_uses_retention_window() {
        let closed = sample_space().into_closed(OffsetDateTime::UNIX_EPOCH);
        let retention = Duration::from_secs(30 * 24 * 60 * 60);
        let day = time::Duration::days(1);
        assert!(!closed.is_expired(OffsetDateTime::UNIX_EPOCH + day * 29, retention));
        assert!(closed.is_expired(OffsetDateTime::UNIX_EPOCH + day * 31, retention));
    }

    #[test]
    fn test_stored_spaces_uses_camel_case_layout() {
        let mut stored = StoredSpaces::default();
        let space = sample_space();
        stored
            .last_known_state
            .window_ids
            .insert(space.live_window_id, space.permanent_id.clone());
        stored.spaces.insert(space.permanent_id.clone(), space);

        let json = serde_json::to_value(&stored).unwrap();
        assert!(json.get("closedSpaces").is_some(), "closed collection must be present");
        assert!(json.get("lastKnownState").is_some());
        assert_eq!(json["spaces"]["space-1"]["liveWindowId"], 42);
        assert_eq!(json["lastKnownState"]["windowIds"]["42"], "space-1");

        let back: StoredSpaces = serde_json::from_value(json).unwrap();
        assert_eq!(back, stored, "stored record must survive serialization");
    }

    #[test]
    fn test_space_record_is_tagged_by_state() {
        let record = SpaceRecord::Active(sample_space());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["permanentId"], "space-1");
    }
}
