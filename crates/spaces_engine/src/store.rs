//! Authoritative in-memory record of active and closed spaces.
//!
//! [`SpaceStore::apply`] is the only write path. It validates a mutation
//! against every record invariant before touching anything, so a rejected
//! mutation leaves the store exactly as it was. Accepted mutations bump
//! the record's version, drop the key from the read cache while the cache
//! lock is held, and come back as a [`Commit`] carrying both sides of the
//! change so the commit can be undone.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::cache::SpaceCache;
use crate::conflict;
use crate::error::{SpaceError, SpaceResult};
use crate::model::{
    ClosedSpace, FlushReason, LastKnownState, PermanentId, SCHEMA_VERSION, Space, SpaceRecord,
    StoredSpaces, WindowId,
};

/// A change to one space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Start tracking a live window.
    Create {
        window_id: WindowId,
        tab_urls: Vec<String>,
    },
    /// Set the user-chosen name.
    Rename { name: String },
    SetTabs { tab_urls: Vec<String> },
    /// Retire an active space, optionally with a final tab list.
    Close { tab_urls: Option<Vec<String>> },
    /// Bind a closed space to a live window again.
    Restore { window_id: WindowId },
    /// Forget a closed space for good.
    Remove,
}

impl Mutation {
    /// Critical mutations skip coalescing and are flushed right away.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Mutation::Rename { .. }
                | Mutation::Close { .. }
                | Mutation::Restore { .. }
                | Mutation::Remove
        )
    }
}

/// A mutation addressed to one key, with the version it was read against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRequest {
    pub key: PermanentId,
    pub expected_version: Option<u64>,
    pub mutation: Mutation,
}

impl MutationRequest {
    pub fn new(key: PermanentId, mutation: Mutation) -> Self {
        Self {
            key,
            expected_version: None,
            mutation,
        }
    }

    pub fn expecting(mut self, version: Option<u64>) -> Self {
        self.expected_version = version;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Renamed,
    Updated,
    Closed,
    Restored,
    Removed,
}

/// One accepted mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub seq: u64,
    pub key: PermanentId,
    pub before: Option<SpaceRecord>,
    pub after: Option<SpaceRecord>,
    pub change: ChangeKind,
    pub critical: bool,
}

impl Commit {
    /// Window the change concerns, taken from whichever side has one.
    pub fn window_id(&self) -> Option<WindowId> {
        self.after
            .as_ref()
            .and_then(SpaceRecord::live_window_id)
            .or_else(|| self.before.as_ref().and_then(SpaceRecord::live_window_id))
    }

    pub fn version(&self) -> Option<u64> {
        self.after.as_ref().map(SpaceRecord::version)
    }
}

#[derive(Debug)]
pub struct SpaceStore {
    active: BTreeMap<PermanentId, Space>,
    closed: BTreeMap<PermanentId, ClosedSpace>,
    by_window: HashMap<WindowId, PermanentId>,
    cache: SpaceCache,
    commit_seq: u64,
    max_name_len: usize,
}

impl SpaceStore {
    pub fn new(cache: SpaceCache, max_name_len: usize) -> Self {
        Self {
            active: BTreeMap::new(),
            closed: BTreeMap::new(),
            by_window: HashMap::new(),
            cache,
            commit_seq: 0,
            max_name_len,
        }
    }

    /// Rebuilds the store from a durable record.
    ///
    /// Expired closed spaces are dropped. A key present in both collections
    /// stays active. When two active spaces claim the same window, the one
    /// with the higher version keeps it and the other is closed.
    pub fn from_stored(
        stored: StoredSpaces,
        cache: SpaceCache,
        max_name_len: usize,
        now: OffsetDateTime,
        retention: Duration,
    ) -> Self {
        let mut store = Self::new(cache, max_name_len);
        store.closed = stored.closed_spaces;

        let mut spaces: Vec<Space> = stored.spaces.into_values().collect();
        spaces.sort_by(|a, b| {
            b.version
                .cmp(&a.version)
                .then_with(|| b.last_modified.cmp(&a.last_modified))
        });

        for space in spaces {
            if store.closed.remove(&space.permanent_id).is_some() {
                warn!(space_id = %space.permanent_id, "spaces_load_repair dropped closed duplicate");
            }
            if let Some(holder) = store.by_window.get(&space.live_window_id) {
                warn!(
                    window_id = %space.live_window_id,
                    kept = %holder,
                    closed = %space.permanent_id,
                    "spaces_load_repair window bound twice"
                );
                store
                    .closed
                    .insert(space.permanent_id.clone(), space.into_closed(now));
                continue;
            }
            store
                .by_window
                .insert(space.live_window_id, space.permanent_id.clone());
            store.active.insert(space.permanent_id.clone(), space);
        }

        let compacted = store.compact_expired(now, retention);
        debug!(
            active = store.active.len(),
            closed = store.closed.len(),
            compacted,
            "spaces_store_loaded"
        );
        store
    }

    /// Snapshot of both collections for a durable write.
    pub fn to_stored(&self, reason: FlushReason, now: OffsetDateTime) -> StoredSpaces {
        StoredSpaces {
            schema_version: SCHEMA_VERSION,
            spaces: self.active.clone(),
            closed_spaces: self.closed.clone(),
            last_known_state: LastKnownState {
                window_ids: self
                    .by_window
                    .iter()
                    .map(|(window, key)| (*window, key.clone()))
                    .collect(),
                reason,
            },
            last_modified: now,
        }
    }

    pub fn get(&self, key: &PermanentId) -> Option<SpaceRecord> {
        if let Some(space) = self.active.get(key) {
            return Some(SpaceRecord::Active(space.clone()));
        }
        self.closed
            .get(key)
            .map(|space| SpaceRecord::Closed(space.clone()))
    }

    pub fn by_window(&self, window_id: WindowId) -> Option<&Space> {
        self.by_window
            .get(&window_id)
            .and_then(|key| self.active.get(key))
    }

    /// Active spaces ordered by window id.
    pub fn list_active(&self) -> Vec<Space> {
        let mut spaces: Vec<Space> = self.active.values().cloned().collect();
        spaces.sort_by_key(|space| space.live_window_id);
        spaces
    }

    /// Closed spaces still inside the retention window, most recently
    /// closed first.
    pub fn list_closed(&self, now: OffsetDateTime, retention: Duration) -> Vec<ClosedSpace> {
        let mut spaces: Vec<ClosedSpace> = self
            .closed
            .values()
            .filter(|space| !space.is_expired(now, retention))
            .cloned()
            .collect();
        spaces.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        spaces
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }

    pub fn cache(&self) -> &SpaceCache {
        &self.cache
    }

    /// Drops closed spaces past retention. Returns how many were removed.
    pub fn compact_expired(&mut self, now: OffsetDateTime, retention: Duration) -> usize {
        let expired: Vec<PermanentId> = self
            .closed
            .iter()
            .filter(|(_, space)| space.is_expired(now, retention))
            .map(|(key, _)| key.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut cache = self.cache.lock_for_commit();
        for key in &expired {
            self.closed.remove(key);
            cache.invalidate(key);
        }
        expired.len()
    }

    /// Validates and commits one mutation.
    pub fn apply(&mut self, request: MutationRequest, now: OffsetDateTime) -> SpaceResult<Commit> {
        let MutationRequest {
            key,
            expected_version,
            mutation,
        } = request;
        let critical = mutation.is_critical();
        let before = self.get(&key);

        let (after, change) = match mutation {
            Mutation::Create { window_id, tab_urls } => {
                if before.is_some() {
                    return Err(SpaceError::Validation(format!("space {} already exists", key)));
                }
                self.ensure_window_free(window_id)?;
                let space = Space {
                    permanent_id: key.clone(),
                    live_window_id: window_id,
                    name: format!("Window {}", window_id),
                    custom_name: None,
                    tab_urls,
                    version: 1,
                    last_modified: now,
                };
                (Some(SpaceRecord::Active(space)), ChangeKind::Created)
            }
            Mutation::Rename { name } => {
                let mut space = self.active_for(&key, before.as_ref(), expected_version)?;
                space.custom_name = Some(self.validate_name(&name)?);
                Self::touch(&mut space.version, &mut space.last_modified, now);
                (Some(SpaceRecord::Active(space)), ChangeKind::Renamed)
            }
            Mutation::SetTabs { tab_urls } => {
                let mut space = self.active_for(&key, before.as_ref(), expected_version)?;
                space.tab_urls = tab_urls;
                Self::touch(&mut space.version, &mut space.last_modified, now);
                (Some(SpaceRecord::Active(space)), ChangeKind::Updated)
            }
            Mutation::Close { tab_urls } => {
                let mut space = self.active_for(&key, before.as_ref(), expected_version)?;
                if let Some(tab_urls) = tab_urls {
                    space.tab_urls = tab_urls;
                }
                Self::touch(&mut space.version, &mut space.last_modified, now);
                (Some(SpaceRecord::Closed(space.into_closed(now))), ChangeKind::Closed)
            }
            Mutation::Restore { window_id } => {
                let mut space = self.closed_for(&key, before.as_ref(), expected_version)?;
                self.ensure_window_free(window_id)?;
                Self::touch(&mut space.version, &mut space.last_modified, now);
                (Some(SpaceRecord::Active(space.into_active(window_id))), ChangeKind::Restored)
            }
            Mutation::Remove => {
                self.closed_for(&key, before.as_ref(), expected_version)?;
                (None, ChangeKind::Removed)
            }
        };

        self.commit_seq += 1;
        let commit = Commit {
            seq: self.commit_seq,
            key,
            before,
            after,
            change,
            critical,
        };
        self.install(&commit.key, commit.before.as_ref(), commit.after.as_ref());
        debug!(
            seq = commit.seq,
            space_id = %commit.key,
            change = ?commit.change,
            version = ?commit.version(),
            "spaces_commit"
        );
        Ok(commit)
    }

    /// Undoes a commit exactly. Only valid for the most recent commit on
    /// its key.
    pub fn revert(&mut self, commit: &Commit) {
        self.install(&commit.key, commit.after.as_ref(), commit.before.as_ref());
        warn!(seq = commit.seq, space_id = %commit.key, change = ?commit.change, "spaces_commit_reverted");
    }

    /// Replaces `from` with `to` for `key` in every index, invalidating the
    /// cache entry while its lock is held.
    fn install(&mut self, key: &PermanentId, from: Option<&SpaceRecord>, to: Option<&SpaceRecord>) {
        let mut cache = self.cache.lock_for_commit();

        match from {
            Some(SpaceRecord::Active(space)) => {
                self.active.remove(key);
                if self.by_window.get(&space.live_window_id) == Some(key) {
                    self.by_window.remove(&space.live_window_id);
                }
            }
            Some(SpaceRecord::Closed(_)) => {
                self.closed.remove(key);
            }
            None => {}
        }

        match to {
            Some(SpaceRecord::Active(space)) => {
                self.by_window.insert(space.live_window_id, key.clone());
                self.active.insert(key.clone(), space.clone());
            }
            Some(SpaceRecord::Closed(space)) => {
                self.closed.insert(key.clone(), space.clone());
            }
            None => {}
        }

        cache.invalidate(key);
    }

    fn touch(version: &mut u64, last_modified: &mut OffsetDateTime, now: OffsetDateTime) {
        *version = conflict::next_version(*version);
        *last_modified = now;
    }

    fn active_for(
        &self,
        key: &PermanentId,
        current: Option<&SpaceRecord>,
        expected: Option<u64>,
    ) -> SpaceResult<Space> {
        match current {
            Some(SpaceRecord::Active(space)) => {
                conflict::validate(expected, space.version)?;
                Ok(space.clone())
            }
            Some(SpaceRecord::Closed(_)) => Err(SpaceError::Validation(format!(
                "space {} is closed",
                key
            ))),
            None => Err(SpaceError::space_not_found(key)),
        }
    }

    fn closed_for(
        &self,
        key: &PermanentId,
        current: Option<&SpaceRecord>,
        expected: Option<u64>,
    ) -> SpaceResult<ClosedSpace> {
        match current {
            Some(SpaceRecord::Closed(space)) => {
                conflict::validate(expected, space.version)?;
                Ok(space.clone())
            }
            Some(SpaceRecord::Active(_)) => Err(SpaceError::Validation(format!(
                "space {} is not closed",
                key
            ))),
            None => Err(SpaceError::space_not_found(key)),
        }
    }

    fn ensure_window_free(&self, window_id: WindowId) -> SpaceResult<()> {
        match self.by_window.get(&window_id) {
            Some(holder) => Err(SpaceError::Validation(format!(
                "window {} is already bound to space {}",
                window_id, holder
            ))),
            None => Ok(()),
        }
    }

    fn validate_name(&self, name: &str) -> SpaceResult<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(SpaceError::Validation("name must not be empty".to_string()));
        }
        let len = trimmed.chars().count();
        if len > self.max_name_len {
            return Err(SpaceError::Validation(format!(
                "name is {} characters, limit is {}",
                len, self.max_name_len
            )));
        }
        Ok(trimmed.to_string())
    }
}
