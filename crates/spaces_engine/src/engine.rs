//! The engine actor and its handle.
//!
//! One task owns the store, the update queue, the broadcast service, the
//! persistence manager and the reconciler, and drains a bounded mailbox.
//! Everything between two awaits is atomic with respect to other
//! requests. Timed work (coalescing deadlines, batched flushes, the
//! startup settle and the periodic reconcile) is driven from the same loop
//! with explicit instants.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastService, Notice, NoticeKey, SurfaceId};
use crate::cache::SpaceCache;
use crate::config::EngineConfig;
use crate::conflict;
use crate::error::{SpaceError, SpaceResult};
use crate::host::{HostWindows, WindowOpening};
use crate::model::{FlushReason, PermanentId, SpaceRecord, WindowId};
use crate::persistence::PersistenceManager;
use crate::protocol::{AllSpaces, BroadcastMessage, EngineStatus, HostEvent, Request};
use crate::queue::{Admission, MutationOutcome, Submission, UpdateQueue, Waiter};
use crate::reconcile::Reconciler;
use crate::storage::SpaceStorage;
use crate::store::{Commit, Mutation, MutationRequest, SpaceStore};

// === Messages ===

pub type RequestReply = oneshot::Sender<SpaceResult<Reply>>;

pub enum EngineMessage {
    Request {
        request: Request,
        reply: RequestReply,
    },
    /// Cache miss on the read path; the actor fills the cache.
    Load {
        key: PermanentId,
        reply: oneshot::Sender<SpaceResult<SpaceRecord>>,
    },
    Mutate {
        request: MutationRequest,
        reply: Waiter,
    },
    HostEvent(HostEvent),
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe(SurfaceId),
    Flush {
        reason: FlushReason,
        reply: oneshot::Sender<SpaceResult<()>>,
    },
    Reconcile {
        reply: oneshot::Sender<SpaceResult<ReconcileSummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Successful answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Spaces(AllSpaces),
    Space(SpaceRecord),
    Mutation(MutationOutcome),
    Status(EngineStatus),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub created: usize,
    pub reattached: usize,
    pub closed: usize,
}

/// A surface's broadcast stream.
#[derive(Debug)]
pub struct Subscription {
    pub id: SurfaceId,
    pub messages: mpsc::UnboundedReceiver<BroadcastMessage>,
}

// === Handle ===

/// Cloneable entry point to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMessage>,
    cache: SpaceCache,
    admission_timeout: Duration,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineMessage,
    ) -> SpaceResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.admit(build(reply_tx)).await?;
        match timeout(self.admission_timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(SpaceError::Unavailable),
            Err(_) => Err(SpaceError::Timeout("engine did not reply in time".to_string())),
        }
    }

    async fn admit(&self, message: EngineMessage) -> SpaceResult<()> {
        match timeout(self.admission_timeout, self.tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SpaceError::Unavailable),
            Err(_) => Err(SpaceError::Timeout("engine mailbox is full".to_string())),
        }
    }

    /// Dispatches one wire request. `subscribe` needs a stream and is only
    /// available through [`EngineHandle::subscribe`].
    pub async fn request(&self, request: Request) -> SpaceResult<Reply> {
        match request {
            Request::GetSpace { space_id } => self.get_space(&space_id).await.map(Reply::Space),
            Request::Subscribe | Request::AttachHost => Err(SpaceError::Validation(format!(
                "{} requires a streaming connection",
                request.action()
            ))),
            request => {
                self.call(|reply| EngineMessage::Request { request, reply })
                    .await?
            }
        }
    }

    /// Reads one space, from the cache when it holds a fresh entry.
    pub async fn get_space(&self, key: &PermanentId) -> SpaceResult<SpaceRecord> {
        if let Some(record) = self.cache.read(key, Instant::now()) {
            return Ok(record);
        }
        let key = key.clone();
        self.call(|reply| EngineMessage::Load { key, reply }).await?
    }

    /// Submits a mutation through the update queue.
    pub async fn mutate(&self, request: MutationRequest) -> SpaceResult<MutationOutcome> {
        self.call(|reply| EngineMessage::Mutate { request, reply })
            .await?
    }

    /// Delivers a host lifecycle signal. Returns once the engine has
    /// accepted it, not once it has been acted on.
    pub async fn host_event(&self, event: HostEvent) -> SpaceResult<()> {
        self.admit(EngineMessage::HostEvent(event)).await
    }

    pub async fn subscribe(&self) -> SpaceResult<Subscription> {
        self.call(|reply| EngineMessage::Subscribe { reply }).await
    }

    pub async fn unsubscribe(&self, id: SurfaceId) -> SpaceResult<()> {
        self.admit(EngineMessage::Unsubscribe(id)).await
    }

    pub async fn flush(&self) -> SpaceResult<()> {
        self.call(|reply| EngineMessage::Flush {
            reason: FlushReason::Manual,
            reply,
        })
        .await?
    }

    /// Applies everything pending and writes it out before the process
    /// may be suspended or killed.
    pub async fn suspend(&self) -> SpaceResult<()> {
        self.call(|reply| EngineMessage::Flush {
            reason: FlushReason::Suspend,
            reply,
        })
        .await?
    }

    pub async fn reconcile_now(&self) -> SpaceResult<ReconcileSummary> {
        self.call(|reply| EngineMessage::Reconcile { reply }).await?
    }

    pub async fn status(&self) -> SpaceResult<EngineStatus> {
        match self.request(Request::GetStatus).await? {
            Reply::Status(status) => Ok(status),
            other => Err(SpaceError::Validation(format!(
                "unexpected status reply: {:?}",
                other
            ))),
        }
    }

    /// Stops the engine after a final flush.
    pub async fn shutdown(&self) -> SpaceResult<()> {
        self.call(|reply| EngineMessage::Shutdown { reply }).await
    }
}

// === Actor ===

/// A restore waiting for the host to open its window.
struct PendingRestore {
    space_id: PermanentId,
    expected_version: Option<u64>,
    reply: RequestReply,
    expires_at: Instant,
}

pub struct Engine {
    config: EngineConfig,
    store: SpaceStore,
    queue: UpdateQueue,
    broadcast: BroadcastService,
    persistence: PersistenceManager,
    host: Arc<dyn HostWindows>,
    initialized: bool,
    startup_at: Instant,
    next_reconcile: Instant,
    /// Keyed by the host request id.
    pending_restores: HashMap<u64, PendingRestore>,
}

impl Engine {
    /// Loads durable state and builds the actor. Nothing runs until
    /// [`Engine::run`].
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn SpaceStorage>,
        host: Arc<dyn HostWindows>,
    ) -> SpaceResult<Self> {
        let persistence = PersistenceManager::new(
            storage,
            config.flush_delay(),
            config.degraded_after_failures,
        );
        let stored = persistence.load()?;
        let cache = SpaceCache::new(config.cache_ttl());
        let store = SpaceStore::from_stored(
            stored,
            cache,
            config.max_name_len,
            OffsetDateTime::now_utc(),
            config.closed_retention(),
        );
        let now = Instant::now();
        let startup_at = now + config.startup_settle();

        Ok(Self {
            queue: UpdateQueue::new(config.debounce()),
            broadcast: BroadcastService::new(config.broadcast_debounce()),
            persistence,
            store,
            host,
            initialized: false,
            startup_at,
            next_reconcile: startup_at,
            pending_restores: HashMap::new(),
            config,
        })
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineMessage>) {
        info!(
            active = self.store.active_len(),
            closed = self.store.closed_len(),
            "spaces_engine_started"
        );
        let mut shutdown_replies = Vec::new();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(EngineMessage::Shutdown { reply }) => {
                        info!("spaces_engine_shutting_down");
                        shutdown_replies.push(reply);
                        rx.close();
                    }
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },
                _ = sleep_until(deadline) => self.tick(Instant::now()),
            }
        }

        if let Err(e) = self.settle_all(FlushReason::Shutdown, Instant::now()) {
            warn!(error = %e, "spaces_shutdown_flush_failed");
        }
        for reply in shutdown_replies {
            if reply.send(()).is_err() {
                debug!("shutdown reply channel dropped");
            }
        }
        info!("spaces_engine_stopped");
    }

    fn handle_message(&mut self, msg: EngineMessage) {
        let now = Instant::now();
        match msg {
            EngineMessage::Request { request, reply } => self.handle_request(request, reply, now),
            EngineMessage::Load { key, reply } => {
                let result = self.load(&key, now);
                if reply.send(result).is_err() {
                    debug!("load reply channel dropped");
                }
            }
            EngineMessage::Mutate { request, reply } => {
                self.admit(Submission::new(request, Some(reply)), now);
            }
            EngineMessage::HostEvent(event) => self.handle_host_event(event, now),
            EngineMessage::Subscribe { reply } => {
                let (id, messages) = self.broadcast.subscribe();
                if reply.send(Subscription { id, messages }).is_err() {
                    self.broadcast.unsubscribe(id);
                }
            }
            EngineMessage::Unsubscribe(id) => self.broadcast.unsubscribe(id),
            EngineMessage::Flush { reason, reply } => {
                let result = self.settle_all(reason, now);
                if reply.send(result).is_err() {
                    debug!("flush reply channel dropped");
                }
            }
            EngineMessage::Reconcile { reply } => {
                let result = self.reconcile(now, false);
                if reply.send(result).is_err() {
                    debug!("reconcile reply channel dropped");
                }
            }
            EngineMessage::Shutdown { .. } => {}
        }
    }

    fn handle_request(&mut self, request: Request, reply: RequestReply, now: Instant) {
        debug!(action = request.action(), "spaces_request");
        let result = match request {
            Request::RestoreSpace {
                space_id,
                expected_version,
            } => match self.open_for_restore(&space_id, expected_version) {
                Ok(WindowOpening::Opened(window_id)) => {
                    self.bind_restored(space_id, expected_version, window_id, now)
                }
                Ok(WindowOpening::Requested(request_id)) => {
                    debug!(space_id = %space_id, request_id, "spaces_restore_awaiting_window");
                    self.pending_restores.insert(
                        request_id,
                        PendingRestore {
                            space_id,
                            expected_version,
                            reply,
                            expires_at: now + self.config.admission_timeout(),
                        },
                    );
                    return;
                }
                Err(e) => Err(e),
            },
            request => self.answer(request, now),
        };
        send_reply(reply, result);
    }

    fn answer(&mut self, request: Request, now: Instant) -> SpaceResult<Reply> {
        match request {
            Request::GetAllSpaces => Ok(Reply::Spaces(AllSpaces {
                spaces: self.store.list_active(),
                closed_spaces: self
                    .store
                    .list_closed(OffsetDateTime::now_utc(), self.config.closed_retention()),
            })),
            Request::GetSpace { space_id } => self.load(&space_id, now).map(Reply::Space),
            Request::RenameSpace {
                window_id,
                name,
                expected_version,
            } => {
                let key = self.key_for_window(window_id)?;
                let request = MutationRequest::new(key, Mutation::Rename { name })
                    .expecting(expected_version);
                self.critical(request, now).map(Reply::Mutation)
            }
            Request::CloseSpace {
                window_id,
                expected_version,
            } => {
                let key = self.key_for_window(window_id)?;
                let tab_urls = match self.host.tab_urls(window_id) {
                    Ok(tab_urls) => Some(tab_urls),
                    Err(e) => {
                        // A queued tab refresh is newer than the stored list.
                        let queued = self.queue.pending_tabs(&key).map(<[String]>::to_vec);
                        warn!(
                            window_id = %window_id,
                            error = %e,
                            queued = queued.is_some(),
                            "host_tabs_unavailable keeping last known tabs"
                        );
                        queued
                    }
                };
                let request = MutationRequest::new(key, Mutation::Close { tab_urls })
                    .expecting(expected_version);
                let outcome = self.critical(request, now)?;
                if let Err(e) = self.host.close_window(window_id) {
                    warn!(window_id = %window_id, error = %e, "host_close_window_failed");
                }
                Ok(Reply::Mutation(outcome))
            }
            Request::RemoveClosedSpace {
                space_id,
                expected_version,
            } => {
                let request =
                    MutationRequest::new(space_id, Mutation::Remove).expecting(expected_version);
                self.critical(request, now).map(Reply::Mutation)
            }
            Request::SwitchToSpace { window_id } => {
                let space = self
                    .store
                    .by_window(window_id)
                    .cloned()
                    .ok_or_else(|| SpaceError::window_not_found(window_id))?;
                self.host.focus_window(window_id)?;
                Ok(Reply::Space(SpaceRecord::Active(space)))
            }
            Request::GetStatus => Ok(Reply::Status(self.status())),
            request @ (Request::RestoreSpace { .. }
            | Request::Subscribe
            | Request::AttachHost) => Err(SpaceError::Validation(format!(
                "{} is not answered inline",
                request.action()
            ))),
        }
    }

    /// Checks the closed space and asks the host for a window.
    fn open_for_restore(
        &self,
        space_id: &PermanentId,
        expected_version: Option<u64>,
    ) -> SpaceResult<WindowOpening> {
        let closed = match self.store.get(space_id) {
            Some(SpaceRecord::Closed(closed)) => closed,
            Some(SpaceRecord::Active(_)) => {
                return Err(SpaceError::Validation(format!(
                    "space {} is already open",
                    space_id
                )));
            }
            None => return Err(SpaceError::space_not_found(space_id)),
        };
        if self
            .pending_restores
            .values()
            .any(|pending| &pending.space_id == space_id)
        {
            return Err(SpaceError::Validation(format!(
                "space {} is already being restored",
                space_id
            )));
        }
        conflict::validate(expected_version, closed.version)?;
        self.host.create_window(&closed.tab_urls)
    }

    /// Binds a restored space to its new window. The window is closed again
    /// when the commit fails.
    fn bind_restored(
        &mut self,
        space_id: PermanentId,
        expected_version: Option<u64>,
        window_id: WindowId,
        now: Instant,
    ) -> SpaceResult<Reply> {
        let request = MutationRequest::new(space_id, Mutation::Restore { window_id })
            .expecting(expected_version);
        match self.critical(request, now) {
            Ok(outcome) => Ok(Reply::Mutation(outcome)),
            Err(e) => {
                if let Err(close_err) = self.host.close_window(window_id) {
                    warn!(window_id = %window_id, error = %close_err, "host_close_window_failed");
                }
                Err(e)
            }
        }
    }

    /// Answers restores the host never confirmed.
    fn expire_restores(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pending_restores
            .iter()
            .filter(|(_, pending)| pending.expires_at <= now)
            .map(|(request_id, _)| *request_id)
            .collect();
        for request_id in expired {
            if let Some(pending) = self.pending_restores.remove(&request_id) {
                warn!(space_id = %pending.space_id, request_id, "spaces_restore_window_not_reported");
                send_reply(
                    pending.reply,
                    Err(SpaceError::Timeout(
                        "host did not open the window in time".to_string(),
                    )),
                );
            }
        }
    }

    fn key_for_window(&self, window_id: WindowId) -> SpaceResult<PermanentId> {
        self.store
            .by_window(window_id)
            .map(|space| space.permanent_id.clone())
            .ok_or_else(|| SpaceError::window_not_found(window_id))
    }

    /// Read-through fill of the cache.
    fn load(&self, key: &PermanentId, now: Instant) -> SpaceResult<SpaceRecord> {
        let record = self
            .store
            .get(key)
            .ok_or_else(|| SpaceError::space_not_found(key))?;
        if let SpaceRecord::Closed(closed) = &record {
            if closed.is_expired(OffsetDateTime::now_utc(), self.config.closed_retention()) {
                return Err(SpaceError::space_not_found(key));
            }
        }
        self.store.cache().insert(record.clone(), now);
        Ok(record)
    }

    fn handle_host_event(&mut self, event: HostEvent, now: Instant) {
        debug!(event = ?event, "host_event");
        self.host.observe(&event);
        match event {
            HostEvent::WindowCreated {
                window_id,
                request_id: Some(request_id),
                ..
            } if self.pending_restores.contains_key(&request_id) => {
                if let Some(pending) = self.pending_restores.remove(&request_id) {
                    let result = self.bind_restored(
                        pending.space_id,
                        pending.expected_version,
                        window_id,
                        now,
                    );
                    send_reply(pending.reply, result);
                }
            }
            HostEvent::WindowCreated { .. }
            | HostEvent::WindowRemoved { .. }
            | HostEvent::WindowFocusChanged { .. } => {
                if self.initialized {
                    self.reconcile_logged(now);
                }
            }
            HostEvent::TabCreated {
                window_id,
                tab_urls,
            }
            | HostEvent::TabUpdated {
                window_id,
                tab_urls,
            } => match self.store.by_window(window_id) {
                Some(space) => {
                    let request = MutationRequest::new(
                        space.permanent_id.clone(),
                        Mutation::SetTabs { tab_urls },
                    );
                    self.admit(Submission::new(request, None), now);
                }
                None => {
                    if self.initialized {
                        self.reconcile_logged(now);
                    }
                }
            },
            HostEvent::Startup { .. } => {
                self.initialized = false;
                self.startup_at = now + self.config.startup_settle();
                self.next_reconcile = self.startup_at;
            }
            HostEvent::Suspend => {
                if let Err(e) = self.settle_all(FlushReason::Suspend, now) {
                    warn!(error = %e, "spaces_suspend_flush_failed");
                }
            }
        }
    }

    // === Mutation path ===

    fn admit(&mut self, submission: Submission, now: Instant) {
        match self.queue.submit(submission, now) {
            Admission::Immediate {
                submission,
                cancelled,
            } => {
                if let Some(cancelled) = cancelled {
                    cancelled.coalesced();
                }
                let key = submission.request.key.clone();
                let result = self.commit_critical(submission.request.clone(), now);
                self.queue.complete(&key);
                submission.answer(result);
            }
            Admission::Deferred { superseded } => {
                if let Some(superseded) = superseded {
                    superseded.coalesced();
                }
            }
        }
    }

    /// Runs a critical mutation through the queue and returns its outcome.
    fn critical(&mut self, request: MutationRequest, now: Instant) -> SpaceResult<MutationOutcome> {
        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.admit(Submission::new(request, Some(reply_tx)), now);
        reply_rx
            .try_recv()
            .unwrap_or(Ok(MutationOutcome::Coalesced))
    }

    /// Applies, flushes, and reverts on a failed write.
    fn commit_critical(
        &mut self,
        request: MutationRequest,
        now: Instant,
    ) -> SpaceResult<MutationOutcome> {
        let commit = self.store.apply(request, OffsetDateTime::now_utc())?;
        self.announce(&commit, now);

        match self.persistence.flush(
            &self.store,
            FlushReason::Critical,
            now,
            OffsetDateTime::now_utc(),
        ) {
            Ok(()) => {
                self.broadcast.release(now, self.persistence.persisted_seq());
                Ok(MutationOutcome::Applied(commit.after))
            }
            Err(e) => {
                self.store.revert(&commit);
                self.broadcast.discard(commit.seq);
                Err(SpaceError::Io(e.to_string()))
            }
        }
    }

    fn apply_deferred(&mut self, submissions: Vec<Submission>, now: Instant) {
        for submission in submissions {
            let key = submission.request.key.clone();
            let result = self
                .store
                .apply(submission.request.clone(), OffsetDateTime::now_utc());
            self.queue.complete(&key);
            match result {
                Ok(commit) => {
                    self.announce(&commit, now);
                    self.persistence.schedule(now);
                    submission.answer(Ok(MutationOutcome::Applied(commit.after)));
                }
                Err(e) => {
                    debug!(space_id = %key, error = %e, "spaces_deferred_mutation_rejected");
                    submission.answer(Err(e));
                }
            }
        }
    }

    fn announce(&mut self, commit: &Commit, now: Instant) {
        self.broadcast.notify(
            NoticeKey::Space(commit.key.clone()),
            Notice::for_commit(commit),
            commit.critical,
            now,
        );
    }

    /// Applies every pending mutation, writes the store and sends every
    /// durable notice, ignoring all windows.
    fn settle_all(&mut self, reason: FlushReason, now: Instant) -> SpaceResult<()> {
        let pending = self.queue.take_all();
        self.apply_deferred(pending, now);
        let result = self
            .persistence
            .flush(&self.store, reason, now, OffsetDateTime::now_utc())
            .map_err(SpaceError::from);
        self.broadcast
            .release_all(now, self.persistence.persisted_seq());
        result
    }

    // === Reconciliation ===

    /// `reattach` is set only for the pass that follows a host startup,
    /// when window ids may have changed under the same tabs.
    fn reconcile(&mut self, now: Instant, reattach: bool) -> SpaceResult<ReconcileSummary> {
        let windows = self.host.list_windows()?;
        let report = Reconciler::reconcile(
            &mut self.store,
            &mut self.queue,
            &windows,
            reattach,
            OffsetDateTime::now_utc(),
            self.config.closed_retention(),
        );
        let critical = report.has_critical();
        for folded in report.folded {
            folded.coalesced();
        }
        for commit in &report.commits {
            self.announce(commit, now);
        }
        let summary = ReconcileSummary {
            created: report.created,
            reattached: report.reattached,
            closed: report.closed,
        };

        if critical {
            // Memory stays authoritative for reconciliation; a failed write
            // is retried by the batch timer.
            if let Err(e) = self.persistence.flush(
                &self.store,
                FlushReason::Critical,
                now,
                OffsetDateTime::now_utc(),
            ) {
                debug!(error = %e, "reconcile_flush_deferred");
            }
        } else if !report.commits.is_empty() {
            self.persistence.schedule(now);
        }
        self.broadcast.release(now, self.persistence.persisted_seq());
        Ok(summary)
    }

    fn reconcile_logged(&mut self, now: Instant) {
        if let Err(e) = self.reconcile(now, false) {
            warn!(error = %e, "reconcile_skipped host unavailable");
        }
    }

    fn startup(&mut self, now: Instant) {
        if let Err(e) = self.reconcile(now, true) {
            warn!(error = %e, "startup_reconcile_skipped host unavailable");
        }
        if self.store.commit_seq() > self.persistence.persisted_seq() {
            if let Err(e) = self.persistence.flush(
                &self.store,
                FlushReason::Scheduled,
                now,
                OffsetDateTime::now_utc(),
            ) {
                warn!(error = %e, "spaces_startup_flush_failed");
            }
        }
        self.initialized = true;
        self.next_reconcile = now + self.config.reconcile_interval();
        // Startup commits go out ahead of `initialized`.
        self.broadcast
            .release_all(now, self.persistence.persisted_seq());
        self.broadcast.notify(
            NoticeKey::Engine,
            Notice {
                seq: self.store.commit_seq(),
                message: BroadcastMessage::initialized(),
            },
            true,
            now,
        );
        self.broadcast.release(now, self.persistence.persisted_seq());
        info!(
            active = self.store.active_len(),
            closed = self.store.closed_len(),
            "spaces_engine_initialized"
        );
    }

    // === Timers ===

    fn next_deadline(&self) -> Instant {
        let mut deadline = if self.initialized {
            self.next_reconcile
        } else {
            self.startup_at
        };
        for candidate in [
            self.queue.next_deadline(),
            self.broadcast.next_deadline(),
            self.persistence.next_deadline(),
            self.pending_restores
                .values()
                .map(|pending| pending.expires_at)
                .min(),
        ]
        .into_iter()
        .flatten()
        {
            deadline = deadline.min(candidate);
        }
        deadline
    }

    fn tick(&mut self, now: Instant) {
        if !self.initialized && now >= self.startup_at {
            if self.host.is_ready() {
                self.startup(now);
            } else {
                debug!("spaces_startup_waiting_for_host");
                self.startup_at = now + self.config.reconcile_interval();
            }
        } else if self.initialized && now >= self.next_reconcile {
            self.reconcile_logged(now);
            let purged = self.store.cache().purge_expired(now);
            let compacted = self
                .store
                .compact_expired(OffsetDateTime::now_utc(), self.config.closed_retention());
            if compacted > 0 {
                self.persistence.schedule(now);
            }
            if purged > 0 || compacted > 0 {
                debug!(purged, compacted, "spaces_maintenance");
            }
            self.next_reconcile = now + self.config.reconcile_interval();
        }

        self.expire_restores(now);
        let due = self.queue.take_due(now);
        self.apply_deferred(due, now);

        if self.persistence.is_due(now) {
            if let Err(e) = self.persistence.flush(
                &self.store,
                FlushReason::Scheduled,
                now,
                OffsetDateTime::now_utc(),
            ) {
                debug!(error = %e, "spaces_batched_flush_retry_scheduled");
            }
        }

        self.broadcast.release(now, self.persistence.persisted_seq());
    }

    fn status(&self) -> EngineStatus {
        let persistence = self.persistence.status();
        EngineStatus {
            initialized: self.initialized,
            active_spaces: self.store.active_len(),
            closed_spaces: self.store.closed_len(),
            commit_seq: self.store.commit_seq(),
            persisted_seq: persistence.persisted_seq,
            pending_mutations: self.queue.pending_len(),
            pending_broadcasts: self.broadcast.pending_len(),
            subscribers: self.broadcast.subscriber_count(),
            consecutive_flush_failures: persistence.consecutive_failures,
            degraded: persistence.degraded,
            last_flush_error: persistence.last_error,
        }
    }
}

fn send_reply(reply: RequestReply, result: SpaceResult<Reply>) {
    if reply.send(result).is_err() {
        debug!("request reply channel dropped");
    }
}

/// Builds an engine over `storage` and `host` and runs it on the current
/// runtime.
pub fn spawn(
    config: EngineConfig,
    storage: Arc<dyn SpaceStorage>,
    host: Arc<dyn HostWindows>,
) -> SpaceResult<(EngineHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let admission_timeout = config.admission_timeout();
    let engine = Engine::new(config, storage, host)?;
    let handle = EngineHandle {
        tx,
        cache: engine.store.cache().clone(),
        admission_timeout,
    };
    let task = tokio::spawn(engine.run(rx));
    Ok((handle, task))
}
