//! Boundary to the host's window and tab table.
//!
//! The engine never owns windows. It asks a [`HostWindows`] implementation
//! what is open and asks it to open, focus or close windows. Failures come
//! back as [`SpaceError::HostApi`].

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{SpaceError, SpaceResult};
use crate::model::{HostWindow, WindowId};
use crate::protocol::{HostCommand, HostEvent};

/// Result of asking the host for a new window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOpening {
    /// The window exists now.
    Opened(WindowId),
    /// The host was asked to open it and will report it through a
    /// `windowCreated` event carrying this request id.
    Requested(u64),
}

pub trait HostWindows: Send + Sync {
    /// Every open window with its tabs, in a stable order.
    fn list_windows(&self) -> SpaceResult<Vec<HostWindow>>;
    fn tab_urls(&self, window_id: WindowId) -> SpaceResult<Vec<String>>;
    /// Opens a window with the given tabs.
    fn create_window(&self, tab_urls: &[String]) -> SpaceResult<WindowOpening>;
    fn focus_window(&self, window_id: WindowId) -> SpaceResult<()>;
    fn close_window(&self, window_id: WindowId) -> SpaceResult<()>;

    /// False until the host has reported its full window table. The
    /// engine does not reconcile against a table that is not ready.
    fn is_ready(&self) -> bool {
        true
    }

    /// Sees every host event before the engine acts on it.
    fn observe(&self, _event: &HostEvent) {}
}

#[derive(Debug, Default)]
struct MirrorInner {
    windows: BTreeMap<WindowId, Vec<String>>,
    focused: Option<WindowId>,
    next_window: u64,
    next_request: u64,
    failing: bool,
    ready: bool,
    /// `None` for a local table that carries out commands itself.
    remote: Option<Remote>,
}

#[derive(Debug, Default)]
struct Remote {
    commands: Option<mpsc::UnboundedSender<HostCommand>>,
}

/// A window table kept up to date from host events.
///
/// [`MirrorHost::new`] is the daemon's view of a remote host: it is not
/// ready until the host sends `startup`, and window commands go to the
/// connection registered with [`MirrorHost::attach`]. A table built with
/// [`MirrorHost::with_windows`] is local and applies commands to itself;
/// windows it opens get ids above any it has seen.
#[derive(Debug, Default)]
pub struct MirrorHost {
    inner: Mutex<MirrorInner>,
}

impl MirrorHost {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MirrorInner {
                remote: Some(Remote::default()),
                ..MirrorInner::default()
            }),
        }
    }

    pub fn with_windows(windows: &[HostWindow]) -> Self {
        let host = Self::default();
        host.replace_all(windows);
        host
    }

    /// Registers the host's command channel, replacing any earlier one.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<HostCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        match inner.remote.as_mut() {
            Some(remote) => remote.commands = Some(tx),
            None => debug!("host_attach_ignored local table"),
        }
        info!("host_attached");
        rx
    }

    pub fn open_window(&self, window_id: WindowId, tab_urls: Vec<String>) {
        let mut inner = self.inner.lock();
        inner.next_window = inner.next_window.max(window_id.0);
        inner.windows.insert(window_id, tab_urls);
    }

    pub fn remove_window(&self, window_id: WindowId) {
        let mut inner = self.inner.lock();
        inner.windows.remove(&window_id);
        if inner.focused == Some(window_id) {
            inner.focused = None;
        }
    }

    /// Updates the tabs of a known window. Unknown windows are ignored; a
    /// window only enters the table through `windowCreated` or `startup`.
    pub fn set_tabs(&self, window_id: WindowId, tab_urls: Vec<String>) {
        match self.inner.lock().windows.get_mut(&window_id) {
            Some(tabs) => *tabs = tab_urls,
            None => debug!(window_id = %window_id, "host_tabs_for_unknown_window_ignored"),
        }
    }

    /// Replaces the whole table and marks it ready.
    pub fn replace_all(&self, windows: &[HostWindow]) {
        let mut inner = self.inner.lock();
        inner.windows = windows
            .iter()
            .map(|window| (window.id, window.tab_urls.clone()))
            .collect();
        if let Some(max) = inner.windows.keys().map(|id| id.0).max() {
            inner.next_window = inner.next_window.max(max);
        }
        inner.ready = true;
    }

    pub fn focused(&self) -> Option<WindowId> {
        self.inner.lock().focused
    }

    /// Makes every host call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().failing = failing;
    }

    /// Folds a host event into the table.
    pub fn apply_event(&self, event: &HostEvent) {
        match event {
            HostEvent::WindowCreated {
                window_id,
                tab_urls,
                ..
            } => self.open_window(*window_id, tab_urls.clone()),
            HostEvent::WindowRemoved { window_id } => self.remove_window(*window_id),
            HostEvent::WindowFocusChanged { window_id } => {
                self.inner.lock().focused = Some(*window_id);
            }
            HostEvent::TabCreated {
                window_id,
                tab_urls,
            }
            | HostEvent::TabUpdated {
                window_id,
                tab_urls,
            } => self.set_tabs(*window_id, tab_urls.clone()),
            HostEvent::Startup { windows } => self.replace_all(windows),
            HostEvent::Suspend => {}
        }
    }

    fn check(inner: &MirrorInner, call: &str) -> SpaceResult<()> {
        if inner.failing {
            return Err(SpaceError::HostApi(format!("{} unavailable", call)));
        }
        Ok(())
    }

    fn check_known(inner: &MirrorInner, window_id: WindowId) -> SpaceResult<()> {
        if !inner.windows.contains_key(&window_id) {
            return Err(SpaceError::HostApi(format!("no window {}", window_id)));
        }
        Ok(())
    }

    /// Hands `command` to the attached host. Errors when none is attached or
    /// its connection went away.
    fn send(remote: &mut Remote, command: HostCommand) -> SpaceResult<()> {
        let delivered = match &remote.commands {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        };
        if !delivered {
            remote.commands = None;
            return Err(SpaceError::HostApi("no host attached".to_string()));
        }
        Ok(())
    }
}

impl HostWindows for MirrorHost {
    fn list_windows(&self) -> SpaceResult<Vec<HostWindow>> {
        let inner = self.inner.lock();
        Self::check(&inner, "list_windows")?;
        Ok(inner
            .windows
            .iter()
            .map(|(id, tab_urls)| HostWindow {
                id: *id,
                tab_urls: tab_urls.clone(),
            })
            .collect())
    }

    fn tab_urls(&self, window_id: WindowId) -> SpaceResult<Vec<String>> {
        let inner = self.inner.lock();
        Self::check(&inner, "tab_urls")?;
        inner
            .windows
            .get(&window_id)
            .cloned()
            .ok_or_else(|| SpaceError::HostApi(format!("no window {}", window_id)))
    }

    fn create_window(&self, tab_urls: &[String]) -> SpaceResult<WindowOpening> {
        let mut inner = self.inner.lock();
        Self::check(&inner, "create_window")?;
        let inner = &mut *inner;
        match inner.remote.as_mut() {
            Some(remote) => {
                let request_id = inner.next_request + 1;
                Self::send(
                    remote,
                    HostCommand::OpenWindow {
                        request_id,
                        tab_urls: tab_urls.to_vec(),
                    },
                )?;
                inner.next_request = request_id;
                debug!(request_id, tabs = tab_urls.len(), "host_open_window_requested");
                Ok(WindowOpening::Requested(request_id))
            }
            None => {
                inner.next_window += 1;
                let id = WindowId(inner.next_window);
                inner.windows.insert(id, tab_urls.to_vec());
                debug!(window_id = %id, tabs = tab_urls.len(), "host_window_created");
                Ok(WindowOpening::Opened(id))
            }
        }
    }

    fn focus_window(&self, window_id: WindowId) -> SpaceResult<()> {
        let mut inner = self.inner.lock();
        Self::check(&inner, "focus_window")?;
        Self::check_known(&inner, window_id)?;
        if let Some(remote) = inner.remote.as_mut() {
            Self::send(remote, HostCommand::FocusWindow { window_id })?;
        }
        inner.focused = Some(window_id);
        Ok(())
    }

    /// Drops the window from the table once the close is handed off, so
    /// late tab events for it are ignored.
    fn close_window(&self, window_id: WindowId) -> SpaceResult<()> {
        let mut inner = self.inner.lock();
        Self::check(&inner, "close_window")?;
        Self::check_known(&inner, window_id)?;
        if let Some(remote) = inner.remote.as_mut() {
            Self::send(remote, HostCommand::CloseWindow { window_id })?;
        }
        inner.windows.remove(&window_id);
        if inner.focused == Some(window_id) {
            inner.focused = None;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    fn observe(&self, event: &HostEvent) {
        self.apply_event(event);
    }
}
