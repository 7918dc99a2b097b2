//! Observer registry for session events.
//!
//! Listeners run synchronously on the thread that raised the event (the
//! transfer thread for progress, the dispatching thread for device pushes),
//! so they must return quickly.

use crate::protocol::Unsolicited;
use log::trace;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Something that happened on a session.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The session connected to or disconnected from `port`.
    ConnectionChanged {
        /// Port name/path.
        port: String,
        /// New connection state.
        connected: bool,
    },
    /// Upload progress after an acknowledged chunk.
    UploadProgress {
        /// Target file name.
        name: String,
        /// Completion, 0-100.
        percent: f32,
    },
    /// An upload ended.
    UploadFinished {
        /// Target file name.
        name: String,
        /// Whether the device confirmed the complete file.
        success: bool,
    },
    /// Download progress after a received segment.
    DownloadProgress {
        /// Source file name.
        name: String,
        /// Completion, 0-100.
        percent: f32,
    },
    /// The device reports it is now showing this file.
    NowDisplaying(String),
    /// Firmware flashing progress reported by the device, 0-100.
    FirmwareUpdateProgress(f32),
    /// The device started (`true`) or finished writing to its storage.
    WritingInStorage(bool),
}

impl From<Unsolicited> for DeviceEvent {
    fn from(push: Unsolicited) -> Self {
        match push {
            Unsolicited::NowDisplaying(name) => Self::NowDisplaying(name),
            Unsolicited::FirmwareProgress(p) => Self::FirmwareUpdateProgress(p),
            Unsolicited::WritingInStorage(w) => Self::WritingInStorage(w),
        }
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscription list behind [`EventBus`] and discovery notifications.
pub(crate) struct Listeners<T: ?Sized + 'static> {
    inner: Mutex<(u64, Vec<(SubscriptionId, Arc<dyn Fn(&T) + Send + Sync>)>)>,
}

impl<T: ?Sized + 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new((0, Vec::new())),
        }
    }
}

impl<T: ?Sized + 'static> Listeners<T> {
    fn lock(&self) -> MutexGuard<'_, (u64, Vec<(SubscriptionId, Arc<dyn Fn(&T) + Send + Sync>)>)> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut guard = self.lock();
        guard.0 += 1;
        let id = SubscriptionId(guard.0);
        guard
            .1
            .push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.lock();
        let before = guard
            .1
            .len();
        guard
            .1
            .retain(|(sid, _)| *sid != id);
        guard
            .1
            .len()
            != before
    }

    pub(crate) fn len(&self) -> usize {
        self.lock()
            .1
            .len()
    }

    /// Call every listener with `value`.
    pub(crate) fn notify(&self, value: &T) {
        // Snapshot so listeners may subscribe/unsubscribe from inside a callback
        let listeners: Vec<Arc<dyn Fn(&T) + Send + Sync>> = self
            .lock()
            .1
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(value);
        }
    }
}

/// Fan-out of [`DeviceEvent`]s to registered listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: Listeners<DeviceEvent>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.listeners
            .subscribe(listener)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners
            .unsubscribe(id)
    }

    /// Deliver an event to every listener.
    pub fn emit(&self, event: &DeviceEvent) {
        trace!("event: {event:?}");
        self.listeners
            .notify(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
