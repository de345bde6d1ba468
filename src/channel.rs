//! In-process multi-subscriber broadcast channels.
//!
//! Every subscriber owns a cursor into a shared append log. Items stay in
//! the log until every registered cursor has moved past them, so a slow
//! subscriber only delays itself and never loses an item it has not read.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::model::{DeviceStatus, JobFailureFinding, Notification, TopologyChanged};

pub type SubscriberId = Uuid;

struct ChannelState<T> {
    /// Sequence number of `log[0]`.
    head: u64,
    log: VecDeque<T>,
    /// Next sequence number each subscriber will read.
    cursors: HashMap<SubscriberId, u64>,
    closed: bool,
}

impl<T> ChannelState<T> {
    fn tail(&self) -> u64 {
        self.head + self.log.len() as u64
    }

    /// Drop every item all cursors have already passed.
    fn trim(&mut self) {
        let min = self.cursors.values().copied().min().unwrap_or_else(|| self.tail());
        while self.head < min && self.log.pop_front().is_some() {
            self.head += 1;
        }
    }
}

struct Shared<T> {
    name: &'static str,
    state: Mutex<ChannelState<T>>,
    notify: Notify,
}

/// Multi-subscriber publish primitive with per-subscriber cursors.
///
/// Cloning the channel yields another handle to the same log.
pub struct BroadcastChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BroadcastChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for BroadcastChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send> BroadcastChannel<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(ChannelState {
                    head: 0,
                    log: VecDeque::new(),
                    cursors: HashMap::new(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState<T>> {
        // A poisoned lock only means a reader panicked mid-read; the log itself is intact.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `item` available to every registered subscriber.
    ///
    /// Never blocks and never fails. With no subscribers, or after the
    /// channel is closed, the item is discarded.
    pub fn publish(&self, item: T) {
        {
            let mut state = self.lock();
            if state.closed || state.cursors.is_empty() {
                return;
            }
            state.log.push_back(item);
        }
        self.shared.notify.notify_waiters();
    }

    /// Register a read position at the current tail.
    ///
    /// Subscribing an id that is already registered keeps its position.
    pub fn subscribe(&self, subscriber_id: SubscriberId) {
        let mut state = self.lock();
        let tail = state.tail();
        state.cursors.entry(subscriber_id).or_insert_with(|| {
            debug!("{}: subscriber {} registered", self.shared.name, subscriber_id);
            tail
        });
    }

    /// Release a subscriber's position and free items nobody needs anymore.
    pub fn unsubscribe(&self, subscriber_id: SubscriberId) {
        let mut state = self.lock();
        if state.cursors.remove(&subscriber_id).is_some() {
            debug!("{}: subscriber {} removed", self.shared.name, subscriber_id);
            state.trim();
        }
    }

    /// Wait for the next unread item for `subscriber_id`.
    ///
    /// An unknown subscriber is registered first, so it receives items
    /// published from this point on.
    ///
    /// # Errors
    ///
    /// * [`ChannelError::Cancelled`] if `cancel` fires first.
    /// * [`ChannelError::Closed`] once the channel has been closed.
    pub async fn read(
        &self,
        subscriber_id: SubscriberId,
        cancel: &CancellationToken,
    ) -> Result<T, ChannelError> {
        self.subscribe(subscriber_id);

        loop {
            // Register interest before inspecting the log so a publish between
            // the check and the await still wakes us.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_take(subscriber_id)? {
                return Ok(item);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ChannelError::Cancelled),
                () = &mut notified => {}
            }
        }
    }

    /// Take the next item without waiting.
    pub fn try_read(&self, subscriber_id: SubscriberId) -> Result<Option<T>, ChannelError> {
        self.subscribe(subscriber_id);
        self.try_take(subscriber_id)
    }

    fn try_take(&self, subscriber_id: SubscriberId) -> Result<Option<T>, ChannelError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }

        let head = state.head;
        let tail = state.tail();
        let Some(cursor) = state.cursors.get_mut(&subscriber_id) else {
            // Unsubscribed concurrently; behave as if nothing is pending.
            return Ok(None);
        };
        if *cursor >= tail {
            return Ok(None);
        }

        let index = (*cursor - head) as usize;
        *cursor += 1;
        let item = state.log.get(index).cloned();
        state.trim();
        Ok(item)
    }

    /// Shut the channel down. Pending and future reads return [`ChannelError::Closed`].
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.log.clear();
        }
        debug!("{}: closed", self.shared.name);
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().cursors.len()
    }

    /// Number of items still retained for at least one subscriber.
    pub fn retained(&self) -> usize {
        self.lock().log.len()
    }
}

pub type StatusChannel = BroadcastChannel<DeviceStatus>;
pub type NotificationChannel = BroadcastChannel<Notification>;
pub type JobFailureChannel = BroadcastChannel<JobFailureFinding>;
pub type TopologyChannel = BroadcastChannel<TopologyChanged>;

/// The four process-wide channels.
#[derive(Clone)]
pub struct Channels {
    pub status: StatusChannel,
    pub notifications: NotificationChannel,
    pub job_failures: JobFailureChannel,
    pub topology: TopologyChannel,
}

impl Channels {
    pub fn new() -> Self {
        Self {
            status: BroadcastChannel::new("device-status"),
            notifications: BroadcastChannel::new("notifications"),
            job_failures: BroadcastChannel::new("job-failures"),
            topology: BroadcastChannel::new("topology-changed"),
        }
    }

    pub fn close_all(&self) {
        self.status.close();
        self.notifications.close();
        self.job_failures.close();
        self.topology.close();
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}
