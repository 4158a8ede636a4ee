//! Per-bus bookkeeping shared between the caller-facing
//! [`I2cInterface`](super::I2cInterface) and the inbound record handler.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt::{self, Debug},
    sync::Arc,
};

use tracing::{debug, trace};

use super::{
    budget::BufferBudget,
    message::{ConfigStatus, I2cMessage, MasterStatus, MessageBody, SlaveStatus},
    request::{
        BusConfig, Completion, I2cId, MasterRequest, RequestId, Sequence, SlaveNotification,
        SlaveRequest, Status,
    },
    I2cError, Transfer,
};

/// Work to do once the state lock is released.
pub type Deferred = Option<Box<dyn FnOnce() + Send>>;

/// Callback receiving slave-access notifications.
pub type NotificationCallback = Arc<dyn Fn(SlaveNotification) + Send + Sync>;

struct Entry<R> {
    request: R,
    completion: Completion<R>,
}

/// Submitted requests of one kind, keyed by request id.
///
/// An entry is either pending or complete. Complete entries only stay
/// here when they were submitted for polling.
pub struct PendingTable<R> {
    entries: BTreeMap<RequestId, Entry<R>>,
}

impl<R> Default for PendingTable<R> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<R: Transfer> Debug for PendingTable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(id, entry)| (id, (entry.request.status(), &entry.completion))),
            )
            .finish()
    }
}

impl<R: Transfer> PendingTable<R> {
    /// Track a request that was just sent.
    pub fn insert(&mut self, request_id: RequestId, request: R, completion: Completion<R>) {
        self.entries
            .insert(request_id, Entry { request, completion });
    }

    /// Forget a request, whatever its state.
    pub fn remove(&mut self, request_id: RequestId) -> Option<R> {
        self.entries.remove(&request_id).map(|entry| entry.request)
    }

    /// Return true, if the request is tracked, complete or not.
    #[must_use]
    pub fn contains(&self, request_id: RequestId) -> bool {
        self.entries.contains_key(&request_id)
    }

    /// Ids of requests without a final status, in ascending order.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.ids_where(|status| !status.is_terminal())
    }

    /// Ids of requests with a final status, in ascending order.
    #[must_use]
    pub fn complete_ids(&self) -> Vec<RequestId> {
        self.ids_where(Status::is_terminal)
    }

    fn ids_where(&self, predicate: impl Fn(Status) -> bool) -> Vec<RequestId> {
        self.entries
            .iter()
            .filter(|(_, entry)| predicate(entry.request.status()))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Remove and return the request, if it is complete.
    pub fn take_complete(&mut self, request_id: RequestId) -> Option<R> {
        let complete = self
            .entries
            .get(&request_id)
            .is_some_and(|entry| entry.request.status().is_terminal());

        complete.then(|| self.remove(request_id)).flatten()
    }

    /// Remove and return all complete requests.
    pub fn drain_complete(&mut self) -> BTreeMap<RequestId, R> {
        let ids = self.complete_ids();

        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|request| (id, request)))
            .collect()
    }

    /// Record the outcome of a pending request.
    ///
    /// Returns `None` if no request with this id is pending. For
    /// callback requests the entry is removed and the returned closure
    /// invokes the callback.
    pub fn complete(
        &mut self,
        request_id: RequestId,
        status: Status,
        read_data: Vec<u8>,
    ) -> Option<Deferred> {
        let entry = self
            .entries
            .get_mut(&request_id)
            .filter(|entry| !entry.request.status().is_terminal())?;

        entry.request.complete(status, read_data);

        if matches!(entry.completion, Completion::Polled) {
            return Some(None);
        }

        let Entry {
            request,
            completion,
        } = self.entries.remove(&request_id)?;

        match completion {
            Completion::Callback(callback) => {
                let deferred: Box<dyn FnOnce() + Send> = Box::new(move || callback(request));
                Some(Some(deferred))
            }
            Completion::Polled => Some(None),
        }
    }
}

/// The configuration transaction currently in effect.
#[derive(Debug, Clone, Copy)]
pub struct ConfigState {
    /// The configuration that was sent.
    pub config: BusConfig,
    /// The request that carried it.
    pub request_id: RequestId,
    /// `Pending` until the device answers.
    pub status: Status,
}

/// Everything an interface knows about its bus.
pub struct BusState {
    pub(super) bus: I2cId,
    pub(super) budget: BufferBudget,
    /// The sequence number of the last message we sent.
    pub(super) sequence_number: u64,
    last_request_id: u32,
    last_sequence_id: u32,
    pub(super) config: Option<ConfigState>,
    pub(super) master: PendingTable<MasterRequest>,
    pub(super) slave: PendingTable<SlaveRequest>,
    pub(super) notifications: VecDeque<SlaveNotification>,
    pub(super) notification_callback: Option<NotificationCallback>,
}

impl Debug for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusState")
            .field("bus", &self.bus)
            .field("budget", &self.budget)
            .field("sequence_number", &self.sequence_number)
            .field("config", &self.config)
            .field("master", &self.master)
            .field("slave", &self.slave)
            .field("notifications", &self.notifications.len())
            .field(
                "notification_callback",
                &self.notification_callback.is_some(),
            )
            .finish()
    }
}

/// What [`BusState::register`] changed, so that a failed send can be
/// undone.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    budget: BufferBudget,
    sequence_number: u64,
}

impl BusState {
    /// A fresh, unconfigured bus.
    pub fn new(bus: I2cId) -> Self {
        Self {
            bus,
            budget: BufferBudget::default(),
            sequence_number: 0,
            last_request_id: 0,
            last_sequence_id: 0,
            config: None,
            master: PendingTable::default(),
            slave: PendingTable::default(),
            notifications: VecDeque::new(),
            notification_callback: None,
        }
    }

    /// Request ids start at 1 and are never reused.
    pub fn next_request_id(&mut self) -> RequestId {
        self.last_request_id += 1;
        RequestId(self.last_request_id)
    }

    /// Chain ids, counted separately from request ids.
    pub fn next_sequence_id(&mut self) -> u32 {
        self.last_sequence_id += 1;
        self.last_sequence_id
    }

    /// Bump the outbound sequence counter and wrap `body` into a message.
    pub fn next_message(&mut self, body: MessageBody) -> I2cMessage {
        self.sequence_number += 1;

        I2cMessage {
            bus: self.bus,
            sequence_number: self.sequence_number,
            body,
        }
    }

    /// Fail unless the device accepted a configuration.
    pub fn ensure_configured(&self) -> Result<(), I2cError> {
        match self.config {
            Some(ConfigState {
                status: Status::Success,
                ..
            }) => Ok(()),
            _ => Err(I2cError::NotConfigured { bus: self.bus }),
        }
    }

    /// Remember the budget and sequence counter.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            budget: self.budget,
            sequence_number: self.sequence_number,
        }
    }

    /// Roll back to an earlier [`checkpoint`](Self::checkpoint).
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.budget = checkpoint.budget;
        self.sequence_number = checkpoint.sequence_number;
    }

    /// Assign id and sequence to an admitted request, account for it and
    /// put it into its pending table.
    ///
    /// Returns the id and the message announcing the request.
    pub fn register<R: Transfer>(
        &mut self,
        mut request: R,
        sequence: Sequence,
        completion: Completion<R>,
    ) -> (RequestId, I2cMessage) {
        let request_id = self.next_request_id();

        request.submitted(request_id, sequence);
        request.reserve(&mut self.budget);

        let message = self.next_message(request.record(request_id, sequence));
        R::table_mut(self).insert(request_id, request, completion);

        (request_id, message)
    }

    /// Process one inbound record for this bus.
    pub fn handle(&mut self, message: I2cMessage) -> Result<Deferred, I2cError> {
        let bus = self.bus;

        if self.config.is_none() {
            return Err(I2cError::Unconfigured { bus });
        }

        trace!(
            "{bus:?} rx seq {}: {:?}",
            message.sequence_number,
            message.body
        );

        match message.body {
            MessageBody::ConfigStatus(status) => self.on_config_status(&status).map(|()| None),
            MessageBody::MasterStatus(status) => {
                self.on_master_status(message.sequence_number, status)
            }
            MessageBody::SlaveStatus(status) => {
                self.on_slave_status(message.sequence_number, status)
            }
            MessageBody::SlaveNotification(notification) => self.on_notification(notification),
            MessageBody::ConfigRequest(_)
            | MessageBody::MasterRequest(_)
            | MessageBody::SlaveRequest(_) => Err(I2cError::UnexpectedRecord { bus }),
        }
    }

    fn check_device_status(&self, request_id: RequestId, status: Status) -> Result<(), I2cError> {
        if status.is_terminal() {
            Ok(())
        } else {
            Err(I2cError::UnexpectedStatus {
                bus: self.bus,
                request_id,
                status,
            })
        }
    }

    fn is_current(&self, sequence_number: u64) -> bool {
        let current = sequence_number >= self.sequence_number;

        if !current {
            trace!(
                "{:?}: ignoring budget of stale status (seq {sequence_number} < {})",
                self.bus,
                self.sequence_number
            );
        }

        current
    }

    fn on_config_status(&mut self, status: &ConfigStatus) -> Result<(), I2cError> {
        self.check_device_status(status.request_id, status.status)?;

        let bus = self.bus;
        let config = self
            .config
            .as_mut()
            .filter(|c| c.request_id == status.request_id && !c.status.is_terminal())
            .ok_or(I2cError::UnknownRequest {
                bus,
                request_id: status.request_id,
            })?;

        config.status = status.status;
        debug!("{bus:?} config {} -> {:?}", status.request_id, status.status);

        Ok(())
    }

    fn on_master_status(
        &mut self,
        sequence_number: u64,
        status: MasterStatus,
    ) -> Result<Deferred, I2cError> {
        self.check_device_status(status.request_id, status.status)?;

        if self.is_current(sequence_number) {
            self.budget
                .resync_master(status.queue_space, status.region1, status.region2);
        }

        debug!(
            "{:?} master {} -> {:?}",
            self.bus, status.request_id, status.status
        );

        self.master
            .complete(status.request_id, status.status, status.read_data)
            .ok_or(I2cError::UnknownRequest {
                bus: self.bus,
                request_id: status.request_id,
            })
    }

    fn on_slave_status(
        &mut self,
        sequence_number: u64,
        status: SlaveStatus,
    ) -> Result<Deferred, I2cError> {
        self.check_device_status(status.request_id, status.status)?;

        if self.is_current(sequence_number) {
            self.budget.resync_slave(status.queue_space);
        }

        debug!(
            "{:?} slave {} -> {:?}",
            self.bus, status.request_id, status.status
        );

        self.slave
            .complete(status.request_id, status.status, status.read_data)
            .ok_or(I2cError::UnknownRequest {
                bus: self.bus,
                request_id: status.request_id,
            })
    }

    fn on_notification(&mut self, notification: SlaveNotification) -> Result<Deferred, I2cError> {
        let access_id = notification.access_id;

        if self
            .notifications
            .iter()
            .any(|n| n.access_id == access_id)
        {
            return Err(I2cError::DuplicateAccess {
                bus: self.bus,
                access_id,
            });
        }

        debug!("{:?} slave access {access_id}", self.bus);

        if let Some(callback) = self.notification_callback.clone() {
            let deferred: Box<dyn FnOnce() + Send> = Box::new(move || callback(notification));
            return Ok(Some(deferred));
        }

        self.notifications.push_back(notification);
        Ok(None)
    }

    /// Remove the oldest `count` notifications, or all of them.
    pub fn drain_notifications(&mut self, count: Option<usize>) -> Vec<SlaveNotification> {
        let count = count.map_or(self.notifications.len(), |c| c.min(self.notifications.len()));

        self.notifications.drain(..count).collect()
    }
}
