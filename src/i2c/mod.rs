//! # I2C bus interface
//!
//! One [`I2cInterface`] drives one physical bus of the expander. It
//! hands out request ids, numbers outbound messages, predicts the
//! device's free buffer space and matches status records that come back
//! out of order to the requests they complete.
//!
//! Nothing happens in the background. Inbound records are only
//! processed while somebody drains the link, either explicitly through
//! [`I2cInterface::drain`] or implicitly in one of the blocking waits.
//!
//! ```text
//!  submit ──► BusState ──► MessageCodec ──► Link ──► device
//!                ▲                                     │
//!                └──── handler ◄── MessageCodec ◄── Link::drain
//! ```

pub mod budget;
pub mod message;
pub mod request;
mod state;

use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::link::{lock, ChannelId, Delivery, Link, LinkError};

use budget::BufferBudget;
use message::{
    CodecError, ConfigRequest, I2cMessage, MasterRequestRecord, MessageBody, MessageCodec,
    PostcardCodec, SlaveRequestRecord,
};
use request::{
    BusConfig, Completion, I2cId, MasterRequest, RequestId, Sequence, SlaveNotification,
    SlaveRequest, Status,
};
use state::{BusState, ConfigState, PendingTable};

/// How long [`I2cInterface::apply_config`] waits for the device.
pub const CONFIG_TIMEOUT: Duration = Duration::from_millis(1000);

/// Errors of the I2C interface.
#[derive(thiserror::Error, Debug)]
pub enum I2cError {
    /// The device has no room for the request right now. Nothing was
    /// sent.
    #[error("{bus:?} cannot accept the request with the current buffer budget")]
    AdmissionRejected {
        /// The rejecting bus.
        bus: I2cId,
    },

    /// Requests need a successfully applied configuration.
    #[error("{bus:?} is not configured")]
    NotConfigured {
        /// The affected bus.
        bus: I2cId,
    },

    /// The configuration contains widths the device does not support.
    #[error("Invalid configuration for {bus:?}: {config:?}")]
    InvalidConfig {
        /// The affected bus.
        bus: I2cId,
        /// The rejected configuration.
        config: BusConfig,
    },

    /// The device refused the configuration.
    #[error("{bus:?} rejected its configuration with {status:?}")]
    ConfigRejected {
        /// The affected bus.
        bus: I2cId,
        /// What the device answered.
        status: Status,
    },

    /// A status record named a request that is not pending.
    #[error("{bus:?} received a status for unknown request {request_id}")]
    UnknownRequest {
        /// The affected bus.
        bus: I2cId,
        /// The id in the status record.
        request_id: RequestId,
    },

    /// The device reported a slave access that is still buffered.
    #[error("{bus:?} received slave access {access_id} twice")]
    DuplicateAccess {
        /// The affected bus.
        bus: I2cId,
        /// The repeated access id.
        access_id: u32,
    },

    /// A status record carried a status only the host may use.
    #[error("{bus:?} received status {status:?} for request {request_id}")]
    UnexpectedStatus {
        /// The affected bus.
        bus: I2cId,
        /// The id in the status record.
        request_id: RequestId,
        /// The offending status.
        status: Status,
    },

    /// The device sent a record only the host may send.
    #[error("{bus:?} received a host record from the device")]
    UnexpectedRecord {
        /// The affected bus.
        bus: I2cId,
    },

    /// The device sent a record before the bus was ever configured.
    #[error("{bus:?} received a record before it was configured")]
    Unconfigured {
        /// The affected bus.
        bus: I2cId,
    },

    /// A blocking wait ran out of time. The request stays in its table.
    #[error("Timed out waiting for request {request_id} on {bus:?}")]
    Timeout {
        /// The affected bus.
        bus: I2cId,
        /// The awaited request.
        request_id: RequestId,
    },

    /// The link failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A record could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl I2cError {
    /// Return true, if the error means host and device disagree about
    /// the state of the bus.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownRequest { .. }
                | Self::DuplicateAccess { .. }
                | Self::UnexpectedStatus { .. }
                | Self::UnexpectedRecord { .. }
                | Self::Unconfigured { .. }
        )
    }
}

/// Turn link errors caused by our own handler back into the error the
/// handler raised.
fn from_link_error(err: LinkError) -> I2cError {
    match err {
        LinkError::Handler { channel, source } => match source.downcast::<I2cError>() {
            Ok(err) => *err,
            Err(source) => I2cError::Link(LinkError::Handler { channel, source }),
        },
        other => I2cError::Link(other),
    }
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::MasterRequest {}
    impl Sealed for super::SlaveRequest {}
}

/// The request kinds an [`I2cInterface`] can submit: [`MasterRequest`]
/// and [`SlaveRequest`].
///
/// Both kinds have their own pending table and queue budget. Generic
/// methods of the interface pick the table by type, for example
/// `bus.pending_ids::<MasterRequest>()`.
pub trait Transfer: sealed::Sealed + Debug + Send + Sized + 'static {
    /// The id assigned at submission.
    fn request_id(&self) -> Option<RequestId>;

    /// Current status.
    fn status(&self) -> Status;

    #[doc(hidden)]
    fn fits(&self, budget: &BufferBudget) -> bool;

    #[doc(hidden)]
    fn reserve(&self, budget: &mut BufferBudget);

    #[doc(hidden)]
    fn record(&self, request_id: RequestId, sequence: Sequence) -> MessageBody;

    #[doc(hidden)]
    fn submitted(&mut self, request_id: RequestId, sequence: Sequence);

    #[doc(hidden)]
    fn complete(&mut self, status: Status, read_data: Vec<u8>);

    #[doc(hidden)]
    fn table(state: &BusState) -> &PendingTable<Self>;

    #[doc(hidden)]
    fn table_mut(state: &mut BusState) -> &mut PendingTable<Self>;
}

impl Transfer for MasterRequest {
    fn request_id(&self) -> Option<RequestId> {
        Self::request_id(self)
    }

    fn status(&self) -> Status {
        Self::status(self)
    }

    fn fits(&self, budget: &BufferBudget) -> bool {
        budget.fits_master(self.write_data().len(), self.read_size())
    }

    fn reserve(&self, budget: &mut BufferBudget) {
        budget.reserve_master(self.write_data().len(), self.read_size());
    }

    fn record(&self, request_id: RequestId, sequence: Sequence) -> MessageBody {
        MessageBody::MasterRequest(MasterRequestRecord {
            request_id,
            sequence,
            slave_address: self.slave_address(),
            write_data: self.write_data().to_vec(),
            read_size: self.read_size(),
        })
    }

    fn submitted(&mut self, request_id: RequestId, sequence: Sequence) {
        self.mark_submitted(request_id, sequence);
    }

    fn complete(&mut self, status: Status, read_data: Vec<u8>) {
        self.mark_complete(status, read_data);
    }

    fn table(state: &BusState) -> &PendingTable<Self> {
        &state.master
    }

    fn table_mut(state: &mut BusState) -> &mut PendingTable<Self> {
        &mut state.master
    }
}

impl Transfer for SlaveRequest {
    fn request_id(&self) -> Option<RequestId> {
        Self::request_id(self)
    }

    fn status(&self) -> Status {
        Self::status(self)
    }

    fn fits(&self, budget: &BufferBudget) -> bool {
        budget.fits_slave()
    }

    fn reserve(&self, budget: &mut BufferBudget) {
        budget.reserve_slave();
    }

    fn record(&self, request_id: RequestId, sequence: Sequence) -> MessageBody {
        MessageBody::SlaveRequest(SlaveRequestRecord {
            request_id,
            sequence,
            write_address: self.write_address(),
            write_data: self.write_data().to_vec(),
            read_address: self.read_address(),
            read_size: self.read_size(),
        })
    }

    fn submitted(&mut self, request_id: RequestId, sequence: Sequence) {
        self.mark_submitted(request_id, sequence);
    }

    fn complete(&mut self, status: Status, read_data: Vec<u8>) {
        self.mark_complete(status, read_data);
    }

    fn table(state: &BusState) -> &PendingTable<Self> {
        &state.slave
    }

    fn table_mut(state: &mut BusState) -> &mut PendingTable<Self> {
        &mut state.slave
    }
}

/// Handle to one I2C bus of the expander.
///
/// Clones share the same state. The inbound handler registered with the
/// link only keeps a weak reference, so the bus state goes away with the
/// last handle.
#[derive(Clone)]
pub struct I2cInterface {
    link: Link,
    bus: I2cId,
    codec: Arc<dyn MessageCodec>,
    state: Arc<Mutex<BusState>>,
}

impl Debug for I2cInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I2cInterface")
            .field("bus", &self.bus)
            .field("codec", &self.codec)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl I2cInterface {
    /// Create an unconfigured interface for `bus` on `link`.
    #[must_use]
    pub fn new(link: &Link, bus: I2cId) -> Self {
        Self::with_codec(link, bus, Arc::new(PostcardCodec))
    }

    /// Create an unconfigured interface with a custom record encoding.
    #[must_use]
    pub fn with_codec(link: &Link, bus: I2cId, codec: Arc<dyn MessageCodec>) -> Self {
        let state = Arc::new(Mutex::new(BusState::new(bus)));

        let weak = Arc::downgrade(&state);
        let handler_codec = codec.clone();
        link.register(ChannelId::I2c, move |payload| {
            let Some(state) = weak.upgrade() else {
                return Ok(Delivery::Detached);
            };

            let message = handler_codec.decode(payload).map_err(I2cError::from)?;
            if message.bus != bus {
                return Ok(Delivery::Declined);
            }

            // Bind the result first so the state lock is released before
            // any callback runs.
            let deferred = lock(&state).handle(message)?;
            if let Some(callback) = deferred {
                callback();
            }

            Ok(Delivery::Accepted)
        });

        Self {
            link: link.clone(),
            bus,
            codec,
            state,
        }
    }

    /// Create an interface and apply `config`.
    pub fn open(link: &Link, bus: I2cId, config: BusConfig) -> Result<Self, I2cError> {
        let interface = Self::new(link, bus);

        match interface.apply_config(config)? {
            Status::Success => Ok(interface),
            status => Err(I2cError::ConfigRejected { bus, status }),
        }
    }

    /// The bus this interface drives.
    #[must_use]
    pub const fn bus(&self) -> I2cId {
        self.bus
    }

    /// The configuration last applied, whatever its outcome.
    #[must_use]
    pub fn config(&self) -> Option<BusConfig> {
        lock(&self.state).config.map(|c| c.config)
    }

    /// The current prediction of the device's free space.
    #[must_use]
    pub fn budget(&self) -> BufferBudget {
        lock(&self.state).budget
    }

    /// Send a configuration and wait for the device to answer.
    ///
    /// The buffer budget is reset to the device defaults.
    pub fn apply_config(&self, config: BusConfig) -> Result<Status, I2cError> {
        let bus = self.bus;

        if !config.is_valid() {
            return Err(I2cError::InvalidConfig { bus, config });
        }

        let request_id = {
            let mut state = lock(&self.state);

            let previous = (state.config, state.budget);
            let request_id = state.next_request_id();
            let message = state.next_message(MessageBody::ConfigRequest(ConfigRequest {
                request_id,
                config,
            }));

            state.budget = BufferBudget::default();
            state.config = Some(ConfigState {
                config,
                request_id,
                status: Status::Pending,
            });

            if let Err(e) = self.transmit(&message) {
                (state.config, state.budget) = previous;
                state.sequence_number -= 1;
                return Err(e);
            }

            request_id
        };

        info!(
            "{bus:?}: applying {config:?} ({} Hz) as request {request_id}",
            config.clock_freq.hz()
        );

        let deadline = Instant::now() + CONFIG_TIMEOUT;
        loop {
            self.drain()?;

            let status = lock(&self.state)
                .config
                .filter(|c| c.request_id == request_id)
                .map_or(Status::Pending, |c| c.status);

            if status.is_terminal() {
                info!("{bus:?}: configuration {request_id} -> {status:?}");
                return Ok(status);
            }

            if Instant::now() >= deadline {
                return Err(I2cError::Timeout { bus, request_id });
            }

            std::thread::yield_now();
        }
    }

    /// Return true, if the device has room for `request` according to
    /// the current prediction.
    #[must_use]
    pub fn can_accept<R: Transfer>(&self, request: &R) -> bool {
        request.fits(&lock(&self.state).budget)
    }

    /// Submit a request for polling.
    ///
    /// The result is collected with [`wait_for_response`](Self::wait_for_response)
    /// or [`drain_complete`](Self::drain_complete).
    pub fn submit<R: Transfer>(&self, request: R) -> Result<RequestId, I2cError> {
        self.submit_with(request, Completion::Polled)
    }

    /// Submit a request whose completed form is handed to `callback`.
    ///
    /// The callback runs inside a drain of the link, after the interface
    /// released its internal state. It may submit further requests.
    pub fn submit_with_callback<R, F>(&self, request: R, callback: F) -> Result<RequestId, I2cError>
    where
        R: Transfer,
        F: FnOnce(R) + Send + 'static,
    {
        self.submit_with(request, Completion::Callback(Box::new(callback)))
    }

    fn submit_with<R: Transfer>(
        &self,
        request: R,
        completion: Completion<R>,
    ) -> Result<RequestId, I2cError> {
        let mut state = lock(&self.state);

        state.ensure_configured()?;
        if !request.fits(&state.budget) {
            return Err(I2cError::AdmissionRejected { bus: self.bus });
        }

        let sequence = Sequence {
            id: state.next_sequence_id(),
            idx: 0,
        };

        self.register_and_send(&mut state, request, sequence, completion)
    }

    /// Submit requests as one chain the device schedules as a unit.
    ///
    /// All requests share a sequence id. Their indices count down to 0
    /// at the last request. If the chain does not fit as a whole, nothing
    /// is sent.
    ///
    /// If sending fails partway, the requests already sent are dropped
    /// from the pending table and the budget is restored to what it was
    /// before the chain. The device never sees the end of such a chain.
    pub fn submit_sequence<R: Transfer>(
        &self,
        requests: Vec<R>,
    ) -> Result<Vec<RequestId>, I2cError> {
        let mut state = lock(&self.state);

        state.ensure_configured()?;

        let mut budget = state.budget;
        for request in &requests {
            if !request.fits(&budget) {
                return Err(I2cError::AdmissionRejected { bus: self.bus });
            }
            request.reserve(&mut budget);
        }

        let checkpoint = state.checkpoint();
        let sequence_id = state.next_sequence_id();
        let count = requests.len();
        let mut ids = Vec::with_capacity(count);

        for (position, request) in requests.into_iter().enumerate() {
            let idx = u32::try_from(count - 1 - position).unwrap_or(u32::MAX);
            let sequence = Sequence {
                id: sequence_id,
                idx,
            };

            match self.register_and_send(&mut state, request, sequence, Completion::Polled) {
                Ok(request_id) => ids.push(request_id),
                Err(e) => {
                    warn!(
                        "{:?}: chain {sequence_id} broken after {} of {count} requests",
                        self.bus,
                        ids.len()
                    );

                    let table = R::table_mut(&mut state);
                    for request_id in ids {
                        table.remove(request_id);
                    }
                    state.restore(checkpoint);

                    return Err(e);
                }
            }
        }

        Ok(ids)
    }

    fn register_and_send<R: Transfer>(
        &self,
        state: &mut BusState,
        request: R,
        sequence: Sequence,
        completion: Completion<R>,
    ) -> Result<RequestId, I2cError> {
        let checkpoint = state.checkpoint();
        let (request_id, message) = state.register(request, sequence, completion);

        if let Err(e) = self.transmit(&message) {
            R::table_mut(state).remove(request_id);
            state.restore(checkpoint);
            return Err(e);
        }

        debug!(
            "{:?}: submitted {request_id} (seq {}, chain {}/{})",
            self.bus, message.sequence_number, sequence.id, sequence.idx
        );

        Ok(request_id)
    }

    fn transmit(&self, message: &I2cMessage) -> Result<(), I2cError> {
        let payload = self.codec.encode(message)?;
        self.link.send(ChannelId::I2c, &payload)?;

        Ok(())
    }

    /// Process everything the device sent so far.
    ///
    /// Protocol violations detected while processing are returned here.
    pub fn drain(&self) -> Result<usize, I2cError> {
        self.link.drain().map_err(from_link_error)
    }

    /// Ids of submitted requests still waiting for their status.
    #[must_use]
    pub fn pending_ids<R: Transfer>(&self) -> Vec<RequestId> {
        R::table(&lock(&self.state)).pending_ids()
    }

    /// Ids of completed requests waiting to be collected.
    #[must_use]
    pub fn complete_ids<R: Transfer>(&self) -> Vec<RequestId> {
        R::table(&lock(&self.state)).complete_ids()
    }

    /// Remove and return all completed requests.
    #[must_use]
    pub fn drain_complete<R: Transfer>(&self) -> BTreeMap<RequestId, R> {
        R::table_mut(&mut lock(&self.state)).drain_complete()
    }

    /// Drain the link until request `request_id` completes, then remove
    /// and return it.
    ///
    /// On timeout the request stays pending, so a later drain can still
    /// observe its result.
    pub fn wait_for_response<R: Transfer>(
        &self,
        request_id: RequestId,
        timeout: Duration,
    ) -> Result<R, I2cError> {
        let bus = self.bus;
        let deadline = Instant::now() + timeout;

        loop {
            self.drain()?;

            {
                let mut state = lock(&self.state);
                let table = R::table_mut(&mut state);

                if let Some(request) = table.take_complete(request_id) {
                    return Ok(request);
                }

                if !table.contains(request_id) {
                    return Err(I2cError::UnknownRequest { bus, request_id });
                }
            }

            if Instant::now() >= deadline {
                return Err(I2cError::Timeout { bus, request_id });
            }

            std::thread::yield_now();
        }
    }

    /// A snapshot of the buffered slave-access notifications, oldest
    /// first.
    #[must_use]
    pub fn notifications(&self) -> Vec<SlaveNotification> {
        lock(&self.state).notifications.iter().cloned().collect()
    }

    /// Remove and return the oldest `count` notifications, or all of
    /// them for `None`.
    #[must_use]
    pub fn drain_notifications(&self, count: Option<usize>) -> Vec<SlaveNotification> {
        lock(&self.state).drain_notifications(count)
    }

    /// Hand future notifications to `callback` instead of buffering them.
    pub fn set_notification_callback<F>(&self, callback: F)
    where
        F: Fn(SlaveNotification) + Send + Sync + 'static,
    {
        lock(&self.state).notification_callback = Some(Arc::new(callback));
    }

    /// Buffer notifications again.
    pub fn clear_notification_callback(&self) {
        lock(&self.state).notification_callback = None;
    }
}
