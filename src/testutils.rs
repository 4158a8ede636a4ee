//! # Test utilities
//!
//! Ports to run the link and everything above it without hardware:
//!
//! - [`LoopbackPort`] just records what is written and returns what a
//!   test pushed for reading.
//! - [`SimPort`] talks to a simulated expander. It decodes host frames,
//!   answers I2C records with the real codec and serves master transfers
//!   from simulated memory chips.

use std::{
    collections::{BTreeMap, VecDeque},
    io::{ErrorKind, Read, Write},
    sync::{Arc, Mutex},
};

use crate::{
    i2c::{
        budget::BufferBudget,
        message::{
            ConfigStatus, I2cMessage, MasterRequestRecord, MasterStatus, MessageBody,
            MessageCodec, PostcardCodec, SlaveRequestRecord, SlaveStatus,
        },
        request::{I2cId, RequestId, SlaveNotification, Status},
    },
    link::{
        frame::{encode_frame, FrameDecoder},
        lock, ChannelId,
    },
};

#[derive(Debug, Default)]
struct LoopbackState {
    readable: VecDeque<u8>,
    written: Vec<u8>,
}

/// A port that hands out bytes pushed by the test and collects writes.
#[derive(Debug, Default, Clone)]
pub struct LoopbackPort {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackPort {
    /// Make `data` available for reading.
    pub fn push_readable(&self, data: &[u8]) {
        lock(&self.state).readable.extend(data);
    }

    /// Return and forget everything written so far.
    #[must_use]
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.state).written)
    }
}

fn read_from(queue: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
    let len = buf.len().min(queue.len());

    for (dst, src) in buf.iter_mut().zip(queue.drain(..len)) {
        *dst = src;
    }

    len
}

impl Read for LoopbackPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(read_from(&mut lock(&self.state).readable, buf))
    }
}

impl Write for LoopbackPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock(&self.state).written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A memory chip on the simulated bus.
#[derive(Debug)]
struct SimMemory {
    data: Vec<u8>,
    address_width: usize,
    extra_bits: u32,
    /// The chip's internal address counter.
    pointer: usize,
    nacks: usize,
    failure: Option<Status>,
    short_reads: bool,
}

impl SimMemory {
    /// Run one transfer against the chip. `extra` are the address bits
    /// taken from the slave address.
    fn transfer(&mut self, extra: usize, write: &[u8], read_size: usize) -> (Status, Vec<u8>) {
        if self.nacks > 0 {
            self.nacks -= 1;
            return (Status::SlaveNack, Vec::new());
        }

        if let Some(status) = self.failure.take() {
            return (status, Vec::new());
        }

        let size = self.data.len();

        if !write.is_empty() {
            if write.len() < self.address_width {
                return (Status::SlaveEarlyNack, Vec::new());
            }

            let (address_bytes, payload) = write.split_at(self.address_width);
            let low = address_bytes
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
            self.pointer = ((extra << (8 * self.address_width)) | low) % size;

            for &byte in payload {
                self.data[self.pointer] = byte;
                self.pointer = (self.pointer + 1) % size;
            }
        }

        let read_size = if self.short_reads && read_size > 0 {
            read_size - 1
        } else {
            read_size
        };

        let mut read = Vec::with_capacity(read_size);
        for _ in 0..read_size {
            read.push(self.data[self.pointer]);
            self.pointer = (self.pointer + 1) % size;
        }

        (Status::Success, read)
    }
}

/// A response the device holds back.
#[derive(Debug)]
struct Held {
    request_id: RequestId,
    bus: I2cId,
    body: MessageBody,
    /// Write and read size of a master transfer whose buffers the
    /// response keeps occupied, or `None` for slave requests.
    master_transfer: Option<(usize, usize)>,
}

#[derive(Debug)]
struct SimState {
    decoder: FrameDecoder,
    to_host: VecDeque<u8>,
    next_frame_id: u8,
    received: usize,
    last_sequence: BTreeMap<I2cId, u64>,
    capacity: BufferBudget,
    config_reply: Status,
    memories: BTreeMap<u16, SimMemory>,
    slave_memory: Vec<u8>,
    hold: bool,
    held: Vec<Held>,
    /// Number of further writes the port accepts, unlimited if `None`.
    writes_left: Option<usize>,
}

impl SimState {
    fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            to_host: VecDeque::new(),
            next_frame_id: 0,
            received: 0,
            last_sequence: BTreeMap::new(),
            capacity: BufferBudget::default(),
            config_reply: Status::Success,
            memories: BTreeMap::new(),
            slave_memory: vec![0; 1024],
            hold: false,
            held: Vec::new(),
            writes_left: None,
        }
    }

    fn emit(&mut self, bus: I2cId, body: MessageBody) {
        let message = I2cMessage {
            bus,
            sequence_number: self.last_sequence.get(&bus).copied().unwrap_or(0),
            body,
        };
        let payload = PostcardCodec.encode(&message).expect("encodable record");
        let frame = encode_frame(self.next_frame_id, ChannelId::I2c.into(), &payload)
            .expect("record fits into a frame");

        self.next_frame_id = (self.next_frame_id + 1) & 0x7f;
        self.to_host.extend(frame);
    }

    /// The free space of the device with all held responses occupying
    /// their buffers.
    fn current_budget(&self) -> BufferBudget {
        let mut budget = self.capacity;

        for held in &self.held {
            match held.master_transfer {
                Some((write, read)) => budget.reserve_master(write, read),
                None => budget.reserve_slave(),
            }
        }

        budget
    }

    fn with_budget(&self, body: MessageBody) -> MessageBody {
        let budget = self.current_budget();

        match body {
            MessageBody::MasterStatus(status) => MessageBody::MasterStatus(MasterStatus {
                queue_space: budget.queue_space,
                region1: budget.region1,
                region2: budget.region2,
                ..status
            }),
            MessageBody::SlaveStatus(status) => MessageBody::SlaveStatus(SlaveStatus {
                queue_space: budget.slave_queue_space,
                ..status
            }),
            other => other,
        }
    }

    fn respond(&mut self, held: Held) {
        if self.hold {
            self.held.push(held);
        } else {
            let body = self.with_budget(held.body);
            self.emit(held.bus, body);
        }
    }

    fn release(&mut self, index: usize) {
        let held = self.held.remove(index);
        let body = self.with_budget(held.body);
        self.emit(held.bus, body);
    }

    fn find_memory(&mut self, slave_address: u16) -> Option<(&mut SimMemory, usize)> {
        self.memories.iter_mut().find_map(|(&base, memory)| {
            let mask = (1u16 << memory.extra_bits) - 1;

            (slave_address & !(mask << 1) == base)
                .then(|| (memory, usize::from((slave_address >> 1) & mask)))
        })
    }

    fn on_master_request(&mut self, bus: I2cId, record: MasterRequestRecord) {
        let (status, read_data) = match self.find_memory(record.slave_address) {
            Some((memory, extra)) => memory.transfer(extra, &record.write_data, record.read_size),
            None => (Status::SlaveNack, Vec::new()),
        };

        self.respond(Held {
            request_id: record.request_id,
            bus,
            body: MessageBody::MasterStatus(MasterStatus {
                request_id: record.request_id,
                status,
                read_data,
                queue_space: 0,
                region1: 0,
                region2: 0,
            }),
            master_transfer: Some((record.write_data.len(), record.read_size)),
        });
    }

    fn on_slave_request(&mut self, bus: I2cId, record: SlaveRequestRecord) {
        let size = self.slave_memory.len();

        for (i, &byte) in record.write_data.iter().enumerate() {
            self.slave_memory[(record.write_address as usize + i) % size] = byte;
        }

        let read_data = (0..record.read_size)
            .map(|i| self.slave_memory[(record.read_address as usize + i) % size])
            .collect();

        self.respond(Held {
            request_id: record.request_id,
            bus,
            body: MessageBody::SlaveStatus(SlaveStatus {
                request_id: record.request_id,
                status: Status::Success,
                read_data,
                queue_space: 0,
            }),
            master_transfer: None,
        });
    }

    fn on_payload(&mut self, payload: &[u8]) {
        let message = PostcardCodec.decode(payload).expect("host sent a valid record");
        let bus = message.bus;

        self.received += 1;
        self.last_sequence.insert(bus, message.sequence_number);

        match message.body {
            MessageBody::ConfigRequest(request) => {
                let status = self.config_reply;
                self.emit(
                    bus,
                    MessageBody::ConfigStatus(ConfigStatus {
                        request_id: request.request_id,
                        status,
                    }),
                );
            }
            MessageBody::MasterRequest(record) => self.on_master_request(bus, record),
            MessageBody::SlaveRequest(record) => self.on_slave_request(bus, record),
            other => panic!("host sent a device record: {other:?}"),
        }
    }
}

/// The simulated expander behind a [`SimPort`].
///
/// The device answers every frame as soon as it is written, so the
/// responses are waiting by the time the host drains its link.
#[derive(Debug, Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

/// The host end of a simulated expander.
#[derive(Debug)]
pub struct SimPort {
    state: Arc<Mutex<SimState>>,
}

impl SimPort {
    /// Create a simulated device and the port connected to it.
    #[must_use]
    pub fn new() -> (SimDevice, Self) {
        let state = Arc::new(Mutex::new(SimState::new()));

        (
            SimDevice {
                state: state.clone(),
            },
            Self { state },
        )
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(read_from(&mut lock(&self.state).to_host, buf))
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = lock(&self.state);

        match &mut state.writes_left {
            Some(0) => return Err(std::io::Error::new(ErrorKind::BrokenPipe, "link down")),
            Some(left) => *left -= 1,
            None => {}
        }

        for frame in state.decoder.feed(buf) {
            if frame.frame_type == u8::from(ChannelId::I2c) {
                state.on_payload(&frame.payload);
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SimDevice {
    fn with<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        f(&mut lock(&self.state))
    }

    fn with_memory<T>(&self, base: u16, f: impl FnOnce(&mut SimMemory) -> T) -> T {
        self.with(|s| f(s.memories.get_mut(&base).expect("memory was added")))
    }

    /// Number of I2C records the host sent.
    #[must_use]
    pub fn received_messages(&self) -> usize {
        self.with(|s| s.received)
    }

    /// Answer configuration requests with `status`.
    pub fn reject_config(&self, status: Status) {
        self.with(|s| s.config_reply = status);
    }

    /// Set the free space of the idle device.
    pub fn set_budget(&self, budget: BufferBudget) {
        self.with(|s| s.capacity = budget);
    }

    /// Attach a memory chip of `size` bytes at slave address `base`.
    pub fn add_memory(&self, base: u16, size: usize, address_width: usize) {
        let field_bits = 8 * u32::try_from(address_width).expect("small address width");
        let extra_bits = (usize::BITS - (size - 1).leading_zeros()).saturating_sub(field_bits);

        self.with(|s| {
            s.memories.insert(
                base,
                SimMemory {
                    data: vec![0; size],
                    address_width,
                    extra_bits,
                    pointer: 0,
                    nacks: 0,
                    failure: None,
                    short_reads: false,
                },
            )
        });
    }

    /// Snapshot of a memory chip.
    #[must_use]
    pub fn memory_contents(&self, base: u16) -> Vec<u8> {
        self.with_memory(base, |m| m.data.clone())
    }

    /// Put `data` into a memory chip behind the host's back.
    pub fn fill_memory(&self, base: u16, address: usize, data: &[u8]) {
        self.with_memory(base, |m| {
            m.data[address..address + data.len()].copy_from_slice(data);
        });
    }

    /// Let the next `count` transfers to a memory chip fail with a NACK.
    pub fn nack_next(&self, base: u16, count: usize) {
        self.with_memory(base, |m| m.nacks = count);
    }

    /// Let the next transfer to a memory chip fail with `status`.
    pub fn fail_next(&self, base: u16, status: Status) {
        self.with_memory(base, |m| m.failure = Some(status));
    }

    /// Return one byte less than requested on reads.
    pub fn shorten_reads(&self, base: u16, enabled: bool) {
        self.with_memory(base, |m| m.short_reads = enabled);
    }

    /// Let the port accept `count` more writes and fail all after that.
    /// `None` lifts the limit.
    pub fn limit_writes(&self, count: Option<usize>) {
        self.with(|s| s.writes_left = count);
    }

    /// Hold back responses to requests arriving from now on.
    pub fn hold_responses(&self, hold: bool) {
        self.with(|s| s.hold = hold);
    }

    /// Send the held response for `request_id`.
    pub fn release_response(&self, request_id: RequestId) {
        self.with(|s| {
            let index = s
                .held
                .iter()
                .position(|h| h.request_id == request_id)
                .expect("response is held");
            s.release(index);
        });
    }

    /// Send all held responses in arrival order.
    pub fn release_all(&self) {
        self.with(|s| {
            while !s.held.is_empty() {
                s.release(0);
            }
        });
    }

    /// Report that a remote master wrote `data` into our slave memory.
    pub fn notify_access(&self, bus: I2cId, access_id: u32, data: &[u8]) {
        self.with(|s| {
            s.emit(
                bus,
                MessageBody::SlaveNotification(SlaveNotification {
                    access_id,
                    status: Status::Success,
                    write_address: 0,
                    write_data: data.to_vec(),
                    read_address: 0,
                    read_size: 0,
                }),
            );
        });
    }

    /// Send a master status nobody asked for.
    pub fn inject_master_status(&self, bus: I2cId, request_id: RequestId, status: Status) {
        self.with(|s| {
            let body = s.with_budget(MessageBody::MasterStatus(MasterStatus {
                request_id,
                status,
                read_data: Vec::new(),
                queue_space: 0,
                region1: 0,
                region2: 0,
            }));
            s.emit(bus, body);
        });
    }
}
