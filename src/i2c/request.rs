//! # I2C request records
//!
//! Value types for everything that travels through an
//! [`I2cInterface`](super::I2cInterface): the bus configuration, master
//! and slave requests and the notifications the device emits when a
//! remote master touches our slave memory.
//!
//! Requests are built by the caller and are read-only from then on. The
//! fields that only exist once a request is on its way (request id,
//! sequence, status, read data) are filled in by the interface.

use std::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};

/// The two physical I2C buses of the expander.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum I2cId {
    I2c0,
    I2c1,
}

/// State of a request.
///
/// `NotSent` and `Pending` only exist on the host. All other values are
/// terminal and come from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The request was not submitted yet.
    NotSent,
    /// The request was sent and waits for its status.
    Pending,
    /// The transfer completed.
    Success,
    /// The device could not parse the request.
    BadRequest,
    /// The device had no buffer space for the request.
    NoSpace,
    /// The slave did not acknowledge its address.
    SlaveNack,
    /// The slave stopped acknowledging in the middle of the transfer.
    SlaveEarlyNack,
    /// The bus peripheral of the device failed.
    InterfaceError,
}

impl Status {
    /// Return true, if the status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::NotSent | Self::Pending)
    }

    /// Return true, if the request completed successfully.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Host-assigned correlation key for one request.
///
/// Ids start at 1 and are never reused by an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u32);

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position of a request in a chain the device must schedule as one
/// unit. Stand-alone requests get a chain of their own with `idx` 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sequence {
    /// Shared by all requests of one chain.
    pub id: u32,
    /// Counts down to 0 at the last request of the chain.
    pub idx: u32,
}

/// SCL clock rate classes supported by the expander.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ClockFreq {
    Freq10K,
    Freq40K,
    Freq100K,
    #[default]
    Freq400K,
    Freq1M,
}

impl ClockFreq {
    /// The clock rate in Hz.
    #[must_use]
    pub const fn hz(self) -> u32 {
        match self {
            Self::Freq10K => 10_000,
            Self::Freq40K => 40_000,
            Self::Freq100K => 100_000,
            Self::Freq400K => 400_000,
            Self::Freq1M => 1_000_000,
        }
    }
}

/// Width of an address field in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum AddressWidth {
    Bits7,
    Bits8,
    Bits10,
    Bits16,
}

impl AddressWidth {
    /// The number of address bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits7 => 7,
            Self::Bits8 => 8,
            Self::Bits10 => 10,
            Self::Bits16 => 16,
        }
    }
}

/// Configuration of one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// SCL clock rate.
    pub clock_freq: ClockFreq,
    /// Our own address when a remote master accesses us.
    pub slave_address: u16,
    /// Width of `slave_address`: 7 or 10 bit.
    pub slave_address_width: AddressWidth,
    /// Width of the address field of our slave memory: 8 or 16 bit.
    pub memory_address_width: AddressWidth,
    /// Enable the internal pull-up resistors on SDA/SCL.
    pub pullups_enabled: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            clock_freq: ClockFreq::default(),
            slave_address: 0x01,
            slave_address_width: AddressWidth::Bits7,
            memory_address_width: AddressWidth::Bits16,
            pullups_enabled: false,
        }
    }
}

impl BusConfig {
    /// Return true, if the device accepts this combination of widths and
    /// the slave address fits into its width.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let widths_ok = matches!(
            self.slave_address_width,
            AddressWidth::Bits7 | AddressWidth::Bits10
        ) && matches!(
            self.memory_address_width,
            AddressWidth::Bits8 | AddressWidth::Bits16
        );

        widths_ok && u32::from(self.slave_address) >> self.slave_address_width.bits() == 0
    }
}

/// How a submitter learns about completion.
pub enum Completion<R> {
    /// The request stays in the pending table until it is collected.
    Polled,
    /// The callback is invoked with the completed request, which is then
    /// removed from the pending table.
    Callback(Box<dyn FnOnce(R) + Send>),
}

impl<R> Debug for Completion<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polled => write!(f, "Polled"),
            Self::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

/// Fields the interface assigns on submission and completion.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Tracking {
    request_id: Option<RequestId>,
    sequence: Option<Sequence>,
    status: Status,
    read_data: Vec<u8>,
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            request_id: None,
            sequence: None,
            status: Status::NotSent,
            read_data: Vec::new(),
        }
    }
}

/// A transfer where we are bus master.
///
/// The write phase is sent first, followed by a repeated start and the
/// read phase. Either phase may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRequest {
    slave_address: u16,
    write_data: Vec<u8>,
    read_size: usize,
    tracking: Tracking,
}

impl MasterRequest {
    /// Create a combined write/read transfer.
    #[must_use]
    pub fn new(slave_address: u16, write_data: impl Into<Vec<u8>>, read_size: usize) -> Self {
        Self {
            slave_address,
            write_data: write_data.into(),
            read_size,
            tracking: Tracking::default(),
        }
    }

    /// Create a write-only transfer.
    #[must_use]
    pub fn write(slave_address: u16, data: impl Into<Vec<u8>>) -> Self {
        Self::new(slave_address, data, 0)
    }

    /// Create a read-only transfer.
    #[must_use]
    pub fn read(slave_address: u16, read_size: usize) -> Self {
        Self::new(slave_address, Vec::new(), read_size)
    }

    /// The addressed slave.
    #[must_use]
    pub const fn slave_address(&self) -> u16 {
        self.slave_address
    }

    /// Bytes of the write phase.
    #[must_use]
    pub fn write_data(&self) -> &[u8] {
        &self.write_data
    }

    /// Requested length of the read phase.
    #[must_use]
    pub const fn read_size(&self) -> usize {
        self.read_size
    }

    /// Bytes returned by the read phase. Empty until completion.
    #[must_use]
    pub fn read_data(&self) -> &[u8] {
        &self.tracking.read_data
    }

    /// Consume the request and return its read data.
    #[must_use]
    pub fn into_read_data(self) -> Vec<u8> {
        self.tracking.read_data
    }
}

/// A loopback transfer against the expander's own slave memory window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveRequest {
    write_address: u32,
    write_data: Vec<u8>,
    read_address: u32,
    read_size: usize,
    tracking: Tracking,
}

impl SlaveRequest {
    /// Create a loopback transfer that writes `write_data` at
    /// `write_address` and then reads `read_size` bytes from
    /// `read_address`.
    #[must_use]
    pub fn new(
        write_address: u32,
        write_data: impl Into<Vec<u8>>,
        read_address: u32,
        read_size: usize,
    ) -> Self {
        Self {
            write_address,
            write_data: write_data.into(),
            read_address,
            read_size,
            tracking: Tracking::default(),
        }
    }

    /// Where the write phase lands in the slave memory.
    #[must_use]
    pub const fn write_address(&self) -> u32 {
        self.write_address
    }

    /// Bytes of the write phase.
    #[must_use]
    pub fn write_data(&self) -> &[u8] {
        &self.write_data
    }

    /// Where the read phase starts in the slave memory.
    #[must_use]
    pub const fn read_address(&self) -> u32 {
        self.read_address
    }

    /// Requested length of the read phase.
    #[must_use]
    pub const fn read_size(&self) -> usize {
        self.read_size
    }

    /// Bytes returned by the read phase. Empty until completion.
    #[must_use]
    pub fn read_data(&self) -> &[u8] {
        &self.tracking.read_data
    }
}

macro_rules! tracked_accessors {
    ($ty:ty) => {
        impl $ty {
            /// The id assigned at submission.
            #[must_use]
            pub const fn request_id(&self) -> Option<RequestId> {
                self.tracking.request_id
            }

            /// The chain position assigned at submission.
            #[must_use]
            pub const fn sequence(&self) -> Option<Sequence> {
                self.tracking.sequence
            }

            /// Current status.
            #[must_use]
            pub const fn status(&self) -> Status {
                self.tracking.status
            }

            pub(crate) fn mark_submitted(&mut self, request_id: RequestId, sequence: Sequence) {
                self.tracking.request_id = Some(request_id);
                self.tracking.sequence = Some(sequence);
                self.tracking.status = Status::Pending;
            }

            pub(crate) fn mark_complete(&mut self, status: Status, read_data: Vec<u8>) {
                self.tracking.status = status;
                self.tracking.read_data = read_data;
            }
        }
    };
}

tracked_accessors!(MasterRequest);
tracked_accessors!(SlaveRequest);

/// A remote master accessed our slave memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveNotification {
    /// Device-assigned id, unique while the notification is buffered.
    pub access_id: u32,
    /// Outcome of the access.
    pub status: Status,
    /// Start of the written area.
    pub write_address: u32,
    /// The bytes the remote master wrote.
    pub write_data: Vec<u8>,
    /// Start of the read area.
    pub read_address: u32,
    /// Number of bytes served to the remote master.
    pub read_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_statuses_are_terminal() {
        assert!(!Status::NotSent.is_terminal());
        assert!(!Status::Pending.is_terminal());

        for status in [
            Status::Success,
            Status::BadRequest,
            Status::NoSpace,
            Status::SlaveNack,
            Status::SlaveEarlyNack,
            Status::InterfaceError,
        ] {
            assert!(status.is_terminal());
            assert_eq!(status.is_success(), status == Status::Success);
        }
    }

    #[test]
    fn config_validation() {
        assert!(BusConfig::default().is_valid());
        assert_eq!(BusConfig::default().clock_freq.hz(), 400_000);
        assert_eq!(ClockFreq::Freq10K.hz(), 10_000);
        assert_eq!(ClockFreq::Freq1M.hz(), 1_000_000);

        let ten_bit = BusConfig {
            slave_address: 0x3ff,
            slave_address_width: AddressWidth::Bits10,
            memory_address_width: AddressWidth::Bits8,
            ..BusConfig::default()
        };
        assert!(ten_bit.is_valid());

        let bad_slave_width = BusConfig {
            slave_address_width: AddressWidth::Bits8,
            ..BusConfig::default()
        };
        assert!(!bad_slave_width.is_valid());

        let bad_memory_width = BusConfig {
            memory_address_width: AddressWidth::Bits10,
            ..BusConfig::default()
        };
        assert!(!bad_memory_width.is_valid());

        let address_too_wide = BusConfig {
            slave_address: 0x80,
            ..BusConfig::default()
        };
        assert!(!address_too_wide.is_valid());
    }

    #[test]
    fn new_requests_are_not_sent() {
        let req = MasterRequest::new(0x50, [0x00, 0x10], 4);

        assert_eq!(req.status(), Status::NotSent);
        assert_eq!(req.request_id(), None);
        assert_eq!(req.sequence(), None);
        assert!(req.read_data().is_empty());
        assert_eq!(req.write_data(), &[0x00, 0x10]);
        assert_eq!(req.read_size(), 4);
    }
}
