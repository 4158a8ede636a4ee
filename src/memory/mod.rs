//! # Addressable memory
//!
//! [`Memory`] presents an I2C memory chip (FRAM, EEPROM) as a linear
//! byte array. Reads go to the device right away. Writes are staged in
//! a shadow copy of the whole chip and only reach the device on
//! [`Memory::flush`].
//!
//! Every transfer starts with the memory address, sent big-endian in
//! `address_width` bytes. Chips that are larger than this address field
//! can express take the missing high bits from the slave address: bit 1
//! and up of the slave address carry the upper address bits.
//!
//! ```text
//!   slave address      address field (address_width bytes)
//!  ┌───────┬─────┬─┐  ┌────────────────┐
//!  │ base  │extra│0│  │ low address    │
//!  └───────┴─────┴─┘  └────────────────┘
//! ```
//!
//! No transfer ever crosses a multiple of `2^(8 * address_width)`,
//! because the slave address changes there.

pub mod dirty;
pub mod ihex;

use std::{
    fs,
    ops::Range,
    path::Path,
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::i2c::{
    request::{MasterRequest, Status},
    I2cError, I2cInterface,
};

use dirty::DirtyRanges;
use ihex::HexError;

/// Largest read phase of a single transfer.
pub const I2C_MAX_READ_SIZE: usize = 128;

/// Largest write phase of a single transfer, address bytes included.
pub const I2C_MAX_WRITE_SIZE: usize = 128;

/// How often a write chunk is attempted while the chip does not
/// acknowledge.
pub const MAX_WRITE_RETRIES: usize = 100;

/// Upper address bits a 7-bit slave address can carry above bit 0.
pub const MAX_ADDITIONAL_ADDRESS_BITS: u32 = 6;

/// How long a single transfer may take by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors of the memory layer.
#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    /// The geometry describes no memory or an unsupported address field.
    #[error("Invalid memory geometry: {0:?}")]
    InvalidGeometry(MemoryGeometry),

    /// The access does not fit into the memory.
    #[error("Access of {length} bytes at {address:#x} exceeds memory size {size:#x}")]
    OutOfBounds {
        /// Start of the access.
        address: usize,
        /// Length of the access.
        length: usize,
        /// Size of the memory.
        size: usize,
    },

    /// The address needs more slave address bits than the chip has.
    #[error("Address {address:#x} needs more than {available} extra address bits")]
    AddressBitsExceeded {
        /// The offending address.
        address: usize,
        /// Extra address bits of this chip.
        available: u32,
    },

    /// The device reported a failed transfer.
    #[error("Transfer at {address:#x} failed with {status:?}")]
    Transfer {
        /// Start of the failed chunk.
        address: usize,
        /// What the device reported.
        status: Status,
    },

    /// The device returned fewer bytes than requested.
    #[error("Read at {address:#x} returned {actual} of {expected} bytes")]
    ShortRead {
        /// Start of the chunk.
        address: usize,
        /// Requested length.
        expected: usize,
        /// Received length.
        actual: usize,
    },

    /// The chip did not acknowledge a write in time.
    #[error("Write at {address:#x} not acknowledged after {attempts} attempts")]
    RetriesExhausted {
        /// Start of the chunk.
        address: usize,
        /// Number of attempts made.
        attempts: usize,
    },

    /// The bus interface failed.
    #[error(transparent)]
    Bus(#[from] I2cError),

    /// Reading or writing an image file failed.
    #[error("Image file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// An Intel HEX image is malformed.
    #[error(transparent)]
    Hex(#[from] HexError),
}

/// Storage technology of a memory chip.
///
/// All three are accessed the same way. Chips that are busy with an
/// internal write cycle NACK until it is done, which [`Memory::flush`]
/// retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryType {
    /// Ferroelectric RAM.
    #[default]
    Fram,
    /// Electrically erasable PROM.
    Eeprom,
    /// NOR flash with an I2C interface.
    Flash,
}

/// Size and addressing of a memory chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryGeometry {
    /// What kind of chip this is.
    pub memory_type: MemoryType,
    /// Number of pages.
    pub page_count: usize,
    /// Bytes per page.
    pub page_size: usize,
    /// Bytes of the address field, 1 to 4.
    pub address_width: usize,
}

impl Default for MemoryGeometry {
    /// A 32 KiB FRAM with a two byte address field.
    fn default() -> Self {
        Self {
            memory_type: MemoryType::Fram,
            page_count: 1,
            page_size: 32 * 1024,
            address_width: 2,
        }
    }
}

impl MemoryGeometry {
    /// Total size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.page_count * self.page_size
    }

    /// Number of address bits that go into the slave address.
    #[must_use]
    pub const fn additional_address_bits(&self) -> u32 {
        let size = self.size();
        let field_bits = 8 * self.address_width as u32;

        if bit_length(size) > field_bits {
            bit_length(size - 1) - field_bits
        } else {
            0
        }
    }

    /// The addresses where the packed slave address changes are the
    /// multiples of this value.
    #[must_use]
    pub const fn packing_boundary(&self) -> usize {
        1 << (8 * self.address_width)
    }

    fn is_valid(&self) -> bool {
        (1..=4).contains(&self.address_width)
            && self
                .page_count
                .checked_mul(self.page_size)
                .is_some_and(|size| size > 0)
            && self.additional_address_bits() <= MAX_ADDITIONAL_ADDRESS_BITS
    }
}

const fn bit_length(value: usize) -> u32 {
    usize::BITS - value.leading_zeros()
}

/// A memory chip on an I2C bus.
#[derive(Debug)]
pub struct Memory {
    bus: I2cInterface,
    base_address: u16,
    geometry: MemoryGeometry,
    shadow: Vec<u8>,
    dirty: DirtyRanges,
    timeout: Duration,
    retry_backoff: Duration,
}

impl Memory {
    /// Create a memory for the chip answering at `slave_address`.
    ///
    /// Nothing is sent to the device.
    pub fn new(
        bus: I2cInterface,
        slave_address: u16,
        geometry: MemoryGeometry,
    ) -> Result<Self, MemoryError> {
        if !geometry.is_valid() {
            return Err(MemoryError::InvalidGeometry(geometry));
        }

        debug!(
            "{:?} at {slave_address:#04x}: {} bytes, {} address bytes, {} extra address bits",
            geometry.memory_type,
            geometry.size(),
            geometry.address_width,
            geometry.additional_address_bits()
        );

        Ok(Self {
            bus,
            base_address: slave_address,
            geometry,
            shadow: vec![0; geometry.size()],
            dirty: DirtyRanges::new(),
            timeout: DEFAULT_TIMEOUT,
            retry_backoff: Duration::ZERO,
        })
    }

    /// Total size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.geometry.size()
    }

    /// The kind of chip.
    #[must_use]
    pub const fn memory_type(&self) -> MemoryType {
        self.geometry.memory_type
    }

    /// Number of address bits carried in the slave address.
    #[must_use]
    pub const fn additional_address_bits(&self) -> u32 {
        self.geometry.additional_address_bits()
    }

    /// Staged ranges that were not flushed yet.
    #[must_use]
    pub fn dirty_ranges(&self) -> &[Range<usize>] {
        self.dirty.ranges()
    }

    /// Set how long a single transfer may take.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Set the pause between write attempts the chip did not
    /// acknowledge. The default is no pause.
    pub fn set_retry_backoff(&mut self, backoff: Duration) {
        self.retry_backoff = backoff;
    }

    /// The slave address to use for a transfer starting at `address`.
    pub fn pack_slave_address(&self, address: usize) -> Result<u16, MemoryError> {
        let available = self.additional_address_bits();
        let extra = address
            .checked_shr(8 * self.geometry.address_width as u32)
            .unwrap_or(0);

        if bit_length(extra) > available {
            return Err(MemoryError::AddressBitsExceeded { address, available });
        }

        let mask = (1u16 << available) - 1;
        // The check above keeps `extra` below 2^available.
        let extra = extra as u16;

        Ok((self.base_address & !(mask << 1)) | (extra << 1))
    }

    /// The low `address_width` bytes of `address`, most significant
    /// first.
    fn address_bytes(&self, address: usize) -> Vec<u8> {
        let bytes = (address as u64).to_be_bytes();
        bytes[bytes.len() - self.geometry.address_width..].to_vec()
    }

    fn checked_range(&self, address: usize, length: usize) -> Result<Range<usize>, MemoryError> {
        let size = self.size();

        match address.checked_add(length) {
            Some(end) if end <= size => Ok(address..end),
            _ => Err(MemoryError::OutOfBounds {
                address,
                length,
                size,
            }),
        }
    }

    /// Split `range` into transfer chunks of at most `max` bytes that do
    /// not cross a packing boundary.
    fn chunks(&self, range: Range<usize>, max: usize) -> Vec<Range<usize>> {
        let boundary = self.geometry.packing_boundary();
        let mut chunks = Vec::new();
        let mut start = range.start;

        while start < range.end {
            let next_boundary = (start / boundary + 1).saturating_mul(boundary);
            let end = range.end.min(start + max).min(next_boundary);

            chunks.push(start..end);
            start = end;
        }

        chunks
    }

    /// Submit a request as soon as the bus has room for it and wait for
    /// its completion.
    fn transact(&self, request: MasterRequest) -> Result<MasterRequest, MemoryError> {
        let deadline = Instant::now() + self.timeout;

        while !self.bus.can_accept(&request) && Instant::now() < deadline {
            self.bus.drain()?;
            std::thread::yield_now();
        }

        let request_id = self.bus.submit(request)?;
        Ok(self.bus.wait_for_response(request_id, self.timeout)?)
    }

    /// Read `length` bytes starting at `address` from the device.
    ///
    /// Bytes that were written but not flushed yet are returned as
    /// written.
    pub fn read(&mut self, address: usize, length: usize) -> Result<Vec<u8>, MemoryError> {
        let range = self.checked_range(address, length)?;

        for chunk in self.chunks(range.clone(), I2C_MAX_READ_SIZE) {
            let slave_address = self.pack_slave_address(chunk.start)?;
            trace!("read {chunk:x?} from {slave_address:#04x}");

            let request = MasterRequest::new(
                slave_address,
                self.address_bytes(chunk.start),
                chunk.len(),
            );
            let done = self.transact(request)?;

            if !done.status().is_success() {
                return Err(MemoryError::Transfer {
                    address: chunk.start,
                    status: done.status(),
                });
            }

            let data = done.into_read_data();
            if data.len() < chunk.len() {
                return Err(MemoryError::ShortRead {
                    address: chunk.start,
                    expected: chunk.len(),
                    actual: data.len(),
                });
            }

            for clean in self.dirty.clean_parts(chunk.clone()) {
                let offset = clean.start - chunk.start;
                self.shadow[clean.clone()].copy_from_slice(&data[offset..offset + clean.len()]);
            }
        }

        Ok(self.shadow[range].to_vec())
    }

    /// Read from `address` to the end of the memory.
    pub fn read_to_end(&mut self, address: usize) -> Result<Vec<u8>, MemoryError> {
        let length = self
            .size()
            .checked_sub(address)
            .ok_or(MemoryError::OutOfBounds {
                address,
                length: 0,
                size: self.size(),
            })?;

        self.read(address, length)
    }

    /// Stage `data` at `address`.
    pub fn write(&mut self, address: usize, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.checked_range(address, data.len())?;

        self.shadow[range.clone()].copy_from_slice(data);
        self.dirty.insert(range);

        Ok(())
    }

    /// Write all staged data to the device.
    ///
    /// The staged ranges are only forgotten once all of them were
    /// written.
    pub fn flush(&mut self) -> Result<(), MemoryError> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let max = I2C_MAX_WRITE_SIZE - self.geometry.address_width;

        for range in self.dirty.ranges().to_vec() {
            debug!("flushing {range:x?}");

            for chunk in self.chunks(range, max) {
                let slave_address = self.pack_slave_address(chunk.start)?;

                let mut payload = self.address_bytes(chunk.start);
                payload.extend_from_slice(&self.shadow[chunk.clone()]);

                self.write_chunk(slave_address, chunk.start, &payload)?;
            }
        }

        self.dirty.clear();
        Ok(())
    }

    fn write_chunk(
        &self,
        slave_address: u16,
        address: usize,
        payload: &[u8],
    ) -> Result<(), MemoryError> {
        for attempt in 1..=MAX_WRITE_RETRIES {
            let done = self.transact(MasterRequest::write(slave_address, payload))?;

            match done.status() {
                Status::Success => return Ok(()),
                Status::SlaveNack => {
                    trace!("write at {address:#x} not acknowledged (attempt {attempt})");
                    if !self.retry_backoff.is_zero() {
                        std::thread::sleep(self.retry_backoff);
                    }
                }
                status => return Err(MemoryError::Transfer { address, status }),
            }
        }

        warn!("giving up on write at {address:#x}");
        Err(MemoryError::RetriesExhausted {
            address,
            attempts: MAX_WRITE_RETRIES,
        })
    }

    /// Write the contents of a binary file at `address` and flush.
    pub fn upload_bin(&mut self, address: usize, path: impl AsRef<Path>) -> Result<(), MemoryError> {
        let data = fs::read(path)?;

        self.write(address, &data)?;
        self.flush()
    }

    /// Save everything from `address` to the end of memory as a binary
    /// file.
    pub fn download_bin(&mut self, address: usize, path: impl AsRef<Path>) -> Result<(), MemoryError> {
        let data = self.read_to_end(address)?;

        fs::write(path, data)?;
        Ok(())
    }

    /// Write every data record of an Intel HEX file and flush.
    pub fn upload_hex(&mut self, path: impl AsRef<Path>) -> Result<(), MemoryError> {
        let text = fs::read_to_string(path)?;

        for segment in ihex::parse(&text)? {
            self.write(segment.address, &segment.data)?;
        }

        self.flush()
    }

    /// Save everything from `address` to the end of memory as an Intel
    /// HEX file.
    pub fn download_hex(&mut self, address: usize, path: impl AsRef<Path>) -> Result<(), MemoryError> {
        let data = self.read_to_end(address)?;

        fs::write(path, ihex::render(address, &data))?;
        Ok(())
    }
}
