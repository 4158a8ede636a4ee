//! # I2C wire records
//!
//! Every payload on the I2C channel is one [`I2cMessage`]. The records
//! below are what the interface reads and writes; how they turn into
//! bytes is up to a [`MessageCodec`]. The shipped codec uses `postcard`.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use super::request::{BusConfig, I2cId, RequestId, Sequence, SlaveNotification, Status};

/// Configure a bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    /// Correlation key.
    pub request_id: RequestId,
    /// The new configuration.
    pub config: BusConfig,
}

/// Outcome of a [`ConfigRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStatus {
    /// Correlation key.
    pub request_id: RequestId,
    /// Outcome.
    pub status: Status,
}

/// A master transfer on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRequestRecord {
    /// Correlation key.
    pub request_id: RequestId,
    /// Chain position.
    pub sequence: Sequence,
    /// The addressed slave.
    pub slave_address: u16,
    /// Bytes of the write phase.
    pub write_data: Vec<u8>,
    /// Length of the read phase.
    pub read_size: usize,
}

/// Outcome of a master transfer, along with the device's free space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterStatus {
    /// Correlation key.
    pub request_id: RequestId,
    /// Outcome.
    pub status: Status,
    /// Bytes of the read phase.
    pub read_data: Vec<u8>,
    /// Free master queue slots.
    pub queue_space: usize,
    /// Free bytes in the first buffer region.
    pub region1: usize,
    /// Free bytes in the second buffer region.
    pub region2: usize,
}

/// A slave loopback request on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveRequestRecord {
    /// Correlation key.
    pub request_id: RequestId,
    /// Chain position.
    pub sequence: Sequence,
    /// Start of the write phase.
    pub write_address: u32,
    /// Bytes of the write phase.
    pub write_data: Vec<u8>,
    /// Start of the read phase.
    pub read_address: u32,
    /// Length of the read phase.
    pub read_size: usize,
}

/// Outcome of a slave loopback request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveStatus {
    /// Correlation key.
    pub request_id: RequestId,
    /// Outcome.
    pub status: Status,
    /// Bytes of the read phase.
    pub read_data: Vec<u8>,
    /// Free slave queue slots.
    pub queue_space: usize,
}

/// The record types of the I2C channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum MessageBody {
    ConfigRequest(ConfigRequest),
    ConfigStatus(ConfigStatus),
    MasterRequest(MasterRequestRecord),
    MasterStatus(MasterStatus),
    SlaveRequest(SlaveRequestRecord),
    SlaveStatus(SlaveStatus),
    SlaveNotification(SlaveNotification),
}

/// One payload on the I2C channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct I2cMessage {
    /// The bus the record is about.
    pub bus: I2cId,
    /// For host messages, the running outbound counter. For device
    /// messages, the last host sequence number the device had seen.
    pub sequence_number: u64,
    /// The record itself.
    pub body: MessageBody,
}

/// Errors turning records into bytes and back.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The record could not be serialized.
    #[error("Failed to encode I2C message: {0}")]
    Encode(#[source] postcard::Error),

    /// The payload is not a valid record.
    #[error("Failed to decode I2C message: {0}")]
    Decode(#[source] postcard::Error),
}

/// Conversion between [`I2cMessage`] records and payload bytes.
pub trait MessageCodec: Debug + Send + Sync {
    /// Serialize a record.
    fn encode(&self, message: &I2cMessage) -> Result<Vec<u8>, CodecError>;

    /// Parse a payload.
    fn decode(&self, payload: &[u8]) -> Result<I2cMessage, CodecError>;
}

/// [`MessageCodec`] using `postcard`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostcardCodec;

impl MessageCodec for PostcardCodec {
    fn encode(&self, message: &I2cMessage) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(message).map_err(CodecError::Encode)
    }

    fn decode(&self, payload: &[u8]) -> Result<I2cMessage, CodecError> {
        postcard::from_bytes(payload).map_err(CodecError::Decode)
    }
}
