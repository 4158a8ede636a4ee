//! # Intel HEX images
//!
//! Just enough of the Intel HEX format to move memory images in and
//! out: data, end-of-file and the two extended address records. Start
//! address records are accepted and ignored.

use std::fmt::Write as _;

/// Bytes per data record when writing.
pub const RECORD_DATA_SIZE: usize = 16;

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const START_SEGMENT_ADDRESS: u8 = 0x03;
const EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
const START_LINEAR_ADDRESS: u8 = 0x05;

/// What is wrong with a record.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HexErrorKind {
    /// The line does not start with `:`.
    #[error("missing start code")]
    MissingStartCode,

    /// The line contains something other than pairs of hex digits.
    #[error("invalid hex digits: {0}")]
    InvalidDigits(#[from] hex::FromHexError),

    /// The byte count does not match the record length.
    #[error("record length does not match its byte count")]
    LengthMismatch,

    /// The record checksum is wrong.
    #[error("checksum mismatch")]
    Checksum,

    /// The record type is not known.
    #[error("unknown record type {0:#04x}")]
    UnknownRecord(u8),

    /// The file ends without an end-of-file record.
    #[error("missing end-of-file record")]
    MissingEof,
}

/// A malformed Intel HEX file.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Intel HEX line {line}: {kind}")]
pub struct HexError {
    /// One-based line number.
    pub line: usize,
    /// What went wrong.
    #[source]
    pub kind: HexErrorKind,
}

/// A run of bytes at an absolute address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Address of the first byte.
    pub address: usize,
    /// The bytes.
    pub data: Vec<u8>,
}

/// Parse an Intel HEX file into segments.
///
/// Records that continue exactly where the previous one ended are
/// merged into one segment.
pub fn parse(text: &str) -> Result<Vec<Segment>, HexError> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut base = 0usize;
    let mut lines = 0;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        lines = line_no;
        let err = |kind| HexError {
            line: line_no,
            kind,
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let digits = line.strip_prefix(':').ok_or(err(HexErrorKind::MissingStartCode))?;
        let bytes = hex::decode(digits).map_err(|e| err(e.into()))?;

        if bytes.len() < 5 || bytes.len() != 5 + usize::from(bytes[0]) {
            return Err(err(HexErrorKind::LengthMismatch));
        }

        if bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) != 0 {
            return Err(err(HexErrorKind::Checksum));
        }

        let offset = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        let record_type = bytes[3];
        let data = &bytes[4..bytes.len() - 1];

        match record_type {
            DATA => {
                let address = base + offset;

                match segments.last_mut() {
                    Some(last) if last.address + last.data.len() == address => {
                        last.data.extend_from_slice(data);
                    }
                    _ => segments.push(Segment {
                        address,
                        data: data.to_vec(),
                    }),
                }
            }
            END_OF_FILE => return Ok(segments),
            EXTENDED_SEGMENT_ADDRESS | EXTENDED_LINEAR_ADDRESS => {
                let [high, low] = data else {
                    return Err(err(HexErrorKind::LengthMismatch));
                };
                let value = usize::from(u16::from_be_bytes([*high, *low]));

                base = if record_type == EXTENDED_LINEAR_ADDRESS {
                    value << 16
                } else {
                    value << 4
                };
            }
            START_SEGMENT_ADDRESS | START_LINEAR_ADDRESS => {}
            other => return Err(err(HexErrorKind::UnknownRecord(other))),
        }
    }

    Err(HexError {
        line: lines + 1,
        kind: HexErrorKind::MissingEof,
    })
}

fn push_record(out: &mut String, offset: u16, record_type: u8, data: &[u8]) {
    let mut bytes = Vec::with_capacity(data.len() + 5);

    // Records never carry more than RECORD_DATA_SIZE bytes.
    bytes.push(data.len() as u8);
    bytes.extend_from_slice(&offset.to_be_bytes());
    bytes.push(record_type);
    bytes.extend_from_slice(data);

    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    bytes.push(sum.wrapping_neg());

    // Writing into a String cannot fail.
    let _ = writeln!(out, ":{}", hex::encode_upper(bytes));
}

/// Render `data`, starting at `address`, as an Intel HEX file.
#[must_use]
pub fn render(address: usize, data: &[u8]) -> String {
    let mut out = String::new();
    let mut upper = 0usize;
    let mut pos = 0;

    while pos < data.len() {
        let absolute = address + pos;

        if absolute >> 16 != upper {
            upper = absolute >> 16;
            push_record(
                &mut out,
                0,
                EXTENDED_LINEAR_ADDRESS,
                &((upper & 0xffff) as u16).to_be_bytes(),
            );
        }

        let to_boundary = 0x1_0000 - (absolute & 0xffff);
        let len = RECORD_DATA_SIZE.min(data.len() - pos).min(to_boundary);

        push_record(
            &mut out,
            (absolute & 0xffff) as u16,
            DATA,
            &data[pos..pos + len],
        );
        pos += len;
    }

    push_record(&mut out, 0, END_OF_FILE, &[]);
    out
}
