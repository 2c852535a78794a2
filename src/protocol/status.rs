//! Response status byte and error transfer
//!
//! Every response starts with a status byte. On failure the status is
//! followed by an error code and its fields, so the client can rebuild an
//! [`Error`] of the same class.

use crate::core::error::{Error, ProtocolError, Result, StorageError};
use crate::core::types::Version;
use crate::protocol::wire::{DataInput, DataOutput};

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorCode {
    Conflict = 1,
    NotFound = 2,
    InvalidInput = 3,
    Storage = 4,
    Closed = 5,
    Timeout = 6,
    Other = 7,
}

impl ErrorCode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ErrorCode::Conflict),
            2 => Some(ErrorCode::NotFound),
            3 => Some(ErrorCode::InvalidInput),
            4 => Some(ErrorCode::Storage),
            5 => Some(ErrorCode::Closed),
            6 => Some(ErrorCode::Timeout),
            7 => Some(ErrorCode::Other),
            _ => None,
        }
    }
}

/// Start a successful response
pub fn write_ok(output: &mut DataOutput) {
    output.write_u8(STATUS_OK);
}

/// Write a failed response
pub fn write_error(output: &mut DataOutput, error: &Error) {
    output.write_u8(STATUS_ERROR);
    match error {
        Error::CommitConflict { id, base, head } => {
            output.write_u8(ErrorCode::Conflict as u8);
            output.write_object_id(*id);
            output.write_i32(base.0);
            output.write_i32(head.0);
        }
        Error::NotFound(message) => {
            output.write_u8(ErrorCode::NotFound as u8);
            output.write_str(message);
        }
        Error::InvalidInput(message) => {
            output.write_u8(ErrorCode::InvalidInput as u8);
            output.write_str(message);
        }
        Error::Storage(err) => {
            output.write_u8(ErrorCode::Storage as u8);
            output.write_str(&err.to_string());
        }
        Error::Closed(message) => {
            output.write_u8(ErrorCode::Closed as u8);
            output.write_str(message);
        }
        Error::Timeout { millis } => {
            output.write_u8(ErrorCode::Timeout as u8);
            output.write_i64(*millis as i64);
        }
        other => {
            output.write_u8(ErrorCode::Other as u8);
            output.write_str(&other.to_string());
        }
    }
}

/// Consume the status of a response, turning a failure into its error
pub fn read_status(input: &mut DataInput) -> Result<()> {
    match input.read_u8()? {
        STATUS_OK => Ok(()),
        STATUS_ERROR => Err(read_error(input)?),
        tag => Err(ProtocolError::InvalidTag { what: "status", tag: tag as u32 }.into()),
    }
}

fn read_error(input: &mut DataInput) -> Result<Error> {
    let tag = input.read_u8()?;
    let code = ErrorCode::from_u8(tag).ok_or(ProtocolError::InvalidTag { what: "error code", tag: tag as u32 })?;
    Ok(match code {
        ErrorCode::Conflict => Error::CommitConflict {
            id: input.read_object_id()?,
            base: Version(input.read_i32()?),
            head: Version(input.read_i32()?),
        },
        ErrorCode::NotFound => Error::NotFound(input.read_str()?),
        ErrorCode::InvalidInput => Error::InvalidInput(input.read_str()?),
        ErrorCode::Storage => Error::Storage(StorageError::Fault(input.read_str()?)),
        ErrorCode::Closed => Error::Closed(input.read_str()?),
        ErrorCode::Timeout => Error::Timeout { millis: input.read_i64()?.max(0) as u64 },
        ErrorCode::Other => Error::Internal(input.read_str()?),
    })
}
