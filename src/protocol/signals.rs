//! Signal identifiers of the session protocol

use crate::core::error::ProtocolError;

/// Terminates the remote sessions listing
pub const NO_MORE_REMOTE_SESSIONS: i32 = -1;

/// Message kinds exchanged between client and repository
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Open a session for a user
    OpenSession = 1,
    /// Close the session
    CloseSession = 2,
    /// Open a view of a branch
    OpenView = 3,
    /// Close a view
    CloseView = 4,
    /// Load revisions by id
    LoadRevision = 5,
    /// Load ranges of a list feature
    LoadChunk = 6,
    /// Commit a transaction
    CommitTransaction = 7,
    /// Change the change subscription of a view
    ChangeSubscription = 8,
    /// List the other sessions
    RemoteSessions = 9,
    /// Server push: objects changed by another session
    Invalidation = 10,
}

impl Signal {
    /// Convert a wire id into a signal
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Signal::OpenSession),
            2 => Some(Signal::CloseSession),
            3 => Some(Signal::OpenView),
            4 => Some(Signal::CloseView),
            5 => Some(Signal::LoadRevision),
            6 => Some(Signal::LoadChunk),
            7 => Some(Signal::CommitTransaction),
            8 => Some(Signal::ChangeSubscription),
            9 => Some(Signal::RemoteSessions),
            10 => Some(Signal::Invalidation),
            _ => None,
        }
    }

    /// Parse a wire id, failing with a protocol error
    pub fn parse(value: u16) -> Result<Self, ProtocolError> {
        Self::from_u16(value).ok_or(ProtocolError::UnknownSignal(value))
    }

    /// Wire id
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Whether the handler of this signal reads the store
    pub fn reads_store(self) -> bool {
        matches!(self, Signal::LoadRevision | Signal::LoadChunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        for id in 1..=10u16 {
            assert_eq!(Signal::from_u16(id).map(Signal::id), Some(id));
        }
        assert!(matches!(Signal::parse(99), Err(ProtocolError::UnknownSignal(99))));
    }
}
