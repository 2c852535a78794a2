//! Session protocol
//!
//! Requests travel from a client session to the repository as a signal id
//! plus a payload; every response starts with a status byte. The repository
//! pushes invalidations without a request.

pub mod channel;
pub mod indications;
pub mod requests;
pub mod signals;
pub mod status;
pub mod wire;

pub use channel::{Channel, LocalChannel};
pub use indications::{execute, Indication, IndicationContext, ServerProtocol};
pub use requests::{
    send, ChangeSubscriptionRequest, CloseSessionRequest, CloseViewRequest, CommitConfirmation,
    CommitTransactionRequest, LoadChunkRequest, LoadRevisionRequest, OpenSessionRequest, OpenViewRequest,
    RemoteSessionsRequest, Request, SessionInfo,
};
pub use signals::{Signal, NO_MORE_REMOTE_SESSIONS};
pub use wire::{DataInput, DataOutput};
