//! Client-side request encoders
//!
//! A [`Request`] writes its payload in [`Request::requesting`] and decodes the
//! successful response in [`Request::confirming`]; the status byte in front of
//! every response is handled by [`send`].

use crate::core::error::{ProtocolError, Result};
use crate::core::types::{BranchId, FeatureId, ObjectId, SessionId, Timestamp, Version, ViewId};
use crate::protocol::channel::Channel;
use crate::protocol::signals::{Signal, NO_MORE_REMOTE_SESSIONS};
use crate::protocol::status;
use crate::protocol::wire::{DataInput, DataOutput};
use crate::revision::Revision;
use crate::server::{CommitRequest, RemoteSessionInfo, ViewKind};
use crate::storage::Chunk;
use std::time::Duration;

/// One request/response exchange
pub trait Request {
    /// Decoded response
    type Response;

    /// Signal of the request
    fn signal(&self) -> Signal;

    /// Write the request payload
    fn requesting(&self, output: &mut DataOutput) -> Result<()>;

    /// Decode a successful response
    fn confirming(&mut self, input: &mut DataInput) -> Result<Self::Response>;
}

/// Send `request` over `channel` and wait at most `timeout` for the response
pub fn send<R: Request>(channel: &dyn Channel, request: &mut R, timeout: Duration) -> Result<R::Response> {
    let mut output = DataOutput::new();
    request.requesting(&mut output)?;
    let response = channel.exchange(request.signal(), output.freeze(), timeout)?;

    let mut input = DataInput::new(response);
    status::read_status(&mut input)?;
    let confirmed = request.confirming(&mut input)?;
    if !input.is_empty() {
        return Err(ProtocolError::Malformed("trailing response bytes").into());
    }
    Ok(confirmed)
}

/// Result of opening a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session id assigned by the repository
    pub session_id: SessionId,
    /// Repository name
    pub repository_name: String,
}

/// Open a session for a user
#[derive(Debug, Clone)]
pub struct OpenSessionRequest {
    /// User the session belongs to
    pub user: String,
}

impl Request for OpenSessionRequest {
    type Response = SessionInfo;

    fn signal(&self) -> Signal {
        Signal::OpenSession
    }

    fn requesting(&self, output: &mut DataOutput) -> Result<()> {
        output.write_str(&self.user);
        Ok(())
    }

    fn confirming(&mut self, input: &mut DataInput) -> Result<SessionInfo> {
        Ok(SessionInfo {
            session_id: input.read_i32()?,
            repository_name: input.read_str()?,
        })
    }
}

/// Close the session
#[derive(Debug, Clone, Default)]
pub struct CloseSessionRequest;

impl Request for CloseSessionRequest {
    type Response = ();

    fn signal(&self) -> Signal {
        Signal::CloseSession
    }

    fn requesting(&self, _output: &mut DataOutput) -> Result<()> {
        Ok(())
    }

    fn confirming(&mut self, _input: &mut DataInput) -> Result<()> {
        Ok(())
    }
}

/// Open a view
#[derive(Debug, Clone)]
pub struct OpenViewRequest {
    /// Client-chosen view id
    pub view_id: ViewId,
    /// View kind
    pub kind: ViewKind,
    /// Branch of the view
    pub branch: BranchId,
}

impl Request for OpenViewRequest {
    type Response = ();

    fn signal(&self) -> Signal {
        Signal::OpenView
    }

    fn requesting(&self, output: &mut DataOutput) -> Result<()> {
        output.write_i32(self.view_id);
        output.write_view_kind(self.kind);
        output.write_i32(self.branch.0);
        Ok(())
    }

    fn confirming(&mut self, _input: &mut DataInput) -> Result<()> {
        Ok(())
    }
}

/// Close a view; the response tells whether it was open
#[derive(Debug, Clone)]
pub struct CloseViewRequest {
    /// View to close
    pub view_id: ViewId,
}

impl Request for CloseViewRequest {
    type Response = bool;

    fn signal(&self) -> Signal {
        Signal::CloseView
    }

    fn requesting(&self, output: &mut DataOutput) -> Result<()> {
        output.write_i32(self.view_id);
        Ok(())
    }

    fn confirming(&mut self, input: &mut DataInput) -> Result<bool> {
        input.read_bool()
    }
}

/// Load revisions by id, `None` for ids the view cannot see
#[derive(Debug, Clone)]
pub struct LoadRevisionRequest {
    /// View to load through
    pub view_id: ViewId,
    /// List chunk size, -1 for complete lists
    pub list_chunk: i32,
    /// Ids to load
    pub ids: Vec<ObjectId>,
}

impl Request for LoadRevisionRequest {
    type Response = Vec<Option<Revision>>;

    fn signal(&self) -> Signal {
        Signal::LoadRevision
    }

    fn requesting(&self, output: &mut DataOutput) -> Result<()> {
        output.write_i32(self.view_id);
        output.write_i32(self.list_chunk);
        output.write_object_ids(&self.ids);
        Ok(())
    }

    fn confirming(&mut self, input: &mut DataInput) -> Result<Self::Response> {
        let count = input.read_count()?;
        let mut revisions = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            let revision = if input.read_bool()? { Some(input.read_revision()?) } else { None };
            revisions.push(revision);
        }
        Ok(revisions)
    }
}

/// Load ranges of one list of a stored revision
#[derive(Debug, Clone)]
pub struct LoadChunkRequest {
    /// Object
    pub id: ObjectId,
    /// Branch of the revision
    pub branch: BranchId,
    /// Version of the revision
    pub version: Version,
    /// List feature
    pub feature: FeatureId,
    /// Half-open index ranges `[from, to)`
    pub ranges: Vec<(i32, i32)>,
}

impl Request for LoadChunkRequest {
    type Response = Vec<Chunk>;

    fn signal(&self) -> Signal {
        Signal::LoadChunk
    }

    fn requesting(&self, output: &mut DataOutput) -> Result<()> {
        output.write_object_id(self.id);
        output.write_i32(self.branch.0);
        output.write_i32(self.version.0);
        output.write_u16(self.feature.0);
        output.write_count(self.ranges.len());
        for (from, to) in &self.ranges {
            output.write_i32(*from);
            output.write_i32(*to);
        }
        Ok(())
    }

    fn confirming(&mut self, input: &mut DataInput) -> Result<Vec<Chunk>> {
        let count = input.read_count()?;
        let mut chunks = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            let start_index = input.read_i32()?;
            let values = input.read_values()?;
            let mut chunk = Chunk::new(start_index, values.len());
            for (slot, value) in values.into_iter().enumerate() {
                chunk.add(slot, value);
            }
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Commit acknowledgement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitConfirmation {
    /// Commit time
    pub timestamp: Timestamp,
    /// Temporary id to permanent id
    pub id_mappings: Vec<(ObjectId, ObjectId)>,
}

/// Commit the changes of a transaction view
#[derive(Debug, Clone)]
pub struct CommitTransactionRequest {
    /// Transaction view
    pub view_id: ViewId,
    /// Changes to commit
    pub request: CommitRequest,
}

impl Request for CommitTransactionRequest {
    type Response = CommitConfirmation;

    fn signal(&self) -> Signal {
        Signal::CommitTransaction
    }

    fn requesting(&self, output: &mut DataOutput) -> Result<()> {
        let request = &self.request;
        output.write_i32(self.view_id);
        output.write_i32(request.branch.0);

        output.write_count(request.new_objects.len());
        for revision in &request.new_objects {
            output.write_revision(revision);
        }
        output.write_count(request.dirty.len());
        for delta in &request.dirty {
            output.write_revision_delta(delta);
        }
        output.write_count(request.detached.len());
        for (id, version) in &request.detached {
            output.write_object_id(*id);
            output.write_i32(version.0);
        }
        Ok(())
    }

    fn confirming(&mut self, input: &mut DataInput) -> Result<CommitConfirmation> {
        let timestamp = Timestamp(input.read_i64()?);
        let count = input.read_count()?;
        let mut id_mappings = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            id_mappings.push((input.read_object_id()?, input.read_object_id()?));
        }
        Ok(CommitConfirmation { timestamp, id_mappings })
    }
}

/// Change the change subscription of a view
#[derive(Debug, Clone)]
pub struct ChangeSubscriptionRequest {
    /// View whose subscription changes
    pub view_id: ViewId,
    /// Drop every subscription first
    pub clear: bool,
    /// Subscribe to `ids` when true, unsubscribe otherwise
    pub subscribe: bool,
    /// Ids to (un)subscribe
    pub ids: Vec<ObjectId>,
}

impl Request for ChangeSubscriptionRequest {
    type Response = bool;

    fn signal(&self) -> Signal {
        Signal::ChangeSubscription
    }

    fn requesting(&self, output: &mut DataOutput) -> Result<()> {
        let size = self.ids.len() as i32;
        output.write_i32(self.view_id);
        output.write_bool(self.clear);
        output.write_i32(if self.subscribe { size } else { -size });
        for id in &self.ids {
            output.write_object_id(*id);
        }
        Ok(())
    }

    fn confirming(&mut self, input: &mut DataInput) -> Result<bool> {
        input.read_bool()
    }
}

/// List the other sessions of the repository
#[derive(Debug, Clone)]
pub struct RemoteSessionsRequest {
    /// New value of this session's remote session subscription
    pub subscribe: bool,
}

impl Request for RemoteSessionsRequest {
    type Response = Vec<RemoteSessionInfo>;

    fn signal(&self) -> Signal {
        Signal::RemoteSessions
    }

    fn requesting(&self, output: &mut DataOutput) -> Result<()> {
        output.write_bool(self.subscribe);
        Ok(())
    }

    fn confirming(&mut self, input: &mut DataInput) -> Result<Self::Response> {
        let mut sessions = Vec::new();
        loop {
            let session_id = input.read_i32()?;
            if session_id == NO_MORE_REMOTE_SESSIONS {
                return Ok(sessions);
            }
            sessions.push(RemoteSessionInfo {
                session_id,
                user: input.read_str()?,
                subscribed: input.read_bool()?,
            });
        }
    }
}
