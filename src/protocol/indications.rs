//! Server-side request handlers
//!
//! Each signal has an [`Indication`] that reads its request in
//! [`Indication::indicating`], performs the work, and writes the response in
//! [`Indication::responding`]. Handlers get their collaborators through an
//! explicit [`IndicationContext`]; for signals that read the store the context
//! carries a store accessor that lives exactly as long as the request.

use crate::core::error::{Error, ProtocolError, Result};
use crate::core::types::{BranchId, FeatureId, ObjectId, Version};
use crate::protocol::signals::{Signal, NO_MORE_REMOTE_SESSIONS};
use crate::protocol::status;
use crate::protocol::wire::{DataInput, DataOutput};
use crate::revision::Revision;
use crate::server::{CommitRequest, CommitResult, Invalidation, RemoteSessionInfo, Repository, Session};
use crate::storage::{Chunk, StoreAccessor};
use bytes::Bytes;
use flume::Receiver;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// What a handler may touch while serving one request
pub struct IndicationContext<'a> {
    repository: &'a Repository,
    session: &'a Arc<Session>,
    accessor: Option<&'a StoreAccessor>,
}

impl<'a> IndicationContext<'a> {
    /// Repository the session belongs to
    pub fn repository(&self) -> &'a Repository {
        self.repository
    }

    /// Session that sent the request
    pub fn session(&self) -> &'a Arc<Session> {
        self.session
    }

    /// Store accessor of a read request
    pub fn accessor(&self) -> Result<&'a StoreAccessor> {
        self.accessor
            .ok_or_else(|| Error::internal("store accessor requested outside a read indication"))
    }
}

/// Handler of one request signal
pub trait Indication {
    /// Signal served by this handler
    fn signal(&self) -> Signal;

    /// Whether a store accessor must be bound for the request
    fn reads_store(&self) -> bool {
        self.signal().reads_store()
    }

    /// Read the request and do the work
    fn indicating(&mut self, ctx: &IndicationContext<'_>, input: &mut DataInput) -> Result<()>;

    /// Write the response
    fn responding(&mut self, ctx: &IndicationContext<'_>, output: &mut DataOutput) -> Result<()>;
}

/// Run one indication, binding a store accessor around it when it reads the store
pub fn execute(
    indication: &mut dyn Indication,
    repository: &Repository,
    session: &Arc<Session>,
    input: &mut DataInput,
) -> Result<Bytes> {
    let accessor = if indication.reads_store() { Some(repository.store().accessor()) } else { None };
    let ctx = IndicationContext { repository, session, accessor: accessor.as_ref() };

    indication.indicating(&ctx, input)?;
    end_of_request(input)?;
    let mut output = DataOutput::new();
    indication.responding(&ctx, &mut output)?;
    Ok(output.freeze())
}

/// Fail when request bytes are left over; indications call it before any side effect
fn end_of_request(input: &DataInput) -> Result<()> {
    if !input.is_empty() {
        return Err(ProtocolError::Malformed("trailing request bytes").into());
    }
    Ok(())
}

/// Open a view with a client-chosen id
#[derive(Debug, Default)]
pub struct OpenViewIndication;

impl Indication for OpenViewIndication {
    fn signal(&self) -> Signal {
        Signal::OpenView
    }

    fn indicating(&mut self, ctx: &IndicationContext<'_>, input: &mut DataInput) -> Result<()> {
        let view_id = input.read_i32()?;
        let kind = input.read_view_kind()?;
        let branch = BranchId(input.read_i32()?);
        end_of_request(input)?;
        ctx.session().open_view(view_id, kind, branch)?;
        Ok(())
    }

    fn responding(&mut self, _ctx: &IndicationContext<'_>, _output: &mut DataOutput) -> Result<()> {
        Ok(())
    }
}

/// Close a view
#[derive(Debug, Default)]
pub struct CloseViewIndication {
    closed: bool,
}

impl Indication for CloseViewIndication {
    fn signal(&self) -> Signal {
        Signal::CloseView
    }

    fn indicating(&mut self, ctx: &IndicationContext<'_>, input: &mut DataInput) -> Result<()> {
        let view_id = input.read_i32()?;
        end_of_request(input)?;
        self.closed = ctx.session().close_view(view_id);
        Ok(())
    }

    fn responding(&mut self, _ctx: &IndicationContext<'_>, output: &mut DataOutput) -> Result<()> {
        output.write_bool(self.closed);
        Ok(())
    }
}

/// Load revisions of a view by id
#[derive(Debug, Default)]
pub struct LoadRevisionIndication {
    revisions: Vec<Option<Revision>>,
}

impl Indication for LoadRevisionIndication {
    fn signal(&self) -> Signal {
        Signal::LoadRevision
    }

    fn indicating(&mut self, ctx: &IndicationContext<'_>, input: &mut DataInput) -> Result<()> {
        let view_id = input.read_i32()?;
        let list_chunk = input.read_i32()?;
        let ids = input.read_object_ids()?;
        end_of_request(input)?;
        trace!(session = ctx.session().id(), view = view_id, count = ids.len(), "load revisions");

        let view = ctx.session().view(view_id)?;
        self.revisions = ctx.repository().load_revisions(ctx.accessor()?, &view, &ids, list_chunk)?;
        Ok(())
    }

    fn responding(&mut self, _ctx: &IndicationContext<'_>, output: &mut DataOutput) -> Result<()> {
        output.write_count(self.revisions.len());
        for revision in &self.revisions {
            match revision {
                Some(revision) => {
                    output.write_bool(true);
                    output.write_revision(revision);
                }
                None => output.write_bool(false),
            }
        }
        Ok(())
    }
}

/// Load ranges of one list of a stored revision
#[derive(Debug, Default)]
pub struct LoadChunkIndication {
    chunks: Vec<Chunk>,
}

impl Indication for LoadChunkIndication {
    fn signal(&self) -> Signal {
        Signal::LoadChunk
    }

    fn indicating(&mut self, ctx: &IndicationContext<'_>, input: &mut DataInput) -> Result<()> {
        let id = input.read_object_id()?;
        let branch = BranchId(input.read_i32()?);
        let version = Version(input.read_i32()?);
        let feature = FeatureId(input.read_u16()?);
        let count = input.read_count()?;
        let mut ranges = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            ranges.push((input.read_i32()?, input.read_i32()?));
        }
        end_of_request(input)?;

        self.chunks = ctx
            .repository()
            .load_chunks(ctx.accessor()?, id, branch, version, feature, &ranges)?;
        Ok(())
    }

    fn responding(&mut self, _ctx: &IndicationContext<'_>, output: &mut DataOutput) -> Result<()> {
        output.write_count(self.chunks.len());
        for chunk in &self.chunks {
            output.write_i32(chunk.start_index());
            output.write_values(chunk.values());
        }
        Ok(())
    }
}

/// Commit a transaction view
#[derive(Debug, Default)]
pub struct CommitTransactionIndication {
    result: Option<CommitResult>,
}

impl CommitTransactionIndication {
    fn read_request(input: &mut DataInput) -> Result<CommitRequest> {
        let branch = BranchId(input.read_i32()?);

        let count = input.read_count()?;
        let mut new_objects = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            new_objects.push(input.read_revision()?);
        }

        let count = input.read_count()?;
        let mut dirty = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            dirty.push(input.read_revision_delta()?);
        }

        let count = input.read_count()?;
        let mut detached = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            detached.push((input.read_object_id()?, Version(input.read_i32()?)));
        }

        Ok(CommitRequest { branch, new_objects, dirty, detached })
    }
}

impl Indication for CommitTransactionIndication {
    fn signal(&self) -> Signal {
        Signal::CommitTransaction
    }

    fn indicating(&mut self, ctx: &IndicationContext<'_>, input: &mut DataInput) -> Result<()> {
        let view_id = input.read_i32()?;
        let request = Self::read_request(input)?;
        end_of_request(input)?;

        let view = ctx.session().view(view_id)?;
        if !view.is_transaction() {
            return Err(Error::invalid_input(format!("view {} is not a transaction", view_id)));
        }
        if request.branch != view.branch() {
            return Err(Error::invalid_input(format!("view {} works on another branch", view_id)));
        }

        let result = ctx.repository().commit(ctx.session().id(), request)?;
        // The committer holds what it just wrote
        for revision in &result.revisions {
            view.mark_loaded(revision.id());
        }
        self.result = Some(result);
        Ok(())
    }

    fn responding(&mut self, _ctx: &IndicationContext<'_>, output: &mut DataOutput) -> Result<()> {
        let result = self
            .result
            .as_ref()
            .ok_or_else(|| Error::internal("commit response without a commit"))?;
        output.write_i64(result.timestamp.0);
        output.write_count(result.id_mappings.len());
        for (temp, permanent) in &result.id_mappings {
            output.write_object_id(*temp);
            output.write_object_id(*permanent);
        }
        Ok(())
    }
}

/// Change the change subscription of a view.
///
/// A non-positive size unsubscribes `|size|` ids.
#[derive(Debug, Default)]
pub struct ChangeSubscriptionIndication;

impl Indication for ChangeSubscriptionIndication {
    fn signal(&self) -> Signal {
        Signal::ChangeSubscription
    }

    fn indicating(&mut self, ctx: &IndicationContext<'_>, input: &mut DataInput) -> Result<()> {
        let view_id = input.read_i32()?;
        let clear = input.read_bool()?;
        let size = input.read_i32()?;
        let subscribe = size > 0;
        let mut ids: Vec<ObjectId> = Vec::with_capacity((size.unsigned_abs() as usize).min(input.remaining()));
        for _ in 0..size.unsigned_abs() {
            ids.push(input.read_object_id()?);
        }
        end_of_request(input)?;

        let view = ctx.session().view(view_id)?;
        if clear {
            view.clear_change_subscription();
        }
        for id in ids {
            if subscribe {
                view.subscribe(id);
            } else {
                view.unsubscribe(id);
            }
        }
        Ok(())
    }

    fn responding(&mut self, _ctx: &IndicationContext<'_>, output: &mut DataOutput) -> Result<()> {
        output.write_bool(true);
        Ok(())
    }
}

/// List the other sessions and set the requester's subscription flag
#[derive(Debug, Default)]
pub struct RemoteSessionsIndication {
    listing: Vec<RemoteSessionInfo>,
}

impl Indication for RemoteSessionsIndication {
    fn signal(&self) -> Signal {
        Signal::RemoteSessions
    }

    fn indicating(&mut self, ctx: &IndicationContext<'_>, input: &mut DataInput) -> Result<()> {
        let subscribe = input.read_bool()?;
        end_of_request(input)?;
        self.listing = ctx.repository().sessions().remote_sessions(ctx.session().id(), subscribe);
        Ok(())
    }

    fn responding(&mut self, _ctx: &IndicationContext<'_>, output: &mut DataOutput) -> Result<()> {
        for info in &self.listing {
            output.write_i32(info.session_id);
            output.write_str(&info.user);
            output.write_bool(info.subscribed);
        }
        output.write_i32(NO_MORE_REMOTE_SESSIONS);
        Ok(())
    }
}

/// Close the session
#[derive(Debug, Default)]
pub struct CloseSessionIndication;

impl Indication for CloseSessionIndication {
    fn signal(&self) -> Signal {
        Signal::CloseSession
    }

    fn indicating(&mut self, ctx: &IndicationContext<'_>, input: &mut DataInput) -> Result<()> {
        end_of_request(input)?;
        ctx.repository().sessions().close_session(ctx.session().id());
        Ok(())
    }

    fn responding(&mut self, _ctx: &IndicationContext<'_>, _output: &mut DataOutput) -> Result<()> {
        Ok(())
    }
}

fn indication_for(signal: Signal) -> Result<Box<dyn Indication>> {
    Ok(match signal {
        Signal::CloseSession => Box::new(CloseSessionIndication),
        Signal::OpenView => Box::new(OpenViewIndication),
        Signal::CloseView => Box::new(CloseViewIndication::default()),
        Signal::LoadRevision => Box::new(LoadRevisionIndication::default()),
        Signal::LoadChunk => Box::new(LoadChunkIndication::default()),
        Signal::CommitTransaction => Box::new(CommitTransactionIndication::default()),
        Signal::ChangeSubscription => Box::new(ChangeSubscriptionIndication),
        Signal::RemoteSessions => Box::new(RemoteSessionsIndication::default()),
        Signal::OpenSession | Signal::Invalidation => {
            return Err(ProtocolError::OutOfSequence(format!("{:?} has no indication", signal)).into())
        }
    })
}

/// Server end of one client connection.
///
/// Owns the session once it is opened and turns request payloads into
/// response payloads. Errors returned by [`ServerProtocol::dispatch`] are
/// protocol violations: the session has been closed and the connection must
/// be dropped. Every other failure travels back to the client as an error
/// status.
pub struct ServerProtocol {
    repository: Arc<Repository>,
    session: Option<Arc<Session>>,
    invalidations: Option<Receiver<Invalidation>>,
}

impl ServerProtocol {
    /// Serve requests against `repository`
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository, session: None, invalidations: None }
    }

    /// Session of the connection, once opened
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Take the invalidation queue of the opened session
    pub fn take_invalidations(&mut self) -> Option<Receiver<Invalidation>> {
        self.invalidations.take()
    }

    /// Handle one request and produce its response payload
    pub fn dispatch(&mut self, signal_id: u16, payload: Bytes) -> Result<Bytes> {
        let outcome = Signal::parse(signal_id)
            .map_err(Error::from)
            .and_then(|signal| self.serve(signal, &mut DataInput::new(payload)));

        let mut output = DataOutput::new();
        match outcome {
            Ok(body) => {
                status::write_ok(&mut output);
                output.write_raw(&body);
            }
            Err(err) if err.is_fatal_to_session() => {
                warn!(signal = signal_id, error = %err, "protocol violation, closing session");
                self.close();
                return Err(err);
            }
            Err(err) => {
                debug!(signal = signal_id, error = %err, "request failed");
                status::write_error(&mut output, &err);
            }
        }
        Ok(output.freeze())
    }

    fn serve(&mut self, signal: Signal, input: &mut DataInput) -> Result<Bytes> {
        if signal == Signal::OpenSession {
            return self.open_session(input);
        }

        let session = self
            .session
            .clone()
            .ok_or_else(|| ProtocolError::OutOfSequence(format!("{:?} before the session was opened", signal)))?;
        let mut indication = indication_for(signal)?;
        trace!(session = session.id(), ?signal, "indication");
        let response = execute(indication.as_mut(), &self.repository, &session, input)?;

        if signal == Signal::CloseSession {
            self.session = None;
            self.invalidations = None;
        }
        Ok(response)
    }

    fn open_session(&mut self, input: &mut DataInput) -> Result<Bytes> {
        if self.session.is_some() {
            return Err(ProtocolError::OutOfSequence("session already open".to_string()).into());
        }
        let user = input.read_str()?;
        end_of_request(input)?;

        let (session, invalidations) = self.repository.sessions().open_session(user);
        let mut output = DataOutput::new();
        output.write_i32(session.id());
        output.write_str(self.repository.name());
        info!(session = session.id(), repository = self.repository.name(), "client session established");

        self.session = Some(session);
        self.invalidations = Some(invalidations);
        Ok(output.freeze())
    }

    /// Close the session of the connection, if any
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.repository.sessions().close_session(session.id());
        }
        self.invalidations = None;
    }
}

impl std::fmt::Debug for ServerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProtocol")
            .field("repository", &self.repository.name())
            .field("session", &self.session.as_ref().map(|s| s.id()))
            .finish()
    }
}

