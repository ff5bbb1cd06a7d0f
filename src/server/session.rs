//! Per-connection protocol state.
//!
//! A [`Session`] tracks one accepted connection: its handshake state,
//! the table of open transactions, the subscription-id to
//! transaction-id mapping, and the track/liveness bookkeeping. The
//! engine owns every session and drives it; the session itself only
//! knows how to validate transaction transitions and queue outbound
//! lines.

use std::collections::HashMap;

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::proto::wire::{self, Notice};
use crate::proto::{Cmd, FailReason, ProtoError};
use crate::sd::{ClientId, SubscriptionId};
use crate::transport::Stream;

use super::ConnId;

pub type TaId = u64;

/// Fatal, connection-terminating conditions. Per-command failures are
/// not errors at this level; they become `fail` messages and the
/// session stays up.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("transaction id {0} is already in use on this connection")]
    DuplicateTransaction(TaId),
    #[error("message addresses unknown transaction id {0}")]
    UnknownTransaction(TaId),
    #[error("inform message in \"{cmd}\" transaction {ta_id}")]
    UnexpectedInform { cmd: &'static str, ta_id: TaId },
}

/// An open multi-response or two-way transaction. Single-response
/// transactions conclude within the turn that received them and are
/// never stored.
#[derive(Clone, Copy, Debug)]
pub struct OpenTransaction {
    pub cmd: Cmd,
}

pub struct Session {
    pub conn: ConnId,
    pub peer_addr: String,
    pub user_id: String,
    writer: Sender<String>,
    /// A handle on the transport, used only to shut it down; reads and
    /// writes belong to the connection's own threads.
    closer: Stream,
    pub connected_at_ms: u64,
    pub last_activity_ms: u64,
    pub client_id: Option<ClientId>,
    pub proto_version: Option<u16>,
    pub handshaked: bool,
    /// The first hello's (client-id, min, max); a repeat hello must
    /// carry the identical triple.
    pub first_hello: Option<(u64, u64, u64)>,
    open_tas: HashMap<TaId, OpenTransaction>,
    pub sub_tas: HashMap<SubscriptionId, TaId>,
    pub track_ta: Option<TaId>,
    pub track_query_at_ms: Option<u64>,
    pub track_latency_ms: Option<u64>,
}

impl Session {
    pub fn new(
        conn: ConnId,
        peer_addr: String,
        user_id: String,
        writer: Sender<String>,
        closer: Stream,
        now_ms: u64,
    ) -> Self {
        Self {
            conn,
            peer_addr,
            user_id,
            writer,
            closer,
            connected_at_ms: now_ms,
            last_activity_ms: now_ms,
            client_id: None,
            proto_version: None,
            handshaked: false,
            first_hello: None,
            open_tas: HashMap::new(),
            sub_tas: HashMap::new(),
            track_ta: None,
            track_query_at_ms: None,
            track_latency_ms: None,
        }
    }

    /// Log identity: the client id in hex once known.
    pub fn ident(&self) -> String {
        match self.client_id {
            Some(client_id) => format!("{client_id:#x}"),
            None => "unknown".to_string(),
        }
    }

    /// Queue one wire line. Send failures are not reported here; a dead
    /// peer surfaces through the reader side as a disconnect event.
    pub fn send(&self, line: String) {
        let _ = self.writer.send(line);
    }

    pub fn send_fail(&self, cmd: Cmd, ta_id: TaId, reason: FailReason) {
        self.send(wire::encode_fail(cmd, ta_id, Some(reason)));
    }

    pub fn send_complete(&self, cmd: Cmd, ta_id: TaId) {
        self.send(wire::encode_complete(cmd, ta_id));
    }

    pub fn send_accept(&self, cmd: Cmd, ta_id: TaId) {
        self.send(wire::encode_accept(cmd, ta_id));
    }

    pub fn send_notify(&self, cmd: Cmd, ta_id: TaId, notice: &Notice) {
        self.send(wire::encode_notify(cmd, ta_id, notice));
    }

    /// Validate a fresh request's transaction id.
    pub fn begin_request(&self, ta_id: TaId) -> Result<(), SessionError> {
        if self.open_tas.contains_key(&ta_id) {
            return Err(SessionError::DuplicateTransaction(ta_id));
        }
        Ok(())
    }

    /// Record a transaction that stays open past this turn.
    pub fn open_transaction(&mut self, ta_id: TaId, cmd: Cmd) {
        self.open_tas.insert(ta_id, OpenTransaction { cmd });
    }

    pub fn close_transaction(&mut self, ta_id: TaId) {
        self.open_tas.remove(&ta_id);
        if self.track_ta == Some(ta_id) {
            self.track_ta = None;
            self.track_query_at_ms = None;
        }
    }

    pub fn open_transaction_cmd(&self, ta_id: TaId) -> Option<Cmd> {
        self.open_tas.get(&ta_id).map(|ta| ta.cmd)
    }

    /// Whether the connection has a live track transaction.
    pub fn is_tracked(&self) -> bool {
        self.track_ta
            .is_some_and(|ta_id| self.open_tas.contains_key(&ta_id))
    }

    pub fn has_outstanding_track_query(&self) -> bool {
        self.is_tracked() && self.track_query_at_ms.is_some()
    }
}

impl Drop for Session {
    /// Dropping the session is how the engine terminates a connection:
    /// the transport is shut down, the reader unblocks on EOF, and the
    /// writer exits once every queue handle is gone.
    fn drop(&mut self) {
        let _ = self.closer.shutdown();
    }
}
