//! The event vocabulary sessions exchange by posting into each other's mailbox.
//!
//! Every session type owns a bounded `tokio::sync::mpsc` channel and a single task draining
//! it; state is touched only by that task (SPEC_FULL.md §5). Cross-session communication is
//! exclusively by cloning a `Sender` and posting one of the event types below into it.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::job::StratumJobBtc;
use crate::jsonrpc::RpcLine;
use crate::session_id::SessionId;

/// Outcome of a `mining.submit`, relayed back to the owning down.
#[derive(Debug, Clone)]
pub enum SubmitStatus {
    Accept,
    Reject { code: i32, message: String },
}

/// A share as forwarded from a down to its upstream (real or fake).
#[derive(Debug, Clone)]
pub struct SubmitShare {
    pub id: Value,
    pub session_id: SessionId,
    pub full_name: String,
    pub job_id: String,
    pub extra_nonce2: String,
    pub n_time: String,
    pub nonce: String,
    pub version_mask: Option<u32>,
    pub is_fake_job: bool,
}

pub type DownSender = mpsc::Sender<DownEvent>;
pub type UpSender = mpsc::Sender<UpEvent>;
pub type ManagerSender = mpsc::Sender<ManagerEvent>;
pub type SessionManagerSender = mpsc::Sender<SessionManagerEvent>;

/// A lightweight, cloneable reference to a live DownSession: enough for an UpSession or
/// FakeUpSession to address it and to make attach-time decisions (does this down want the
/// version mask?) without touching DownSession-owned state.
#[derive(Debug, Clone)]
pub struct DownHandle {
    pub session_id: SessionId,
    pub sub_account: String,
    pub full_name: String,
    pub version_mask: u32,
    pub sender: DownSender,
}

impl DownHandle {
    pub async fn send(&self, event: DownEvent) {
        let _ = self.sender.send(event).await;
    }
}

/// Events accepted by a DownSession's mailbox.
#[derive(Debug)]
pub enum DownEvent {
    /// Attach to (or re-attach to, on failover) the given upstream.
    SetUpSession(UpSender),
    /// A fully decoded line from the miner socket.
    RecvJsonRpc(RpcLine),
    /// Raw bytes to relay verbatim to the miner (notify/set_difficulty/set_version_mask lines).
    SendBytes(Vec<u8>),
    /// Result of a previously forwarded submit.
    SubmitResponse { id: Value, status: SubmitStatus },
    /// The socket died or the upstream closed without an orderly exit.
    ConnBroken,
    /// No upstream is available and the session must be dropped (used only pre-attach).
    PoolNotReady,
    /// Cooperative shutdown.
    Exit,
}

/// Events accepted by both UpSession and FakeUpSession mailboxes (the subset downs use is
/// identical across the two; SPEC_FULL.md §4.6).
#[derive(Debug)]
pub enum UpEvent {
    AddDownSession(DownHandle),
    SubmitShare(SubmitShare),
    DownSessionBroken { session_id: SessionId },
    SendUpdateMinerNum,
    TransferDownSessions,
    UpdateFakeJob(StratumJobBtc),
    SendFakeNotify,
    ConnBroken,
    Exit,
}

/// Events accepted by an UpSessionManager.
#[derive(Debug)]
pub enum ManagerEvent {
    AddDownSession(DownHandle),
    UpSessionReady { slot: usize, handle: UpSender },
    UpSessionInitFailed { slot: usize },
    /// The up-session at `slot` tore down. Carries whatever needs to survive the slot's
    /// respawn: attached downs to re-home (to the respawned slot, or to the fake session if
    /// none remain authorized) and the last job seen, for fake-notify continuity.
    UpSessionClosed { slot: usize, down_sessions: Vec<DownHandle>, last_job: Option<StratumJobBtc> },
    UpdateMinerNum { delta: i64 },
    UpdateFakeMinerNum { delta: i64 },
    Exit,
}

/// Events accepted by the process-singleton SessionManager.
#[derive(Debug)]
pub enum SessionManagerEvent {
    AddDownSession(DownHandle),
    StopUpSessionManager { sub_account: String },
    Exit,
}
