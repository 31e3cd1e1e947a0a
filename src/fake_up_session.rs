//! Standby upstream (C6): answers every submit with an immediate accept and, when
//! `always_keep_downconn` is set, keeps attached downs alive with a ticking fake
//! `mining.notify` until a real pool connection comes back.
//!
//! Shares `UpEvent` with `UpSession` (SPEC_FULL.md §4.6); a real up's events it has no use for
//! (`AddDownSession` aside) simply never arrive here because the manager only forwards the
//! ones that make sense to whichever of the two is currently live.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::events::{DownEvent, DownHandle, ManagerEvent, ManagerSender, SubmitStatus, UpEvent, UpSender};
use crate::job::StratumJobBtc;
use crate::session_id::SessionId;

struct FakeUpSession {
    manager: ManagerSender,
    config: Arc<Config>,
    down_sessions: HashMap<SessionId, DownHandle>,
    fake_job: Option<StratumJobBtc>,
    disconnected_miner_counter: i64,
    self_sender: UpSender,
}

pub fn spawn(manager: ManagerSender, config: Arc<Config>) -> UpSender {
    let (tx, rx) = mpsc::channel(config.advanced.message_queue_size.pool_session);
    let session = FakeUpSession {
        manager,
        config: config.clone(),
        down_sessions: HashMap::new(),
        fake_job: None,
        disconnected_miner_counter: 0,
        self_sender: tx.clone(),
    };
    tokio::spawn(session.run(rx));
    tx
}

impl FakeUpSession {
    async fn run(mut self, mut rx: mpsc::Receiver<UpEvent>) {
        if self.config.always_keep_downconn {
            let sender = self.self_sender.clone();
            let interval = self.config.advanced.fake_job_notify_interval_seconds.get();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if sender.send(UpEvent::SendFakeNotify).await.is_err() {
                        return;
                    }
                }
            });
        }

        while let Some(event) = rx.recv().await {
            match event {
                UpEvent::AddDownSession(down) => self.add_down_session(down).await,
                UpEvent::SubmitShare(share) => {
                    // Standby mode: nothing is actually mined against, so every submit is
                    // acknowledged locally (FakeUpSessionBTC.go's `handleSubmitShare`).
                    if let Some(down) = self.down_sessions.get(&share.session_id) {
                        down.send(DownEvent::SubmitResponse { id: share.id, status: SubmitStatus::Accept }).await;
                    }
                }
                UpEvent::DownSessionBroken { session_id } => self.down_session_broken(session_id),
                UpEvent::SendUpdateMinerNum => self.send_update_miner_num().await,
                UpEvent::TransferDownSessions => self.transfer_down_sessions().await,
                UpEvent::UpdateFakeJob(job) => self.fake_job = Some(job),
                UpEvent::SendFakeNotify => self.send_fake_notify().await,
                UpEvent::ConnBroken => {}
                UpEvent::Exit => {
                    for down in self.down_sessions.values() {
                        down.send(DownEvent::Exit).await;
                    }
                    break;
                }
            }
        }
    }

    async fn add_down_session(&mut self, down: DownHandle) {
        if self.config.always_keep_downconn {
            if let Some(job) = &mut self.fake_job {
                job.to_new_fake_job();
                if let Ok(bytes) = job.to_fake_notify_line(true) {
                    down.send(DownEvent::SendBytes(bytes)).await;
                }
            }
        }
        self.down_sessions.insert(down.session_id, down);
    }

    async fn transfer_down_sessions(&mut self) {
        let count = self.down_sessions.len() as i64;
        for (_, down) in self.down_sessions.drain() {
            let _ = self.manager.send(ManagerEvent::AddDownSession(down)).await;
        }
        let _ = self.manager.send(ManagerEvent::UpdateFakeMinerNum { delta: -count }).await;
    }

    fn down_session_broken(&mut self, session_id: SessionId) {
        self.down_sessions.remove(&session_id);
        if self.disconnected_miner_counter == 0 {
            let sender = self.self_sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(crate::constants::MINER_COUNT_DEBOUNCE).await;
                let _ = sender.send(UpEvent::SendUpdateMinerNum).await;
            });
        }
        self.disconnected_miner_counter += 1;
    }

    async fn send_update_miner_num(&mut self) {
        let _ = self
            .manager
            .send(ManagerEvent::UpdateFakeMinerNum { delta: -self.disconnected_miner_counter })
            .await;
        self.disconnected_miner_counter = 0;
    }

    async fn send_fake_notify(&mut self) {
        if self.down_sessions.is_empty() {
            return;
        }
        let Some(job) = &mut self.fake_job else { return };
        job.to_new_fake_job();
        let Ok(bytes) = job.to_fake_notify_line(false) else { return };
        for down in self.down_sessions.values() {
            down.send(DownEvent::SendBytes(bytes.clone())).await;
        }
    }
}
