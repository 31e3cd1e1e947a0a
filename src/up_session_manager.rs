//! Per-sub-account pool of upstream connections (C7).
//!
//! Owns a fixed-size slot vector (`pool_connection_number_per_subaccount`), each slot backed
//! by one real `UpSession` dialing through the configured pools round-robin, plus a single
//! standby `FakeUpSession` that downs attach to whenever no slot is authorized. No file in the
//! retrieved source tree names this type directly; its shape is reconstructed from every call
//! site that addresses a manager across `UpSessionBTC.go`, `FakeUpSessionBTC.go` and
//! `SessionManager.go`.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::constants::UP_SESSION_MANAGER_MAILBOX;
use crate::events::{DownHandle, ManagerEvent, ManagerSender, UpEvent, UpSender};
use crate::{fake_up_session, up_session};

struct Slot {
    up: Option<UpSender>,
    pool_index: usize,
}

pub struct UpSessionManager {
    sub_account: String,
    config: Arc<Config>,
    manager_sender: ManagerSender,
    fake: UpSender,
    slots: Vec<Slot>,
    round_robin: usize,
    authorized_count: usize,
}

pub fn spawn(sub_account: String, config: Arc<Config>) -> ManagerSender {
    let (tx, rx) = mpsc::channel(UP_SESSION_MANAGER_MAILBOX);
    let fake = fake_up_session::spawn(tx.clone(), config.clone());

    let slot_count = config.advanced.pool_connection_number_per_subaccount.max(1) as usize;
    let mut manager = UpSessionManager {
        sub_account,
        config: config.clone(),
        manager_sender: tx.clone(),
        fake,
        slots: (0..slot_count).map(|i| Slot { up: None, pool_index: i % config.pools.len().max(1) }).collect(),
        round_robin: 0,
        authorized_count: 0,
    };

    for slot in 0..manager.slots.len() {
        manager.spawn_slot(slot);
    }

    tokio::spawn(manager.run(rx));
    tx
}

impl UpSessionManager {
    fn spawn_slot(&mut self, slot: usize) {
        let pool_index = self.slots[slot].pool_index;
        // The live sender only becomes useful to this manager once the slot reports
        // `UpSessionReady`; discarding it here mirrors the source's behavior of never
        // attaching a down to an up-session that hasn't finished authorizing.
        let _ = up_session::spawn(
            self.manager_sender.clone(),
            slot,
            pool_index,
            self.sub_account.clone(),
            self.config.clone(),
        );
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ManagerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ManagerEvent::AddDownSession(down) => self.add_down_session(down).await,
                ManagerEvent::UpSessionReady { slot, handle } => self.up_session_ready(slot, handle).await,
                ManagerEvent::UpSessionInitFailed { slot } => self.respawn_slot(slot),
                ManagerEvent::UpSessionClosed { slot, down_sessions, last_job } => {
                    self.up_session_closed(slot, down_sessions, last_job).await;
                }
                ManagerEvent::UpdateMinerNum { delta } => {
                    tracing::debug!(sub_account = %self.sub_account, delta, "miner count update");
                }
                ManagerEvent::UpdateFakeMinerNum { delta } => {
                    tracing::debug!(sub_account = %self.sub_account, delta, "fake miner count update");
                }
                ManagerEvent::Exit => {
                    self.exit().await;
                    break;
                }
            }
        }
    }

    async fn add_down_session(&mut self, down: DownHandle) {
        match self.next_ready_slot() {
            Some(up) => down.send(crate::events::DownEvent::SetUpSession(up)).await,
            None => down.send(crate::events::DownEvent::SetUpSession(self.fake.clone())).await,
        }
    }

    fn next_ready_slot(&mut self) -> Option<UpSender> {
        if self.authorized_count == 0 {
            return None;
        }
        let len = self.slots.len();
        for offset in 0..len {
            let idx = (self.round_robin + offset) % len;
            if let Some(up) = &self.slots[idx].up {
                self.round_robin = (idx + 1) % len;
                return Some(up.clone());
            }
        }
        None
    }

    async fn up_session_ready(&mut self, slot: usize, handle: UpSender) {
        let was_empty = self.authorized_count == 0;
        self.slots[slot].up = Some(handle);
        self.authorized_count += 1;
        if was_empty {
            let _ = self.fake.send(UpEvent::TransferDownSessions).await;
        }
    }

    async fn up_session_closed(
        &mut self,
        slot: usize,
        down_sessions: Vec<DownHandle>,
        last_job: Option<crate::job::StratumJobBtc>,
    ) {
        if self.slots[slot].up.take().is_some() {
            self.authorized_count = self.authorized_count.saturating_sub(1);
        }
        if let Some(job) = last_job {
            let _ = self.fake.send(UpEvent::UpdateFakeJob(job)).await;
        }
        for down in down_sessions {
            self.add_down_session(down).await;
        }
        self.respawn_slot(slot);
    }

    fn respawn_slot(&mut self, slot: usize) {
        let pools = self.config.pools.len().max(1);
        self.slots[slot].pool_index = (self.slots[slot].pool_index + 1) % pools;
        self.spawn_slot(slot);
    }

    async fn exit(&mut self) {
        let _ = self.fake.send(UpEvent::Exit).await;
        for slot in &self.slots {
            if let Some(up) = &slot.up {
                let _ = up.send(UpEvent::Exit).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolInfo;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            pools: vec![PoolInfo {
                host: "127.0.0.1".into(),
                port: 1,
                sub_account: String::new(),
                password: String::new(),
            }],
            ..Config::default()
        })
    }

    fn down_handle(session_id: crate::session_id::SessionId) -> (DownHandle, mpsc::Receiver<crate::events::DownEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (
            DownHandle { session_id, sub_account: String::new(), full_name: String::new(), version_mask: 0, sender: tx },
            rx,
        )
    }

    /// Builds a manager with `slot_count` empty (un-authorized) slots, without ever dialing a
    /// real pool: the slots are populated directly rather than through `spawn_slot`.
    fn bare_manager(slot_count: usize) -> (UpSessionManager, mpsc::Receiver<UpEvent>) {
        let config = test_config();
        let (manager_tx, _manager_rx) = mpsc::channel(8);
        let (fake_tx, fake_rx) = mpsc::channel(8);
        let manager = UpSessionManager {
            sub_account: String::new(),
            config,
            manager_sender: manager_tx,
            fake: fake_tx,
            slots: (0..slot_count).map(|i| Slot { up: None, pool_index: i }).collect(),
            round_robin: 0,
            authorized_count: 0,
        };
        (manager, fake_rx)
    }

    #[tokio::test]
    async fn add_down_session_routes_to_fake_when_nothing_is_authorized() {
        let (mut manager, _fake_rx) = bare_manager(2);
        let (down, mut down_rx) = down_handle(1);
        manager.add_down_session(down).await;

        match down_rx.recv().await.unwrap() {
            crate::events::DownEvent::SetUpSession(sender) => {
                assert!(sender.same_channel(&manager.fake));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn up_session_ready_promotes_fake_only_on_first_authorized_slot() {
        let (mut manager, mut fake_rx) = bare_manager(2);
        let (up_tx, _up_rx) = mpsc::channel(8);
        manager.up_session_ready(0, up_tx.clone()).await;
        assert_eq!(manager.authorized_count, 1);
        assert!(matches!(fake_rx.try_recv(), Ok(UpEvent::TransferDownSessions)));

        manager.up_session_ready(1, up_tx).await;
        assert_eq!(manager.authorized_count, 2);
        assert!(fake_rx.try_recv().is_err(), "second ready slot must not re-promote the fake session");
    }

    #[tokio::test]
    async fn add_down_session_round_robins_across_ready_slots() {
        let (mut manager, _fake_rx) = bare_manager(2);
        let (up_tx_0, mut up_rx_0) = mpsc::channel(8);
        let (up_tx_1, mut up_rx_1) = mpsc::channel(8);
        manager.up_session_ready(0, up_tx_0).await;
        manager.up_session_ready(1, up_tx_1).await;

        let (down_a, _rx_a) = down_handle(1);
        let (down_b, _rx_b) = down_handle(2);
        manager.add_down_session(down_a).await;
        manager.add_down_session(down_b).await;

        assert!(up_rx_0.try_recv().is_ok());
        assert!(up_rx_1.try_recv().is_ok());
    }

    #[tokio::test]
    async fn up_session_closed_rehomes_downs_and_forwards_last_job() {
        let (mut manager, mut fake_rx) = bare_manager(1);
        let (up_tx, _up_rx) = mpsc::channel(8);
        manager.up_session_ready(0, up_tx).await;
        fake_rx.try_recv().ok();

        let (down, mut down_rx) = down_handle(9);
        manager.up_session_closed(0, vec![down], None).await;

        assert_eq!(manager.authorized_count, 0);
        match down_rx.recv().await.unwrap() {
            crate::events::DownEvent::SetUpSession(_) => {}
            other => panic!("expected the orphaned down to be re-homed, got {other:?}"),
        }
    }
}

