//! Process-singleton listener and sub-account router (C8).
//!
//! One `SessionIdAllocator` serves every accepted connection; each sub-account gets its own
//! `UpSessionManager`, created lazily on first sight (or eagerly for the empty sub-account in
//! single-user mode, exactly as `SessionManager.go`'s `Run()` does).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::constants::{MAX_SESSION_ID, SESSION_MANAGER_MAILBOX};
use crate::events::{DownHandle, ManagerEvent, ManagerSender, SessionManagerEvent};
use crate::session_id::SessionIdAllocator;
use crate::{down_session, up_session_manager};

pub struct SessionManager {
    config: Arc<Config>,
    up_session_managers: HashMap<String, ManagerSender>,
}

/// Starts the listener and the event loop. Runs until the listener errors out or the process
/// is asked to stop (the caller selects against `tokio::signal::ctrl_c()` alongside this).
pub async fn run(config: Arc<Config>) -> std::io::Result<()> {
    let (tx, rx) = mpsc::channel(SESSION_MANAGER_MAILBOX);
    let id_allocator = Arc::new(SessionIdAllocator::new(MAX_SESSION_ID));

    let mut manager = SessionManager { config: config.clone(), up_session_managers: HashMap::new() };

    if !config.multi_user_mode {
        let handle = up_session_manager::spawn(String::new(), config.clone());
        manager.up_session_managers.insert(String::new(), handle);
    }

    let listener = TcpListener::bind((config.agent_listen_ip.as_str(), config.agent_listen_port)).await?;
    tracing::info!("listening on {}:{}", config.agent_listen_ip, config.agent_listen_port);

    tokio::spawn(manager.run_event_loop(rx));

    loop {
        let (socket, remote_addr) = listener.accept().await?;
        let session_id = match id_allocator.alloc() {
            Ok(id) => id,
            Err(_) => {
                tracing::warn!("session id space exhausted, dropping connection from {remote_addr}");
                drop(socket);
                continue;
            }
        };
        let (authorized_tx, mut authorized_rx) = mpsc::channel::<DownHandle>(1);
        down_session::spawn(socket, remote_addr, session_id, config.clone(), id_allocator.clone(), authorized_tx);

        let route_to = tx.clone();
        tokio::spawn(async move {
            if let Some(down) = authorized_rx.recv().await {
                let _ = route_to.send(SessionManagerEvent::AddDownSession(down)).await;
            }
        });
    }
}

impl SessionManager {
    async fn run_event_loop(mut self, mut rx: mpsc::Receiver<SessionManagerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                SessionManagerEvent::AddDownSession(down) => self.add_down_session(down).await,
                SessionManagerEvent::StopUpSessionManager { sub_account } => {
                    if let Some(handle) = self.up_session_managers.remove(&sub_account) {
                        let _ = handle.send(ManagerEvent::Exit).await;
                    }
                }
                SessionManagerEvent::Exit => {
                    for handle in self.up_session_managers.values() {
                        let _ = handle.send(ManagerEvent::Exit).await;
                    }
                    break;
                }
            }
        }
    }

    async fn add_down_session(&mut self, down: DownHandle) {
        let sub_account = down.sub_account.clone();
        let handle = self
            .up_session_managers
            .entry(sub_account.clone())
            .or_insert_with(|| up_session_manager::spawn(sub_account, self.config.clone()))
            .clone();
        let _ = handle.send(ManagerEvent::AddDownSession(down)).await;
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

    fn down_handle(sub_account: &str) -> DownHandle {
        let (tx, _rx) = mpsc::channel(8);
        DownHandle { session_id: 1, sub_account: sub_account.to_string(), full_name: String::new(), version_mask: 0, sender: tx }
    }

    #[tokio::test]
    async fn add_down_session_lazily_creates_one_manager_per_sub_account() {
        let mut manager = SessionManager { config: test_config(), up_session_managers: HashMap::new() };

        manager.add_down_session(down_handle("alice")).await;
        manager.add_down_session(down_handle("bob")).await;
        manager.add_down_session(down_handle("alice")).await;

        assert_eq!(manager.up_session_managers.len(), 2);
        assert!(manager.up_session_managers.contains_key("alice"));
        assert!(manager.up_session_managers.contains_key("bob"));
    }
}
