//! Per-pool upstream session (C5): one TCP (or TLS) connection to a real pool, fanned out to
//! however many downs are attached to it.
//!
//! The connect phase races a direct dial against every configured proxy candidate and keeps
//! the first to succeed, closing late arrivals (mirrors the source this was distilled from).
//! Dialing through an actual SOCKS/HTTP proxy is an external collaborator's concern (SPEC_FULL.md
//! §1); each "proxy candidate" here is a direct dial labeled with its configured proxy URL so
//! the race shape and logging match without this crate owning a proxy protocol implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::events::{
    DownHandle, ManagerEvent, ManagerSender, SubmitShare, SubmitStatus, UpEvent, UpSender,
};
use crate::job::StratumJobBtc;
use crate::jsonrpc::{parse_upstream_line, Encodable, RpcLine, RpcRequest};
use crate::pool_tls;
use crate::session_id::SessionId;

type BoxRead = Box<dyn AsyncRead + Unpin + Send + Sync>;
type BoxWrite = Box<dyn AsyncWrite + Unpin + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stat {
    Disconnected,
    Connected,
    Subscribed,
    Authorized,
    Exit,
}

struct SubmitStash {
    id: Value,
    session_id: SessionId,
}

pub struct UpSession {
    slot: usize,
    pool_index: usize,
    sub_account: String,
    config: Arc<Config>,
    manager: ManagerSender,
    self_sender: UpSender,

    down_sessions: HashMap<SessionId, DownHandle>,
    writer: Option<BoxWrite>,
    stat: Stat,

    upstream_session_id: SessionId,
    version_mask: u32,
    extra_nonce2_size: i64,
    server_cap_version_rolling: bool,
    server_cap_submit_response: bool,

    last_job: Option<StratumJobBtc>,
    rpc_set_version_mask: Option<Vec<u8>>,
    rpc_set_difficulty: Option<Vec<u8>>,

    submit_stash: HashMap<u16, SubmitStash>,
    submit_index: u16,
    disconnected_miner_counter: i64,
}

enum PoolMsg {
    Line(RpcLine),
    Broken,
}

/// Spawns the connect/init/event-loop task and hands back a mailbox immediately: AddDownSession
/// posts that arrive while still connecting simply queue.
pub fn spawn(manager: ManagerSender, slot: usize, pool_index: usize, sub_account: String, config: Arc<Config>) -> UpSender {
    let (tx, rx) = mpsc::channel(config.advanced.message_queue_size.pool_session);
    let up = UpSession {
        slot,
        pool_index,
        sub_account,
        config,
        manager,
        self_sender: tx.clone(),
        down_sessions: HashMap::new(),
        writer: None,
        stat: Stat::Disconnected,
        upstream_session_id: 0,
        version_mask: 0,
        extra_nonce2_size: 0,
        server_cap_version_rolling: false,
        server_cap_submit_response: false,
        last_job: None,
        rpc_set_version_mask: None,
        rpc_set_difficulty: None,
        submit_stash: HashMap::new(),
        submit_index: 0,
        disconnected_miner_counter: 0,
    };
    tokio::spawn(up.run(rx));
    tx
}

impl UpSession {
    async fn run(mut self, mut mailbox_rx: mpsc::Receiver<UpEvent>) {
        let lines = match self.connect_and_init().await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(slot = self.slot, "upstream init failed: {e}");
                let _ = self.manager.send(ManagerEvent::UpSessionInitFailed { slot: self.slot }).await;
                return;
            }
        };

        let (pool_tx, mut pool_rx) = mpsc::channel(16);
        tokio::spawn(read_pool_lines(lines, pool_tx));
        let _ = self
            .manager
            .send(ManagerEvent::UpSessionReady { slot: self.slot, handle: self.self_sender.clone() })
            .await;

        loop {
            tokio::select! {
                event = mailbox_rx.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_up_event(event).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                msg = pool_rx.recv() => {
                    match msg {
                        Some(PoolMsg::Line(rpc)) => self.handle_pool_line(rpc).await,
                        Some(PoolMsg::Broken) | None => {
                            self.close().await;
                            break;
                        }
                    }
                }
            }
            if self.stat == Stat::Exit {
                break;
            }
        }
    }

    async fn connect_and_init(&mut self) -> std::io::Result<Lines<BufReader<BoxRead>>> {
        let pool = &self.config.pools[self.pool_index];
        let host = pool.host.clone();
        let port = pool.port;
        let dial_timeout = self.config.advanced.pool_connection_dial_timeout_seconds.get();
        let use_tls = self.config.pool_use_tls;
        let skip_verify = self.config.advanced.tls_skip_certificate_verify;

        let mut candidates: Vec<Option<String>> = self.config.proxy.iter().cloned().map(Some).collect();
        if self.config.direct_connect_with_proxy || candidates.is_empty() {
            candidates.push(None);
        }

        let mut conn = dial_race(&candidates, &host, port, dial_timeout, use_tls, skip_verify).await;
        if conn.is_none() && !self.config.proxy.is_empty() && self.config.direct_connect_after_proxy {
            conn = dial_race(&[None], &host, port, dial_timeout, use_tls, skip_verify).await;
        }

        let (read_half, write_half) = conn.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "all dial candidates failed")
        })?;
        self.writer = Some(write_half);
        self.stat = Stat::Connected;

        let mut lines = BufReader::new(read_half).lines();
        self.send_init_requests().await?;

        loop {
            let Some(raw) = lines.next_line().await? else {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "pool closed during init"));
            };
            match parse_upstream_line(&raw) {
                Ok(rpc) => self.handle_pool_line(rpc).await,
                Err(e) => tracing::warn!("unparsable line from pool during init: {e}"),
            }
            if self.stat == Stat::Authorized {
                return Ok(lines);
            }
            if self.stat == Stat::Disconnected {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "pool rejected init handshake"));
            }
        }
    }

    async fn send_init_requests(&mut self) -> std::io::Result<()> {
        let configure = RpcRequest::new(
            json!("conf"),
            "mining.configure",
            vec![
                json!(["version-rolling"]),
                json!({"version-rolling.mask": "ffffffff", "version-rolling.min-bit-count": 0}),
            ],
        );
        self.write_line(&configure).await?;

        let subscribe = RpcRequest::new(json!("sub"), "mining.subscribe", vec![json!("btc-stratum-proxy/1.0")]);
        self.write_line(&subscribe).await?;

        let pool = &self.config.pools[self.pool_index];
        let login_sub_account =
            if self.config.multi_user_mode { self.sub_account.clone() } else { pool.sub_account.clone() };
        let password = pool.password.clone();
        let authorize =
            RpcRequest::new(json!("auth"), "mining.authorize", vec![json!(login_sub_account), json!(password)]);
        self.write_line(&authorize).await?;
        Ok(())
    }

    async fn write_line(&mut self, line: &RpcRequest) -> std::io::Result<()> {
        let bytes = line
            .to_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.write_bytes(&bytes).await
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let writer = self.writer.as_mut().expect("write attempted before connect");
        writer.write_all(bytes).await
    }

    /// Returns `true` when the run loop should stop.
    async fn handle_up_event(&mut self, event: UpEvent) -> bool {
        match event {
            UpEvent::AddDownSession(down) => {
                self.add_down_session(down).await;
                false
            }
            UpEvent::SubmitShare(share) => {
                self.handle_submit_share(share).await;
                false
            }
            UpEvent::DownSessionBroken { session_id } => {
                self.down_session_broken(session_id);
                false
            }
            UpEvent::SendUpdateMinerNum => {
                self.send_update_miner_num().await;
                false
            }
            UpEvent::TransferDownSessions | UpEvent::UpdateFakeJob(_) | UpEvent::SendFakeNotify => {
                // Only meaningful to FakeUpSession; a real up ignores them (same vocabulary,
                // SPEC_FULL.md §4.6).
                false
            }
            UpEvent::ConnBroken => {
                self.close().await;
                true
            }
            UpEvent::Exit => {
                self.close().await;
                self.stat = Stat::Exit;
                true
            }
        }
    }

    async fn add_down_session(&mut self, down: DownHandle) {
        if let Some(bytes) = &self.rpc_set_version_mask {
            if down.version_mask != 0 {
                down.send(crate::events::DownEvent::SendBytes(bytes.clone())).await;
            }
        }
        if let Some(bytes) = &self.rpc_set_difficulty {
            down.send(crate::events::DownEvent::SendBytes(bytes.clone())).await;
        }
        if let Some(job) = &self.last_job {
            if let Ok(bytes) = job.to_notify_line(true) {
                down.send(crate::events::DownEvent::SendBytes(bytes)).await;
            }
        }
        self.down_sessions.insert(down.session_id, down);
    }

    async fn handle_submit_share(&mut self, share: SubmitShare) {
        if share.is_fake_job {
            self.send_submit_response(share.session_id, share.id, SubmitStatus::Accept).await;
            return;
        }
        let Some(down) = self.down_sessions.get(&share.session_id) else { return };
        let full_name = down.full_name.clone();
        let upstream_job_id = crate::job::strip_session_prefix(&share.job_id).unwrap_or(&share.job_id).to_string();

        let id_value = json!(self.submit_index);
        let request = RpcRequest::new(
            id_value.clone(),
            "mining.submit",
            vec![json!(full_name), json!(upstream_job_id), json!(share.extra_nonce2), json!(share.n_time), json!(share.nonce)],
        );
        if self.write_line(&request).await.is_err() {
            self.close().await;
            return;
        }

        if self.config.submit_response_from_server && self.server_cap_submit_response {
            self.submit_stash.insert(self.submit_index, SubmitStash { id: share.id, session_id: share.session_id });
            self.submit_index = self.submit_index.wrapping_add(1);
        } else {
            self.send_submit_response(share.session_id, share.id, SubmitStatus::Accept).await;
        }
    }

    async fn send_submit_response(&self, session_id: SessionId, id: Value, status: SubmitStatus) {
        if let Some(down) = self.down_sessions.get(&session_id) {
            down.send(crate::events::DownEvent::SubmitResponse { id, status }).await;
        }
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
            .send(ManagerEvent::UpdateMinerNum { delta: self.disconnected_miner_counter })
            .await;
        self.disconnected_miner_counter = 0;
    }

    async fn handle_pool_line(&mut self, rpc: RpcLine) {
        if let Some(method) = rpc.method.clone() {
            match method.as_str() {
                "mining.set_version_mask" => self.handle_set_version_mask(rpc).await,
                "mining.set_difficulty" => self.handle_set_difficulty(rpc).await,
                "mining.notify" => self.handle_mining_notify(rpc).await,
                _ => tracing::debug!("ignoring pool request {method}"),
            }
            return;
        }
        let id = rpc.id.as_ref().and_then(Value::as_str).map(str::to_string);
        match id.as_deref() {
            Some("conf") => {}
            Some("sub") => self.handle_subscribe_response(&rpc).await,
            Some("auth") => self.handle_authorize_response(&rpc).await,
            Some(_) | None => self.handle_submit_response(&rpc).await,
        }
    }

    async fn handle_set_version_mask(&mut self, rpc: RpcLine) {
        // The pool sending this notification at all is the only capability signal this proxy
        // has, since no active `mining.capabilities` handshake is performed (SPEC_FULL.md §9).
        self.server_cap_version_rolling = true;
        let params = rpc.params().to_vec();
        if let Some(mask_hex) = params.first().and_then(Value::as_str) {
            match u32::from_str_radix(mask_hex, 16) {
                Ok(mask) => self.version_mask = mask,
                Err(_) => tracing::warn!("pool sent a non-hex version mask: {mask_hex}"),
            }
        }
        let line = RpcRequest::notification("mining.set_version_mask", params);
        let Ok(bytes) = line.to_line() else { return };
        self.rpc_set_version_mask = Some(bytes.clone());
        for down in self.down_sessions.values() {
            if down.version_mask != 0 {
                down.send(crate::events::DownEvent::SendBytes(bytes.clone())).await;
            }
        }
    }

    async fn handle_set_difficulty(&mut self, rpc: RpcLine) {
        if self.rpc_set_difficulty.is_some() {
            return;
        }
        let line = RpcRequest::notification("mining.set_difficulty", rpc.params().to_vec());
        let Ok(bytes) = line.to_line() else { return };
        self.rpc_set_difficulty = Some(bytes.clone());
        for down in self.down_sessions.values() {
            down.send(crate::events::DownEvent::SendBytes(bytes.clone())).await;
        }
    }

    async fn handle_mining_notify(&mut self, rpc: RpcLine) {
        let job = match StratumJobBtc::parse(rpc.params(), self.upstream_session_id) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!("bad mining.notify from pool: {e}");
                return;
            }
        };
        let Ok(bytes) = job.to_notify_line(false) else { return };
        for down in self.down_sessions.values() {
            down.send(crate::events::DownEvent::SendBytes(bytes.clone())).await;
        }
        self.last_job = Some(job);
    }

    async fn handle_subscribe_response(&mut self, rpc: &RpcLine) {
        let Some(result) = rpc.result.as_ref().and_then(Value::as_array) else {
            tracing::error!("subscribe result is not an array");
            self.stat = Stat::Disconnected;
            return;
        };
        if result.len() < 3 {
            tracing::error!("subscribe result missing items");
            self.stat = Stat::Disconnected;
            return;
        }
        let Some(session_id_hex) = result[1].as_str() else {
            self.stat = Stat::Disconnected;
            return;
        };
        let Ok(session_id) = u16::from_str_radix(session_id_hex, 16) else {
            self.stat = Stat::Disconnected;
            return;
        };
        self.upstream_session_id = session_id;

        let Some(size) = result[2].as_i64() else {
            self.stat = Stat::Disconnected;
            return;
        };
        self.extra_nonce2_size = size;
        if size != crate::constants::REQUIRED_EXTRANONCE2_SIZE {
            tracing::error!("pool extranonce2 size {size} is not the required 4 bytes");
            self.stat = Stat::Disconnected;
            return;
        }
        self.stat = Stat::Subscribed;
    }

    async fn handle_authorize_response(&mut self, rpc: &RpcLine) {
        if rpc.result.as_ref().and_then(Value::as_bool) != Some(true) {
            tracing::error!("pool authorize failed: {:?}", rpc.error);
            self.stat = Stat::Disconnected;
            return;
        }
        // Neither this proxy nor the pool runs an active capability handshake; version-rolling
        // support is inferred later, if the pool ever sends `mining.set_version_mask`.
        self.server_cap_submit_response = self.config.submit_response_from_server;
        self.stat = Stat::Authorized;
    }

    async fn handle_submit_response(&mut self, rpc: &RpcLine) {
        let Some(index) = rpc.id.as_ref().and_then(Value::as_u64) else { return };
        let Some(stash) = self.submit_stash.remove(&(index as u16)) else { return };
        let status = match rpc.error.as_ref() {
            None | Some(Value::Null) => SubmitStatus::Accept,
            Some(err) => {
                let arr = err.as_array();
                let code = arr.and_then(|a| a.first()).and_then(Value::as_i64).unwrap_or(-1) as i32;
                let message = arr
                    .and_then(|a| a.get(1))
                    .and_then(Value::as_str)
                    .unwrap_or("rejected")
                    .to_string();
                SubmitStatus::Reject { code, message }
            }
        };
        self.send_submit_response(stash.session_id, stash.id, status).await;
    }

    /// Tears down after a broken connection. Downs are handed back to the manager so it can
    /// either re-home them on a respawned slot or promote the fake session, mirroring the
    /// source this was distilled from (`close()` forwards live downs rather than dropping
    /// them, when `always_keep_downconn` is set).
    async fn close(&mut self) {
        let downs: Vec<_> = self.down_sessions.drain().map(|(_, handle)| handle).collect();
        if self.config.always_keep_downconn {
            let _ = self
                .manager
                .send(ManagerEvent::UpSessionClosed {
                    slot: self.slot,
                    down_sessions: downs,
                    last_job: self.last_job.clone(),
                })
                .await;
        } else {
            for down in &downs {
                down.send(crate::events::DownEvent::Exit).await;
            }
            let _ = self
                .manager
                .send(ManagerEvent::UpSessionClosed { slot: self.slot, down_sessions: Vec::new(), last_job: None })
                .await;
        }
        self.stat = Stat::Disconnected;
    }
}

async fn dial_race(
    candidates: &[Option<String>],
    host: &str,
    port: u16,
    timeout: Duration,
    use_tls: bool,
    skip_verify: bool,
) -> Option<(BoxRead, BoxWrite)> {
    let mut set = JoinSet::new();
    for candidate in candidates.iter().cloned() {
        let host = host.to_string();
        set.spawn(async move {
            let label = candidate.as_deref().unwrap_or("direct");
            tracing::info!("connecting to pool server [{label}]...");
            match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    tracing::warn!("[{label}] failed: {e}");
                    None
                }
                Err(_) => {
                    tracing::warn!("[{label}] timed out");
                    None
                }
            }
        });
    }

    let mut winner = None;
    while let Some(joined) = set.join_next().await {
        if let Ok(Some(stream)) = joined {
            winner = Some(stream);
            break;
        }
    }
    set.abort_all();

    let stream = winner?;
    if use_tls {
        let connector = pool_tls::connector(skip_verify);
        let server_name = match tokio_rustls::rustls::ServerName::try_from(host) {
            Ok(name) => name,
            Err(_) => return None,
        };
        match connector.connect(server_name, stream).await {
            Ok(tls) => {
                let (r, w) = tokio::io::split(tls);
                Some((Box::new(r) as BoxRead, Box::new(w) as BoxWrite))
            }
            Err(e) => {
                tracing::warn!("tls handshake failed: {e}");
                None
            }
        }
    } else {
        let (r, w) = stream.into_split();
        Some((Box::new(r) as BoxRead, Box::new(w) as BoxWrite))
    }
}

async fn read_pool_lines(mut lines: Lines<BufReader<BoxRead>>, tx: mpsc::Sender<PoolMsg>) {
    loop {
        match lines.next_line().await {
            Ok(Some(raw)) => match parse_upstream_line(&raw) {
                Ok(rpc) => {
                    if tx.send(PoolMsg::Line(rpc)).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!("unparsable line from pool: {e}"),
            },
            Ok(None) | Err(_) => {
                let _ = tx.send(PoolMsg::Broken).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolInfo;
    use crate::jsonrpc::RpcResponse;
    use tokio::io::{AsyncBufReadExt as _, BufReader as TokioBufReader};
    use tokio::net::TcpListener;

    async fn mock_pool() -> (u16, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        (listener.local_addr().unwrap().port(), listener)
    }

    fn test_config(port: u16) -> Arc<Config> {
        Arc::new(Config {
            pools: vec![PoolInfo {
                host: "127.0.0.1".into(),
                port,
                sub_account: "acct".into(),
                password: "x".into(),
            }],
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn connect_and_init_reaches_authorized_and_relays_notify() {
        let (port, listener) = mock_pool().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = TokioBufReader::new(read_half);
            for _ in 0..3 {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
            }
            let sub_reply = RpcResponse::success(Some(json!("sub")), json!([[], "00aa", 4]));
            write_half.write_all(&sub_reply.to_line().unwrap()).await.unwrap();
            let auth_reply = RpcResponse::success(Some(json!("auth")), json!(true));
            write_half.write_all(&auth_reply.to_line().unwrap()).await.unwrap();

            let notify = RpcRequest::notification(
                "mining.notify",
                vec![
                    json!("job-1"),
                    json!("00".repeat(32)),
                    json!("cb1"),
                    json!("cb2"),
                    json!([]),
                    json!("20000000"),
                    json!("1d00ffff"),
                    json!("5f000000"),
                ],
            );
            write_half.write_all(&notify.to_line().unwrap()).await.unwrap();

            // Keep the socket open for the duration of the test.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (manager_tx, mut manager_rx) = mpsc::channel(8);
        let up = spawn(manager_tx, 0, 0, "acct".to_string(), test_config(port));

        let ready = tokio::time::timeout(Duration::from_secs(2), manager_rx.recv())
            .await
            .expect("did not receive an event before the timeout")
            .expect("manager channel closed");
        match ready {
            ManagerEvent::UpSessionReady { slot, handle } => {
                assert_eq!(slot, 0);
                assert!(handle.same_channel(&up));
            }
            other => panic!("expected UpSessionReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_user_mode_authorizes_with_the_configured_pool_sub_account() {
        let (port, listener) = mock_pool().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, _write_half) = socket.into_split();
            let mut reader = TokioBufReader::new(read_half);
            let mut lines = Vec::new();
            for _ in 0..3 {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                lines.push(line);
            }
            let authorize: Value = serde_json::from_str(&lines[2]).unwrap();
            assert_eq!(authorize["params"][0], json!("acct"));
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (manager_tx, _manager_rx) = mpsc::channel(8);
        // The manager-level routing key is empty, as it always is in single-user mode
        // (the manager keys every pool on an empty sub-account string). If the authorize
        // call used this field instead of the configured pool sub-account, the pool would
        // see an empty login.
        let _up = spawn(manager_tx, 0, 0, String::new(), test_config(port));
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn connect_failure_reports_init_failed() {
        // Nothing is listening on this port.
        let (manager_tx, mut manager_rx) = mpsc::channel(8);
        let _up = spawn(manager_tx, 0, 0, "acct".to_string(), test_config(1));

        let event = tokio::time::timeout(Duration::from_secs(2), manager_rx.recv())
            .await
            .expect("did not receive an event before the timeout")
            .expect("manager channel closed");
        assert!(matches!(event, ManagerEvent::UpSessionInitFailed { slot: 0 }));
    }
}
