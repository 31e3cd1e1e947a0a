//! Per-miner session state machine (C4).
//!
//! One task owns the socket's write half and all mutable state; a sibling reader task turns
//! incoming lines into `DownEvent::RecvJsonRpc` posts. No other task ever touches this
//! session's fields, so nothing here needs a lock (SPEC_FULL.md §5).

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::constants::{
    ASICBOOST_LOST_THRESHOLD, DEFAULT_WORKER_NAME, DOWN_SESSION_MAILBOX, ERR_DUPLICATE_SUBSCRIBED,
    ERR_ILLEGAL_PARAMS, ERR_NEED_AUTHORIZED, ERR_NEED_SUBSCRIBED, ERR_SUBACCOUNT_EMPTY,
    ERR_TOO_FEW_PARAMS, ERR_WORKER_NAME_NOT_STRING,
};
use crate::events::{DownEvent, DownHandle, SubmitShare, SubmitStatus, UpEvent, UpSender};
use crate::job::is_fake_job_id;
use crate::jsonrpc::{Encodable, RpcLine, RpcRequest, RpcResponse};
use crate::session_id::{SessionId, SessionIdAllocator};
use crate::worker_name::{filter_worker_name, ip_as_worker_name, split_sub_account};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownStat {
    Connected,
    Subscribed,
    Authorized,
    Disconnected,
    Exit,
}

/// What the owning task should do once an event has been handled.
enum Flow {
    Continue,
    Stop,
}

struct DownSession {
    session_id: SessionId,
    remote_addr: SocketAddr,
    stat: DownStat,
    client_agent: String,
    full_name: String,
    sub_account_name: String,
    worker_name: String,
    version_mask: u32,
    version_rolling_share_counter: u64,
    up: Option<UpSender>,
    config: Arc<Config>,
    id_allocator: Arc<SessionIdAllocator>,
    on_authorized: mpsc::Sender<DownHandle>,
    self_sender: mpsc::Sender<DownEvent>,
    write_half: tokio::net::tcp::OwnedWriteHalf,
}

/// Spawns the reader and owning tasks for one freshly accepted miner connection.
///
/// `on_authorized` is the channel the SessionManager (or anything standing in for it in a
/// test) listens on to learn that this down finished its handshake and is ready to be routed
/// to a sub-account's UpSessionManager.
pub fn spawn(
    socket: TcpStream,
    remote_addr: SocketAddr,
    session_id: SessionId,
    config: Arc<Config>,
    id_allocator: Arc<SessionIdAllocator>,
    on_authorized: mpsc::Sender<DownHandle>,
) {
    let (read_half, write_half) = socket.into_split();
    let (tx, rx) = mpsc::channel(DOWN_SESSION_MAILBOX);

    let reader_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match crate::jsonrpc::parse_line(&line) {
                        Ok(rpc) => {
                            if reader_tx.send(DownEvent::RecvJsonRpc(rpc)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("dropping unparsable line from miner: {e}");
                        }
                    }
                }
                Ok(None) => {
                    let _ = reader_tx.send(DownEvent::ConnBroken).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!("miner read error: {e}");
                    let _ = reader_tx.send(DownEvent::ConnBroken).await;
                    return;
                }
            }
        }
    });

    let mut session = DownSession {
        session_id,
        remote_addr,
        stat: DownStat::Connected,
        client_agent: String::new(),
        full_name: String::new(),
        sub_account_name: String::new(),
        worker_name: String::new(),
        version_mask: 0,
        version_rolling_share_counter: 0,
        up: None,
        config,
        id_allocator,
        on_authorized,
        self_sender: tx,
        write_half,
    };

    tokio::spawn(async move {
        session.run(rx).await;
    });
}

impl DownSession {
    async fn run(&mut self, mut rx: mpsc::Receiver<DownEvent>) {
        while let Some(event) = rx.recv().await {
            match self.handle_event(event).await {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if self.stat != DownStat::Exit {
            if let Some(up) = &self.up {
                let _ = up.send(UpEvent::DownSessionBroken { session_id: self.session_id }).await;
            }
        }
        self.id_allocator.free(self.session_id);
    }

    async fn handle_event(&mut self, event: DownEvent) -> Flow {
        match event {
            DownEvent::SetUpSession(up) => {
                let handle = self.handle();
                let _ = up.send(UpEvent::AddDownSession(handle)).await;
                self.up = Some(up);
                Flow::Continue
            }
            DownEvent::RecvJsonRpc(rpc) => {
                self.handle_rpc(rpc).await;
                Flow::Continue
            }
            DownEvent::SendBytes(bytes) => {
                if self.write_half.write_all(&bytes).await.is_err() {
                    self.stat = DownStat::Disconnected;
                    return Flow::Stop;
                }
                Flow::Continue
            }
            DownEvent::SubmitResponse { id, status } => {
                let line = match status {
                    SubmitStatus::Accept => RpcResponse::success(Some(id), json!(true)),
                    SubmitStatus::Reject { code, message } => RpcResponse::reject(Some(id), code, &message),
                };
                self.write_line(&line).await;
                Flow::Continue
            }
            DownEvent::ConnBroken => {
                self.stat = DownStat::Disconnected;
                Flow::Stop
            }
            DownEvent::PoolNotReady => {
                self.stat = DownStat::Disconnected;
                Flow::Stop
            }
            DownEvent::Exit => {
                self.stat = DownStat::Exit;
                Flow::Stop
            }
        }
    }

    fn handle(&self) -> DownHandle {
        DownHandle {
            session_id: self.session_id,
            sub_account: self.sub_account_name.clone(),
            full_name: self.full_name.clone(),
            version_mask: self.version_mask,
            sender: self.self_sender.clone(),
        }
    }

    async fn write_line(&mut self, line: &impl Encodable) {
        match line.to_line() {
            Ok(bytes) => {
                if self.write_half.write_all(&bytes).await.is_err() {
                    self.stat = DownStat::Disconnected;
                }
            }
            Err(e) => tracing::error!("failed to encode reply to miner: {e}"),
        }
    }

    async fn handle_rpc(&mut self, rpc: RpcLine) {
        let Some(method) = rpc.method.clone() else { return };
        let id = rpc.id.clone();
        match method.as_str() {
            "mining.subscribe" => self.handle_subscribe(id, rpc.params()).await,
            "mining.configure" => self.handle_configure(id, rpc.params()).await,
            "mining.authorize" => self.handle_authorize(id, rpc.params()).await,
            "mining.submit" => self.handle_submit(id, rpc.params()).await,
            "mining.multi_version" | "mining.suggest_difficulty" => {
                self.write_line(&RpcResponse::error(id, &ERR_ILLEGAL_PARAMS, None)).await;
            }
            _ => {
                self.write_line(&RpcResponse::error(id, &ERR_ILLEGAL_PARAMS, None)).await;
            }
        }
    }

    async fn handle_subscribe(&mut self, id: Option<Value>, params: &[Value]) {
        if self.stat != DownStat::Connected {
            self.write_line(&RpcResponse::error(id, &ERR_DUPLICATE_SUBSCRIBED, None)).await;
            return;
        }
        if let Some(agent) = params.first().and_then(Value::as_str) {
            self.client_agent = agent.to_string();
        }
        let hex_id = format!("{:08x}", self.session_id);
        let result = json!([
            [["mining.set_difficulty", hex_id], ["mining.notify", hex_id]],
            hex_id,
            4
        ]);
        self.write_line(&RpcResponse::success(id, result)).await;
        self.stat = DownStat::Subscribed;
    }

    async fn handle_configure(&mut self, id: Option<Value>, params: &[Value]) {
        if params.len() < 2 {
            self.write_line(&RpcResponse::error(id, &ERR_TOO_FEW_PARAMS, None)).await;
            return;
        }
        let mask_hex = params[1].get("version-rolling.mask").and_then(Value::as_str);
        let Some(mask_hex) = mask_hex else { return };
        let Ok(mask) = u32::from_str_radix(mask_hex, 16) else { return };
        if mask != 0 {
            self.version_mask = mask;
            let result = json!({
                "version-rolling": true,
                "version-rolling.mask": format!("{mask:08x}"),
            });
            self.write_line(&RpcResponse::success(id, result)).await;
        }
    }

    async fn handle_authorize(&mut self, id: Option<Value>, params: &[Value]) {
        if self.stat != DownStat::Subscribed && self.stat != DownStat::Authorized {
            self.write_line(&RpcResponse::error(id, &ERR_NEED_SUBSCRIBED, None)).await;
            return;
        }
        let Some(raw_name) = params.first() else {
            self.write_line(&RpcResponse::error(id, &ERR_TOO_FEW_PARAMS, None)).await;
            return;
        };
        let Some(raw_name) = raw_name.as_str() else {
            self.write_line(&RpcResponse::error(id, &ERR_WORKER_NAME_NOT_STRING, None)).await;
            return;
        };

        let filtered = filter_worker_name(raw_name);
        let (split_sub, split_worker) = split_sub_account(&filtered);
        let mut sub_account = split_sub.to_string();
        let mut worker = split_worker.to_string();

        if self.config.use_ip_as_worker_name {
            worker = ip_as_worker_name(&self.config.ip_worker_name_format, self.remote_addr.ip());
        }
        if !self.config.fixed_worker_name.is_empty() {
            worker = self.config.fixed_worker_name.clone();
        }
        if self.config.multi_user_mode {
            if sub_account.is_empty() {
                self.write_line(&RpcResponse::error(id, &ERR_SUBACCOUNT_EMPTY, None)).await;
                return;
            }
        } else {
            sub_account.clear();
        }
        if worker.is_empty() {
            worker = DEFAULT_WORKER_NAME.to_string();
        }

        let full_name =
            if sub_account.is_empty() { worker.clone() } else { format!("{sub_account}.{worker}") };

        self.sub_account_name = sub_account;
        self.worker_name = worker;
        self.full_name = full_name;
        self.stat = DownStat::Authorized;

        self.write_line(&RpcResponse::success(id, json!(true))).await;
        let _ = self.on_authorized.send(self.handle()).await;
    }

    async fn handle_submit(&mut self, id: Option<Value>, params: &[Value]) {
        if self.stat != DownStat::Authorized {
            self.write_line(&RpcResponse::error(id.clone(), &ERR_NEED_AUTHORIZED, None)).await;
            self.send_reconnect().await;
            return;
        }
        if params.len() < 5 {
            self.write_line(&RpcResponse::error(id, &ERR_TOO_FEW_PARAMS, None)).await;
            return;
        }
        let Some(up) = self.up.clone() else {
            self.write_line(&RpcResponse::error(id, &crate::constants::ERR_JOB_NOT_FOUND, None)).await;
            return;
        };
        let job_id = params[1].as_str().unwrap_or_default().to_string();
        let version_mask = params
            .get(5)
            .and_then(Value::as_str)
            .and_then(|hex| u32::from_str_radix(hex, 16).ok());

        match version_mask {
            Some(_) => self.version_rolling_share_counter += 1,
            None if self.version_rolling_share_counter > ASICBOOST_LOST_THRESHOLD => {
                if self.config.disconnect_when_lost_asicboost {
                    self.send_reconnect().await;
                }
            }
            None => {}
        }

        let share = SubmitShare {
            id: id.unwrap_or(Value::Null),
            session_id: self.session_id,
            full_name: self.full_name.clone(),
            job_id: job_id.clone(),
            extra_nonce2: params[2].as_str().unwrap_or_default().to_string(),
            n_time: params[3].as_str().unwrap_or_default().to_string(),
            nonce: params[4].as_str().unwrap_or_default().to_string(),
            version_mask,
            is_fake_job: is_fake_job_id(&job_id),
        };
        let _ = up.send(UpEvent::SubmitShare(share)).await;
    }

    async fn send_reconnect(&mut self) {
        self.write_line(&RpcRequest::notification("client.reconnect", vec![])).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt as _, BufReader as TokioBufReader};
    use tokio::net::TcpListener;

    /// Spawns a DownSession against a loopback socket pair and hands back the miner-side
    /// socket plus the channel that fires once authorize succeeds.
    async fn spawn_session(config: Config) -> (TcpStream, mpsc::Receiver<DownHandle>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_socket, remote_addr) = listener.accept().await.unwrap();

        let id_allocator = Arc::new(SessionIdAllocator::new(crate::constants::MAX_SESSION_ID));
        let session_id = id_allocator.alloc().unwrap();
        let (authorized_tx, authorized_rx) = mpsc::channel(1);
        spawn(server_socket, remote_addr, session_id, Arc::new(config), id_allocator, authorized_tx);
        (client, authorized_rx)
    }

    async fn write_line(client: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) {
        client.write_all(line.as_bytes()).await.unwrap();
        client.write_all(b"\n").await.unwrap();
    }

    async fn read_line(reader: &mut TokioBufReader<tokio::net::tcp::OwnedReadHalf>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn subscribe_then_authorize_reaches_on_authorized() {
        let (client, mut authorized_rx) = spawn_session(Config::default()).await;
        let (read_half, mut write_half) = client.into_split();
        let mut reader = TokioBufReader::new(read_half);

        write_line(&mut write_half, r#"{"id":1,"method":"mining.subscribe","params":["cgminer/1.0"]}"#).await;
        let reply = read_line(&mut reader).await;
        assert!(reply["result"].is_array());

        write_line(&mut write_half, r#"{"id":2,"method":"mining.authorize","params":["account.worker","x"]}"#)
            .await;
        let reply = read_line(&mut reader).await;
        assert_eq!(reply["result"], json!(true));

        let handle = authorized_rx.recv().await.expect("authorize should notify the manager");
        assert_eq!(handle.full_name, "account.worker");
    }

    #[tokio::test]
    async fn authorize_before_subscribe_is_rejected() {
        let (client, _authorized_rx) = spawn_session(Config::default()).await;
        let (read_half, mut write_half) = client.into_split();
        let mut reader = TokioBufReader::new(read_half);

        write_line(&mut write_half, r#"{"id":1,"method":"mining.authorize","params":["account.worker","x"]}"#)
            .await;
        let reply = read_line(&mut reader).await;
        assert!(reply["error"].is_array());
    }

    #[tokio::test]
    async fn submit_before_authorize_sends_reconnect_instead_of_forwarding() {
        let (client, _authorized_rx) = spawn_session(Config::default()).await;
        let (read_half, mut write_half) = client.into_split();
        let mut reader = TokioBufReader::new(read_half);

        write_line(
            &mut write_half,
            r#"{"id":1,"method":"mining.submit","params":["a","job","00000000","5f000000","00000000"]}"#,
        )
        .await;
        let error_reply = read_line(&mut reader).await;
        assert!(error_reply["error"].is_array());
        let reconnect = read_line(&mut reader).await;
        assert_eq!(reconnect["method"], json!("client.reconnect"));
    }

    #[tokio::test]
    async fn single_user_mode_clears_sub_account_from_authorize() {
        let config = Config { multi_user_mode: false, ..Config::default() };
        let (client, mut authorized_rx) = spawn_session(config).await;
        let (read_half, mut write_half) = client.into_split();
        let mut reader = TokioBufReader::new(read_half);

        write_line(&mut write_half, r#"{"id":1,"method":"mining.subscribe","params":["cgminer/1.0"]}"#).await;
        read_line(&mut reader).await;
        write_line(&mut write_half, r#"{"id":2,"method":"mining.authorize","params":["account.worker","x"]}"#)
            .await;
        read_line(&mut reader).await;

        let handle = authorized_rx.recv().await.unwrap();
        assert_eq!(handle.sub_account, "");
    }

    #[tokio::test]
    async fn multi_user_mode_rejects_empty_sub_account() {
        let config = Config { multi_user_mode: true, ..Config::default() };
        let (client, _authorized_rx) = spawn_session(config).await;
        let (read_half, mut write_half) = client.into_split();
        let mut reader = TokioBufReader::new(read_half);

        write_line(&mut write_half, r#"{"id":1,"method":"mining.subscribe","params":["cgminer/1.0"]}"#).await;
        read_line(&mut reader).await;
        write_line(&mut write_half, r#"{"id":2,"method":"mining.authorize","params":["worker_only","x"]}"#).await;
        let reply = read_line(&mut reader).await;
        assert!(reply["error"].is_array());
    }

    #[tokio::test]
    async fn use_ip_as_worker_name_keeps_the_miner_supplied_sub_account() {
        let config = Config {
            multi_user_mode: true,
            use_ip_as_worker_name: true,
            ip_worker_name_format: "{1}x{2}x{3}x{4}".to_string(),
            ..Config::default()
        };
        let (client, mut authorized_rx) = spawn_session(config).await;
        let (read_half, mut write_half) = client.into_split();
        let mut reader = TokioBufReader::new(read_half);

        write_line(&mut write_half, r#"{"id":1,"method":"mining.subscribe","params":["cgminer/1.0"]}"#).await;
        read_line(&mut reader).await;
        write_line(&mut write_half, r#"{"id":2,"method":"mining.authorize","params":["account.worker","x"]}"#)
            .await;
        let reply = read_line(&mut reader).await;
        assert_eq!(reply["result"], json!(true));

        let handle = authorized_rx.recv().await.unwrap();
        assert_eq!(handle.sub_account, "account");
        assert_eq!(handle.full_name, "account.127x0x0x1");
    }

    #[tokio::test]
    async fn fixed_worker_name_rebuilds_full_name_with_the_override() {
        let config = Config { fixed_worker_name: "rig".to_string(), ..Config::default() };
        let (client, mut authorized_rx) = spawn_session(config).await;
        let (read_half, mut write_half) = client.into_split();
        let mut reader = TokioBufReader::new(read_half);

        write_line(&mut write_half, r#"{"id":1,"method":"mining.subscribe","params":["cgminer/1.0"]}"#).await;
        read_line(&mut reader).await;
        write_line(&mut write_half, r#"{"id":2,"method":"mining.authorize","params":["account.worker","x"]}"#)
            .await;
        read_line(&mut reader).await;

        let handle = authorized_rx.recv().await.unwrap();
        assert_eq!(handle.full_name, "rig");
    }

    #[tokio::test]
    async fn submit_reject_reply_carries_a_null_result_and_accept_carries_a_null_error() {
        let (client, mut authorized_rx) = spawn_session(Config::default()).await;
        let (read_half, mut write_half) = client.into_split();
        let mut reader = TokioBufReader::new(read_half);

        write_line(&mut write_half, r#"{"id":1,"method":"mining.subscribe","params":["cgminer/1.0"]}"#).await;
        read_line(&mut reader).await;
        write_line(&mut write_half, r#"{"id":2,"method":"mining.authorize","params":["account.worker","x"]}"#)
            .await;
        let auth_reply = read_line(&mut reader).await;
        assert_eq!(auth_reply["error"], Value::Null);

        let handle = authorized_rx.recv().await.unwrap();
        handle.send(DownEvent::SubmitResponse { id: json!(7), status: SubmitStatus::Accept }).await;
        let accept_reply = read_line(&mut reader).await;
        assert_eq!(accept_reply, json!({"id": 7, "result": true, "error": null}));

        handle
            .send(DownEvent::SubmitResponse {
                id: json!(8),
                status: SubmitStatus::Reject { code: 21, message: "Job not found (=stale)".to_string() },
            })
            .await;
        let reject_reply = read_line(&mut reader).await;
        assert_eq!(reject_reply["result"], Value::Null);
        assert_eq!(reject_reply["error"], json!([21, "Job not found (=stale)", null]));
    }
}
