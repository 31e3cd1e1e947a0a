//! Parsed `mining.notify` payloads, downstream re-emission, and fake-job minting.

use serde_json::{json, Value};

use crate::constants::FAKE_JOB_ID_PREFIX;
use crate::errors::ProxyError;
use crate::jsonrpc::{Encodable, RpcRequest};
use crate::session_id::SessionId;

/// A `mining.notify` payload as received from the pool, plus the upstream session id that
/// must be woven into the job id sent to miners so that a later submit can be routed back to
/// the exact upstream job without a lookup table.
#[derive(Debug, Clone)]
pub struct StratumJobBtc {
    pub upstream_job_id: String,
    pub prev_hash: Value,
    pub coinbase1: Value,
    pub coinbase2: Value,
    pub merkle_branches: Value,
    pub version: Value,
    pub n_bits: Value,
    pub n_time: Value,
    upstream_session_id: SessionId,
    fake_counter: u64,
}

impl StratumJobBtc {
    /// Parses `params` from an upstream `mining.notify` line. `upstream_session_id` is this
    /// up-session's own pool-assigned session id, stitched into the job id sent downstream.
    pub fn parse(params: &[Value], upstream_session_id: SessionId) -> Result<Self, ProxyError> {
        if params.len() < 8 {
            return Err(ProxyError::ProtocolViolation("mining.notify: too few params".into()));
        }
        let upstream_job_id = params[0]
            .as_str()
            .ok_or_else(|| ProxyError::ProtocolViolation("mining.notify: job id not a string".into()))?
            .to_string();
        Ok(Self {
            upstream_job_id,
            prev_hash: params[1].clone(),
            coinbase1: params[2].clone(),
            coinbase2: params[3].clone(),
            merkle_branches: params[4].clone(),
            version: params[5].clone(),
            n_bits: params[6].clone(),
            n_time: params[7].clone(),
            upstream_session_id,
            fake_counter: 0,
        })
    }

    /// Job id relayed to miners: upstream session id folded into a hex prefix so a submit
    /// referencing it never collides across up-sessions sharing a fake-job pool.
    fn downstream_job_id(&self) -> String {
        format!("{:04x}{}", self.upstream_session_id, self.upstream_job_id)
    }

    fn fake_job_id(&self) -> String {
        format!("{}{:04x}-{}", FAKE_JOB_ID_PREFIX, self.upstream_session_id, self.fake_counter)
    }

    /// Renders the canonical downstream `mining.notify` line.
    pub fn to_notify_line(&self, clean_jobs: bool) -> Result<Vec<u8>, ProxyError> {
        self.render(self.downstream_job_id(), clean_jobs)
    }

    /// Renders a fake notify line using the current fake-job id (call `to_new_fake_job` first
    /// to roll it to a fresh id).
    pub fn to_fake_notify_line(&self, clean_jobs: bool) -> Result<Vec<u8>, ProxyError> {
        self.render(self.fake_job_id(), clean_jobs)
    }

    /// Rolls to a new fake job id so repeated keep-alive notifies are each individually
    /// recognizable (and so any stale outstanding submit against an older fake id still
    /// matches the sentinel prefix test below).
    pub fn to_new_fake_job(&mut self) {
        self.fake_counter = self.fake_counter.wrapping_add(1);
    }

    fn render(&self, job_id: String, clean_jobs: bool) -> Result<Vec<u8>, ProxyError> {
        let params = vec![
            Value::String(job_id),
            self.prev_hash.clone(),
            self.coinbase1.clone(),
            self.coinbase2.clone(),
            self.merkle_branches.clone(),
            self.version.clone(),
            self.n_bits.clone(),
            self.n_time.clone(),
            json!(clean_jobs),
        ];
        RpcRequest::notification("mining.notify", params).to_line()
    }
}

/// True if `job_id` (as received in a miner's `mining.submit`) names a proxy-minted fake job:
/// such shares are ACKed locally and never forwarded upstream.
pub fn is_fake_job_id(job_id: &str) -> bool {
    job_id.starts_with(FAKE_JOB_ID_PREFIX)
}

/// Strips the leading 4-hex upstream-session prefix a real downstream job id carries,
/// returning the original upstream job id to submit back to the pool.
pub fn strip_session_prefix(downstream_job_id: &str) -> Option<&str> {
    if downstream_job_id.len() >= 4 && downstream_job_id.is_char_boundary(4) {
        Some(&downstream_job_id[4..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> Vec<Value> {
        vec![
            json!("upstream-job-1"),
            json!("00".repeat(32)),
            json!("cb1"),
            json!("cb2"),
            json!([]),
            json!("20000000"),
            json!("1d00ffff"),
            json!("5f000000"),
        ]
    }

    #[test]
    fn parses_and_stitches_session_prefix() {
        let job = StratumJobBtc::parse(&sample_params(), 0x00aa).unwrap();
        let line = job.to_notify_line(true).unwrap();
        let text = String::from_utf8(line).unwrap();
        assert!(text.contains("00aaupstream-job-1"));
        assert!(!is_fake_job_id("00aaupstream-job-1"));
    }

    #[test]
    fn strips_session_prefix_for_submit_routing() {
        assert_eq!(strip_session_prefix("00aaupstream-job-1"), Some("upstream-job-1"));
    }

    #[test]
    fn fake_job_ids_are_recognized_and_roll_forward() {
        let mut job = StratumJobBtc::parse(&sample_params(), 1).unwrap();
        let first = job.to_fake_notify_line(false).unwrap();
        job.to_new_fake_job();
        let second = job.to_fake_notify_line(false).unwrap();
        assert_ne!(first, second);
        let first_text = String::from_utf8(first).unwrap();
        assert!(first_text.contains(FAKE_JOB_ID_PREFIX));
    }

    #[test]
    fn rejects_short_params() {
        assert!(StratumJobBtc::parse(&[json!("x")], 0).is_err());
    }
}
