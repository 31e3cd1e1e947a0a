pub mod config;
pub mod constants;
pub mod down_session;
pub mod errors;
pub mod events;
pub mod fake_up_session;
pub mod job;
pub mod jsonrpc;
pub mod pool_tls;
pub mod session_id;
pub mod session_manager;
pub mod up_session;
pub mod up_session_manager;
pub mod worker_name;
