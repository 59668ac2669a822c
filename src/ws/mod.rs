//! WebSocket 接入：升级、上行帧协议与每连接读写任务

pub mod actor;
pub mod handler;
pub mod protocol;

pub use actor::{ConnectionSettings, Inbound};
pub use protocol::ClientFrame;
