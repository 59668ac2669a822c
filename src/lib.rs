pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod http; // WebSocket 接入与运维端点
pub mod hub;
pub mod infra;
pub mod logging;
pub mod model;
pub mod server;
pub mod session;
pub mod ws;

pub use config::HubConfig;
pub use error::{HubError, Result};
pub use hub::{Hub, HubEvent, HubHandle, HubOptions, HubSnapshot};
pub use model::*;
pub use server::HubServer;
pub use session::{Registry, Session};
