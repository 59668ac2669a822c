//! 在线会话与会话注册表

#[allow(clippy::module_inception)]
mod session;
pub mod registry;

pub use registry::{Registry, RegistryStats};
pub use session::{SendOutcome, Session, SessionId};
