//! 数据模型模块

pub mod event;
pub mod frame;
pub mod message;

pub use event::{DomainEvent, EventRoute, Notification, NOTIFICATION_CREATED};
pub use frame::Frame;
pub use message::{ChatMessage, Target, TypingEvent};
