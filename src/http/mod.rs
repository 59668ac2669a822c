//! HTTP 服务器模块 - 使用 Axum 提供 WebSocket 接入与运维端点

pub mod routes;
pub mod server;

pub use server::{HttpServer, HttpServerState};
