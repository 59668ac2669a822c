//! 每连接一对读写任务
//!
//! 写任务独占 socket 的发送端，消费会话出站缓冲并定时发送 ping；
//! 读任务解析客户端帧，任何入站帧都会刷新会话活跃时间与读超时。
//! 读任务退出后经调度引擎注销会话，引擎关闭缓冲，写任务随之发送 Close 并退出。

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bridge::RelayPublisher;
use crate::config::{HubSection, ServerSection};
use crate::error::{HubError, Result};
use crate::hub::HubHandle;
use crate::model::{Frame, TypingEvent};
use crate::session::Session;
use crate::ws::protocol::{accept_message, ClientFrame};

/// 连接层参数
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_frame_bytes: usize,
    pub pong_wait: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub session_buffer: usize,
    /// 客户端消息先发布到跨实例频道，由订阅方注入引擎
    pub relay_inbound: bool,
}

impl ConnectionSettings {
    pub fn from_config(server: &ServerSection, hub: &HubSection) -> Self {
        Self {
            max_frame_bytes: server.max_frame_bytes,
            pong_wait: server.pong_wait(),
            ping_interval: server.ping_interval(),
            write_timeout: server.write_timeout(),
            session_buffer: server.session_buffer,
            relay_inbound: hub.relay_inbound,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ServerSection::default(), &HubSection::default())
    }
}

/// 读任务处理上行帧所需的依赖
pub struct Inbound {
    pub hub: HubHandle,
    pub relay: Option<Arc<dyn RelayPublisher>>,
    pub relay_inbound: bool,
}

impl Inbound {
    /// 处理一条文本帧；只有引擎关闭时返回错误
    pub async fn handle_text(&self, session: &Session, text: &str) -> Result<()> {
        let user_id = session.user_id();
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "无法解析客户端帧，忽略");
                return Ok(());
            }
        };

        match frame {
            ClientFrame::Message(msg) => {
                let msg = match accept_message(msg, user_id) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "拒绝客户端消息");
                        return Ok(());
                    }
                };
                match (&self.relay, self.relay_inbound) {
                    (Some(relay), true) => {
                        if let Err(e) = relay.publish(&msg).await {
                            warn!(message_id = %msg.id, error = %e, "跨实例频道发布失败");
                        }
                    }
                    _ => self.hub.broadcast(msg).await?,
                }
            }
            ClientFrame::Typing {
                conversation_id,
                is_typing,
            } => {
                let event = TypingEvent::new(&conversation_id, user_id, is_typing);
                self.hub.typing(event).await?;
            }
            ClientFrame::Presence => {}
            ClientFrame::Unknown(kind) => {
                debug!(user_id = %user_id, frame_type = %kind, "未知客户端帧类型，忽略");
            }
        }
        Ok(())
    }
}

/// 驱动一个已认证连接直到断开
pub async fn run_connection(
    socket: WebSocket,
    user_id: String,
    groups: Vec<String>,
    inbound: Inbound,
    settings: ConnectionSettings,
) {
    let (session, outbound) = Session::new(&user_id, groups, settings.session_buffer);
    if let Err(e) = inbound.hub.register(session.clone()).await {
        warn!(user_id = %user_id, error = %e, "调度引擎不可用，拒绝连接");
        return;
    }

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound,
        settings.ping_interval,
        settings.write_timeout,
    ));

    info!(user_id = %user_id, session_id = %session.id(), "🔗 WebSocket 会话已建立");

    loop {
        let next = match timeout(settings.pong_wait, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!(user_id = %user_id, session_id = %session.id(), "读超时，关闭连接");
                break;
            }
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(user_id = %user_id, error = %e, "WebSocket 读取错误");
                break;
            }
            None => break,
        };

        session.touch();
        match message {
            Message::Text(text) => {
                if text.len() > settings.max_frame_bytes {
                    warn!(user_id = %user_id, size = text.len(), "帧超过大小限制，关闭连接");
                    break;
                }
                if let Err(HubError::Closed(_)) = inbound.handle_text(&session, text.as_str()).await
                {
                    break;
                }
            }
            Message::Close(_) => break,
            // ping/pong 已刷新活跃时间；二进制帧不在协议内
            _ => {}
        }
    }

    if inbound.hub.unregister(session.clone()).await.is_err() {
        session.close();
    }
    if timeout(settings.write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(
        user_id = %user_id,
        session_id = %session.id(),
        connected_secs = (Utc::now() - session.connected_at()).num_seconds(),
        "WebSocket 会话已结束"
    );
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    ping_interval: Duration,
    write_timeout: Duration,
) {
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame.to_string().into()),
                None => {
                    let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new().into()),
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "WebSocket 写入失败");
                break;
            }
            Err(_) => {
                warn!("WebSocket 写入超时");
                break;
            }
        }
    }
}
