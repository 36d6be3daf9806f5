use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use application::ConnectionHandle;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{ClientEvent, ConnectionId, ServerEvent, UserId};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;

/// WebSocket 连接
///
/// 一条连接拆成发送与接收两个任务：
/// - 发送任务独占 socket 的写端，转发网关推来的事件、pong 回应和心跳 ping；
/// - 接收任务按到达顺序把客户端事件交给网关处理。
///
/// 任一任务结束即视为断开，随后向网关注销连接。
pub struct WebSocketConnection {
    state: AppState,
    connection_id: ConnectionId,
    user_id: UserId,
    events: mpsc::Receiver<ServerEvent>,
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendEvent(ServerEvent),
    SendPong(Vec<u8>),
}

impl WebSocketConnection {
    pub fn new(state: AppState, handle: ConnectionHandle) -> Self {
        Self {
            state,
            connection_id: handle.connection_id,
            user_id: handle.user_id,
            events: handle.events,
        }
    }

    pub async fn run(self, socket: WebSocket) {
        let Self {
            state,
            connection_id,
            user_id,
            mut events,
        } = self;

        let (mut sender, mut incoming) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);
        let missed_pongs = Arc::new(AtomicU32::new(0));

        let heartbeat_interval = state.realtime.heartbeat_interval();
        let max_missed_pongs = state.realtime.max_missed_pongs;

        let mut send_task = {
            let missed_pongs = missed_pongs.clone();
            tokio::spawn(async move {
                let mut heartbeat = tokio::time::interval(heartbeat_interval);
                heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // interval 第一次 tick 立即完成
                heartbeat.tick().await;

                loop {
                    tokio::select! {
                        event = events.recv() => {
                            // 队列被关闭说明连接因积压被移出，让客户端重连后追赶
                            let Some(event) = event else {
                                tracing::warn!(connection_id = %connection_id, "outbound queue closed, closing socket");
                                let _ = sender.send(WsMessage::Close(None)).await;
                                break;
                            };
                            if send_event(&mut sender, &event).await.is_err() {
                                break;
                            }
                        }
                        Some(cmd) = cmd_rx.recv() => {
                            let sent = match cmd {
                                WsCommand::SendEvent(event) => send_event(&mut sender, &event).await,
                                WsCommand::SendPong(data) => sender
                                    .send(WsMessage::Pong(data.into()))
                                    .await
                                    .map_err(|_| ()),
                            };
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = heartbeat.tick() => {
                            if missed_pongs.load(Ordering::Acquire) >= max_missed_pongs {
                                tracing::info!(connection_id = %connection_id, "heartbeat timed out");
                                let _ = sender.send(WsMessage::Close(None)).await;
                                break;
                            }
                            missed_pongs.fetch_add(1, Ordering::AcqRel);
                            if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!(connection_id = %connection_id, "websocket send task finished");
            })
        };

        let mut recv_task = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(Ok(message)) = incoming.next().await {
                    match message {
                        WsMessage::Text(text) => {
                            handle_text(&state, connection_id, text.as_str(), &cmd_tx).await;
                        }
                        WsMessage::Ping(data) => {
                            if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        WsMessage::Pong(_) => missed_pongs.store(0, Ordering::Release),
                        WsMessage::Close(_) => break,
                        WsMessage::Binary(_) => {
                            let _ = cmd_tx
                                .send(WsCommand::SendEvent(ServerEvent::error(
                                    "validation_error",
                                    "binary frames are not supported",
                                )))
                                .await;
                        }
                    }
                }
                tracing::debug!(connection_id = %connection_id, "websocket receive task finished");
            })
        };

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        state.gateway.on_disconnect(connection_id).await;
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "websocket closed");
    }
}

async fn send_event<S>(sender: &mut S, event: &ServerEvent) -> Result<(), ()>
where
    S: Sink<WsMessage> + Unpin,
{
    let payload = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize websocket payload");
            return Ok(());
        }
    };
    sender
        .send(WsMessage::Text(payload.into()))
        .await
        .map_err(|_| ())
}

/// 无法解析的帧只回一个 `error` 事件，不断开连接
async fn handle_text(
    state: &AppState,
    connection_id: ConnectionId,
    text: &str,
    cmd_tx: &mpsc::Sender<WsCommand>,
) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(connection_id = %connection_id, error = %err, "malformed client frame");
            let _ = cmd_tx
                .send(WsCommand::SendEvent(ServerEvent::error(
                    "validation_error",
                    format!("malformed event: {err}"),
                )))
                .await;
            return;
        }
    };

    // 失败时网关已向该连接推送 error 事件
    let _ = state.gateway.on_client_event(connection_id, event).await;
}
