//! One websocket connection.
//!
//! A writer task drains the connection's outbound channel into the socket;
//! the reader loop parses client frames and dispatches them to the hub.
//! Frames arriving on a superseded or expired session get an error frame
//! and the connection is closed.

use std::ops::ControlFlow;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_shared::{ClientFrame, ErrorCode, ServerFrame, UserId};

use crate::error::ServerError;
use crate::relay::{RelayHub, SendRequest};
use crate::sessions::SessionHandle;

/// Outbound frames buffered per connection before fan-out starts dropping.
const OUTBOUND_BUFFER: usize = 256;

pub async fn handle_socket(socket: WebSocket, hub: Arc<RelayHub>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = Connection {
        hub,
        tx,
        session: None,
    };

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "Websocket read failed");
                break;
            }
        };
        if conn.handle_text(&text).await.is_break() {
            break;
        }
    }

    if let Some(handle) = conn.session.take() {
        conn.hub.disconnect(&handle).await;
    }
    drop(conn);
    let _ = writer.await;
}

struct Connection {
    hub: Arc<RelayHub>,
    tx: mpsc::Sender<ServerFrame>,
    session: Option<SessionHandle>,
}

impl Connection {
    async fn reply(&self, frame: ServerFrame) {
        let _ = self.tx.send(frame).await;
    }

    async fn reply_error(&self, request_id: Option<u64>, error: &ServerError) {
        self.reply(ServerFrame::Error {
            request_id,
            code: error.error_code(),
            message: error.public_message(),
        })
        .await;
    }

    async fn handle_text(&mut self, text: &str) -> ControlFlow<()> {
        let frame = match ClientFrame::from_text(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reply(ServerFrame::Error {
                    request_id: None,
                    code: ErrorCode::InvalidRequest,
                    message: e.to_string(),
                })
                .await;
                return ControlFlow::Continue(());
            }
        };

        if let ClientFrame::Authenticate {
            user_id,
            display_name,
        } = frame
        {
            return self.authenticate(user_id, display_name).await;
        }

        let request_id = frame.request_id();

        let Some(handle) = self.session.clone() else {
            self.reply_error(request_id, &ServerError::NotAuthenticated)
                .await;
            return ControlFlow::Continue(());
        };

        if let Err(e) = self.hub.ensure_current(&handle).await {
            self.reply_error(request_id, &e).await;
            if matches!(
                e,
                ServerError::SessionSuperseded | ServerError::SessionExpired
            ) {
                debug!(user = %handle.user_id, session = %handle.session_id, error = %e, "Stale session closing");
                return ControlFlow::Break(());
            }
            return ControlFlow::Continue(());
        }

        match self.dispatch(&handle, frame).await {
            Ok(Some(response)) => self.reply(response).await,
            Ok(None) => {}
            Err(e) => {
                debug!(user = %handle.user_id, error = %e, "Request failed");
                self.reply_error(request_id, &e).await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn authenticate(&mut self, user_id: UserId, display_name: String) -> ControlFlow<()> {
        if let Some(current) = &self.session {
            if current.user_id == user_id && self.hub.ensure_current(current).await.is_ok() {
                self.reply(ServerFrame::AuthAck {
                    user_id,
                    session_id: current.session_id.clone(),
                })
                .await;
                return ControlFlow::Continue(());
            }
        }

        if let Some(previous) = self.session.take() {
            self.hub.disconnect(&previous).await;
        }

        match self
            .hub
            .authenticate(&user_id, &display_name, self.tx.clone())
            .await
        {
            Ok(handle) => {
                self.session = Some(handle);
                ControlFlow::Continue(())
            }
            Err(ServerError::AuthRejected(reason)) => {
                warn!(user = %user_id, %reason, "Authentication rejected");
                self.reply(ServerFrame::AuthRejected { reason }).await;
                ControlFlow::Break(())
            }
            Err(e) => {
                warn!(user = %user_id, error = %e, "Authentication failed");
                self.reply_error(None, &e).await;
                ControlFlow::Continue(())
            }
        }
    }

    async fn dispatch(
        &self,
        handle: &SessionHandle,
        frame: ClientFrame,
    ) -> Result<Option<ServerFrame>, ServerError> {
        let hub = &self.hub;
        match frame {
            ClientFrame::Authenticate { .. } => Ok(None),

            ClientFrame::Heartbeat { user_id, .. } => {
                hub.heartbeat(handle, &user_id).await?;
                Ok(None)
            }

            ClientFrame::Send {
                request_id,
                conversation_id,
                receiver_id,
                content,
                client_id,
            } => {
                let outcome = hub
                    .send_message(
                        handle,
                        SendRequest {
                            conversation_id,
                            receiver_id,
                            content,
                            client_id,
                        },
                    )
                    .await?;
                Ok(Some(ServerFrame::Ack {
                    request_id,
                    message: outcome.message,
                    duplicate: outcome.duplicate,
                }))
            }

            ClientFrame::Fetch {
                request_id,
                conversation_id,
                after,
                limit,
            } => {
                let messages = hub.fetch(handle, &conversation_id, after, limit).await?;
                Ok(Some(ServerFrame::History {
                    request_id,
                    conversation_id,
                    messages,
                }))
            }

            ClientFrame::ListConversations { request_id } => {
                let conversations = hub.list_conversations(handle).await?;
                Ok(Some(ServerFrame::Conversations {
                    request_id,
                    conversations,
                }))
            }

            ClientFrame::OpenConversation {
                request_id,
                peer_id,
            } => {
                let conversation = hub.open_conversation(handle, &peer_id).await?;
                Ok(Some(ServerFrame::Conversation {
                    request_id,
                    conversation,
                }))
            }

            ClientFrame::SetStatus { status } => {
                hub.set_status(handle, status).await?;
                Ok(None)
            }

            ClientFrame::MarkRead { conversation_id } => {
                hub.mark_read(handle, &conversation_id).await?;
                Ok(None)
            }

            ClientFrame::SetArchived {
                conversation_id,
                archived,
            } => {
                hub.set_archived(handle, &conversation_id, archived).await?;
                Ok(None)
            }
        }
    }
}
