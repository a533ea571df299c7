//! Connection handlers for the Confab gateway.
//!
//! Each connection runs one task: a select loop merging the client's frames
//! with an mpsc funnel fed by per-conversation forwarder tasks. The state
//! machine per connection is Connected -> Authenticated -> Joined* ->
//! Disconnected; identity must be established before any other action is
//! accepted, and a failed action never terminates the connection.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use confab_core::{ConnectionId, RegistryConfig, SessionRegistry};
use confab_protocol::{codec, ClientAction, ServerEvent, Version, PROTOCOL_VERSION};
use confab_service::{Authenticator, ChatService, ServiceError, UserIdentity};
use confab_store::StoreError;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared server state.
pub struct AppState {
    /// The session registry.
    pub registry: SessionRegistry,
    /// The chat orchestrator.
    pub chat: ChatService,
    /// The identity collaborator.
    pub authenticator: Arc<dyn Authenticator>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, chat: ChatService, authenticator: Arc<dyn Authenticator>) -> Self {
        let registry_config = RegistryConfig {
            max_groups_per_connection: config.limits.max_joined_conversations,
            group_capacity: config.limits.group_capacity,
        };

        Self {
            registry: SessionRegistry::with_config(registry_config),
            chat,
            authenticator,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = state.config.clone();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Confab gateway listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();

    debug!(connection = %connection_id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Identity is established by the first successful Authenticate action;
    // everything else is rejected until then.
    let mut identity: Option<UserIdentity> = None;

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Forwarder task handles per joined conversation, for cleanup
    let mut forward_tasks: HashMap<Uuid, tokio::task::JoinHandle<()>> = HashMap::new();

    // Funnel merging every joined group's broadcasts into this connection
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<Arc<ServerEvent>>();

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Events from joined groups (via mpsc)
            Some(event) = sub_rx.recv() => {
                match codec::encode(&*event) {
                    Ok(data) => {
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Event encoding error");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientAction>(&mut read_buffer) {
                                Ok(Some(action)) => {
                                    if let Err(e) = handle_action(
                                        action,
                                        &connection_id,
                                        &mut identity,
                                        &state,
                                        &mut sender,
                                        &mut forward_tasks,
                                        &sub_tx,
                                    ).await {
                                        error!(connection = %connection_id, error = %e, "Action handling error");
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    // The stream cannot be re-synced after a bad
                                    // frame; drop the buffer and tell the caller.
                                    warn!(connection = %connection_id, error = %e, "Malformed frame");
                                    metrics::record_error("protocol");
                                    read_buffer.clear();
                                    let _ = send_event(&mut sender, &ServerEvent::error("malformed frame")).await;
                                    break;
                                }
                            }
                        }

                        metrics::record_action_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: abort all forwarder tasks
    for (_, handle) in forward_tasks {
        handle.abort();
    }

    // Cleanup: leave every joined group. No presence broadcast on abrupt
    // disconnect; clients un-announce via an explicit LeaveConversation.
    state.registry.disconnect(&connection_id);
    metrics::set_active_groups(state.registry.stats().group_count);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle one decoded client action.
async fn handle_action(
    action: ClientAction,
    connection_id: &ConnectionId,
    identity: &mut Option<UserIdentity>,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
    forward_tasks: &mut HashMap<Uuid, tokio::task::JoinHandle<()>>,
    sub_tx: &mpsc::UnboundedSender<Arc<ServerEvent>>,
) -> Result<()> {
    // Keepalive works in every state.
    if matches!(action, ClientAction::Ping) {
        return send_event(sender, &ServerEvent::Pong).await;
    }

    if let ClientAction::Authenticate {
        token,
        protocol_version,
    } = &action
    {
        if identity.is_some() {
            return send_event(sender, &ServerEvent::error("already authenticated")).await;
        }
        if let Some(major) = protocol_version {
            if !Version::from_major(*major).is_compatible_with(&PROTOCOL_VERSION) {
                warn!(connection = %connection_id, client_version = major, "Incompatible protocol version");
                return send_event(
                    sender,
                    &ServerEvent::error(format!(
                        "incompatible protocol version {major}, server speaks {PROTOCOL_VERSION}"
                    )),
                )
                .await;
            }
        }
        return match state.authenticator.authenticate(token).await {
            Some(resolved) => {
                info!(connection = %connection_id, user = resolved.user_id, "Authenticated");
                let event = ServerEvent::Authenticated {
                    user_id: resolved.user_id,
                    display_name: resolved.display_name.clone(),
                    protocol_version: PROTOCOL_VERSION.major,
                    heartbeat_ms: state.config.heartbeat.interval_ms as u32,
                };
                *identity = Some(resolved);
                send_event(sender, &event).await
            }
            None => {
                // Fail closed: the connection stays unauthenticated.
                warn!(connection = %connection_id, "Authentication failed");
                metrics::record_error("auth");
                send_event(sender, &ServerEvent::error("authentication failed")).await
            }
        };
    }

    // Everything below requires an established identity.
    let Some(user) = identity.clone() else {
        return send_event(sender, &ServerEvent::error("not authenticated")).await;
    };

    match action {
        ClientAction::JoinConversation { conversation_id } => {
            match state.chat.can_access(conversation_id, user.user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Denial is reported to the caller, uniformly with every
                    // other action.
                    warn!(connection = %connection_id, conversation = %conversation_id, "Join denied");
                    return send_event(
                        sender,
                        &ServerEvent::error("not a participant in this conversation"),
                    )
                    .await;
                }
                Err(e) => return send_service_error(sender, &e).await,
            }

            // Idempotent re-join: membership and forwarder already exist.
            if forward_tasks.contains_key(&conversation_id) {
                return Ok(());
            }

            let mut rx = match state
                .registry
                .join(connection_id, user.user_id, conversation_id)
            {
                Ok(rx) => rx,
                Err(e) => return send_event(sender, &ServerEvent::error(e.to_string())).await,
            };

            // Forward group broadcasts into this connection's funnel.
            let tx = sub_tx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if tx.send(event).is_err() {
                                break; // Receiver dropped
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            });
            forward_tasks.insert(conversation_id, handle);
            metrics::set_active_groups(state.registry.stats().group_count);

            state.registry.publish(
                conversation_id,
                ServerEvent::user_joined(conversation_id, user.user_id),
            );
        }

        ClientAction::LeaveConversation { conversation_id } => {
            if let Some(handle) = forward_tasks.remove(&conversation_id) {
                handle.abort();
            }
            state.registry.leave(connection_id, conversation_id);
            metrics::set_active_groups(state.registry.stats().group_count);

            state.registry.publish(
                conversation_id,
                ServerEvent::user_left(conversation_id, user.user_id),
            );
        }

        ClientAction::SendMessage {
            conversation_id,
            text,
            contents,
            reply_to,
        } => {
            let posted = match state
                .chat
                .send_message(conversation_id, user.user_id, text, contents, reply_to)
                .await
            {
                Ok(posted) => posted,
                Err(e) => return send_service_error(sender, &e).await,
            };

            metrics::record_message("user");
            let recipients = state.registry.publish(
                conversation_id,
                ServerEvent::receive_message(posted.message.clone()),
            );
            debug!(
                connection = %connection_id,
                conversation = %conversation_id,
                recipients,
                "Message broadcast"
            );

            // The assistant turn runs as detached work so the sender's
            // acknowledgment is never delayed by generation latency.
            if posted.needs_assistant_turn() {
                tokio::spawn(run_assistant_turn(Arc::clone(state), conversation_id));
            }
        }

        ClientAction::EditMessage { message_id, text } => {
            match state.chat.edit_message(message_id, user.user_id, &text).await {
                Ok(message) => {
                    let conversation_id = message.conversation_id;
                    state
                        .registry
                        .publish(conversation_id, ServerEvent::MessageEdited { message });
                }
                Err(e) => return send_service_error(sender, &e).await,
            }
        }

        ClientAction::DeleteMessage { message_id } => {
            match state.chat.delete_message(message_id, user.user_id).await {
                Ok(message) => {
                    state.registry.publish(
                        message.conversation_id,
                        ServerEvent::MessageDeleted {
                            conversation_id: message.conversation_id,
                            message_id,
                        },
                    );
                }
                Err(e) => return send_service_error(sender, &e).await,
            }
        }

        ClientAction::MarkMessageAsRead { message_id } => {
            match state.chat.mark_as_read(message_id, user.user_id).await {
                Ok(message) => {
                    metrics::record_read_receipt();
                    state.registry.publish(
                        message.conversation_id,
                        ServerEvent::MessageRead {
                            conversation_id: message.conversation_id,
                            message_id,
                            reader_id: user.user_id,
                        },
                    );
                }
                Err(e) => return send_service_error(sender, &e).await,
            }
        }

        ClientAction::MarkAllMessagesAsRead { conversation_id } => {
            match state
                .chat
                .mark_all_as_read(conversation_id, user.user_id)
                .await
            {
                Ok(_) => {
                    metrics::record_read_receipt();
                    state.registry.publish(
                        conversation_id,
                        ServerEvent::MessagesMarkedAsRead {
                            conversation_id,
                            reader_id: user.user_id,
                        },
                    );
                }
                Err(e) => return send_service_error(sender, &e).await,
            }
        }

        // Typing signals are best-effort: no persistence, no authorization
        // re-check beyond group membership, silently dropped otherwise.
        ClientAction::StartTyping { conversation_id } => {
            if forward_tasks.contains_key(&conversation_id) {
                metrics::record_typing_signal();
                state.registry.publish(
                    conversation_id,
                    ServerEvent::UserTyping {
                        conversation_id,
                        user_id: user.user_id,
                    },
                );
            }
        }

        ClientAction::StopTyping { conversation_id } => {
            if forward_tasks.contains_key(&conversation_id) {
                metrics::record_typing_signal();
                state.registry.publish(
                    conversation_id,
                    ServerEvent::UserStoppedTyping {
                        conversation_id,
                        user_id: user.user_id,
                    },
                );
            }
        }

        // Handled before the identity check.
        ClientAction::Authenticate { .. } | ClientAction::Ping => {}
    }

    Ok(())
}

/// One detached assistant turn: announce typing, generate, persist and
/// broadcast the reply, and always clear the typing indicator on the way
/// out, success or failure.
async fn run_assistant_turn(state: Arc<AppState>, conversation_id: Uuid) {
    state.registry.publish(
        conversation_id,
        ServerEvent::assistant_typing(conversation_id, true),
    );

    match state.chat.get_assistant_response(conversation_id).await {
        Ok(text) => match state.chat.send_assistant_message(conversation_id, text).await {
            Ok(message) => {
                metrics::record_message("assistant");
                metrics::record_assistant_turn("ok");
                state
                    .registry
                    .publish(conversation_id, ServerEvent::receive_message(message));
            }
            Err(e) => {
                error!(conversation = %conversation_id, error = %e, "Failed to persist assistant reply");
                metrics::record_assistant_turn("store_error");
                state.registry.publish(
                    conversation_id,
                    ServerEvent::error("assistant reply could not be saved"),
                );
            }
        },
        Err(e) => {
            // Non-fatal: the sender already has their own message; the group
            // is told the assistant did not answer.
            warn!(conversation = %conversation_id, error = %e, "Assistant turn failed");
            metrics::record_assistant_turn("unavailable");
            state.registry.publish(
                conversation_id,
                ServerEvent::error("assistant is unavailable right now"),
            );
        }
    }

    state.registry.publish(
        conversation_id,
        ServerEvent::assistant_typing(conversation_id, false),
    );
}

/// Send an event to the caller only.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<()> {
    let data = codec::encode(event)?;
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

/// Translate an orchestrator failure into a caller-scoped `Error` event.
async fn send_service_error(
    sender: &mut SplitSink<WebSocket, Message>,
    error: &ServiceError,
) -> Result<()> {
    metrics::record_error(error_label(error));
    send_event(sender, &ServerEvent::error(error.to_string())).await
}

fn error_label(error: &ServiceError) -> &'static str {
    match error {
        ServiceError::Forbidden(_) => "forbidden",
        ServiceError::AssistantUnavailable(_) => "assistant",
        ServiceError::Store(StoreError::Validation(_)) => "validation",
        ServiceError::Store(StoreError::NotFound(_)) => "not_found",
        ServiceError::Store(_) => "store",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use confab_protocol::model::ConversationKind;
    use confab_service::{AssistantError, AssistantTurn, StaticAuthenticator};
    use confab_store::ConversationStore;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Replies with a fixed string, or fails when none is given.
    struct FixedAssistant(Option<&'static str>);

    #[async_trait]
    impl confab_service::AssistantClient for FixedAssistant {
        async fn generate(
            &self,
            _conversation_id: Uuid,
            _history: &[AssistantTurn],
            _system_prompt: &str,
        ) -> Result<String, AssistantError> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| AssistantError::Request("generator down".into()))
        }
    }

    async fn test_state(assistant: FixedAssistant) -> Arc<AppState> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = ConversationStore::new(pool);
        store.migrate().await.unwrap();
        let chat = ChatService::new(store, Arc::new(assistant));
        Arc::new(AppState::new(
            Config::default(),
            chat,
            Arc::new(StaticAuthenticator::new()),
        ))
    }

    #[tokio::test]
    async fn test_assistant_turn_event_sequence() {
        let state = test_state(FixedAssistant(Some("hello there"))).await;
        let conversation = state
            .chat
            .open_conversation(1, None, ConversationKind::UserToAssistant)
            .await
            .unwrap()
            .into_inner();
        state
            .chat
            .send_message(conversation.id, 1, Some("hi".into()), vec![], None)
            .await
            .unwrap();

        let mut rx = state
            .registry
            .join(&"conn-1".into(), 1, conversation.id)
            .unwrap();

        run_assistant_turn(Arc::clone(&state), conversation.id).await;

        // Typing on, then the reply, then typing off.
        assert!(matches!(
            &*rx.recv().await.unwrap(),
            ServerEvent::AssistantTyping { typing: true, .. }
        ));
        let event = rx.recv().await.unwrap();
        match &*event {
            ServerEvent::ReceiveMessage { message } => {
                assert!(message.is_assistant());
                assert_eq!(message.text_content.as_deref(), Some("hello there"));
            }
            other => panic!("expected ReceiveMessage, got {other:?}"),
        }
        assert!(matches!(
            &*rx.recv().await.unwrap(),
            ServerEvent::AssistantTyping { typing: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_assistant_turn_failure_sequence() {
        let state = test_state(FixedAssistant(None)).await;
        let conversation = state
            .chat
            .open_conversation(1, None, ConversationKind::UserToAssistant)
            .await
            .unwrap()
            .into_inner();
        state
            .chat
            .send_message(conversation.id, 1, Some("anyone?".into()), vec![], None)
            .await
            .unwrap();

        let mut rx = state
            .registry
            .join(&"conn-1".into(), 1, conversation.id)
            .unwrap();

        run_assistant_turn(Arc::clone(&state), conversation.id).await;

        // Typing on, a group-scoped error, and typing still cleared.
        assert!(matches!(
            &*rx.recv().await.unwrap(),
            ServerEvent::AssistantTyping { typing: true, .. }
        ));
        assert!(matches!(
            &*rx.recv().await.unwrap(),
            ServerEvent::Error { .. }
        ));
        assert!(matches!(
            &*rx.recv().await.unwrap(),
            ServerEvent::AssistantTyping { typing: false, .. }
        ));

        // No assistant message was persisted.
        let page = state
            .chat
            .history(conversation.id, 1, 0, 10)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.messages[0].sender_id, Some(1));
    }
}
