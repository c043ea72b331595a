use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use courier_types::api::Claims;
use courier_types::error::DispatchError;
use courier_types::events::{ClientCommand, ServerEvent};

use crate::calls::CallRelay;
use crate::dispatch::{Engine, Outgoing};
use crate::registry::Registry;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh socket gets to present its Identify token.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection needs, wired up once at startup and handed
/// in by clone — no global state.
#[derive(Clone)]
pub struct Gateway {
    pub registry: Registry,
    pub engine: Engine,
    pub calls: CallRelay,
    pub jwt_secret: String,
}

/// Handle a single WebSocket connection: Identify handshake, Ready,
/// then the event loop until either side drops.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for the Identify command with a valid JWT. Rejection
    // here is the connection-level auth failure — dispatch is never
    // reachable without it.
    let (user_id, username) = match wait_for_identify(&mut receiver, &gateway.jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: Ready, then register. Registration broadcasts the full
    // online snapshot, which includes this fresh connection.
    let ready = ServerEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn_id = gateway.registry.register(user_id, tx.clone()).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let event = match event {
                        Some(event) => event,
                        None => break, // replaced by a newer connection
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client. Commands are handled one at a
    // time, so sends from this user to a given target persist in order.
    let gateway_recv = gateway.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&gateway_recv, user_id, &username_recv, &tx, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.get(..200).unwrap_or(&text)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Presence is removed immediately; in-flight dispatches complete on
    // their own. Call state is only reset if this connection still owned
    // the session — a newer connection may have taken over.
    let was_current = gateway.registry.unregister(user_id, conn_id).await;
    if was_current {
        gateway.calls.hangup_for(user_id).await;
    }
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientCommand::Identify { token }) =
                    serde_json::from_str::<ClientCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    gateway: &Gateway,
    user_id: Uuid,
    username: &str,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::Identify { .. } => {} // already handled

        ClientCommand::SendMessage {
            seq,
            recipient,
            content,
            kind,
            file_url,
            reply_to,
            ttl_secs,
        } => {
            let result = gateway
                .engine
                .send_direct(
                    user_id,
                    username,
                    recipient,
                    Outgoing {
                        content,
                        kind,
                        file_url,
                        reply_to,
                        ttl_secs,
                    },
                )
                .await;
            ack(tx, seq, result.map(|payload| Some(payload.id)));
        }

        ClientCommand::SendGroupMessage {
            seq,
            group,
            content,
            kind,
            file_url,
            reply_to,
            ttl_secs,
        } => {
            let result = gateway
                .engine
                .send_group(
                    user_id,
                    username,
                    group,
                    Outgoing {
                        content,
                        kind,
                        file_url,
                        reply_to,
                        ttl_secs,
                    },
                )
                .await;
            ack(tx, seq, result.map(|payload| Some(payload.id)));
        }

        ClientCommand::EditMessage {
            seq,
            message_id,
            content,
        } => {
            let result = gateway.engine.edit(user_id, message_id, content).await;
            ack(tx, seq, result.map(|_| Some(message_id)));
        }

        ClientCommand::DeleteMessage { seq, message_id } => {
            let result = gateway.engine.delete(user_id, message_id).await;
            ack(tx, seq, result.map(|_| Some(message_id)));
        }

        ClientCommand::AddReaction {
            seq,
            message_id,
            emoji,
        } => {
            let result = gateway
                .engine
                .toggle_reaction(user_id, message_id, emoji)
                .await;
            ack(tx, seq, result.map(|_| Some(message_id)));
        }

        ClientCommand::MarkRead { seq, partner } => {
            let result = gateway.engine.mark_read(user_id, partner).await;
            ack(tx, seq, result.map(|_| None));
        }

        ClientCommand::MarkGroupRead { seq, group } => {
            let result = gateway.engine.mark_group_read(user_id, group).await;
            ack(tx, seq, result.map(|_| None));
        }

        ClientCommand::Typing { recipient, group } => {
            gateway
                .engine
                .relay_typing(user_id, recipient, group, false)
                .await;
        }

        ClientCommand::StopTyping { recipient, group } => {
            gateway
                .engine
                .relay_typing(user_id, recipient, group, true)
                .await;
        }

        ClientCommand::CallOffer { callee, payload } => {
            gateway.calls.offer(user_id, callee, payload).await;
        }

        ClientCommand::CallAnswer { caller, payload } => {
            gateway.calls.answer(user_id, caller, payload).await;
        }

        ClientCommand::CallIceCandidate { to, payload } => {
            gateway.calls.ice_candidate(user_id, to, payload).await;
        }

        ClientCommand::CallEnd { to } => {
            gateway.calls.end(user_id, to).await;
        }
    }
}

/// Translate the engine's synchronous result into the terminal ack for
/// this command. Every call-style command gets exactly one.
fn ack(
    tx: &mpsc::UnboundedSender<ServerEvent>,
    seq: u64,
    result: Result<Option<Uuid>, DispatchError>,
) {
    let event = match result {
        Ok(message_id) => ServerEvent::Ack {
            seq,
            success: true,
            message_id,
            error: None,
        },
        Err(err) => {
            if matches!(err, DispatchError::Storage(_)) {
                warn!("dispatch failed on store error: {}", err);
            }
            ServerEvent::Ack {
                seq,
                success: false,
                message_id: None,
                error: Some(err.to_ack()),
            }
        }
    };
    let _ = tx.send(event);
}
