use crate::agent::{ Answer, ConversationOrchestrator, Outcome, TurnRequest };
use crate::content::InboundContent;
use crate::models::websocket::{ ClientMessage, ServerMessage };
use crate::settings::ChatSettings;

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::net::{ TcpListener, TcpStream };
use tokio::sync::mpsc;

use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use url::form_urlencoded;
use log::{ debug, info, warn, error };
use futures::{ SinkExt, StreamExt };

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const FAILURE_MESSAGE: &str = "Something went wrong, no answer was received. Please try again.";

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::MIN.saturating_add(9)));
}

fn unauthorized(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res
}

pub fn key_matches(query: Option<&str>, required: Option<&str>) -> bool {
    let secret = match required {
        Some(k) if !k.is_empty() => k,
        _ => {
            return true;
        }
    };
    let params: HashMap<String, String> = form_urlencoded
        ::parse(query.unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    params.get("key").map_or(false, |k| k == secret)
}

/// Builds the engine request of a `turn` message. Image payloads must be
/// valid base64.
pub fn to_turn_request(message: ClientMessage) -> Result<TurnRequest, String> {
    match message {
        ClientMessage::Turn {
            chat_id,
            user_id,
            user_name,
            multi_party,
            reply_to_bot,
            text,
            image_base64,
            caption,
            file_name,
        } => {
            let content = match (image_base64, text) {
                (Some(encoded), _) => {
                    let bytes = STANDARD
                        .decode(encoded.trim())
                        .map_err(|e| format!("invalid image payload: {}", e))?;
                    match file_name {
                        Some(file_name) => InboundContent::Document { bytes, file_name, caption },
                        None => InboundContent::Photo { bytes, caption },
                    }
                }
                (None, Some(text)) => InboundContent::Text { text },
                (None, None) => InboundContent::Unsupported,
            };
            Ok(TurnRequest {
                chat_id,
                user_id,
                user_name,
                content,
                is_multi_party: multi_party,
                is_reply_to_bot: reply_to_bot,
            })
        }
        other => Err(format!("not a turn: {:?}", other)),
    }
}

/// Replies for one finished turn, in delivery order.
pub fn outcome_messages(chat_id: i64, outcome: Outcome) -> Vec<ServerMessage> {
    let timestamp = Utc::now().timestamp();
    match outcome {
        Outcome::Answered { answer: Answer::Text { chunks }, backend, .. } => {
            let count = chunks.len();
            chunks
                .into_iter()
                .enumerate()
                .map(|(index, content)| ServerMessage::Chunk {
                    chat_id,
                    index,
                    content,
                    last: index + 1 == count,
                    feedback: index + 1 == count,
                    backend: backend.clone(),
                    timestamp,
                })
                .collect()
        }
        Outcome::Answered { answer: Answer::Image { caption, image_url }, backend, .. } => {
            vec![ServerMessage::Image { chat_id, caption, url: image_url, backend, timestamp }]
        }
        Outcome::Rejected(e) => vec![ServerMessage::Rejected { chat_id, message: e.to_string() }],
        Outcome::Failed(_) => {
            vec![ServerMessage::Failed { chat_id, message: FAILURE_MESSAGE.to_string() }]
        }
        Outcome::Recorded => vec![ServerMessage::Recorded { chat_id }],
    }
}

pub async fn start_ws_server(
    addr: &str,
    engine: Arc<ConversationOrchestrator>,
    settings: Arc<ChatSettings>,
    api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!("WS server listening on: {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }
        info!("Incoming connection from: {}", peer);

        let engine = Arc::clone(&engine);
        let settings = Arc::clone(&settings);
        let required_api_key = api_key.clone();
        tokio::spawn(async move {
            if let Err(e) = process_connection(peer, stream, engine, settings, required_api_key).await {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

async fn process_connection(
    peer: SocketAddr,
    stream: TcpStream,
    engine: Arc<ConversationOrchestrator>,
    settings: Arc<ChatSettings>,
    required_api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if key_matches(req.uri().query(), required_api_key.as_deref()) {
            Ok(response)
        } else {
            warn!("Rejected connection from {}: bad api key", peer);
            Err(unauthorized("invalid api key"))
        }
    };

    let websocket = accept_hdr_async(stream, auth_callback).await.map_err(|e| {
        error!("Handshake failed for {}: {}", peer, e);
        e
    })?;
    info!("New WebSocket connection: {}", peer);

    let (mut ws_tx, mut ws_rx) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let json = match serde_json::to_string(&reply) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize reply for {}: {}", peer, e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                error!("Error sending to {}: {}", peer, e);
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let message = match msg {
            Ok(message) => message,
            Err(e) => {
                warn!("WebSocket error from {}: {}", peer, e);
                break;
            }
        };
        if message.len() > MAX_MESSAGE_SIZE {
            warn!("Message from {} exceeds size limit ({} > {})", peer, message.len(), MAX_MESSAGE_SIZE);
            let _ = tx.send(ServerMessage::Error { message: "Message too large".to_string() });
            break;
        }
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                info!("Client {} closed the connection", peer);
                break;
            }
            _ => {
                continue;
            }
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Feedback { user_id, message_id, kind }) => {
                let reply = match settings.save_feedback(kind, user_id, message_id).await {
                    Ok(()) => ServerMessage::FeedbackSaved,
                    Err(e) => {
                        error!("Failed to save feedback from {}: {}", peer, e);
                        ServerMessage::Error { message: "feedback not saved".to_string() }
                    }
                };
                let _ = tx.send(reply);
            }
            Ok(turn) => {
                let request = match to_turn_request(turn) {
                    Ok(request) => request,
                    Err(e) => {
                        let _ = tx.send(ServerMessage::Error { message: e });
                        continue;
                    }
                };
                let chat_id = request.chat_id;
                let _ = tx.send(ServerMessage::Processing { chat_id });
                let engine = Arc::clone(&engine);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let outcome = engine.handle_turn(request).await;
                    for reply in outcome_messages(chat_id, outcome) {
                        if tx.send(reply).is_err() {
                            debug!("Client of chat {} left before the answer was delivered", chat_id);
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                warn!("Invalid message from {}: {}", peer, e);
                let _ = tx.send(ServerMessage::Error { message: format!("invalid message: {}", e) });
            }
        }
    }

    drop(tx);
    if let Err(e) = writer.await {
        error!("Writer task for {} ended abnormally: {}", peer, e);
    }
    info!("Connection closed: {}", peer);
    Ok(())
}
