use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::Subscription;

/// Handle for one live event subscriber. Dropping the handle does not end
/// the session; cancellation does.
#[derive(Debug, Clone)]
pub struct SubscriberSession {
    pub id: Uuid,
    token: CancellationToken,
}

impl SubscriberSession {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The set of active websocket subscriber sessions for one instance.
#[derive(Default)]
pub struct WebsocketBag {
    sessions: Mutex<Vec<SubscriberSession>>,
}

impl WebsocketBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, session: SubscriberSession) {
        self.sessions.lock().await.push(session);
    }

    pub async fn remove(&self, id: Uuid) {
        self.sessions.lock().await.retain(|s| s.id != id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Cancels every open session. Used when the instance is deleted or
    /// reinstalled so no client keeps streaming from a dead object.
    pub async fn cancel_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.drain(..) {
            session.cancel();
        }
    }
}

/// Bridges an event-bus subscription to a websocket endpoint, serializing
/// each event as one JSON text frame. Returns the session handle once the
/// connection is established; the forwarding task runs until the far side
/// closes or the session is cancelled.
pub async fn spawn_event_session(
    mut subscription: Subscription,
    url: &str,
    bearer_token: Option<&str>,
) -> anyhow::Result<SubscriberSession> {
    let mut request = url.into_client_request()?;
    if let Some(token) = bearer_token {
        let value = format!("Bearer {token}");
        request.headers_mut().insert("Authorization", value.parse()?);
    }

    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    let (mut sink, mut stream) = ws.split();

    let token = CancellationToken::new();
    let session = SubscriberSession::new(token.clone());

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return;
                }
                event = subscription.rx.recv() => {
                    let Some(event) = event else { return };
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
                        _ => {}
                    }
                }
            }
        }
    });

    Ok(session)
}
