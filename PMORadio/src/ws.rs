//! WebSocket : instantané `sync` à la connexion, puis flux d'événements.
//!
//! Les messages entrants sont des objets JSON `{"type": ...}` traduits en
//! [`EngineCommand`]. Un client trop lent perd les événements les plus
//! anciens, jamais le moteur.

use crate::api::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use pmoradio::{EngineCommand, EventEnvelope, RadioEvent, RadioHandle};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Messages accepted from a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Reaction { text: String },
    Pause,
    Resume,
    TogglePause,
    Skip,
    Like,
    Dislike,
    Save,
    Seek { delta: f64 },
    Volume { level: i64 },
    TrackEnded,
    SwitchRadio { name: String },
    CreateRadio {
        name: String,
        #[serde(default)]
        vibe: String,
    },
    DeleteRadio { name: String },
    CleanRadio,
    FirstVibe { text: String },
    Sleep { minutes: u32 },
    CancelSleep,
    SleepStatus,
    ListRadios,
    History,
}

impl From<ClientMessage> for EngineCommand {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Reaction { text } => EngineCommand::Reaction(text),
            ClientMessage::Pause => EngineCommand::Pause,
            ClientMessage::Resume => EngineCommand::Resume,
            ClientMessage::TogglePause => EngineCommand::TogglePause,
            ClientMessage::Skip => EngineCommand::Skip,
            ClientMessage::Like => EngineCommand::Like,
            ClientMessage::Dislike => EngineCommand::Dislike,
            ClientMessage::Save => EngineCommand::Save,
            ClientMessage::Seek { delta } => EngineCommand::Seek(delta),
            ClientMessage::Volume { level } => EngineCommand::SetVolume(level),
            ClientMessage::TrackEnded => EngineCommand::TrackEnded,
            ClientMessage::SwitchRadio { name } => EngineCommand::SwitchRadio(name),
            ClientMessage::CreateRadio { name, vibe } => EngineCommand::CreateRadio { name, vibe },
            ClientMessage::DeleteRadio { name } => EngineCommand::DeleteRadio(name),
            ClientMessage::CleanRadio => EngineCommand::CleanRadio,
            ClientMessage::FirstVibe { text } => EngineCommand::FirstVibe(text),
            ClientMessage::Sleep { minutes } => EngineCommand::SetSleep { minutes },
            ClientMessage::CancelSleep => EngineCommand::CancelSleep,
            ClientMessage::SleepStatus => EngineCommand::SleepStatus,
            ClientMessage::ListRadios => EngineCommand::ListRadios,
            ClientMessage::History => EngineCommand::History,
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.radio))
}

async fn handle_socket(socket: WebSocket, radio: RadioHandle) {
    // subscribe before the snapshot so nothing falls in between
    let events = radio.subscribe();
    let snapshot = match radio.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!("WebSocket refused: {err}");
            return;
        }
    };
    debug!("WebSocket client connected");

    let (sink, mut stream) = socket.split();
    let sync = EventEnvelope::new(RadioEvent::Sync(snapshot));
    let outgoing = tokio::spawn(forward_events(sink, events, sync));

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    if radio.send(message.into()).await.is_err() {
                        break;
                    }
                }
                Err(err) => debug!("Ignoring client message {text:?}: {err}"),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    outgoing.abort();
    debug!("WebSocket client disconnected");
}

async fn forward_events(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: broadcast::Receiver<EventEnvelope>,
    sync: EventEnvelope,
) {
    if send_json(&mut sink, &sync).await.is_err() {
        return;
    }
    loop {
        match events.recv().await {
            Ok(envelope) => {
                if send_json(&mut sink, &envelope).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "WebSocket client lagging, oldest events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    envelope: &EventEnvelope,
) -> Result<(), axum::Error> {
    match serde_json::to_string(envelope) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(err) => {
            warn!("Failed to serialize event: {err}");
            Ok(())
        }
    }
}
