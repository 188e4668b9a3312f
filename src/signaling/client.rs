use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::message::{ClientMessage, ServerMessage};
use crate::error::{Error, Result};

/// Outbound half of a signaling connection
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalingSender {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|e| Error::Signaling(format!("Failed to send message: {}", e)))
    }
}

pub struct SignalingClient {
    tx: SignalingSender,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("Connected to signaling server at {}", url);
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        // Outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode signaling message: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Signaling writer stopped");
        });

        // Incoming messages
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling connection error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(signal) => {
                        if incoming_tx.send(signal).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Unrecognised signaling message: {}", e),
                }
            }
            info!("Signaling connection closed");
        });

        Ok(Self {
            tx: SignalingSender::new(outgoing_tx),
            rx,
        })
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx.send(msg)
    }

    pub fn sender(&self) -> SignalingSender {
        self.tx.clone()
    }

    /// Next message from the server; `None` once the connection is gone
    pub async fn receive(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    pub fn into_parts(self) -> (SignalingSender, mpsc::UnboundedReceiver<ServerMessage>) {
        (self.tx, self.rx)
    }
}
