//! One connected application client.
//!
//! A session is the router target for its `app.<name>` namespace:
//! routed messages serialize onto the socket through the writer channel.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::domain::foundation::{BridgeError, ErrorCode, Namespace, SessionId};
use crate::domain::message::{encode, BridgeMessage};
use crate::ports::RouteTarget;

/// A registered client connection.
pub struct ClientSession {
    id: SessionId,
    namespace: Namespace,
    name: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl ClientSession {
    pub fn new(namespace: Namespace, name: String, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: SessionId::new(),
            namespace,
            name,
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a raw frame to the client.
    pub fn send_frame(&self, message: Message) -> Result<(), BridgeError> {
        self.tx
            .send(message)
            .map_err(|_| BridgeError::new(ErrorCode::AdapterError, "client connection closed"))
    }
}

#[async_trait]
impl RouteTarget for ClientSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn handle(&self, message: BridgeMessage) -> Result<(), BridgeError> {
        let text = encode(&message)?;
        self.send_frame(Message::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::SystemClock;
    use crate::domain::message::{EventPayload, MessagePayload};

    #[tokio::test]
    async fn handle_serializes_onto_the_writer_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ClientSession::new(
            Namespace::new("app.dash").unwrap(),
            "dash".to_string(),
            tx,
        );

        let message = BridgeMessage::new(
            Namespace::new("hub.core").unwrap(),
            MessagePayload::Event(EventPayload {
                event: "snapshot_complete".to_string(),
                data: None,
            }),
            &SystemClock,
            0,
        )
        .with_path("hub.subscriptions");

        session.handle(message.clone()).await.unwrap();

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let decoded = crate::domain::message::decode(&text).unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn handle_reports_a_closed_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let session = ClientSession::new(
            Namespace::new("app.dash").unwrap(),
            "dash".to_string(),
            tx,
        );

        let message = BridgeMessage::new(
            Namespace::new("hub.core").unwrap(),
            MessagePayload::Event(EventPayload {
                event: "x".to_string(),
                data: None,
            }),
            &SystemClock,
            0,
        )
        .with_path("a.b");

        let err = session.handle(message).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AdapterError);
    }
}
