use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    domain::{DeviceDescriptor, EventType, LocationRecord, OutgoingMessage, TrackingEvent},
    error::TrackerError,
};

const OUTBOX_CAPACITY: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Fire-and-forget sender of tracking events over one WebSocket connection.
/// Events are dropped, never queued for later, while the connection is not open.
pub struct EventForwarder {
    outbox: Option<mpsc::Sender<Message>>,
    open: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl EventForwarder {
    /// A forwarder with no endpoint; every event is dropped.
    pub fn disconnected() -> Self {
        Self {
            outbox: None,
            open: Arc::new(AtomicBool::new(false)),
            sent: Arc::default(),
            writer: None,
            reader: None,
        }
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        tracing::info!(%url, "connected to event endpoint");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = open.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(err) = ws_tx.send(msg).await {
                    tracing::warn!(?err, "event connection write failed");
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = open.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "event endpoint closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(?err, "event connection receive error");
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            outbox: Some(tx),
            open,
            sent: Arc::default(),
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    #[cfg(test)]
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let forwarder = Self {
            outbox: Some(tx),
            open: Arc::new(AtomicBool::new(true)),
            sent: Arc::default(),
            writer: None,
            reader: None,
        };
        (forwarder, rx)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.outbox.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Number of frames handed to the connection so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn send_event(&self, event_type: EventType, device: &DeviceDescriptor, location: &LocationRecord) {
        let event = TrackingEvent::new(event_type, device, location);
        match self.try_send(&event) {
            Ok(()) => tracing::debug!(
                event_type = %event_type,
                latitude = event.latitude,
                longitude = event.longitude,
                "tracking event sent"
            ),
            Err(err) => tracing::warn!(event_type = %event_type, %err, "tracking event dropped"),
        }
    }

    fn try_send(&self, event: &TrackingEvent) -> Result<(), TrackerError> {
        if !self.is_open() {
            return Err(TrackerError::ConnectionNotOpen);
        }
        let Some(outbox) = self.outbox.as_ref() else {
            return Err(TrackerError::ConnectionNotOpen);
        };

        let message = OutgoingMessage::LocationUpdate(event.clone());
        let serialized = match serde_json::to_string(&message) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(?err, "failed to serialize tracking event");
                return Ok(());
            }
        };

        match outbox.try_send(Message::text(serialized)) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("event outbox is full");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::SeqCst);
                Err(TrackerError::ConnectionNotOpen)
            }
        }
    }

    /// Sends a close frame and waits briefly for the writer to flush it.
    pub async fn close(&mut self) {
        let was_open = self.is_open();
        self.open.store(false, Ordering::SeqCst);

        if let Some(outbox) = self.outbox.take() {
            if was_open {
                let _ = outbox.send(Message::Close(None)).await;
            }
        }
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                tracing::warn!("event connection did not close in time");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        tracing::info!(sent = self.sent_count(), "event connection closed");
    }
}

impl Drop for EventForwarder {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Position, UNKNOWN_ADDRESS};
    use axum::{
        extract::ws::{Message as AxMessage, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
        Router,
    };
    use serde_json::Value;
    use std::net::SocketAddr;

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            device_id: "dev-1".into(),
            device_name: "bench".into(),
            os: "linux 6".into(),
        }
    }

    async fn spawn_receiver(hang_up: bool) -> (String, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let app = Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| {
                let tx = tx.clone();
                async move {
                    ws.on_upgrade(move |mut socket| async move {
                        if hang_up {
                            let _ = socket.close().await;
                            return;
                        }
                        while let Some(Ok(msg)) = socket.recv().await {
                            if let AxMessage::Text(text) = msg {
                                let _ = tx.send(text);
                            }
                        }
                    })
                    .into_response()
                }
            }),
        );

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()));

        (format!("ws://{addr}/ws"), rx)
    }

    #[tokio::test]
    async fn sends_one_frame_per_event() {
        let (url, mut frames) = spawn_receiver(false).await;
        let mut forwarder = EventForwarder::connect(&url).await.unwrap();
        assert!(forwarder.is_open());

        let record = LocationRecord::new(Position::new(1.0, 2.0), "{\"road\":\"Main\"}".into(), None);
        forwarder.send_event(EventType::Start, &device(), &record);
        forwarder.send_event(EventType::Ongoing, &device(), &record);

        let first: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(first["event"], "locationUpdate");
        assert_eq!(first["data"]["eventType"], "START");
        assert_eq!(first["data"]["deviceId"], "dev-1");
        assert_eq!(first["data"]["reverseData"], "{\"road\":\"Main\"}");

        let second: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(second["data"]["eventType"], "ONGOING");
        assert_eq!(forwarder.sent_count(), 2);

        forwarder.close().await;
        assert!(!forwarder.is_open());

        forwarder.send_event(EventType::Finish, &device(), &record);
        assert_eq!(forwarder.sent_count(), 2);
    }

    #[tokio::test]
    async fn disconnected_forwarder_drops_silently() {
        let forwarder = EventForwarder::disconnected();
        let record = LocationRecord::unresolved(Position::ORIGIN, None);

        forwarder.send_event(EventType::Start, &device(), &record);
        assert!(!forwarder.is_open());
        assert_eq!(forwarder.sent_count(), 0);
        assert!(matches!(
            forwarder.try_send(&TrackingEvent::new(EventType::Start, &device(), &record)),
            Err(TrackerError::ConnectionNotOpen)
        ));
    }

    #[tokio::test]
    async fn notices_when_endpoint_hangs_up() {
        let (url, _frames) = spawn_receiver(true).await;
        let forwarder = EventForwarder::connect(&url).await.unwrap();

        let mut closed = false;
        for _ in 0..100 {
            if !forwarder.is_open() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed, "forwarder should notice the remote close");

        forwarder.send_event(
            EventType::Ongoing,
            &device(),
            &LocationRecord::new(Position::ORIGIN, UNKNOWN_ADDRESS.into(), None),
        );
        assert_eq!(forwarder.sent_count(), 0);
    }

    #[tokio::test]
    async fn channel_receives_serialized_envelope() {
        let (forwarder, mut rx) = EventForwarder::channel();
        forwarder.send_event(
            EventType::Finish,
            &device(),
            &LocationRecord::unresolved(Position::new(5.0, 6.0), None),
        );

        let msg = rx.recv().await.unwrap();
        let v: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(v["data"]["eventType"], "FINISH");
        assert_eq!(v["data"]["reverseData"], "Unknown");
    }
}
