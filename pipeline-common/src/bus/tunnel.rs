//! Tunneled binding: JSON frames over a WebSocket to a bus gateway.
//!
//! Used where only HTTP(S) gets out of the network. The gateway owns the real exchange and
//! queues; we publish with sequence numbers and wait for the matching confirm, and consume
//! by tag, settling each delivery with an `ack` or `nack` frame. Payloads are base64 encoded.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::{Acker, BusError, Delivery, EVENT_TYPE_HEADER};
use crate::config::BusConfig;
use crate::secrets::BusCredentials;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Publish {
        seq: u64,
        exchange: String,
        routing_key: String,
        payload: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Confirm {
        seq: u64,
    },
    Reject {
        seq: u64,
        message: String,
    },
    Subscribe {
        queue: String,
        exchange: String,
        routing_keys: Vec<String>,
    },
    Deliver {
        delivery_tag: u64,
        routing_key: String,
        payload: String,
        #[serde(default)]
        redelivery_count: u32,
    },
    Ack {
        delivery_tag: u64,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
        reason: String,
    },
    Error {
        message: String,
    },
}

impl Frame {
    fn to_message(&self) -> Result<Message, BusError> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }

    fn from_text(text: &str) -> Result<Self, BusError> {
        serde_json::from_str(text).map_err(|error| BusError::Protocol(error.to_string()))
    }
}

#[derive(Clone)]
pub struct TunnelSettings {
    pub url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for TunnelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSettings")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl TunnelSettings {
    pub fn new(url: &str) -> Result<Self, BusError> {
        let url = Url::parse(url)
            .map_err(|error| BusError::Config(format!("invalid tunnel url {url}: {error}")))?;

        match url.scheme() {
            "ws" | "wss" => Ok(Self {
                url,
                username: None,
                password: None,
            }),
            scheme => Err(BusError::Config(format!(
                "tunnel url must use ws or wss, got {scheme}"
            ))),
        }
    }

    pub fn from_config(config: &BusConfig, credentials: &BusCredentials) -> Result<Self, BusError> {
        let mut settings = Self::new(&config.tunnel_url)?;

        if config.tls && settings.url.scheme() == "ws" {
            return Err(BusError::Config(
                "MESSAGE_BUS_TLS is set but the tunnel url is not wss".to_owned(),
            ));
        }

        settings.username = credentials.username.clone();
        settings.password = credentials.password.clone();
        Ok(settings)
    }

    fn request(&self) -> Result<Request, BusError> {
        let mut request = self.url.as_str().into_client_request()?;

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            let token = STANDARD.encode(format!("{username}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|error| BusError::Config(format!("invalid credentials: {error}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        Ok(request)
    }

    async fn open(&self) -> Result<Socket, BusError> {
        let (socket, response) = connect_async(self.request()?).await?;
        debug!(status = %response.status(), url = %self.url, "opened bus tunnel");
        Ok(socket)
    }
}

fn decode_payload(payload: &str) -> Result<Vec<u8>, BusError> {
    STANDARD
        .decode(payload)
        .map_err(|error| BusError::Protocol(format!("payload is not base64: {error}")))
}

pub struct TunnelPublisher {
    settings: TunnelSettings,
    socket: Mutex<Option<Socket>>,
    connected: AtomicBool,
    seq: AtomicU64,
}

impl TunnelPublisher {
    pub fn new(settings: TunnelSettings) -> Self {
        Self {
            settings,
            socket: Mutex::new(None),
            connected: AtomicBool::new(false),
            seq: AtomicU64::new(1),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<(), BusError> {
        let socket = self.settings.open().await?;
        *self.socket.lock().await = Some(socket);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self, socket: &mut Option<Socket>) {
        *socket = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    pub async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        event_type: &str,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let mut guard = self.socket.lock().await;
        let socket = guard.as_mut().ok_or(BusError::NotConnected)?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::Publish {
            seq,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: STANDARD.encode(payload),
            headers: HashMap::from([(EVENT_TYPE_HEADER.to_owned(), event_type.to_owned())]),
        };

        if let Err(error) = socket.send(frame.to_message()?).await {
            self.reset(&mut guard);
            return Err(error.into());
        }

        loop {
            let message = match socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(error)) => {
                    self.reset(&mut guard);
                    return Err(error.into());
                }
                None => {
                    self.reset(&mut guard);
                    return Err(BusError::ConnectionClosed);
                }
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => {
                    self.reset(&mut guard);
                    return Err(BusError::ConnectionClosed);
                }
                Message::Binary(_) => {
                    return Err(BusError::Protocol("unexpected binary frame".to_owned()))
                }
                _ => continue,
            };

            match Frame::from_text(&text)? {
                Frame::Confirm { seq: confirmed } if confirmed == seq => return Ok(()),
                Frame::Reject {
                    seq: rejected,
                    message,
                } if rejected == seq => return Err(BusError::Rejected(message)),
                Frame::Error { message } => return Err(BusError::Rejected(message)),
                // Left over from a publish that timed out before its confirm arrived.
                Frame::Confirm { .. } | Frame::Reject { .. } => continue,
                other => {
                    return Err(BusError::Protocol(format!(
                        "expected confirm for {seq}, got {other:?}"
                    )))
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), BusError> {
        let mut guard = self.socket.lock().await;

        if let Some(mut socket) = guard.take() {
            if let Err(error) = socket.close(None).await {
                debug!(error = %error, "error closing bus tunnel");
            }
        }
        self.connected.store(false, Ordering::SeqCst);

        Ok(())
    }
}

pub struct TunnelSubscriber {
    settings: TunnelSettings,
    sink: Arc<Mutex<Option<SocketSink>>>,
    stream: Mutex<Option<SplitStream<Socket>>>,
}

impl TunnelSubscriber {
    pub fn new(settings: TunnelSettings) -> Self {
        Self {
            settings,
            sink: Arc::new(Mutex::new(None)),
            stream: Mutex::new(None),
        }
    }

    pub async fn connect(
        &self,
        exchange: &str,
        queue: &str,
        bindings: &[String],
    ) -> Result<(), BusError> {
        let socket = self.settings.open().await?;
        let (mut sink, stream) = socket.split();

        let frame = Frame::Subscribe {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_keys: bindings.to_vec(),
        };
        sink.send(frame.to_message()?).await?;

        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Delivery, BusError> {
        let stream = self
            .stream
            .get_mut()
            .as_mut()
            .ok_or(BusError::NotConnected)?;

        loop {
            let text = match stream.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Err(BusError::ConnectionClosed),
                Some(Ok(Message::Binary(_))) => {
                    return Err(BusError::Protocol("unexpected binary frame".to_owned()))
                }
                Some(Ok(_)) => continue,
                Some(Err(error)) => return Err(error.into()),
            };

            match Frame::from_text(&text)? {
                Frame::Deliver {
                    delivery_tag,
                    routing_key,
                    payload,
                    redelivery_count,
                } => {
                    return Ok(Delivery {
                        payload: decode_payload(&payload)?,
                        routing_key,
                        redelivery_count,
                        acker: Acker::Tunnel(TunnelAcker {
                            sink: self.sink.clone(),
                            delivery_tag,
                        }),
                    })
                }
                Frame::Error { message } => return Err(BusError::Rejected(message)),
                other => warn!(frame = ?other, "ignoring unexpected frame from gateway"),
            }
        }
    }

    pub async fn close(&self) -> Result<(), BusError> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(error) = sink.close().await {
                debug!(error = %error, "error closing bus tunnel");
            }
        }
        self.stream.lock().await.take();

        Ok(())
    }
}

pub(crate) struct TunnelAcker {
    sink: Arc<Mutex<Option<SocketSink>>>,
    delivery_tag: u64,
}

impl TunnelAcker {
    async fn settle(self, frame: Frame) -> Result<(), BusError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(BusError::ConnectionClosed)?;
        sink.send(frame.to_message()?).await?;
        Ok(())
    }

    pub(crate) async fn ack(self) -> Result<(), BusError> {
        let delivery_tag = self.delivery_tag;
        self.settle(Frame::Ack { delivery_tag }).await
    }

    pub(crate) async fn nack(self, requeue: bool, reason: &str) -> Result<(), BusError> {
        let frame = Frame::Nack {
            delivery_tag: self.delivery_tag,
            requeue,
            reason: reason.to_owned(),
        };
        self.settle(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classify, ErrorClass};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response,
    };

    /// Accept one connection, answer every publish with `reply`, and forward every frame
    /// received to the returned channel.
    async fn start_gateway(
        reply: fn(u64) -> Frame,
        deliveries: Vec<Frame>,
    ) -> (String, mpsc::UnboundedReceiver<Frame>, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/bus", listener.local_addr().unwrap());
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |request: &ServerRequest, response: Response| {
                let auth = request
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                auth_tx.send(auth).unwrap();
                Ok::<Response, ErrorResponse>(response)
            };
            let mut socket = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();

            while let Some(Ok(message)) = socket.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let frame = Frame::from_text(&text).unwrap();

                match &frame {
                    Frame::Publish { seq, .. } => {
                        socket.send(reply(*seq).to_message().unwrap()).await.unwrap();
                    }
                    Frame::Subscribe { .. } => {
                        for delivery in &deliveries {
                            socket.send(delivery.to_message().unwrap()).await.unwrap();
                        }
                    }
                    _ => {}
                }

                if frames_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        (url, frames_rx, auth_rx)
    }

    #[tokio::test]
    async fn test_publish_is_confirmed() {
        let (url, mut frames, mut auth) =
            start_gateway(|seq| Frame::Confirm { seq }, Vec::new()).await;

        let mut settings = TunnelSettings::new(&url).unwrap();
        settings.username = Some("pipeline".to_owned());
        settings.password = Some("secret".to_owned());
        let publisher = TunnelPublisher::new(settings);

        publisher.connect().await.unwrap();
        assert!(publisher.is_connected());
        assert_eq!(
            auth.recv().await.unwrap(),
            format!("Basic {}", STANDARD.encode("pipeline:secret"))
        );

        publisher
            .send("copilot.events", "json.parsed", "JSONParsed", b"{\"a\":1}")
            .await
            .unwrap();

        match frames.recv().await.unwrap() {
            Frame::Publish {
                exchange,
                routing_key,
                payload,
                headers,
                ..
            } => {
                assert_eq!(exchange, "copilot.events");
                assert_eq!(routing_key, "json.parsed");
                assert_eq!(decode_payload(&payload).unwrap(), b"{\"a\":1}");
                assert_eq!(headers[EVENT_TYPE_HEADER], "JSONParsed");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        publisher.disconnect().await.unwrap();
        assert!(!publisher.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_publish_is_classified() {
        let (url, _frames, _auth) = start_gateway(
            |seq| Frame::Reject {
                seq,
                message: "queue temporarily unavailable".to_owned(),
            },
            Vec::new(),
        )
        .await;

        let publisher = TunnelPublisher::new(TunnelSettings::new(&url).unwrap());
        publisher.connect().await.unwrap();

        let error = publisher
            .send("copilot.events", "json.parsed", "JSONParsed", b"{}")
            .await
            .unwrap_err();
        assert!(matches!(error, BusError::Rejected(_)));
        assert_eq!(error.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_subscribe_receive_and_settle() {
        let deliveries = vec![
            Frame::Deliver {
                delivery_tag: 7,
                routing_key: "archive.ingested".to_owned(),
                payload: STANDARD.encode(b"first"),
                redelivery_count: 0,
            },
            Frame::Deliver {
                delivery_tag: 8,
                routing_key: "archive.ingested".to_owned(),
                payload: STANDARD.encode(b"second"),
                redelivery_count: 2,
            },
        ];
        let (url, mut frames, _auth) =
            start_gateway(|seq| Frame::Confirm { seq }, deliveries).await;

        let mut subscriber = TunnelSubscriber::new(TunnelSettings::new(&url).unwrap());
        subscriber
            .connect(
                "copilot.events",
                "parsing",
                &["archive.ingested".to_owned()],
            )
            .await
            .unwrap();

        assert_eq!(
            frames.recv().await.unwrap(),
            Frame::Subscribe {
                queue: "parsing".to_owned(),
                exchange: "copilot.events".to_owned(),
                routing_keys: vec!["archive.ingested".to_owned()],
            }
        );

        let first = subscriber.recv().await.unwrap();
        assert_eq!(first.payload(), b"first");
        first.ack().await.unwrap();
        assert_eq!(frames.recv().await.unwrap(), Frame::Ack { delivery_tag: 7 });

        let second = subscriber.recv().await.unwrap();
        assert_eq!(second.redelivery_count(), 2);
        second.nack(false, "invalid payload").await.unwrap();
        assert_eq!(
            frames.recv().await.unwrap(),
            Frame::Nack {
                delivery_tag: 8,
                requeue: false,
                reason: "invalid payload".to_owned(),
            }
        );

        subscriber.close().await.unwrap();
    }

    #[test]
    fn test_settings_validation() {
        assert!(TunnelSettings::new("wss://bus.example.com/tunnel").is_ok());
        assert!(matches!(
            TunnelSettings::new("https://bus.example.com/tunnel"),
            Err(BusError::Config(_))
        ));
        assert!(matches!(
            TunnelSettings::new("not a url"),
            Err(BusError::Config(_))
        ));
    }

    #[test]
    fn test_frame_format() {
        let frame: Frame =
            serde_json::from_str(r#"{"op": "confirm", "seq": 3}"#).unwrap();
        assert_eq!(frame, Frame::Confirm { seq: 3 });

        let json = serde_json::to_value(Frame::Ack { delivery_tag: 1 }).unwrap();
        assert_eq!(json, serde_json::json!({"op": "ack", "delivery_tag": 1}));
    }
}
