//! MQTT connection lifecycle
//!
//! One task owns the rumqttc event loop. Connection state is published on a
//! `watch` channel for the health monitor. The session is clean, so every
//! ConnAck re-issues all registered subscriptions.

use crate::backoff::{Backoff, Jitter};
use crate::config::{MqttConfig, MqttTransport};
use crate::credentials::BrokerCredentials;
use crate::ingress::Ingress;
use chrono::{DateTime, TimeDelta, Utc};
use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Packet, QoS, Transport};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Anything subscriptions can be issued to without awaiting the event loop
pub trait SubscribeSink {
    fn request_subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError>;
}

impl SubscribeSink for AsyncClient {
    fn request_subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        self.try_subscribe(topic, qos)
    }
}

#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    topics: Vec<(String, QoS)>,
}

impl SubscriptionRegistry {
    pub fn add(&mut self, topic: impl Into<String>, qos: QoS) {
        let topic = topic.into();
        if !self.topics.iter().any(|(t, _)| *t == topic) {
            self.topics.push((topic, qos));
        }
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Issue every registered subscription; returns how many were accepted
    pub fn restore(&self, sink: &impl SubscribeSink) -> usize {
        let mut restored = 0;
        for (topic, qos) in &self.topics {
            match sink.request_subscribe(topic, *qos) {
                Ok(()) => restored += 1,
                Err(e) => warn!(topic = %topic, "Failed to subscribe: {}", e),
            }
        }
        restored
    }
}

/// Attempt counter for reconnect backoff; resets on every ConnAck
#[derive(Debug)]
pub struct ReconnectTracker {
    attempt: u32,
    backoff: Backoff,
}

impl ReconnectTracker {
    pub fn new(backoff: Backoff) -> Self {
        Self { attempt: 0, backoff }
    }

    pub fn on_connected(&mut self) {
        self.attempt = 0;
    }

    /// Attempt number and delay before the next connect
    pub fn on_connection_lost(&mut self) -> (u32, Duration) {
        self.attempt = self.attempt.saturating_add(1);
        (self.attempt, self.backoff.delay(self.attempt))
    }
}

pub struct MqttSession {
    config: MqttConfig,
    broker: BrokerCredentials,
    subscriptions: SubscriptionRegistry,
    state: watch::Sender<ConnectionState>,
}

impl MqttSession {
    pub fn new(config: &MqttConfig, broker: &BrokerCredentials) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let mut subscriptions = SubscriptionRegistry::default();
        subscriptions.add(config.topic.clone(), QoS::AtLeastOnce);
        Self {
            config: config.clone(),
            broker: broker.clone(),
            subscriptions,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn options(&self) -> MqttOptions {
        let client_id = format!("{}-{}", self.config.client_id, uuid::Uuid::new_v4().simple());
        let c = &self.config;
        let (address, transport) = match (c.transport, c.tls) {
            (MqttTransport::Tcp, false) => (c.host.clone(), Transport::Tcp),
            (MqttTransport::Tcp, true) => (c.host.clone(), Transport::tls_with_default_config()),
            (MqttTransport::Ws, false) => (
                format!("ws://{}:{}{}", c.host, c.port, c.ws_path),
                Transport::Ws,
            ),
            (MqttTransport::Ws, true) => (
                format!("wss://{}:{}{}", c.host, c.port, c.ws_path),
                Transport::wss_with_default_config(),
            ),
        };

        let mut options = MqttOptions::new(client_id, address, c.port);
        options.set_transport(transport);
        options.set_keep_alive(Duration::from_secs(c.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(username) = &self.broker.username {
            options.set_credentials(username.clone(), self.broker.password.clone().unwrap_or_default());
        }
        options
    }

    /// Own the event loop until shutdown; connection loss is never fatal
    pub async fn run(self, ingress: Arc<Ingress>, shutdown: CancellationToken) {
        let options = self.options();
        info!(
            "Connecting to MQTT broker {}:{} as {}",
            self.config.host,
            self.config.port,
            options.client_id()
        );

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let mut reconnect = ReconnectTracker::new(Backoff::new(
            Duration::from_millis(self.config.reconnect_base_ms),
            Duration::from_millis(self.config.reconnect_cap_ms),
            Jitter::Equal,
        ));
        self.state.send_replace(ConnectionState::Connecting);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("MQTT session shutting down");
                    let _ = client.disconnect().await;
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        reconnect.on_connected();
                        self.state.send_replace(ConnectionState::Connected);
                        let restored = self.subscriptions.restore(&client);
                        info!(
                            "Connected to MQTT broker, {} of {} subscription(s) issued",
                            restored,
                            self.subscriptions.len()
                        );
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        // rejections are counted and logged by ingress
                        let _ = ingress.on_message(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        debug!(pkid = ack.pkid, "Subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let (attempt, delay) = reconnect.on_connection_lost();
                        let next_retry_at =
                            Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
                        self.state.send_replace(ConnectionState::Backoff { attempt, next_retry_at });
                        warn!(
                            attempt,
                            "MQTT connection error: {}. Reconnecting in {:?}", e, delay
                        );

                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        self.state.send_replace(ConnectionState::Connecting);
                    }
                }
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!("MQTT session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngressConfig, OverflowPolicy};
    use crate::health::Liveness;
    use crate::ingress::queue::IntakeQueue;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSink {
        issued: Mutex<Vec<String>>,
    }

    impl SubscribeSink for RecordingSink {
        fn request_subscribe(&self, topic: &str, _qos: QoS) -> Result<(), ClientError> {
            self.issued.lock().unwrap().push(topic.to_string());
            Ok(())
        }
    }

    /// Splits one MQTT control packet off the front of `buf`:
    /// (packet type, variable header + payload, bytes consumed)
    fn next_packet(buf: &[u8]) -> Option<(u8, &[u8], usize)> {
        let mut length = 0usize;
        let mut shift = 0;
        let mut i = 1;
        loop {
            let byte = *buf.get(i)?;
            length |= ((byte & 0x7f) as usize) << shift;
            i += 1;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let end = i + length;
        (buf.len() >= end).then(|| (buf[0] >> 4, &buf[i..end], end))
    }

    /// Broker stand-in: acknowledges CONNECT and SUBSCRIBE, reports each
    /// subscribed topic with its connection number, then drops the
    /// connection so the client has to reconnect
    async fn flaky_broker() -> (u16, mpsc::UnboundedReceiver<(usize, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut connection = 0;
            while let Ok((mut stream, _)) = listener.accept().await {
                connection += 1;
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                'conn: loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                    while let Some((kind, body, used)) = next_packet(&buf) {
                        let subscribed = match kind {
                            // CONNECT -> CONNACK
                            1 => {
                                let _ = stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await;
                                None
                            }
                            // SUBSCRIBE -> SUBACK granting QoS 1
                            8 => {
                                let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
                                let topic = String::from_utf8_lossy(&body[4..4 + topic_len]).into_owned();
                                let ack = [0x90, 0x03, body[0], body[1], 0x01];
                                let _ = stream.write_all(&ack).await;
                                Some(topic)
                            }
                            _ => None,
                        };
                        buf.drain(..used);
                        if let Some(topic) = subscribed {
                            let _ = seen.send((connection, topic));
                            break 'conn;
                        }
                    }
                }
            }
        });
        (port, rx)
    }

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1_000), Duration::from_millis(60_000), Jitter::Equal)
    }

    #[test]
    fn test_reconnect_restores_all_subscriptions() {
        let mut registry = SubscriptionRegistry::default();
        registry.add("ati_fm/+/status", QoS::AtLeastOnce);
        registry.add("fleet/+/pose", QoS::AtLeastOnce);
        registry.add("ati_fm/+/status", QoS::AtLeastOnce);
        assert_eq!(registry.len(), 2);

        let sink = RecordingSink::default();
        let mut tracker = ReconnectTracker::new(backoff());

        tracker.on_connected();
        assert_eq!(registry.restore(&sink), 2);

        // connection drops twice before the broker comes back
        assert_eq!(tracker.on_connection_lost().0, 1);
        assert_eq!(tracker.on_connection_lost().0, 2);
        tracker.on_connected();
        assert_eq!(registry.restore(&sink), 2);
        assert_eq!(tracker.on_connection_lost().0, 1);

        let issued = sink.issued.lock().unwrap();
        assert_eq!(
            *issued,
            vec!["ati_fm/+/status", "fleet/+/pose", "ati_fm/+/status", "fleet/+/pose"]
        );
    }

    #[test]
    fn test_reconnect_delay_grows_with_attempts() {
        let mut tracker = ReconnectTracker::new(backoff());
        let (_, first) = tracker.on_connection_lost();
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1_000));
        for _ in 0..10 {
            tracker.on_connection_lost();
        }
        let (attempt, late) = tracker.on_connection_lost();
        assert_eq!(attempt, 12);
        assert!(late >= Duration::from_secs(30) && late <= Duration::from_secs(60));
    }

    #[test]
    fn test_options_for_websocket_transport() {
        let config = MqttConfig {
            host: "broker.example.com".to_string(),
            port: 8884,
            transport: MqttTransport::Ws,
            ..MqttConfig::default()
        };
        let broker = BrokerCredentials {
            username: Some("relay".to_string()),
            password: Some("pw".to_string()),
        };
        let options = MqttSession::new(&config, &broker).options();
        assert_eq!(
            options.broker_address(),
            ("ws://broker.example.com:8884/mqtt".to_string(), 8884)
        );
        assert!(options.client_id().starts_with("telemetry-relay-"));
        assert!(options.clean_session());
    }

    #[tokio::test]
    async fn test_unreachable_broker_enters_backoff() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..MqttConfig::default()
        };
        let broker = BrokerCredentials {
            username: None,
            password: None,
        };
        let session = MqttSession::new(&config, &broker);
        let mut state = session.state();

        let queue = Arc::new(IntakeQueue::new(4, 4, OverflowPolicy::RejectNew));
        let ingress = Arc::new(Ingress::new(
            &IngressConfig::default(),
            &config.topic,
            queue,
            Arc::new(Liveness::default()),
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(session.run(ingress, shutdown.clone()));

        let entered_backoff = tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, ConnectionState::Backoff { attempt: 1, .. })),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(entered_backoff);

        shutdown.cancel();
        task.await.unwrap();
        assert!(matches!(*state.borrow(), ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_run_resubscribes_after_broker_drops_connection() {
        let (port, mut seen) = flaky_broker().await;
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            reconnect_base_ms: 10,
            reconnect_cap_ms: 50,
            ..MqttConfig::default()
        };
        let broker = BrokerCredentials {
            username: None,
            password: None,
        };
        let session = MqttSession::new(&config, &broker);
        let queue = Arc::new(IntakeQueue::new(4, 4, OverflowPolicy::RejectNew));
        let ingress = Arc::new(Ingress::new(
            &IngressConfig::default(),
            &config.topic,
            queue,
            Arc::new(Liveness::default()),
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(session.run(ingress, shutdown.clone()));

        for expected in 1..=2 {
            let (connection, topic) = tokio::time::timeout(Duration::from_secs(5), seen.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(connection, expected);
            assert_eq!(topic, "ati_fm/+/status");
        }

        shutdown.cancel();
        task.await.unwrap();
    }
}
