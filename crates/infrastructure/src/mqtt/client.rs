use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use domain::status::ErrorLog;
use domain::{GatewayError, Result};

use super::MqttPublisherClient;

fn default_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_reconnect_period_ms() -> u64 {
    5000
}

fn default_topic_prefix() -> String {
    "modbus".to_string()
}

/// Broker connection settings. The url accepts mqtt, mqtts, ws and wss
/// schemes; credentials are passed through to CONNECT unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period_ms: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            client_id: None,
            username: None,
            password: None,
            reconnect_period_ms: default_reconnect_period_ms(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

/// Inbound message handed to a subscription handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type MessageHandler = Arc<dyn Fn(InboundMessage) -> HandlerFuture + Send + Sync>;

struct SubscriptionEntry {
    qos: QoS,
    handler: MessageHandler,
}

struct Shared {
    connected: AtomicBool,
    // Keyed by full prefixed topic; insert replaces, so a second subscribe
    // to the same topic swaps the handler without duplicating dispatch.
    subscriptions: RwLock<HashMap<String, SubscriptionEntry>>,
    errors: Arc<ErrorLog>,
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// MQTT client wrapper: connects, auto-reconnects, re-subscribes, and
/// dispatches inbound messages to registered handlers.
pub struct MqttClient {
    settings: MqttSettings,
    shared: Arc<Shared>,
    client: RwLock<Option<AsyncClient>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    pub fn new(settings: MqttSettings, errors: Arc<ErrorLog>) -> Self {
        Self {
            settings,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                subscriptions: RwLock::new(HashMap::new()),
                errors,
            }),
            client: RwLock::new(None),
            event_loop: Mutex::new(None),
        }
    }

    pub fn topic_prefix(&self) -> &str {
        &self.settings.topic_prefix
    }

    /// Full topic as stored and published: `<prefix>/<topic>`.
    pub fn prefixed(&self, topic: &str) -> String {
        format!("{}/{}", self.settings.topic_prefix, topic)
    }

    fn build_options(&self) -> Result<MqttOptions> {
        let client_id = self
            .settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("modbus-gateway-{}", std::process::id()));

        // parse_url requires the client id as a query parameter
        let mut url = self.settings.url.clone();
        if !url.contains("client_id=") {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&format!("client_id={client_id}"));
        }

        let mut options = MqttOptions::parse_url(&url).map_err(|e| {
            GatewayError::MqttConnection(format!("invalid broker url {}: {e}", self.settings.url))
        })?;
        options.set_keep_alive(Duration::from_secs(20));
        options.set_clean_session(true);
        if let Some(username) = &self.settings.username {
            options.set_credentials(
                username,
                self.settings.password.clone().unwrap_or_default(),
            );
        }
        Ok(options)
    }

    /// Open the connection. Resolves on the first CONNACK, fails on the
    /// first connection error; later disconnects are retried transparently
    /// by the event loop.
    pub async fn connect(&self) -> Result<()> {
        if self.client.read().unwrap().is_some() {
            return Ok(());
        }

        let options = self.build_options()?;
        let (client, event_loop) = AsyncClient::new(options, 100);
        let (first_tx, first_rx) = oneshot::channel();

        let handle = tokio::spawn(run_event_loop(
            event_loop,
            self.shared.clone(),
            client.clone(),
            Duration::from_millis(self.settings.reconnect_period_ms),
            first_tx,
        ));

        *self.client.write().unwrap() = Some(client);
        *self.event_loop.lock().unwrap() = Some(handle);

        match first_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.stop().await;
                Err(err)
            }
            Err(_) => {
                self.stop().await;
                Err(GatewayError::MqttConnection(
                    "connection task ended before the first CONNACK".to_string(),
                ))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn require_client(&self) -> Result<AsyncClient> {
        let client = self
            .client
            .read()
            .unwrap()
            .as_ref()
            .ok_or(GatewayError::MqttNotInitialized)?
            .clone();
        if !self.is_connected() {
            return Err(GatewayError::MqttNotConnected);
        }
        Ok(client)
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<()> {
        let client = self.require_client()?;
        let full = self.prefixed(topic);
        client
            .publish(full, to_qos(qos), retain, payload)
            .await
            .map_err(|e| GatewayError::MqttOperation(format!("publish failed: {e}")))
    }

    pub async fn subscribe(&self, topic: &str, qos: u8, handler: MessageHandler) -> Result<()> {
        let client = self.require_client()?;
        let full = self.prefixed(topic);
        let qos = to_qos(qos);
        self.shared
            .subscriptions
            .write()
            .unwrap()
            .insert(full.clone(), SubscriptionEntry { qos, handler });
        client
            .subscribe(&full, qos)
            .await
            .map_err(|e| GatewayError::MqttOperation(format!("subscribe to {full} failed: {e}")))
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let client = self.require_client()?;
        let full = self.prefixed(topic);
        self.shared.subscriptions.write().unwrap().remove(&full);
        client
            .unsubscribe(&full)
            .await
            .map_err(|e| GatewayError::MqttOperation(format!("unsubscribe from {full} failed: {e}")))
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.read().unwrap().len()
    }

    pub fn has_subscription(&self, topic: &str) -> bool {
        self.shared
            .subscriptions
            .read()
            .unwrap()
            .contains_key(&self.prefixed(topic))
    }

    pub fn subscription_topics(&self) -> Vec<String> {
        self.shared
            .subscriptions
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    /// Idempotent and safe from any state; drops every registered handler.
    pub async fn stop(&self) {
        let client = self.client.write().unwrap().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        if let Some(handle) = self.event_loop.lock().unwrap().take() {
            handle.abort();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.subscriptions.write().unwrap().clear();
    }
}

#[async_trait]
impl MqttPublisherClient for MqttClient {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<()> {
        self.publish(topic, payload, qos, retain).await
    }

    fn is_connected(&self) -> bool {
        MqttClient::is_connected(self)
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    shared: Arc<Shared>,
    client: AsyncClient,
    reconnect_period: Duration,
    first_tx: oneshot::Sender<Result<()>>,
) {
    let mut first = Some(first_tx);
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("connected to MQTT broker");
                    shared.connected.store(true, Ordering::SeqCst);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    resubscribe(&shared, &client).await;
                } else {
                    let message = format!("MQTT connection rejected: {:?}", ack.code);
                    error!("{message}");
                    shared.connected.store(false, Ordering::SeqCst);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Err(GatewayError::MqttConnection(message)));
                        return;
                    }
                    tokio::time::sleep(reconnect_period).await;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                dispatch_publish(&shared, publish).await;
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(GatewayError::MqttConnection(e.to_string())));
                    return;
                }
                error!(error = %e, "MQTT connection error, retrying");
                tokio::time::sleep(reconnect_period).await;
            }
        }
    }
}

/// The broker replays the session state; we replay ours. Handlers are keyed
/// by topic, so re-subscribing never duplicates dispatch.
async fn resubscribe(shared: &Shared, client: &AsyncClient) {
    let topics: Vec<(String, QoS)> = shared
        .subscriptions
        .read()
        .unwrap()
        .iter()
        .map(|(topic, entry)| (topic.clone(), entry.qos))
        .collect();
    if topics.is_empty() {
        return;
    }
    info!(count = topics.len(), "re-subscribing to topics");
    for (topic, qos) in topics {
        if let Err(e) = client.subscribe(&topic, qos).await {
            error!(topic = %topic, error = %e, "failed to re-subscribe");
        }
    }
}

/// Look up the handler for the full topic and run it. A failing handler is
/// logged and recorded; it never takes the bridge down.
async fn dispatch_publish(shared: &Shared, publish: Publish) {
    let topic = publish.topic.clone();
    let handler = shared
        .subscriptions
        .read()
        .unwrap()
        .get(&topic)
        .map(|entry| entry.handler.clone());
    let Some(handler) = handler else {
        return;
    };
    let message = InboundMessage {
        topic: topic.clone(),
        payload: publish.payload.to_vec(),
        qos: publish.qos as u8,
        retain: publish.retain,
    };
    if let Err(e) = handler(message).await {
        let message = format!("Handler error for {topic}: {e}");
        error!("{message}");
        shared.errors.push(message);
    } else if publish.retain {
        // retained replays arrive on subscribe; keep them out of warn logs
        tracing::debug!(topic = %topic, "handled retained message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_client() -> MqttClient {
        MqttClient::new(MqttSettings::default(), Arc::new(ErrorLog::new()))
    }

    fn make_publish(topic: &str, payload: &[u8]) -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.to_string(),
            pkid: 0,
            payload: bytes::Bytes::copy_from_slice(payload),
        }
    }

    fn shared_with(errors: Arc<ErrorLog>) -> Shared {
        Shared {
            connected: AtomicBool::new(true),
            subscriptions: RwLock::new(HashMap::new()),
            errors,
        }
    }

    #[test]
    fn test_topic_prefixing() {
        let client = test_client();
        assert_eq!(client.prefixed("error/test"), "modbus/error/test");
        assert_eq!(client.topic_prefix(), "modbus");
    }

    #[test]
    fn test_operations_before_connect_fail_not_initialized() {
        let client = test_client();
        let err = tokio_test::block_on(client.publish("t", b"x", 0, false)).unwrap_err();
        assert_eq!(err, GatewayError::MqttNotInitialized);
        assert_eq!(err.to_string(), "MQTT client not initialized");

        let handler: MessageHandler = Arc::new(|_| Box::pin(async { Ok(()) }));
        let err = tokio_test::block_on(client.subscribe("t", 0, handler)).unwrap_err();
        assert_eq!(err, GatewayError::MqttNotInitialized);

        let err = tokio_test::block_on(client.unsubscribe("t")).unwrap_err();
        assert_eq!(err, GatewayError::MqttNotInitialized);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_clears_subscriptions() {
        let client = test_client();
        let handler: MessageHandler = Arc::new(|_| Box::pin(async { Ok(()) }));
        client.shared.subscriptions.write().unwrap().insert(
            "modbus/a".to_string(),
            SubscriptionEntry {
                qos: QoS::AtMostOnce,
                handler,
            },
        );
        client.stop().await;
        assert_eq!(client.subscription_count(), 0);
        client.stop().await;
        assert_eq!(client.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_invokes_matching_handler() {
        let errors = Arc::new(ErrorLog::new());
        let shared = shared_with(errors.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let handler: MessageHandler = Arc::new(move |message| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                assert_eq!(message.payload, b"42");
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        shared.subscriptions.write().unwrap().insert(
            "modbus/good/test".to_string(),
            SubscriptionEntry {
                qos: QoS::AtMostOnce,
                handler,
            },
        );

        dispatch_publish(&shared, make_publish("modbus/good/test", b"42")).await;
        dispatch_publish(&shared, make_publish("modbus/other", b"42")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler_is_recorded_not_fatal() {
        let errors = Arc::new(ErrorLog::new());
        let shared = shared_with(errors.clone());
        let failing: MessageHandler = Arc::new(|_| {
            Box::pin(async { Err(GatewayError::Handler("Test error".to_string())) })
        });
        shared.subscriptions.write().unwrap().insert(
            "modbus/error/test".to_string(),
            SubscriptionEntry {
                qos: QoS::AtMostOnce,
                handler: failing,
            },
        );
        let good_calls = Arc::new(AtomicUsize::new(0));
        let good_calls_clone = good_calls.clone();
        let good: MessageHandler = Arc::new(move |_| {
            let calls = good_calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        shared.subscriptions.write().unwrap().insert(
            "modbus/good/test".to_string(),
            SubscriptionEntry {
                qos: QoS::AtMostOnce,
                handler: good,
            },
        );

        dispatch_publish(&shared, make_publish("modbus/error/test", b"Error message")).await;
        dispatch_publish(&shared, make_publish("modbus/good/test", b"ok")).await;

        let recorded = errors.snapshot();
        assert_eq!(recorded.len(), 1);
        assert!(
            recorded[0].starts_with("Handler error for modbus/error/test:"),
            "unexpected error entry: {}",
            recorded[0]
        );
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_subscribe_replaces_handler() {
        let errors = Arc::new(ErrorLog::new());
        let shared = shared_with(errors);
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        for calls in [first_calls.clone(), second_calls.clone()] {
            let handler: MessageHandler = Arc::new(move |_| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
            shared.subscriptions.write().unwrap().insert(
                "modbus/t".to_string(),
                SubscriptionEntry {
                    qos: QoS::AtMostOnce,
                    handler,
                },
            );
        }

        dispatch_publish(&shared, make_publish("modbus/t", b"x")).await;
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_build_options_rejects_bad_url() {
        let client = MqttClient::new(
            MqttSettings {
                url: "not a url".to_string(),
                ..MqttSettings::default()
            },
            Arc::new(ErrorLog::new()),
        );
        assert!(client.build_options().is_err());
    }
}
