//! FreeSWITCH backend
//!
//! The producer keeps one event socket connection open: it queries the
//! registration status of every `freeswitch` extension after connecting, then
//! forwards JSON events carrying an `extension` field and writes queued
//! commands. A lost or refused connection is retried after the reconnect
//! interval.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chart_core::event::{EVENT_FIELD, EXTENSION_FIELD};
use chart_core::Event;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::transport::{EventSocket, EventSocketConnector};
use super::BackendCapability;
use crate::bus::EventBus;
use crate::config::{ExtensionConfig, ExtensionKind, FreeSwitchConfig};
use crate::error::SendError;

/// Event name of a registration status result.
pub const STATUS_EVENT: &str = "GetStatus";

/// Status responses shorter than this carry no registration.
pub const MIN_STATUS_RESPONSE_LEN: usize = 300;

const STATUS_COMMAND: &str = "sofia status profile internal reg";
const EVENT_NAME_HEADER: &str = "Event-Name";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub struct FreeSwitchBackend {
    module: String,
    config: FreeSwitchConfig,
    connector: Option<Arc<dyn EventSocketConnector>>,
    commands: mpsc::UnboundedSender<String>,
    pending: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl FreeSwitchBackend {
    pub fn new(
        module: impl Into<String>,
        config: FreeSwitchConfig,
        connector: Option<Arc<dyn EventSocketConnector>>,
    ) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            module: module.into(),
            config,
            connector,
            commands,
            pending: Mutex::new(pending),
        }
    }

    pub fn config(&self) -> &FreeSwitchConfig {
        &self.config
    }

    async fn serve(
        &self,
        socket: &mut dyn EventSocket,
        extensions: &[ExtensionConfig],
        events: &EventBus,
        pending: &mut mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        socket.subscribe_all().await?;

        let registered = extensions
            .iter()
            .filter(|extension| extension.kind == ExtensionKind::Freeswitch);
        for extension in registered {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let command = format!("{STATUS_COMMAND} {}", extension.id);
            debug!(%command, "querying registration");

            let body = match socket.api(&command, STATUS_TIMEOUT).await {
                Ok(body) => body,
                Err(err) => {
                    warn!(extension = %extension.id, error = %err, "registration query failed");
                    continue;
                }
            };
            if let Some(event) = registration_event(&extension.id, &body) {
                if !events.publish(event).await {
                    return Ok(());
                }
            }
        }

        let owned: HashSet<&str> = extensions.iter().map(|ext| ext.id.as_str()).collect();
        loop {
            while let Ok(command) = pending.try_recv() {
                debug!(%command, "sending command");
                socket.send(&command).await?;
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = socket.recv_event(RECV_TIMEOUT) => received?,
            };
            let Some(body) = received else {
                continue;
            };

            match parse_event_body(&body) {
                Some(event) if owned.contains(event.target.as_str()) => {
                    if !events.publish(event).await {
                        return Ok(());
                    }
                }
                Some(event) => trace!(extension = %event.target, "event for foreign extension ignored"),
                None => trace!("event without extension ignored"),
            }
        }
    }
}

#[async_trait]
impl BackendCapability for FreeSwitchBackend {
    fn kind(&self) -> &'static str {
        "freeswitch"
    }

    fn accepts(&self, kind: ExtensionKind) -> bool {
        matches!(kind, ExtensionKind::Freeswitch | ExtensionKind::FreeswitchAcd)
    }

    async fn fire_send(&self, content: &str, extension: &str) -> Result<(), SendError> {
        debug!(module = %self.module, extension, "queueing command");
        self.commands
            .send(content.to_string())
            .map_err(|_| SendError::Closed(self.module.clone()))
    }

    async fn produce(
        &self,
        extensions: Vec<ExtensionConfig>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let Some(connector) = self.connector.clone() else {
            warn!("no event socket transport configured; producer idle");
            cancel.cancelled().await;
            return Ok(());
        };

        let Ok(mut pending) = self.pending.try_lock() else {
            anyhow::bail!("producer already running for module '{}'", self.module);
        };
        let host = self.config.host.as_str();
        let port = self.config.port;

        while !cancel.is_cancelled() {
            debug!(host, port, "connecting to FreeSWITCH");
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    connector.connect(&self.config, CONNECT_TIMEOUT),
                ) => result,
            };

            let mut socket = match connected {
                Ok(Ok(socket)) => socket,
                Ok(Err(err)) => {
                    error!(host, port, error = %err, "connect to FreeSWITCH failed");
                    if wait_or_cancel(&cancel, self.config.reconnect_interval()).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    error!(host, port, "connect to FreeSWITCH timed out");
                    if wait_or_cancel(&cancel, self.config.reconnect_interval()).await {
                        break;
                    }
                    continue;
                }
            };

            info!(host, port, "connected to FreeSWITCH");
            match self
                .serve(socket.as_mut(), &extensions, &events, &mut pending, &cancel)
                .await
            {
                Ok(()) => break,
                Err(err) => {
                    warn!(error = %err, "event socket connection lost");
                    if wait_or_cancel(&cancel, self.config.reconnect_interval()).await {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Returns true when cancelled before `delay` elapsed.
async fn wait_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Turn a registration status response into a `GetStatus` event.
///
/// Responses shorter than [`MIN_STATUS_RESPONSE_LEN`] mean the extension is
/// not registered and yield nothing.
pub fn registration_event(extension: &str, body: &str) -> Option<Event> {
    if body.len() < MIN_STATUS_RESPONSE_LEN {
        return None;
    }

    let mut event = Event::new(extension, STATUS_EVENT)
        .with_field(EXTENSION_FIELD, extension)
        .with_field(EVENT_FIELD, STATUS_EVENT);
    for label in ["Status", "Auth-User"] {
        if let Some(value) = labelled_value(body, label) {
            event = event.with_field(label, value);
        }
    }
    Some(event)
}

// Text after `<label>:`, left-trimmed, up to the first '(' or line end.
// Trailing whitespace is part of the value.
fn labelled_value<'a>(body: &'a str, label: &str) -> Option<&'a str> {
    let start = body.find(&format!("{label}:"))? + label.len() + 1;
    let rest = body[start..].trim_start();
    let end = rest.find(|c: char| c == '(' || c == '\n').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Convert a JSON event body into an event for the extension it names.
///
/// Non-string values are kept in their JSON text form. Without an `event`
/// field the FreeSWITCH `Event-Name` header names the event.
pub fn parse_event_body(body: &str) -> Option<Event> {
    let value: Value = serde_json::from_str(body).ok()?;
    let mut fields: BTreeMap<String, String> = value
        .as_object()?
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect();

    if !fields.contains_key(EVENT_FIELD) {
        if let Some(name) = fields.get(EVENT_NAME_HEADER).cloned() {
            fields.insert(EVENT_FIELD.to_string(), name);
        }
    }
    Event::from_fields(fields).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;

    fn status_body(status: &str, user: &str) -> String {
        let mut body = format!(
            "Registrations:\n=====\nCall-ID:    \tabc@pbx\nUser:       \t{user}@10.0.0.1\n\
             Agent:      \tLinphone\nStatus:     \t{status}(UDP)(unknown) EXP(2026-10-16 10:00:00)\n\
             Ping-Status:\tReachable\nHost:       \tpbx\nAuth-User:  \t{user}\nAuth-Realm: \t10.0.0.1\n"
        );
        while body.len() < MIN_STATUS_RESPONSE_LEN {
            body.push_str("MWI-Account:\tnone\n");
        }
        body
    }

    #[derive(Default)]
    struct Record {
        api: Vec<String>,
        sent: Vec<String>,
    }

    struct ScriptedSocket {
        status: String,
        events: VecDeque<String>,
        record: Arc<StdMutex<Record>>,
    }

    #[async_trait]
    impl EventSocket for ScriptedSocket {
        async fn subscribe_all(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn api(&mut self, command: &str, _timeout: Duration) -> anyhow::Result<String> {
            self.record.lock().unwrap().api.push(command.to_string());
            Ok(self.status.clone())
        }

        async fn recv_event(&mut self, _timeout: Duration) -> anyhow::Result<Option<String>> {
            if let Some(body) = self.events.pop_front() {
                return Ok(Some(body));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(None)
        }

        async fn send(&mut self, command: &str) -> anyhow::Result<()> {
            self.record.lock().unwrap().sent.push(command.to_string());
            Ok(())
        }
    }

    struct ScriptedConnector {
        failures: usize,
        attempts: AtomicUsize,
        events: Vec<String>,
        record: Arc<StdMutex<Record>>,
    }

    impl ScriptedConnector {
        fn new(failures: usize, events: Vec<String>) -> Self {
            Self {
                failures,
                attempts: AtomicUsize::new(0),
                events,
                record: Arc::new(StdMutex::new(Record::default())),
            }
        }
    }

    #[async_trait]
    impl EventSocketConnector for ScriptedConnector {
        async fn connect(
            &self,
            _config: &FreeSwitchConfig,
            _timeout: Duration,
        ) -> anyhow::Result<Box<dyn EventSocket>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                anyhow::bail!("connection refused");
            }
            Ok(Box::new(ScriptedSocket {
                status: status_body("Registered", "1000"),
                events: self.events.iter().cloned().collect(),
                record: Arc::clone(&self.record),
            }))
        }
    }

    fn fast_config() -> FreeSwitchConfig {
        FreeSwitchConfig {
            reconnect_interval_ms: 10,
            ..FreeSwitchConfig::default()
        }
    }

    fn extensions() -> Vec<ExtensionConfig> {
        vec![
            ExtensionConfig::new("1000", "fs", "agent.yaml", ExtensionKind::Freeswitch),
            ExtensionConfig::new("2000", "fs", "queue.yaml", ExtensionKind::FreeswitchAcd),
        ]
    }

    #[test]
    fn test_registration_event_extracts_status_fields() {
        let event = registration_event("1000", &status_body("Registered", "1000")).unwrap();
        assert_eq!(event.target, "1000");
        assert_eq!(event.name, STATUS_EVENT);
        assert_eq!(event.field("extension"), Some("1000"));
        assert_eq!(event.field("event"), Some(STATUS_EVENT));
        assert_eq!(event.field("Status"), Some("Registered"));
        assert_eq!(event.field("Auth-User"), Some("1000"));
    }

    #[test]
    fn test_labelled_value_keeps_trailing_whitespace() {
        assert_eq!(labelled_value("Status:  Registered (UDP)", "Status"), Some("Registered "));
        assert_eq!(labelled_value("Auth-User:\t1000\nHost: pbx", "Auth-User"), Some("1000"));
        assert_eq!(labelled_value("Host: pbx", "Status"), None);
    }

    #[test]
    fn test_short_registration_response_is_ignored() {
        assert!(registration_event("1000", "Total items returned: 0\n").is_none());
    }

    #[test]
    fn test_registration_event_without_labels() {
        let body = "x".repeat(MIN_STATUS_RESPONSE_LEN);
        let event = registration_event("1000", &body).unwrap();
        assert_eq!(event.field("Status"), None);
        assert_eq!(event.field("Auth-User"), None);
    }

    #[test]
    fn test_parse_event_body() {
        let event =
            parse_event_body(r#"{"extension": "1000", "event": "call_start", "caller": 5551234}"#)
                .unwrap();
        assert_eq!(event.target, "1000");
        assert_eq!(event.name, "call_start");
        assert_eq!(event.field("caller"), Some("5551234"));

        let event =
            parse_event_body(r#"{"extension": "1000", "Event-Name": "CHANNEL_ANSWER"}"#).unwrap();
        assert_eq!(event.name, "CHANNEL_ANSWER");

        assert!(parse_event_body(r#"{"Event-Name": "HEARTBEAT"}"#).is_none());
        assert!(parse_event_body("not json").is_none());
        assert!(parse_event_body("[1, 2]").is_none());
    }

    #[tokio::test]
    async fn test_producer_queries_status_and_forwards_events() {
        let connector = Arc::new(ScriptedConnector::new(
            0,
            vec![
                r#"{"extension": "9999", "event": "call_start"}"#.to_string(),
                r#"{"extension": "2000", "event": "call_start", "caller": "42"}"#.to_string(),
            ],
        ));
        let backend = Arc::new(FreeSwitchBackend::new(
            "fs",
            fast_config(),
            Some(connector.clone()),
        ));
        backend.fire_send("api uuid_answer abc", "1000").await.unwrap();

        let (bus, mut rx) = EventBus::new(16);
        let cancel = CancellationToken::new();
        let producer = {
            let backend = Arc::clone(&backend);
            let cancel = cancel.clone();
            tokio::spawn(async move { backend.produce(extensions(), bus, cancel).await })
        };

        let status = rx.recv().await.unwrap();
        assert_eq!(status.target, "1000");
        assert_eq!(status.name, STATUS_EVENT);
        assert_eq!(status.field("Status"), Some("Registered"));

        // the event for the foreign extension is skipped
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.target, "2000");
        assert_eq!(forwarded.field("caller"), Some("42"));

        cancel.cancel();
        producer.await.unwrap().unwrap();

        let record = connector.record.lock().unwrap();
        assert_eq!(record.api, vec!["sofia status profile internal reg 1000"]);
        assert_eq!(record.sent, vec!["api uuid_answer abc"]);
    }

    #[tokio::test]
    async fn test_producer_reconnects_after_failure() {
        let connector = Arc::new(ScriptedConnector::new(2, Vec::new()));
        let backend = FreeSwitchBackend::new("fs", fast_config(), Some(connector.clone()));
        let (bus, mut rx) = EventBus::new(16);
        let cancel = CancellationToken::new();

        let produce = backend.produce(extensions(), bus, cancel.clone());
        let observe = async {
            let status = rx.recv().await.unwrap();
            cancel.cancel();
            status
        };
        let (result, status) = tokio::join!(produce, observe);

        result.unwrap();
        assert_eq!(status.name, STATUS_EVENT);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_second_producer_is_rejected_without_waiting() {
        let connector = Arc::new(ScriptedConnector::new(0, Vec::new()));
        let backend = FreeSwitchBackend::new("fs", fast_config(), Some(connector.clone()));
        let _running = backend.pending.try_lock().unwrap();
        let (bus, _rx) = EventBus::new(1);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            backend.produce(extensions(), bus, CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(result.is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_producer_without_transport_waits_for_cancel() {
        let backend = FreeSwitchBackend::new("fs", FreeSwitchConfig::default(), None);
        let (bus, _rx) = EventBus::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            backend.produce(extensions(), bus, cancel),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
