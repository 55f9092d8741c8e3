//! Broker telemetry: presence status and one message per cycle
//!
//! Topics (prefix + cell + device):
//! - `{prefix}{cell}/{device}/status` - retained presence, QoS 2; last will `offline`
//! - `{prefix}{cell}/{device}/cycle_data` - one message per cycle, QoS 0, not retained
//!
//! The publisher never blocks the control loop. Cycle messages are only sent
//! while the link reports Connected; anything produced during an outage is
//! dropped here (the event store keeps the durable copy). Reconnects are driven
//! from `tick` with exponential backoff between the configured bounds.

use crate::domain::CycleEvent;
use crate::infra::config::{secs_to_duration, BrokerSettings, IdentitySettings};
use crate::infra::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Field-set version carried in every JSON payload
pub const PAYLOAD_VERSION: u32 = 1;

/// Last-will payload registered with the broker
pub const OFFLINE_PAYLOAD: &str = "offline";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("broker connection is not established")]
    Disconnected,
    #[error("broker client rejected the request: {0}")]
    Rejected(String),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TelemetryError {
    /// Disconnected clears on its own once a reconnect succeeds
    pub fn is_retryable(&self) -> bool {
        matches!(self, TelemetryError::Disconnected)
    }
}

/// Publisher's belief about broker connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Delivery class of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Retained, exactly once (presence status)
    Retained,
    /// Not retained, at most once (cycle data)
    BestEffort,
}

/// Everything a link needs to (re)open a session
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Topic for the retained `offline` last will
    pub will_topic: String,
}

/// Connection to a pub/sub broker
///
/// `open` replaces any previous session. `publish` must not block; it
/// queues the message with the transport or fails.
#[async_trait]
pub trait BrokerLink: Send {
    fn state(&self) -> ConnectionState;
    fn open(&mut self, options: &LinkOptions) -> Result<(), TelemetryError>;
    fn publish(&mut self, topic: &str, payload: Vec<u8>, delivery: Delivery) -> Result<(), TelemetryError>;
    /// Disconnect cleanly, flushing queued messages where possible
    async fn close(&mut self);
}

/// Presence value of the status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// Retained status message
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub v: u32,
    pub status: Presence,
    pub timestamp: f64,
    /// Local time as dd-mm-yy HH:MM:SS
    pub timestamp_human: String,
}

impl StatusPayload {
    pub fn new(status: Presence, timestamp: f64) -> Self {
        Self { v: PAYLOAD_VERSION, status, timestamp, timestamp_human: human_timestamp(timestamp) }
    }
}

/// Cycle message: the event's fields flattened next to the version
#[derive(Debug, Serialize)]
pub struct CyclePayload<'a> {
    pub v: u32,
    #[serde(flatten)]
    pub event: &'a CycleEvent,
}

/// Format epoch seconds in local time as dd-mm-yy HH:MM:SS
pub fn human_timestamp(epoch: f64) -> String {
    if !epoch.is_finite() {
        return String::new();
    }
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1e9) as u32;
    match DateTime::<Utc>::from_timestamp(secs, nanos) {
        Some(dt) => dt.with_timezone(&Local).format("%d-%m-%y %H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// Topic names derived from identity settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub status: String,
    pub cycle_data: String,
}

impl Topics {
    pub fn new(prefix: &str, identity: &IdentitySettings) -> Self {
        let base = format!("{prefix}{}/{}", identity.cell_name, identity.device_name);
        Self { status: format!("{base}/status"), cycle_data: format!("{base}/cycle_data") }
    }
}

/// Doubling delay between reconnect attempts, reset on success
#[derive(Debug, Clone)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, current: min }
    }

    /// Delay before the next attempt; doubles the one after
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Broker and identity settings the publisher was built from
#[derive(Debug, Clone, PartialEq)]
struct PublisherSettings {
    broker: BrokerSettings,
    identity: IdentitySettings,
}

impl PublisherSettings {
    fn link_options(&self, topics: &Topics) -> LinkOptions {
        LinkOptions {
            client_id: format!("{}_{}", self.identity.cell_name, self.identity.device_name),
            host: self.broker.host.clone(),
            port: self.broker.port,
            username: self.broker.username.clone(),
            password: self.broker.password.clone(),
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            will_topic: topics.status.clone(),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            secs_to_duration(self.broker.reconnect_min_secs),
            secs_to_duration(self.broker.reconnect_max_secs),
        )
    }
}

/// At-most-once-while-connected delivery of status and cycle messages
pub struct TelemetryPublisher<L: BrokerLink> {
    link: L,
    settings: PublisherSettings,
    topics: Topics,
    backoff: Backoff,
    next_attempt: Option<Instant>,
    /// Online status published for the current session
    announced: bool,
    /// Link has been opened at least once since the last close
    opened: bool,
    metrics: Arc<Metrics>,
}

impl<L: BrokerLink> TelemetryPublisher<L> {
    pub fn new(link: L, broker: &BrokerSettings, identity: &IdentitySettings, metrics: Arc<Metrics>) -> Self {
        let settings = PublisherSettings { broker: broker.clone(), identity: identity.clone() };
        let topics = Topics::new(&broker.topic_prefix, identity);
        if !broker.enabled() {
            info!("telemetry_disabled");
        }
        Self {
            link,
            backoff: settings.backoff(),
            settings,
            topics,
            next_attempt: None,
            announced: false,
            opened: false,
            metrics,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn is_connected(&self) -> bool {
        self.link.state() == ConnectionState::Connected
    }

    /// Drive connection upkeep; called once per control-loop tick
    pub fn tick(&mut self, now: Instant) {
        if !self.settings.broker.enabled() {
            return;
        }
        match self.link.state() {
            ConnectionState::Connected => {
                if !self.announced {
                    self.backoff.reset();
                    self.next_attempt = None;
                    match self.publish_status(Presence::Online) {
                        Ok(()) => {
                            self.announced = true;
                            info!(topic = %self.topics.status, "telemetry_online");
                        }
                        Err(e) => warn!(error = %e, retryable = %e.is_retryable(), "telemetry_status_failed"),
                    }
                }
            }
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected => {
                if self.announced {
                    warn!("telemetry_connection_lost");
                    self.announced = false;
                }
                if self.next_attempt.is_some_and(|at| now < at) {
                    return;
                }
                let delay = self.backoff.next_delay();
                self.next_attempt = Some(now + delay);
                let options = self.settings.link_options(&self.topics);
                if self.opened {
                    self.metrics.record_broker_reconnect();
                }
                info!(
                    host = %options.host,
                    port = %options.port,
                    retry_in_ms = %delay.as_millis(),
                    "telemetry_connecting"
                );
                match self.link.open(&options) {
                    Ok(()) => self.opened = true,
                    Err(e) => warn!(error = %e, "telemetry_open_failed"),
                }
            }
        }
    }

    /// Publish one cycle if connected; dropped otherwise. Returns whether it was sent.
    pub fn publish_cycle(&mut self, event: &CycleEvent) -> bool {
        let result = self.try_publish_cycle(event);
        self.metrics.record_telemetry(result.is_ok());
        match result {
            Ok(()) => {
                debug!(id = %event.id, topic = %self.topics.cycle_data, "cycle_published");
                true
            }
            Err(TelemetryError::Disconnected) => {
                debug!(id = %event.id, "cycle_telemetry_dropped_disconnected");
                false
            }
            Err(e) => {
                warn!(id = %event.id, error = %e, retryable = %e.is_retryable(), "cycle_telemetry_failed");
                false
            }
        }
    }

    fn try_publish_cycle(&mut self, event: &CycleEvent) -> Result<(), TelemetryError> {
        if !self.settings.broker.enabled() || self.link.state() != ConnectionState::Connected {
            return Err(TelemetryError::Disconnected);
        }
        let payload = serde_json::to_vec(&CyclePayload { v: PAYLOAD_VERSION, event })?;
        self.link.publish(&self.topics.cycle_data, payload, Delivery::BestEffort)
    }

    /// Adopt new broker/identity settings, reconnecting if they changed
    pub async fn apply_settings(&mut self, broker: &BrokerSettings, identity: &IdentitySettings) {
        let next = PublisherSettings { broker: broker.clone(), identity: identity.clone() };
        if next == self.settings {
            return;
        }
        info!(host = %broker.host, port = %broker.port, cell = %identity.cell_name, "telemetry_settings_changed");
        self.close_session().await;
        self.topics = Topics::new(&next.broker.topic_prefix, &next.identity);
        self.backoff = next.backoff();
        self.settings = next;
        self.next_attempt = None;
    }

    /// Publish retained offline status and disconnect
    pub async fn shutdown(&mut self) {
        self.close_session().await;
        info!("telemetry_stopped");
    }

    async fn close_session(&mut self) {
        if self.link.state() == ConnectionState::Connected {
            if let Err(e) = self.publish_status(Presence::Offline) {
                warn!(error = %e, "telemetry_offline_status_failed");
            }
        }
        if self.opened {
            self.link.close().await;
            self.opened = false;
        }
        self.announced = false;
    }

    fn publish_status(&mut self, status: Presence) -> Result<(), TelemetryError> {
        let payload = serde_json::to_vec(&StatusPayload::new(status, crate::domain::epoch_secs()))?;
        self.link.publish(&self.topics.status, payload, Delivery::Retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Link whose state is set by the test; records every publish
    #[derive(Default)]
    struct FakeLink {
        state: Option<ConnectionState>,
        opens: Vec<LinkOptions>,
        published: Vec<(String, serde_json::Value, Delivery)>,
        closes: usize,
    }

    #[async_trait]
    impl BrokerLink for FakeLink {
        fn state(&self) -> ConnectionState {
            self.state.unwrap_or(ConnectionState::Disconnected)
        }

        fn open(&mut self, options: &LinkOptions) -> Result<(), TelemetryError> {
            self.opens.push(options.clone());
            self.state = Some(ConnectionState::Connecting);
            Ok(())
        }

        fn publish(&mut self, topic: &str, payload: Vec<u8>, delivery: Delivery) -> Result<(), TelemetryError> {
            let value = serde_json::from_slice(&payload).unwrap();
            self.published.push((topic.to_string(), value, delivery));
            Ok(())
        }

        async fn close(&mut self) {
            self.closes += 1;
            self.state = Some(ConnectionState::Disconnected);
        }
    }

    fn publisher() -> TelemetryPublisher<FakeLink> {
        let broker = BrokerSettings { reconnect_min_secs: 1.0, reconnect_max_secs: 4.0, ..BrokerSettings::default() };
        TelemetryPublisher::new(FakeLink::default(), &broker, &IdentitySettings::default(), Arc::new(Metrics::new()))
    }

    fn event(id: i64) -> CycleEvent {
        CycleEvent {
            id,
            start_ts: id as f64,
            cycle_length: Some(30.0),
            part_1: false,
            part_2: true,
            box_present: false,
            inter_cycle_time: Some(45.5),
        }
    }

    #[test]
    fn test_topics_from_identity() {
        let topics = Topics::new("tdg/tdf/", &IdentitySettings::default());
        assert_eq!(topics.status, "tdg/tdf/disa3/optical_counter/status");
        assert_eq!(topics.cycle_data, "tdg/tdf/disa3/optical_counter/cycle_data");
    }

    #[test]
    fn test_cycle_payload_shape() {
        let event = event(1_700_000_000);
        let json = serde_json::to_value(CyclePayload { v: PAYLOAD_VERSION, event: &event }).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["id"], 1_700_000_000i64);
        assert_eq!(json["timestamp"], 1_700_000_000.0);
        assert_eq!(json["part_2"], true);
        assert_eq!(json["inter_cycle_time"], 45.5);
    }

    #[test]
    fn test_status_payload_shape() {
        let json = serde_json::to_value(StatusPayload::new(Presence::Online, 1_700_000_000.25)).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["v"], 1);
        // dd-mm-yy HH:MM:SS
        let human = json["timestamp_human"].as_str().unwrap();
        assert_eq!(human.len(), 17);
        assert_eq!(&human[2..3], "-");
        assert_eq!(&human[8..9], " ");
    }

    #[test]
    fn test_connect_announces_online_once() {
        let mut publisher = publisher();
        let t0 = Instant::now();
        publisher.tick(t0);
        assert_eq!(publisher.link().opens.len(), 1);
        assert_eq!(publisher.link().opens[0].will_topic, "tdg/tdf/disa3/optical_counter/status");

        publisher.link.state = Some(ConnectionState::Connected);
        publisher.tick(t0);
        publisher.tick(t0);
        let statuses: Vec<_> = publisher.link().published.iter().filter(|p| p.2 == Delivery::Retained).collect();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].1["status"], "online");
    }

    #[test]
    fn test_drops_cycles_while_disconnected() {
        let mut publisher = publisher();
        assert!(!publisher.publish_cycle(&event(1)));
        assert!(publisher.link().published.is_empty());

        publisher.link.state = Some(ConnectionState::Connected);
        assert!(publisher.publish_cycle(&event(2)));
        assert_eq!(publisher.link().published[0].0, "tdg/tdf/disa3/optical_counter/cycle_data");
        assert_eq!(publisher.link().published[0].2, Delivery::BestEffort);
    }

    #[test]
    fn test_reconnect_backoff_is_bounded() {
        let mut publisher = publisher();
        let t0 = Instant::now();
        let mut attempts_at = Vec::new();
        for ms in (0..20_000).step_by(100) {
            let now = t0 + Duration::from_millis(ms);
            let before = publisher.link().opens.len();
            publisher.link.state = Some(ConnectionState::Disconnected);
            publisher.tick(now);
            if publisher.link().opens.len() > before {
                attempts_at.push(ms);
            }
        }
        // Delays 1s, 2s, 4s, 4s, ...
        assert_eq!(&attempts_at[..5], &[0, 1_000, 3_000, 7_000, 11_000]);
    }

    #[test]
    fn test_backoff_resets_after_connect() {
        let mut publisher = publisher();
        let t0 = Instant::now();
        publisher.link.state = Some(ConnectionState::Disconnected);
        publisher.tick(t0);
        publisher.link.state = Some(ConnectionState::Disconnected);
        publisher.tick(t0 + Duration::from_secs(1));
        publisher.link.state = Some(ConnectionState::Connected);
        publisher.tick(t0 + Duration::from_secs(2));

        // Lost again: first retry is immediate, the next one min delay later
        publisher.link.state = Some(ConnectionState::Disconnected);
        publisher.tick(t0 + Duration::from_secs(3));
        assert_eq!(publisher.link().opens.len(), 3);
        publisher.link.state = Some(ConnectionState::Disconnected);
        publisher.tick(t0 + Duration::from_millis(3_500));
        assert_eq!(publisher.link().opens.len(), 3);
        publisher.tick(t0 + Duration::from_secs(4));
        assert_eq!(publisher.link().opens.len(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_publishes_offline_then_closes() {
        let mut publisher = publisher();
        publisher.tick(Instant::now());
        publisher.link.state = Some(ConnectionState::Connected);
        publisher.tick(Instant::now());
        publisher.shutdown().await;

        let last = publisher.link().published.last().unwrap();
        assert_eq!(last.1["status"], "offline");
        assert_eq!(last.2, Delivery::Retained);
        assert_eq!(publisher.link().closes, 1);
    }

    #[tokio::test]
    async fn test_identity_change_reconnects_with_new_topics() {
        let mut publisher = publisher();
        publisher.tick(Instant::now());
        publisher.link.state = Some(ConnectionState::Connected);
        publisher.tick(Instant::now());

        let identity = IdentitySettings { cell_name: "disa4".to_string(), ..IdentitySettings::default() };
        publisher.apply_settings(&BrokerSettings::default(), &identity).await;
        assert_eq!(publisher.link().closes, 1);
        assert_eq!(publisher.topics().status, "tdg/tdf/disa4/optical_counter/status");

        publisher.tick(Instant::now());
        assert_eq!(publisher.link().opens.len(), 2);
        assert_eq!(publisher.link().opens[1].will_topic, "tdg/tdf/disa4/optical_counter/status");
    }
}
