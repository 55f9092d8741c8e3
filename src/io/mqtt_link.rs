//! rumqttc-backed broker link
//!
//! Each `open` builds a fresh client with the retained `offline` last will and
//! spawns a task that drives its event loop. The task reports connection state
//! through a watch channel and exits on the first connection error, leaving
//! the retry schedule to the telemetry publisher.

use crate::io::telemetry::{BrokerLink, ConnectionState, Delivery, LinkOptions, TelemetryError, OFFLINE_PAYLOAD};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outgoing request queue between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;
/// Time allowed for queued messages to flush on close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct Session {
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

/// Broker link over MQTT 3.1.1
#[derive(Default)]
pub struct MqttLink {
    session: Option<Session>,
}

impl MqttLink {
    pub fn new() -> Self {
        Self::default()
    }
}

fn qos_for(delivery: Delivery) -> (QoS, bool) {
    match delivery {
        Delivery::Retained => (QoS::ExactlyOnce, true),
        Delivery::BestEffort => (QoS::AtMostOnce, false),
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    fn state(&self) -> ConnectionState {
        match &self.session {
            Some(session) => *session.state_rx.borrow(),
            None => ConnectionState::Disconnected,
        }
    }

    fn open(&mut self, options: &LinkOptions) -> Result<(), TelemetryError> {
        if let Some(old) = self.session.take() {
            old.task.abort();
        }

        let mut mqttoptions = MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqttoptions.set_keep_alive(options.keep_alive);
        mqttoptions.set_clean_session(true);
        mqttoptions.set_last_will(LastWill::new(
            options.will_topic.clone(),
            OFFLINE_PAYLOAD.as_bytes().to_vec(),
            QoS::ExactlyOnce,
            true,
        ));
        if let (Some(username), Some(password)) = (&options.username, &options.password) {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("mqtt_connected");
                            state_tx.send_replace(ConnectionState::Connected);
                        } else {
                            warn!(code = ?ack.code, "mqtt_connection_refused");
                            state_tx.send_replace(ConnectionState::Disconnected);
                            return;
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("mqtt_disconnect_sent");
                        state_tx.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                    Ok(Event::Incoming(Packet::PubComp(_))) => {
                        debug!("mqtt_status_delivered");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_connection_error");
                        state_tx.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        });

        self.session = Some(Session { client, state_rx, task });
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>, delivery: Delivery) -> Result<(), TelemetryError> {
        let Some(session) = &self.session else {
            return Err(TelemetryError::Disconnected);
        };
        let (qos, retain) = qos_for(delivery);
        session
            .client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| TelemetryError::Rejected(e.to_string()))
    }

    async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Err(e) = session.client.try_disconnect() {
            debug!(error = %e, "mqtt_disconnect_request_failed");
        }
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut session.task).await {
            Ok(_) => info!("mqtt_closed"),
            Err(_) => {
                warn!("mqtt_close_timeout");
                session.task.abort();
            }
        }
    }
}
