//! MQTT adapter for the broker seam, built on rumqttc.
//!
//! The rumqttc event loop runs in its own task and forwards inbound publishes
//! as [`BrokerEvent`]s. The first connection error ends that task with
//! `BrokerEvent::Offline`; bringing the session back is up to the pub/sub host.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;

use super::HostError;
use super::broker::{Broker, BrokerConnector, BrokerEvent, Session};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 16;

fn broker_err(context: &str, e: impl std::fmt::Display) -> HostError {
    HostError::Broker(format!("{}: {}", context, e))
}

/// Acknowledgments a request waits for
#[derive(Debug)]
enum Ack {
    Published,
    Subscribed { granted: bool },
}

/// Connector for `mqtt://host[:port]` and `mqtts://host[:port]` URLs
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    tls: bool,
    password: Option<String>,
}

impl MqttConnector {
    pub fn new(broker_url: &str, password: Option<String>) -> anyhow::Result<Self> {
        let url = url::Url::parse(broker_url)
            .map_err(|e| anyhow::anyhow!("Invalid broker URL {}: {}", broker_url, e))?;
        let tls = match url.scheme() {
            "mqtt" => false,
            "mqtts" => true,
            other => anyhow::bail!("Broker URL must use mqtt or mqtts (got: {})", other),
        };
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("Broker URL has no host: {}", broker_url))?;
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
            password,
        })
    }

    fn options(&self, client_id: &str, token: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_credentials(token, self.password.clone().unwrap_or_default());
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, client_id: &str, token: &str) -> Result<Session, HostError> {
        let (client, mut eventloop) =
            AsyncClient::new(self.options(client_id, token), REQUEST_CAPACITY);

        tokio::time::timeout(CONNECT_TIMEOUT, connack(&mut eventloop))
            .await
            .map_err(|_| {
                HostError::Broker(format!("Connect to {}:{} timed out", self.host, self.port))
            })??;
        tracing::info!(client_id = %client_id, host = %self.host, "Connected to broker");

        let (events_tx, events) = unbounded_channel();
        let (acks_tx, acks) = unbounded_channel();
        let driver = tokio::spawn(drive(eventloop, events_tx, acks_tx));

        Ok(Session {
            broker: Box::new(MqttBroker {
                client,
                acks,
                driver,
            }),
            events,
        })
    }
}

/// Poll until the broker accepts or refuses the connection
async fn connack(eventloop: &mut EventLoop) -> Result<(), HostError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(HostError::Broker(format!("Connection refused ({:?})", code))),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(broker_err("Connect failed", e)),
        }
    }
}

/// Run the event loop until the connection breaks or is closed
async fn drive(
    mut eventloop: EventLoop,
    events: UnboundedSender<BrokerEvent>,
    acks: UnboundedSender<Ack>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = BrokerEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => {
                let _ = acks.send(Ack::Published);
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let granted = suback
                    .return_codes
                    .iter()
                    .all(|code| !matches!(code, SubscribeReasonCode::Failure));
                let _ = acks.send(Ack::Subscribed { granted });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Broker connection lost: {}", e);
                break;
            }
        }
    }

    let _ = events.send(BrokerEvent::Offline);
}

pub struct MqttBroker {
    client: AsyncClient,
    acks: UnboundedReceiver<Ack>,
    driver: JoinHandle<()>,
}

impl MqttBroker {
    /// Requests go out one at a time, so the next ack belongs to the last request
    async fn next_ack(&mut self) -> Result<Ack, HostError> {
        match tokio::time::timeout(ACK_TIMEOUT, self.acks.recv()).await {
            Ok(Some(ack)) => Ok(ack),
            Ok(None) => Err(HostError::Broker(
                "Connection closed before acknowledgment".to_string(),
            )),
            Err(_) => Err(HostError::Broker(
                "Timed out waiting for acknowledgment".to_string(),
            )),
        }
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), HostError> {
        let bytes = payload.len();
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| broker_err("Publish failed", e))?;

        match self.next_ack().await? {
            Ack::Published => {
                tracing::debug!(topic = %topic, bytes, "Published");
                Ok(())
            }
            other => Err(HostError::Protocol(format!("Unexpected {:?} for publish", other))),
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), HostError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| broker_err("Subscribe failed", e))?;

        match self.next_ack().await? {
            Ack::Subscribed { granted: true } => {
                tracing::debug!(topic = %topic, "Subscribed");
                Ok(())
            }
            Ack::Subscribed { granted: false } => Err(HostError::Broker(format!(
                "Subscription to {} refused",
                topic
            ))),
            other => Err(HostError::Protocol(format!("Unexpected {:?} for subscribe", other))),
        }
    }

    async fn disconnect(&mut self) {
        if self.client.disconnect().await.is_ok() {
            // The event loop has to run to actually send DISCONNECT
            let _ = tokio::time::timeout(DISCONNECT_GRACE, &mut self.driver).await;
        }
        self.driver.abort();
    }
}
