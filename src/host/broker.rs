//! Publish/subscribe broker seam used by the pub/sub host

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use super::HostError;

/// Something the broker connection reports asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The connection is gone; the session must be torn down
    Offline,
}

#[async_trait]
pub trait Broker: Send {
    /// Publish at QoS 1, returning once the broker acknowledged
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), HostError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), HostError>;

    async fn disconnect(&mut self);
}

/// A live broker connection and the events it produces
pub struct Session {
    pub broker: Box<dyn Broker>,
    pub events: UnboundedReceiver<BrokerEvent>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, client_id: &str, token: &str) -> Result<Session, HostError>;
}

#[cfg(test)]
pub(crate) mod loopback {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

    /// Shared view of everything a loopback broker saw
    #[derive(Default)]
    pub(crate) struct LoopbackState {
        pub published: Mutex<Vec<(String, Vec<u8>, bool)>>,
        pub subscriptions: Mutex<Vec<String>>,
        pub connects: AtomicUsize,
        pub disconnects: AtomicUsize,
        pub fail_connects: AtomicUsize,
        pub fail_publish: AtomicBool,
        inbound: Mutex<Option<UnboundedSender<BrokerEvent>>>,
    }

    impl LoopbackState {
        pub fn deliver(&self, topic: &str, payload: &[u8]) {
            if let Some(sender) = self.inbound.lock().unwrap().as_ref() {
                let _ = sender.send(BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }

        pub fn go_offline(&self) {
            if let Some(sender) = self.inbound.lock().unwrap().take() {
                let _ = sender.send(BrokerEvent::Offline);
            }
        }
    }

    pub(crate) struct LoopbackBroker {
        state: Arc<LoopbackState>,
    }

    #[async_trait]
    impl Broker for LoopbackBroker {
        async fn publish(
            &mut self,
            topic: &str,
            payload: Vec<u8>,
            retain: bool,
        ) -> Result<(), HostError> {
            if self.state.fail_publish.load(Ordering::SeqCst) {
                return Err(HostError::Broker("publish refused".to_string()));
            }
            self.state
                .published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, retain));
            Ok(())
        }

        async fn subscribe(&mut self, topic: &str) -> Result<(), HostError> {
            self.state.subscriptions.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) struct LoopbackConnector {
        pub state: Arc<LoopbackState>,
    }

    impl LoopbackConnector {
        pub fn new() -> (Self, Arc<LoopbackState>) {
            let state = Arc::new(LoopbackState::default());
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    #[async_trait]
    impl BrokerConnector for LoopbackConnector {
        async fn connect(&self, _client_id: &str, _token: &str) -> Result<Session, HostError> {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            let remaining = self.state.fail_connects.load(Ordering::SeqCst);
            if remaining > 0 {
                self.state.fail_connects.store(remaining - 1, Ordering::SeqCst);
                return Err(HostError::Broker("connection refused".to_string()));
            }

            let (sender, events) = unbounded_channel();
            *self.state.inbound.lock().unwrap() = Some(sender);
            Ok(Session {
                broker: Box::new(LoopbackBroker {
                    state: self.state.clone(),
                }),
                events,
            })
        }
    }
}
