//! Pub/sub host: status over a broker, registration and acks over HTTP

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::broker::{Broker, BrokerConnector, BrokerEvent, Session};
use super::{Host, HostError, HttpHost, MailboxMessage, Message, mailbox_path, status_path};
use crate::agent::{AgentSettings, Signal};
use crate::state::DeviceContext;

/// Reconnect delays: start at a minimum, double per failure, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    armed: bool,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
            armed: false,
        }
    }

    /// Wait before the next connection attempt; zero after a success
    pub fn delay(&self) -> Duration {
        if self.armed {
            self.current
        } else {
            Duration::ZERO
        }
    }

    pub fn failure(&mut self) {
        if self.armed {
            self.current = (self.current * 2).min(self.max);
        }
        self.armed = true;
    }

    pub fn success(&mut self) {
        self.current = self.min;
        self.armed = false;
    }
}

/// Phones home if no publish succeeds for a whole period
struct Watchdog {
    period: Duration,
    signals: UnboundedSender<Signal>,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn arm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let signals = self.signals.clone();
        let period = self.period;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;
            tracing::warn!("No status published for {:?}; forcing a contact", period);
            let _ = signals.send(Signal::PhoneHome("watchdog".to_string()));
        }));
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Broker side of the host, shared with the supervisor task
struct Link {
    broker: Option<Box<dyn Broker>>,
    /// Newest mailbox item received since the last contact
    mailbox: Option<MailboxMessage>,
    backoff: Backoff,
}

type SharedLink = Arc<Mutex<Link>>;

/// Connect and subscribe to the device mailbox
async fn open(connector: &dyn BrokerConnector, token: &str) -> Result<Session, HostError> {
    let mut session = connector.connect(token, token).await?;
    session.broker.subscribe(&mailbox_path(token)).await?;
    Ok(session)
}

/// Forward mailbox items into the link and bring the session back after it
/// goes offline. Runs until aborted by the host.
async fn supervise(
    link: SharedLink,
    connector: Arc<dyn BrokerConnector>,
    token: String,
    mut events: UnboundedReceiver<BrokerEvent>,
) {
    let mailbox_topic = mailbox_path(&token);

    loop {
        match events.recv().await {
            Some(BrokerEvent::Message { topic, payload }) => {
                if topic != mailbox_topic || payload.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<MailboxMessage>(&payload) {
                    Ok(message) => link.lock().await.mailbox = Some(message),
                    Err(e) => tracing::warn!("Ignoring malformed mailbox item: {}", e),
                }
            }
            Some(BrokerEvent::Offline) | None => {
                tracing::warn!("Broker went offline");
                let stale = {
                    let mut state = link.lock().await;
                    state.backoff.failure();
                    state.broker.take()
                };
                if let Some(mut broker) = stale {
                    broker.disconnect().await;
                }
                events = reconnect(&link, connector.as_ref(), &token).await;
            }
        }
    }
}

/// Retry until a session is up again; hands the broker to the link
async fn reconnect(
    link: &SharedLink,
    connector: &dyn BrokerConnector,
    token: &str,
) -> UnboundedReceiver<BrokerEvent> {
    loop {
        let delay = link.lock().await.backoff.delay();
        tracing::info!("Reconnecting to broker in {:?}", delay);
        tokio::time::sleep(delay).await;

        match open(connector, token).await {
            Ok(session) => {
                let mut state = link.lock().await;
                state.backoff.success();
                state.broker = Some(session.broker);
                tracing::info!("Broker session restored");
                return session.events;
            }
            Err(e) => {
                tracing::warn!("Reconnect failed: {}", e);
                link.lock().await.backoff.failure();
            }
        }
    }
}

pub struct PubSubHost {
    http: HttpHost,
    connector: Arc<dyn BrokerConnector>,
    link: SharedLink,
    supervisor: Option<JoinHandle<()>>,
    pending: VecDeque<Message>,
    watchdog: Watchdog,
}

impl PubSubHost {
    pub fn new(
        http: HttpHost,
        connector: Arc<dyn BrokerConnector>,
        settings: &AgentSettings,
        signals: UnboundedSender<Signal>,
    ) -> Self {
        let heartbeat = Duration::from_secs(settings.heartbeat_interval);
        Self::with_timing(
            http,
            connector,
            Backoff::new(Duration::from_secs(settings.reconnect_min), heartbeat),
            heartbeat * 2,
            signals,
        )
    }

    fn with_timing(
        http: HttpHost,
        connector: Arc<dyn BrokerConnector>,
        backoff: Backoff,
        watchdog_period: Duration,
        signals: UnboundedSender<Signal>,
    ) -> Self {
        Self {
            http,
            connector,
            link: Arc::new(Mutex::new(Link {
                broker: None,
                mailbox: None,
                backoff,
            })),
            supervisor: None,
            pending: VecDeque::new(),
            watchdog: Watchdog {
                period: watchdog_period,
                signals,
                task: None,
            },
        }
    }

    async fn teardown(&mut self, broker: Option<Box<dyn Broker>>) {
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }
        if let Some(mut broker) = broker {
            broker.disconnect().await;
            tracing::info!("Broker session closed");
        }
    }

    /// Connect now unless the supervisor holds a live session
    async fn ensure_session(&mut self, token: &str) -> Result<(), HostError> {
        let supervised = self.supervisor.as_ref().is_some_and(|task| !task.is_finished());
        if supervised && self.link.lock().await.broker.is_some() {
            return Ok(());
        }

        // The caller is waiting, so a pending background reconnect gives way
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }

        let delay = self.link.lock().await.backoff.delay();
        if !delay.is_zero() {
            tracing::info!("Reconnecting to broker in {:?}", delay);
            tokio::time::sleep(delay).await;
        }

        match open(self.connector.as_ref(), token).await {
            Ok(session) => {
                {
                    let mut state = self.link.lock().await;
                    state.backoff.success();
                    state.broker = Some(session.broker);
                }
                self.supervisor = Some(tokio::spawn(supervise(
                    self.link.clone(),
                    self.connector.clone(),
                    token.to_string(),
                    session.events,
                )));
                Ok(())
            }
            Err(e) => {
                self.link.lock().await.backoff.failure();
                Err(e)
            }
        }
    }

    async fn publish_pending(&mut self, token: &str) -> Result<(), HostError> {
        let payload = serde_json::to_vec(&json!({ "messages": self.pending }))
            .map_err(|e| HostError::Protocol(format!("Failed to encode messages: {}", e)))?;

        let mut state = self.link.lock().await;
        let published = match state.broker.as_mut() {
            Some(broker) => broker.publish(&status_path(token), payload, true).await,
            None => return Err(HostError::Broker("Not connected".to_string())),
        };

        match published {
            Ok(()) => {
                tracing::debug!(count = self.pending.len(), "Status published");
                self.pending.clear();
                Ok(())
            }
            Err(e) => {
                state.backoff.failure();
                let broker = state.broker.take();
                drop(state);
                self.teardown(broker).await;
                Err(e)
            }
        }
    }
}

impl Drop for PubSubHost {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Host for PubSubHost {
    fn registration_required(&self, ctx: &DeviceContext) -> bool {
        self.http.registration_required(ctx)
    }

    async fn contact(&mut self, mut ctx: DeviceContext) -> Result<DeviceContext, HostError> {
        if self.registration_required(&ctx) {
            self.http.register(&mut ctx).await?;
            return Ok(ctx);
        }

        let token = ctx
            .thing_token
            .clone()
            .ok_or_else(|| HostError::Protocol("Device has no thing token".to_string()))?;

        self.pending.push_back(Message::fold(&mut ctx));
        self.ensure_session(&token).await?;
        self.publish_pending(&token).await?;
        self.watchdog.arm();

        // Let the supervisor forward what has already arrived
        tokio::task::yield_now().await;
        let message = self.link.lock().await.mailbox.take();
        if let Some(message) = message {
            self.http.process_mailbox(&mut ctx, &token, &message).await?;
        }

        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::broker::loopback::{LoopbackConnector, LoopbackState};
    use crate::host::http::tests::{FakeService, host_config, serve};
    use crate::state::DeviceState;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(300);
        let mut backoff = Backoff::new(min, max);
        assert_eq!(backoff.delay(), Duration::ZERO);

        let mut previous = Duration::ZERO;
        for i in 0..20 {
            backoff.failure();
            let delay = backoff.delay();
            if i == 0 {
                assert_eq!(delay, min);
            }
            assert!(delay >= previous);
            assert!(delay <= max);
            previous = delay;
        }
        assert_eq!(previous, max);

        backoff.success();
        assert_eq!(backoff.delay(), Duration::ZERO);
        backoff.failure();
        assert_eq!(backoff.delay(), min);
    }

    struct Fixture {
        host: PubSubHost,
        broker: Arc<LoopbackState>,
        service: Arc<FakeService>,
        signals: UnboundedReceiver<Signal>,
    }

    async fn fixture(watchdog: Duration) -> Fixture {
        let service = Arc::new(FakeService::default());
        let url = serve(service.clone()).await;
        let http = HttpHost::new(&host_config(&url)).unwrap();
        let (connector, broker) = LoopbackConnector::new();
        let (sender, signals) = unbounded_channel();
        let backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(40));

        Fixture {
            host: PubSubHost::with_timing(http, Arc::new(connector), backoff, watchdog, sender),
            broker,
            service,
            signals,
        }
    }

    fn registered() -> DeviceContext {
        let mut ctx = DeviceContext::with_state(DeviceState::Configured);
        ctx.thing_token = Some("thing-1".to_string());
        ctx
    }

    #[tokio::test]
    async fn registers_over_http() {
        let mut f = fixture(Duration::from_secs(60)).await;
        let ctx = f.host.contact(DeviceContext::default()).await.unwrap();
        assert_eq!(ctx.thing_token.as_deref(), Some("thing-1"));
        assert_eq!(f.broker.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publishes_retained_status_and_subscribes() {
        let mut f = fixture(Duration::from_secs(60)).await;
        let mut ctx = registered();
        ctx.action = Some("startup".to_string());
        f.host.contact(ctx).await.unwrap();

        let published = f.broker.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (topic, payload, retain) = &published[0];
        assert_eq!(topic, "/1/l/thing-1");
        assert!(*retain);
        let body: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(body["messages"][0]["action"], "startup");
        assert_eq!(*f.broker.subscriptions.lock().unwrap(), vec!["/1/m/thing-1".to_string()]);
    }

    #[tokio::test]
    async fn only_newest_mailbox_item_is_processed() {
        let mut f = fixture(Duration::from_secs(60)).await;
        let ctx = f.host.contact(registered()).await.unwrap();

        f.broker.deliver("/1/m/thing-1", br#"{"id": "m1", "payload": {"action": "report"}}"#);
        f.broker.deliver("/1/m/thing-1", br#"{"id": "m2", "payload": {"action": "reboot"}}"#);
        let ctx = f.host.contact(ctx).await.unwrap();

        assert_eq!(ctx.action.as_deref(), Some("reboot"));
        let acks = f.service.acks.lock().unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0]["command_id"], "m2");
        assert_eq!(acks[0]["status"], "success");
    }

    /// Wait for the loopback broker to see `count` connection attempts
    async fn connects_reach(broker: &LoopbackState, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.connects.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("broker was not reconnected");
    }

    #[tokio::test]
    async fn reconnects_after_going_offline_without_a_contact() {
        let mut f = fixture(Duration::from_secs(60)).await;
        let ctx = f.host.contact(registered()).await.unwrap();
        assert_eq!(f.broker.connects.load(Ordering::SeqCst), 1);

        f.broker.go_offline();
        connects_reach(&f.broker, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(f.broker.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(
            *f.broker.subscriptions.lock().unwrap(),
            vec!["/1/m/thing-1".to_string(), "/1/m/thing-1".to_string()]
        );

        // Commands sent while no contact is in progress still reach the device
        f.broker.deliver("/1/m/thing-1", br#"{"id": "m1", "payload": {"action": "report"}}"#);
        let ctx = f.host.contact(ctx).await.unwrap();
        assert_eq!(ctx.action.as_deref(), Some("report"));
        assert_eq!(f.broker.connects.load(Ordering::SeqCst), 2);
        assert_eq!(f.broker.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn background_reconnect_retries_with_backoff() {
        let mut f = fixture(Duration::from_secs(60)).await;
        f.host.contact(registered()).await.unwrap();

        f.broker.fail_connects.store(2, Ordering::SeqCst);
        f.broker.go_offline();
        connects_reach(&f.broker, 4).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(f.broker.subscriptions.lock().unwrap().len(), 2);
        assert!(f.host.link.lock().await.broker.is_some());
        assert_eq!(f.host.link.lock().await.backoff.delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn failed_publish_keeps_messages() {
        let mut f = fixture(Duration::from_secs(60)).await;
        f.broker.fail_publish.store(true, Ordering::SeqCst);
        let err = f.host.contact(registered()).await.unwrap_err();
        assert!(matches!(err, HostError::Broker(_)));

        assert_eq!(f.broker.disconnects.load(Ordering::SeqCst), 1);

        f.broker.fail_publish.store(false, Ordering::SeqCst);
        f.host.contact(registered()).await.unwrap();
        assert_eq!(f.broker.connects.load(Ordering::SeqCst), 2);

        let published = f.broker.published.lock().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let mut f = fixture(Duration::from_secs(60)).await;
        f.broker.fail_connects.store(1, Ordering::SeqCst);
        assert!(f.host.contact(registered()).await.is_err());
        assert!(f.host.contact(registered()).await.is_ok());
        assert_eq!(f.broker.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn watchdog_phones_home() {
        let mut f = fixture(Duration::from_millis(30)).await;
        f.host.contact(registered()).await.unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(2), f.signals.recv())
            .await
            .unwrap();
        assert_eq!(signal, Some(Signal::PhoneHome("watchdog".to_string())));
    }
}
