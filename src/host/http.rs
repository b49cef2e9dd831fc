//! Polling HTTP host

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

use super::{
    Host, HostError, MailboxMessage, Message, REGISTER_PATH, ack_path, apply_mailbox,
    mailbox_path, status_path,
};
use crate::agent::HostConfig;
use crate::platform::identity::{collect_identity, device_label};
use crate::state::{DeviceContext, DeviceState};

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    thing: Option<ThingTokens>,
}

#[derive(Debug, Deserialize)]
struct ThingTokens {
    account_token: Option<String>,
    collection_token: Option<String>,
    thing_token: Option<String>,
    token: Option<String>,
}

pub struct HttpHost {
    client: Client,
    base: Url,
    registration_token: Option<String>,
    pending: VecDeque<Message>,
}

impl HttpHost {
    pub fn new(config: &HostConfig) -> anyhow::Result<Self> {
        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("host.url is required"))?;

        // Keep any path on the base URL when joining endpoints
        let mut base = Url::parse(raw).context("Invalid host URL")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(format!("fieldsync/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base,
            registration_token: config.registration_token.clone(),
            pending: VecDeque::new(),
        })
    }

    /// Messages not yet delivered
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn endpoint(&self, path: &str) -> Result<Url, HostError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| HostError::Protocol(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn authorized(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn thing_token(ctx: &DeviceContext) -> Result<String, HostError> {
        ctx.thing_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HostError::Protocol("Device has no thing token".to_string()))
    }

    /// Register the device and store the issued tokens on the context
    pub(crate) async fn register(&self, ctx: &mut DeviceContext) -> Result<(), HostError> {
        let url = self.endpoint(REGISTER_PATH)?;
        let body = json!({
            "identity": collect_identity(),
            "label": device_label(),
        });

        tracing::info!("Registering device at {}", url);
        let request = self.client.post(url.clone()).json(&body);
        let response = Self::authorized(request, self.registration_token.as_deref())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HostError::Status {
                status: response.status().as_u16(),
                endpoint: url.to_string(),
            });
        }

        let parsed: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| HostError::Protocol(format!("Invalid registration response: {}", e)))?;

        let thing = parsed
            .thing
            .ok_or_else(|| HostError::Protocol("Registration response has no thing".to_string()))?;
        let thing_token = thing
            .thing_token
            .or(thing.token)
            .ok_or_else(|| HostError::Protocol("Registration response has no thing token".to_string()))?;
        let collection_token = thing.collection_token.ok_or_else(|| {
            HostError::Protocol("Registration response has no collection token".to_string())
        })?;

        ctx.thing_token = Some(thing_token);
        ctx.collection_token = Some(collection_token);
        if thing.account_token.is_some() {
            ctx.account_token = thing.account_token;
        }
        ctx.state = DeviceState::Registered;

        tracing::info!("Device registered");
        Ok(())
    }

    /// Queue a message for the next delivery
    pub(crate) fn enqueue(&mut self, message: Message) {
        self.pending.push_back(message);
    }

    /// Deliver queued messages; they are dropped only once accepted
    async fn deliver(&mut self, token: &str) -> Result<(), HostError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let url = self.endpoint(&status_path(token))?;
        let body = json!({ "messages": self.pending });
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HostError::Status {
                status: response.status().as_u16(),
                endpoint: url.to_string(),
            });
        }

        tracing::debug!(count = self.pending.len(), "Status messages delivered");
        self.pending.clear();
        Ok(())
    }

    /// At most one mailbox item
    async fn fetch_mailbox(&self, token: &str) -> Result<Option<MailboxMessage>, HostError> {
        let url = self.endpoint(&mailbox_path(token))?;
        let response = self.client.get(url.clone()).bearer_auth(token).send().await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<MailboxMessage>()
                .await
                .map(Some)
                .map_err(|e| HostError::Protocol(format!("Invalid mailbox item: {}", e))),
            status => Err(HostError::Status {
                status: status.as_u16(),
                endpoint: url.to_string(),
            }),
        }
    }

    pub(crate) async fn acknowledge(
        &self,
        token: &str,
        command_id: &str,
        status: &str,
    ) -> Result<(), HostError> {
        let url = self.endpoint(&ack_path(token))?;
        let body = json!({ "status": status, "command_id": command_id });
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HostError::Status {
                status: response.status().as_u16(),
                endpoint: url.to_string(),
            });
        }
        Ok(())
    }

    /// Apply a mailbox command to the context, then acknowledge it
    pub(crate) async fn process_mailbox(
        &self,
        ctx: &mut DeviceContext,
        token: &str,
        message: &MailboxMessage,
    ) -> Result<(), HostError> {
        let outcome = apply_mailbox(ctx, message);
        self.acknowledge(token, &message.id, outcome.ack_status()).await
    }
}

#[async_trait]
impl Host for HttpHost {
    fn registration_required(&self, ctx: &DeviceContext) -> bool {
        !ctx.has_identity()
    }

    async fn contact(&mut self, mut ctx: DeviceContext) -> Result<DeviceContext, HostError> {
        if self.registration_required(&ctx) {
            self.register(&mut ctx).await?;
            return Ok(ctx);
        }

        let token = Self::thing_token(&ctx)?;
        self.enqueue(Message::fold(&mut ctx));
        self.deliver(&token).await?;

        if let Some(message) = self.fetch_mailbox(&token).await? {
            self.process_mailbox(&mut ctx, &token, &message).await?;
        }

        Ok(ctx)
    }
}
