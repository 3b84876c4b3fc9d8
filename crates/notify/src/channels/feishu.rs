//! Feishu (Lark) interactive template card channel.
//!
//! Uses the self-built app flow: exchange app credentials for a tenant access
//! token, then create an `interactive` message whose content references a
//! published card template.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DeliveryReceipt, NotifyChannel};
use crate::card::CardMessage;
use crate::error::ChannelError;

/// Refresh the tenant token this long before the platform says it expires.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

/// Feishu template card channel.
pub struct FeishuChannel {
    base_url: String,
    app_id: Option<String>,
    app_secret: Option<String>,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl FeishuChannel {
    /// Create a channel with explicit app credentials.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self::build(
            base_url.into(),
            Some(app_id.into()),
            Some(app_secret.into()),
            timeout,
        )
    }

    /// Create a channel reading app credentials from the named environment variables.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn from_env(base_url: &str, app_id_env: &str, app_secret_env: &str, timeout: Duration) -> Self {
        let app_id = std::env::var(app_id_env).ok();
        let app_secret = std::env::var(app_secret_env).ok();

        if app_id.is_some() && app_secret.is_some() {
            debug!("Feishu notifications enabled");
        } else {
            debug!(
                app_id_env,
                app_secret_env, "Feishu notifications disabled (credentials not set)"
            );
        }

        Self::build(base_url.to_string(), app_id, app_secret, timeout)
    }

    fn build(
        base_url: String,
        app_id: Option<String>,
        app_secret: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id,
            app_secret,
            client,
            token: Mutex::new(None),
        }
    }

    /// Fetch (or reuse) a tenant access token.
    async fn tenant_access_token(&self) -> Result<String, ChannelError> {
        let (Some(app_id), Some(app_secret)) = (&self.app_id, &self.app_secret) else {
            return Err(ChannelError::NotConfigured(
                "Feishu app credentials".to_string(),
            ));
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.base_url
        );
        let response = self
            .client
            .post(&url)
            .json(&TokenRequest { app_id, app_secret })
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: TokenResponse = response.json().await?;

        if body.code != 0 {
            return Err(ChannelError::Api {
                code: body.code,
                msg: body.msg,
            });
        }
        let value = body
            .tenant_access_token
            .ok_or_else(|| ChannelError::Other("token response without token".to_string()))?;

        let lifetime = body.expire.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });

        Ok(value)
    }
}

#[async_trait]
impl NotifyChannel for FeishuChannel {
    fn name(&self) -> &'static str {
        "feishu"
    }

    fn enabled(&self) -> bool {
        self.app_id.is_some() && self.app_secret.is_some()
    }

    async fn deliver(&self, message: &CardMessage) -> Result<DeliveryReceipt, ChannelError> {
        let token = self.tenant_access_token().await?;
        let content = message.content_json()?;

        debug!(
            channel = "feishu",
            receive_id_type = %message.receive_id_type,
            template_id = %message.template_id,
            request_id = %message.variables.request_id,
            "Sending template card"
        );

        let url = format!("{}/open-apis/im/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("receive_id_type", message.receive_id_type.as_str())])
            .bearer_auth(token)
            .json(&CreateMessageRequest {
                receive_id: &message.receive_id,
                msg_type: "interactive",
                content,
            })
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: CreateMessageResponse = response.json().await?;

        if body.code != 0 {
            warn!(
                channel = "feishu",
                code = body.code,
                msg = %body.msg,
                "Feishu rejected template card"
            );
            return Err(ChannelError::Api {
                code: body.code,
                msg: body.msg,
            });
        }

        Ok(DeliveryReceipt {
            message_id: body.data.and_then(|d| d.message_id),
        })
    }
}

/// Map HTTP-level failures before decoding the business envelope.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ChannelError> {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        return Err(ChannelError::RateLimited { retry_after_secs });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ChannelError::Other(format!("Feishu returned {status}: {body}")));
    }
    Ok(response)
}

// =============================================================================
// Feishu API types
// =============================================================================

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    app_id: &'a str,
    app_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    receive_id: &'a str,
    msg_type: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<CreatedMessage>,
}

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    message_id: Option<String>,
}
