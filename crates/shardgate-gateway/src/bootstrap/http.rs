//! Bootstrap over the provider's REST API

use super::{BootstrapClient, BootstrapError, BootstrapInfo, ProviderHealth};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Fetches `GET {api_url}/gateway/bot`
#[derive(Debug, Clone)]
pub struct HttpBootstrapClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

impl HttpBootstrapClient {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self, BootstrapError> {
        let client = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(concat!("shardgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BootstrapError::Request(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl BootstrapClient for HttpBootstrapClient {
    async fn fetch(&self) -> Result<BootstrapInfo, BootstrapError> {
        let response = self
            .client
            .get(format!("{}/gateway/bot", self.api_url))
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|e| BootstrapError::Request(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json::<BootstrapInfo>()
                .await
                .map_err(|e| BootstrapError::Decode(e.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BootstrapError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_ms = response
                    .json::<RateLimitBody>()
                    .await
                    .map(|body| (body.retry_after * 1_000.0) as u64)
                    .unwrap_or(0);
                Err(BootstrapError::RateLimited { retry_after_ms })
            }
            status => Err(BootstrapError::Status(status.as_u16())),
        }
    }

    async fn health(&self) -> Result<ProviderHealth, BootstrapError> {
        let result = self
            .client
            .get(format!("{}/gateway", self.api_url))
            .send()
            .await;

        Ok(match result {
            Ok(response) if response.status().is_server_error() => {
                ProviderHealth::Degraded(format!("status {}", response.status().as_u16()))
            }
            Ok(_) => ProviderHealth::Operational,
            Err(e) => ProviderHealth::Degraded(e.to_string()),
        })
    }
}
