//! HTTP 推送网关适配器

use std::time::Duration;

use application::{PushOutcome, PushProvider};
use async_trait::async_trait;
use config::NotificationConfig;
use domain::NotificationPayload;
use reqwest::StatusCode;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    token: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
}

/// 把推送请求以 JSON POST 到外部推送网关
///
/// 2xx 视为送达；400/404/410 表示令牌失效；其余状态码、网络错误和超时都按可重试处理。
#[derive(Clone)]
pub struct HttpPushProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPushProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn from_config(config: &NotificationConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            config.push_endpoint.clone(),
            config.push_api_key.clone(),
            config.push_timeout(),
        )
    }
}

fn classify(status: StatusCode) -> PushOutcome {
    if status.is_success() {
        PushOutcome::Delivered
    } else if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::GONE
    ) {
        PushOutcome::InvalidToken
    } else {
        PushOutcome::TransientFailure(format!("push gateway responded {status}"))
    }
}

#[async_trait]
impl PushProvider for HttpPushProvider {
    async fn send(&self, token: &str, payload: &NotificationPayload) -> PushOutcome {
        let body = PushRequest {
            token,
            title: &payload.title,
            body: &payload.body,
            data: &payload.data,
            message_id: payload.message_id.map(|id| id.to_string()),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let outcome = classify(response.status());
                if outcome != PushOutcome::Delivered {
                    tracing::debug!(status = %response.status(), ?outcome, "push gateway rejected request");
                }
                outcome
            }
            Err(err) if err.is_timeout() => PushOutcome::TransientFailure("push request timed out".into()),
            Err(err) => PushOutcome::TransientFailure(err.to_string()),
        }
    }
}
