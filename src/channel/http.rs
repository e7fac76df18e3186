//! HTTP client for the joinrelay-store parameter server

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use super::{ChannelKey, CoordinationChannel};
use crate::common::utils::encode_segment;
use crate::common::{Error, Result};
use crate::store::api::{ParamResponse, PutParamRequest};

pub struct HttpChannel {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChannel {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, key: &ChannelKey) -> String {
        let path: Vec<String> = key.segments().iter().map(|s| encode_segment(s)).collect();
        format!("{}/v1/params/{}", self.base_url, path.join("/"))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a non-success status to an error
fn status_error(status: StatusCode, key: &ChannelKey, body: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized,
        StatusCode::FORBIDDEN => Error::Forbidden(format!("{}: {}", key, body)),
        _ => Error::Channel(format!("{} returned {}: {}", key, status, body)),
    }
}

#[async_trait]
impl CoordinationChannel for HttpChannel {
    async fn read(&self, key: &ChannelKey) -> Result<Option<String>> {
        let response = self
            .authorize(self.client.get(self.url(key)))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let param: ParamResponse = response.json().await?;
                Ok(Some(param.value))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(status_error(status, key, body))
            }
        }
    }

    async fn write(&self, key: &ChannelKey, value: &str) -> Result<()> {
        let response = self
            .authorize(self.client.put(self.url(key)))
            .json(&PutParamRequest {
                value: value.to_string(),
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status, key, body))
        }
    }

    fn describe(&self) -> String {
        format!("http({})", self.base_url)
    }
}
