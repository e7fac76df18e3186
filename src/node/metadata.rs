//! Instance metadata client (token-based, two-step)
//!
//! 1. `PUT /latest/api/token` with a TTL header returns a session token.
//! 2. `GET /latest/meta-data/local-ipv4` with that token returns the address.
//!
//! Anonymous single-request lookups are never attempted.

use reqwest::Client;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::common::{Error, Result};

pub const TOKEN_PATH: &str = "/latest/api/token";
pub const LOCAL_IPV4_PATH: &str = "/latest/meta-data/local-ipv4";
pub const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
pub const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

/// Lifetime requested for the metadata session token
const TOKEN_TTL_SECS: u64 = 21600;

pub struct MetadataClient {
    client: Client,
    base_url: String,
}

impl MetadataClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Metadata(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn session_token(&self) -> Result<String> {
        let response = self
            .client
            .put(format!("{}{}", self.base_url, TOKEN_PATH))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECS.to_string())
            .send()
            .await
            .map_err(|e| Error::Metadata(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Metadata(format!(
                "token request returned {}",
                response.status()
            )));
        }

        let token = response
            .text()
            .await
            .map_err(|e| Error::Metadata(format!("token body unreadable: {}", e)))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::Metadata("empty session token".into()));
        }
        Ok(token.to_string())
    }

    /// Private IPv4 of this instance
    pub async fn local_ipv4(&self) -> Result<Ipv4Addr> {
        let token = self.session_token().await?;

        let response = self
            .client
            .get(format!("{}{}", self.base_url, LOCAL_IPV4_PATH))
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|e| Error::Metadata(format!("local-ipv4 request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Metadata(format!(
                "local-ipv4 request returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Metadata(format!("local-ipv4 body unreadable: {}", e)))?;
        parse_ipv4(&body)
    }
}

/// Dotted-quad IPv4 or a metadata error
pub fn parse_ipv4(raw: &str) -> Result<Ipv4Addr> {
    raw.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::Metadata(format!("not a valid IPv4 address: {:?}", raw.trim())))
}
