//! Join credential parsing and validation
//!
//! A credential is what a joiner needs to attach to an initialized control
//! plane: an optional API server endpoint, a bootstrap token and one or more
//! discovery hashes of the cluster CA. It arrives as text
//! (`join <endpoint> --token <id>.<secret> --discovery-token-ca-cert-hash sha256:<hex>`)
//! and is parsed once at the boundary. The join action only ever receives the
//! typed fields, never the original string.

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::time::Duration;

use crate::channel::SENTINEL_PLACEHOLDER;
use crate::common::{Error, Result};

const JOIN_PREFIX: &str = "join";
const ORCHESTRATOR_PREFIX: &str = "kubeadm";
const TOKEN_FLAG: &str = "--token";
const HASH_FLAG: &str = "--discovery-token-ca-cert-hash";
const HASH_SCHEME: &str = "sha256:";

/// Bootstrap token `<id>.<secret>`
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    id: String,
    secret: String,
}

impl BootstrapToken {
    pub fn parse(raw: &str) -> Result<Self> {
        let (id, secret) = raw
            .split_once('.')
            .ok_or_else(|| Error::InvalidCredential(format!("token is not <id>.<secret>: {}", raw)))?;

        let well_formed = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric());
        if !well_formed(id) || !well_formed(secret) {
            return Err(Error::InvalidCredential(
                "token id and secret must be non-empty alphanumeric".into(),
            ));
        }

        Ok(Self {
            id: id.to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full `<id>.<secret>` form
    pub fn expose(&self) -> String {
        format!("{}.{}", self.id, self.secret)
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.<redacted>", self.id)
    }
}

/// A parsed, grammar-valid join credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCredential {
    endpoint: Option<String>,
    token: BootstrapToken,
    ca_cert_hashes: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl JoinCredential {
    /// Parse using the default sentinel placeholder
    pub fn parse(raw: &str) -> Result<Self> {
        Self::parse_with_sentinel(raw, SENTINEL_PLACEHOLDER)
    }

    /// Parse, rejecting `sentinel` explicitly before any grammar check
    pub fn parse_with_sentinel(raw: &str, sentinel: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidCredential("empty value".into()));
        }
        if trimmed == sentinel.trim() {
            return Err(Error::InvalidCredential("placeholder, not yet published".into()));
        }

        let mut words = trimmed
            .split_whitespace()
            .filter(|w| *w != "\\")
            .peekable();

        if words.peek() == Some(&ORCHESTRATOR_PREFIX) {
            words.next();
        }
        if words.next() != Some(JOIN_PREFIX) {
            return Err(Error::InvalidCredential(
                "value does not start with the join action".into(),
            ));
        }

        let endpoint = match words.peek() {
            Some(w) if !w.starts_with('-') => {
                let endpoint = parse_endpoint(w)?;
                words.next();
                Some(endpoint)
            }
            _ => None,
        };

        let mut token = None;
        let mut hashes = Vec::new();

        while let Some(word) = words.next() {
            let (flag, inline) = match word.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => (flag, Some(value)),
                _ => (word, None),
            };

            let mut value = || -> Result<String> {
                match inline {
                    Some(v) => Ok(v.to_string()),
                    None => words
                        .next()
                        .filter(|v| !v.starts_with("--"))
                        .map(str::to_string)
                        .ok_or_else(|| Error::InvalidCredential(format!("{} has no value", flag))),
                }
            };

            match flag {
                TOKEN_FLAG => {
                    if token.is_some() {
                        return Err(Error::InvalidCredential("token given twice".into()));
                    }
                    token = Some(BootstrapToken::parse(&value()?)?);
                }
                HASH_FLAG => hashes.push(parse_hash(&value()?)?),
                other => {
                    return Err(Error::InvalidCredential(format!(
                        "unexpected argument: {}",
                        other
                    )))
                }
            }
        }

        let token = token.ok_or_else(|| Error::InvalidCredential("missing --token".into()))?;
        if hashes.is_empty() {
            return Err(Error::InvalidCredential(format!("missing {}", HASH_FLAG)));
        }

        Ok(Self {
            endpoint,
            token,
            ca_cert_hashes: hashes,
            expires_at: None,
        })
    }

    /// Attach an expiry computed from issue time and TTL
    pub fn with_expiry(mut self, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| issued_at.checked_add_signed(ttl));
        self
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn token(&self) -> &BootstrapToken {
        &self.token
    }

    pub fn ca_cert_hashes(&self) -> &[String] {
        &self.ca_cert_hashes
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Unknown expiry never counts as expired; the join attempt is the real test
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Arguments for the orchestrator's join action
    pub fn join_args(&self, fallback_endpoint: Option<&str>) -> Result<Vec<String>> {
        let endpoint = match (&self.endpoint, fallback_endpoint) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(fallback)) => parse_endpoint(fallback)?,
            (None, None) => {
                return Err(Error::InvalidCredential(
                    "credential has no endpoint and no control_plane_endpoint is configured".into(),
                ))
            }
        };

        let mut args = vec![
            JOIN_PREFIX.to_string(),
            endpoint,
            TOKEN_FLAG.to_string(),
            self.token.expose(),
        ];
        for hash in &self.ca_cert_hashes {
            args.push(HASH_FLAG.to_string());
            args.push(hash.clone());
        }
        Ok(args)
    }
}

impl std::fmt::Display for JoinCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", JOIN_PREFIX)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " {}", endpoint)?;
        }
        write!(f, " {} {}", TOKEN_FLAG, self.token.expose())?;
        for hash in &self.ca_cert_hashes {
            write!(f, " {} {}", HASH_FLAG, hash)?;
        }
        Ok(())
    }
}

/// API server endpoint `host:port`, `ip:port` or `[ipv6]:port`
pub fn parse_endpoint(raw: &str) -> Result<String> {
    let invalid = || Error::InvalidCredential(format!("endpoint is not <host>:<port>: {}", raw));
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return if addr.port() > 0 { Ok(raw.to_string()) } else { Err(invalid()) };
    }

    let (host, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
    match port.parse::<u16>() {
        Ok(p) if p > 0 => {}
        _ => return Err(invalid()),
    }

    let label_ok = |label: &str| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if host.len() > 253 || !host.split('.').all(label_ok) {
        return Err(invalid());
    }
    Ok(raw.to_string())
}

fn parse_hash(raw: &str) -> Result<String> {
    let hex_part = raw
        .strip_prefix(HASH_SCHEME)
        .ok_or_else(|| Error::InvalidCredential(format!("hash must start with {}", HASH_SCHEME)))?;
    if hex_part.is_empty() || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidCredential("hash is not hexadecimal".into()));
    }
    Ok(raw.to_string())
}

/// Grammar check against the default placeholder
pub fn is_valid_credential(raw: &str) -> bool {
    JoinCredential::parse(raw).is_ok()
}

/// Grammar check against a configured placeholder
pub fn is_valid_credential_with(raw: &str, sentinel: &str) -> bool {
    JoinCredential::parse_with_sentinel(raw, sentinel).is_ok()
}
