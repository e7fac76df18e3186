//! Access control for the parameter store
//!
//! Every bearer token is bound to exactly one session namespace and one role.
//! Only token hashes are kept in memory.

use crate::common::config::GrantConfig;
use crate::common::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Token prefix for easy identification in configs and logs
const TOKEN_PREFIX: &str = "jrt_";

/// Random bytes in a generated token (before hex encoding)
const TOKEN_BYTES: usize = 24;

/// Role defining access levels within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRole {
    /// The initializer identity: read and write
    Writer,
    /// Joiners: read only
    Reader,
}

impl AccessRole {
    pub fn can_write(&self) -> bool {
        matches!(self, AccessRole::Writer)
    }
}

/// Operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Authentication context extracted from a valid request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub session: String,
    pub role: AccessRole,
}

/// Set of accepted session grants
#[derive(Debug, Default, Clone)]
pub struct AccessPolicy {
    /// token hash -> grant
    grants: HashMap<String, AuthContext>,
}

impl AccessPolicy {
    pub fn from_grants(grants: &[GrantConfig]) -> Self {
        let mut policy = Self::default();
        for grant in grants {
            policy.add_grant(&grant.token, &grant.session, grant.role);
        }
        policy
    }

    pub fn add_grant(&mut self, token: &str, session: &str, role: AccessRole) {
        self.grants.insert(
            hash_token(token),
            AuthContext {
                session: session.to_string(),
                role,
            },
        );
    }

    /// With no grants configured the server runs open (local development)
    pub fn is_open(&self) -> bool {
        self.grants.is_empty()
    }

    /// Resolve a bearer token to its grant
    pub fn authenticate(&self, token: Option<&str>) -> Result<AuthContext> {
        let token = token.ok_or(Error::Unauthorized)?;
        self.grants
            .get(&hash_token(token))
            .cloned()
            .ok_or(Error::Unauthorized)
    }

    /// Check that `ctx` may perform `access` on `key` (`/<domain>/<session>/...`)
    pub fn authorize(&self, ctx: &AuthContext, key: &str, access: Access) -> Result<()> {
        let session = session_of(key)
            .ok_or_else(|| Error::Forbidden(format!("key outside any session: {}", key)))?;

        if session != ctx.session {
            return Err(Error::Forbidden(format!(
                "token for session {} cannot access {}",
                ctx.session, key
            )));
        }

        if access == Access::Write && !ctx.role.can_write() {
            return Err(Error::Forbidden(format!("read-only token cannot write {}", key)));
        }

        Ok(())
    }
}

/// Session segment of a namespaced key
pub fn session_of(key: &str) -> Option<&str> {
    let mut segments = key.trim_start_matches('/').split('/');
    let _domain = segments.next().filter(|s| !s.is_empty())?;
    segments.next().filter(|s| !s.is_empty())
}

/// SHA-256 of a token, hex encoded
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Generate a new random session token
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, hex::encode(bytes))
}
