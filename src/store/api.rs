//! Wire types shared by the parameter server and its HTTP channel

use serde::{Deserialize, Serialize};

/// `GET /v1/params/{*key}` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamResponse {
    pub key: String,
    pub value: String,
    pub version: u64,
    /// RFC 3339
    pub updated_at: String,
}

/// `PUT /v1/params/{*key}` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutParamRequest {
    pub value: String,
}

/// `PUT /v1/params/{*key}` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutParamResponse {
    pub key: String,
    pub version: u64,
}
