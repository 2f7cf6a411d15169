//! HTTP response bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub checks: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct PdvListQuery {
    #[serde(default)]
    pub from: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PdvListResponse {
    pub ids: Vec<u64>,
}
