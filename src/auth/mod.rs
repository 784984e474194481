// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Authentication: bearer tokens for the node and panel HTTP surfaces
//!
//! Node daemon tokens have the shape `<token_id>.<token>` (16 + 64 hex chars).
//! The panel keeps only `sha256(token)` for validation, plus the plaintext
//! daemon token it needs to call the node.
//!
//! Panel user tokens have the shape `axp_<48 hex>` and are stored hashed.

use actix_web::HttpRequest;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{AxisError, Result};

pub const USER_TOKEN_PREFIX: &str = "axp_";

/// A freshly issued node credential pair
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token_id: String,
    pub token: String,
}

impl IssuedToken {
    pub fn daemon_token(&self) -> String {
        format!("{}.{}", self.token_id, self.token)
    }

    pub fn token_hash(&self) -> String {
        sha256_hex(&self.token)
    }
}

/// `n` random bytes from the OS CSPRNG, hex encoded
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generate a node token pair: 16 hex id, 64 hex secret
pub fn issue_node_token() -> IssuedToken {
    IssuedToken {
        token_id: random_hex(8),
        token: random_hex(32),
    }
}

/// Generate a panel user API token
pub fn issue_user_token() -> String {
    format!("{}{}", USER_TOKEN_PREFIX, random_hex(24))
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Constant-time comparison to prevent timing attacks
pub fn constant_time_eq(provided: &str, expected: &str) -> bool {
    if provided.is_empty() || expected.is_empty() {
        return false;
    }
    provided.len() == expected.len()
        && provided.as_bytes().iter().zip(expected.as_bytes().iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// Split `<token_id>.<token>` into its parts
pub fn split_daemon_token(daemon_token: &str) -> Option<(&str, &str)> {
    let (id, token) = daemon_token.split_once('.')?;
    if id.is_empty() || token.is_empty() {
        return None;
    }
    Some((id, token))
}

/// Check a presented daemon token against the expected id and secret hash
pub fn verify_daemon_token(presented: &str, token_id: &str, token_hash: &str) -> bool {
    match split_daemon_token(presented) {
        Some((id, token)) => {
            constant_time_eq(id, token_id) && constant_time_eq(&sha256_hex(token), token_hash)
        }
        None => false,
    }
}

/// Extract the bearer token from the Authorization header
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Bearer header, falling back to `?token=` (WebSocket upgrades and pre-signed downloads)
pub fn request_token(req: &HttpRequest) -> Option<String> {
    bearer_token(req).or_else(|| {
        actix_web::web::Query::<std::collections::HashMap<String, String>>::from_query(req.query_string())
            .ok()
            .and_then(|q| q.get("token").cloned())
            .filter(|t| !t.is_empty())
    })
}

pub fn require_token(req: &HttpRequest) -> Result<String> {
    request_token(req).ok_or_else(|| AxisError::Unauthorized("Missing bearer token".to_string()))
}
