//! Routing key resolution
//!
//! A wallet can be addressed either directly by its capability token or by
//! its public anchor id. The anchor id -> token bindings live client-side in
//! the `SSAPP-TOKEN` httpOnly cookie as a JSON object; nothing is cached here,
//! every request is resolved from its own cookie header.

use crate::cookie::{parse_cookies, SetCookie};
use crate::redact;
use serde_json::{Map, Value};
use tracing::{error, info};

/// Name of the cookie carrying the anchor id -> token bindings
pub const SSAPP_TOKEN_COOKIE_NAME: &str = "SSAPP-TOKEN";

/// Largest Max-Age that 32-bit clients handle without overflow (2038-01-19)
pub const LEGACY_MAX_AGE_SECS: i64 = i32::MAX as i64;

/// Errors from a bind request
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindError {
    #[error("required sReadSSI body field not present")]
    MissingToken,
    #[error("sReadSSI must be a string")]
    TokenNotString,
}

/// Capability token injected by an upstream layer as a request extension.
///
/// When present it takes precedence over any cookie binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityToken(pub String);

/// The outcome of resolving a request's routing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Capability token used as the registry key
    pub key: String,
    /// Set only when the key was found through a cookie binding
    pub anchor_id: Option<String>,
}

/// JSON body of a bind request
#[derive(Debug, serde::Deserialize)]
pub struct BindRequest {
    #[serde(rename = "sReadSSI")]
    pub s_read_ssi: Option<Value>,
}

impl BindRequest {
    /// The token to bind; an absent or null field reads as empty
    pub fn token(&self) -> Result<&str, BindError> {
        match &self.s_read_ssi {
            None | Some(Value::Null) => Ok(""),
            Some(Value::String(token)) => Ok(token),
            Some(_) => Err(BindError::TokenNotString),
        }
    }
}

/// Load the binding map from a cookie header, treating anything unusable as empty
fn load_mapping(cookie_header: Option<&str>) -> Map<String, Value> {
    let cookies = parse_cookies(cookie_header);
    let Some(raw) = cookies.get(SSAPP_TOKEN_COOKIE_NAME) else {
        return Map::new();
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(mapping)) => mapping,
        Ok(other) => {
            error!(
                cookie = SSAPP_TOKEN_COOKIE_NAME,
                kind = json_kind(&other),
                "Detected invalid cookie value, expected a JSON object"
            );
            Map::new()
        }
        Err(e) => {
            error!(cookie = SSAPP_TOKEN_COOKIE_NAME, error = %e, "Failed to parse cookie value");
            Map::new()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Look up the capability token bound to `anchor_id` in the request's cookie
pub fn resolve_binding_target(anchor_id: &str, cookie_header: Option<&str>) -> Option<String> {
    match load_mapping(cookie_header).remove(anchor_id) {
        Some(Value::String(token)) if !token.is_empty() => Some(token),
        Some(_) => {
            error!(anchor_id, "Ignoring unusable binding entry");
            None
        }
        None => None,
    }
}

/// Add or replace the binding for `anchor_id`, producing the updated cookie.
///
/// Existing bindings for other anchor ids are preserved.
pub fn bind(
    anchor_id: &str,
    token: &str,
    existing_cookie_header: Option<&str>,
) -> Result<SetCookie, BindError> {
    if token.is_empty() {
        return Err(BindError::MissingToken);
    }

    let mut mapping = load_mapping(existing_cookie_header);
    mapping.insert(anchor_id.to_string(), Value::String(token.to_string()));

    Ok(SetCookie::new(SSAPP_TOKEN_COOKIE_NAME, Value::Object(mapping).to_string())
        .http_only()
        .with_path("/")
        .with_max_age(LEGACY_MAX_AGE_SECS))
}

/// Compute the effective routing key for a content request.
///
/// `path_key` is the decoded key segment of the URL. An explicit token wins
/// outright; otherwise a cookie binding for `path_key` is used; otherwise the
/// path key itself is the routing key.
pub fn resolve_identity(
    path_key: &str,
    explicit_token: Option<&CapabilityToken>,
    cookie_header: Option<&str>,
) -> ResolvedIdentity {
    if let Some(CapabilityToken(token)) = explicit_token {
        return ResolvedIdentity {
            key: token.clone(),
            anchor_id: None,
        };
    }

    match resolve_binding_target(path_key, cookie_header) {
        Some(token) => {
            info!(
                anchor_id = path_key,
                key = %redact(&token),
                "Found binding for wallet anchor id"
            );
            ResolvedIdentity {
                key: token,
                anchor_id: Some(path_key.to_string()),
            }
        }
        None => ResolvedIdentity {
            key: path_key.to_string(),
            anchor_id: None,
        },
    }
}
