//! Upgrade Dispatcher (§4.4): inspects the HTTP upgrade request's path and
//! query before the WebSocket handshake completes, and decides which of the
//! three surfaces (`/cdp`, `/extension`, legacy launch) it belongs to.
//!
//! Kept free of any I/O so the routing decision can be unit tested without
//! a socket: [`Dispatcher::route`] takes a `req.uri()`-equivalent string and
//! returns a [`Route`] or a definite HTTP-status rejection.

use std::collections::HashMap;

use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::error::GatewayError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LaunchOptions {
    pub user: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Route {
    Cdp { device_id: String },
    Extension,
    LegacyLaunch { starting_url: String, launch: LaunchOptions },
}

pub struct Dispatcher {
    token: Option<String>,
}

impl Dispatcher {
    pub fn new(token: Option<String>) -> Self {
        Dispatcher { token }
    }

    /// Parse `path_and_query` (e.g. `/cdp?deviceId=dev-A`) into a [`Route`],
    /// or a [`GatewayError`] whose `http_status()` is the definite response
    /// to write back on the raw socket before any handshake completes.
    pub fn route(&self, path_and_query: &str) -> Result<Route, GatewayError> {
        let (path, query) = split_path_query(path_and_query);
        let params = parse_query(query);

        match path {
            "/cdp" => match params.get("deviceId") {
                Some(device_id) if !device_id.is_empty() => Ok(Route::Cdp { device_id: device_id.clone() }),
                _ => Err(GatewayError::BadRequest("deviceId is required".to_string())),
            },
            "/extension" => Ok(Route::Extension),
            _ => self.route_legacy(path, &params),
        }
    }

    fn route_legacy(&self, path: &str, params: &HashMap<String, String>) -> Result<Route, GatewayError> {
        // Tolerate the `/k1/v1/k2/v2` path-pair parameter encoding in
        // addition to a query string, per §4.4.
        let mut merged = parse_path_pairs(path);
        for (k, v) in params {
            merged.insert(k.clone(), v.clone());
        }

        if let Some(expected) = &self.token {
            match merged.get("token") {
                Some(given) if token_eq(given, expected) => {}
                _ => return Err(GatewayError::Forbidden("invalid token".to_string())),
            }
        }

        let starting_url = merged
            .get("startingUrl")
            .cloned()
            .ok_or_else(|| GatewayError::BadRequest("startingUrl is required".to_string()))?;

        let launch = match merged.get("launch") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| GatewayError::BadRequest(format!("invalid launch parameter: {e}")))?,
            None => LaunchOptions::default(),
        };

        Ok(Route::LegacyLaunch { starting_url, launch })
    }
}

/// Constant-time comparison for the legacy path's shared secret, so an
/// attacker probing the `token` query parameter can't time a byte-by-byte
/// match against `==`'s early-exit behavior.
fn token_eq(given: &str, expected: &str) -> bool {
    bool::from(given.as_bytes().ct_eq(expected.as_bytes()))
}

fn split_path_query(path_and_query: &str) -> (&str, &str) {
    match path_and_query.split_once('?') {
        Some((path, query)) => (path, query),
        None => (path_and_query, ""),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if query.is_empty() {
        return params;
    }
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(urldecode(key), urldecode(value));
    }
    params
}

/// `/key1/val1/key2/val2` → `{key1: val1, key2: val2}`. A trailing odd
/// segment with no value is ignored.
fn parse_path_pairs(path: &str) -> HashMap<String, String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut params = HashMap::new();
    let mut chunks = segments.chunks_exact(2);
    for pair in &mut chunks {
        params.insert(urldecode(pair[0]), urldecode(pair[1]));
    }
    params
}

fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(value) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(value);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_cdp_with_device_id() {
        let dispatcher = Dispatcher::new(None);
        let route = dispatcher.route("/cdp?deviceId=dev-A").unwrap();
        assert!(matches!(route, Route::Cdp { device_id } if device_id == "dev-A"));
    }

    #[test]
    fn rejects_cdp_without_device_id() {
        let dispatcher = Dispatcher::new(None);
        let err = dispatcher.route("/cdp").unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn routes_extension() {
        let dispatcher = Dispatcher::new(None);
        assert!(matches!(dispatcher.route("/extension").unwrap(), Route::Extension));
    }

    #[test]
    fn legacy_requires_matching_token() {
        let dispatcher = Dispatcher::new(Some("secret".to_string()));
        let err = dispatcher
            .route("/launch?token=wrong&startingUrl=https://example.com")
            .unwrap_err();
        assert_eq!(err.http_status(), 403);

        let route = dispatcher
            .route("/launch?token=secret&startingUrl=https://example.com")
            .unwrap();
        assert!(matches!(route, Route::LegacyLaunch { .. }));
    }

    #[test]
    fn legacy_requires_starting_url() {
        let dispatcher = Dispatcher::new(None);
        let err = dispatcher.route("/launch?token=x").unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn legacy_tolerates_path_pair_encoding() {
        let dispatcher = Dispatcher::new(None);
        let route = dispatcher.route("/startingUrl/https%3A%2F%2Fexample.com").unwrap();
        match route {
            Route::LegacyLaunch { starting_url, .. } => assert_eq!(starting_url, "https://example.com"),
            _ => panic!("expected legacy launch route"),
        }
    }

    #[test]
    fn legacy_parses_launch_json() {
        let dispatcher = Dispatcher::new(None);
        let route = dispatcher
            .route(r#"/launch?startingUrl=https://example.com&launch={"user":"alice","args":["--foo"]}"#)
            .unwrap();
        match route {
            Route::LegacyLaunch { launch, .. } => {
                assert_eq!(launch.user.as_deref(), Some("alice"));
                assert_eq!(launch.args, vec!["--foo".to_string()]);
            }
            _ => panic!("expected legacy launch route"),
        }
    }
}
