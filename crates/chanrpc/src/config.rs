//! # Endpoint Configuration
//!
//! Both endpoints are configured with plain structs. They deserialize from
//! JSON with every field optional, and offer `with_*` setters for code.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::shape::ErrorHook;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Recorded on every log event of this endpoint.
    pub name: String,
    /// Coalesce envelopes queued in one window into a single array message.
    pub batching: bool,
    /// How long a scheduled flush waits. Zero flushes on the next scheduler turn.
    pub batch_window_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "client".into(),
            batching: true,
            batch_window_ms: 0,
        }
    }
}

impl ClientConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window_ms = window.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Recorded on every log event of this endpoint.
    pub name: String,
    /// Accept array messages with more than one item.
    pub batching: bool,
    /// Called for every per-item failure, before its error response is sent.
    #[serde(skip)]
    pub on_error: Option<ErrorHook>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "server".into(),
            batching: true,
            on_error: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("batching", &self.batching)
            .field("on_error", &self.on_error.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl ServerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&crate::shape::ErrorEvent<'_>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_from_partial_json() {
        let config: ClientConfig = serde_json::from_str(r#"{"batch_window_ms": 5}"#).unwrap();
        assert_eq!(config.batch_window(), Duration::from_millis(5));
        assert!(config.batching);
        assert_eq!(config.name, "client");
    }

    #[test]
    fn test_server_config_from_json_has_no_hook() {
        let config: ServerConfig = serde_json::from_str(r#"{"name": "worker", "batching": false}"#).unwrap();
        assert_eq!(config.name, "worker");
        assert!(!config.batching);
        assert!(config.on_error.is_none());
    }
}
