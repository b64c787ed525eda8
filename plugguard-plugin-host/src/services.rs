//! Services behind the capability host functions.
//!
//! `HostServices` is shared by every sandbox a factory creates. Host
//! functions call into it with plain Rust values; encoding results for the
//! guest happens in [`crate::host`].

use crate::limits::ResourceLimits;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Provider for the `ai:chat` and `ai:embeddings` capabilities.
///
/// Errors are plain strings; they are handed back to the plugin verbatim.
pub trait AiService: Send + Sync {
    fn chat(&self, plugin_id: &str, request: &Value) -> Result<Value, String>;
    fn embed(&self, plugin_id: &str, input: &Value) -> Result<Value, String>;
}

/// Request a plugin passes to `host.fetch`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub ok: bool,
    pub body: String,
}

/// Only absolute `http`/`https` URLs with a host are fetchable.
pub fn validate_fetch_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid url '{raw}': {e}"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("scheme '{other}' is not allowed")),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(format!("url '{raw}' has no host"));
    }
    Ok(url)
}

pub struct HostServices {
    fetch_timeout: Duration,
    max_fetch_bytes: usize,
    http: OnceLock<Client>,
    ai: Option<Arc<dyn AiService>>,
}

impl HostServices {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            fetch_timeout: limits.fetch_timeout(),
            max_fetch_bytes: limits.max_fetch_bytes,
            http: OnceLock::new(),
            ai: None,
        }
    }

    pub fn with_ai_service(mut self, ai: Arc<dyn AiService>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn has_ai_service(&self) -> bool {
        self.ai.is_some()
    }

    fn client(&self) -> Result<&Client, String> {
        if let Some(client) = self.http.get() {
            return Ok(client);
        }
        let client = Client::builder()
            .timeout(self.fetch_timeout)
            .build()
            .map_err(|e| format!("http client unavailable: {e}"))?;
        Ok(self.http.get_or_init(|| client))
    }

    /// Performs a blocking HTTP request on behalf of a plugin.
    ///
    /// The request may take at most `remaining`, the time left in the guest
    /// call that issued it, or the configured fetch timeout if that is
    /// shorter. Bodies over `max_fetch_bytes` are refused.
    pub fn fetch(
        &self,
        plugin_id: &str,
        request: &FetchRequest,
        remaining: Duration,
    ) -> Result<FetchResponse, String> {
        let url = validate_fetch_url(&request.url)?;
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid method '{}'", request.method))?;
        let timeout = self.fetch_timeout.min(remaining);
        if timeout.is_zero() {
            return Err("call deadline reached before the request was sent".to_string());
        }

        debug!(plugin_id = %plugin_id, %method, %url, ?timeout, "Plugin fetch");

        let mut builder = self.client()?.request(method, url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let fetch_error = |e: reqwest::Error| {
            warn!(plugin_id = %plugin_id, error = %e, "Plugin fetch failed");
            if e.is_timeout() {
                format!("request timed out after {}ms", timeout.as_millis())
            } else {
                e.to_string()
            }
        };
        let response = builder.send().map_err(fetch_error)?;
        let status = response.status();
        let body = self.read_body(plugin_id, response)?;
        Ok(FetchResponse {
            status: status.as_u16(),
            ok: status.is_success(),
            body,
        })
    }

    fn read_body(&self, plugin_id: &str, response: reqwest::blocking::Response) -> Result<String, String> {
        let limit = self.max_fetch_bytes;
        let too_large = || format!("response body exceeds the {limit} byte limit");
        if response.content_length().is_some_and(|len| len > limit as u64) {
            warn!(plugin_id = %plugin_id, limit, "Plugin fetch response too large");
            return Err(too_large());
        }

        let mut body = Vec::new();
        response
            .take((limit as u64).saturating_add(1))
            .read_to_end(&mut body)
            .map_err(|e| format!("failed to read response body: {e}"))?;
        if body.len() > limit {
            warn!(plugin_id = %plugin_id, limit, "Plugin fetch response too large");
            return Err(too_large());
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub fn ai_chat(&self, plugin_id: &str, request: &Value) -> Result<Value, String> {
        self.ai_service()?.chat(plugin_id, request)
    }

    pub fn ai_embed(&self, plugin_id: &str, input: &Value) -> Result<Value, String> {
        self.ai_service()?.embed(plugin_id, input)
    }

    fn ai_service(&self) -> Result<&Arc<dyn AiService>, String> {
        self.ai
            .as_ref()
            .ok_or_else(|| "no AI service is configured on this host".to_string())
    }
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("fetch_timeout", &self.fetch_timeout)
            .field("max_fetch_bytes", &self.max_fetch_bytes)
            .field("ai", &self.ai.is_some())
            .finish()
    }
}
