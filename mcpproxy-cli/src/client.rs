//! Thin REST client the CLI commands speak through

use serde_json::Value;

/// Exit codes: 0 success, 1 general failure, 2 validation failure
pub const EXIT_OK: u8 = 0;
pub const EXIT_GENERAL: u8 = 1;
pub const EXIT_VALIDATION: u8 = 2;

/// A CLI-facing error with its exit code
#[derive(Debug)]
pub struct CliError {
    pub message: String,
    pub suggestion: Option<String>,
    pub debug_hint: Option<String>,
    pub exit_code: u8,
}

impl CliError {
    pub fn general(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            debug_hint: None,
            exit_code: EXIT_GENERAL,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            debug_hint: None,
            exit_code: EXIT_VALIDATION,
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;

pub struct ApiClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.or_else(|| std::env::var("MCPPROXY_API_KEY").ok()),
            http: reqwest::Client::new(),
        }
    }

    fn with_key(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    /// GET an enveloped endpoint and unwrap `data`
    pub async fn get(&self, path: &str) -> CliResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .with_key(self.http.get(&url))
            .send()
            .await
            .map_err(|e| {
                CliError::general(format!(
                    "cannot reach the daemon at {}: {} (is 'mcpproxy serve' running?)",
                    self.base_url, e
                ))
            })?;
        Self::unwrap_envelope(response).await
    }

    /// POST with an optional JSON body, unwrapping the envelope
    pub async fn post(&self, path: &str, body: Option<&Value>) -> CliResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.with_key(self.http.post(&url));
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(|e| {
            CliError::general(format!("cannot reach the daemon: {}", e))
        })?;
        Self::unwrap_envelope(response).await
    }

    pub async fn delete(&self, path: &str) -> CliResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .with_key(self.http.delete(&url))
            .send()
            .await
            .map_err(|e| CliError::general(format!("cannot reach the daemon: {}", e)))?;
        Self::unwrap_envelope(response).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> CliResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .with_key(self.http.patch(&url).json(body))
            .send()
            .await
            .map_err(|e| CliError::general(format!("cannot reach the daemon: {}", e)))?;
        Self::unwrap_envelope(response).await
    }

    /// POST returning the raw body (for endpoints outside the envelope,
    /// like the OAuth login response)
    pub async fn post_raw(&self, path: &str) -> CliResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .with_key(self.http.post(&url))
            .send()
            .await
            .map_err(|e| CliError::general(format!("cannot reach the daemon: {}", e)))?;
        response
            .json()
            .await
            .map_err(|e| CliError::general(format!("malformed response: {}", e)))
    }

    /// Raw POST to the MCP endpoint (not enveloped)
    pub async fn mcp(&self, request: &Value) -> CliResult<Value> {
        let url = format!("{}/mcp", self.base_url);
        let response = self
            .with_key(self.http.post(&url).json(request))
            .send()
            .await
            .map_err(|e| CliError::general(format!("cannot reach the daemon: {}", e)))?;
        response
            .json()
            .await
            .map_err(|e| CliError::general(format!("malformed MCP response: {}", e)))
    }

    async fn unwrap_envelope(response: reqwest::Response) -> CliResult<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| CliError::general(format!("malformed response: {}", e)))?;

        if body.get("success").and_then(Value::as_bool) == Some(true) {
            return Ok(body.get("data").cloned().unwrap_or(Value::Null));
        }

        // Classified OAuth errors carry their own shape
        let message = body
            .get("error")
            .and_then(|e| e.get("message"))
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        let suggestion = body
            .get("suggestion")
            .and_then(Value::as_str)
            .map(String::from);
        let debug_hint = body
            .get("debug_hint")
            .and_then(Value::as_str)
            .map(String::from);

        let exit_code = if status.as_u16() == 404 || status.as_u16() == 400 {
            EXIT_VALIDATION
        } else {
            EXIT_GENERAL
        };

        Err(CliError {
            message,
            suggestion,
            debug_hint,
            exit_code,
        })
    }
}
