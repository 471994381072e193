//! The interactive authorization flow
//!
//! `start_login` validates pre-flight conditions, claims the per-server
//! flow slot, runs discovery and (if needed) dynamic registration, builds
//! the PKCE authorization URL, injects the RFC 8707 `resource` and any
//! manual extra parameters, opens the browser where permitted and returns.
//! A background task owns the rest: callback, code exchange, persistence
//! and re-scheduling of the proactive refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mcpproxy_config::{OAuthSettings, UpstreamConfig};
use mcpproxy_events::{EventBus, ProxyEvent};
use mcpproxy_storage::OAuthTokenRecord;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::browser;
use crate::callback::CallbackServer;
use crate::coordinator::FlowCoordinator;
use crate::dcr::{self, RegistrationRequest};
use crate::discovery::{self, DiscoveryOutcome};
use crate::error::{OAuthError, OAuthResult};
use crate::refresh::RefreshManager;
use crate::resource::{merge_extra_params, select_resource};
use crate::tokens::TokenStore;

/// Response to `POST /servers/{name}/login`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthStartResponse {
    pub success: bool,
    pub server_name: String,
    pub correlation_id: String,

    /// Always present so headless callers can show it
    pub auth_url: String,

    pub browser_opened: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_error: Option<String>,

    pub message: String,
}

/// Owns everything a login flow needs
pub struct OAuthFlowManager {
    settings: OAuthSettings,
    tokens: TokenStore,
    coordinator: Arc<FlowCoordinator>,
    refresh: Arc<RefreshManager>,
    bus: EventBus,
    http: reqwest::Client,
}

impl OAuthFlowManager {
    pub fn new(
        settings: OAuthSettings,
        tokens: TokenStore,
        coordinator: Arc<FlowCoordinator>,
        refresh: Arc<RefreshManager>,
        bus: EventBus,
    ) -> Self {
        Self {
            settings,
            tokens,
            coordinator,
            refresh,
            bus,
            http: reqwest::Client::new(),
        }
    }

    /// Pre-flight checks that cost no network activity
    pub fn preflight(&self, config: &UpstreamConfig) -> OAuthResult<()> {
        if !config.enabled {
            return Err(OAuthError::ServerDisabled {
                name: config.name.clone(),
            });
        }
        if config.quarantined {
            return Err(OAuthError::ServerQuarantined {
                name: config.name.clone(),
            });
        }
        if !config.is_http_family() {
            return Err(OAuthError::OAuthNotSupported {
                name: config.name.clone(),
            });
        }
        if let Some(active) = self.coordinator.active_flow(&config.name) {
            return Err(OAuthError::FlowInProgress {
                name: config.name.clone(),
                correlation_id: active,
            });
        }
        Ok(())
    }

    /// Start the authorization flow for `config`
    pub async fn start_login(
        self: &Arc<Self>,
        config: &UpstreamConfig,
    ) -> OAuthResult<OAuthStartResponse> {
        self.preflight(config)?;

        let correlation_id = Uuid::new_v4().to_string();
        let server = config.name.clone();
        let server_url = config.url.clone().unwrap_or_default();

        // Claimed here, released by the background task when the flow ends
        let guard = self.coordinator.start_flow(&server, &correlation_id)?;

        info!(server = %server, correlation_id = %correlation_id, "starting OAuth discovery");
        let discovered = discovery::discover(&self.http, &server_url, &correlation_id).await?;

        let callback = CallbackServer::bind(
            self.settings.callback_port_start,
            self.settings.callback_port_end,
            &correlation_id,
        )
        .await?;
        let redirect_uri = callback.redirect_uri();

        let oauth_config = config.oauth.clone().unwrap_or_default();
        let (client_id, client_secret) = match oauth_config.client_id.clone() {
            Some(id) => (id, oauth_config.client_secret.clone()),
            None => {
                let endpoint = discovered
                    .auth_metadata
                    .registration_endpoint
                    .clone()
                    .ok_or_else(|| OAuthError::ClientIdRequired {
                        message: "no client_id configured and the authorization server offers no registration endpoint".to_string(),
                        correlation_id: correlation_id.clone(),
                        details: json!({ "registration_endpoint": null }),
                    })?;
                let registered = dcr::register(
                    &self.http,
                    &endpoint,
                    &RegistrationRequest::for_proxy(&redirect_uri),
                    &correlation_id,
                )
                .await?;
                (registered.client_id, registered.client_secret)
            }
        };

        let scopes = if !oauth_config.scopes.is_empty() {
            oauth_config.scopes.clone()
        } else if !discovered.resource_metadata.scopes_supported.is_empty() {
            discovered.resource_metadata.scopes_supported.clone()
        } else {
            discovered.auth_metadata.scopes_supported.clone()
        };

        let token_endpoint = discovered
            .auth_metadata
            .token_endpoint
            .clone()
            .ok_or_else(|| OAuthError::MetadataInvalid {
                message: "authorization server metadata has no token_endpoint".to_string(),
                correlation_id: correlation_id.clone(),
                details: discovered.details.clone(),
            })?;

        let (auth_url, csrf_state, pkce_verifier) = build_authorization_url(
            &discovered,
            &client_id,
            client_secret.as_deref(),
            &token_endpoint,
            &redirect_uri,
            &scopes,
            &oauth_config.extra_params,
            &server_url,
            &correlation_id,
        )?;

        let outcome = if self.coordinator.may_open_browser(&server, false) {
            browser::open(&auth_url)
        } else {
            browser::BrowserOutcome {
                opened: false,
                error: Some("browser open rate limited for this server".to_string()),
            }
        };

        // Background: callback, exchange, persist
        let manager = self.clone();
        let flow_config = FlowCompletion {
            server: server.clone(),
            correlation_id: correlation_id.clone(),
            client_id,
            client_secret,
            token_endpoint,
            redirect_uri,
            resource: select_resource(
                &oauth_config.extra_params,
                Some(discovered.resource_metadata.resource.as_str()),
                &server_url,
            ),
            scopes,
        };
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = manager
                .complete_flow(flow_config, callback, csrf_state, pkce_verifier)
                .await
            {
                error!(
                    correlation_id = e.correlation_id().unwrap_or(""),
                    error = %redact_secrets(&e.to_string()),
                    "OAuth flow failed"
                );
            }
        });

        Ok(OAuthStartResponse {
            success: true,
            server_name: server.clone(),
            correlation_id,
            message: if outcome.opened {
                "Browser opened; complete the login there".to_string()
            } else {
                "Open the authorization URL to continue the login".to_string()
            },
            browser_opened: outcome.opened,
            browser_error: outcome.error,
            auth_url,
        })
    }

    /// Wait for the redirect, exchange the code, persist the token
    async fn complete_flow(
        &self,
        flow: FlowCompletion,
        callback: CallbackServer,
        csrf_state: String,
        pkce_verifier: PkceCodeVerifier,
    ) -> OAuthResult<()> {
        let correlation_id = flow.correlation_id.clone();

        let result = tokio::time::timeout(
            self.settings.flow_timeout,
            callback.wait_for_code(&csrf_state, &correlation_id),
        )
        .await
        .map_err(|_| OAuthError::FlowFailed {
            message: format!(
                "no callback within {} seconds",
                self.settings.flow_timeout.as_secs()
            ),
            correlation_id: correlation_id.clone(),
            details: json!({ "step": "callback_wait" }),
        })??;

        let client = BasicClient::new(ClientId::new(flow.client_id.clone()))
            .set_auth_uri(AuthUrl::new("https://unused.invalid/authorize".to_string()).expect("static url"))
            .set_token_uri(TokenUrl::new(flow.token_endpoint.clone()).map_err(|e| {
                OAuthError::MetadataInvalid {
                    message: format!("invalid token endpoint: {}", e),
                    correlation_id: correlation_id.clone(),
                    details: json!({ "token_endpoint": flow.token_endpoint }),
                }
            })?)
            .set_redirect_uri(RedirectUrl::new(flow.redirect_uri.clone()).map_err(|e| {
                OAuthError::FlowFailed {
                    message: format!("invalid redirect uri: {}", e),
                    correlation_id: correlation_id.clone(),
                    details: json!({ "redirect_uri": flow.redirect_uri }),
                }
            })?);
        let client = match flow.client_secret.clone() {
            Some(secret) => client.set_client_secret(ClientSecret::new(secret)),
            None => client,
        };

        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| OAuthError::FlowFailed {
                message: format!("http client: {}", e),
                correlation_id: correlation_id.clone(),
                details: json!({ "step": "token_exchange" }),
            })?;

        let response = client
            .exchange_code(AuthorizationCode::new(result.code))
            .set_pkce_verifier(pkce_verifier)
            .add_extra_param("resource", flow.resource.clone())
            .request_async(&http)
            .await
            .map_err(|e| OAuthError::FlowFailed {
                message: format!("code exchange failed: {}", redact_secrets(&e.to_string())),
                correlation_id: correlation_id.clone(),
                details: json!({ "step": "token_exchange" }),
            })?;

        let expires_in = response.expires_in().unwrap_or(Duration::from_secs(3600));
        let granted_scopes = response
            .scopes()
            .map(|scopes| scopes.iter().map(|s| s.to_string()).collect())
            .unwrap_or(flow.scopes);

        let record = OAuthTokenRecord {
            server_name: flow.server.clone(),
            display_name: flow.server.clone(),
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now() + chrono::Duration::from_std(expires_in).unwrap_or_else(|_| chrono::Duration::zero()),
            scopes: granted_scopes,
            client_id: flow.client_id,
            client_secret: flow.client_secret,
            token_endpoint: Some(flow.token_endpoint),
            created: Utc::now(),
            updated: Utc::now(),
        };

        self.tokens.save(&record).map_err(|e| OAuthError::FlowFailed {
            message: format!("failed to persist token: {}", e),
            correlation_id: correlation_id.clone(),
            details: json!({ "step": "persist" }),
        })?;

        self.refresh.token_saved(&record);

        info!(
            server = %flow.server,
            correlation_id = %correlation_id,
            expires_at = %record.expires_at,
            "OAuth flow complete, token stored"
        );

        // No dedicated completion event type: a fresh token is announced
        // through token.refreshed, and consumers re-fetch on
        // servers.changed.
        self.bus.publish(ProxyEvent::TokenRefreshed {
            server: flow.server.clone(),
        });
        self.bus.publish(ProxyEvent::ServersChanged);

        Ok(())
    }
}

struct FlowCompletion {
    server: String,
    correlation_id: String,
    client_id: String,
    client_secret: Option<String>,
    token_endpoint: String,
    redirect_uri: String,
    resource: String,
    scopes: Vec<String>,
}

/// Build the authorization URL via the OAuth library, then parse it and
/// inject the `resource` and manual extra parameters
#[allow(clippy::too_many_arguments)]
fn build_authorization_url(
    discovered: &DiscoveryOutcome,
    client_id: &str,
    _client_secret: Option<&str>,
    token_endpoint: &str,
    redirect_uri: &str,
    scopes: &[String],
    manual_extra_params: &std::collections::HashMap<String, String>,
    server_url: &str,
    correlation_id: &str,
) -> OAuthResult<(String, String, PkceCodeVerifier)> {
    if !discovered.auth_metadata.supports_pkce_s256()
        && !discovered
            .auth_metadata
            .code_challenge_methods_supported
            .is_empty()
    {
        warn!(correlation_id = %correlation_id, "authorization server advertises PKCE without S256");
    }

    let auth_url = AuthUrl::new(discovered.auth_metadata.authorization_endpoint.clone())
        .map_err(|e| OAuthError::MetadataInvalid {
            message: format!("invalid authorization endpoint: {}", e),
            correlation_id: correlation_id.to_string(),
            details: discovered.details.clone(),
        })?;
    let token_url = TokenUrl::new(token_endpoint.to_string()).map_err(|e| {
        OAuthError::MetadataInvalid {
            message: format!("invalid token endpoint: {}", e),
            correlation_id: correlation_id.to_string(),
            details: discovered.details.clone(),
        }
    })?;
    let redirect = RedirectUrl::new(redirect_uri.to_string()).map_err(|e| {
        OAuthError::FlowFailed {
            message: format!("invalid redirect uri: {}", e),
            correlation_id: correlation_id.to_string(),
            details: json!({ "redirect_uri": redirect_uri }),
        }
    })?;

    let client = BasicClient::new(ClientId::new(client_id.to_string()))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url)
        .set_redirect_uri(redirect);

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
    let mut request = client
        .authorize_url(CsrfToken::new_random)
        .set_pkce_challenge(pkce_challenge);
    for scope in scopes {
        request = request.add_scope(Scope::new(scope.clone()));
    }
    let (mut url, csrf_token) = request.url();

    // The library built the base URL; inject the resource parameter and
    // manual extras on top (manual wins per key).
    let resource = select_resource(
        manual_extra_params,
        Some(discovered.resource_metadata.resource.as_str()),
        server_url,
    );
    let auto = vec![("resource".to_string(), resource)];
    for (key, value) in merge_extra_params(&auto, manual_extra_params) {
        if key != "resource" || !url.query_pairs().any(|(k, _)| k == "resource") {
            url.query_pairs_mut().append_pair(&key, &value);
        }
    }

    Ok((url.to_string(), csrf_token.secret().clone(), pkce_verifier))
}

/// Mask bearer tokens and client secrets before a string reaches a log
pub fn redact_secrets(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("Bearer ") {
        out.push_str(&rest[..pos]);
        out.push_str("Bearer ***");
        let after = &rest[pos + "Bearer ".len()..];
        let end = after
            .find(|c: char| c.is_whitespace() || c == '"' || c == ',')
            .unwrap_or(after.len());
        rest = &after[end..];
    }
    out.push_str(rest);

    if let Some(pos) = out.find("client_secret=") {
        let start = pos + "client_secret=".len();
        let end = out[start..]
            .find(|c: char| c == '&' || c.is_whitespace())
            .map(|offset| start + offset)
            .unwrap_or(out.len());
        out.replace_range(start..end, "***");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{AuthorizationServerMetadata, ProtectedResourceMetadata};
    use std::collections::HashMap;

    fn outcome() -> DiscoveryOutcome {
        DiscoveryOutcome {
            resource_metadata: ProtectedResourceMetadata {
                resource: "https://rs.example/mcp".into(),
                scopes_supported: vec!["mcp".into()],
                authorization_servers: vec!["https://as.example".into()],
                additional_fields: Default::default(),
            },
            auth_metadata: AuthorizationServerMetadata {
                issuer: "https://as.example".into(),
                authorization_endpoint: "https://as.example/authorize".into(),
                token_endpoint: Some("https://as.example/token".into()),
                registration_endpoint: None,
                scopes_supported: vec![],
                code_challenge_methods_supported: vec!["S256".into()],
                additional_fields: Default::default(),
            },
            details: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_authorization_url_carries_pkce_state_and_resource() {
        let (url, state, _verifier) = build_authorization_url(
            &outcome(),
            "client-1",
            None,
            "https://as.example/token",
            "http://127.0.0.1:52500/callback",
            &["mcp".to_string()],
            &HashMap::new(),
            "https://rs.example/mcp",
            "cid",
        )
        .unwrap();

        let parsed = url::Url::parse(&url).unwrap();
        let pairs: HashMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "client-1");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["resource"], "https://rs.example/mcp");
        assert_eq!(pairs["scope"], "mcp");
        assert_eq!(pairs["state"], state);
        assert!(pairs.contains_key("code_challenge"));
    }

    #[test]
    fn test_manual_extra_params_injected_and_win() {
        let manual = HashMap::from([
            ("resource".to_string(), "https://manual.example".to_string()),
            ("audience".to_string(), "mcp-api".to_string()),
        ]);
        let (url, _, _) = build_authorization_url(
            &outcome(),
            "client-1",
            None,
            "https://as.example/token",
            "http://127.0.0.1:52500/callback",
            &[],
            &manual,
            "https://rs.example/mcp",
            "cid",
        )
        .unwrap();

        let parsed = url::Url::parse(&url).unwrap();
        let resources: Vec<String> = parsed
            .query_pairs()
            .filter(|(k, _)| k == "resource")
            .map(|(_, v)| v.into_owned())
            .collect();
        assert_eq!(resources, vec!["https://manual.example".to_string()]);
        assert!(parsed.query_pairs().any(|(k, v)| k == "audience" && v == "mcp-api"));
    }

    #[test]
    fn test_secret_redaction() {
        assert_eq!(
            redact_secrets("Authorization: Bearer sk-live-12345 end"),
            "Authorization: Bearer *** end"
        );
        assert_eq!(
            redact_secrets("body=client_secret=hunter2&code=x"),
            "body=client_secret=***&code=x"
        );
        assert_eq!(redact_secrets("nothing here"), "nothing here");
    }
}
