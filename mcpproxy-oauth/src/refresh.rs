//! Proactive token refresh
//!
//! On startup every persisted token gets a schedule: a timer at 80% of
//! remaining lifetime when the token is still valid, an immediate refresh
//! when only the access token lapsed, a permanent `failed` state when the
//! refresh token is gone too. Network failures retry on an exponential
//! backoff (10 s doubling, capped at 5 min, unlimited retries);
//! `invalid_grant` is permanent and surfaces as `action: login`. Attempts
//! for one server are spaced at least 10 s apart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use mcpproxy_config::OAuthSettings;
use mcpproxy_events::{EventBus, ProxyEvent};
use mcpproxy_health::RefreshState;
use mcpproxy_storage::OAuthTokenRecord;
use oauth2::basic::BasicClient;
use oauth2::{ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::tokens::TokenStore;
use crate::{METRIC_REFRESH_DURATION, METRIC_REFRESH_TOTAL};

/// Classified outcome of one refresh attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Success { new_expiry: DateTime<Utc> },
    InvalidGrant { detail: String },
    Network { detail: String },
    Other { detail: String },
}

impl RefreshOutcome {
    /// Metric label for this outcome
    pub fn result_label(&self) -> &'static str {
        match self {
            RefreshOutcome::Success { .. } => "success",
            RefreshOutcome::Network { .. } => "failed_network",
            RefreshOutcome::InvalidGrant { .. } => "failed_invalid_grant",
            RefreshOutcome::Other { .. } => "failed_other",
        }
    }
}

/// Point-in-time view of one server's schedule, consumed by the health
/// calculator and the REST surface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshScheduleSnapshot {
    pub server: String,
    pub expires_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    pub retry_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub state: RefreshState,
}

struct ScheduleEntry {
    expires_at: DateTime<Utc>,
    scheduled_at: Option<DateTime<Utc>>,
    retry_count: u32,
    last_error: Option<String>,
    last_attempt: Option<Instant>,
    state: RefreshState,
    timer: Option<JoinHandle<()>>,
}

impl ScheduleEntry {
    fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at,
            scheduled_at: None,
            retry_count: 0,
            last_error: None,
            last_attempt: None,
            state: RefreshState::Idle,
            timer: None,
        }
    }
}

/// The refresh manager. One per process, owning every schedule.
pub struct RefreshManager {
    tokens: TokenStore,
    bus: EventBus,
    settings: OAuthSettings,
    schedules: Mutex<HashMap<String, ScheduleEntry>>,
}

impl RefreshManager {
    pub fn new(tokens: TokenStore, bus: EventBus, settings: OAuthSettings) -> Arc<Self> {
        Arc::new(Self {
            tokens,
            bus,
            settings,
            schedules: Mutex::new(HashMap::new()),
        })
    }

    /// Scan persisted tokens and set up their schedules
    pub fn start(self: &Arc<Self>) {
        let states = match self.tokens.list() {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "could not enumerate tokens at startup");
                return;
            }
        };

        for state in states {
            let server = state.record.server_name.clone();
            if !state.access_expired {
                self.schedule_at_lifetime_fraction(&server, &state.record);
            } else if state.can_refresh {
                info!(server = %server, "access token expired, refreshing now");
                self.schedule_in(&server, state.record.expires_at, Duration::ZERO);
            } else {
                warn!(server = %server, "access and refresh token both expired, login required");
                let mut schedules = self.schedules.lock().expect("schedules poisoned");
                let entry = schedules
                    .entry(server.clone())
                    .or_insert_with(|| ScheduleEntry::new(state.record.expires_at));
                entry.state = RefreshState::Failed;
                entry.last_error = Some("refresh token expired".to_string());
                drop(schedules);
                self.bus.publish(ProxyEvent::OAuthRequired {
                    server: server.clone(),
                });
            }
        }
    }

    /// Called when a flow produced a fresh token: reset and re-schedule
    pub fn token_saved(self: &Arc<Self>, record: &OAuthTokenRecord) {
        {
            let mut schedules = self.schedules.lock().expect("schedules poisoned");
            if let Some(entry) = schedules.get_mut(&record.server_name) {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
            }
            schedules.insert(
                record.server_name.clone(),
                ScheduleEntry::new(record.expires_at),
            );
        }
        self.schedule_at_lifetime_fraction(&record.server_name, record);
    }

    /// Drop a server's schedule (logout / removal). The schedule exists
    /// iff the token exists.
    pub fn forget(&self, server: &str) {
        let mut schedules = self.schedules.lock().expect("schedules poisoned");
        if let Some(mut entry) = schedules.remove(server) {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }

    /// Snapshot for health and the REST surface
    pub fn snapshot(&self, server: &str) -> Option<RefreshScheduleSnapshot> {
        let schedules = self.schedules.lock().expect("schedules poisoned");
        schedules.get(server).map(|entry| RefreshScheduleSnapshot {
            server: server.to_string(),
            expires_at: entry.expires_at,
            scheduled_at: entry.scheduled_at,
            retry_count: entry.retry_count,
            last_error: entry.last_error.clone(),
            state: entry.state,
        })
    }

    /// Backoff before retry number `retry_count` (1-based):
    /// 10 s, 20 s, 40 s, ... capped at the configured maximum
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let initial = self.settings.refresh_backoff_initial;
        let max = self.settings.refresh_backoff_max;
        let exp = retry_count.saturating_sub(1).min(16);
        let delay = initial.saturating_mul(2u32.saturating_pow(exp));
        delay.min(max)
    }

    /// Schedule at 80% of the token's remaining lifetime
    fn schedule_at_lifetime_fraction(self: &Arc<Self>, server: &str, record: &OAuthTokenRecord) {
        let remaining = (record.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let delay = remaining.mul_f64(0.8);
        self.schedule_in(server, record.expires_at, delay);
    }

    /// Arm the timer for a refresh in `delay`
    fn schedule_in(self: &Arc<Self>, server: &str, expires_at: DateTime<Utc>, delay: Duration) {
        let manager = self.clone();
        let server_owned = server.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.refresh_now(&server_owned).await;
        });

        let mut schedules = self.schedules.lock().expect("schedules poisoned");
        let entry = schedules
            .entry(server.to_string())
            .or_insert_with(|| ScheduleEntry::new(expires_at));
        if let Some(old) = entry.timer.take() {
            old.abort();
        }
        entry.expires_at = expires_at;
        entry.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
        if entry.state == RefreshState::Idle {
            entry.state = RefreshState::Scheduled;
        }
        entry.timer = Some(timer);

        debug!(server = %server, delay_secs = delay.as_secs(), "refresh scheduled");
    }

    /// Run one refresh attempt now, honoring the per-server rate limit
    pub async fn refresh_now(self: &Arc<Self>, server: &str) {
        // Rate limit: at least refresh_min_interval between attempts
        let wait_needed = {
            let mut schedules = self.schedules.lock().expect("schedules poisoned");
            let entry = schedules
                .entry(server.to_string())
                .or_insert_with(|| ScheduleEntry::new(Utc::now()));
            if let Some(last) = entry.last_attempt {
                let since = last.elapsed();
                if since < self.settings.refresh_min_interval {
                    Some(self.settings.refresh_min_interval - since)
                } else {
                    entry.last_attempt = Some(Instant::now());
                    None
                }
            } else {
                entry.last_attempt = Some(Instant::now());
                None
            }
        };

        if let Some(wait) = wait_needed {
            debug!(server = %server, wait_secs = wait.as_secs(), "refresh rate limited");
            tokio::time::sleep(wait).await;
            let mut schedules = self.schedules.lock().expect("schedules poisoned");
            if let Some(entry) = schedules.get_mut(server) {
                entry.last_attempt = Some(Instant::now());
            }
        }

        let started = Instant::now();
        let outcome = self.perform_refresh(server).await;

        metrics::counter!(
            METRIC_REFRESH_TOTAL,
            "server" => server.to_string(),
            "result" => outcome.result_label(),
        )
        .increment(1);
        metrics::histogram!(
            METRIC_REFRESH_DURATION,
            "server" => server.to_string(),
            "result" => outcome.result_label(),
        )
        .record(started.elapsed().as_secs_f64());

        self.apply_outcome(server, outcome);
    }

    /// Exchange the refresh token at the recorded token endpoint
    async fn perform_refresh(&self, server: &str) -> RefreshOutcome {
        let state = match self.tokens.get(server) {
            Ok(Some(state)) => state,
            Ok(None) => {
                return RefreshOutcome::Other {
                    detail: "no token on record".to_string(),
                }
            }
            Err(e) => {
                return RefreshOutcome::Other {
                    detail: format!("token store read failed: {}", e),
                }
            }
        };

        let Some(refresh_token) = state.record.refresh_token.clone() else {
            return RefreshOutcome::InvalidGrant {
                detail: "no refresh token on record".to_string(),
            };
        };
        let Some(token_endpoint) = state.record.token_endpoint.clone() else {
            return RefreshOutcome::Other {
                detail: "no token endpoint on record".to_string(),
            };
        };

        let token_url = match TokenUrl::new(token_endpoint) {
            Ok(url) => url,
            Err(e) => {
                return RefreshOutcome::Other {
                    detail: format!("invalid token endpoint: {}", e),
                }
            }
        };

        let mut client = BasicClient::new(ClientId::new(state.record.client_id.clone()))
            .set_token_uri(token_url);
        if let Some(secret) = state.record.client_secret.clone() {
            client = client.set_client_secret(ClientSecret::new(secret));
        }

        let http = match reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Ok(http) => http,
            Err(e) => {
                return RefreshOutcome::Other {
                    detail: format!("http client: {}", e),
                }
            }
        };

        match client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(&http)
            .await
        {
            Ok(response) => {
                let expires_in = response
                    .expires_in()
                    .unwrap_or(Duration::from_secs(3600));
                let new_expiry =
                    Utc::now() + chrono::Duration::from_std(expires_in).unwrap_or_else(|_| chrono::Duration::zero());

                let mut record = state.record.clone();
                record.access_token = response.access_token().secret().clone();
                if let Some(new_refresh) = response.refresh_token() {
                    record.refresh_token = Some(new_refresh.secret().clone());
                }
                record.expires_at = new_expiry;
                record.updated = Utc::now();

                if let Err(e) = self.tokens.save(&record) {
                    return RefreshOutcome::Other {
                        detail: format!("failed to persist refreshed token: {}", e),
                    };
                }

                RefreshOutcome::Success { new_expiry }
            }
            Err(oauth2::RequestTokenError::ServerResponse(response)) => {
                let detail = response.to_string();
                if detail.contains("invalid_grant") {
                    RefreshOutcome::InvalidGrant { detail }
                } else {
                    RefreshOutcome::Other { detail }
                }
            }
            Err(oauth2::RequestTokenError::Request(e)) => RefreshOutcome::Network {
                detail: e.to_string(),
            },
            Err(e) => RefreshOutcome::Other {
                detail: e.to_string(),
            },
        }
    }

    /// Fold an attempt outcome into the schedule and arm the next timer
    pub fn apply_outcome(self: &Arc<Self>, server: &str, outcome: RefreshOutcome) {
        match outcome {
            RefreshOutcome::Success { new_expiry } => {
                {
                    let mut schedules = self.schedules.lock().expect("schedules poisoned");
                    let entry = schedules
                        .entry(server.to_string())
                        .or_insert_with(|| ScheduleEntry::new(new_expiry));
                    entry.expires_at = new_expiry;
                    entry.retry_count = 0;
                    entry.last_error = None;
                    entry.state = RefreshState::Scheduled;
                }
                info!(server = %server, expires_at = %new_expiry, "token refreshed");
                self.bus.publish(ProxyEvent::TokenRefreshed {
                    server: server.to_string(),
                });
                self.bus.publish(ProxyEvent::ServersChanged);

                let remaining = (new_expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                self.schedule_in(server, new_expiry, remaining.mul_f64(0.8));
            }
            RefreshOutcome::InvalidGrant { detail } => {
                {
                    let mut schedules = self.schedules.lock().expect("schedules poisoned");
                    let entry = schedules
                        .entry(server.to_string())
                        .or_insert_with(|| ScheduleEntry::new(Utc::now()));
                    if let Some(timer) = entry.timer.take() {
                        timer.abort();
                    }
                    entry.state = RefreshState::Failed;
                    entry.last_error = Some(detail.clone());
                }
                warn!(server = %server, detail = %detail, "refresh token rejected, login required");
                self.bus.publish(ProxyEvent::OAuthRequired {
                    server: server.to_string(),
                });
                self.bus.publish(ProxyEvent::ServersChanged);
            }
            RefreshOutcome::Network { detail } | RefreshOutcome::Other { detail } => {
                let (retry_count, expires_at) = {
                    let mut schedules = self.schedules.lock().expect("schedules poisoned");
                    let entry = schedules
                        .entry(server.to_string())
                        .or_insert_with(|| ScheduleEntry::new(Utc::now()));
                    entry.retry_count += 1;
                    entry.state = RefreshState::Retrying;
                    entry.last_error = Some(detail.clone());
                    (entry.retry_count, entry.expires_at)
                };

                let delay = self.backoff_delay(retry_count);
                warn!(
                    server = %server,
                    retry = retry_count,
                    delay_secs = delay.as_secs(),
                    error = %detail,
                    "refresh failed, retrying"
                );
                self.bus.publish(ProxyEvent::ServersChanged);
                self.schedule_in(server, expires_at, delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_storage::ProxyStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn manager() -> Arc<RefreshManager> {
        let store = ProxyStore::open_temporary().unwrap();
        let tokens = TokenStore::new(store, Duration::from_secs(60));
        RefreshManager::new(tokens, EventBus::new(), OAuthSettings::default())
    }

    fn record(server: &str, expires_in_secs: i64, endpoint: Option<String>) -> OAuthTokenRecord {
        OAuthTokenRecord {
            server_name: server.to_string(),
            display_name: server.to_string(),
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            token_type: "Bearer".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
            scopes: vec![],
            client_id: "cid".into(),
            client_secret: None,
            token_endpoint: endpoint,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_backoff_sequence_matches_contract() {
        let manager = manager();
        let seconds: Vec<u64> = (1..=7).map(|n| manager.backoff_delay(n).as_secs()).collect();
        assert_eq!(seconds, vec![10, 20, 40, 80, 160, 300, 300]);
    }

    #[tokio::test]
    async fn test_network_failure_enters_retrying() {
        let manager = manager();
        manager.apply_outcome(
            "gh",
            RefreshOutcome::Network {
                detail: "connection refused".into(),
            },
        );

        let snapshot = manager.snapshot("gh").unwrap();
        assert_eq!(snapshot.state, RefreshState::Retrying);
        assert_eq!(snapshot.retry_count, 1);
        assert!(snapshot.last_error.unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_invalid_grant_is_permanent() {
        let manager = manager();
        let bus = manager.bus.clone();
        let mut sub = bus.subscribe();

        manager.apply_outcome(
            "gh",
            RefreshOutcome::InvalidGrant {
                detail: "invalid_grant".into(),
            },
        );

        let snapshot = manager.snapshot("gh").unwrap();
        assert_eq!(snapshot.state, RefreshState::Failed);

        let event = sub.recv().await.unwrap();
        assert_eq!(
            event.event,
            ProxyEvent::OAuthRequired { server: "gh".into() }
        );
    }

    #[tokio::test]
    async fn test_success_resets_retry_count() {
        let manager = manager();
        manager.apply_outcome("gh", RefreshOutcome::Network { detail: "x".into() });
        manager.apply_outcome("gh", RefreshOutcome::Network { detail: "x".into() });
        assert_eq!(manager.snapshot("gh").unwrap().retry_count, 2);

        manager.apply_outcome(
            "gh",
            RefreshOutcome::Success {
                new_expiry: Utc::now() + chrono::Duration::hours(1),
            },
        );
        let snapshot = manager.snapshot("gh").unwrap();
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.state, RefreshState::Scheduled);
    }

    #[tokio::test]
    async fn test_forget_drops_schedule() {
        let manager = manager();
        manager.apply_outcome("gh", RefreshOutcome::Network { detail: "x".into() });
        assert!(manager.snapshot("gh").is_some());
        manager.forget("gh");
        assert!(manager.snapshot("gh").is_none());
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_is_failed_at_startup() {
        let store = ProxyStore::open_temporary().unwrap();
        let tokens = TokenStore::new(store, Duration::from_secs(60));
        let mut expired = record("gh", -100, None);
        expired.refresh_token = None;
        tokens.save(&expired).unwrap();

        let manager = RefreshManager::new(tokens, EventBus::new(), OAuthSettings::default());
        manager.start();

        let snapshot = manager.snapshot("gh").unwrap();
        assert_eq!(snapshot.state, RefreshState::Failed);
    }

    /// Minimal token endpoint answering one refresh grant
    async fn fake_token_endpoint(body: &'static str, status: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/token", addr)
    }

    #[tokio::test]
    async fn test_refresh_against_fake_endpoint_succeeds() {
        let endpoint = fake_token_endpoint(
            r#"{"access_token":"new-at","token_type":"bearer","expires_in":3600,"refresh_token":"new-rt"}"#,
            "200 OK",
        )
        .await;

        let store = ProxyStore::open_temporary().unwrap();
        let tokens = TokenStore::new(store, Duration::from_secs(60));
        tokens.save(&record("gh", 30, Some(endpoint))).unwrap();

        let manager = RefreshManager::new(
            tokens.clone(),
            EventBus::new(),
            OAuthSettings::default(),
        );
        let outcome = manager.perform_refresh("gh").await;
        assert!(matches!(outcome, RefreshOutcome::Success { .. }));

        let refreshed = tokens.get("gh").unwrap().unwrap();
        assert_eq!(refreshed.record.access_token, "new-at");
        assert_eq!(refreshed.record.refresh_token.as_deref(), Some("new-rt"));
    }

    #[tokio::test]
    async fn test_invalid_grant_classification_from_endpoint() {
        let endpoint = fake_token_endpoint(
            r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#,
            "400 Bad Request",
        )
        .await;

        let store = ProxyStore::open_temporary().unwrap();
        let tokens = TokenStore::new(store, Duration::from_secs(60));
        tokens.save(&record("gh", 30, Some(endpoint))).unwrap();

        let manager = RefreshManager::new(tokens, EventBus::new(), OAuthSettings::default());
        let outcome = manager.perform_refresh("gh").await;
        assert!(matches!(outcome, RefreshOutcome::InvalidGrant { .. }));
    }
}
