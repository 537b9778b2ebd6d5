//! Context brokering: fingerprint merge, proxy validation, page preparation
//!
//! Thin layer on top of the browser pool. Translates a validated render
//! request into a lease whose page already carries the stealth script,
//! user-agent override, viewport, timezone, and header set before the first
//! navigation.

use crate::browser_pool::{AcquireOptions, BrowserPool, Lease};
use crate::error::RenderError;
use crate::stealth;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, AuthChallengeSource,
    ContinueRequestParams,
    ContinueWithAuthParams, EnableParams as FetchEnableParams, EventAuthRequired,
    EventRequestPaused, FailRequestParams, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, Headers, ResourceType, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Realistic desktop agents used when the caller does not supply one.
pub const USER_AGENT_POOL: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
];

pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1366;
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 768;
pub const DEFAULT_LOCALE: &str = "en-US";
pub const DEFAULT_TIMEZONE: &str = "America/New_York";

/// Pick one agent uniformly at random from the fixed pool.
pub fn random_user_agent() -> String {
    let mut rng = rand::thread_rng();
    USER_AGENT_POOL
        .choose(&mut rng)
        .copied()
        .unwrap_or(USER_AGENT_POOL[0])
        .to_string()
}

/// Fully-defaulted fingerprint applied to every leased page.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: String,
    pub locale: String,
    pub timezone: String,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            viewport_width: DEFAULT_VIEWPORT_WIDTH,
            viewport_height: DEFAULT_VIEWPORT_HEIGHT,
            user_agent: random_user_agent(),
            locale: DEFAULT_LOCALE.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

/// Validated upstream proxy settings with a normalized server string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Normalized `scheme://host:port` handed to the browser process.
    pub server: String,
}

impl ProxySettings {
    /// Parse and validate a caller-supplied proxy block.
    ///
    /// Accepted schemes are http, https, and socks5; a missing scheme means
    /// http. The port defaults by scheme. Credentials must be supplied
    /// both-or-neither.
    pub fn parse(
        server: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, String> {
        let server = server.trim();
        if server.is_empty() {
            return Err("proxy server must not be empty".to_string());
        }

        let with_scheme = if server.contains("://") {
            server.to_string()
        } else {
            format!("http://{server}")
        };

        let url = url::Url::parse(&with_scheme)
            .map_err(|e| format!("invalid proxy server: {e}"))?;

        let scheme = url.scheme().to_ascii_lowercase();
        if !matches!(scheme.as_str(), "http" | "https" | "socks5") {
            return Err(format!(
                "unsupported proxy protocol '{scheme}' (expected http, https, or socks5)"
            ));
        }

        let host = url
            .host_str()
            .ok_or_else(|| "proxy server must include a host".to_string())?
            .to_string();

        let port = url.port().unwrap_or(match scheme.as_str() {
            "https" => 8443,
            "socks5" => 1080,
            _ => 8080,
        });

        match (username, password) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(
                    "proxy credentials must be supplied both-or-neither".to_string(),
                );
            }
            _ => {}
        }

        let normalized = format!("{scheme}://{host}:{port}");
        Ok(Self {
            scheme,
            host,
            port,
            username: username.map(|s| s.to_string()),
            password: password.map(|s| s.to_string()),
            server: normalized,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }
}

/// Leases pool pages and decorates them for one request.
#[derive(Clone)]
pub struct ContextBroker {
    pool: Arc<BrowserPool>,
}

impl ContextBroker {
    pub fn new(pool: Arc<BrowserPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    /// Acquire a lease and prepare its page. The lease is released here on
    /// any preparation failure so the caller never sees a half-built page.
    pub async fn acquire(
        &self,
        settings: &BrowserSettings,
        proxy: Option<&ProxySettings>,
        javascript: bool,
        deadline: Duration,
    ) -> Result<Lease, RenderError> {
        let options = AcquireOptions {
            proxy: proxy.map(|p| p.server.clone()),
            deadline,
        };
        let lease = self.pool.acquire(options).await?;

        if let Err(e) = prepare_page(&lease.page, settings, proxy, javascript).await {
            lease.release().await;
            return Err(e);
        }

        Ok(lease)
    }
}

/// Apply stealth, fingerprint, headers, and script policy to a fresh page.
pub async fn prepare_page(
    page: &Page,
    settings: &BrowserSettings,
    proxy: Option<&ProxySettings>,
    javascript: bool,
) -> Result<(), RenderError> {
    // Stealth init first so it precedes every page script, iframes included
    page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
        stealth::STEALTH_INIT,
    ))
    .await?;

    let ua_override = SetUserAgentOverrideParams::builder()
        .user_agent(settings.user_agent.clone())
        .accept_language(settings.locale.clone())
        .build()
        .map_err(RenderError::BrowserError)?;
    page.execute(ua_override).await?;

    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(settings.viewport_width as i64)
        .height(settings.viewport_height as i64)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(RenderError::BrowserError)?;
    page.execute(metrics).await?;

    page.execute(SetTimezoneOverrideParams::new(settings.timezone.clone()))
        .await?;

    let mut header_map = serde_json::Map::new();
    for (name, value) in stealth::headers_for_agent(&settings.user_agent, &settings.locale) {
        header_map.insert(name, serde_json::Value::String(value));
    }
    page.execute(SetExtraHttpHeadersParams::new(Headers::new(
        serde_json::Value::Object(header_map),
    )))
    .await?;

    let proxy_credentials = proxy.and_then(|p| match (&p.username, &p.password) {
        (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
        _ => None,
    });
    install_fetch_rules(page, !javascript, proxy_credentials).await?;

    Ok(())
}

/// Install Fetch-domain rules ahead of the first navigation: abort
/// script-type sub-resources when JavaScript is off (inline `<script>`
/// blocks never hit the network and are untouched), and answer proxy auth
/// challenges with the validated credentials.
async fn install_fetch_rules(
    page: &Page,
    block_scripts: bool,
    proxy_credentials: Option<(String, String)>,
) -> Result<(), RenderError> {
    if !block_scripts && proxy_credentials.is_none() {
        return Ok(());
    }

    let mut enable = FetchEnableParams::default();
    if proxy_credentials.is_some() {
        enable.handle_auth_requests = Some(true);
    }
    if block_scripts {
        enable.patterns = Some(vec![RequestPattern {
            url_pattern: Some("*".to_string()),
            resource_type: Some(ResourceType::Script),
            request_stage: Some(RequestStage::Request),
        }]);
    }
    page.execute(enable).await?;

    // Paused requests must always be resumed or failed, or the page stalls
    let mut paused = page.event_listener::<EventRequestPaused>().await?;
    let pause_page = page.clone();
    tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let request_id = event.request_id.clone();
            if block_scripts && event.resource_type == ResourceType::Script {
                let _ = pause_page
                    .execute(FailRequestParams::new(request_id, ErrorReason::Aborted))
                    .await;
            } else {
                let _ = pause_page
                    .execute(ContinueRequestParams::new(request_id))
                    .await;
            }
        }
    });

    if let Some((username, password)) = proxy_credentials {
        let mut challenges = page.event_listener::<EventAuthRequired>().await?;
        let auth_page = page.clone();
        tokio::spawn(async move {
            while let Some(event) = challenges.next().await {
                let is_proxy_challenge = matches!(
                    event.auth_challenge.source,
                    Some(AuthChallengeSource::Proxy)
                );
                let response = if is_proxy_challenge {
                    AuthChallengeResponse {
                        response: AuthChallengeResponseResponse::ProvideCredentials,
                        username: Some(username.clone()),
                        password: Some(password.clone()),
                    }
                } else {
                    AuthChallengeResponse {
                        response: AuthChallengeResponseResponse::Default,
                        username: None,
                        password: None,
                    }
                };
                let _ = auth_page
                    .execute(ContinueWithAuthParams::new(
                        event.request_id.clone(),
                        response,
                    ))
                    .await;
            }
        });
    }

    debug!(block_scripts, "fetch rules installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_agent_comes_from_the_pool() {
        for _ in 0..20 {
            let ua = random_user_agent();
            assert!(USER_AGENT_POOL.contains(&ua.as_str()));
        }
    }

    #[test]
    fn proxy_defaults_port_by_scheme() {
        let http = ProxySettings::parse("proxy.example.com", None, None).unwrap();
        assert_eq!(http.server, "http://proxy.example.com:8080");

        let https = ProxySettings::parse("https://proxy.example.com", None, None).unwrap();
        assert_eq!(https.server, "https://proxy.example.com:8443");

        let socks = ProxySettings::parse("socks5://proxy.example.com", None, None).unwrap();
        assert_eq!(socks.server, "socks5://proxy.example.com:1080");
    }

    #[test]
    fn proxy_explicit_port_is_kept() {
        let parsed = ProxySettings::parse("http://proxy.example.com:3128", None, None).unwrap();
        assert_eq!(parsed.port, 3128);
        assert_eq!(parsed.server, "http://proxy.example.com:3128");
    }

    #[test]
    fn proxy_rejects_unknown_scheme() {
        let err = ProxySettings::parse("ftp://proxy.example.com", None, None).unwrap_err();
        assert!(err.contains("unsupported proxy protocol"));
    }

    #[test]
    fn proxy_rejects_lone_credential() {
        assert!(ProxySettings::parse("proxy.example.com", Some("user"), None).is_err());
        assert!(ProxySettings::parse("proxy.example.com", None, Some("pass")).is_err());
        let both =
            ProxySettings::parse("proxy.example.com", Some("user"), Some("pass")).unwrap();
        assert!(both.has_credentials());
    }

    #[test]
    fn proxy_rejects_empty_server() {
        assert!(ProxySettings::parse("  ", None, None).is_err());
    }
}
