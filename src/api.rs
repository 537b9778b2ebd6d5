//! Wire schema for `/v1/render` and the request validator
//!
//! The raw body is deserialized leniently (every field optional or
//! defaulted), then validated field by field into a fully-defaulted
//! [`RenderRequest`]. Validation failures carry the offending field so the
//! client can fix its payload.

use crate::context::{BrowserSettings, ProxySettings, random_user_agent};
use crate::detection::{BlockVerdict, CaptchaVerdict};
use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MIN_SCROLLS: u32 = 1;
pub const MAX_SCROLLS: u32 = 50;
pub const DEFAULT_SCROLLS: u32 = 5;
pub const MIN_SCROLL_DELAY_MS: u64 = 100;
pub const MAX_SCROLL_DELAY_MS: u64 = 5_000;
pub const DEFAULT_SCROLL_DELAY_MS: u64 = 500;
pub const MIN_VIEWPORT_WIDTH: u32 = 320;
pub const MAX_VIEWPORT_WIDTH: u32 = 3_840;
pub const MIN_VIEWPORT_HEIGHT: u32 = 240;
pub const MAX_VIEWPORT_HEIGHT: u32 = 2_160;

/// Navigation completion criterion, mapped onto the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    Commit,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    Load,
    #[serde(rename = "networkidle")]
    NetworkIdle,
}

impl Default for WaitUntil {
    fn default() -> Self {
        Self::NetworkIdle
    }
}

/// Raw request body as received on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenderRequestBody {
    pub url: Option<String>,
    #[serde(default)]
    pub render: RenderSection,
    #[serde(default)]
    pub browser: BrowserSection,
    #[serde(default)]
    pub proxy: Option<ProxySection>,
    #[serde(default)]
    pub debug: DebugSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderSection {
    pub wait_until: WaitUntil,
    pub timeout_ms: u64,
    pub javascript: bool,
    pub scroll: ScrollSection,
    pub wait_for: Option<String>,
    pub js_code: Option<JsCode>,
}

impl Default for RenderSection {
    fn default() -> Self {
        Self {
            wait_until: WaitUntil::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            javascript: true,
            scroll: ScrollSection::default(),
            wait_for: None,
            js_code: None,
        }
    }
}

/// `render.js_code` accepts a single script or a list of scripts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JsCode {
    One(String),
    Many(Vec<String>),
}

impl JsCode {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            JsCode::One(script) => vec![script],
            JsCode::Many(scripts) => scripts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrollSection {
    pub enabled: bool,
    pub max_scrolls: u32,
    pub delay_ms: u64,
}

impl Default for ScrollSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_scrolls: DEFAULT_SCROLLS,
            delay_ms: DEFAULT_SCROLL_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub viewport: ViewportSection,
    pub user_agent: Option<String>,
    pub locale: String,
    pub timezone: String,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            viewport: ViewportSection::default(),
            user_agent: None,
            locale: crate::context::DEFAULT_LOCALE.to_string(),
            timezone: crate::context::DEFAULT_TIMEZONE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewportSection {
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportSection {
    fn default() -> Self {
        Self {
            width: crate::context::DEFAULT_VIEWPORT_WIDTH,
            height: crate::context::DEFAULT_VIEWPORT_HEIGHT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default)]
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub rotate: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DebugSection {
    pub screenshot: bool,
    pub har: bool,
}

/// Per-request scroll behavior after validation.
#[derive(Debug, Clone, Copy)]
pub struct ScrollConfig {
    pub enabled: bool,
    pub max_scrolls: u32,
    pub delay: Duration,
}

/// A validated, fully-defaulted description of one render job.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: Url,
    pub wait_until: WaitUntil,
    pub timeout: Duration,
    pub javascript: bool,
    pub scroll: ScrollConfig,
    pub wait_for: Option<String>,
    pub js_code: Vec<String>,
    pub settings: BrowserSettings,
    pub proxy: Option<ProxySettings>,
    pub screenshot: bool,
    pub har: bool,
}

/// One field-level validation failure.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Validate a raw body into a render request, collecting every field error.
pub fn validate(body: RenderRequestBody) -> Result<RenderRequest, Vec<FieldError>> {
    let mut errors = Vec::new();

    let url = match body.url.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push(FieldError::new("url", "url is required"));
            None
        }
        Some(raw) => match Url::parse(raw) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Some(parsed),
            Ok(parsed) => {
                errors.push(FieldError::new(
                    "url",
                    format!("unsupported scheme '{}'", parsed.scheme()),
                ));
                None
            }
            Err(e) => {
                errors.push(FieldError::new("url", format!("invalid url: {e}")));
                None
            }
        },
    };

    let render = body.render;
    if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&render.timeout_ms) {
        errors.push(FieldError::new(
            "render.timeout_ms",
            format!("must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS}"),
        ));
    }
    if !(MIN_SCROLLS..=MAX_SCROLLS).contains(&render.scroll.max_scrolls) {
        errors.push(FieldError::new(
            "render.scroll.max_scrolls",
            format!("must be between {MIN_SCROLLS} and {MAX_SCROLLS}"),
        ));
    }
    if !(MIN_SCROLL_DELAY_MS..=MAX_SCROLL_DELAY_MS).contains(&render.scroll.delay_ms) {
        errors.push(FieldError::new(
            "render.scroll.delay_ms",
            format!("must be between {MIN_SCROLL_DELAY_MS} and {MAX_SCROLL_DELAY_MS}"),
        ));
    }

    let viewport = &body.browser.viewport;
    if !(MIN_VIEWPORT_WIDTH..=MAX_VIEWPORT_WIDTH).contains(&viewport.width) {
        errors.push(FieldError::new(
            "browser.viewport.width",
            format!("must be between {MIN_VIEWPORT_WIDTH} and {MAX_VIEWPORT_WIDTH}"),
        ));
    }
    if !(MIN_VIEWPORT_HEIGHT..=MAX_VIEWPORT_HEIGHT).contains(&viewport.height) {
        errors.push(FieldError::new(
            "browser.viewport.height",
            format!("must be between {MIN_VIEWPORT_HEIGHT} and {MAX_VIEWPORT_HEIGHT}"),
        ));
    }

    let proxy = match &body.proxy {
        Some(section) => match ProxySettings::parse(
            &section.server,
            section.username.as_deref(),
            section.password.as_deref(),
        ) {
            Ok(parsed) => Some(parsed),
            Err(message) => {
                errors.push(FieldError::new("proxy.server", message));
                None
            }
        },
        None => None,
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    let settings = BrowserSettings {
        viewport_width: viewport.width,
        viewport_height: viewport.height,
        user_agent: body
            .browser
            .user_agent
            .clone()
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or_else(random_user_agent),
        locale: body.browser.locale.clone(),
        timezone: body.browser.timezone.clone(),
    };

    Ok(RenderRequest {
        url: url.expect("url validated above"),
        wait_until: render.wait_until,
        timeout: Duration::from_millis(render.timeout_ms),
        javascript: render.javascript,
        scroll: ScrollConfig {
            enabled: render.scroll.enabled,
            max_scrolls: render.scroll.max_scrolls,
            delay: Duration::from_millis(render.scroll.delay_ms),
        },
        wait_for: render.wait_for.filter(|w| !w.trim().is_empty()),
        js_code: render.js_code.map(JsCode::into_vec).unwrap_or_default(),
        settings,
        proxy,
        screenshot: body.debug.screenshot,
        har: body.debug.har,
    })
}

/// One machine-readable error in the response `errors` array.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            details: None,
        }
    }

    /// Attach raw diagnostic detail, carried only outside release builds.
    pub fn with_dev_details(mut self, details: impl Into<String>) -> Self {
        if cfg!(debug_assertions) {
            self.details = Some(details.into());
        }
        self
    }

    pub fn from_field(err: FieldError) -> Self {
        Self {
            code: ErrorCode::ValidationError,
            message: err.message,
            field: Some(err.field),
            details: None,
        }
    }
}

/// Stage-produced render artifact returned to the client.
#[derive(Debug, Clone, Serialize)]
pub struct RenderResponse {
    pub success: bool,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<RenderContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<RenderMeta>,
    pub errors: Option<Vec<ApiError>>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderContent {
    pub html: String,
    /// Base64-encoded full-page PNG when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// HAR capture is not wired up; always null.
    pub har: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderMeta {
    pub http_status: u16,
    pub total_ms: u64,
    pub captcha_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha: Option<CaptchaVerdict>,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockVerdict>,
    pub proxy_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl RenderResponse {
    pub fn failure(request_id: impl Into<String>, errors: Vec<ApiError>) -> Self {
        Self {
            success: false,
            request_id: request_id.into(),
            url: None,
            content: None,
            meta: None,
            errors: Some(errors),
            timestamp: now_rfc3339(),
        }
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_from_json(json: serde_json::Value) -> RenderRequestBody {
        serde_json::from_value(json).expect("body parses")
    }

    #[test]
    fn minimal_valid_request_gets_defaults() {
        let body = body_from_json(serde_json::json!({ "url": "https://example.com" }));
        let request = validate(body).expect("valid");

        assert_eq!(request.url.as_str(), "https://example.com/");
        assert_eq!(request.wait_until, WaitUntil::NetworkIdle);
        assert_eq!(request.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
        assert!(request.javascript);
        assert!(!request.scroll.enabled);
        assert_eq!(request.scroll.max_scrolls, DEFAULT_SCROLLS);
        assert_eq!(request.settings.viewport_width, 1366);
        assert_eq!(request.settings.locale, "en-US");
        assert!(!request.settings.user_agent.is_empty());
        assert!(request.proxy.is_none());
        assert!(!request.screenshot);
    }

    #[test]
    fn missing_url_is_a_field_error() {
        let errors = validate(RenderRequestBody::default()).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "url"));
    }

    #[test]
    fn invalid_url_is_a_field_error() {
        let body = body_from_json(serde_json::json!({ "url": "not-a-valid-url" }));
        let errors = validate(body).unwrap_err();
        assert_eq!(errors[0].field, "url");
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        let body = body_from_json(serde_json::json!({ "url": "ftp://example.com" }));
        let errors = validate(body).unwrap_err();
        assert!(errors[0].message.contains("unsupported scheme"));
    }

    #[test]
    fn out_of_range_fields_are_each_reported() {
        let body = body_from_json(serde_json::json!({
            "url": "https://example.com",
            "render": {
                "timeout_ms": 500,
                "scroll": { "enabled": true, "max_scrolls": 100, "delay_ms": 50 }
            },
            "browser": { "viewport": { "width": 10, "height": 10000 } }
        }));
        let errors = validate(body).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"render.timeout_ms"));
        assert!(fields.contains(&"render.scroll.max_scrolls"));
        assert!(fields.contains(&"render.scroll.delay_ms"));
        assert!(fields.contains(&"browser.viewport.width"));
        assert!(fields.contains(&"browser.viewport.height"));
    }

    #[test]
    fn js_code_accepts_string_or_list() {
        let one = body_from_json(serde_json::json!({
            "url": "https://example.com",
            "render": { "js_code": "document.title" }
        }));
        assert_eq!(validate(one).unwrap().js_code, vec!["document.title"]);

        let many = body_from_json(serde_json::json!({
            "url": "https://example.com",
            "render": { "js_code": ["a()", "b()"] }
        }));
        assert_eq!(validate(many).unwrap().js_code, vec!["a()", "b()"]);
    }

    #[test]
    fn wait_until_parses_all_modes() {
        for (raw, expected) in [
            ("commit", WaitUntil::Commit),
            ("domcontentloaded", WaitUntil::DomContentLoaded),
            ("load", WaitUntil::Load),
            ("networkidle", WaitUntil::NetworkIdle),
        ] {
            let body = body_from_json(serde_json::json!({
                "url": "https://example.com",
                "render": { "wait_until": raw }
            }));
            assert_eq!(validate(body).unwrap().wait_until, expected);
        }
    }

    #[test]
    fn proxy_errors_surface_on_the_proxy_field() {
        let body = body_from_json(serde_json::json!({
            "url": "https://example.com",
            "proxy": { "server": "ftp://bad", "username": "u" }
        }));
        let errors = validate(body).unwrap_err();
        assert_eq!(errors[0].field, "proxy.server");
    }

    #[test]
    fn custom_user_agent_is_kept() {
        let body = body_from_json(serde_json::json!({
            "url": "https://example.com",
            "browser": { "user_agent": "my-agent/1.0" }
        }));
        assert_eq!(validate(body).unwrap().settings.user_agent, "my-agent/1.0");
    }
}
