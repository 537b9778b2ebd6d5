//! Render pipeline: one request end-to-end under a single deadline
//!
//! Stage order: acquire lease, navigate, stabilize, pre-extraction scripts,
//! scripted wait, scroll loop, detection sweep, extraction, debug
//! artifacts, teardown. Soft stages (scripts, waits, detection) log their
//! failures and never fail the render; hard stages map into the error
//! taxonomy. The lease is released on every exit path, with the lease's
//! drop guard as the backstop when the outer deadline cancels mid-stage.

use crate::api::{
    now_rfc3339, ApiError, RenderContent, RenderMeta, RenderRequest, RenderResponse, WaitUntil,
};
use crate::browser_pool::Lease;
use crate::config::Config;
use crate::context::ContextBroker;
use crate::detection::{self, BlockVerdict, CaptchaVerdict, PageSnapshot};
use crate::error::RenderError;
use crate::metrics::RenderMetrics;
use crate::scroll;
use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Teardown headroom on top of the caller's render timeout.
pub const OUTER_DEADLINE_MARGIN: Duration = Duration::from_secs(30);
/// Hard cap on lease acquisition, slightly above the queue deadline.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(35);
/// Wrapper buffer around the navigation stage.
const NAVIGATION_MARGIN: Duration = Duration::from_secs(5);

const STABILIZE_POLL: Duration = Duration::from_millis(200);
const STABILIZE_CAP: Duration = Duration::from_secs(3);
const STABLE_SAMPLES: u32 = 2;
const SCRIPT_GAP: Duration = Duration::from_millis(100);
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Scripted-wait target parsed from the `wait_for` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitTarget {
    Css(String),
    Js(String),
}

/// Dispatch by prefix: `css:`, `js:`, or bare CSS selector.
pub fn parse_wait_for(raw: &str) -> WaitTarget {
    if let Some(rest) = raw.strip_prefix("css:") {
        WaitTarget::Css(rest.trim().to_string())
    } else if let Some(rest) = raw.strip_prefix("js:") {
        WaitTarget::Js(rest.trim().to_string())
    } else {
        WaitTarget::Css(raw.trim().to_string())
    }
}

struct Artifacts {
    html: String,
    title: Option<String>,
    final_url: String,
    status: u16,
    captcha: CaptchaVerdict,
    block: BlockVerdict,
    screenshot: Option<String>,
    notes: Vec<String>,
}

pub struct RenderPipeline {
    broker: ContextBroker,
    config: Config,
    metrics: Arc<RenderMetrics>,
}

impl RenderPipeline {
    pub fn new(broker: ContextBroker, config: Config, metrics: Arc<RenderMetrics>) -> Self {
        Self {
            broker,
            config,
            metrics,
        }
    }

    /// Execute one validated request under the outer wall-clock deadline.
    pub async fn execute(&self, request: RenderRequest) -> RenderResponse {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let outer_deadline = request.timeout + OUTER_DEADLINE_MARGIN;

        info!(
            %request_id,
            url = %request.url,
            wait_until = ?request.wait_until,
            timeout_ms = request.timeout.as_millis() as u64,
            "render started"
        );

        let response = match timeout(outer_deadline, self.run(&request, &request_id, started)).await
        {
            Ok(response) => response,
            Err(_) => {
                warn!(%request_id, "render exceeded outer deadline");
                self.failure(&request_id, &RenderError::TotalTimeout(outer_deadline))
            }
        };

        self.metrics
            .record_render(started.elapsed(), response.success);
        info!(
            %request_id,
            success = response.success,
            total_ms = started.elapsed().as_millis() as u64,
            "render finished"
        );
        response
    }

    async fn run(&self, request: &RenderRequest, request_id: &str, started: Instant) -> RenderResponse {
        let acquire = self.broker.acquire(
            &request.settings,
            request.proxy.as_ref(),
            request.javascript,
            self.config.acquire_queue_timeout,
        );
        let lease = match timeout(ACQUIRE_TIMEOUT, acquire).await {
            Ok(Ok(lease)) => lease,
            Ok(Err(e)) => return self.failure(request_id, &e),
            Err(_) => return self.failure(request_id, &RenderError::AcquireTimeout),
        };

        let outcome = self.drive(&lease, request).await;
        lease.release().await;

        match outcome {
            Ok(artifacts) => self.assemble(request, request_id, started, artifacts),
            Err(e) => {
                warn!(%request_id, error = %e, "render failed");
                self.failure(request_id, &e)
            }
        }
    }

    async fn drive(&self, lease: &Lease, request: &RenderRequest) -> Result<Artifacts, RenderError> {
        let page = &lease.page;

        // Capture the main document's HTTP status from the network stream;
        // absent a response event the status is assumed 200.
        let status_slot: Arc<std::sync::Mutex<Option<u16>>> = Arc::new(std::sync::Mutex::new(None));
        if let Ok(mut events) = page.event_listener::<EventResponseReceived>().await {
            let slot = status_slot.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if event.r#type == ResourceType::Document {
                        if let Ok(mut guard) = slot.lock() {
                            *guard = Some(event.response.status as u16);
                        }
                        break;
                    }
                }
            });
        }

        let nav_budget = request.timeout + NAVIGATION_MARGIN;
        match timeout(nav_budget, self.navigate(page, request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RenderError::Timeout(nav_budget)),
        }

        if request.wait_until == WaitUntil::NetworkIdle {
            self.stabilize(page).await;
        }

        self.run_scripts(page, &request.js_code).await;

        if let Some(raw) = &request.wait_for {
            let target = parse_wait_for(raw);
            if !self.wait_for_target(page, &target, request.timeout).await {
                warn!(wait_for = %raw, "scripted wait did not complete");
            }
        }

        if request.scroll.enabled {
            let summary = scroll::run(page, &request.scroll).await;
            debug!(steps = summary.steps, "scroll engine done");
        }

        let html = page.content().await.unwrap_or_default();
        let text = page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .ok()
            .and_then(|v| v.into_value::<String>().ok())
            .unwrap_or_default();
        let selector_hits: Vec<String> = page
            .evaluate(detection::selector_probe_script())
            .await
            .ok()
            .and_then(|v| v.into_value::<String>().ok())
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let status = status_slot.lock().ok().and_then(|g| *g).unwrap_or(200);

        let snapshot = PageSnapshot {
            html,
            text,
            status,
            selector_hits,
        };
        let (captcha, block) = tokio::join!(
            async { detection::detect_captcha(&snapshot) },
            async { detection::detect_block(&snapshot) },
        );
        if captcha.detected {
            self.metrics.record_captcha();
        }
        if block.blocked {
            self.metrics.record_block();
        }

        let title = page.get_title().await.ok().flatten().filter(|t| !t.is_empty());
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| request.url.to_string());

        let mut notes = Vec::new();
        let screenshot = if request.screenshot {
            self.capture_screenshot(page).await
        } else {
            None
        };
        if request.har {
            notes.push("HAR capture is not supported".to_string());
        }

        Ok(Artifacts {
            html: snapshot.html,
            title,
            final_url,
            status,
            captcha,
            block,
            screenshot,
            notes,
        })
    }

    async fn navigate(&self, page: &Page, request: &RenderRequest) -> Result<(), RenderError> {
        page.goto(request.url.as_str())
            .await
            .map_err(|e| classify_navigation_error(e.to_string(), request.timeout))?;

        match request.wait_until {
            WaitUntil::Commit => {}
            WaitUntil::DomContentLoaded => {
                self.wait_ready_state(page, &["interactive", "complete"], request.timeout)
                    .await;
            }
            WaitUntil::Load | WaitUntil::NetworkIdle => {
                let _ = page.wait_for_navigation().await;
                self.wait_ready_state(page, &["complete"], request.timeout)
                    .await;
            }
        }
        Ok(())
    }

    /// Poll `document.readyState` until it reaches one of the accepted
    /// states. Lenient: an exhausted budget falls through to the next stage.
    async fn wait_ready_state(&self, page: &Page, accepted: &[&str], budget: Duration) {
        let deadline = Instant::now() + budget;
        loop {
            let state = page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|v| v.into_value::<String>().ok())
                .unwrap_or_default();
            if accepted.contains(&state.as_str()) {
                return;
            }
            if Instant::now() >= deadline {
                return;
            }
            sleep(WAIT_POLL).await;
        }
    }

    /// Poll the document body length until two consecutive samples agree.
    async fn stabilize(&self, page: &Page) {
        let deadline = Instant::now() + STABILIZE_CAP;
        let mut last: Option<u64> = None;
        let mut unchanged = 0;
        while Instant::now() < deadline {
            let length = page
                .evaluate("document.body ? document.body.innerHTML.length : 0")
                .await
                .ok()
                .and_then(|v| v.into_value::<u64>().ok())
                .unwrap_or(0);
            if Some(length) == last {
                unchanged += 1;
                if unchanged >= STABLE_SAMPLES {
                    return;
                }
            } else {
                unchanged = 0;
            }
            last = Some(length);
            sleep(STABILIZE_POLL).await;
        }
    }

    /// Run pre-extraction scripts sequentially. A failing script
    /// short-circuits the remainder but never fails the render.
    async fn run_scripts(&self, page: &Page, scripts: &[String]) {
        for (idx, script) in scripts.iter().enumerate() {
            match page.evaluate(script.clone()).await {
                Ok(value) => {
                    debug!(idx, result = ?value.value(), "pre-extraction script ran");
                }
                Err(e) => {
                    warn!(idx, error = %e, "pre-extraction script failed, skipping rest");
                    break;
                }
            }
            sleep(SCRIPT_GAP).await;
        }
    }

    async fn wait_for_target(&self, page: &Page, target: &WaitTarget, budget: Duration) -> bool {
        let expr = match target {
            WaitTarget::Css(selector) => {
                let quoted =
                    serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
                format!("!!document.querySelector({quoted})")
            }
            WaitTarget::Js(body) => format!("!!({body})"),
        };

        let deadline = Instant::now() + budget;
        loop {
            let hit = page
                .evaluate(expr.clone())
                .await
                .ok()
                .and_then(|v| v.into_value::<bool>().ok())
                .unwrap_or(false);
            if hit {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(WAIT_POLL).await;
        }
    }

    async fn capture_screenshot(&self, page: &Page) -> Option<String> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        match page.screenshot(params).await {
            Ok(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            Err(e) => {
                warn!(error = %e, "screenshot capture failed");
                None
            }
        }
    }

    fn assemble(
        &self,
        request: &RenderRequest,
        request_id: &str,
        started: Instant,
        artifacts: Artifacts,
    ) -> RenderResponse {
        let captcha_detected = artifacts.captcha.detected;
        let blocked = artifacts.block.blocked;
        RenderResponse {
            success: true,
            request_id: request_id.to_string(),
            url: Some(artifacts.final_url),
            content: Some(RenderContent {
                html: artifacts.html,
                screenshot: artifacts.screenshot,
                har: None,
                notes: artifacts.notes,
            }),
            meta: Some(RenderMeta {
                http_status: artifacts.status,
                total_ms: started.elapsed().as_millis() as u64,
                captcha_detected,
                captcha: captcha_detected.then_some(artifacts.captcha),
                blocked,
                block: blocked.then_some(artifacts.block),
                proxy_used: request.proxy.is_some(),
                title: artifacts.title,
            }),
            errors: None,
            timestamp: now_rfc3339(),
        }
    }

    fn failure(&self, request_id: &str, error: &RenderError) -> RenderResponse {
        RenderResponse::failure(
            request_id,
            vec![ApiError::new(error.code(), error.to_string())
                .with_dev_details(format!("{error:?}"))],
        )
    }
}

fn classify_navigation_error(message: String, nav_timeout: Duration) -> RenderError {
    let lower = message.to_lowercase();
    if lower.contains("proxy") || lower.contains("err_tunnel") {
        RenderError::ProxyError(message)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        RenderError::Timeout(nav_timeout)
    } else {
        RenderError::NavigationFailed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_dispatches_by_prefix() {
        assert_eq!(
            parse_wait_for("css: .article"),
            WaitTarget::Css(".article".to_string())
        );
        assert_eq!(
            parse_wait_for("js: window.__ready === true"),
            WaitTarget::Js("window.__ready === true".to_string())
        );
        assert_eq!(
            parse_wait_for("#content"),
            WaitTarget::Css("#content".to_string())
        );
    }

    #[test]
    fn navigation_errors_classify_into_taxonomy() {
        let timeout = Duration::from_secs(30);
        assert!(matches!(
            classify_navigation_error("net::ERR_PROXY_CONNECTION_FAILED".into(), timeout),
            RenderError::ProxyError(_)
        ));
        assert!(matches!(
            classify_navigation_error("Navigation timed out".into(), timeout),
            RenderError::Timeout(_)
        ));
        assert!(matches!(
            classify_navigation_error("net::ERR_NAME_NOT_RESOLVED".into(), timeout),
            RenderError::NavigationFailed(_)
        ));
    }
}
