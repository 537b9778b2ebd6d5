//! Page classification: CAPTCHA walls and WAF block pages
//!
//! Two independent classifiers share a single page snapshot (HTML, visible
//! text, final HTTP status, selector probe hits). Both only read the
//! snapshot; a failure in one never affects the other and never fails the
//! render.

use serde::Serialize;

/// Read-only snapshot the classifiers operate on.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub html: String,
    pub text: String,
    pub status: u16,
    /// CSS selectors from the probe script that matched on the live page.
    pub selector_hits: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptchaVerdict {
    pub detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl CaptchaVerdict {
    fn none() -> Self {
        Self {
            detected: false,
            kind: None,
            confidence: Confidence::Low,
            selector: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RateLimited,
    AccessDenied,
    BotChallenge,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockVerdict {
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BlockReason>,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl BlockVerdict {
    fn none() -> Self {
        Self {
            blocked: false,
            provider: None,
            reason: None,
            confidence: Confidence::Low,
            details: None,
        }
    }
}

struct CaptchaProvider {
    name: &'static str,
    selectors: &'static [&'static str],
    phrases: &'static [&'static str],
}

const CAPTCHA_PROVIDERS: &[CaptchaProvider] = &[
    CaptchaProvider {
        name: "recaptcha",
        selectors: &[
            ".g-recaptcha",
            "#g-recaptcha",
            "iframe[src*='recaptcha']",
            "iframe[title='reCAPTCHA']",
        ],
        phrases: &["g-recaptcha", "recaptcha/api.js", "grecaptcha"],
    },
    CaptchaProvider {
        name: "hcaptcha",
        selectors: &[".h-captcha", "iframe[src*='hcaptcha']"],
        phrases: &["h-captcha", "hcaptcha.com"],
    },
    CaptchaProvider {
        name: "turnstile",
        selectors: &[".cf-turnstile", "iframe[src*='challenges.cloudflare.com']"],
        phrases: &["cf-turnstile", "challenges.cloudflare.com/turnstile"],
    },
    CaptchaProvider {
        name: "arkose",
        selectors: &["#arkose-iframe", "iframe[src*='arkoselabs']"],
        phrases: &["arkoselabs.com", "funcaptcha"],
    },
];

const GENERIC_CAPTCHA_PHRASES: &[&str] = &[
    "captcha",
    "prove you're human",
    "prove you are human",
    "verify you are human",
    "security check to access",
    "are you a robot",
];

struct WafProvider {
    name: &'static str,
    statuses: &'static [u16],
    phrases: &'static [&'static str],
}

const WAF_PROVIDERS: &[WafProvider] = &[
    WafProvider {
        name: "cloudflare",
        statuses: &[403, 429, 503],
        phrases: &[
            "cloudflare",
            "cf-ray",
            "attention required!",
            "checking your browser before accessing",
        ],
    },
    WafProvider {
        name: "akamai",
        statuses: &[403],
        phrases: &["akamai", "reference #1", "you don't have permission to access"],
    },
    WafProvider {
        name: "datadome",
        statuses: &[403],
        phrases: &["datadome", "geo.captcha-delivery.com"],
    },
    WafProvider {
        name: "perimeterx",
        statuses: &[403],
        phrases: &["perimeterx", "px-captcha", "_pxhd"],
    },
    WafProvider {
        name: "imperva",
        statuses: &[403],
        phrases: &["imperva", "incapsula", "request unsuccessful"],
    },
];

const GENERIC_BLOCK_PHRASES: &[&str] = &[
    "access denied",
    "access to this page has been denied",
    "you have been blocked",
    "too many requests",
    "rate limited",
    "unusual traffic",
    "automated requests",
    "pardon our interruption",
];

const SHORT_TEXT_LIMIT: usize = 5_000;
const MINIMAL_TEXT_LIMIT: usize = 100;
const MANY_SCRIPTS_THRESHOLD: usize = 5;

/// JavaScript expression evaluated on the live page to probe every known
/// CAPTCHA selector in one round trip. Returns a JSON array of matches.
pub fn selector_probe_script() -> String {
    let selectors: Vec<&str> = CAPTCHA_PROVIDERS
        .iter()
        .flat_map(|p| p.selectors.iter().copied())
        .collect();
    let list = serde_json::to_string(&selectors).unwrap_or_else(|_| "[]".to_string());
    format!(
        "JSON.stringify({list}.filter(s => {{ try {{ return !!document.querySelector(s); }} catch (e) {{ return false; }} }}))"
    )
}

/// Classify the snapshot for CAPTCHA walls.
///
/// Selector hits win (high confidence), then per-provider phrases in the
/// HTML or visible text (medium), then generic wording (low).
pub fn detect_captcha(snapshot: &PageSnapshot) -> CaptchaVerdict {
    for provider in CAPTCHA_PROVIDERS {
        if let Some(hit) = provider
            .selectors
            .iter()
            .find(|sel| snapshot.selector_hits.iter().any(|h| h == *sel))
        {
            return CaptchaVerdict {
                detected: true,
                kind: Some(provider.name),
                confidence: Confidence::High,
                selector: Some((*hit).to_string()),
            };
        }
    }

    let html = snapshot.html.to_lowercase();
    let text = snapshot.text.to_lowercase();

    for provider in CAPTCHA_PROVIDERS {
        if provider
            .phrases
            .iter()
            .any(|p| html.contains(p) || text.contains(p))
        {
            return CaptchaVerdict {
                detected: true,
                kind: Some(provider.name),
                confidence: Confidence::Medium,
                selector: None,
            };
        }
    }

    if GENERIC_CAPTCHA_PHRASES.iter().any(|p| text.contains(p)) {
        return CaptchaVerdict {
            detected: true,
            kind: None,
            confidence: Confidence::Low,
            selector: None,
        };
    }

    CaptchaVerdict::none()
}

/// Classify the snapshot for WAF block and challenge pages.
pub fn detect_block(snapshot: &PageSnapshot) -> BlockVerdict {
    let html = snapshot.html.to_lowercase();
    let text = snapshot.text.to_lowercase();
    let status = snapshot.status;

    let block_reason = if status == 429 {
        BlockReason::RateLimited
    } else {
        BlockReason::AccessDenied
    };

    if matches!(status, 403 | 429 | 503) {
        for provider in WAF_PROVIDERS {
            if provider.statuses.contains(&status)
                && provider
                    .phrases
                    .iter()
                    .any(|p| html.contains(p) || text.contains(p))
            {
                return BlockVerdict {
                    blocked: true,
                    provider: Some(provider.name),
                    reason: Some(block_reason),
                    confidence: Confidence::High,
                    details: Some(format!("{} block page (status {status})", provider.name)),
                };
            }
        }

        // Blocking status without a recognizable provider page
        return BlockVerdict {
            blocked: true,
            provider: None,
            reason: Some(block_reason),
            confidence: Confidence::Medium,
            details: Some(format!("blocking status {status} from unknown provider")),
        };
    }

    if status == 200 {
        for provider in WAF_PROVIDERS {
            if provider
                .phrases
                .iter()
                .any(|p| html.contains(p) || text.contains(p))
            {
                // Soft challenge served with a 200
                return BlockVerdict {
                    blocked: true,
                    provider: Some(provider.name),
                    reason: Some(BlockReason::BotChallenge),
                    confidence: Confidence::Medium,
                    details: Some(format!("{} challenge page with status 200", provider.name)),
                };
            }
        }
    }

    if text.len() < SHORT_TEXT_LIMIT && GENERIC_BLOCK_PHRASES.iter().any(|p| text.contains(p)) {
        return BlockVerdict {
            blocked: true,
            provider: None,
            reason: Some(BlockReason::AccessDenied),
            confidence: Confidence::Low,
            details: Some("generic block wording on short page".to_string()),
        };
    }

    if status == 200
        && text.trim().len() < MINIMAL_TEXT_LIMIT
        && script_tag_count(&html) > MANY_SCRIPTS_THRESHOLD
    {
        return BlockVerdict {
            blocked: true,
            provider: None,
            reason: Some(BlockReason::BotChallenge),
            confidence: Confidence::Low,
            details: Some("minimal content but many scripts".to_string()),
        };
    }

    BlockVerdict::none()
}

fn script_tag_count(html: &str) -> usize {
    html.matches("<script").count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(html: &str, text: &str, status: u16) -> PageSnapshot {
        PageSnapshot {
            html: html.to_string(),
            text: text.to_string(),
            status,
            selector_hits: Vec::new(),
        }
    }

    #[test]
    fn selector_hit_is_high_confidence() {
        let mut snap = snapshot("<html></html>", "", 200);
        snap.selector_hits = vec![".g-recaptcha".to_string()];

        let verdict = detect_captcha(&snap);
        assert!(verdict.detected);
        assert_eq!(verdict.kind, Some("recaptcha"));
        assert_eq!(verdict.confidence, Confidence::High);
        assert_eq!(verdict.selector.as_deref(), Some(".g-recaptcha"));
    }

    #[test]
    fn provider_phrase_is_medium_confidence() {
        let snap = snapshot(
            "<html><script src='https://js.hcaptcha.com/1/api.js'></script></html>",
            "",
            200,
        );
        let verdict = detect_captcha(&snap);
        assert!(verdict.detected);
        assert_eq!(verdict.kind, Some("hcaptcha"));
        assert_eq!(verdict.confidence, Confidence::Medium);
    }

    #[test]
    fn generic_phrase_is_low_confidence() {
        let snap = snapshot("<html><body>...</body></html>", "Prove you're human to continue", 200);
        let verdict = detect_captcha(&snap);
        assert!(verdict.detected);
        assert!(verdict.kind.is_none());
        assert_eq!(verdict.confidence, Confidence::Low);
    }

    #[test]
    fn clean_page_detects_nothing() {
        let snap = snapshot(
            "<html><body><h1>Example Domain</h1></body></html>",
            "Example Domain. This domain is for use in illustrative examples in documents.",
            200,
        );
        assert!(!detect_captcha(&snap).detected);
        assert!(!detect_block(&snap).blocked);
    }

    #[test]
    fn cloudflare_403_is_high_confidence_access_denied() {
        let snap = snapshot(
            "<html><title>Attention Required! | Cloudflare</title></html>",
            "Sorry, you have been blocked",
            403,
        );
        let verdict = detect_block(&snap);
        assert!(verdict.blocked);
        assert_eq!(verdict.provider, Some("cloudflare"));
        assert_eq!(verdict.reason, Some(BlockReason::AccessDenied));
        assert_eq!(verdict.confidence, Confidence::High);
    }

    #[test]
    fn status_429_maps_to_rate_limited() {
        let snap = snapshot(
            "<html>cf-ray: 1234</html>",
            "Too many requests",
            429,
        );
        let verdict = detect_block(&snap);
        assert!(verdict.blocked);
        assert_eq!(verdict.reason, Some(BlockReason::RateLimited));
    }

    #[test]
    fn blocking_status_without_provider_is_medium_unknown() {
        let snap = snapshot("<html>nope</html>", "nope", 403);
        let verdict = detect_block(&snap);
        assert!(verdict.blocked);
        assert!(verdict.provider.is_none());
        assert_eq!(verdict.confidence, Confidence::Medium);
    }

    #[test]
    fn soft_challenge_on_200_is_bot_challenge() {
        let snap = snapshot(
            "<html>checking your browser before accessing example.com</html>",
            "Checking your browser before accessing",
            200,
        );
        let verdict = detect_block(&snap);
        assert!(verdict.blocked);
        assert_eq!(verdict.reason, Some(BlockReason::BotChallenge));
        assert_eq!(verdict.confidence, Confidence::Medium);
    }

    #[test]
    fn minimal_content_with_many_scripts_is_flagged() {
        let html = format!("<html>{}</html>", "<script>x()</script>".repeat(8));
        let snap = snapshot(&html, "loading", 200);
        let verdict = detect_block(&snap);
        assert!(verdict.blocked);
        assert_eq!(verdict.reason, Some(BlockReason::BotChallenge));
        assert_eq!(verdict.confidence, Confidence::Low);
        assert_eq!(
            verdict.details.as_deref(),
            Some("minimal content but many scripts")
        );
    }

    #[test]
    fn probe_script_covers_all_providers() {
        let script = selector_probe_script();
        assert!(script.contains(".g-recaptcha"));
        assert!(script.contains(".h-captcha"));
        assert!(script.contains(".cf-turnstile"));
        assert!(script.contains("arkose"));
        assert!(script.starts_with("JSON.stringify"));
    }
}
