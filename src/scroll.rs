//! Human-like scroll engine
//!
//! Scrolls a page in randomized viewport-fraction steps with jittered
//! pauses, watching document growth to feed lazy and infinite-scroll
//! loaders. Bounded by the request's `max_scrolls`.

use crate::api::ScrollConfig;
use chromiumoxide::page::Page;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Probability of an extra human-idle pause per iteration.
const IDLE_PAUSE_CHANCE: f64 = 0.2;
/// Bottom proximity margin in pixels.
const BOTTOM_MARGIN: u32 = 100;
/// Relative growth of `innerHTML.length` that counts as new content.
const CONTENT_GROWTH_RATIO: f64 = 1.02;

#[derive(Debug, Clone, Copy, Default)]
pub struct ScrollSummary {
    pub steps: u32,
    pub content_changes: u32,
    pub reached_bottom: bool,
}

/// Fraction of the viewport height covered by one scroll step (60-90%).
fn step_fraction() -> f64 {
    rand::thread_rng().gen_range(0.60..=0.90)
}

/// Step delay jittered by +/- 25%.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(factor)
}

/// Pause after newly loaded content (200-500 ms).
fn content_settle_pause() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(200..=500))
}

/// Occasional longer idle, like a reader pausing (500-1500 ms).
fn human_idle_pause() -> Option<Duration> {
    let mut rng = rand::thread_rng();
    if rng.gen_bool(IDLE_PAUSE_CHANCE) {
        Some(Duration::from_millis(rng.gen_range(500..=1500)))
    } else {
        None
    }
}

async fn page_metrics(page: &Page) -> (u64, u64) {
    let expr = "JSON.stringify([document.body ? document.body.scrollHeight : 0, \
                document.body ? document.body.innerHTML.length : 0])";
    let raw = page
        .evaluate(expr)
        .await
        .ok()
        .and_then(|v| v.into_value::<String>().ok())
        .unwrap_or_default();
    let parsed: Vec<u64> = serde_json::from_str(&raw).unwrap_or_default();
    (
        parsed.first().copied().unwrap_or(0),
        parsed.get(1).copied().unwrap_or(0),
    )
}

async fn at_bottom(page: &Page) -> bool {
    let expr = format!(
        "(window.innerHeight + window.scrollY) >= (document.body ? document.body.scrollHeight - {BOTTOM_MARGIN} : 0)"
    );
    page.evaluate(expr)
        .await
        .ok()
        .and_then(|v| v.into_value::<bool>().ok())
        .unwrap_or(false)
}

async fn scroll_step(page: &Page, fraction: f64) {
    let expr = format!("window.scrollBy(0, Math.floor(window.innerHeight * {fraction:.3}))");
    let _ = page.evaluate(expr).await;
}

/// Run the bounded scroll loop against a loaded page.
pub async fn run(page: &Page, config: &ScrollConfig) -> ScrollSummary {
    let mut summary = ScrollSummary::default();
    let (mut last_height, mut last_length) = page_metrics(page).await;

    for step in 0..config.max_scrolls {
        scroll_step(page, step_fraction()).await;
        tokio::time::sleep(jittered(config.delay)).await;

        let (height, length) = page_metrics(page).await;
        summary.steps = step + 1;

        let grew = height > last_height
            || (last_length > 0 && length as f64 > last_length as f64 * CONTENT_GROWTH_RATIO);
        if grew {
            summary.content_changes += 1;
            debug!(step, height, length, "scroll loaded new content");
            tokio::time::sleep(content_settle_pause()).await;
        }
        last_height = last_height.max(height);
        last_length = last_length.max(length);

        if at_bottom(page).await {
            summary.reached_bottom = true;
            // One overshoot to poke infinite-scroll loaders
            scroll_step(page, 1.0).await;
            tokio::time::sleep(jittered(config.delay)).await;
            let (height_after, _) = page_metrics(page).await;
            if height_after <= last_height {
                break;
            }
            last_height = height_after;
            summary.content_changes += 1;
        }

        if let Some(pause) = human_idle_pause() {
            tokio::time::sleep(pause).await;
        }
    }

    debug!(
        steps = summary.steps,
        content_changes = summary.content_changes,
        reached_bottom = summary.reached_bottom,
        "scroll loop finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_fraction_stays_in_range() {
        for _ in 0..200 {
            let f = step_fraction();
            assert!((0.60..=0.90).contains(&f));
        }
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let base = Duration::from_millis(400);
        for _ in 0..200 {
            let d = jittered(base);
            assert!(d >= Duration::from_millis(300));
            assert!(d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn settle_pause_stays_in_range() {
        for _ in 0..200 {
            let d = content_settle_pause();
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn idle_pause_is_occasional_and_bounded() {
        let mut hits = 0;
        for _ in 0..2000 {
            if let Some(d) = human_idle_pause() {
                hits += 1;
                assert!(d >= Duration::from_millis(500));
                assert!(d <= Duration::from_millis(1500));
            }
        }
        // ~20% chance; loose bounds keep this deterministic enough
        assert!(hits > 200 && hits < 800, "idle pauses: {hits}");
    }
}
