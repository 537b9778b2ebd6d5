#[cfg(test)]
mod integration_tests {
    use crate::api::{validate, RenderRequestBody};
    use crate::browser_pool::{AcquireOptions, BrowserPool};
    use crate::config::{Config, PoolSettings};
    use crate::error::{ErrorCode, RenderError};
    use std::time::Duration;

    fn pool_config(min: usize, max: usize, contexts: usize) -> Config {
        Config {
            pool: PoolSettings {
                min_browsers: min,
                max_browsers: max,
                max_contexts_per_browser: contexts,
                idle_timeout: Duration::from_secs(300),
                health_check_interval: Duration::from_secs(30),
            },
            ..Default::default()
        }
    }

    #[test]
    fn config_defaults_match_service_contract() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.cors_enabled);
        assert_eq!(config.pool.min_browsers, 1);
        assert_eq!(config.pool.max_browsers, 3);
        assert_eq!(config.pool.max_contexts_per_browser, 5);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.pool.health_check_interval, Duration::from_secs(30));
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.rate_limit.max_requests, 30);
    }

    #[test]
    fn config_validation_rejects_broken_shapes() {
        let mut config = Config::default();
        config.pool.max_browsers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.min_browsers = 5;
        config.pool.max_browsers = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.max_contexts_per_browser = 0;
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn chrome_args_harden_the_browser() {
        let args = crate::config::chrome_args(0, None);
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--disable-gpu".to_string()));
        assert!(args
            .iter()
            .any(|a| a == "--disable-blink-features=AutomationControlled"));
        assert!(args.iter().any(|a| a.starts_with("--user-data-dir=")));

        let with_proxy = crate::config::chrome_args(1, Some("http://proxy:8080"));
        assert!(with_proxy
            .iter()
            .any(|a| a == "--proxy-server=http://proxy:8080"));
    }

    #[test]
    fn error_codes_map_to_edge_statuses() {
        assert_eq!(
            RenderError::Timeout(Duration::from_secs(1)).http_status(),
            504
        );
        assert_eq!(
            RenderError::TotalTimeout(Duration::from_secs(1)).http_status(),
            504
        );
        assert_eq!(RenderError::AcquireTimeout.http_status(), 504);
        assert_eq!(
            RenderError::ValidationFailed("x".into()).http_status(),
            400
        );
        assert_eq!(RenderError::RateLimited.http_status(), 429);
        assert_eq!(
            RenderError::NavigationFailed("x".into()).http_status(),
            500
        );
        assert_eq!(RenderError::ShuttingDown.http_status(), 500);
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::NavigationFailed).unwrap();
        assert_eq!(json, "\"NAVIGATION_FAILED\"");
        let json = serde_json::to_string(&ErrorCode::ValidationError).unwrap();
        assert_eq!(json, "\"VALIDATION_ERROR\"");
        let json = serde_json::to_string(&ErrorCode::RateLimited).unwrap();
        assert_eq!(json, "\"RATE_LIMITED\"");
    }

    #[test]
    fn retryable_classification_is_stable() {
        assert!(RenderError::AcquireTimeout.is_retryable());
        assert!(RenderError::NavigationFailed("x".into()).is_retryable());
        assert!(!RenderError::ValidationFailed("x".into()).is_retryable());
        assert!(!RenderError::RateLimited.is_retryable());
    }

    #[tokio::test]
    async fn empty_pool_reports_full_unlaunched_capacity() {
        let pool = BrowserPool::new(pool_config(0, 3, 5));
        pool.initialize().await.expect("min=0 initializes");

        let capacity = pool.capacity().await;
        assert_eq!(capacity.total_browsers, 0);
        assert_eq!(capacity.healthy_browsers, 0);
        assert_eq!(capacity.active_leases, 0);
        assert_eq!(capacity.available_slots, 15);
        assert_eq!(capacity.queue_length, 0);
    }

    #[tokio::test]
    async fn capacity_serializes_camel_case() {
        let pool = BrowserPool::new(pool_config(0, 2, 3));
        pool.initialize().await.unwrap();

        let json = serde_json::to_value(pool.capacity().await).unwrap();
        assert_eq!(json["totalBrowsers"], 0);
        assert_eq!(json["availableSlots"], 6);
        assert_eq!(json["queueLength"], 0);
    }

    #[tokio::test]
    async fn saturated_pool_times_out_queued_acquisitions() {
        // max_browsers = 0 means nothing can ever be launched, so every
        // acquisition waits in the queue until its deadline fires.
        let pool = BrowserPool::new(pool_config(0, 0, 1));
        pool.initialize().await.unwrap();

        let started = std::time::Instant::now();
        let result = pool
            .acquire(AcquireOptions {
                proxy: None,
                deadline: Duration::from_millis(150),
            })
            .await;

        assert!(matches!(result, Err(RenderError::AcquireTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(150));

        // The timed-out waiter removed itself from the queue
        assert_eq!(pool.capacity().await.queue_length, 0);
    }

    #[tokio::test]
    async fn queued_acquisitions_are_fifo() {
        let pool = BrowserPool::new(pool_config(0, 0, 1));
        pool.initialize().await.unwrap();

        let first = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(AcquireOptions {
                    proxy: None,
                    deadline: Duration::from_millis(400),
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(AcquireOptions {
                    proxy: None,
                    deadline: Duration::from_millis(400),
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pool.capacity().await.queue_length, 2);

        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first.unwrap(), Err(RenderError::AcquireTimeout)));
        assert!(matches!(second.unwrap(), Err(RenderError::AcquireTimeout)));
    }

    #[tokio::test]
    async fn acquire_after_shutdown_fails_fast() {
        let pool = BrowserPool::new(pool_config(0, 2, 1));
        pool.initialize().await.unwrap();
        pool.shutdown().await;

        let result = pool.acquire(AcquireOptions::default()).await;
        assert!(matches!(result, Err(RenderError::ShuttingDown)));
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_waiters() {
        let pool = BrowserPool::new(pool_config(0, 0, 1));
        pool.initialize().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(AcquireOptions {
                    proxy: None,
                    deadline: Duration::from_secs(10),
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.capacity().await.queue_length, 1);

        pool.shutdown().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RenderError::ShuttingDown)));
    }

    #[tokio::test]
    async fn releasing_an_unknown_instance_is_harmless() {
        let pool = BrowserPool::new(pool_config(0, 1, 1));
        pool.initialize().await.unwrap();

        // Accounting saturates at zero and never panics
        pool.release_slot(uuid::Uuid::new_v4()).await;
        assert_eq!(pool.capacity().await.active_leases, 0);
    }

    #[test]
    fn render_scenario_invalid_url_yields_validation_error() {
        let body: RenderRequestBody =
            serde_json::from_value(serde_json::json!({ "url": "not-a-valid-url" })).unwrap();
        let errors = validate(body).unwrap_err();
        assert_eq!(errors[0].field, "url");
    }

    #[test]
    fn render_scenario_empty_body_yields_validation_error() {
        let body: RenderRequestBody = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(validate(body).is_err());
    }

    #[test]
    fn failure_response_envelope_is_machine_readable() {
        let response = crate::api::RenderResponse::failure(
            "req-1",
            vec![crate::api::ApiError::new(
                ErrorCode::Timeout,
                "Timeout after 5s",
            )],
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["request_id"], "req-1");
        assert_eq!(json["errors"][0]["code"], "TIMEOUT");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
        // Absent sections are omitted rather than null-filled
        assert!(json.get("content").is_none());
        assert!(json.get("meta").is_none());
    }
}
