//! Browser pool management for concurrent Chrome instances
//!
//! Owns the lifecycle of a bounded set of long-lived Chrome processes and
//! leases isolated pages out of them. Acquisitions that cannot be served
//! immediately wait in a strict FIFO queue with an armed deadline; every
//! lease release and every successful launch drains the queue.

use crate::config::{self, Config};
use crate::error::RenderError;
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WAITER_PENDING: u8 = 0;
const WAITER_CLAIMED: u8 = 1;
const WAITER_CANCELLED: u8 = 2;

/// One live Chrome process tracked by the pool.
pub struct BrowserInstance {
    pub id: Uuid,
    pub browser: Arc<Mutex<Browser>>,
    /// Background task polling the CDP event stream; a finished task means
    /// the process disconnected.
    pub handler: tokio::task::JoinHandle<()>,
    pub lease_count: usize,
    pub created_at: Instant,
    pub last_used: Instant,
    pub healthy: bool,
    /// Upstream proxy this process was launched with, if any.
    pub proxy: Option<String>,
}

impl BrowserInstance {
    fn has_capacity(&self, max_contexts: usize) -> bool {
        self.healthy && !self.handler.is_finished() && self.lease_count < max_contexts
    }

    fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// The right to use one page until release, accounted against its instance.
///
/// Release runs exactly once: the explicit [`Lease::release`] call on the
/// normal path, or the drop guard when the pipeline is cancelled mid-flight.
/// A double release is a no-op.
pub struct Lease {
    pub instance_id: Uuid,
    pub page: Page,
    released: Arc<AtomicBool>,
    pool: Arc<BrowserPool>,
}

impl Lease {
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.page.clone().close().await;
        self.pool.release_slot(self.instance_id).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let page = self.page.clone();
        let pool = self.pool.clone();
        let instance_id = self.instance_id;
        tokio::spawn(async move {
            let _ = page.close().await;
            pool.release_slot(instance_id).await;
        });
    }
}

/// What an acquisition needs from the pool.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Normalized proxy server the leased page must ride through.
    pub proxy: Option<String>,
    /// How long the caller is willing to wait in the queue.
    pub deadline: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            deadline: Duration::from_secs(30),
        }
    }
}

/// A queued request for a lease.
struct PendingAcquisition {
    id: u64,
    options: AcquireOptions,
    tx: oneshot::Sender<Result<Lease, RenderError>>,
    /// One-way state machine: pending -> claimed | cancelled. Only the
    /// winner of the transition owns the outcome.
    claim: Arc<AtomicU8>,
}

struct PoolState {
    instances: Vec<BrowserInstance>,
    queue: VecDeque<PendingAcquisition>,
    pending_launches: usize,
}

/// Point-in-time pool capacity, reported by `/health` and `/v1/pool/status`.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCapacity {
    pub total_browsers: usize,
    pub healthy_browsers: usize,
    pub active_leases: usize,
    pub available_slots: usize,
    pub queue_length: usize,
}

pub struct BrowserPool {
    config: Config,
    state: Mutex<PoolState>,
    shutting_down: AtomicBool,
    init: tokio::sync::OnceCell<()>,
    ticker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    launch_seq: AtomicUsize,
    waiter_seq: AtomicU64,
}

impl BrowserPool {
    /// Construct a pool without launching anything. [`BrowserPool::initialize`]
    /// performs the launches and is shared by concurrent callers.
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(PoolState {
                instances: Vec::new(),
                queue: VecDeque::new(),
                pending_launches: 0,
            }),
            shutting_down: AtomicBool::new(false),
            init: tokio::sync::OnceCell::new(),
            ticker: std::sync::Mutex::new(None),
            launch_seq: AtomicUsize::new(0),
            waiter_seq: AtomicU64::new(0),
        })
    }

    /// Launch the minimum browser set and start the health ticker.
    /// Idempotent; concurrent callers share one completion. Failing to
    /// launch a single browser while `min_browsers > 0` is fatal.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), RenderError> {
        self.init
            .get_or_try_init(|| async {
                let min = self.config.pool.min_browsers;
                if min > 0 {
                    let launches = (0..min).map(|_| self.launch_one(None));
                    let results = futures::future::join_all(launches).await;
                    let launched = results.iter().filter(|r| r.is_some()).count();
                    if launched == 0 {
                        return Err(RenderError::LaunchFailed(
                            "no browser instance could be launched".to_string(),
                        ));
                    }
                    info!(launched, min, "browser pool initialized");
                }
                self.start_health_ticker();
                Ok(())
            })
            .await
            .map(|_| ())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Acquire a lease, waiting in the FIFO queue when the pool is full.
    pub async fn acquire(self: &Arc<Self>, options: AcquireOptions) -> Result<Lease, RenderError> {
        if self.is_shutting_down() {
            return Err(RenderError::ShuttingDown);
        }
        self.initialize().await?;

        // Fast path only when nobody is queued ahead of us
        let reserved = {
            let mut state = self.state.lock().await;
            if state.queue.is_empty() {
                self.find_and_reserve(&mut state, options.proxy.as_deref())
            } else {
                None
            }
        };

        if let Some((instance_id, browser)) = reserved {
            return match self.open_lease(instance_id, browser).await {
                Ok(lease) => Ok(lease),
                Err(e) => {
                    self.release_slot(instance_id).await;
                    Err(e)
                }
            };
        }

        // Try to grow the pool for this request
        let queue_empty = self.state.lock().await.queue.is_empty();
        if queue_empty && self.launch_one(options.proxy.clone()).await.is_some() {
            let reserved = {
                let mut state = self.state.lock().await;
                self.find_and_reserve(&mut state, options.proxy.as_deref())
            };
            if let Some((instance_id, browser)) = reserved {
                let outcome = match self.open_lease(instance_id, browser).await {
                    Ok(lease) => Ok(lease),
                    Err(e) => {
                        self.release_slot(instance_id).await;
                        Err(e)
                    }
                };
                // The fresh process may carry more spare slots than we took
                let pool = self.clone();
                tokio::spawn(async move { pool.process_queue().await });
                return outcome;
            }
        }

        self.wait_in_queue(options).await
    }

    async fn wait_in_queue(self: &Arc<Self>, options: AcquireOptions) -> Result<Lease, RenderError> {
        let (tx, mut rx) = oneshot::channel();
        let claim = Arc::new(AtomicU8::new(WAITER_PENDING));
        let waiter_id = self.waiter_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = options.deadline;

        {
            let mut state = self.state.lock().await;
            if self.is_shutting_down() {
                return Err(RenderError::ShuttingDown);
            }
            state.queue.push_back(PendingAcquisition {
                id: waiter_id,
                options,
                tx,
                claim: claim.clone(),
            });
            debug!(waiter_id, queue_len = state.queue.len(), "acquisition queued");
        }

        // A launch slot may be free even though every instance is full
        let pool = self.clone();
        tokio::spawn(async move { pool.process_queue().await });

        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RenderError::Internal(
                "acquisition channel closed".to_string(),
            )),
            Err(_) => {
                let won = claim
                    .compare_exchange(
                        WAITER_PENDING,
                        WAITER_CANCELLED,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok();
                if won {
                    let mut state = self.state.lock().await;
                    state.queue.retain(|p| p.id != waiter_id);
                    Err(RenderError::AcquireTimeout)
                } else {
                    // Lost the race to process_queue; the grant is in flight
                    match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(RenderError::Internal(
                            "acquisition channel closed".to_string(),
                        )),
                    }
                }
            }
        }
    }

    /// Reserve a slot on the least-loaded instance matching the proxy
    /// requirement. The count is bumped before any engine call so capacity
    /// decisions stay conservative.
    fn find_and_reserve(
        &self,
        state: &mut PoolState,
        proxy: Option<&str>,
    ) -> Option<(Uuid, Arc<Mutex<Browser>>)> {
        let max_contexts = self.config.pool.max_contexts_per_browser;
        let candidate = state
            .instances
            .iter_mut()
            .filter(|i| i.has_capacity(max_contexts))
            .filter(|i| i.proxy.as_deref() == proxy)
            .min_by_key(|i| i.lease_count)?;

        candidate.lease_count += 1;
        candidate.last_used = Instant::now();
        Some((candidate.id, candidate.browser.clone()))
    }

    async fn open_lease(
        self: &Arc<Self>,
        instance_id: Uuid,
        browser: Arc<Mutex<Browser>>,
    ) -> Result<Lease, RenderError> {
        let page = {
            let guard = browser.lock().await;
            guard
                .new_page("about:blank")
                .await
                .map_err(|e| RenderError::BrowserError(e.to_string()))?
        };
        Ok(Lease {
            instance_id,
            page,
            released: Arc::new(AtomicBool::new(false)),
            pool: self.clone(),
        })
    }

    /// Decrement the instance's lease count (saturating) and drain the queue.
    pub async fn release_slot(self: &Arc<Self>, instance_id: Uuid) {
        self.decrement_slot(instance_id).await;
        self.process_queue().await;
    }

    async fn decrement_slot(&self, instance_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.instances.iter_mut().find(|i| i.id == instance_id) {
            instance.lease_count = instance.lease_count.saturating_sub(1);
            instance.last_used = Instant::now();
        }
    }

    /// Serve queued acquisitions head-first while capacity lasts.
    async fn process_queue(self: &Arc<Self>) {
        enum Action {
            Grant {
                instance_id: Uuid,
                browser: Arc<Mutex<Browser>>,
                tx: oneshot::Sender<Result<Lease, RenderError>>,
            },
            Launch {
                proxy: Option<String>,
            },
            Done,
        }

        loop {
            if self.is_shutting_down() {
                return;
            }

            let action = {
                let mut state = self.state.lock().await;
                loop {
                    let Some(head) = state.queue.front() else {
                        break Action::Done;
                    };
                    if head.claim.load(Ordering::SeqCst) == WAITER_CANCELLED {
                        state.queue.pop_front();
                        continue;
                    }
                    let proxy = head.options.proxy.clone();
                    if let Some((instance_id, browser)) =
                        self.find_and_reserve(&mut state, proxy.as_deref())
                    {
                        let entry = state.queue.pop_front().expect("head exists");
                        let claimed = entry
                            .claim
                            .compare_exchange(
                                WAITER_PENDING,
                                WAITER_CLAIMED,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok();
                        if !claimed {
                            // Cancelled while we reserved; give the slot back
                            if let Some(instance) =
                                state.instances.iter_mut().find(|i| i.id == instance_id)
                            {
                                instance.lease_count = instance.lease_count.saturating_sub(1);
                            }
                            continue;
                        }
                        break Action::Grant {
                            instance_id,
                            browser,
                            tx: entry.tx,
                        };
                    }
                    let max = self.config.pool.max_browsers;
                    if state.instances.len() + state.pending_launches < max {
                        break Action::Launch { proxy };
                    }
                    break Action::Done;
                }
            };

            match action {
                Action::Done => return,
                Action::Grant {
                    instance_id,
                    browser,
                    tx,
                } => match self.open_lease(instance_id, browser).await {
                    Ok(lease) => {
                        if tx.send(Ok(lease)).is_err() {
                            // Receiver vanished; the dropped lease cleans up
                            debug!("granted lease had no receiver");
                        }
                    }
                    Err(e) => {
                        self.decrement_slot(instance_id).await;
                        let _ = tx.send(Err(e));
                    }
                },
                Action::Launch { proxy } => {
                    if self.launch_one(proxy).await.is_none() {
                        return;
                    }
                }
            }
        }
    }

    /// Launch one browser if the cap allows. Failures are logged and
    /// reported as `None`; callers fall back to the queue.
    async fn launch_one(self: &Arc<Self>, proxy: Option<String>) -> Option<Uuid> {
        {
            let mut state = self.state.lock().await;
            if state.instances.len() + state.pending_launches >= self.config.pool.max_browsers {
                return None;
            }
            state.pending_launches += 1;
        }

        let result = self.launch_instance(proxy).await;

        {
            let mut state = self.state.lock().await;
            state.pending_launches = state.pending_launches.saturating_sub(1);
        }

        match result {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, "browser launch failed");
                None
            }
        }
    }

    // Returns a boxed future instead of `async fn` to break the auto-trait
    // recursion cycle: this function spawns a task that calls
    // `handle_disconnect`, which calls `launch_one`, which awaits this same
    // function again. Rustc's Send solver cannot resolve that cycle through
    // an opaque `impl Future`; boxing erases the self-referential type.
    fn launch_instance(
        self: &Arc<Self>,
        proxy: Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Uuid, RenderError>> + Send + '_>>
    {
        Box::pin(async move {
            let seq = self.launch_seq.fetch_add(1, Ordering::Relaxed);
            let browser_config = config::create_browser_config(&self.config, seq, proxy.as_deref())?;

            let (browser, mut handler) = Browser::launch(browser_config)
                .await
                .map_err(|e| RenderError::LaunchFailed(e.to_string()))?;

            let id = Uuid::new_v4();
            let weak = Arc::downgrade(self);
            // The handler implements Stream and must be polled for the CDP
            // connection to make progress; stream end means the process is gone.
            let handler_task = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        debug!(error = %e, "browser handler error");
                        break;
                    }
                }
                if let Some(pool) = weak.upgrade() {
                    pool.handle_disconnect(id).await;
                }
            });

            let instance = BrowserInstance {
                id,
                browser: Arc::new(Mutex::new(browser)),
                handler: handler_task,
                lease_count: 0,
                created_at: Instant::now(),
                last_used: Instant::now(),
                healthy: true,
                proxy,
            };

            {
                let mut state = self.state.lock().await;
                state.instances.push(instance);
            }
            info!(%id, seq, "browser instance launched");
            Ok(id)
        })
    }

    /// Retire a disconnected instance and replace it while below the
    /// minimum. Only a zero-lease instance is removed from accounting;
    /// one with live leases is marked unhealthy and drains through the
    /// normal release path until the ticker can evict it.
    async fn handle_disconnect(self: &Arc<Self>, instance_id: Uuid) {
        if self.is_shutting_down() {
            return;
        }
        let evicted = {
            let mut state = self.state.lock().await;
            let Some(position) = state.instances.iter().position(|i| i.id == instance_id) else {
                return;
            };
            if state.instances[position].lease_count == 0 {
                state.instances.remove(position);
                true
            } else {
                state.instances[position].healthy = false;
                false
            }
        };
        if evicted {
            warn!(%instance_id, "browser disconnected, evicted");
        } else {
            warn!(%instance_id, "browser disconnected, retiring after leases drain");
        }

        let deficit = {
            let state = self.state.lock().await;
            self.config
                .pool
                .min_browsers
                .saturating_sub(state.instances.len() + state.pending_launches)
        };
        for _ in 0..deficit {
            if self.launch_one(None).await.is_none() {
                break;
            }
        }
        self.process_queue().await;
    }

    /// Periodic sweep: evict disconnected instances, reclaim idle surplus
    /// ones. The sweep only closes instances whose lease count is zero, so
    /// it never races an in-flight release and never drops outstanding
    /// leases from the accounting; a disconnected instance that still
    /// carries leases is marked unhealthy and picked up on a later tick.
    async fn health_tick(self: &Arc<Self>) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock().await;
            let min = self.config.pool.min_browsers;
            let idle_timeout = self.config.pool.idle_timeout;
            let mut idx = 0;
            while idx < state.instances.len() {
                let (disconnected, leases) = {
                    let inst = &state.instances[idx];
                    (inst.handler.is_finished() || !inst.healthy, inst.lease_count)
                };
                let idle = {
                    let inst = &state.instances[idx];
                    inst.idle_for() > idle_timeout && state.instances.len() > min
                };
                if leases == 0 && (disconnected || idle) {
                    let inst = state.instances.remove(idx);
                    evicted.push((inst, disconnected));
                } else {
                    if disconnected {
                        state.instances[idx].healthy = false;
                    }
                    idx += 1;
                }
            }
        }

        for (instance, disconnected) in evicted {
            if disconnected {
                warn!(id = %instance.id, "health check evicting disconnected browser");
            } else {
                info!(id = %instance.id, idle = ?instance.idle_for(), "closing idle browser");
            }
            {
                let mut browser = instance.browser.lock().await;
                let _ = browser.close().await;
            }
            instance.handler.abort();
        }

        let deficit = {
            let state = self.state.lock().await;
            self.config
                .pool
                .min_browsers
                .saturating_sub(state.instances.len() + state.pending_launches)
        };
        if deficit > 0 {
            for _ in 0..deficit {
                if self.launch_one(None).await.is_none() {
                    break;
                }
            }
            self.process_queue().await;
        }
    }

    fn start_health_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.pool.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.is_shutting_down() {
                    break;
                }
                pool.health_tick().await;
            }
        });
        *self.ticker.lock().unwrap() = Some(handle);
    }

    /// Cheap, non-blocking capacity snapshot.
    pub async fn capacity(&self) -> PoolCapacity {
        let state = self.state.lock().await;
        let max_contexts = self.config.pool.max_contexts_per_browser;
        let max_browsers = self.config.pool.max_browsers;

        let mut healthy = 0;
        let mut leases = 0;
        let mut spare = 0;
        for instance in &state.instances {
            leases += instance.lease_count;
            if instance.healthy && !instance.handler.is_finished() {
                healthy += 1;
                spare += max_contexts.saturating_sub(instance.lease_count);
            }
        }
        let unlaunched =
            max_browsers.saturating_sub(state.instances.len() + state.pending_launches);

        PoolCapacity {
            total_browsers: state.instances.len(),
            healthy_browsers: healthy,
            active_leases: leases,
            available_slots: spare + unlaunched * max_contexts,
            queue_length: state.queue.len(),
        }
    }

    /// Stop admissions, fail queued waiters, and close every browser.
    pub async fn shutdown(&self) {
        info!("shutting down browser pool");
        self.shutting_down.store(true, Ordering::Relaxed);

        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            ticker.abort();
        }

        let (waiters, instances) = {
            let mut state = self.state.lock().await;
            let waiters: Vec<_> = state.queue.drain(..).collect();
            let instances: Vec<_> = state.instances.drain(..).collect();
            (waiters, instances)
        };

        for waiter in waiters {
            let cancelled = waiter
                .claim
                .compare_exchange(
                    WAITER_PENDING,
                    WAITER_CANCELLED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();
            if cancelled {
                let _ = waiter.tx.send(Err(RenderError::ShuttingDown));
            }
        }

        let closes = instances.into_iter().map(|instance| async move {
            {
                let mut browser = instance.browser.lock().await;
                let _ = browser.close().await;
            }
            instance.handler.abort();
        });
        futures::future::join_all(closes).await;

        info!("browser pool shutdown complete");
    }
}
