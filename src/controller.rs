//! Polling refresh with bounded retry.
//!
//! `RefreshController` keeps one dataset fresh: it fetches on a fixed
//! interval, retries failures a limited number of times after a fixed delay,
//! and writes every success through to the cache. State lives in a [`Store`]
//! owned by the controller; consumers read it through the controller handle.
//!
//! # Example
//!
//! ```ignore
//! let controller = RefreshController::builder("kpis", Arc::new(fetcher))
//!     .cache(cache, Duration::from_secs(300))
//!     .build();
//!
//! controller.start(Duration::from_secs(30));
//!
//! // In render
//! let state = controller.state();
//! if let Some(error) = &state.error {
//!     render_banner(error);
//! }
//! if let Some(data) = &state.data {
//!     render_kpis(data);
//! }
//! ```

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::CacheLayer;
use crate::fetcher::{Dataset, FetchParams, Fetcher};
use crate::store::{Action, Preferences, PreferencesUpdate, RefreshState, Store};

/// Default number of automatic retries after a failed fetch
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before each automatic retry
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);

/// What caused a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
  Interval,
  Manual,
  Retry,
}

/// Timers and retry bookkeeping. Never held across an await.
#[derive(Default)]
struct Schedule {
  interval: Option<JoinHandle<()>>,
  retry: Option<JoinHandle<()>>,
  retry_count: u32,
  /// Bumped by `stop()` so fetches started earlier don't schedule retries
  epoch: u64,
}

impl Schedule {
  fn cancel_retry(&mut self) {
    if let Some(handle) = self.retry.take() {
      handle.abort();
    }
  }
}

struct CacheSettings {
  layer: CacheLayer,
  max_age: Duration,
}

struct Inner {
  dataset_key: String,
  fetcher: Arc<dyn Fetcher>,
  store: Store,
  cache: Option<CacheSettings>,
  max_retries: u32,
  retry_delay: Duration,
  fetch_timeout: Option<Duration>,
  schedule: Mutex<Schedule>,
}

impl Inner {
  fn lock_schedule(&self) -> MutexGuard<'_, Schedule> {
    self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn current_epoch(&self) -> u64 {
    self.lock_schedule().epoch
  }

  /// Run one guarded fetch and apply its result.
  ///
  /// `epoch` is the schedule epoch the fetch was requested under. Returns
  /// `false` without doing anything if `stop()` has run since then or a fetch
  /// is already in flight.
  fn run(self: Arc<Self>, trigger: Trigger, epoch: u64) -> BoxFuture<'static, bool> {
    Box::pin(async move {
      if self.current_epoch() != epoch {
        debug!(key = %self.dataset_key, ?trigger, "refresh stopped before fetch began, skipping");
        return false;
      }

      if !self.store.begin_fetch() {
        debug!(key = %self.dataset_key, ?trigger, "fetch already in flight, skipping");
        return false;
      }

      if trigger == Trigger::Interval {
        let mut schedule = self.lock_schedule();
        if schedule.epoch == epoch {
          schedule.retry_count = 0;
        }
      }

      let params = FetchParams {
        period: self.store.snapshot().preferences.period,
      };

      debug!(key = %self.dataset_key, ?trigger, period = %params.period, "fetching dataset");

      match self.fetch_once(&params).await {
        Ok(dataset) => self.apply_success(dataset),
        Err(e) => self.apply_failure(e.to_string(), epoch),
      }

      true
    })
  }

  async fn fetch_once(&self, params: &FetchParams) -> Result<Dataset> {
    let fetch = self.fetcher.fetch(&self.dataset_key, params);

    match self.fetch_timeout {
      Some(limit) => tokio::time::timeout(limit, fetch)
        .await
        .map_err(|_| eyre!("Request timed out after {}s", limit.as_secs()))?,
      None => fetch.await,
    }
  }

  fn apply_success(&self, dataset: Dataset) {
    let data = Arc::new(dataset);
    self.store.dispatch(Action::SetData {
      data: Arc::clone(&data),
      at: Utc::now(),
    });

    {
      let mut schedule = self.lock_schedule();
      schedule.retry_count = 0;
      schedule.cancel_retry();
    }

    if let Some(cache) = &self.cache {
      cache.layer.save(&self.dataset_key, &data);
    }

    info!(key = %self.dataset_key, "dataset refreshed");
  }

  fn apply_failure(self: &Arc<Self>, reason: String, epoch: u64) {
    self.store.fail_fetch(reason.clone());

    let mut schedule = self.lock_schedule();

    if schedule.epoch != epoch {
      warn!(key = %self.dataset_key, error = %reason, "fetch failed after stop, not retrying");
      return;
    }

    if schedule.retry_count >= self.max_retries {
      warn!(
        key = %self.dataset_key,
        error = %reason,
        retries = schedule.retry_count,
        "fetch failed, retries exhausted until next scheduled refresh"
      );
      return;
    }

    schedule.retry_count += 1;
    warn!(
      key = %self.dataset_key,
      error = %reason,
      attempt = schedule.retry_count,
      max_retries = self.max_retries,
      delay_ms = self.retry_delay.as_millis() as u64,
      "fetch failed, scheduling retry"
    );

    let weak = Arc::downgrade(self);
    let delay = self.retry_delay;
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(inner) = weak.upgrade() {
        // Detached so that cancelling the timer never cancels a running fetch
        tokio::spawn(Inner::run(inner, Trigger::Retry, epoch));
      }
    });

    schedule.cancel_retry();
    schedule.retry = Some(handle);
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    let schedule = self
      .schedule
      .get_mut()
      .unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = schedule.interval.take() {
      handle.abort();
    }
    schedule.cancel_retry();
  }
}

/// Handle to a polling refresh loop for one dataset.
///
/// Cloning is cheap and every clone controls the same loop. Timers only hold
/// weak references, so the loop ends once the last handle is dropped.
#[derive(Clone)]
pub struct RefreshController {
  inner: Arc<Inner>,
}

impl RefreshController {
  pub fn builder(dataset_key: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> RefreshControllerBuilder {
    RefreshControllerBuilder {
      dataset_key: dataset_key.into(),
      fetcher,
      cache: None,
      max_retries: DEFAULT_MAX_RETRIES,
      retry_delay: DEFAULT_RETRY_DELAY,
      fetch_timeout: None,
      preferences: Preferences::default(),
    }
  }

  /// Begin polling: fetch now, then every `interval`.
  ///
  /// Does nothing if already started. Must be called from within a Tokio runtime.
  pub fn start(&self, interval: Duration) {
    let mut schedule = self.inner.lock_schedule();
    if schedule.interval.is_some() {
      return;
    }

    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    // Ticks belong to this start; `stop()` bumps the epoch and voids them
    let epoch = schedule.epoch;
    schedule.interval = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        tokio::spawn(Inner::run(inner, Trigger::Interval, epoch));
      }
    }));

    info!(
      key = %self.inner.dataset_key,
      interval_ms = interval.as_millis() as u64,
      "auto refresh started"
    );
  }

  /// Cancel the interval timer and any pending retry. Safe to call when stopped.
  ///
  /// A fetch that is already running finishes and is applied, but will not
  /// schedule a retry.
  pub fn stop(&self) {
    let mut schedule = self.inner.lock_schedule();
    let was_running = schedule.interval.is_some();

    if let Some(handle) = schedule.interval.take() {
      handle.abort();
    }
    schedule.cancel_retry();
    schedule.retry_count = 0;
    schedule.epoch += 1;

    if was_running {
      info!(key = %self.inner.dataset_key, "auto refresh stopped");
    }
  }

  /// Whether the interval timer is active.
  pub fn is_running(&self) -> bool {
    self.inner.lock_schedule().interval.is_some()
  }

  /// Fetch immediately, outside the interval schedule.
  ///
  /// Returns `false` straight away if a fetch is already in flight; otherwise
  /// waits for the fetch to finish and returns `true`.
  pub async fn refresh_now(&self) -> bool {
    let epoch = self.inner.current_epoch();
    Inner::run(Arc::clone(&self.inner), Trigger::Manual, epoch).await
  }

  /// Relative age of the data, e.g. "3m ago", or "Never".
  pub fn time_since_last_update(&self) -> String {
    format_time_since(self.state().last_updated, Utc::now())
  }

  pub fn update_preferences(&self, update: PreferencesUpdate) {
    self.inner.store.dispatch(Action::UpdatePreferences(update));
  }

  /// Current state snapshot.
  pub fn state(&self) -> RefreshState {
    self.inner.store.snapshot()
  }

  /// Receiver notified after every state change.
  pub fn subscribe(&self) -> watch::Receiver<RefreshState> {
    self.inner.store.subscribe()
  }

  pub fn dataset_key(&self) -> &str {
    &self.inner.dataset_key
  }
}

/// Builder for [`RefreshController`].
pub struct RefreshControllerBuilder {
  dataset_key: String,
  fetcher: Arc<dyn Fetcher>,
  cache: Option<CacheSettings>,
  max_retries: u32,
  retry_delay: Duration,
  fetch_timeout: Option<Duration>,
  preferences: Preferences,
}

impl RefreshControllerBuilder {
  /// Persist every success to `layer` and seed the initial state from it.
  pub fn cache(mut self, layer: CacheLayer, max_age: Duration) -> Self {
    self.cache = Some(CacheSettings { layer, max_age });
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
    self.retry_delay = retry_delay;
    self
  }

  /// Fail a fetch that takes longer than `timeout`. `None` waits forever.
  pub fn fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.fetch_timeout = timeout;
    self
  }

  pub fn preferences(mut self, preferences: Preferences) -> Self {
    self.preferences = preferences;
    self
  }

  pub fn build(self) -> RefreshController {
    let store = Store::new(RefreshState {
      preferences: self.preferences,
      ..Default::default()
    });

    // Cold start from the cache
    if let Some(cache) = &self.cache {
      if let Some(dataset) = cache.layer.load(&self.dataset_key, cache.max_age) {
        info!(key = %self.dataset_key, "restored dataset from cache");
        store.dispatch(Action::SetData {
          at: dataset.retrieved_at,
          data: Arc::new(dataset),
        });
      }
    }

    RefreshController {
      inner: Arc::new(Inner {
        dataset_key: self.dataset_key,
        fetcher: self.fetcher,
        store,
        cache: self.cache,
        max_retries: self.max_retries,
        retry_delay: self.retry_delay,
        fetch_timeout: self.fetch_timeout,
        schedule: Mutex::new(Schedule::default()),
      }),
    }
  }
}

/// Format the age of `last_updated` relative to `now`.
pub fn format_time_since(last_updated: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
  let Some(last_updated) = last_updated else {
    return "Never".to_string();
  };

  let seconds = (now - last_updated).num_seconds().max(0);
  if seconds < 60 {
    return format!("{}s ago", seconds);
  }

  let minutes = seconds / 60;
  if minutes < 60 {
    return format!("{}m ago", minutes);
  }

  let hours = minutes / 60;
  if hours < 24 {
    return format!("{}h ago", hours);
  }

  format!("{}d ago", hours / 24)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use serde_json::{json, Value};
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::time::{sleep, Instant};

  /// Fetcher that replays scripted results and records how it was called.
  struct ScriptedFetcher {
    responses: Mutex<VecDeque<Result<Value, String>>>,
    fallback: Result<Value, String>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    periods: Mutex<Vec<String>>,
  }

  impl ScriptedFetcher {
    fn new(fallback: Result<Value, String>) -> Self {
      Self {
        responses: Mutex::new(VecDeque::new()),
        fallback,
        delay: Duration::ZERO,
        calls: AtomicUsize::new(0),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        call_times: Mutex::new(Vec::new()),
        periods: Mutex::new(Vec::new()),
      }
    }

    fn succeeding(payload: Value) -> Self {
      Self::new(Ok(payload))
    }

    fn failing(reason: &str) -> Self {
      Self::new(Err(reason.to_string()))
    }

    fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = delay;
      self
    }

    fn then(self, response: Result<Value, String>) -> Self {
      self.responses.lock().unwrap().push_back(response);
      self
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
      self.max_in_flight.load(Ordering::SeqCst)
    }

    fn call_times(&self) -> Vec<Instant> {
      self.call_times.lock().unwrap().clone()
    }

    fn periods(&self) -> Vec<String> {
      self.periods.lock().unwrap().clone()
    }
  }

  impl Fetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, key: &'a str, params: &'a FetchParams) -> BoxFuture<'a, Result<Dataset>> {
      Box::pin(async move {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        self.periods.lock().unwrap().push(params.period.clone());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
          sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let response = self
          .responses
          .lock()
          .unwrap()
          .pop_front()
          .unwrap_or_else(|| self.fallback.clone());

        response
          .map(|payload| Dataset {
            key: key.to_string(),
            retrieved_at: Utc::now(),
            payload,
          })
          .map_err(|reason| eyre!("{}", reason))
      })
    }
  }

  fn controller(fetcher: &Arc<ScriptedFetcher>) -> RefreshControllerBuilder {
    let fetcher: Arc<dyn Fetcher> = fetcher.clone();
    RefreshController::builder("kpis", fetcher)
  }

  #[tokio::test(start_paused = true)]
  async fn test_start_fetches_immediately() {
    let fetcher = Arc::new(ScriptedFetcher::succeeding(json!({ "sales": 100 })));
    let controller = controller(&fetcher).build();

    controller.start(Duration::from_secs(30));
    sleep(Duration::from_millis(1)).await;

    assert_eq!(fetcher.calls(), 1);
    let state = controller.state();
    assert_eq!(state.data.unwrap().payload, json!({ "sales": 100 }));
    assert!(state.last_updated.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_start_twice_keeps_one_timer() {
    let fetcher = Arc::new(ScriptedFetcher::succeeding(json!(1)));
    let controller = controller(&fetcher).build();

    controller.start(Duration::from_secs(10));
    controller.start(Duration::from_secs(10));
    sleep(Duration::from_secs(25)).await;

    // Ticks at 0s, 10s and 20s
    assert_eq!(fetcher.calls(), 3);
    assert!(controller.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_when_not_started() {
    let fetcher = Arc::new(ScriptedFetcher::succeeding(json!(1)));
    let controller = controller(&fetcher).build();

    controller.stop();
    controller.stop();

    assert!(!controller.is_running());
    assert_eq!(controller.state(), RefreshState::default());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_cancels_interval_and_retry() {
    let fetcher = Arc::new(ScriptedFetcher::failing("boom"));
    let controller = controller(&fetcher).build();

    controller.start(Duration::from_secs(10));
    sleep(Duration::from_millis(1)).await;
    assert_eq!(fetcher.calls(), 1);

    controller.stop();
    sleep(Duration::from_secs(3600)).await;

    assert_eq!(fetcher.calls(), 1);
    assert!(!controller.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_restart_after_stop() {
    let fetcher = Arc::new(ScriptedFetcher::succeeding(json!(1)));
    let controller = controller(&fetcher).build();

    controller.start(Duration::from_secs(10));
    sleep(Duration::from_millis(1)).await;
    controller.stop();
    controller.start(Duration::from_secs(10));
    sleep(Duration::from_millis(1)).await;

    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_at_most_one_fetch_in_flight() {
    let fetcher = Arc::new(
      ScriptedFetcher::succeeding(json!({ "sales": 1 })).with_delay(Duration::from_millis(100)),
    );
    let controller = controller(&fetcher).build();

    controller.start(Duration::from_millis(10));
    let manual: Vec<_> = (0..5)
      .map(|_| {
        let controller = controller.clone();
        tokio::spawn(async move { controller.refresh_now().await })
      })
      .collect();

    sleep(Duration::from_secs(1)).await;
    for handle in manual {
      handle.await.unwrap();
    }

    assert!(fetcher.calls() > 1);
    assert_eq!(fetcher.max_in_flight(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_refresh_now_while_loading_is_noop() {
    let fetcher = Arc::new(
      ScriptedFetcher::succeeding(json!({ "sales": 1 })).with_delay(Duration::from_millis(100)),
    );
    let controller = controller(&fetcher).build();

    let first = {
      let controller = controller.clone();
      tokio::spawn(async move { controller.refresh_now().await })
    };
    sleep(Duration::from_millis(1)).await;

    let before = controller.state();
    assert!(before.loading);

    assert!(!controller.refresh_now().await);
    assert_eq!(controller.state(), before);
    assert_eq!(fetcher.calls(), 1);

    assert!(first.await.unwrap());
    assert!(!controller.state().loading);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failures_keep_last_good_data() {
    let fetcher = Arc::new(
      ScriptedFetcher::failing("unused")
        .then(Ok(json!({ "sales": 100 })))
        .then(Err("timeout".to_string()))
        .then(Err("HTTP 502 Bad Gateway".to_string()))
        .then(Err("Unauthorized".to_string())),
    );
    let controller = controller(&fetcher).max_retries(0).build();

    assert!(controller.refresh_now().await);
    let good = controller.state();
    let good_data = good.data.clone().unwrap();

    for reason in ["timeout", "HTTP 502 Bad Gateway", "Unauthorized"] {
      assert!(controller.refresh_now().await);
      let state = controller.state();
      assert_eq!(state.error.as_deref(), Some(reason));
      assert_eq!(state.data.as_ref(), Some(&good_data));
      assert_eq!(state.last_updated, good.last_updated);
      assert!(!state.loading);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_clears_error_atomically() {
    let fetcher = Arc::new(
      ScriptedFetcher::succeeding(json!({ "sales": 100 })).then(Err("timeout".to_string())),
    );
    let controller = controller(&fetcher).max_retries(0).build();

    controller.refresh_now().await;
    assert_eq!(controller.state().error.as_deref(), Some("timeout"));
    assert!(controller.state().data.is_none());

    let mut rx = controller.subscribe();
    let watcher = tokio::spawn(async move {
      let mut seen = Vec::new();
      while rx.changed().await.is_ok() {
        seen.push(rx.borrow_and_update().clone());
      }
      seen
    });

    controller.refresh_now().await;
    let state = controller.state();
    assert!(!state.loading);
    assert_eq!(state.error, None);
    assert_eq!(state.data.unwrap().payload, json!({ "sales": 100 }));
    assert!(state.last_updated.is_some());

    drop(controller);
    for seen in watcher.await.unwrap() {
      if seen.data.is_some() {
        assert!(!seen.loading);
        assert_eq!(seen.error, None);
        assert!(seen.last_updated.is_some());
      }
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_are_bounded_and_spaced() {
    let fetcher = Arc::new(ScriptedFetcher::failing("boom"));
    let controller = controller(&fetcher)
      .max_retries(3)
      .retry_delay(Duration::from_secs(5))
      .build();

    controller.start(Duration::from_secs(3600));
    sleep(Duration::from_secs(60)).await;

    // Initial tick plus three retries
    assert_eq!(fetcher.calls(), 4);
    let times = fetcher.call_times();
    for pair in times.windows(2) {
      let gap = pair[1] - pair[0];
      assert!(gap >= Duration::from_secs(5), "gap was {:?}", gap);
      assert!(gap < Duration::from_millis(5010), "gap was {:?}", gap);
    }

    // Nothing more until the next scheduled tick
    sleep(Duration::from_secs(3000)).await;
    assert_eq!(fetcher.calls(), 4);

    // The scheduled tick gets a fresh retry budget
    sleep(Duration::from_secs(600)).await;
    assert_eq!(fetcher.calls(), 8);
    assert_eq!(controller.state().error.as_deref(), Some("boom"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_recovers() {
    let fetcher = Arc::new(
      ScriptedFetcher::succeeding(json!({ "sales": 7 }))
        .then(Err("timeout".to_string()))
        .then(Err("timeout".to_string())),
    );
    let controller = controller(&fetcher)
      .retry_delay(Duration::from_secs(5))
      .build();

    assert!(controller.refresh_now().await);
    assert_eq!(controller.state().error.as_deref(), Some("timeout"));

    sleep(Duration::from_secs(11)).await;

    assert_eq!(fetcher.calls(), 3);
    let state = controller.state();
    assert_eq!(state.error, None);
    assert_eq!(state.data.unwrap().payload, json!({ "sales": 7 }));

    // Success leaves nothing scheduled
    sleep(Duration::from_secs(60)).await;
    assert_eq!(fetcher.calls(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_during_fetch_prevents_retry() {
    let fetcher =
      Arc::new(ScriptedFetcher::failing("boom").with_delay(Duration::from_millis(100)));
    let controller = controller(&fetcher)
      .retry_delay(Duration::from_secs(5))
      .build();

    let running = {
      let controller = controller.clone();
      tokio::spawn(async move { controller.refresh_now().await })
    };
    sleep(Duration::from_millis(10)).await;
    controller.stop();

    assert!(running.await.unwrap());
    sleep(Duration::from_secs(3600)).await;

    assert_eq!(fetcher.calls(), 1);
    let state = controller.state();
    assert!(!state.loading);
    assert_eq!(state.error.as_deref(), Some("boom"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_voids_tick_that_has_not_started() {
    let fetcher = Arc::new(ScriptedFetcher::failing("boom"));
    let controller = controller(&fetcher)
      .retry_delay(Duration::from_secs(5))
      .build();

    controller.start(Duration::from_secs(3600));
    // Runs after the first tick has queued its fetch but before the fetch is polled
    let stopping = controller.clone();
    tokio::spawn(async move { stopping.stop() }).await.unwrap();
    sleep(Duration::from_secs(60)).await;

    assert!(!controller.is_running());
    assert!(fetcher.calls() <= 1, "fetched {} times after stop", fetcher.calls());
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_timer_after_stop_does_not_fetch() {
    let fetcher = Arc::new(ScriptedFetcher::failing("boom"));
    let controller = controller(&fetcher)
      .retry_delay(Duration::from_secs(5))
      .build();

    // Retry timer fires and queues the retry; stop runs before it is polled
    controller.refresh_now().await;
    sleep(Duration::from_secs(5)).await;
    controller.stop();
    sleep(Duration::from_secs(60)).await;

    assert!(fetcher.calls() <= 2, "fetched {} times after stop", fetcher.calls());
    assert!(!controller.state().loading);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_timeout() {
    let fetcher =
      Arc::new(ScriptedFetcher::succeeding(json!(1)).with_delay(Duration::from_secs(60)));
    let controller = controller(&fetcher)
      .max_retries(0)
      .fetch_timeout(Some(Duration::from_secs(20)))
      .build();

    assert!(controller.refresh_now().await);

    let state = controller.state();
    assert!(!state.loading);
    assert_eq!(state.error.as_deref(), Some("Request timed out after 20s"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_preferences_feed_fetch_params() {
    let fetcher = Arc::new(ScriptedFetcher::succeeding(json!(1)));
    let controller = controller(&fetcher)
      .preferences(Preferences {
        period: "90d".to_string(),
        auto_refresh: false,
      })
      .build();

    controller.refresh_now().await;
    controller.update_preferences(PreferencesUpdate {
      period: Some("7d".to_string()),
      auto_refresh: None,
    });
    controller.refresh_now().await;

    assert_eq!(fetcher.periods(), vec!["90d".to_string(), "7d".to_string()]);
    assert!(!controller.state().preferences.auto_refresh);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cold_start_and_write_through() {
    let cache = CacheLayer::new(SqliteStorage::open_in_memory().unwrap());
    let cached = Dataset {
      key: "kpis".to_string(),
      retrieved_at: Utc::now(),
      payload: json!({ "sales": 1 }),
    };
    cache.save("kpis", &cached);

    let fetcher = Arc::new(ScriptedFetcher::succeeding(json!({ "sales": 2 })));
    let controller = controller(&fetcher)
      .cache(cache.clone(), Duration::from_secs(300))
      .build();

    let state = controller.state();
    assert_eq!(state.data.unwrap().payload, json!({ "sales": 1 }));
    assert_eq!(state.last_updated, Some(cached.retrieved_at));
    assert_eq!(fetcher.calls(), 0);

    controller.refresh_now().await;

    let stored = cache.load("kpis", Duration::from_secs(300)).unwrap();
    assert_eq!(stored.payload, json!({ "sales": 2 }));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cold_start_ignores_expired_cache() {
    let cache = CacheLayer::new(SqliteStorage::open_in_memory().unwrap());
    let written = Utc::now() - chrono::Duration::minutes(10);
    cache.save_at(
      "kpis",
      &Dataset {
        key: "kpis".to_string(),
        retrieved_at: written,
        payload: json!({ "sales": 1 }),
      },
      written,
    );

    let fetcher = Arc::new(ScriptedFetcher::succeeding(json!(2)));
    let controller = controller(&fetcher)
      .cache(cache.clone(), Duration::from_secs(300))
      .build();

    let state = controller.state();
    assert!(state.data.is_none());
    assert_eq!(state.last_updated, None);
    assert!(cache.load("kpis", Duration::from_secs(300)).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropping_last_handle_ends_polling() {
    let fetcher = Arc::new(ScriptedFetcher::succeeding(json!(1)));
    let controller = controller(&fetcher).build();

    controller.start(Duration::from_secs(10));
    sleep(Duration::from_millis(1)).await;
    drop(controller);

    sleep(Duration::from_secs(100)).await;
    assert_eq!(fetcher.calls(), 1);
  }

  #[test]
  fn test_format_time_since() {
    let now = Utc::now();
    let ago = |seconds: i64| Some(now - chrono::Duration::seconds(seconds));

    assert_eq!(format_time_since(None, now), "Never");
    assert_eq!(format_time_since(ago(0), now), "0s ago");
    assert_eq!(format_time_since(ago(59), now), "59s ago");
    assert_eq!(format_time_since(ago(180), now), "3m ago");
    assert_eq!(format_time_since(ago(2 * 3600 + 59), now), "2h ago");
    assert_eq!(format_time_since(ago(3 * 86400), now), "3d ago");
    assert_eq!(format_time_since(ago(-30), now), "0s ago");
  }
}
