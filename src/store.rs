//! Refresh state and the reducer that is the only way to change it.
//!
//! All mutation goes through [`Store::dispatch`], which swaps the whole state
//! in a single `watch` send. Readers either take a [`Store::snapshot`] or hold
//! a receiver from [`Store::subscribe`]; both only ever see complete states.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use crate::fetcher::Dataset;

/// User-selectable options that shape each fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
  /// Reporting period sent to the data source (e.g. "30d")
  pub period: String,
  /// Whether the dashboard should poll on its own
  pub auto_refresh: bool,
}

impl Default for Preferences {
  fn default() -> Self {
    Self {
      period: "30d".to_string(),
      auto_refresh: true,
    }
  }
}

/// Partial preferences update. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferencesUpdate {
  pub period: Option<String>,
  pub auto_refresh: Option<bool>,
}

/// Everything a consumer needs to render the dashboard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshState {
  /// True while a fetch is in flight
  pub loading: bool,
  /// Reason of the most recent failure, cleared by the next success
  pub error: Option<String>,
  /// Last successfully retrieved dataset, kept across failures
  pub data: Option<Arc<Dataset>>,
  /// When `data` was last replaced
  pub last_updated: Option<DateTime<Utc>>,
  pub preferences: Preferences,
}

/// State transitions understood by [`reduce`].
#[derive(Debug, Clone)]
pub enum Action {
  SetLoading(bool),
  /// New data arrived. Also clears the error, ends loading and stamps `at`.
  SetData {
    data: Arc<Dataset>,
    at: DateTime<Utc>,
  },
  SetError(Option<String>),
  #[allow(dead_code)]
  SetLastUpdated(DateTime<Utc>),
  UpdatePreferences(PreferencesUpdate),
}

/// Compute the next state. Fields not targeted by the action are carried over.
pub fn reduce(state: &RefreshState, action: Action) -> RefreshState {
  match action {
    Action::SetLoading(loading) => RefreshState {
      loading,
      ..state.clone()
    },
    Action::SetData { data, at } => RefreshState {
      loading: false,
      error: None,
      data: Some(data),
      last_updated: Some(at),
      ..state.clone()
    },
    Action::SetError(error) => RefreshState {
      error,
      ..state.clone()
    },
    Action::SetLastUpdated(at) => RefreshState {
      last_updated: Some(at),
      ..state.clone()
    },
    Action::UpdatePreferences(update) => {
      let current = &state.preferences;
      RefreshState {
        preferences: Preferences {
          period: update.period.unwrap_or_else(|| current.period.clone()),
          auto_refresh: update.auto_refresh.unwrap_or(current.auto_refresh),
        },
        ..state.clone()
      }
    }
  }
}

/// Shared holder for [`RefreshState`].
///
/// One store exists per controller; it is handed to consumers through the
/// controller rather than living in a global.
#[derive(Debug)]
pub struct Store {
  tx: watch::Sender<RefreshState>,
}

impl Store {
  pub fn new(initial: RefreshState) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx }
  }

  /// Apply an action through the reducer.
  pub fn dispatch(&self, action: Action) {
    self.tx.send_modify(|state| *state = reduce(state, action));
  }

  /// Mark a fetch as started unless one is already in flight.
  ///
  /// Returns `false` without touching the state if `loading` is already set.
  pub fn begin_fetch(&self) -> bool {
    self.tx.send_if_modified(|state| {
      if state.loading {
        return false;
      }
      *state = reduce(state, Action::SetLoading(true));
      true
    })
  }

  /// Apply a failed fetch: record the reason and end loading, keeping data.
  pub fn fail_fetch(&self, reason: String) {
    self.tx.send_modify(|state| {
      let failed = reduce(state, Action::SetError(Some(reason)));
      *state = reduce(&failed, Action::SetLoading(false));
    });
  }

  /// Current state, cloned out of the channel.
  pub fn snapshot(&self) -> RefreshState {
    self.tx.borrow().clone()
  }

  /// Receiver that is notified after every transition.
  pub fn subscribe(&self) -> watch::Receiver<RefreshState> {
    self.tx.subscribe()
  }
}
