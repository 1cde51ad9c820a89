//! Lifecycle transitions and background maintenance.
//!
//! A deployment moves through installing -> installed -> activating ->
//! active, and is superseded when a newer version takes over. Install
//! pre-populates tiers, activation garbage-collects tiers from other
//! versions, and periodic triggers flush the sync queue and refresh
//! volatile resources.

use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::http::{canonical_key, RequestDescriptor};
use crate::message::Notice;
use crate::net::{Delivery, Fetcher};
use crate::route::RouteClassifier;
use crate::sync::{OperationKind, SyncQueue};
use crate::tier::{is_current, TierKind, TierStore};

/// Concurrent fetches used for background tier population.
const PREFETCH_CONCURRENCY: usize = 4;

/// Deployment lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  Installed,
  Activating,
  Active,
  Superseded,
}

/// Orchestrates install-time pre-population, activation-time garbage
/// collection, and periodic maintenance against the shared tier store.
pub struct LifecycleManager {
  store: Arc<dyn TierStore>,
  fetcher: Arc<dyn Fetcher>,
  queue: Arc<SyncQueue>,
  delivery: Arc<dyn Delivery>,
  classifier: Arc<RouteClassifier>,
  config: Arc<Config>,
  notices: broadcast::Sender<Notice>,
  state: Mutex<LifecycleState>,
}

impl LifecycleManager {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    store: Arc<dyn TierStore>,
    fetcher: Arc<dyn Fetcher>,
    queue: Arc<SyncQueue>,
    delivery: Arc<dyn Delivery>,
    classifier: Arc<RouteClassifier>,
    config: Arc<Config>,
    notices: broadcast::Sender<Notice>,
  ) -> Self {
    Self {
      store,
      fetcher,
      queue,
      delivery,
      classifier,
      config,
      notices,
      state: Mutex::new(LifecycleState::Installing),
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: LifecycleState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
  }

  /// Mark this deployment as replaced by a newer version. Called by the
  /// embedding application when it swaps engines.
  pub fn supersede(&self) {
    self.set_state(LifecycleState::Superseded);
  }

  /// Install the current version: open every tier, pre-populate critical
  /// resources synchronously, then fill optional sets in the background.
  ///
  /// A failure while caching a critical resource fails the transition;
  /// background population failures are logged and swallowed.
  pub async fn install(&self) -> Result<()> {
    self.set_state(LifecycleState::Installing);
    let version = &self.config.version;

    for kind in TierKind::ALL {
      self.store.open_tier(&kind.versioned(version))?;
    }

    let static_tier = TierKind::Static.versioned(version);
    for path in &self.config.precache.critical {
      let request = self.request_for(path)?;
      let response = self.fetcher.fetch(&request).await?;
      if !response.is_success() {
        return Err(EngineError::NetworkUnavailable(format!(
          "critical resource {path} returned status {}",
          response.status
        )));
      }
      self.store.put(&static_tier, &request.cache_key(), &response)?;
    }

    self.spawn_optional_population();

    self.set_state(LifecycleState::Installed);
    info!(version = %version, "install complete");
    Ok(())
  }

  /// Activate the current version: delete every tier whose version tag does
  /// not match, then notify connected clients.
  pub async fn activate(&self) -> Result<()> {
    self.set_state(LifecycleState::Activating);
    let version = &self.config.version;

    for tier in self.store.list_tiers()? {
      if !is_current(&tier, version) {
        info!(tier = %tier, "deleting tier from another version");
        self.store.delete_tier(&tier)?;
      }
    }

    self.set_state(LifecycleState::Active);
    // A send error only means no client is connected right now.
    let _ = self.notices.send(Notice::activated(version));
    info!(version = %version, "activation complete");
    Ok(())
  }

  /// Periodic or connectivity-triggered maintenance: flush every queue kind
  /// and refresh volatile resources. Best-effort; never fails.
  pub async fn periodic(&self) {
    self.sync_now().await;
    self.refresh_volatile().await;
  }

  /// Flush every queue kind, notifying clients per delivered operation.
  pub async fn sync_now(&self) {
    for kind in OperationKind::ALL {
      let report = self.queue.flush(kind, self.delivery.as_ref()).await;
      for id in report.delivered {
        let _ = self.notices.send(Notice::operation_synced(id));
      }
      if !report.retried.is_empty() || !report.abandoned.is_empty() {
        debug!(
          kind = kind.as_str(),
          retried = report.retried.len(),
          abandoned = report.abandoned.len(),
          "flush left work behind"
        );
      }
    }
  }

  /// Force pre-population of the model-tier subset matching `selector`.
  pub async fn download_pack(&self, selector: &str) {
    let tier = TierKind::Model.versioned(&self.config.version);
    let resources: Vec<&String> = self
      .config
      .precache
      .model
      .iter()
      .filter(|path| path.contains(selector))
      .collect();

    if resources.is_empty() {
      debug!(selector, "no pack resources match");
      return;
    }

    for path in resources {
      self.prefetch_into(&tier, path).await;
    }
  }

  /// Re-fetch volatile-but-cacheable resources, overwriting their entries
  /// unconditionally on success.
  async fn refresh_volatile(&self) {
    for path in &self.config.volatile {
      let path = path.as_str();
      let request = match self.request_for(path) {
        Ok(request) => request,
        Err(e) => {
          warn!(path, error = %e, "volatile resource skipped");
          continue;
        }
      };

      let Some(route) = self.classifier.classify(&request) else {
        continue;
      };
      let tier = route.tier.versioned(&self.config.version);

      match self.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = self.store.put(&tier, &request.cache_key(), &response) {
            warn!(path, error = %e, "volatile refresh write failed");
          }
        }
        Ok(response) => {
          debug!(path, status = response.status, "volatile refresh skipped");
        }
        Err(e) => {
          debug!(path, error = %e, "volatile refresh failed");
        }
      }
    }
  }

  /// Fill the optional tier sets behind the install transition. Detached;
  /// each resource is fetched best-effort with bounded concurrency.
  fn spawn_optional_population(&self) {
    let version = self.config.version.clone();
    let jobs: Vec<(String, String)> = [
      (TierKind::Media, &self.config.precache.media),
      (TierKind::Model, &self.config.precache.model),
      (TierKind::Asset, &self.config.precache.asset),
    ]
    .into_iter()
    .flat_map(|(kind, paths)| {
      let tier = kind.versioned(&version);
      paths.iter().map(move |path| (tier.clone(), path.clone()))
    })
    .collect();

    if jobs.is_empty() {
      return;
    }

    let store = Arc::clone(&self.store);
    let fetcher = Arc::clone(&self.fetcher);
    let config = Arc::clone(&self.config);

    tokio::spawn(async move {
      let total = jobs.len();
      stream::iter(jobs)
        .for_each_concurrent(PREFETCH_CONCURRENCY, |(tier, path)| {
          let store = Arc::clone(&store);
          let fetcher = Arc::clone(&fetcher);
          let config = Arc::clone(&config);
          async move {
            prefetch(store.as_ref(), fetcher.as_ref(), &config, &tier, &path).await;
          }
        })
        .await;
      debug!(total, "background tier population finished");
    });
  }

  async fn prefetch_into(&self, tier: &str, path: &str) {
    prefetch(
      self.store.as_ref(),
      self.fetcher.as_ref(),
      &self.config,
      tier,
      path,
    )
    .await;
  }

  fn request_for(&self, path: &str) -> Result<RequestDescriptor> {
    let url = self
      .config
      .resolve(path)
      .map_err(|e| EngineError::NetworkUnavailable(format!("unresolvable resource {path}: {e}")))?;
    Ok(RequestDescriptor::get(url))
  }
}

/// Fetch one resource into a tier, best-effort.
async fn prefetch(
  store: &dyn TierStore,
  fetcher: &dyn Fetcher,
  config: &Config,
  tier: &str,
  path: &str,
) {
  let url = match config.resolve(path) {
    Ok(url) => url,
    Err(e) => {
      warn!(path, error = %e, "prefetch skipped: unresolvable resource");
      return;
    }
  };

  let request = RequestDescriptor::get(url.clone());
  match fetcher.fetch(&request).await {
    Ok(response) if response.is_success() => {
      if let Err(e) = store.put(tier, &canonical_key(&url), &response) {
        warn!(tier = %tier, path, error = %e, "prefetch write failed");
      }
    }
    Ok(response) => {
      debug!(path, status = response.status, "prefetch skipped non-success");
    }
    Err(e) => {
      debug!(path, error = %e, "prefetch failed");
    }
  }
}
