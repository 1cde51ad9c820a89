//! Engine facade wiring the classifier, executor, tiers, queue, and
//! lifecycle together.
//!
//! One engine instance spans the life of the worker process and owns the
//! injected configuration tables. Every intercepted request resolves to
//! exactly one response; failures inside are recovered or logged, never
//! surfaced to the request boundary.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::http::{RequestDescriptor, ResponseSnapshot};
use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::message::{ClientMessage, Notice};
use crate::net::{Delivery, Fetcher, HttpDelivery, ReqwestFetcher};
use crate::route::RouteClassifier;
use crate::strategy::StrategyExecutor;
use crate::sync::{OperationKind, SyncQueue};
use crate::tier::{is_current, SqliteTierStore, TierStatus, TierStore};

/// Buffered notices per client subscription.
const NOTICE_CAPACITY: usize = 64;

/// The offline request-interception engine.
pub struct Engine {
  config: Arc<Config>,
  classifier: Arc<RouteClassifier>,
  executor: StrategyExecutor,
  store: Arc<dyn TierStore>,
  queue: Arc<SyncQueue>,
  fetcher: Arc<dyn Fetcher>,
  lifecycle: LifecycleManager,
  notices: broadcast::Sender<Notice>,
}

impl Engine {
  /// Wire an engine from explicit collaborators.
  pub fn new(
    config: Config,
    store: Arc<dyn TierStore>,
    queue: Arc<SyncQueue>,
    fetcher: Arc<dyn Fetcher>,
    delivery: Arc<dyn Delivery>,
  ) -> Self {
    let config = Arc::new(config);
    let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
    let classifier = Arc::new(RouteClassifier::new(
      config.routing.clone(),
      config.endpoints.clone(),
    ));
    let executor = StrategyExecutor::new(Arc::clone(&store), Arc::clone(&fetcher), &config);
    let lifecycle = LifecycleManager::new(
      Arc::clone(&store),
      Arc::clone(&fetcher),
      Arc::clone(&queue),
      delivery,
      Arc::clone(&classifier),
      Arc::clone(&config),
      notices.clone(),
    );

    Self {
      config,
      classifier,
      executor,
      store,
      queue,
      fetcher,
      lifecycle,
      notices,
    }
  }

  /// Open an engine with the default durable stores and HTTP collaborators.
  pub fn open(config: Config) -> color_eyre::Result<Self> {
    let store: Arc<dyn TierStore> = Arc::new(SqliteTierStore::open()?);
    let queue = Arc::new(SyncQueue::open(config.sync.max_attempts)?);
    let fetcher: Arc<dyn Fetcher> = Arc::new(ReqwestFetcher::new());
    let delivery: Arc<dyn Delivery> = Arc::new(HttpDelivery::new(config.sync.endpoints.clone()));

    Ok(Self::new(config, store, queue, fetcher, delivery))
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Subscribe to broadcast notices.
  pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
    self.notices.subscribe()
  }

  pub fn lifecycle_state(&self) -> LifecycleState {
    self.lifecycle.state()
  }

  /// Handle one intercepted request. Exactly one response, never an error.
  ///
  /// GET requests are classified and run through their strategy; everything
  /// else bypasses interception and goes straight to the network.
  pub async fn handle(&self, request: &RequestDescriptor) -> ResponseSnapshot {
    match self.classifier.classify(request) {
      Some(route) => self.executor.execute(request, &route).await,
      None => self.passthrough(request).await,
    }
  }

  async fn passthrough(&self, request: &RequestDescriptor) -> ResponseSnapshot {
    match self.fetcher.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!(key = %request.cache_key(), error = %e, "passthrough fetch failed");
        ResponseSnapshot::offline()
      }
    }
  }

  /// Queue a client-originated write for later delivery.
  pub fn save_offline(&self, kind: OperationKind, payload: serde_json::Value) -> Result<i64> {
    self.queue.enqueue(kind, payload)
  }

  /// Number of queued operations of one kind.
  pub fn pending_operations(&self, kind: OperationKind) -> Result<u64> {
    self.queue.pending(kind)
  }

  /// Per-tier entry counts.
  pub fn cache_status(&self) -> Result<Vec<TierStatus>> {
    let mut per_tier = Vec::new();
    for name in self.store.list_tiers()? {
      let size = self.store.tier_size(&name).unwrap_or(0);
      per_tier.push(TierStatus { name, size });
    }
    Ok(per_tier)
  }

  pub async fn install(&self) -> Result<()> {
    self.lifecycle.install().await
  }

  pub async fn activate(&self) -> Result<()> {
    self.lifecycle.activate().await
  }

  /// External periodic trigger (timer or connectivity restored).
  pub async fn periodic(&self) {
    self.lifecycle.periodic().await;
  }

  /// Dispatch one control message from a client. Fire-and-forget: failures
  /// are logged, and results flow back through the notice channel.
  pub async fn handle_message(&self, message: ClientMessage) {
    match message {
      ClientMessage::SkipWaiting => {
        if let Err(e) = self.lifecycle.activate().await {
          warn!(error = %e, "skip-waiting activation failed");
        }
      }
      ClientMessage::ClearCache => self.clear_stale_tiers(),
      ClientMessage::SaveOffline { kind, payload } => match self.queue.enqueue(kind, payload) {
        Ok(id) => debug!(id, kind = kind.as_str(), "operation queued"),
        Err(e) => warn!(kind = kind.as_str(), error = %e, "failed to queue operation"),
      },
      ClientMessage::GetCacheStatus => self.broadcast_cache_status(),
      ClientMessage::SyncNow => self.lifecycle.sync_now().await,
      ClientMessage::DownloadPack { selector } => self.lifecycle.download_pack(&selector).await,
    }
  }

  /// Drop tiers left over from other versions.
  fn clear_stale_tiers(&self) {
    let tiers = match self.store.list_tiers() {
      Ok(tiers) => tiers,
      Err(e) => {
        warn!(error = %e, "cache clear skipped: enumeration failed");
        return;
      }
    };

    for tier in tiers {
      if !is_current(&tier, &self.config.version) {
        if let Err(e) = self.store.delete_tier(&tier) {
          warn!(tier = %tier, error = %e, "failed to delete tier");
        }
      }
    }
  }

  fn broadcast_cache_status(&self) {
    match self.cache_status() {
      Ok(per_tier) => {
        let _ = self.notices.send(Notice::cache_status(per_tier));
      }
      Err(e) => warn!(error = %e, "cache status unavailable"),
    }
  }
}
