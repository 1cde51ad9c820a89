//! Network collaborators: the abstract fetcher and sync delivery hook.
//!
//! The engine treats any error from these as "network unavailable".
//! Cancellation is cooperative: dropping a returned future aborts the call,
//! so a timed-out fetch can never reach the cache afterwards.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::error::EngineError;
use crate::http::{Method, RequestDescriptor, ResponseSnapshot};
use crate::sync::{OperationKind, PendingOperation};

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Abstract network access for request interception and pre-population.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &RequestDescriptor) -> BoxFuture<'_, Result<ResponseSnapshot, EngineError>>;
}

/// Delivery hook for pending sync operations, provided by the application.
pub trait Delivery: Send + Sync {
  fn deliver(&self, op: &PendingOperation) -> BoxFuture<'_, Result<(), EngineError>>;
}

/// Default fetcher backed by a shared reqwest client.
#[derive(Clone, Default)]
pub struct ReqwestFetcher {
  client: reqwest::Client,
}

impl ReqwestFetcher {
  pub fn new() -> Self {
    Self::default()
  }
}

fn reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

impl Fetcher for ReqwestFetcher {
  fn fetch(&self, request: &RequestDescriptor) -> BoxFuture<'_, Result<ResponseSnapshot, EngineError>> {
    let client = self.client.clone();
    let request = request.clone();

    Box::pin(async move {
      let mut builder = client.request(reqwest_method(request.method), request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name, value);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| EngineError::NetworkUnavailable(e.to_string()))?;

      let status = response.status().as_u16();
      let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| EngineError::NetworkUnavailable(e.to_string()))?
        .to_vec();

      Ok(ResponseSnapshot::new(status, headers, body))
    })
  }
}

/// Delivery that posts pending operations as JSON to per-kind endpoints.
pub struct HttpDelivery {
  client: reqwest::Client,
  endpoints: BTreeMap<OperationKind, String>,
}

impl HttpDelivery {
  pub fn new(endpoints: BTreeMap<OperationKind, String>) -> Self {
    Self {
      client: reqwest::Client::new(),
      endpoints,
    }
  }
}

impl Delivery for HttpDelivery {
  fn deliver(&self, op: &PendingOperation) -> BoxFuture<'_, Result<(), EngineError>> {
    let endpoint = self.endpoints.get(&op.kind).cloned();
    let client = self.client.clone();
    let payload = op.payload.clone();
    let kind = op.kind;

    Box::pin(async move {
      let endpoint = endpoint.ok_or_else(|| {
        EngineError::SyncDeliveryFailure(format!("no endpoint configured for {}", kind.as_str()))
      })?;

      let response = client
        .post(&endpoint)
        .json(&payload)
        .send()
        .await
        .map_err(|e| EngineError::SyncDeliveryFailure(e.to_string()))?;

      if response.status().is_success() {
        Ok(())
      } else {
        Err(EngineError::SyncDeliveryFailure(format!(
          "{} rejected with status {}",
          endpoint,
          response.status()
        )))
      }
    })
  }
}

#[cfg(test)]
pub(crate) mod testing {
  //! Scriptable collaborators shared by strategy, lifecycle, and engine tests.

  use std::collections::HashMap;
  use std::sync::Mutex;
  use std::time::Duration;

  use super::*;

  /// What the mock network does for one URL.
  #[derive(Clone)]
  pub enum MockOutcome {
    Ok(ResponseSnapshot),
    Fail,
    Slow(Duration, ResponseSnapshot),
  }

  /// Fetcher with per-URL scripted outcomes. Unknown URLs fail as offline.
  pub struct MockFetcher {
    routes: Mutex<HashMap<String, MockOutcome>>,
    calls: Mutex<Vec<String>>,
  }

  impl MockFetcher {
    pub fn new() -> Self {
      Self {
        routes: Mutex::new(HashMap::new()),
        calls: Mutex::new(Vec::new()),
      }
    }

    pub fn respond(&self, url: &str, response: ResponseSnapshot) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), MockOutcome::Ok(response));
    }

    pub fn fail(&self, url: &str) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), MockOutcome::Fail);
    }

    pub fn slow(&self, url: &str, delay: Duration, response: ResponseSnapshot) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), MockOutcome::Slow(delay, response));
    }

    /// URLs fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }
  }

  impl Fetcher for MockFetcher {
    fn fetch(&self, request: &RequestDescriptor) -> BoxFuture<'_, Result<ResponseSnapshot, EngineError>> {
      let key = request.cache_key();
      self.calls.lock().unwrap().push(key.clone());
      let outcome = self.routes.lock().unwrap().get(&key).cloned();

      Box::pin(async move {
        match outcome {
          Some(MockOutcome::Ok(resp)) => Ok(resp),
          Some(MockOutcome::Slow(delay, resp)) => {
            tokio::time::sleep(delay).await;
            Ok(resp)
          }
          Some(MockOutcome::Fail) | None => {
            Err(EngineError::NetworkUnavailable("connection refused".to_string()))
          }
        }
      })
    }
  }

  /// Delivery that records delivered ids and optionally fails everything.
  pub struct MockDelivery {
    pub delivered: Mutex<Vec<i64>>,
    fail: bool,
  }

  impl MockDelivery {
    pub fn succeeding() -> Self {
      Self {
        delivered: Mutex::new(Vec::new()),
        fail: false,
      }
    }

    pub fn failing() -> Self {
      Self {
        delivered: Mutex::new(Vec::new()),
        fail: true,
      }
    }

    pub fn delivered_ids(&self) -> Vec<i64> {
      self.delivered.lock().unwrap().clone()
    }
  }

  impl Delivery for MockDelivery {
    fn deliver(&self, op: &PendingOperation) -> BoxFuture<'_, Result<(), EngineError>> {
      let id = op.id;
      let fail = self.fail;
      if !fail {
        self.delivered.lock().unwrap().push(id);
      }

      Box::pin(async move {
        if fail {
          Err(EngineError::SyncDeliveryFailure("unreachable".to_string()))
        } else {
          Ok(())
        }
      })
    }
  }
}
