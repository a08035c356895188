//! Per-service connect/disconnect state machine with readiness signaling.
//!
//! Every backend service (index, cache, chat engine) owns a [`Lifecycle`]
//! and implements [`Service`]. The trait's default methods implement the
//! state machine once; implementors only provide the service-specific
//! `acquire`/`release` pair and their upstream dependency list.
//!
//! Readiness is a one-shot, level-triggered gate: once raised, all current
//! and future waiters proceed immediately; only `disconnect` clears it.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

/// Connection state of one service. Exactly one at a time; the transition
/// into `Connecting` is exclusive even under concurrent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Disconnected,
    Connecting,
    Connected,
}

/// State holder shared by every service implementation.
pub struct Lifecycle {
    name: String,
    state: Mutex<ServiceState>,
    ready: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            name: name.into(),
            state: Mutex::new(ServiceState::Disconnected),
            ready,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> ServiceState {
        *self.state.lock().await
    }

    /// Suspend until the readiness signal is raised. Level-triggered:
    /// returns immediately if already raised.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}

/// A connectable backend service, possibly waiting on upstream services.
///
/// `connect` never initiates upstream connects; a supervisor connects all
/// services in topological order at startup, and compound services only
/// *wait* for their upstreams' readiness.
#[async_trait]
pub trait Service: Send + Sync {
    fn lifecycle(&self) -> &Lifecycle;

    /// Upstream services whose readiness must precede this service's own
    /// acquisition. Empty for leaf services.
    fn dependencies(&self) -> Vec<Arc<dyn Service>> {
        Vec::new()
    }

    /// Service-specific resource acquisition. Runs at most once per
    /// connect cycle, after all upstreams are ready.
    async fn acquire(&self) -> Result<(), ConnectionError>;

    /// Service-specific resource release.
    async fn release(&self);

    fn name(&self) -> &str {
        self.lifecycle().name()
    }

    /// Drive the service to `Connected`.
    ///
    /// No-op when already `Connected` or `Connecting` — concurrent callers
    /// perform exactly one underlying acquisition. On failure the state
    /// rolls back to `Disconnected`; the machine is never left stuck in
    /// `Connecting`.
    async fn connect(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.lifecycle().state.lock().await;
            match *state {
                ServiceState::Connected | ServiceState::Connecting => return Ok(()),
                ServiceState::Disconnected => *state = ServiceState::Connecting,
            }
        }
        debug!(service = self.name(), "connecting");

        let deps = self.dependencies();
        if !deps.is_empty() {
            join_all(deps.iter().map(|d| d.wait_for_connection())).await;
        }

        match self.acquire().await {
            Ok(()) => {
                let mut state = self.lifecycle().state.lock().await;
                *state = ServiceState::Connected;
                self.lifecycle().ready.send_replace(true);
                info!(service = self.name(), "connected");
                Ok(())
            }
            Err(e) => {
                let mut state = self.lifecycle().state.lock().await;
                *state = ServiceState::Disconnected;
                warn!(service = self.name(), error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Release resources and clear readiness. No-op unless `Connected`.
    async fn disconnect(&self) {
        {
            let mut state = self.lifecycle().state.lock().await;
            if *state != ServiceState::Connected {
                return;
            }
            *state = ServiceState::Disconnected;
        }
        self.release().await;
        self.lifecycle().ready.send_replace(false);
        info!(service = self.name(), "disconnected");
    }

    /// Suspend until every upstream and then this service is ready.
    /// Does not trigger `connect`.
    async fn wait_for_connection(&self) {
        let deps = self.dependencies();
        if !deps.is_empty() {
            join_all(deps.iter().map(|d| d.wait_for_connection())).await;
        }
        self.lifecycle().wait_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingService {
        lifecycle: Lifecycle,
        acquisitions: AtomicUsize,
        deps: Vec<Arc<dyn Service>>,
        fail: bool,
    }

    impl CountingService {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                lifecycle: Lifecycle::new(name),
                acquisitions: AtomicUsize::new(0),
                deps: Vec::new(),
                fail: false,
            })
        }

        fn with_deps(name: &str, deps: Vec<Arc<dyn Service>>) -> Arc<Self> {
            Arc::new(Self {
                lifecycle: Lifecycle::new(name),
                acquisitions: AtomicUsize::new(0),
                deps,
                fail: false,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                lifecycle: Lifecycle::new(name),
                acquisitions: AtomicUsize::new(0),
                deps: Vec::new(),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Service for CountingService {
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }

        fn dependencies(&self) -> Vec<Arc<dyn Service>> {
            self.deps.clone()
        }

        async fn acquire(&self) -> Result<(), ConnectionError> {
            // Yield so concurrent connect callers overlap with the
            // Connecting window.
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConnectionError::new(self.name(), "simulated failure"));
            }
            Ok(())
        }

        async fn release(&self) {}
    }

    #[tokio::test]
    async fn test_concurrent_connect_acquires_once() {
        let svc = CountingService::new("idx");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = svc.clone();
            handles.push(tokio::spawn(async move { s.connect().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        // Some callers return before readiness; wait for the winner.
        svc.wait_for_connection().await;
        assert_eq!(svc.acquisitions.load(Ordering::SeqCst), 1);
        assert_eq!(svc.lifecycle().state().await, ServiceState::Connected);
    }

    #[tokio::test]
    async fn test_failed_connect_rolls_back_to_disconnected() {
        let svc = CountingService::failing("cache");
        assert!(svc.connect().await.is_err());
        assert_eq!(svc.lifecycle().state().await, ServiceState::Disconnected);
        assert!(!svc.lifecycle().is_ready());

        // A later retry performs the acquisition again.
        assert!(svc.connect().await.is_err());
        assert_eq!(svc.acquisitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_clears_readiness() {
        let svc = CountingService::new("idx");
        svc.connect().await.unwrap();
        assert!(svc.lifecycle().is_ready());

        svc.disconnect().await;
        assert!(!svc.lifecycle().is_ready());
        assert_eq!(svc.lifecycle().state().await, ServiceState::Disconnected);

        // Reconnect acquires again.
        svc.connect().await.unwrap();
        assert_eq!(svc.acquisitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wait_for_connection_blocks_until_upstreams_ready() {
        let upstream = CountingService::new("idx");
        let compound =
            CountingService::with_deps("chat", vec![upstream.clone() as Arc<dyn Service>]);

        let waiter = {
            let c = compound.clone();
            tokio::spawn(async move {
                c.wait_for_connection().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        upstream.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "must also wait for its own readiness");

        compound.connect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish once all services are ready")
            .unwrap();
    }

    #[tokio::test]
    async fn test_readiness_is_level_triggered() {
        let svc = CountingService::new("idx");
        svc.connect().await.unwrap();

        // A waiter arriving after the signal was raised returns immediately.
        tokio::time::timeout(Duration::from_millis(50), svc.wait_for_connection())
            .await
            .expect("late waiter must not block");
    }
}
