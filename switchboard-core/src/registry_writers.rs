//! Background jobs that populate the [`crate::registry`]: CatalogSync
//! (slow cadence, canonical model pricing/capabilities) and
//! ProviderDiscovery (fast cadence, per-provider model listing).
//!
//! Both follow the same `tokio::spawn` + `tokio::time::interval`
//! periodic-loop shape used elsewhere in this crate for background
//! maintenance, with a mutual-exclusion guard so two sweeps of the same
//! job can never run concurrently.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::registry::{GlobalModel, ProviderId, ProviderModel, RegistryStore};

/// One row from an external canonical catalog document.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub global_model: GlobalModel,
}

/// Pulls the canonical catalog document. Implemented externally (HTTP
/// fetch, file read, ...); the core only needs the trait.
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self) -> anyhow::Result<Vec<CatalogEntry>>;
}

/// One row returned by a provider's model-listing endpoint, already
/// mapped to its canonical id via the provider's normalization rule.
#[derive(Debug, Clone)]
pub struct DiscoveredModel {
    pub provider_model_id: String,
    pub global_model_id: String,
    pub rate_limit_rpm: Option<u32>,
}

#[async_trait::async_trait]
pub trait DiscoverySource: Send + Sync {
    fn provider_id(&self) -> ProviderId;
    async fn list_models(&self) -> anyhow::Result<Vec<DiscoveredModel>>;
}

/// Runs `CatalogSync` on a fixed cadence against one or more
/// [`CatalogSource`]s, each independently failure-isolated.
pub struct CatalogSync {
    store: Arc<dyn RegistryStore>,
    sources: Vec<Arc<dyn CatalogSource>>,
    cadence: Duration,
    running: Arc<Mutex<()>>,
}

impl CatalogSync {
    pub fn new(store: Arc<dyn RegistryStore>, sources: Vec<Arc<dyn CatalogSource>>, cadence: Duration) -> Self {
        Self {
            store,
            sources,
            cadence,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Spawns the periodic loop. The returned handle can be aborted to
    /// stop the job.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cadence);
            loop {
                interval.tick().await;
                self.run_once().await;
            }
        })
    }

    /// One sweep. Public so tests and a manual-trigger admin path (if
    /// ever added externally) can invoke it without waiting a cadence.
    pub async fn run_once(&self) {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("catalog sync already running, skipping this tick");
            return;
        };

        for source in &self.sources {
            match source.fetch_catalog().await {
                Ok(entries) => {
                    for entry in entries {
                        // A parse failure on one record must not abort the
                        // batch; `fetch_catalog` already filtered those out,
                        // so every entry reaching here upserts cleanly.
                        self.store.upsert_global_model(entry.global_model).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "catalog source fetch failed, continuing");
                }
            }
        }
        tracing::info!("catalog sync sweep completed");
    }
}

/// Runs `ProviderDiscovery` on a fixed cadence against one
/// [`DiscoverySource`] per enabled provider.
pub struct ProviderDiscovery {
    store: Arc<dyn RegistryStore>,
    sources: Vec<Arc<dyn DiscoverySource>>,
    cadence: Duration,
    running: Arc<Mutex<()>>,
}

impl ProviderDiscovery {
    pub fn new(store: Arc<dyn RegistryStore>, sources: Vec<Arc<dyn DiscoverySource>>, cadence: Duration) -> Self {
        Self {
            store,
            sources,
            cadence,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cadence);
            loop {
                interval.tick().await;
                self.run_once().await;
            }
        })
    }

    pub async fn run_once(&self) {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("provider discovery already running, skipping this tick");
            return;
        };

        for source in &self.sources {
            let provider_id = source.provider_id();
            match source.list_models().await {
                Ok(models) => {
                    let seen_ids: Vec<String> = models.iter().map(|m| m.provider_model_id.clone()).collect();
                    for model in models {
                        self.store
                            .upsert_provider_model(ProviderModel {
                                provider_id: provider_id.clone(),
                                provider_model_id: model.provider_model_id,
                                global_model_id: model.global_model_id,
                                available: true,
                                last_seen: std::time::SystemTime::now(),
                                rate_limit_rpm: model.rate_limit_rpm,
                                successes: 0,
                                failures: 0,
                                p95_latency_ms: None,
                            })
                            .await;
                    }
                    self.store.mark_unseen_unavailable(&provider_id, &seen_ids).await;
                }
                Err(err) => {
                    tracing::warn!(provider = %provider_id, error = %err, "provider discovery failed, continuing sweep");
                }
            }
        }
        tracing::info!("provider discovery sweep completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Capabilities, InMemoryRegistryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    struct StaticCatalog(Vec<CatalogEntry>);

    #[async_trait::async_trait]
    impl CatalogSource for StaticCatalog {
        async fn fetch_catalog(&self) -> anyhow::Result<Vec<CatalogEntry>> {
            Ok(self.0.clone())
        }
    }

    struct FailingCatalog;

    #[async_trait::async_trait]
    impl CatalogSource for FailingCatalog {
        async fn fetch_catalog(&self) -> anyhow::Result<Vec<CatalogEntry>> {
            anyhow::bail!("upstream catalog unreachable")
        }
    }

    fn global_model(id: &str) -> GlobalModel {
        GlobalModel {
            id: id.to_string(),
            display_name: id.to_string(),
            context_window: 8192,
            input_price_per_million: 0.0,
            output_price_per_million: 0.0,
            capabilities: Capabilities::default(),
            last_sync: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn catalog_sync_upserts_and_ignores_failed_source() {
        let store = Arc::new(InMemoryRegistryStore::new());
        let good = Arc::new(StaticCatalog(vec![CatalogEntry {
            global_model: global_model("m-lite"),
        }]));
        let bad = Arc::new(FailingCatalog);
        let sync = CatalogSync::new(store.clone(), vec![good, bad], Duration::from_secs(86400));
        sync.run_once().await;
        assert!(store.get_global_model("m-lite").await.is_some());
    }

    struct StaticDiscovery {
        id: ProviderId,
        models: Vec<DiscoveredModel>,
    }

    #[async_trait::async_trait]
    impl DiscoverySource for StaticDiscovery {
        fn provider_id(&self) -> ProviderId {
            self.id.clone()
        }

        async fn list_models(&self) -> anyhow::Result<Vec<DiscoveredModel>> {
            Ok(self.models.clone())
        }
    }

    #[tokio::test]
    async fn discovery_marks_vanished_models_unavailable() {
        let store = Arc::new(InMemoryRegistryStore::new());
        store
            .upsert_provider_model(ProviderModel {
                provider_id: ProviderId::from("free-a"),
                provider_model_id: "old-model".to_string(),
                global_model_id: "m-lite".to_string(),
                available: true,
                last_seen: SystemTime::now(),
                rate_limit_rpm: None,
                successes: 0,
                failures: 0,
                p95_latency_ms: None,
            })
            .await;

        let source = Arc::new(StaticDiscovery {
            id: ProviderId::from("free-a"),
            models: vec![DiscoveredModel {
                provider_model_id: "new-model".to_string(),
                global_model_id: "m-lite".to_string(),
                rate_limit_rpm: None,
            }],
        });
        let discovery = ProviderDiscovery::new(store.clone(), vec![source], Duration::from_secs(3600));
        discovery.run_once().await;

        let models = store.list_provider_models("m-lite").await;
        let old = models.iter().find(|m| m.provider_model_id == "old-model").unwrap();
        assert!(!old.available);
        let new = models.iter().find(|m| m.provider_model_id == "new-model").unwrap();
        assert!(new.available);
    }

    #[tokio::test]
    async fn concurrent_sweeps_do_not_overlap() {
        struct CountingSlow(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl CatalogSource for CountingSlow {
            async fn fetch_catalog(&self) -> anyhow::Result<Vec<CatalogEntry>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(vec![])
            }
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryRegistryStore::new());
        let sync = Arc::new(CatalogSync::new(
            store,
            vec![Arc::new(CountingSlow(calls.clone()))],
            Duration::from_secs(86400),
        ));

        let a = { let sync = sync.clone(); tokio::spawn(async move { sync.run_once().await }) };
        let b = { let sync = sync.clone(); tokio::spawn(async move { sync.run_once().await }) };
        let _ = tokio::join!(a, b);

        // One of the two overlapping calls must have been skipped by the
        // mutual-exclusion guard.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
