//! Process-wide memoization of client factories.
//!
//! A [`ClientFactoryCache`] owns the settings, the registry and the
//! Prometheus registry. [`ClientFactoryCache::get_or_build`] builds each
//! named factory at most once: the map lock is only held to fetch the
//! per-name slot, and same-name callers then block on that slot while one of
//! them builds. Distinct names build in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, warn};

use crate::factory::{ClientFactory, build_client_factory};
use crate::metrics::{Metrics, build_metrics};
use crate::registry::Registry;
use crate::settings::Settings;
use crate::{Error, Result};

type Slot = Arc<OnceLock<std::result::Result<Arc<ClientFactory>, Arc<Error>>>>;

static GLOBAL: OnceLock<ClientFactoryCache> = OnceLock::new();

/// Memoized client factories, keyed by resolved client name.
pub struct ClientFactoryCache {
    settings: Arc<Settings>,
    registry: Arc<Registry>,
    prometheus: prometheus::Registry,
    metrics: Mutex<Option<Metrics>>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for ClientFactoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        f.debug_struct("ClientFactoryCache")
            .field("settings", &self.settings)
            .field("clients", &names)
            .finish_non_exhaustive()
    }
}

impl ClientFactoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(settings: Settings, registry: Registry, prometheus: prometheus::Registry) -> Self {
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            prometheus,
            metrics: Mutex::new(None),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Use already registered metrics instead of building them.
    #[must_use]
    pub fn with_metrics(self, metrics: Metrics) -> Self {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner) = Some(metrics);
        self
    }

    /// Settings the factories are built from.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Registry the identifiers resolve against.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus registry the metrics are registered in.
    #[must_use]
    pub fn prometheus(&self) -> &prometheus::Registry {
        &self.prometheus
    }

    /// Metrics shared by every factory, once built.
    #[must_use]
    pub fn metrics(&self) -> Option<Metrics> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Factory of a named client, `None` meaning the default client.
    ///
    /// The first call for a name builds the factory; later calls return the
    /// same `Arc`. A failed build is reported to every caller waiting on it,
    /// wrapped in [`Error::Construction`], and then forgotten so the next
    /// call builds again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Construction`] wrapping the construction error.
    pub fn get_or_build(&self, name: Option<&str>) -> Result<Arc<ClientFactory>> {
        let name = self.settings.resolve_name(name);
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(name.to_string()).or_default())
        };

        match slot.get_or_init(|| self.build(name).map(Arc::new).map_err(Arc::new)) {
            Ok(factory) => Ok(Arc::clone(factory)),
            Err(err) => {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                if slots.get(name).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    slots.remove(name);
                }
                Err(Error::Construction(Arc::clone(err)))
            }
        }
    }

    fn build(&self, name: &str) -> Result<ClientFactory> {
        let spec = self.settings.client(name)?;
        let metrics = {
            let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            match metrics.as_ref() {
                Some(metrics) => {
                    if !metrics.matches(&spec.metrics) {
                        warn!(
                            client = name,
                            buckets = ?spec.metrics.buckets,
                            hit_cache_buckets = ?spec.metrics.hit_cache_buckets,
                            "metrics already built with other buckets, ignoring this client's metrics settings"
                        );
                    }
                    metrics.clone()
                }
                None => {
                    let built = build_metrics(&spec.metrics, &self.prometheus)?;
                    debug!(client = name, "metrics built");
                    metrics.insert(built).clone()
                }
            }
        };
        build_client_factory(&self.settings, Some(name), &self.registry, Some(&metrics)).inspect_err(
            |err| warn!(client = name, error = %err, "client factory construction failed"),
        )
    }

    /// Install the process-wide cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a cache is already installed.
    pub fn install_global(cache: Self) -> Result<&'static Self> {
        GLOBAL.set(cache).map_err(|_| {
            Error::configuration("a global client factory cache is already installed")
        })?;
        Self::global().ok_or_else(|| Error::configuration("global client factory cache unavailable"))
    }

    /// The process-wide cache, if installed.
    #[must_use]
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert2::{check, let_assert};

    use super::*;
    use crate::factory::tests::{EchoTransport, registry, settings};
    use crate::middleware::PrometheusLayer;
    use crate::registry::builtins;
    use crate::settings::ClientSpec;
    use crate::transport::{Transport, TransportOptions};

    fn counting_registry(builds: &Arc<AtomicUsize>, failures: usize) -> Registry {
        let builds = Arc::clone(builds);
        registry().with_transport(
            "tests.Echo",
            move |_: &TransportOptions| -> Result<Arc<dyn Transport>> {
                if builds.fetch_add(1, Ordering::SeqCst) < failures {
                    // Slow enough for concurrent callers to queue on the slot.
                    std::thread::sleep(Duration::from_millis(100));
                    return Err(Error::configuration("transport unavailable"));
                }
                Ok(Arc::new(EchoTransport))
            },
        )
    }

    #[test]
    fn same_arc_for_repeated_requests() {
        let cache = ClientFactoryCache::new(settings(), registry(), prometheus::Registry::new());
        let_assert!(Ok(first) = cache.get_or_build(None));
        let_assert!(Ok(second) = cache.get_or_build(Some("default")));
        check!(Arc::ptr_eq(&first, &second));
        let_assert!(Ok(alt) = cache.get_or_build(Some("alt_client")));
        check!(!Arc::ptr_eq(&first, &alt));
    }

    #[test]
    fn concurrent_callers_share_one_build() {
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = ClientFactoryCache::new(
            settings(),
            counting_registry(&builds, 0),
            prometheus::Registry::new(),
        );
        let factories = std::thread::scope(|scope| {
            let handles = (0..16)
                .map(|_| scope.spawn(|| cache.get_or_build(Some("alt_client"))))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread").expect("factory"))
                .collect::<Vec<_>>()
        });
        check!(builds.load(Ordering::SeqCst) == 1);
        let_assert!(Some(head) = factories.first());
        check!(factories.iter().all(|factory| Arc::ptr_eq(factory, head)));
    }

    #[test]
    fn failed_build_is_retried() {
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = ClientFactoryCache::new(
            settings(),
            counting_registry(&builds, 1),
            prometheus::Registry::new(),
        );
        let_assert!(Err(err) = cache.get_or_build(None));
        check!(err.to_string() == "configuration error: transport unavailable");
        check!(err.is_construction());
        let_assert!(Ok(_) = cache.get_or_build(None));
        check!(builds.load(Ordering::SeqCst) == 2);
    }

    #[test]
    fn concurrent_callers_share_one_failure() {
        const CALLERS: usize = 8;
        let builds = Arc::new(AtomicUsize::new(0));
        let cache = ClientFactoryCache::new(
            settings(),
            counting_registry(&builds, 1),
            prometheus::Registry::new(),
        );
        let barrier = Barrier::new(CALLERS);
        let results = std::thread::scope(|scope| {
            let handles = (0..CALLERS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get_or_build(None)
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread"))
                .collect::<Vec<_>>()
        });

        check!(builds.load(Ordering::SeqCst) == 1);
        let errors = results
            .into_iter()
            .map(|result| result.expect_err("construction should fail"))
            .collect::<Vec<_>>();
        check!(errors.iter().all(Error::is_construction));
        let_assert!(Some(Error::Construction(head)) = errors.first());
        check!(errors.iter().all(|err| matches!(err, Error::Construction(inner) if Arc::ptr_eq(inner, head))));
    }

    #[test]
    fn unknown_client() {
        let cache = ClientFactoryCache::new(settings(), registry(), prometheus::Registry::new());
        let_assert!(Err(err) = cache.get_or_build(Some("clicli")));
        check!(err.to_string() == "Client clicli does not exists");
        let_assert!(Error::UnknownClient(_) = err.root());
    }

    #[test]
    fn metrics_built_once() {
        let mut spec = ClientSpec::new("static");
        spec.middlewares = vec![builtins::PROMETHEUS.to_string()];
        let settings = settings()
            .with_client("first", spec.clone())
            .with_client("second", spec);
        let cache = ClientFactoryCache::new(settings, registry(), prometheus::Registry::new());

        let_assert!(Ok(first) = cache.get_or_build(Some("first")));
        let_assert!(Ok(second) = cache.get_or_build(Some("second")));
        let_assert!([first] = first.middlewares());
        let_assert!([second] = second.middlewares());
        let_assert!(Some(first) = first.downcast_ref::<PrometheusLayer>());
        let_assert!(Some(second) = second.downcast_ref::<PrometheusLayer>());
        check!(first.metrics().ptr_eq(second.metrics()));
        let_assert!(Some(metrics) = cache.metrics());
        check!(metrics == *first.metrics());
    }

    #[test]
    fn later_metrics_settings_are_ignored() {
        let mut spec = ClientSpec::new("static");
        spec.middlewares = vec![builtins::PROMETHEUS.to_string()];
        let mut other = spec.clone();
        other.metrics.buckets = Some(vec![0.5, 5.0]);
        let settings = settings()
            .with_client("first", spec)
            .with_client("second", other);
        let cache = ClientFactoryCache::new(settings, registry(), prometheus::Registry::new());

        let_assert!(Ok(_) = cache.get_or_build(Some("first")));
        let_assert!(Ok(second) = cache.get_or_build(Some("second")));
        let_assert!([second] = second.middlewares());
        let_assert!(Some(second) = second.downcast_ref::<PrometheusLayer>());
        check!(second.metrics().buckets() == crate::metrics::DEFAULT_BUCKETS);
    }

    #[test]
    fn injected_metrics() {
        let prometheus = prometheus::Registry::new();
        let_assert!(Ok(metrics) = build_metrics(&crate::settings::MetricsSettings::default(), &prometheus));
        let cache = ClientFactoryCache::new(settings(), registry(), prometheus).with_metrics(metrics.clone());
        let_assert!(Ok(_) = cache.get_or_build(None));
        let_assert!(Some(shared) = cache.metrics());
        check!(shared.ptr_eq(&metrics));
    }
}
