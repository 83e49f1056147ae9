//! Per-binding load handle observed by the presentation layer.

use std::fmt;
use std::sync::{Arc, Weak};

use futures_util::{Stream, stream};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use url::Url;

use crate::domain::entities::{CacheKey, LoadPhase, LoadResult};
use crate::domain::errors::LoadError;
use crate::domain::services::KeyResolver;
use crate::infrastructure::image::{FetchCoordinator, WeakFetchCoordinator};

#[derive(Debug, Clone, Default)]
struct PhaseUpdate {
    generation: u64,
    phase: LoadPhase,
}

#[derive(Default)]
struct Binding {
    generation: u64,
    key: Option<CacheKey>,
    url: Option<Url>,
    driver: Option<AbortHandle>,
}

impl Binding {
    fn stop_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

struct SessionShared {
    binding: Mutex<Binding>,
    phase_tx: watch::Sender<PhaseUpdate>,
}

impl SessionShared {
    fn publish(&self, generation: u64, phase: LoadPhase) {
        self.phase_tx.send_replace(PhaseUpdate { generation, phase });
    }

    /// Applies a driver's result if it still belongs to the active binding.
    fn apply(&self, generation: u64, key: &CacheKey, result: LoadResult) {
        let mut binding = self.binding.lock();
        let current = self.phase_tx.borrow().phase.is_terminal();
        if binding.generation != generation || binding.key.as_ref() != Some(key) || current {
            trace!(key = %key, generation, "Discarding result of superseded binding");
            return;
        }
        binding.driver = None;
        debug!(key = %key, ok = result.is_ok(), "Session load finished");
        self.publish(generation, result.into());
    }
}

/// Observable load of one `(url, identifier)` binding.
///
/// The phase moves from `Empty` to `Success` or `Failure` and goes back to
/// `Empty` only when the binding changes or is reloaded. Results of a
/// superseded binding are never applied.
///
/// Methods that start a load spawn onto the current Tokio runtime.
pub struct ImageLoadSession {
    coordinator: WeakFetchCoordinator,
    shared: Arc<SessionShared>,
}

impl ImageLoadSession {
    /// Creates an unbound session.
    #[must_use]
    pub fn new(coordinator: &FetchCoordinator) -> Self {
        let (phase_tx, _) = watch::channel(PhaseUpdate::default());
        Self {
            coordinator: coordinator.downgrade(),
            shared: Arc::new(SessionShared {
                binding: Mutex::new(Binding::default()),
                phase_tx,
            }),
        }
    }

    /// Binds the session to a new image and starts loading it.
    ///
    /// Rebinding the active key keeps a finished or running load and only
    /// remembers the newest URL. A failed load, or one that had no URL to
    /// fetch from, starts over.
    ///
    /// # Errors
    /// Returns [`LoadError::InvalidKey`] when neither input yields a key. The
    /// previous binding is dropped and the phase stays `Empty`.
    pub fn bind(&self, url: Option<Url>, identifier: Option<&str>) -> Result<(), LoadError> {
        let key = KeyResolver::resolve(url.as_ref(), identifier);
        let mut binding = self.shared.binding.lock();

        if let Some(key) = &key
            && binding.key.as_ref() == Some(key)
        {
            let failed = self.shared.phase_tx.borrow().phase.error().is_some();
            let gained_url = binding.url.is_none() && url.is_some();
            if url.is_some() {
                binding.url = url;
            }
            if failed || gained_url {
                self.restart(&mut binding, key.clone());
            } else {
                trace!(key = %key, "Rebound to the active key");
            }
            return Ok(());
        }

        binding.stop_driver();
        binding.generation += 1;
        binding.key = key.clone();
        binding.url = url;
        self.shared.publish(binding.generation, LoadPhase::Empty);

        let Some(key) = key else {
            debug!("Binding has neither url nor identifier");
            return Err(LoadError::InvalidKey);
        };

        debug!(key = %key, generation = binding.generation, "Session bound");
        self.start(&mut binding, key);
        Ok(())
    }

    /// Binds from a raw URL string. An unparsable URL counts as absent.
    ///
    /// # Errors
    /// Same as [`Self::bind`].
    pub fn bind_str(&self, url: Option<&str>, identifier: Option<&str>) -> Result<(), LoadError> {
        let parsed = url.and_then(|raw| Url::parse(raw.trim()).ok());
        self.bind(parsed, identifier)
    }

    /// Restarts the load of the current binding.
    ///
    /// # Errors
    /// Returns [`LoadError::InvalidKey`] if the session is unbound.
    pub fn reload(&self) -> Result<(), LoadError> {
        let mut binding = self.shared.binding.lock();
        let key = binding.key.clone().ok_or(LoadError::InvalidKey)?;
        self.restart(&mut binding, key);
        Ok(())
    }

    fn restart(&self, binding: &mut Binding, key: CacheKey) {
        binding.stop_driver();
        binding.generation += 1;
        self.shared.publish(binding.generation, LoadPhase::Empty);
        debug!(key = %key, generation = binding.generation, "Session reloading");
        self.start(binding, key);
    }

    fn start(&self, binding: &mut Binding, key: CacheKey) {
        let generation = binding.generation;
        let Some(coordinator) = self.coordinator.upgrade() else {
            debug!(key = %key, "Image service is gone");
            self.shared
                .publish(generation, LoadPhase::Failure(LoadError::ServiceUnavailable));
            return;
        };

        let url = binding.url.clone();
        let shared = Arc::downgrade(&self.shared);
        let task = tokio::spawn(drive(coordinator, shared, generation, key, url));
        binding.driver = Some(task.abort_handle());
    }

    /// Current phase.
    #[must_use]
    pub fn current_phase(&self) -> LoadPhase {
        self.shared.phase_tx.borrow().phase.clone()
    }

    /// Key of the active binding.
    #[must_use]
    pub fn active_key(&self) -> Option<CacheKey> {
        self.shared.binding.lock().key.clone()
    }

    /// Phase changes of the current binding.
    ///
    /// Yields the current phase first. Ends after a terminal phase, when the
    /// binding changes, or when the session is dropped.
    pub fn phase_changes(&self) -> impl Stream<Item = LoadPhase> + Send + 'static {
        let mut rx = self.shared.phase_tx.subscribe();
        let first = rx.borrow_and_update().clone();
        let generation = first.generation;

        stream::unfold(
            Some((rx, Some(first.phase))),
            move |state| async move {
                let (mut rx, pending) = state?;
                let phase = match pending {
                    Some(phase) => phase,
                    None => {
                        rx.changed().await.ok()?;
                        let update = rx.borrow_and_update().clone();
                        if update.generation != generation {
                            return None;
                        }
                        update.phase
                    }
                };
                let next = (!phase.is_terminal()).then_some((rx, None));
                Some((phase, next))
            },
        )
    }

    /// Stops a load in progress. The phase becomes `Failure(Cancelled)`.
    ///
    /// A finished load is left as is.
    pub fn cancel(&self) {
        let mut binding = self.shared.binding.lock();
        if binding.driver.is_none() {
            return;
        }
        binding.stop_driver();
        if !self.shared.phase_tx.borrow().phase.is_terminal() {
            debug!(key = ?binding.key, "Session load cancelled");
            self.shared
                .publish(binding.generation, LoadPhase::Failure(LoadError::Cancelled));
        }
    }

    /// Releases the session and cancels any load in progress.
    pub fn dispose(self) {
        trace!(key = ?self.active_key(), "Session disposed");
    }
}

async fn drive(
    coordinator: FetchCoordinator,
    shared: Weak<SessionShared>,
    generation: u64,
    key: CacheKey,
    url: Option<Url>,
) {
    let result = match url {
        Some(url) => coordinator.request(key.clone(), url).await.wait().await,
        None => coordinator
            .lookup(&key)
            .await
            .ok_or(LoadError::MissingUrl),
    };
    drop(coordinator);

    if let Some(shared) = shared.upgrade() {
        shared.apply(generation, &key, result);
    }
}

impl Drop for ImageLoadSession {
    fn drop(&mut self) {
        self.shared.binding.lock().stop_driver();
    }
}

impl fmt::Debug for ImageLoadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoadSession")
            .field("key", &self.active_key())
            .field("phase", &self.current_phase())
            .finish_non_exhaustive()
    }
}
