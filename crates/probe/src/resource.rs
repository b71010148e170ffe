//! Reference-counted lifecycle management for process-wide resources.

use std::io;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

/// How to bring a shared resource up and down.
pub trait Lifecycle: Send + Sync {
    type Output: Clone + Send + Sync;

    /// Name used in logs and errors.
    fn name(&self) -> &str;

    fn start(&self) -> io::Result<Self::Output>;

    fn stop(&self, resource: Self::Output);
}

#[derive(Debug, Error)]
#[error("failed to start {name}: {source}")]
pub struct ResourceError {
    pub name: String,
    #[source]
    pub source: io::Error,
}

impl ResourceError {
    /// True when the resource could not be started for lack of privileges.
    pub fn is_permission_denied(&self) -> bool {
        self.source.kind() == io::ErrorKind::PermissionDenied
    }
}

struct State<T> {
    count: usize,
    current: Option<T>,
}

/// Starts a resource on first acquisition and stops it on last release.
///
/// The count and the resource live under one mutex, so start and stop never
/// interleave.
pub struct ResourceManager<L: Lifecycle> {
    lifecycle: L,
    state: Mutex<State<L::Output>>,
}

impl<L: Lifecycle> ResourceManager<L> {
    pub const fn new(lifecycle: L) -> Self {
        Self { lifecycle, state: Mutex::new(State { count: 0, current: None }) }
    }

    /// Take a reference, starting the resource if nobody holds one.
    ///
    /// A start failure leaves the count untouched.
    pub fn acquire(&self) -> Result<L::Output, ResourceError> {
        let mut state = self.lock();

        if let Some(current) = &state.current {
            let current = current.clone();
            state.count += 1;
            return Ok(current);
        }

        let resource = self.lifecycle.start().map_err(|source| ResourceError {
            name: self.lifecycle.name().to_string(),
            source,
        })?;
        debug!(resource = self.lifecycle.name(), "started shared resource");

        state.current = Some(resource.clone());
        state.count = 1;
        Ok(resource)
    }

    /// Drop a reference, stopping the resource when it was the last one.
    pub fn release(&self) {
        let mut state = self.lock();

        if state.count == 0 {
            warn!(resource = self.lifecycle.name(), "release without matching acquire");
            return;
        }

        state.count -= 1;
        if state.count == 0 {
            if let Some(resource) = state.current.take() {
                self.lifecycle.stop(resource);
                debug!(resource = self.lifecycle.name(), "stopped shared resource");
            }
        }
    }

    /// Acquire a reference released when the guard is dropped.
    pub fn acquire_guard(&self) -> Result<ResourceGuard<'_, L>, ResourceError> {
        let resource = self.acquire()?;
        Ok(ResourceGuard { manager: self, resource })
    }

    /// Check that the resource can be started.
    pub fn test(&self) -> Result<(), ResourceError> {
        self.acquire()?;
        self.release();
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.lifecycle.name()
    }

    /// Number of references currently held.
    pub fn count(&self) -> usize {
        self.lock().count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<L::Output>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds one reference of a [`ResourceManager`].
pub struct ResourceGuard<'a, L: Lifecycle> {
    manager: &'a ResourceManager<L>,
    resource: L::Output,
}

impl<L: Lifecycle> ResourceGuard<'_, L> {
    pub fn get(&self) -> &L::Output {
        &self.resource
    }
}

impl<L: Lifecycle> Drop for ResourceGuard<'_, L> {
    fn drop(&mut self) {
        self.manager.release();
    }
}
