//! Reference-counted context handles
//!
//! A [`ContextHandle`] owns one reference to a built context. Cloning takes
//! another reference, dropping (or [`ContextHandle::release`]) gives one
//! back. When the last reference goes away the payload is freed and the
//! provider's release hook runs, exactly once.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{CMMError, Result};

type Payload = Box<dyn Any + Send + Sync>;
type ReleaseFn = Box<dyn FnOnce(Payload) + Send + Sync>;

struct HandleInner {
    origin: String,
    resource_kind: String,
    size: usize,
    payload: Option<Payload>,
    release: Option<ReleaseFn>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let (Some(payload), Some(release)) = (self.payload.take(), self.release.take()) {
            tracing::debug!(
                "Releasing {} context from '{}' ({} bytes)",
                self.resource_kind,
                self.origin,
                self.size
            );
            release(payload);
        }
    }
}

/// Shared, typed-at-runtime handle to a provider context
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<HandleInner>,
}

impl ContextHandle {
    /// Handle without a release hook; size defaults to `size_of::<T>()`
    pub fn new<T: Any + Send + Sync>(
        origin: impl Into<String>,
        resource_kind: impl Into<String>,
        payload: T,
    ) -> Self {
        Self::builder(origin, resource_kind, payload).build()
    }

    /// Start building a handle with size and release hook
    pub fn builder<T: Any + Send + Sync>(
        origin: impl Into<String>,
        resource_kind: impl Into<String>,
        payload: T,
    ) -> HandleBuilder<T> {
        HandleBuilder {
            origin: origin.into(),
            resource_kind: resource_kind.into(),
            size: std::mem::size_of::<T>(),
            payload,
            release: None,
        }
    }

    /// Id of the provider that built this context
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Resource kind tag, e.g. `lcm2` or `oyDL`
    pub fn resource_kind(&self) -> &str {
        &self.inner.resource_kind
    }

    /// Payload size in bytes as reported by the builder
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of live references to this context
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles refer to the same context
    pub fn same_context(&self, other: &ContextHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Give this reference back, returning how many remain.
    ///
    /// At zero the payload is freed and the release hook runs.
    pub fn release(self) -> usize {
        let remaining = self.ref_count().saturating_sub(1);
        drop(self);
        remaining
    }

    /// Access the payload as `T`, checking the resource kind first
    pub fn downcast<T: Any>(&self, expected_kind: &str) -> Result<&T> {
        if self.inner.resource_kind != expected_kind {
            return Err(CMMError::TypeMismatch {
                expected: expected_kind.to_string(),
                actual: self.inner.resource_kind.clone(),
            });
        }
        self.inner
            .payload
            .as_ref()
            .and_then(|payload| payload.downcast_ref::<T>())
            .ok_or_else(|| CMMError::TypeMismatch {
                expected: std::any::type_name::<T>().to_string(),
                actual: format!("{} payload of another type", self.inner.resource_kind),
            })
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("origin", &self.inner.origin)
            .field("resource_kind", &self.inner.resource_kind)
            .field("size", &self.inner.size)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Builder returned by [`ContextHandle::builder`]
pub struct HandleBuilder<T> {
    origin: String,
    resource_kind: String,
    size: usize,
    payload: T,
    release: Option<Box<dyn FnOnce(T) + Send + Sync>>,
}

impl<T: Any + Send + Sync> HandleBuilder<T> {
    /// Report the payload size in bytes
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Hook run with the payload when the last reference is released
    pub fn on_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce(T) + Send + Sync + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    pub fn build(self) -> ContextHandle {
        let release: Option<ReleaseFn> = self.release.map(|hook| {
            Box::new(move |payload: Payload| {
                if let Ok(typed) = payload.downcast::<T>() {
                    hook(*typed);
                }
            }) as ReleaseFn
        });

        ContextHandle {
            inner: Arc::new(HandleInner {
                origin: self.origin,
                resource_kind: self.resource_kind,
                size: self.size,
                payload: Some(Box::new(self.payload)),
                release,
            }),
        }
    }
}
