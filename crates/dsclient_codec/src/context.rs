//! Ambient context carried explicitly through every operation.
//!
//! A [`Context`] is an immutable chain of nodes. Deriving a context never
//! mutates its parent; cancellation is signalled through a shared flag owned
//! by the [`CancelHandle`] returned from [`Context::with_cancel`].

use crate::error::{DsError, DsResult};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An immutable, cheaply cloneable ambient context.
#[derive(Clone, Default)]
pub struct Context {
    node: Option<Arc<Node>>,
}

struct Node {
    parent: Context,
    kind: NodeKind,
}

enum NodeKind {
    Cancel(Arc<CancelState>),
    Deadline(Instant),
    Value(TypeId, Arc<dyn Any + Send + Sync>),
    Detached,
}

#[derive(Default)]
struct CancelState {
    canceled: AtomicBool,
}

/// Cancels the context it was created with, and every context derived from it.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Cancels the associated context.
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`CancelHandle::cancel`] was called.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl Context {
    /// Returns the empty root context. It is never canceled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    fn derive(&self, kind: NodeKind) -> Self {
        Self {
            node: Some(Arc::new(Node {
                parent: self.clone(),
                kind,
            })),
        }
    }

    /// Derives a cancellable context.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let state = Arc::new(CancelState::default());
        let ctx = self.derive(NodeKind::Cancel(Arc::clone(&state)));
        (ctx, CancelHandle { state })
    }

    /// Derives a context that expires at `deadline`.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.derive(NodeKind::Deadline(deadline))
    }

    /// Derives a context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context carrying `value`, retrievable by its type.
    ///
    /// A later value of the same type shadows earlier ones.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        self.derive(NodeKind::Value(TypeId::of::<T>(), Arc::new(value)))
    }

    /// Derives a context that keeps every value but drops cancellation and
    /// deadlines of its ancestors.
    #[must_use]
    pub fn without_cancel(&self) -> Self {
        self.derive(NodeKind::Detached)
    }

    /// Returns the innermost value of type `T`, if any.
    #[must_use]
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        let wanted = TypeId::of::<T>();
        let mut current = self.node.as_deref();
        while let Some(node) = current {
            if let NodeKind::Value(id, value) = &node.kind {
                if *id == wanted {
                    return value.downcast_ref::<T>();
                }
            }
            current = node.parent.node.as_deref();
        }
        None
    }

    /// Returns the earliest deadline that applies to this context.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut current = self.node.as_deref();
        while let Some(node) = current {
            match &node.kind {
                NodeKind::Deadline(at) => {
                    earliest = Some(earliest.map_or(*at, |e| e.min(*at)));
                }
                NodeKind::Detached => break,
                _ => {}
            }
            current = node.parent.node.as_deref();
        }
        earliest
    }

    /// Returns why the context is done, or `None` while it is live.
    #[must_use]
    pub fn err(&self) -> Option<DsError> {
        let now = Instant::now();
        let mut current = self.node.as_deref();
        while let Some(node) = current {
            match &node.kind {
                NodeKind::Cancel(state) if state.canceled.load(Ordering::SeqCst) => {
                    return Some(DsError::Canceled);
                }
                NodeKind::Deadline(at) if *at <= now => return Some(DsError::DeadlineExceeded),
                NodeKind::Detached => return None,
                _ => {}
            }
            current = node.parent.node.as_deref();
        }
        None
    }

    /// Returns `Err` when the context is done.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::Canceled`] or [`DsError::DeadlineExceeded`].
    pub fn check(&self) -> DsResult<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 0usize;
        let mut current = self.node.as_deref();
        while let Some(node) = current {
            depth += 1;
            current = node.parent.node.as_deref();
        }
        f.debug_struct("Context")
            .field("depth", &depth)
            .field("deadline", &self.deadline())
            .field("err", &self.err())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_live() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn cancel_propagates_to_children() {
        let (parent, handle) = Context::background().with_cancel();
        let child = parent.with_value(7u32);
        assert!(child.err().is_none());

        handle.cancel();
        assert_eq!(parent.err(), Some(DsError::Canceled));
        assert_eq!(child.err(), Some(DsError::Canceled));
    }

    #[test]
    fn expired_deadline_reports_error() {
        let ctx = Context::background().with_deadline(Instant::now());
        assert_eq!(ctx.err(), Some(DsError::DeadlineExceeded));

        let later = Context::background().with_timeout(Duration::from_secs(3600));
        assert!(later.err().is_none());
        assert!(later.deadline().is_some());
    }

    #[test]
    fn values_shadow_by_type() {
        let ctx = Context::background()
            .with_value(String::from("outer"))
            .with_value(5i64)
            .with_value(String::from("inner"));
        assert_eq!(ctx.value::<String>().map(String::as_str), Some("inner"));
        assert_eq!(ctx.value::<i64>(), Some(&5));
        assert!(ctx.value::<u8>().is_none());
    }

    #[test]
    fn without_cancel_keeps_values_drops_cancellation() {
        let (ctx, handle) = Context::background().with_value(1u8).with_cancel();
        handle.cancel();
        let detached = ctx.without_cancel();
        assert!(detached.err().is_none());
        assert_eq!(detached.value::<u8>(), Some(&1));

        let expired = Context::background()
            .with_deadline(Instant::now())
            .without_cancel();
        assert!(expired.err().is_none());
        assert!(expired.deadline().is_none());
    }
}
