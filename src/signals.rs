//! Middleware signal dispatch (`spec.md` §4.7).
//!
//! `onUsable` observers run serially and may short-circuit the request
//! (e.g. by rejecting it through the [`crate::context::Context`] they're
//! handed); `onComplete` observers run after the response has been decided
//! and always run to completion, in parallel, regardless of whether any of
//! them fails.

use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::error::GatewayError;

/// A serial, short-circuiting observer invoked once the request's service
/// and path are known but before a backend has been chosen.
pub trait UsableObserver: Send + Sync {
    fn on_usable<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// A parallel observer invoked after the response has been fully decided.
/// Its failure doesn't change the response already sent; it's surfaced to
/// the caller of [`dispatch_complete`] purely for logging.
pub trait CompleteObserver: Send + Sync {
    fn on_complete<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Runs `observers` one at a time, in order, stopping at the first one
/// that errors. The controller re-checks [`Context::status`] between
/// observers since the spec requires dropping out of the pipeline the
/// moment a request is no longer `Pending`.
pub async fn dispatch_usable(
    observers: &[Box<dyn UsableObserver>],
    ctx: &Context,
) -> Result<(), GatewayError> {
    use crate::context::LifecycleStatus;

    for observer in observers {
        if !matches!(ctx.status(), LifecycleStatus::Pending) {
            break;
        }
        observer
            .on_usable(ctx)
            .await
            .map_err(|inner| GatewayError::UsableSignalFailure { inner })?;
    }
    Ok(())
}

/// Runs every observer concurrently to completion, collecting the first
/// failure (if any) without letting one observer's error cancel the
/// others.
pub async fn dispatch_complete(
    observers: &[Box<dyn CompleteObserver>],
    ctx: &Context,
) -> Result<(), GatewayError> {
    let results = futures_util::future::join_all(observers.iter().map(|o| o.on_complete(ctx))).await;
    for result in results {
        if let Err(inner) = result {
            return Err(GatewayError::CompleteSignalFailure { inner });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextRequest, LifecycleStatus};
    use axum::http::{HeaderMap, Method};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx() -> Context {
        Context::new(ContextRequest {
            method: Method::GET,
            url: "/foo.git/info/refs?service=git-upload-pack".parse().unwrap(),
            headers: HeaderMap::new(),
            body: Box::pin(tokio_stream::iter(std::iter::empty::<std::io::Result<bytes::Bytes>>())),
            advertisement: None,
            path: None,
            service: None,
        })
    }

    struct CountingUsable(Arc<AtomicUsize>);
    impl UsableObserver for CountingUsable {
        fn on_usable<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, anyhow::Result<()>> {
            let counter = self.0.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct RejectingUsable;
    impl UsableObserver for RejectingUsable {
        fn on_usable<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                ctx.transition(LifecycleStatus::Rejected);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn usable_observers_run_serially_and_stop_on_rejection() {
        let context = ctx();
        let counter = Arc::new(AtomicUsize::new(0));
        let observers: Vec<Box<dyn UsableObserver>> = vec![
            Box::new(CountingUsable(counter.clone())),
            Box::new(RejectingUsable),
            Box::new(CountingUsable(counter.clone())),
        ];

        dispatch_usable(&observers, &context).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(context.status(), LifecycleStatus::Rejected);
    }

    struct FailingUsable;
    impl UsableObserver for FailingUsable {
        fn on_usable<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move { anyhow::bail!("boom") })
        }
    }

    #[tokio::test]
    async fn usable_observer_failure_wraps_as_usable_signal_failure() {
        let context = ctx();
        let observers: Vec<Box<dyn UsableObserver>> = vec![Box::new(FailingUsable)];
        let err = dispatch_usable(&observers, &context).await.unwrap_err();
        assert!(matches!(err, GatewayError::UsableSignalFailure { .. }));
    }

    struct CountingComplete(Arc<AtomicUsize>);
    impl CompleteObserver for CountingComplete {
        fn on_complete<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, anyhow::Result<()>> {
            let counter = self.0.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn complete_observers_all_run_even_if_one_fails() {
        let context = ctx();
        let counter = Arc::new(AtomicUsize::new(0));
        let observers: Vec<Box<dyn CompleteObserver>> = vec![
            Box::new(CountingComplete(counter.clone())),
            Box::new(FailingComplete),
            Box::new(CountingComplete(counter.clone())),
        ];

        let err = dispatch_complete(&observers, &context).await.unwrap_err();
        assert!(matches!(err, GatewayError::CompleteSignalFailure { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    struct FailingComplete;
    impl CompleteObserver for FailingComplete {
        fn on_complete<'a>(&'a self, _ctx: &'a Context) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move { anyhow::bail!("boom") })
        }
    }
}
