//! Explicit resource lifecycle for providers and the membership source.

use thiserror::Error;

use super::{ProviderError, ProviderRegistry};
use crate::membership::MembershipSource;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource context is closed")]
    Closed,

    #[error("resource context is already open")]
    AlreadyOpen,

    #[error("provider '{name}' failed to {action}: {source}")]
    Lifecycle {
        name: String,
        action: &'static str,
        #[source]
        source: ProviderError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Open,
    Closed,
}

/// Owns the feature providers and the membership source.
///
/// Components receive a `&ResourceContext` instead of reaching for global
/// connections. Accessors fail unless the context has been opened and not
/// yet closed.
pub struct ResourceContext {
    registry: ProviderRegistry,
    membership: Box<dyn MembershipSource>,
    state: State,
}

impl ResourceContext {
    pub fn new(registry: ProviderRegistry, membership: Box<dyn MembershipSource>) -> Self {
        Self {
            registry,
            membership,
            state: State::Created,
        }
    }

    /// Connect every provider. On failure, providers connected so far are
    /// disconnected again and the context stays unopened.
    pub fn open(&mut self) -> Result<(), ResourceError> {
        if self.state == State::Open {
            return Err(ResourceError::AlreadyOpen);
        }
        let mut connected = Vec::new();
        let mut failure = None;
        for provider in self.registry.providers_mut() {
            match provider.connect() {
                Ok(()) => connected.push(provider.name().to_string()),
                Err(source) => {
                    failure = Some(ResourceError::Lifecycle {
                        name: provider.name().to_string(),
                        action: "connect",
                        source,
                    });
                    break;
                }
            }
        }
        if let Some(err) = failure {
            for provider in self.registry.providers_mut() {
                if connected.iter().any(|n| n == provider.name()) {
                    if let Err(e) = provider.disconnect() {
                        tracing::warn!(provider = provider.name(), error = %e, "disconnect after failed open");
                    }
                }
            }
            return Err(err);
        }
        self.state = State::Open;
        tracing::info!(providers = connected.len(), "resource context opened");
        Ok(())
    }

    /// Disconnect every provider. Closing twice is a no-op.
    ///
    /// All providers are disconnected even when one fails; the first failure is returned.
    pub fn close(&mut self) -> Result<(), ResourceError> {
        if self.state != State::Open {
            self.state = State::Closed;
            return Ok(());
        }
        self.state = State::Closed;
        let mut first_error = None;
        for provider in self.registry.providers_mut() {
            if let Err(source) = provider.disconnect() {
                tracing::warn!(provider = provider.name(), error = %source, "disconnect failed");
                first_error.get_or_insert(ResourceError::Lifecycle {
                    name: provider.name().to_string(),
                    action: "disconnect",
                    source,
                });
            }
        }
        tracing::info!("resource context closed");
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    pub fn registry(&self) -> Result<&ProviderRegistry, ResourceError> {
        self.ensure_open()?;
        Ok(&self.registry)
    }

    pub fn membership(&self) -> Result<&dyn MembershipSource, ResourceError> {
        self.ensure_open()?;
        Ok(self.membership.as_ref())
    }

    fn ensure_open(&self) -> Result<(), ResourceError> {
        match self.state {
            State::Open => Ok(()),
            State::Created | State::Closed => Err(ResourceError::Closed),
        }
    }
}

impl Drop for ResourceContext {
    fn drop(&mut self) {
        if self.state == State::Open {
            if let Err(err) = self.close() {
                tracing::warn!(%err, "error closing resource context on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::DataFrame;
    use crate::membership::StaticMembershipSource;
    use crate::provider::{FeatureProvider, FeatureRequest};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        name: &'static str,
        connects: Arc<AtomicUsize>,
        fail: bool,
    }

    impl FeatureProvider for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn features(&self) -> Vec<String> {
            Vec::new()
        }

        fn fetch(&self, _request: &FeatureRequest) -> Result<DataFrame, ProviderError> {
            Ok(DataFrame::default())
        }

        fn connect(&mut self) -> Result<(), ProviderError> {
            if self.fail {
                return Err(ProviderError::AuthenticationRequired("no key".into()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), ProviderError> {
            self.connects.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context(fail_second: bool) -> (ResourceContext, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let mut registry = ProviderRegistry::new();
        registry
            .register(Box::new(Counting {
                name: "a",
                connects: connects.clone(),
                fail: false,
            }))
            .unwrap();
        registry
            .register(Box::new(Counting {
                name: "b",
                connects: connects.clone(),
                fail: fail_second,
            }))
            .unwrap();
        let ctx = ResourceContext::new(registry, Box::new(StaticMembershipSource::default()));
        (ctx, connects)
    }

    #[test]
    fn accessors_require_open_context() {
        let (mut ctx, connects) = context(false);
        assert!(matches!(ctx.registry(), Err(ResourceError::Closed)));
        ctx.open().unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert!(ctx.registry().is_ok());
        assert!(ctx.membership().is_ok());
        assert!(matches!(ctx.open(), Err(ResourceError::AlreadyOpen)));
        ctx.close().unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert!(matches!(ctx.membership(), Err(ResourceError::Closed)));
        ctx.close().unwrap();
    }

    #[test]
    fn failed_open_rolls_back() {
        let (mut ctx, connects) = context(true);
        let err = ctx.open().unwrap_err();
        assert!(matches!(err, ResourceError::Lifecycle { ref name, .. } if name == "b"));
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert!(!ctx.is_open());
    }

    #[test]
    fn drop_closes_open_context() {
        let (mut ctx, connects) = context(false);
        ctx.open().unwrap();
        drop(ctx);
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }
}
