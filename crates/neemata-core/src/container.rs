// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scoped dependency-injection container.
//!
//! A container resolves providers at its own scope, delegates shallower
//! scopes to its ancestors, and caches one instance per provider for its
//! lifetime. Disposal runs children first, then the container's own
//! instances in reverse resolution order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, watch};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::provider::{AnyProvider, FactoryContext, Instance, Provider, ProviderId};
use crate::scope::Scope;

type Completion = watch::Receiver<Option<Result<Instance>>>;

enum Slot {
    Ready(Instance),
    Pending(Completion),
}

#[derive(Default)]
struct ContainerState {
    instances: HashMap<ProviderId, Slot>,
    disposal_order: Vec<AnyProvider>,
    children: Vec<Weak<ContainerInner>>,
    disposed: bool,
}

struct ContainerInner {
    scope: Scope,
    parent: Option<Container>,
    state: Mutex<ContainerState>,
}

/// A scoped resolver for providers.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// Create a root container (normally [`Scope::Global`]).
    pub fn new(scope: Scope) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                scope,
                parent: None,
                state: Mutex::new(ContainerState::default()),
            }),
        }
    }

    pub fn scope(&self) -> Scope {
        self.inner.scope
    }

    fn parent(&self) -> Option<&Container> {
        self.inner.parent.as_ref()
    }

    /// Create a child container at a strictly deeper scope.
    pub async fn create_scope(&self, scope: Scope) -> Result<Container> {
        let (own_depth, child_depth) = (self.inner.scope.depth(), scope.depth());
        let deeper = matches!((own_depth, child_depth), (Some(p), Some(c)) if c > p);
        if !deeper {
            return Err(CoreError::internal(format!(
                "cannot create {} scope under {} container",
                scope, self.inner.scope
            )));
        }

        let child = Container {
            inner: Arc::new(ContainerInner {
                scope,
                parent: Some(self.clone()),
                state: Mutex::new(ContainerState::default()),
            }),
        };

        let mut state = self.inner.state.lock().await;
        if state.disposed {
            return Err(CoreError::internal(
                "cannot create scope under a disposed container",
            ));
        }
        state.children.push(Arc::downgrade(&child.inner));
        Ok(child)
    }

    /// Pre-seed an instance for a provider in this container.
    ///
    /// Seeded instances are not tracked for disposal: the caller owns them.
    pub async fn provide<T: Send + Sync + 'static>(&self, provider: &Provider<T>, value: T) {
        let mut state = self.inner.state.lock().await;
        state
            .instances
            .insert(provider.id(), Slot::Ready(Arc::new(value)));
    }

    /// Resolve a provider to its instance.
    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        provider: &Provider<T>,
    ) -> Result<Arc<T>> {
        let instance = self.resolve_erased(provider.erased(), &[]).await?;
        instance.downcast::<T>().map_err(|_| {
            CoreError::internal(format!(
                "provider '{}' resolved to unexpected type",
                provider.description()
            ))
        })
    }

    /// Eagerly resolve every provider of this container's scope reachable
    /// from the given roots, surfacing initialization errors up front.
    pub async fn load(&self, roots: &[AnyProvider]) -> Result<()> {
        let mut seen: HashSet<ProviderId> = HashSet::new();
        let mut stack: Vec<AnyProvider> = roots.to_vec();
        let mut matching: Vec<AnyProvider> = Vec::new();

        while let Some(provider) = stack.pop() {
            if !seen.insert(provider.id()) {
                continue;
            }
            stack.extend(provider.dependencies().iter().cloned());
            if provider.scope() == self.inner.scope {
                matching.push(provider);
            }
        }

        for provider in matching {
            self.resolve_erased(&provider, &[]).await?;
        }
        Ok(())
    }

    /// Dispose this container: children first, then own instances in
    /// reverse resolution order. Disposer failures are logged and do not
    /// halt disposal. Idempotent.
    pub fn dispose(&self) -> BoxFuture<'_, ()> {
        async move {
            let (children, order, mut instances) = {
                let mut state = self.inner.state.lock().await;
                if state.disposed {
                    return;
                }
                state.disposed = true;
                (
                    std::mem::take(&mut state.children),
                    std::mem::take(&mut state.disposal_order),
                    std::mem::take(&mut state.instances),
                )
            };

            for child in children {
                if let Some(inner) = child.upgrade() {
                    Container { inner }.dispose().await;
                }
            }

            for provider in order.into_iter().rev() {
                let Some(Slot::Ready(instance)) = instances.remove(&provider.id()) else {
                    continue;
                };
                if !provider.has_disposer() {
                    continue;
                }
                if let Err(error) = provider.dispose_instance(instance).await {
                    warn!(
                        provider = provider.description(),
                        %error,
                        "disposer failed; continuing disposal"
                    );
                }
            }
        }
        .boxed()
    }

    fn resolve_erased<'a>(
        &'a self,
        provider: &'a AnyProvider,
        path: &'a [ProviderId],
    ) -> BoxFuture<'a, Result<Instance>> {
        async move {
            if path.contains(&provider.id()) {
                return Err(CoreError::internal(format!(
                    "circular dependency involving provider '{}'",
                    provider.description()
                )));
            }

            // Cached here or in any ancestor (covers pre-seeded instances).
            let mut current = Some(self);
            while let Some(container) = current {
                let state = container.inner.state.lock().await;
                if let Some(Slot::Ready(instance)) = state.instances.get(&provider.id()) {
                    return Ok(instance.clone());
                }
                drop(state);
                current = container.parent();
            }

            if provider.scope() == Scope::Transient {
                return self.construct(provider, path).await;
            }

            let target = self.target_for(provider)?;
            target.resolve_single_flight(provider, path).await
        }
        .boxed()
    }

    /// The nearest container (self or ancestor) whose scope matches the
    /// provider's. Absence means the provider's scope is deeper than this
    /// container's, which is a scope violation.
    fn target_for(&self, provider: &AnyProvider) -> Result<&Container> {
        let mut current = Some(self);
        while let Some(container) = current {
            if container.inner.scope == provider.scope() {
                return Ok(container);
            }
            current = container.parent();
        }
        Err(CoreError::ScopeMismatch {
            provider: provider.description().to_string(),
            provider_scope: provider.scope(),
            container_scope: self.inner.scope,
        })
    }

    async fn resolve_single_flight(
        &self,
        provider: &AnyProvider,
        path: &[ProviderId],
    ) -> Result<Instance> {
        enum Found {
            Ready(Instance),
            Pending(Completion),
            Vacant,
        }

        let mut state = self.inner.state.lock().await;
        if state.disposed {
            return Err(CoreError::internal(
                "cannot resolve in a disposed container",
            ));
        }

        let found = match state.instances.get(&provider.id()) {
            Some(Slot::Ready(instance)) => Found::Ready(instance.clone()),
            Some(Slot::Pending(rx)) => Found::Pending(rx.clone()),
            None => Found::Vacant,
        };

        match found {
            Found::Ready(instance) => Ok(instance),
            Found::Pending(mut rx) => {
                drop(state);
                // Another resolution is in flight; await its outcome.
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| CoreError::internal("provider resolution was abandoned"))?;
                outcome.clone().expect("checked Some above")
            }
            Found::Vacant => {
                let (tx, rx) = watch::channel(None);
                state.instances.insert(provider.id(), Slot::Pending(rx));
                drop(state);
                self.construct_and_store(provider, path, tx).await
            }
        }
    }

    async fn construct_and_store(
        &self,
        provider: &AnyProvider,
        path: &[ProviderId],
        tx: watch::Sender<Option<Result<Instance>>>,
    ) -> Result<Instance> {
        let result = self.construct(provider, path).await;

        let mut state = self.inner.state.lock().await;
        match &result {
            Ok(instance) => {
                state
                    .instances
                    .insert(provider.id(), Slot::Ready(instance.clone()));
                state.disposal_order.push(provider.clone());
            }
            Err(_) => {
                // Leave no poisoned slot behind; a later resolve may retry.
                state.instances.remove(&provider.id());
            }
        }
        drop(state);

        let _ = tx.send(Some(result.clone()));
        result
    }

    async fn construct(&self, provider: &AnyProvider, path: &[ProviderId]) -> Result<Instance> {
        let mut extended = Vec::with_capacity(path.len() + 1);
        extended.extend_from_slice(path);
        extended.push(provider.id());

        let mut values = HashMap::new();
        for dependency in provider.dependencies() {
            let instance = self.resolve_erased(dependency, &extended).await?;
            values.insert(dependency.id(), instance);
        }

        provider.construct(FactoryContext::new(values)).await
    }
}
