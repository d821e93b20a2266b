// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Providers: the unit of dependency injection.
//!
//! A provider describes how to construct one value: an async factory over
//! resolved dependencies, a scope tag, and an optional disposer. Providers
//! are identity-addressed — two providers built from identical parts are
//! still distinct — and immutable once built.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::{CoreError, Result};
use crate::scope::Scope;

/// A resolved instance, type-erased.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Identity of a provider (pointer identity of its definition).
pub type ProviderId = usize;

type FactoryFn = Box<dyn Fn(FactoryContext) -> BoxFuture<'static, Result<Instance>> + Send + Sync>;
type DisposerFn = Box<dyn Fn(Instance) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub(crate) struct ProviderInner {
    description: String,
    scope: Scope,
    dependencies: Vec<AnyProvider>,
    factory: FactoryFn,
    disposer: Option<DisposerFn>,
}

/// A type-erased provider handle.
#[derive(Clone)]
pub struct AnyProvider(Arc<ProviderInner>);

impl AnyProvider {
    pub fn id(&self) -> ProviderId {
        Arc::as_ptr(&self.0) as ProviderId
    }

    pub fn description(&self) -> &str {
        &self.0.description
    }

    pub fn scope(&self) -> Scope {
        self.0.scope
    }

    pub fn dependencies(&self) -> &[AnyProvider] {
        &self.0.dependencies
    }

    pub(crate) fn construct(&self, ctx: FactoryContext) -> BoxFuture<'static, Result<Instance>> {
        (self.0.factory)(ctx)
    }

    pub(crate) fn has_disposer(&self) -> bool {
        self.0.disposer.is_some()
    }

    pub(crate) fn dispose_instance(&self, instance: Instance) -> BoxFuture<'static, Result<()>> {
        match &self.0.disposer {
            Some(disposer) => disposer(instance),
            None => async { Ok(()) }.boxed(),
        }
    }
}

impl std::fmt::Debug for AnyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("description", &self.0.description)
            .field("scope", &self.0.scope)
            .field("dependencies", &self.0.dependencies.len())
            .finish()
    }
}

/// A typed provider handle.
pub struct Provider<T> {
    inner: AnyProvider,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Provider<T> {
    /// Start describing a provider. The description is used in scope and
    /// resolution errors.
    pub fn build(description: impl Into<String>) -> ProviderBuilder<T> {
        ProviderBuilder {
            description: description.into(),
            scope: Scope::Global,
            dependencies: Vec::new(),
            disposer: None,
            _marker: PhantomData,
        }
    }
}

impl<T> Provider<T> {
    /// The type-erased handle for this provider.
    pub fn erased(&self) -> &AnyProvider {
        &self.inner
    }

    pub fn id(&self) -> ProviderId {
        self.inner.id()
    }

    pub fn scope(&self) -> Scope {
        self.inner.scope()
    }

    pub fn description(&self) -> &str {
        self.inner.description()
    }
}

impl<T> std::fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

/// Builder for [`Provider`]. Finalized by [`ProviderBuilder::factory`].
pub struct ProviderBuilder<T> {
    description: String,
    scope: Scope,
    dependencies: Vec<AnyProvider>,
    disposer: Option<DisposerFn>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ProviderBuilder<T> {
    /// Set the lifetime tier. Defaults to [`Scope::Global`].
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Declare a dependency. The dependency is resolved before the factory
    /// runs and is available through [`FactoryContext::get`].
    pub fn dependency<D>(mut self, dependency: &Provider<D>) -> Self {
        self.dependencies.push(dependency.erased().clone());
        self
    }

    /// Attach a disposer, awaited during container disposal.
    pub fn disposer<F, Fut>(mut self, disposer: F) -> Self
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.disposer = Some(Box::new(move |instance: Instance| {
            match instance.downcast::<T>() {
                Ok(value) => disposer(value).boxed(),
                Err(_) => async {
                    Err(CoreError::internal("disposer received unexpected type"))
                }
                .boxed(),
            }
        }));
        self
    }

    /// Set the factory and finish the provider.
    pub fn factory<F, Fut>(self, factory: F) -> Provider<T>
    where
        F: Fn(FactoryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let factory: FactoryFn = Box::new(move |ctx| {
            let fut = factory(ctx);
            async move { fut.await.map(|value| Arc::new(value) as Instance) }.boxed()
        });

        Provider {
            inner: AnyProvider(Arc::new(ProviderInner {
                description: self.description,
                scope: self.scope,
                dependencies: self.dependencies,
                factory,
                disposer: self.disposer,
            })),
            _marker: PhantomData,
        }
    }
}

/// Resolved dependency values handed to a factory.
pub struct FactoryContext {
    values: std::collections::HashMap<ProviderId, Instance>,
}

impl FactoryContext {
    pub(crate) fn new(values: std::collections::HashMap<ProviderId, Instance>) -> Self {
        Self { values }
    }

    /// Fetch a declared dependency's resolved value.
    ///
    /// The container resolves every declared dependency before invoking the
    /// factory; asking for a provider that was not declared is a programming
    /// error and panics.
    pub fn get<T: Send + Sync + 'static>(&self, provider: &Provider<T>) -> Arc<T> {
        self.values
            .get(&provider.id())
            .unwrap_or_else(|| {
                panic!(
                    "provider '{}' was not declared as a dependency",
                    provider.description()
                )
            })
            .clone()
            .downcast::<T>()
            .expect("dependency resolved to unexpected type")
    }
}
