// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of modules, procedures, tasks, commands and hook bindings.
//!
//! Modules declare procedures and tasks under a namespace; `load()`
//! materializes them into flat `module/name` entries and fails on
//! collisions. After `clear()` the registry may be re-populated.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use crate::context::{CallContext, TaskContext};
use crate::error::{CoreError, Result};
use crate::hooks::{HookFn, HookKind};
use crate::schema::Schema;

/// Procedure handler: `(ctx, decoded input) → output`.
pub type HandlerFn = Arc<
    dyn Fn(Arc<CallContext>, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync,
>;

/// Guard predicate over the call context; `false` rejects the call.
pub type GuardFn =
    Arc<dyn Fn(Arc<CallContext>) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Continuation passed to a middleware.
pub type NextFn = Box<dyn FnOnce(Value) -> BoxFuture<'static, Result<Value>> + Send>;

/// Middleware around a handler; outermost runs first.
pub type MiddlewareFn = Arc<
    dyn Fn(Arc<CallContext>, Value, NextFn) -> BoxFuture<'static, Result<Value>> + Send + Sync,
>;

/// Task body: `(ctx, args) → result`.
pub type TaskFn =
    Arc<dyn Fn(TaskContext, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Command body: `args → result`.
pub type CommandFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A named request/response handler. Immutable after registration.
pub struct Procedure {
    name: String,
    input: Schema,
    output: Schema,
    guards: Vec<GuardFn>,
    middlewares: Vec<MiddlewareFn>,
    handler: HandlerFn,
    timeout: Option<Duration>,
}

impl Procedure {
    pub fn build(name: impl Into<String>) -> ProcedureBuilder {
        ProcedureBuilder {
            name: name.into(),
            input: Schema::Any,
            output: Schema::Any,
            guards: Vec::new(),
            middlewares: Vec::new(),
            timeout: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &Schema {
        &self.input
    }

    pub fn output(&self) -> &Schema {
        &self.output
    }

    pub fn guards(&self) -> &[GuardFn] {
        &self.guards
    }

    pub fn middlewares(&self) -> &[MiddlewareFn] {
        &self.middlewares
    }

    pub fn handler(&self) -> &HandlerFn {
        &self.handler
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Builder for [`Procedure`]; finalized by [`ProcedureBuilder::handler`].
pub struct ProcedureBuilder {
    name: String,
    input: Schema,
    output: Schema,
    guards: Vec<GuardFn>,
    middlewares: Vec<MiddlewareFn>,
    timeout: Option<Duration>,
}

impl ProcedureBuilder {
    pub fn input(mut self, schema: Schema) -> Self {
        self.input = schema;
        self
    }

    pub fn output(mut self, schema: Schema) -> Self {
        self.output = schema;
        self
    }

    pub fn guard(mut self, guard: GuardFn) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn middleware(mut self, middleware: MiddlewareFn) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn handler(self, handler: HandlerFn) -> Arc<Procedure> {
        Arc::new(Procedure {
            name: self.name,
            input: self.input,
            output: self.output,
            guards: self.guards,
            middlewares: self.middlewares,
            handler,
            timeout: self.timeout,
        })
    }
}

/// A named background unit of work.
pub struct Task {
    name: String,
    handler: TaskFn,
    local_only: bool,
    timeout: Option<Duration>,
}

impl Task {
    pub fn new(name: impl Into<String>, handler: TaskFn) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            handler,
            local_only: false,
            timeout: None,
        })
    }

    /// A task that must never be offloaded to a task worker.
    pub fn local(name: impl Into<String>, handler: TaskFn) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            handler,
            local_only: true,
            timeout: None,
        })
    }

    pub fn with_timeout(self: Arc<Self>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            handler: self.handler.clone(),
            local_only: self.local_only,
            timeout: Some(timeout),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &TaskFn {
        &self.handler
    }

    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// A namespaced collection of procedures, tasks, hooks and submodules.
pub struct Module {
    name: String,
    procedures: Vec<Arc<Procedure>>,
    tasks: Vec<Arc<Task>>,
    hooks: Vec<(HookKind, HookFn)>,
    submodules: Vec<Module>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            procedures: Vec::new(),
            tasks: Vec::new(),
            hooks: Vec::new(),
            submodules: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn procedure(mut self, procedure: Arc<Procedure>) -> Self {
        self.procedures.push(procedure);
        self
    }

    pub fn task(mut self, task: Arc<Task>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn hook(mut self, kind: HookKind, hook: HookFn) -> Self {
        self.hooks.push((kind, hook));
        self
    }

    pub fn module(mut self, submodule: Module) -> Self {
        self.submodules.push(submodule);
        self
    }

    /// Shallow merge: same-name entries from `other` override, everything
    /// else concatenates; submodules merge recursively by name.
    pub fn merge(mut self, other: Module) -> Module {
        for procedure in other.procedures {
            self.procedures.retain(|p| p.name() != procedure.name());
            self.procedures.push(procedure);
        }
        for task in other.tasks {
            self.tasks.retain(|t| t.name() != task.name());
            self.tasks.push(task);
        }
        self.hooks.extend(other.hooks);
        for submodule in other.submodules {
            match self
                .submodules
                .iter()
                .position(|m| m.name == submodule.name)
            {
                Some(index) => {
                    let existing = self.submodules.remove(index);
                    self.submodules.push(existing.merge(submodule));
                }
                None => self.submodules.push(submodule),
            }
        }
        self
    }
}

/// Collects registrations and materializes them on `load()`.
#[derive(Default)]
pub struct Registry {
    modules: Vec<Module>,
    commands: HashMap<String, HashMap<String, CommandFn>>,
    procedures: HashMap<String, Arc<Procedure>>,
    tasks: HashMap<String, Arc<Task>>,
    hooks: Vec<(HookKind, HookFn)>,
    loaded: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Register a module. Registering a module under an existing name merges
    /// the two definitions.
    pub fn register_module(&mut self, module: Module) -> Result<()> {
        if self.loaded {
            return Err(CoreError::InvalidState {
                operation: "register a module",
                state: "loaded".to_string(),
            });
        }
        match self.modules.iter().position(|m| m.name == module.name) {
            Some(index) => {
                let existing = self.modules.remove(index);
                self.modules.push(existing.merge(module));
            }
            None => self.modules.push(module),
        }
        Ok(())
    }

    /// Register a command under a namespace.
    pub fn register_command(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        command: CommandFn,
    ) -> Result<()> {
        let (namespace, name) = (namespace.into(), name.into());
        let entry = self.commands.entry(namespace.clone()).or_default();
        if entry.contains_key(&name) {
            return Err(CoreError::DuplicateName {
                name: format!("{}:{}", namespace, name),
            });
        }
        entry.insert(name, command);
        Ok(())
    }

    /// Materialize flat `module/name` entries from the registered modules.
    pub fn load(&mut self) -> Result<()> {
        let mut procedures = HashMap::new();
        let mut tasks = HashMap::new();
        let mut hooks = Vec::new();

        fn walk(
            module: &Module,
            prefix: &str,
            procedures: &mut HashMap<String, Arc<Procedure>>,
            tasks: &mut HashMap<String, Arc<Task>>,
            hooks: &mut Vec<(HookKind, HookFn)>,
        ) -> Result<()> {
            let base = if prefix.is_empty() {
                module.name.clone()
            } else {
                format!("{}/{}", prefix, module.name)
            };

            for procedure in &module.procedures {
                let full = format!("{}/{}", base, procedure.name());
                if procedures.insert(full.clone(), procedure.clone()).is_some() {
                    return Err(CoreError::DuplicateName { name: full });
                }
            }
            for task in &module.tasks {
                let full = format!("{}/{}", base, task.name());
                if tasks.insert(full.clone(), task.clone()).is_some() {
                    return Err(CoreError::DuplicateName { name: full });
                }
            }
            for (kind, hook) in &module.hooks {
                hooks.push((*kind, hook.clone()));
            }
            for submodule in &module.submodules {
                walk(submodule, &base, procedures, tasks, hooks)?;
            }
            Ok(())
        }

        for module in &self.modules {
            walk(module, "", &mut procedures, &mut tasks, &mut hooks)?;
        }

        self.procedures = procedures;
        self.tasks = tasks;
        self.hooks = hooks;
        self.loaded = true;
        Ok(())
    }

    /// Drain hook bindings materialized by `load()`.
    pub fn take_hooks(&mut self) -> Vec<(HookKind, HookFn)> {
        std::mem::take(&mut self.hooks)
    }

    /// Forget everything. The container must be disposed beforehand.
    pub fn clear(&mut self) {
        self.modules.clear();
        self.commands.clear();
        self.procedures.clear();
        self.tasks.clear();
        self.hooks.clear();
        self.loaded = false;
    }

    pub fn get_procedure(&self, name: &str) -> Option<Arc<Procedure>> {
        self.procedures.get(name).cloned()
    }

    pub fn get_task(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn get_command(&self, namespace: &str, name: &str) -> Option<CommandFn> {
        self.commands.get(namespace)?.get(name).cloned()
    }

    pub fn procedure_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.procedures.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Write a hierarchical listing to the log sink.
    pub fn print(&self) {
        info!("registered procedures:");
        for name in self.procedure_names() {
            info!("  {}", name);
        }
        info!("registered tasks:");
        for name in self.task_names() {
            info!("  {}", name);
        }
        info!("registered commands:");
        let mut namespaces: Vec<&String> = self.commands.keys().collect();
        namespaces.sort();
        for namespace in namespaces {
            let mut names: Vec<&String> = self.commands[namespace].keys().collect();
            names.sort();
            for name in names {
                info!("  {}:{}", namespace, name);
            }
        }
    }
}

/// Cheap read-only view over a shared registry.
#[derive(Clone)]
pub struct RegistryView {
    inner: Arc<RwLock<Registry>>,
}

impl RegistryView {
    pub fn new(inner: Arc<RwLock<Registry>>) -> Self {
        Self { inner }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.read().expect("registry lock poisoned")
    }

    pub fn get_procedure(&self, name: &str) -> Option<Arc<Procedure>> {
        self.read().get_procedure(name)
    }

    pub fn get_task(&self, name: &str) -> Option<Arc<Task>> {
        self.read().get_task(name)
    }

    pub fn get_command(&self, namespace: &str, name: &str) -> Option<CommandFn> {
        self.read().get_command(namespace, name)
    }

    pub fn procedure_names(&self) -> Vec<String> {
        self.read().procedure_names()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.read().task_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop_handler() -> HandlerFn {
        Arc::new(|_ctx, input| async move { Ok(input) }.boxed())
    }

    fn noop_task() -> TaskFn {
        Arc::new(|_ctx, _args| async move { Ok(Value::Null) }.boxed())
    }

    fn sample_module() -> Module {
        Module::new("users")
            .procedure(Procedure::build("get").handler(noop_handler()))
            .procedure(Procedure::build("set").handler(noop_handler()))
            .task(Task::new("reindex", noop_task()))
            .module(Module::new("admin").procedure(
                Procedure::build("purge").handler(noop_handler()),
            ))
    }

    #[test]
    fn test_load_materializes_nested_names() {
        let mut registry = Registry::new();
        registry.register_module(sample_module()).unwrap();
        registry.load().unwrap();

        assert!(registry.get_procedure("users/get").is_some());
        assert!(registry.get_procedure("users/admin/purge").is_some());
        assert!(registry.get_task("users/reindex").is_some());
        assert!(registry.get_procedure("users/missing").is_none());
    }

    #[test]
    fn test_duplicate_name_within_namespace_fails_load() {
        let mut registry = Registry::new();
        let module = Module::new("users")
            .procedure(Procedure::build("get").handler(noop_handler()));
        registry.register_module(module).unwrap();

        // A second registration under the same name merges instead of
        // colliding; a collision needs two identically named entries in one
        // module definition.
        let clashing = Module::new("orders")
            .module(Module::new("v1").procedure(Procedure::build("list").handler(noop_handler())))
            .module(Module::new("v1").procedure(Procedure::build("list").handler(noop_handler())));
        registry.register_module(clashing).unwrap();

        let err = registry.load().unwrap_err();
        assert!(matches!(err, CoreError::DuplicateName { .. }));
    }

    #[test]
    fn test_module_merge_overrides_same_path() {
        let mut registry = Registry::new();
        registry.register_module(sample_module()).unwrap();

        let marker = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let override_handler: HandlerFn = {
            let marker = marker.clone();
            Arc::new(move |_ctx, input| {
                marker.store(true, std::sync::atomic::Ordering::SeqCst);
                async move { Ok(input) }.boxed()
            })
        };
        registry
            .register_module(
                Module::new("users")
                    .procedure(Procedure::build("get").handler(override_handler)),
            )
            .unwrap();
        registry.load().unwrap();

        // Same set of names; "users/get" is the overriding entry.
        assert!(registry.get_procedure("users/get").is_some());
        assert!(registry.get_procedure("users/set").is_some());
    }

    #[test]
    fn test_clear_then_reload_produces_same_names() {
        let mut registry = Registry::new();
        registry.register_module(sample_module()).unwrap();
        registry.load().unwrap();
        let before = registry.procedure_names();

        registry.clear();
        assert!(!registry.is_loaded());
        assert!(registry.procedure_names().is_empty());

        registry.register_module(sample_module()).unwrap();
        registry.load().unwrap();
        assert_eq!(registry.procedure_names(), before);
    }

    #[test]
    fn test_commands_namespace_collisions() {
        let mut registry = Registry::new();
        let command: CommandFn = Arc::new(|args| async move { Ok(args) }.boxed());

        registry
            .register_command("task", "execute", command.clone())
            .unwrap();
        registry
            .register_command("registry", "execute", command.clone())
            .unwrap();

        let err = registry
            .register_command("task", "execute", command)
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateName { .. }));
        assert!(registry.get_command("task", "execute").is_some());
        assert!(registry.get_command("task", "missing").is_none());
    }

    #[test]
    fn test_registration_rejected_after_load() {
        let mut registry = Registry::new();
        registry.register_module(sample_module()).unwrap();
        registry.load().unwrap();

        let err = registry.register_module(Module::new("late")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[test]
    fn test_module_hooks_are_materialized() {
        let mut registry = Registry::new();
        let hook: HookFn = Arc::new(|_| async { Ok(()) }.boxed());
        registry
            .register_module(Module::new("users").hook(HookKind::BeforeStop, hook))
            .unwrap();
        registry.load().unwrap();

        let hooks = registry.take_hooks();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].0, HookKind::BeforeStop);
        assert!(registry.take_hooks().is_empty());
    }

    #[test]
    fn test_task_flags() {
        let offloadable = Task::new("a", noop_task());
        assert!(!offloadable.is_local_only());

        let local = Task::local("b", noop_task())
            .with_timeout(Duration::from_secs(5));
        assert!(local.is_local_only());
        assert_eq!(local.timeout(), Some(Duration::from_secs(5)));
    }
}
