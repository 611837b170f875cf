//! Module interface and reload-survivable plumbing.
//!
//! A module is a unit of dynamically loadable behavior that owns a set of
//! hooks and commands; unloading releases both. Hot reload replaces the
//! running instance with a freshly imported one while migrating the state
//! entries named by [`Module::state_preserve_keys`] and leaving previously
//! handed out [`BoundCallback`]s valid: they resolve through the module
//! version chain at invocation time, so a timer armed by the old version
//! fires into the new one.

use crate::command::registry::{Command, CommandDescriptor};
use crate::context::ProxyContext;
use crate::error::{CommandError, ModuleError};
use crate::events::Direction;
use crate::hooks::{Hook, PacketHook};
use async_trait::async_trait;
use compact_str::CompactString;
use dashmap::DashMap;
use serde_json::Value;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Keyed bag of state a module wants to survive hot reloads.
///
/// Values are stored as `Arc`s and transfer verbatim: a preserved timer
/// handle keeps ticking, a preserved graph cell keeps its contents. It is
/// the module's responsibility to list only keys whose values remain
/// meaningful across versions.
#[derive(Default)]
pub struct ModuleState {
    values: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ModuleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        self.values.insert(key.to_string(), Arc::new(value));
    }

    pub fn set_raw(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.values.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn raw(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.values.remove(key).map(|(_, v)| v)
    }

    /// Copies the named entries from another state bag, replacing any local
    /// values. Missing keys are skipped with a debug note.
    pub fn migrate_from(&self, other: &ModuleState, keys: &[&str]) {
        for &key in keys {
            match other.raw(key) {
                Some(value) => {
                    self.values.insert(key.to_string(), value);
                }
                None => debug!(key, "preserve key absent on previous module version"),
            }
        }
    }
}

impl std::fmt::Debug for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.values.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("ModuleState").field("keys", &keys).finish()
    }
}

/// The trait loadable modules implement.
///
/// Instances are created by the loader (dynamic library entry point or
/// factory), handed their configuration through the [`ModuleContext`], and
/// driven through `on_load`/`on_unload`. Named callbacks reachable through
/// [`ModuleContext::bind_callback`] are dispatched via [`Module::callback`].
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Stable, unique module name; doubles as the registry key.
    fn name(&self) -> &str;

    /// Module version string, for logs and diagnostics.
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// The module's reload-survivable state bag.
    fn state(&self) -> &ModuleState;

    /// State keys migrated verbatim onto the replacement instance during a
    /// reload.
    fn state_preserve_keys(&self) -> &'static [&'static str] {
        &[]
    }

    async fn on_load(&self, ctx: ModuleContext, reloading: bool) -> Result<(), ModuleError>;

    async fn on_unload(&self, _ctx: ModuleContext, _reloading: bool) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Dispatch point for named callbacks bound with
    /// [`ModuleContext::bind_callback`].
    async fn callback(&self, key: &str, _ctx: ModuleContext) -> Result<(), ModuleError> {
        Err(ModuleError::UnknownCallback {
            module: self.name().to_string(),
            key: key.to_string(),
        })
    }
}

/// Hooks and commands owned by one module instance, released on unload.
#[derive(Default)]
pub struct ModuleOwnership {
    hooks: Mutex<Vec<Arc<Hook>>>,
    commands: Mutex<Vec<Command>>,
}

impl ModuleOwnership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_hook(&self, hook: Arc<Hook>) {
        self.hooks.lock().expect("ownership lock poisoned").push(hook);
    }

    pub fn track_command(&self, command: Command) {
        self.commands
            .lock()
            .expect("ownership lock poisoned")
            .push(command);
    }

    /// Unregisters everything this module registered. Safe to call when
    /// some entries were already released individually.
    pub fn release(&self, proxy: &dyn ProxyContext) {
        let hooks: Vec<Arc<Hook>> = self
            .hooks
            .lock()
            .expect("ownership lock poisoned")
            .drain(..)
            .collect();
        for hook in hooks {
            if proxy.hooks().unregister(&hook).is_err() {
                debug!(kind = hook.kind(), "hook was already unregistered");
            }
        }

        let commands: Vec<Command> = self
            .commands
            .lock()
            .expect("ownership lock poisoned")
            .drain(..)
            .collect();
        for command in commands {
            if let Err(e) = proxy.commands().unregister(&command) {
                debug!(command = command.name(), error = %e, "command was already unregistered");
            }
        }
    }
}

/// Resolves a bound callback to the module version that should receive it.
#[async_trait]
pub trait CallbackTarget: Send + Sync {
    async fn dispatch(
        &self,
        key: &str,
        proxy: Arc<dyn ProxyContext>,
    ) -> Result<(), ModuleError>;
}

/// Creates [`BoundCallback`]s tied to one module registry entry.
pub trait CallbackBinder: Send + Sync {
    fn bind(&self, key: &str) -> BoundCallback;
}

/// A forwarder to a named module callback that stays valid across reloads.
///
/// Invocation resolves the owning module's version chain first, so a
/// callback bound by a superseded version dispatches to its replacement.
#[derive(Clone)]
pub struct BoundCallback {
    target: Arc<dyn CallbackTarget>,
    key: CompactString,
}

impl BoundCallback {
    pub fn new(target: Arc<dyn CallbackTarget>, key: &str) -> Self {
        Self {
            target,
            key: CompactString::new(key),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn invoke(&self, proxy: Arc<dyn ProxyContext>) -> Result<(), ModuleError> {
        self.target.dispatch(&self.key, proxy).await
    }
}

impl std::fmt::Debug for BoundCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundCallback").field("key", &self.key).finish()
    }
}

/// Handle to a scheduled interval or one-shot timer.
///
/// Dropping the handle does not stop the timer; clearing does. Clearing an
/// already-cleared timer is a detected anomaly: it logs a warning and does
/// nothing else.
pub struct TimerHandle {
    label: CompactString,
    cleared: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimerHandle {
    pub fn new(label: &str, cleared: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            label: CompactString::new(label),
            cleared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn clear(&self) {
        if self.cleared.swap(true, Ordering::SeqCst) {
            warn!(timer = %self.label, "timer cleared twice");
            return;
        }
        if let Some(task) = self.task.lock().expect("timer lock poisoned").take() {
            task.abort();
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("label", &self.label)
            .field("cleared", &self.is_cleared())
            .finish()
    }
}

/// Everything a module needs while running: the proxy seam, its ownership
/// tracking, its callback binder and its configuration blob.
#[derive(Clone)]
pub struct ModuleContext {
    proxy: Arc<dyn ProxyContext>,
    ownership: Arc<ModuleOwnership>,
    binder: Arc<dyn CallbackBinder>,
    config: Option<Value>,
}

impl ModuleContext {
    pub fn new(
        proxy: Arc<dyn ProxyContext>,
        ownership: Arc<ModuleOwnership>,
        binder: Arc<dyn CallbackBinder>,
        config: Option<Value>,
    ) -> Self {
        Self {
            proxy,
            ownership,
            binder,
            config,
        }
    }

    pub fn proxy(&self) -> &Arc<dyn ProxyContext> {
        &self.proxy
    }

    /// Per-module configuration pulled from the proxy config, if present.
    pub fn config(&self) -> Option<&Value> {
        self.config.as_ref()
    }

    /// Registers a hook owned by this module; it is released on unload.
    pub fn register_hook(
        &self,
        scope: Direction,
        kind: &str,
        handler: Arc<dyn PacketHook>,
    ) -> Arc<Hook> {
        let hook = self.proxy.hooks().register(scope, kind, handler);
        self.ownership.track_hook(hook.clone());
        hook
    }

    /// Registers a hook at an explicit priority; lower fires first.
    pub fn register_hook_with_priority(
        &self,
        scope: Direction,
        kind: &str,
        priority: i32,
        handler: Arc<dyn PacketHook>,
    ) -> Arc<Hook> {
        let hook = self
            .proxy
            .hooks()
            .register_with_priority(scope, kind, priority, handler);
        self.ownership.track_hook(hook.clone());
        hook
    }

    /// Registers a command owned by this module; it is released on unload.
    pub fn register_command(
        &self,
        descriptor: CommandDescriptor,
    ) -> Result<Command, CommandError> {
        let command = self.proxy.commands().register(descriptor)?;
        self.ownership.track_command(command.clone());
        Ok(command)
    }

    /// Binds a named callback that survives hot reloads of this module.
    pub fn bind_callback(&self, key: &str) -> BoundCallback {
        self.binder.bind(key)
    }
}

/// Exports the C entry points the module loader looks for.
///
/// The type must implement [`Module`] and `Default`. The version entry
/// reports the event-system ABI the module was compiled against.
#[macro_export]
macro_rules! declare_module {
    ($module:ty) => {
        #[no_mangle]
        pub extern "C" fn spyglass_module_version() -> *const ::std::os::raw::c_char {
            $crate::ABI_VERSION_C.as_ptr() as *const ::std::os::raw::c_char
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn spyglass_module_entry() -> *mut dyn $crate::Module {
            let module: Box<dyn $crate::Module> = Box::new(<$module as Default>::default());
            Box::into_raw(module)
        }
    };
}
