//! The module registry: import, load, unload and hot reload.

use crate::source::{check_abi, instantiate, open_library, ModuleFactory};
use async_trait::async_trait;
use dashmap::DashMap;
use libloading::Library;
use serde_json::Value;
use spyglass_event_system::{
    BoundCallback, CallbackBinder, CallbackTarget, Module, ModuleContext, ModuleError,
    ModuleOwnership, ProxyContext,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{error, info, warn};

/// Upper bound on the cache scan performed while invalidating libraries for
/// a reload. Exceeding it aborts the reload instead of stalling the proxy.
const INVALIDATION_SCAN_LIMIT: usize = 4096;

/// Where a module's code came from; reload re-imports from here.
#[derive(Debug, Clone)]
pub enum ModuleOrigin {
    /// A dynamic library on disk.
    Library(PathBuf),
    /// A named in-process factory.
    Factory(String),
}

/// Registry-side bookkeeping for one imported module instance.
///
/// Reload creates a fresh entry and wires the superseded one into the
/// version chain: `current` is a weak forward pointer to the replacement,
/// `previous` holds the direct predecessor strongly. On every reload the
/// grandparent's `previous` link is severed so no chain longer than two
/// links is held strongly.
pub struct ModuleEntry {
    module: Arc<dyn Module>,
    origin: Option<ModuleOrigin>,
    /// Keeps the backing library mapped for as long as this instance (or a
    /// callback into it) is alive.
    #[allow(dead_code)]
    library: Option<Arc<Library>>,
    essential: bool,
    loaded: AtomicBool,
    ownership: Arc<ModuleOwnership>,
    config: Option<Value>,
    current: RwLock<Weak<ModuleEntry>>,
    previous: RwLock<Option<Arc<ModuleEntry>>>,
}

impl ModuleEntry {
    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub fn origin(&self) -> Option<&ModuleOrigin> {
        self.origin.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn is_essential(&self) -> bool {
        self.essential
    }

    /// The replacement instance, when this one has been superseded.
    pub fn current(&self) -> Option<Arc<ModuleEntry>> {
        self.current
            .read()
            .expect("module chain lock poisoned")
            .upgrade()
    }

    /// The directly superseded instance, until the next reload severs it.
    pub fn previous(&self) -> Option<Arc<ModuleEntry>> {
        self.previous
            .read()
            .expect("module chain lock poisoned")
            .clone()
    }

    /// Follows the version chain to the newest instance.
    fn latest(self: &Arc<Self>) -> Arc<ModuleEntry> {
        let mut entry = self.clone();
        while let Some(next) = entry.current() {
            entry = next;
        }
        entry
    }

    /// Builds the context this module runs with.
    pub fn context(self: &Arc<Self>, proxy: Arc<dyn ProxyContext>) -> ModuleContext {
        ModuleContext::new(
            proxy,
            self.ownership.clone(),
            Arc::new(EntryBinder(self.clone())),
            self.config.clone(),
        )
    }
}

struct EntryBinder(Arc<ModuleEntry>);

impl CallbackBinder for EntryBinder {
    fn bind(&self, key: &str) -> BoundCallback {
        BoundCallback::new(Arc::new(EntryTarget(self.0.clone())), key)
    }
}

struct EntryTarget(Arc<ModuleEntry>);

#[async_trait]
impl CallbackTarget for EntryTarget {
    async fn dispatch(
        &self,
        key: &str,
        proxy: Arc<dyn ProxyContext>,
    ) -> Result<(), ModuleError> {
        let entry = self.0.latest();
        let ctx = entry.context(proxy);
        entry.module.callback(key, ctx).await
    }
}

/// Mapping `name → module`, plus the factory table and the library cache.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: DashMap<String, Arc<ModuleEntry>>,
    factories: DashMap<String, Arc<dyn ModuleFactory>>,
    libraries: DashMap<String, Arc<Library>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes an in-process factory importable under `name`.
    pub fn register_factory(&self, name: &str, factory: Arc<dyn ModuleFactory>) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Imports a module instance from a registered factory. `essential`
    /// marks it as unloadable only during reloads (the core module).
    pub fn import_from_factory(
        &self,
        factory_name: &str,
        proxy: &Arc<dyn ProxyContext>,
        essential: bool,
    ) -> Result<String, ModuleError> {
        let factory = self
            .factories
            .get(factory_name)
            .map(|f| f.value().clone())
            .ok_or_else(|| ModuleError::UnknownName(factory_name.to_string()))?;
        let module = factory.create()?;
        self.insert_entry(
            module,
            Some(ModuleOrigin::Factory(factory_name.to_string())),
            None,
            essential,
            proxy,
        )
    }

    /// Imports a module from a dynamic library, checking its ABI version.
    /// The opened library is cached by canonical path.
    pub fn import_from_path(
        &self,
        path: &Path,
        proxy: &Arc<dyn ProxyContext>,
    ) -> Result<String, ModuleError> {
        let canonical = path.canonicalize().map_err(|e| {
            ModuleError::LoadFailure(format!("cannot resolve {}: {e}", path.display()))
        })?;
        let key = canonical.to_string_lossy().to_string();

        let library = match self.libraries.get(&key) {
            Some(library) => library.value().clone(),
            None => {
                let library = Arc::new(open_library(&canonical)?);
                check_abi(&library, &canonical)?;
                self.libraries.insert(key, library.clone());
                library
            }
        };

        let module = instantiate(&library, &canonical)?;
        self.insert_entry(
            module,
            Some(ModuleOrigin::Library(canonical)),
            Some(library),
            false,
            proxy,
        )
    }

    /// Inserts an already-constructed module. Such a module has no origin
    /// and therefore cannot be reloaded.
    pub fn insert_direct(
        &self,
        module: Arc<dyn Module>,
        proxy: &Arc<dyn ProxyContext>,
        essential: bool,
    ) -> Result<String, ModuleError> {
        self.insert_entry(module, None, None, essential, proxy)
    }

    fn insert_entry(
        &self,
        module: Arc<dyn Module>,
        origin: Option<ModuleOrigin>,
        library: Option<Arc<Library>>,
        essential: bool,
        proxy: &Arc<dyn ProxyContext>,
    ) -> Result<String, ModuleError> {
        let name = module.name().to_string();
        let config = proxy.module_config(&name);
        let entry = Arc::new(ModuleEntry {
            module,
            origin,
            library,
            essential,
            loaded: AtomicBool::new(false),
            ownership: Arc::new(ModuleOwnership::new()),
            config,
            current: RwLock::new(Weak::new()),
            previous: RwLock::new(None),
        });

        match self.entries.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ModuleError::DuplicateName(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                info!(module = %name, "module imported");
                Ok(name)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleEntry>> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.get(name).map(|e| e.is_loaded()).unwrap_or(false)
    }

    pub async fn load(
        &self,
        name: &str,
        proxy: Arc<dyn ProxyContext>,
    ) -> Result<(), ModuleError> {
        let entry = self
            .get(name)
            .ok_or_else(|| ModuleError::UnknownName(name.to_string()))?;
        self.load_entry(&entry, proxy, false).await
    }

    async fn load_entry(
        &self,
        entry: &Arc<ModuleEntry>,
        proxy: Arc<dyn ProxyContext>,
        reloading: bool,
    ) -> Result<(), ModuleError> {
        if entry.is_loaded() {
            return Err(ModuleError::InvalidState(format!(
                "module {} is already loaded",
                entry.name()
            )));
        }

        let ctx = entry.context(proxy.clone());
        if let Err(e) = entry.module.on_load(ctx, reloading).await {
            // Whatever the module managed to register before failing is
            // released so a retry starts clean.
            entry.ownership.release(proxy.as_ref());
            return Err(e);
        }

        entry.loaded.store(true, Ordering::SeqCst);
        info!(module = %entry.name(), version = entry.module.version(), reloading, "module loaded");
        Ok(())
    }

    pub async fn unload(
        &self,
        name: &str,
        proxy: Arc<dyn ProxyContext>,
    ) -> Result<(), ModuleError> {
        let entry = self
            .get(name)
            .ok_or_else(|| ModuleError::UnknownName(name.to_string()))?;
        self.unload_entry(&entry, proxy, false).await
    }

    async fn unload_entry(
        &self,
        entry: &Arc<ModuleEntry>,
        proxy: Arc<dyn ProxyContext>,
        reloading: bool,
    ) -> Result<(), ModuleError> {
        if !entry.is_loaded() {
            return Err(ModuleError::InvalidState(format!(
                "module {} is not loaded",
                entry.name()
            )));
        }
        if entry.essential && !reloading {
            return Err(ModuleError::InvalidState(format!(
                "module {} can only be unloaded as part of a reload",
                entry.name()
            )));
        }

        let ctx = entry.context(proxy.clone());
        if let Err(e) = entry.module.on_unload(ctx, reloading).await {
            error!(module = %entry.name(), error = %e, "module unload handler failed");
        }
        entry.ownership.release(proxy.as_ref());
        entry.loaded.store(false, Ordering::SeqCst);
        info!(module = %entry.name(), reloading, "module unloaded");
        Ok(())
    }

    /// Replaces a loaded module with a freshly imported instance.
    ///
    /// Re-import happens first; when it fails the old module keeps running
    /// untouched. On success the old instance is unloaded with
    /// `reloading = true`, its preserved state is migrated onto the new
    /// instance, the new instance is loaded, and the version chain is
    /// updated (collapsing the grandparent link).
    pub async fn reload(
        &self,
        name: &str,
        proxy: Arc<dyn ProxyContext>,
    ) -> Result<(), ModuleError> {
        let old = self
            .get(name)
            .ok_or_else(|| ModuleError::UnknownName(name.to_string()))?;
        let origin = old.origin.clone().ok_or_else(|| {
            ModuleError::InvalidState(format!("module {name} has no import origin"))
        })?;

        let (module, library) = match &origin {
            ModuleOrigin::Library(path) => {
                self.invalidate_library_cache(path)?;
                let library = Arc::new(
                    open_library(path).map_err(|e| ModuleError::ReloadFailure(e.to_string()))?,
                );
                check_abi(&library, path)
                    .map_err(|e| ModuleError::ReloadFailure(e.to_string()))?;
                let module = instantiate(&library, path)
                    .map_err(|e| ModuleError::ReloadFailure(e.to_string()))?;
                (module, Some(library))
            }
            ModuleOrigin::Factory(factory_name) => {
                let factory = self
                    .factories
                    .get(factory_name)
                    .map(|f| f.value().clone())
                    .ok_or_else(|| {
                        ModuleError::ReloadFailure(format!(
                            "factory {factory_name} is no longer registered"
                        ))
                    })?;
                let module = factory
                    .create()
                    .map_err(|e| ModuleError::ReloadFailure(e.to_string()))?;
                (module, None)
            }
        };

        self.unload_entry(&old, proxy.clone(), true).await?;

        module
            .state()
            .migrate_from(old.module.state(), module.state_preserve_keys());

        let new_name = module.name().to_string();
        let config = proxy.module_config(&new_name);
        let new_entry = Arc::new(ModuleEntry {
            module,
            origin: Some(origin),
            library,
            essential: old.essential,
            loaded: AtomicBool::new(false),
            ownership: Arc::new(ModuleOwnership::new()),
            config,
            current: RwLock::new(Weak::new()),
            previous: RwLock::new(None),
        });

        // The old instance had to be unloaded first (both versions register
        // the same named hooks and commands), so a load failure here rolls
        // back by re-loading it: the registry must come out of a failed
        // reload with the old module loaded and operational. Its state
        // cells are untouched by the migration, which copies shared
        // handles rather than moving them.
        if let Err(load_err) = self.load_entry(&new_entry, proxy.clone(), true).await {
            warn!(module = %name, error = %load_err, "new module failed to load, restoring the previous instance");
            if let Err(restore_err) = self.load_entry(&old, proxy, true).await {
                error!(module = %name, error = %restore_err, "previous module instance could not be restored");
                return Err(ModuleError::ReloadFailure(format!(
                    "new module failed to load ({load_err}) and the previous instance could not be restored ({restore_err})"
                )));
            }
            return Err(ModuleError::ReloadFailure(format!(
                "new module failed to load: {load_err}"
            )));
        }

        *old.current.write().expect("module chain lock poisoned") = Arc::downgrade(&new_entry);
        if let Some(grandparent) = old
            .previous
            .write()
            .expect("module chain lock poisoned")
            .take()
        {
            *grandparent
                .current
                .write()
                .expect("module chain lock poisoned") = Arc::downgrade(&new_entry);
        }
        *new_entry
            .previous
            .write()
            .expect("module chain lock poisoned") = Some(old.clone());

        if new_name != name {
            self.entries.remove(name);
            warn!(old = %name, new = %new_name, "module changed its name during reload; consumers holding the old name are orphaned");
        }
        self.entries.insert(new_name.clone(), new_entry);

        info!(module = %new_name, "module reloaded");
        Ok(())
    }

    /// Drops cached libraries for the reloaded path and anything beneath it
    /// so the re-import maps fresh code. The scan is bounded; blowing the
    /// bound aborts the reload.
    fn invalidate_library_cache(&self, path: &Path) -> Result<(), ModuleError> {
        if self.libraries.len() > INVALIDATION_SCAN_LIMIT {
            return Err(ModuleError::ReloadFailure(format!(
                "library cache too large to invalidate safely ({} entries)",
                self.libraries.len()
            )));
        }
        let prefix = path.to_string_lossy().to_string();
        self.libraries.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    /// Scans a directory for platform dynamic libraries.
    pub fn discover(&self, directory: &Path) -> Result<Vec<PathBuf>, ModuleError> {
        let mut found = Vec::new();

        let entries = std::fs::read_dir(directory).map_err(|e| {
            ModuleError::LoadFailure(format!("cannot read {}: {e}", directory.display()))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| ModuleError::LoadFailure(e.to_string()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(extension) = path.extension() else {
                continue;
            };
            let ext = extension.to_string_lossy().to_lowercase();

            #[cfg(target_os = "windows")]
            let is_module = ext == "dll";

            #[cfg(target_os = "macos")]
            let is_module = ext == "dylib";

            #[cfg(not(any(target_os = "windows", target_os = "macos")))]
            let is_module = ext == "so";

            if is_module {
                found.push(path);
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spyglass_event_system::{
        CommandRegistry, ContextError, HookPipeline, ModuleState, TimerHandle,
    };
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct StubProxy {
        hooks: HookPipeline,
        commands: CommandRegistry,
    }

    impl StubProxy {
        fn new() -> Arc<dyn ProxyContext> {
            Arc::new(Self {
                hooks: HookPipeline::new(),
                commands: CommandRegistry::new("/p:"),
            })
        }
    }

    #[async_trait]
    impl ProxyContext for StubProxy {
        fn hooks(&self) -> &HookPipeline {
            &self.hooks
        }

        fn commands(&self) -> &CommandRegistry {
            &self.commands
        }

        fn module_config(&self, module: &str) -> Option<Value> {
            (module == "configured").then(|| json!({ "answer": 42 }))
        }

        async fn inject_client(&self, _kind: &str, _data: Value) -> Result<(), ContextError> {
            Ok(())
        }

        async fn inject_server(&self, _kind: &str, _data: Value) -> Result<(), ContextError> {
            Ok(())
        }

        fn set_interval(
            &self,
            label: &str,
            _period: Duration,
            _callback: BoundCallback,
        ) -> TimerHandle {
            TimerHandle::new(
                label,
                Arc::new(AtomicBool::new(false)),
                tokio::spawn(async {}),
            )
        }

        fn set_timeout(
            &self,
            label: &str,
            _delay: Duration,
            _callback: BoundCallback,
        ) -> TimerHandle {
            TimerHandle::new(
                label,
                Arc::new(AtomicBool::new(false)),
                tokio::spawn(async {}),
            )
        }

        async fn disconnect_client(&self, _reason: Option<String>) -> Result<(), ContextError> {
            Ok(())
        }

        async fn disconnect_server(&self, _reason: Option<String>) -> Result<(), ContextError> {
            Ok(())
        }

        async fn load_module(&self, name: &str) -> Result<(), ModuleError> {
            Err(ModuleError::UnknownName(name.to_string()))
        }

        async fn unload_module(&self, name: &str) -> Result<(), ModuleError> {
            Err(ModuleError::UnknownName(name.to_string()))
        }

        async fn reload_module(&self, name: &str) -> Result<(), ModuleError> {
            Err(ModuleError::UnknownName(name.to_string()))
        }

        async fn import_module(&self, path: &str) -> Result<String, ModuleError> {
            Err(ModuleError::LoadFailure(path.to_string()))
        }
    }

    struct TestModule {
        name: String,
        generation: u32,
        state: ModuleState,
        log: Arc<StdMutex<Vec<String>>>,
        fail_load: bool,
    }

    impl TestModule {
        fn new(name: &str, generation: u32, log: Arc<StdMutex<Vec<String>>>) -> Self {
            Self::failing(name, generation, log, false)
        }

        fn failing(
            name: &str,
            generation: u32,
            log: Arc<StdMutex<Vec<String>>>,
            fail_load: bool,
        ) -> Self {
            let state = ModuleState::new();
            state.set("count", StdMutex::new(0u64));
            Self {
                name: name.to_string(),
                generation,
                state,
                log,
                fail_load,
            }
        }

        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl Module for TestModule {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> &ModuleState {
            &self.state
        }

        fn state_preserve_keys(&self) -> &'static [&'static str] {
            &["count"]
        }

        async fn on_load(&self, ctx: ModuleContext, reloading: bool) -> Result<(), ModuleError> {
            ctx.register_hook(
                spyglass_event_system::Direction::ClientToServer,
                "chat",
                spyglass_event_system::sync_hook(|_| {
                    Ok(spyglass_event_system::EventAction::Continue)
                }),
            );
            if self.fail_load {
                return Err(ModuleError::Execution("refusing to load".to_string()));
            }
            self.push(format!("load:{}:{reloading}", self.generation));
            Ok(())
        }

        async fn on_unload(
            &self,
            _ctx: ModuleContext,
            reloading: bool,
        ) -> Result<(), ModuleError> {
            self.push(format!("unload:{}:{reloading}", self.generation));
            Ok(())
        }

        async fn callback(&self, key: &str, _ctx: ModuleContext) -> Result<(), ModuleError> {
            match key {
                "tick" => {
                    self.push(format!("tick:{}", self.generation));
                    Ok(())
                }
                other => Err(ModuleError::UnknownCallback {
                    module: self.name.clone(),
                    key: other.to_string(),
                }),
            }
        }
    }

    struct GenerationFactory {
        name: &'static str,
        generation: AtomicU32,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl GenerationFactory {
        fn new(name: &'static str, log: Arc<StdMutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                generation: AtomicU32::new(0),
                log,
            })
        }

        fn bump(&self) {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ModuleFactory for GenerationFactory {
        fn create(&self) -> Result<Arc<dyn Module>, ModuleError> {
            Ok(Arc::new(TestModule::new(
                self.name,
                self.generation.load(Ordering::SeqCst),
                self.log.clone(),
            )))
        }
    }

    fn setup(
        name: &'static str,
    ) -> (
        ModuleRegistry,
        Arc<dyn ProxyContext>,
        Arc<GenerationFactory>,
        Arc<StdMutex<Vec<String>>>,
    ) {
        let registry = ModuleRegistry::new();
        let proxy = StubProxy::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let factory = GenerationFactory::new(name, log.clone());
        registry.register_factory(name, factory.clone());
        (registry, proxy, factory, log)
    }

    #[tokio::test]
    async fn import_duplicate_name_fails() {
        let (registry, proxy, _factory, _log) = setup("dup");
        registry.import_from_factory("dup", &proxy, false).unwrap();
        assert!(matches!(
            registry.import_from_factory("dup", &proxy, false),
            Err(ModuleError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn load_unload_state_transitions() {
        let (registry, proxy, _factory, log) = setup("lifecycle");
        registry
            .import_from_factory("lifecycle", &proxy, false)
            .unwrap();

        assert!(!registry.is_loaded("lifecycle"));
        registry.load("lifecycle", proxy.clone()).await.unwrap();
        assert!(registry.is_loaded("lifecycle"));
        assert!(matches!(
            registry.load("lifecycle", proxy.clone()).await,
            Err(ModuleError::InvalidState(_))
        ));

        registry.unload("lifecycle", proxy.clone()).await.unwrap();
        assert!(!registry.is_loaded("lifecycle"));
        assert!(matches!(
            registry.unload("lifecycle", proxy.clone()).await,
            Err(ModuleError::InvalidState(_))
        ));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["load:0:false".to_string(), "unload:0:false".into()]
        );
    }

    #[tokio::test]
    async fn unload_releases_owned_hooks() {
        let (registry, proxy, _factory, _log) = setup("owner");
        registry
            .import_from_factory("owner", &proxy, false)
            .unwrap();
        registry.load("owner", proxy.clone()).await.unwrap();
        assert_eq!(
            proxy
                .hooks()
                .hook_count(spyglass_event_system::Direction::ClientToServer, "chat"),
            1
        );

        registry.unload("owner", proxy.clone()).await.unwrap();
        assert_eq!(
            proxy
                .hooks()
                .hook_count(spyglass_event_system::Direction::ClientToServer, "chat"),
            0
        );
    }

    #[tokio::test]
    async fn essential_module_unload_guard() {
        let (registry, proxy, _factory, _log) = setup("core");
        registry.import_from_factory("core", &proxy, true).unwrap();
        registry.load("core", proxy.clone()).await.unwrap();

        // Plain unload is refused...
        assert!(matches!(
            registry.unload("core", proxy.clone()).await,
            Err(ModuleError::InvalidState(_))
        ));
        assert!(registry.is_loaded("core"));

        // ...but a reload (which unloads with reloading = true) succeeds.
        registry.reload("core", proxy.clone()).await.unwrap();
        assert!(registry.is_loaded("core"));
        assert!(registry.get("core").unwrap().is_essential());
    }

    #[tokio::test]
    async fn reload_migrates_preserved_state() {
        let (registry, proxy, factory, log) = setup("stateful");
        registry
            .import_from_factory("stateful", &proxy, false)
            .unwrap();
        registry.load("stateful", proxy.clone()).await.unwrap();

        let old = registry.get("stateful").unwrap();
        let cell = old.module().state().get::<StdMutex<u64>>("count").unwrap();
        *cell.lock().unwrap() = 17;

        factory.bump();
        registry.reload("stateful", proxy.clone()).await.unwrap();

        let new = registry.get("stateful").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        // The preserved cell transferred verbatim (same allocation).
        let migrated = new.module().state().get::<StdMutex<u64>>("count").unwrap();
        assert!(Arc::ptr_eq(&cell, &migrated));
        assert_eq!(*migrated.lock().unwrap(), 17);

        // old.current points at the replacement.
        assert!(Arc::ptr_eq(&old.current().unwrap(), &new));
        assert!(Arc::ptr_eq(&new.previous().unwrap(), &old));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "load:0:false".to_string(),
                "unload:0:true".into(),
                "load:1:true".into()
            ]
        );
    }

    #[tokio::test]
    async fn bound_callbacks_follow_the_version_chain() {
        let (registry, proxy, factory, log) = setup("ticker");
        registry
            .import_from_factory("ticker", &proxy, false)
            .unwrap();
        registry.load("ticker", proxy.clone()).await.unwrap();

        let old = registry.get("ticker").unwrap();
        let callback = old.context(proxy.clone()).bind_callback("tick");

        callback.invoke(proxy.clone()).await.unwrap();
        factory.bump();
        registry.reload("ticker", proxy.clone()).await.unwrap();
        callback.invoke(proxy.clone()).await.unwrap();

        let entries = log.lock().unwrap().clone();
        assert!(entries.contains(&"tick:0".to_string()));
        assert!(entries.contains(&"tick:1".to_string()));
    }

    #[tokio::test]
    async fn chain_is_collapsed_on_every_reload() {
        let (registry, proxy, factory, _log) = setup("chained");
        registry
            .import_from_factory("chained", &proxy, false)
            .unwrap();
        registry.load("chained", proxy.clone()).await.unwrap();
        let m0 = registry.get("chained").unwrap();

        factory.bump();
        registry.reload("chained", proxy.clone()).await.unwrap();
        let m1 = registry.get("chained").unwrap();

        factory.bump();
        registry.reload("chained", proxy.clone()).await.unwrap();
        let m2 = registry.get("chained").unwrap();

        factory.bump();
        registry.reload("chained", proxy.clone()).await.unwrap();
        let m3 = registry.get("chained").unwrap();

        // Only the direct predecessor is held strongly.
        assert!(Arc::ptr_eq(&m3.previous().unwrap(), &m2));
        assert!(m1.previous().is_none());
        assert!(m0.previous().is_none());

        // Every retired generation forwards to the newest instance.
        assert!(Arc::ptr_eq(&m0.latest(), &m3));
        assert!(Arc::ptr_eq(&m1.latest(), &m3));
    }

    #[tokio::test]
    async fn reload_failure_keeps_old_module_running() {
        let (registry, proxy, _factory, _log) = setup("sturdy");
        registry
            .import_from_factory("sturdy", &proxy, false)
            .unwrap();
        registry.load("sturdy", proxy.clone()).await.unwrap();
        let old = registry.get("sturdy").unwrap();

        // Simulate the module's code source disappearing.
        registry.factories.remove("sturdy");

        assert!(matches!(
            registry.reload("sturdy", proxy.clone()).await,
            Err(ModuleError::ReloadFailure(_))
        ));
        assert!(registry.is_loaded("sturdy"));
        assert!(Arc::ptr_eq(&registry.get("sturdy").unwrap(), &old));
        assert!(old.current().is_none());
    }

    struct FlakyFactory {
        generation: AtomicU32,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl ModuleFactory for FlakyFactory {
        fn create(&self) -> Result<Arc<dyn Module>, ModuleError> {
            let generation = self.generation.load(Ordering::SeqCst);
            // Generation 0 loads fine; every later generation refuses to.
            Ok(Arc::new(TestModule::failing(
                "flaky",
                generation,
                self.log.clone(),
                generation > 0,
            )))
        }
    }

    #[tokio::test]
    async fn reload_rolls_back_when_new_module_fails_to_load() {
        let registry = ModuleRegistry::new();
        let proxy = StubProxy::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let factory = Arc::new(FlakyFactory {
            generation: AtomicU32::new(0),
            log: log.clone(),
        });
        registry.register_factory("flaky", factory.clone());
        registry.import_from_factory("flaky", &proxy, false).unwrap();
        registry.load("flaky", proxy.clone()).await.unwrap();
        let old = registry.get("flaky").unwrap();

        factory.generation.store(1, Ordering::SeqCst);
        assert!(matches!(
            registry.reload("flaky", proxy.clone()).await,
            Err(ModuleError::ReloadFailure(_))
        ));

        // The old instance is back in service: still the registry entry,
        // still loaded, hooks re-registered, not superseded.
        assert!(Arc::ptr_eq(&registry.get("flaky").unwrap(), &old));
        assert!(old.is_loaded());
        assert!(old.current().is_none());
        assert_eq!(
            proxy
                .hooks()
                .hook_count(spyglass_event_system::Direction::ClientToServer, "chat"),
            1
        );

        // Lifecycle: generation 0 loaded, unloaded for the reload, then
        // restored. The failing generation never completed a load.
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "load:0:false".to_string(),
                "unload:0:true".into(),
                "load:0:true".into(),
            ]
        );
    }

    #[tokio::test]
    async fn reload_without_origin_is_invalid() {
        let registry = ModuleRegistry::new();
        let proxy = StubProxy::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let module: Arc<dyn Module> = Arc::new(TestModule::new("anchored", 0, log));
        registry.insert_direct(module, &proxy, false).unwrap();
        registry.load("anchored", proxy.clone()).await.unwrap();

        assert!(matches!(
            registry.reload("anchored", proxy.clone()).await,
            Err(ModuleError::InvalidState(_))
        ));
    }

    struct RenamingFactory {
        generation: AtomicU32,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl ModuleFactory for RenamingFactory {
        fn create(&self) -> Result<Arc<dyn Module>, ModuleError> {
            let generation = self.generation.load(Ordering::SeqCst);
            let name = if generation == 0 { "alpha" } else { "alpha_two" };
            Ok(Arc::new(TestModule::new(name, generation, self.log.clone())))
        }
    }

    #[tokio::test]
    async fn renamed_module_replaces_registry_entry() {
        let registry = ModuleRegistry::new();
        let proxy = StubProxy::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let factory = Arc::new(RenamingFactory {
            generation: AtomicU32::new(0),
            log,
        });
        registry.register_factory("alpha", factory.clone());
        registry.import_from_factory("alpha", &proxy, false).unwrap();
        registry.load("alpha", proxy.clone()).await.unwrap();

        factory.generation.store(1, Ordering::SeqCst);
        registry.reload("alpha", proxy.clone()).await.unwrap();

        assert!(registry.get("alpha").is_none());
        assert!(registry.is_loaded("alpha_two"));
    }

    #[tokio::test]
    async fn module_config_is_hydrated_on_import() {
        let registry = ModuleRegistry::new();
        let proxy = StubProxy::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let factory = GenerationFactory::new("configured", log);
        registry.register_factory("configured", factory);
        registry
            .import_from_factory("configured", &proxy, false)
            .unwrap();

        let entry = registry.get("configured").unwrap();
        let ctx = entry.context(proxy.clone());
        assert_eq!(ctx.config(), Some(&json!({ "answer": 42 })));
    }
}
