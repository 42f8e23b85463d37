// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    loader::{ModuleHandle, ModuleLoader},
    port::{Port, ProcContext, Region},
    symbol::{FuncName, SymbolBinding},
};
use crate::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

/// A loaded stored-procedure module.
///
/// Released (the OS handle closed) when the last reference drops, which
/// is exactly when no binding points into it anymore *and* no call is in
/// flight — an in-flight call pins the module for its dynamic extent.
pub struct Module<H: ModuleHandle> {
    package: String,
    handle: H,
    live_calls: AtomicU64,
}

impl<H: ModuleHandle> Module<H> {
    fn new(package: impl Into<String>, handle: H) -> Self {
        Self {
            package: package.into(),
            handle,
            live_calls: AtomicU64::new(0),
        }
    }

    /// Returns the package name the module was loaded for.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Returns the OS handle boundary.
    #[must_use]
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Counts currently-executing invocations inside this module.
    #[must_use]
    pub fn live_calls(&self) -> u64 {
        self.live_calls.load(Ordering::Acquire)
    }
}

impl<H: ModuleHandle> Drop for Module<H> {
    fn drop(&mut self) {
        log::trace!("releasing module {:?}", self.package);
    }
}

/// Pins a module for the dynamic extent of one call.
///
/// The increment happens before control enters the procedure and the
/// decrement after it returns, on every exit path — a procedure may
/// block (the cooperative-yield analog) while a reload retires its
/// module, and the pin keeps the old mapping alive until the call is
/// done.
struct CallGuard<H: ModuleHandle> {
    module: Arc<Module<H>>,
}

impl<H: ModuleHandle> CallGuard<H> {
    fn new(module: &Arc<Module<H>>) -> Self {
        module.live_calls.fetch_add(1, Ordering::AcqRel);
        Self {
            module: module.clone(),
        }
    }
}

impl<H: ModuleHandle> Drop for CallGuard<H> {
    fn drop(&mut self) {
        self.module.live_calls.fetch_sub(1, Ordering::AcqRel);
    }
}

struct CacheEntry<H: ModuleHandle> {
    module: Arc<Module<H>>,
    bindings: Vec<Arc<SymbolBinding<H>>>,
}

/// Shared state behind a [`ModuleCache`]
#[allow(clippy::module_name_repetitions)]
pub struct ModuleCacheInner<L: ModuleLoader> {
    loader: L,
    modules: Mutex<HashMap<String, CacheEntry<L::Handle>>>,
}

/// Package-name keyed cache of loaded modules.
///
/// Process-wide mutable state: one instance per subsystem, created by the
/// initializer and passed by reference — no hidden globals. All cache
/// mutations happen under one lock; calls into procedures never hold it.
#[allow(clippy::module_name_repetitions)]
pub struct ModuleCache<L: ModuleLoader>(Arc<ModuleCacheInner<L>>);

impl<L: ModuleLoader> Clone for ModuleCache<L> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<L: ModuleLoader> std::ops::Deref for ModuleCache<L> {
    type Target = ModuleCacheInner<L>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<L: ModuleLoader> ModuleCache<L> {
    /// Creates an empty cache over a loader.
    #[must_use]
    pub fn new(loader: L) -> Self {
        Self(Arc::new(ModuleCacheInner {
            loader,
            modules: Mutex::new(HashMap::default()),
        }))
    }

    /// Looks a module up without loading.
    #[must_use]
    pub fn find(&self, package: &str) -> Option<Arc<Module<L::Handle>>> {
        self.modules
            .lock()
            .expect("lock is poisoned")
            .get(package)
            .map(|entry| entry.module.clone())
    }

    /// Counts cached modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.lock().expect("lock is poisoned").len()
    }

    /// Returns `true` if no module is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.lock().expect("lock is poisoned").is_empty()
    }

    /// Resolves a binding: splits the name, loads the package on a cache
    /// miss, resolves the symbol, and attaches the binding to the module.
    ///
    /// A freshly loaded module stays cached even when the symbol resolve
    /// fails — it can serve later binds and is drained at shutdown.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the module cannot be loaded or the symbol is
    /// not exported.
    pub fn bind(&self, binding: &Arc<SymbolBinding<L::Handle>>) -> crate::Result<()> {
        debug_assert!(!binding.is_resolved(), "binding is already resolved");

        let name = FuncName::parse(binding.name());
        let mut modules = self.modules.lock().expect("lock is poisoned");

        if !modules.contains_key(name.package()) {
            let handle = self.loader.load(name.package())?;
            log::debug!("caching module {:?}", name.package());
            modules.insert(
                name.package().to_owned(),
                CacheEntry {
                    module: Arc::new(Module::new(name.package(), handle)),
                    bindings: Vec::new(),
                },
            );
        }

        let entry = modules
            .get_mut(name.package())
            .expect("entry was just looked up or inserted");

        let addr = entry.module.handle().resolve(name.sym())?;
        binding.attach(entry.module.clone(), addr);
        entry.bindings.push(binding.clone());

        Ok(())
    }

    /// Detaches a binding from its module.
    ///
    /// Dropping the last binding of a module removes the cache entry; the
    /// module itself is released once no call pins it anymore.
    pub fn unbind(&self, binding: &Arc<SymbolBinding<L::Handle>>) {
        let Some(module) = binding.detach() else {
            return;
        };

        let mut modules = self.modules.lock().expect("lock is poisoned");

        if let Some(entry) = modules.get_mut(module.package()) {
            entry
                .bindings
                .retain(|candidate| !Arc::ptr_eq(candidate, binding));

            if entry.bindings.is_empty() && Arc::ptr_eq(&entry.module, &module) {
                log::debug!("dropping module {:?} from the cache", module.package());
                modules.remove(module.package());
            }
        }
    }

    /// Invokes the procedure a binding points at.
    ///
    /// Resolves the binding first if its address is unset. The packed
    /// arguments are staged in the caller's scratch region, which is
    /// rolled back to its savepoint on return regardless of outcome. A
    /// non-zero return with no diagnostic set by the callee is reported
    /// as a generic procedure failure; the return port is cleared on
    /// failure.
    ///
    /// # Errors
    ///
    /// Will return `Err` if resolving fails or the procedure reports
    /// failure.
    pub fn call(
        &self,
        binding: &Arc<SymbolBinding<L::Handle>>,
        region: &mut Region,
        args: &[u8],
        ret: &mut Port,
    ) -> crate::Result<()> {
        let (module, addr) = match binding.resolved() {
            Some(resolved) => resolved,
            None => {
                self.bind(binding)?;
                binding
                    .resolved()
                    .ok_or_else(|| crate::Error::LoadFunction {
                        name: binding.name().to_owned(),
                        reason: "binding was detached concurrently".to_owned(),
                    })?
            }
        };

        // The port is an output: whatever the caller left in it is stale
        ret.clear();

        let savepoint = region.used();
        let staged = region.append(args);

        // The module may be swapped out by a reload while the procedure
        // blocks inside the call; the guard keeps the old mapping alive
        let guard = CallGuard::new(&module);

        let mut ctx = ProcContext::new(ret);
        let rc = addr.invoke(&mut ctx, region.slice(staged));
        let diag = ctx.take_error();

        drop(guard);
        region.truncate(savepoint);

        if rc != 0 {
            ret.clear();
            return Err(diag.unwrap_or_else(|| crate::Error::Proc("unknown error".to_owned())));
        }

        Ok(())
    }

    /// Reloads a package: loads a fresh copy, re-binds every binding of
    /// the old module against it, swaps the cache entry and retires the
    /// old module.
    ///
    /// Two-phase: *prepare* (load new, try-bind all) then *commit* (swap)
    /// then *retire* (old module released once no call pins it). Any
    /// bind failure in prepare rolls every already-moved binding back to
    /// the old module and destroys the new one.
    ///
    /// Returns `None` when the package was never loaded — a no-op.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the fresh copy cannot be loaded or misses a
    /// bound symbol.
    ///
    /// # Panics
    ///
    /// Panics if the rollback cannot re-bind against the old module:
    /// the old module lost symbols without being unloaded and the
    /// process state is inconsistent.
    pub fn reload(&self, package: &str) -> crate::Result<Option<Arc<Module<L::Handle>>>> {
        let mut modules = self.modules.lock().expect("lock is poisoned");

        let Some(entry) = modules.get_mut(package) else {
            // Module wasn't loaded - do nothing
            return Ok(None);
        };

        let new_module = Arc::new(Module::new(package, self.loader.load(package)?));

        let mut moved = 0usize;
        let mut failure = None;

        for binding in &entry.bindings {
            let sym = FuncName::parse(binding.name()).sym();

            match new_module.handle().resolve(sym) {
                Ok(addr) => {
                    binding.attach(new_module.clone(), addr);
                    moved += 1;
                }
                Err(e) => {
                    log::error!("module: reload {package}, symbol {sym} not found");
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            // Restore: re-resolve every moved binding against the old
            // module
            for binding in entry.bindings.iter().take(moved) {
                let sym = FuncName::parse(binding.name()).sym();

                let Ok(addr) = entry.module.handle().resolve(sym) else {
                    panic!("can't restore module function, server state is inconsistent");
                };

                binding.attach(entry.module.clone(), addr);
            }

            drop(new_module);
            return Err(e);
        }

        let old = std::mem::replace(&mut entry.module, new_module.clone());

        log::info!(
            "module {package:?} reloaded, {} binding(s) moved",
            entry.bindings.len(),
        );

        drop(modules);

        if old.live_calls() > 0 {
            log::debug!(
                "module {package:?} retired with {} call(s) still in flight",
                old.live_calls(),
            );
        }

        // Retire: released here unless a call still pins it
        drop(old);

        Ok(Some(new_module))
    }

    /// Drains the cache at subsystem teardown.
    ///
    /// Entries are removed unconditionally; modules still pinned by
    /// in-flight calls or live bindings are released when their last
    /// reference drops.
    pub fn shutdown(&self) {
        let mut modules = self.modules.lock().expect("lock is poisoned");

        for (package, entry) in modules.drain() {
            if !entry.bindings.is_empty() || entry.module.live_calls() > 0 {
                log::warn!(
                    "module {package:?} dropped with {} binding(s) and {} call(s) outstanding",
                    entry.bindings.len(),
                    entry.module.live_calls(),
                );
            }
        }
    }
}
