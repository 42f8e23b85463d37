// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    cache::ModuleCache,
    func::Session,
    loader::{ModuleHandle, ModuleLoader},
    port::Port,
    symbol::SymbolBinding,
};
use crate::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, Mutex,
};

struct RegisteredFunc<H: ModuleHandle> {
    name: String,
    binding: Arc<SymbolBinding<H>>,
    load_count: AtomicI64,
}

/// Shared state behind a [`FuncRegistry`]
#[allow(clippy::module_name_repetitions)]
pub struct FuncRegistryInner<L: ModuleLoader> {
    cache: ModuleCache<L>,
    funcs: Mutex<HashMap<String, Arc<RegisteredFunc<L::Handle>>>>,
}

/// Host-facing registry of loadable stored procedures.
///
/// The embedding host (console, scripting runtime) wraps these
/// operations: `func.load(name)` hands out a [`FuncHandle`],
/// `func.unload(name)` drops one load, `module.reload(name)` hot-swaps a
/// package. A function stays registered while any load references it.
#[allow(clippy::module_name_repetitions)]
pub struct FuncRegistry<L: ModuleLoader>(Arc<FuncRegistryInner<L>>);

impl<L: ModuleLoader> Clone for FuncRegistry<L> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<L: ModuleLoader> std::ops::Deref for FuncRegistry<L> {
    type Target = FuncRegistryInner<L>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<L: ModuleLoader> FuncRegistry<L> {
    /// Creates a registry over a fresh module cache.
    #[must_use]
    pub fn new(loader: L) -> Self {
        Self(Arc::new(FuncRegistryInner {
            cache: ModuleCache::new(loader),
            funcs: Mutex::new(HashMap::default()),
        }))
    }

    /// Returns the module cache behind the registry.
    #[must_use]
    pub fn cache(&self) -> &ModuleCache<L> {
        &self.cache
    }

    /// Loads a function by name, creating the registration on first use
    /// or referencing the existing one.
    ///
    /// The module itself is loaded lazily, on the first call through the
    /// handle.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the name is empty.
    pub fn load(&self, name: &str) -> crate::Result<FuncHandle<L>> {
        if name.is_empty() {
            return Err(crate::Error::IllegalParams(
                "expects load('name') but no name passed".to_owned(),
            ));
        }

        let mut funcs = self.funcs.lock().expect("lock is poisoned");

        let func = funcs
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(RegisteredFunc {
                    name: name.to_owned(),
                    binding: SymbolBinding::new(name),
                    load_count: AtomicI64::new(0),
                })
            })
            .clone();

        func.load_count.fetch_add(1, Ordering::AcqRel);

        Ok(FuncHandle {
            registry: self.clone(),
            func,
            released: AtomicBool::new(false),
        })
    }

    /// Drops one load of a function by name.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the function is not registered.
    pub fn unload(&self, name: &str) -> crate::Result<()> {
        if name.is_empty() {
            return Err(crate::Error::IllegalParams(
                "expects unload('name') but no name passed".to_owned(),
            ));
        }

        if !self.release_one(name) {
            return Err(crate::Error::NoSuchFunction(name.to_owned()));
        }

        Ok(())
    }

    /// Reloads every function of a module from a fresh copy of its
    /// library.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the module was never loaded
    /// (`NoSuchModule`), or if the fresh copy cannot serve every bound
    /// symbol — the old module stays in place then.
    pub fn reload(&self, package: &str) -> crate::Result<()> {
        if package.is_empty() {
            return Err(crate::Error::IllegalParams(
                "expects reload('name') but no name passed".to_owned(),
            ));
        }

        match self.cache.reload(package)? {
            Some(_) => Ok(()),
            None => Err(crate::Error::NoSuchModule(package.to_owned())),
        }
    }

    /// Returns the load count of a registered function, 0 if absent.
    #[must_use]
    pub fn load_count(&self, name: &str) -> i64 {
        self.funcs
            .lock()
            .expect("lock is poisoned")
            .get(name)
            .map_or(0, |func| func.load_count.load(Ordering::Acquire))
    }

    /// Drops one load; removes the registration and detaches its binding
    /// when the count hits zero. Returns `false` if the name is unknown.
    fn release_one(&self, name: &str) -> bool {
        let mut funcs = self.funcs.lock().expect("lock is poisoned");

        let Some(func) = funcs.get(name) else {
            return false;
        };

        debug_assert!(func.load_count.load(Ordering::Acquire) > 0);

        if func.load_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let func = func.clone();
            funcs.remove(name);
            drop(funcs);

            // Last load gone: take the binding out of the module cache;
            // the handle storage itself lives until the last wrapper
            // drops
            self.cache.unbind(&func.binding);
        }

        true
    }
}

/// Host-visible handle to a loaded function.
///
/// The handle never caches the symbol address — every call dereferences
/// through the registered binding, so a reload retargets all handles at
/// once.
pub struct FuncHandle<L: ModuleLoader> {
    registry: FuncRegistry<L>,
    func: Arc<RegisteredFunc<L::Handle>>,
    released: AtomicBool,
}

impl<L: ModuleLoader> FuncHandle<L> {
    /// Returns the stored function name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.func.name
    }

    /// Returns the binding the handle dereferences through.
    #[must_use]
    pub fn binding(&self) -> &Arc<SymbolBinding<L::Handle>> {
        &self.func.binding
    }

    /// Invokes the function with packed arguments.
    ///
    /// Resolves the binding on first use — including after the function
    /// was unloaded, in which case the module is simply loaded again.
    ///
    /// # Errors
    ///
    /// Will return `Err` if resolving fails or the procedure reports
    /// failure.
    pub fn call(
        &self,
        session: &mut Session,
        args: &[u8],
        ret: &mut Port,
    ) -> crate::Result<()> {
        self.registry
            .cache
            .call(&self.func.binding, session.region_mut(), args, ret)
    }

    /// Drops this handle's load. Safe to call more than once — the
    /// refcount floor is zero.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.registry.release_one(&self.func.name);
        }
    }
}

impl<L: ModuleLoader> Drop for FuncHandle<L> {
    fn drop(&mut self) {
        self.release();
    }
}
