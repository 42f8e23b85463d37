// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    cache::Module,
    loader::{ModuleHandle, ProcSymbol},
};
use std::sync::{Arc, Mutex};

/// A function name split into its package and symbol parts.
///
/// The split is on the last dot: `foo.bar.baz` names symbol `baz` in
/// package `foo.bar`. Without a dot the whole name is both package and
/// symbol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FuncName<'a> {
    package: &'a str,
    sym: &'a str,
}

impl<'a> FuncName<'a> {
    /// Parses a function name.
    #[must_use]
    pub fn parse(name: &'a str) -> Self {
        match name.rsplit_once('.') {
            Some((package, sym)) => Self { package, sym },
            None => Self {
                package: name,
                sym: name,
            },
        }
    }

    /// Returns the package part.
    #[must_use]
    pub fn package(&self) -> &'a str {
        self.package
    }

    /// Returns the symbol part.
    #[must_use]
    pub fn sym(&self) -> &'a str {
        self.sym
    }
}

struct BindState<H: ModuleHandle> {
    module: Option<Arc<Module<H>>>,
    addr: Option<Arc<dyn ProcSymbol>>,
}

/// Named association from a symbol name to an address inside a module.
///
/// The address is unset until first use and after a failed reload;
/// resolving goes through the module cache. Handles never copy the
/// address out — they dereference through the binding on every call, so
/// a reload can swap module and address underneath them.
pub struct SymbolBinding<H: ModuleHandle> {
    name: String,
    state: Mutex<BindState<H>>,
}

impl<H: ModuleHandle> SymbolBinding<H> {
    /// Creates an unresolved binding.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(BindState {
                module: None,
                addr: None,
            }),
        })
    }

    /// Returns the full function name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` while the binding points into a module.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.state.lock().expect("lock is poisoned").addr.is_some()
    }

    /// Returns the module the binding currently points into.
    #[must_use]
    pub fn module(&self) -> Option<Arc<Module<H>>> {
        self.state
            .lock()
            .expect("lock is poisoned")
            .module
            .clone()
    }

    /// Returns the module and address pair, if resolved.
    pub(crate) fn resolved(&self) -> Option<(Arc<Module<H>>, Arc<dyn ProcSymbol>)> {
        let state = self.state.lock().expect("lock is poisoned");
        match (&state.module, &state.addr) {
            (Some(module), Some(addr)) => Some((module.clone(), addr.clone())),
            _ => None,
        }
    }

    /// Points the binding into a module.
    pub(crate) fn attach(&self, module: Arc<Module<H>>, addr: Arc<dyn ProcSymbol>) {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.module = Some(module);
        state.addr = Some(addr);
    }

    /// Clears the binding, returning the module it pointed into.
    pub(crate) fn detach(&self) -> Option<Arc<Module<H>>> {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.addr = None;
        state.module.take()
    }
}
