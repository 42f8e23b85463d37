// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    cache::ModuleCache,
    loader::ModuleLoader,
    port::{Port, Region},
    symbol::SymbolBinding,
};
use crate::HashMap;
use std::sync::{Arc, Mutex};

/// Privilege bit: execute the object.
pub const PRIV_EXECUTE: u8 = 0x01;

/// Privilege bit: use the object at all.
pub const PRIV_USAGE: u8 = 0x02;

/// Privileges a function call requires from the effective identity.
pub const FUNC_CALL_ACCESS: u8 = PRIV_EXECUTE | PRIV_USAGE;

/// Effective identity of the session executing a call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Credentials {
    /// User id
    pub uid: u32,

    /// Privileges granted on every object
    pub universal: u8,

    /// Privileges granted on the function entity class
    pub entity_func: u8,
}

impl Credentials {
    /// Creates credentials with universal access, the administrative
    /// identity.
    #[must_use]
    pub fn admin(uid: u32) -> Self {
        Self {
            uid,
            universal: FUNC_CALL_ACCESS,
            entity_func: 0,
        }
    }

    /// Creates credentials with no grants at all.
    #[must_use]
    pub fn restricted(uid: u32) -> Self {
        Self {
            uid,
            universal: 0,
            entity_func: 0,
        }
    }
}

/// Resolves user ids to credentials.
///
/// The access-control store is an external collaborator; the dispatcher
/// only needs owner lookup for setuid calls.
pub trait UserDirectory {
    /// Returns the credentials of a user, `None` if the user is unknown.
    fn find(&self, uid: u32) -> Option<Credentials>;
}

/// Per-task execution state: the effective identity and the call scratch
/// region.
pub struct Session {
    credentials: Credentials,
    region: Region,
}

impl Session {
    /// Creates a session running under the given identity.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            region: Region::new(),
        }
    }

    /// Returns the effective identity.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Returns the call scratch region.
    pub fn region_mut(&mut self) -> &mut Region {
        &mut self.region
    }

    pub(crate) fn swap_credentials(&mut self, credentials: Credentials) -> Credentials {
        std::mem::replace(&mut self.credentials, credentials)
    }
}

/// Restores the caller's identity on every exit path, including
/// unwinding.
struct IdentityGuard<'a> {
    session: &'a mut Session,
    orig: Option<Credentials>,
}

impl<'a> IdentityGuard<'a> {
    fn new(session: &'a mut Session, assume: Option<Credentials>) -> Self {
        let orig = assume.map(|credentials| session.swap_credentials(credentials));
        Self { session, orig }
    }

    fn session(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        if let Some(orig) = self.orig.take() {
            self.session.swap_credentials(orig);
        }
    }
}

/// Definition of a callable function.
#[derive(Clone, Debug)]
pub struct FuncDef {
    /// Function name
    pub name: String,

    /// Owner user id
    pub uid: u32,

    /// Run under the owner's identity instead of the caller's
    pub setuid: bool,
}

/// The invocation seam of a function.
///
/// Native-library symbols are implemented here ([`NativeBackend`]);
/// embedded-script and SQL-builtin functions are external collaborators
/// plugging in through this trait.
pub trait FuncBackend: Send + Sync {
    /// Invokes the function with packed arguments, pushing results
    /// through the port.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the function fails.
    fn call(&self, session: &mut Session, args: &[u8], ret: &mut Port) -> crate::Result<()>;
}

/// Backend calling a native-library symbol through the module cache.
pub struct NativeBackend<L: ModuleLoader> {
    cache: ModuleCache<L>,
    binding: Arc<SymbolBinding<L::Handle>>,
}

impl<L: ModuleLoader> NativeBackend<L> {
    /// Creates a backend over a cached binding.
    #[must_use]
    pub fn new(cache: ModuleCache<L>, binding: Arc<SymbolBinding<L::Handle>>) -> Self {
        Self { cache, binding }
    }

    /// Returns the underlying binding.
    #[must_use]
    pub fn binding(&self) -> &Arc<SymbolBinding<L::Handle>> {
        &self.binding
    }
}

impl<L: ModuleLoader> FuncBackend for NativeBackend<L> {
    fn call(&self, session: &mut Session, args: &[u8], ret: &mut Port) -> crate::Result<()> {
        self.cache
            .call(&self.binding, session.region_mut(), args, ret)
    }
}

/// A callable function object: definition, per-user grants, invocation
/// backend, and the lazily-resolved owner identity for setuid calls.
pub struct Func {
    def: FuncDef,
    backend: Box<dyn FuncBackend>,

    // Filled on first setuid call: when the function is created during
    // recovery the user store may not be populated yet
    owner_credentials: Mutex<Option<Credentials>>,

    // Nobody has access to the function but the owner until granted
    access: HashMap<u32, u8>,
}

impl Func {
    /// Creates a function object.
    #[must_use]
    pub fn new(def: FuncDef, backend: Box<dyn FuncBackend>) -> Self {
        Self {
            def,
            backend,
            owner_credentials: Mutex::new(None),
            access: HashMap::default(),
        }
    }

    /// Returns the definition.
    #[must_use]
    pub fn def(&self) -> &FuncDef {
        &self.def
    }

    /// Grants privilege bits on this function to a user.
    pub fn grant(&mut self, uid: u32, access: u8) {
        *self.access.entry(uid).or_default() |= access;
    }

    fn granted(&self, uid: u32) -> u8 {
        self.access.get(&uid).copied().unwrap_or_default()
    }

    /// Checks EXECUTE|USAGE for the effective identity.
    fn access_check(&self, credentials: &Credentials) -> crate::Result<()> {
        // Universal access covers both bits: no per-object bookkeeping
        if credentials.universal & FUNC_CALL_ACCESS == FUNC_CALL_ACCESS {
            return Ok(());
        }

        let access = FUNC_CALL_ACCESS & !credentials.entity_func;
        let func_access = access & !credentials.universal;

        if func_access & PRIV_USAGE != 0
            || (self.def.uid != credentials.uid && func_access & !self.granted(credentials.uid) != 0)
        {
            return Err(crate::Error::AccessDenied {
                access: "Execute",
                object: format!("function '{}'", self.def.name),
                user: credentials.uid,
            });
        }

        Ok(())
    }

    /// Dispatches a call: authorize, switch identity, invoke, restore.
    ///
    /// For a setuid function the owner's credentials are resolved through
    /// the user directory on first use and cached; the caller's identity
    /// is restored on every exit path.
    ///
    /// # Errors
    ///
    /// Will return `Err` on access violation, unknown owner, or callee
    /// failure.
    pub fn call(
        &self,
        session: &mut Session,
        users: &dyn UserDirectory,
        args: &[u8],
        ret: &mut Port,
    ) -> crate::Result<()> {
        self.access_check(session.credentials())?;

        let assume = if self.def.setuid {
            let mut cached = self.owner_credentials.lock().expect("lock is poisoned");

            if cached.is_none() {
                let owner = users.find(self.def.uid).ok_or_else(|| {
                    crate::Error::IllegalParams(format!(
                        "owner {} of function '{}' is not known",
                        self.def.uid, self.def.name,
                    ))
                })?;
                *cached = Some(owner);
            }

            cached.clone()
        } else {
            None
        };

        let mut guard = IdentityGuard::new(session, assume);
        self.backend.call(guard.session(), args, ret)
    }
}
