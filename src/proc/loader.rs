// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::port::ProcContext;
use path_absolutize::Absolutize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Signature of an exported stored-procedure symbol.
///
/// The procedure receives the execution context and the packed argument
/// bytes as a `[begin, end)` range, and pushes results through the port
/// attached to the context. Non-zero means failure.
pub type ProcRawFn =
    unsafe extern "C" fn(*mut std::ffi::c_void, *const u8, *const u8) -> std::os::raw::c_int;

/// A resolved, callable symbol.
///
/// Bindings cache these as the "address"; handles never do — they always
/// dereference through their binding so reload can swap the address
/// underneath them.
pub trait ProcSymbol: Send + Sync {
    /// Invokes the procedure. Non-zero means failure.
    fn invoke(&self, ctx: &mut ProcContext<'_>, args: &[u8]) -> i32;
}

/// An open module: the OS library handle boundary.
pub trait ModuleHandle: Send + Sync {
    /// Resolves an exported symbol.
    ///
    /// Not-found is a client error (`LoadFunction`), not a system error.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the symbol is not exported by the module.
    fn resolve(&self, symbol: &str) -> crate::Result<Arc<dyn ProcSymbol>>;
}

/// The OS library loader boundary.
///
/// The production implementation is [`DsoLoader`]; tests substitute a
/// mock so cache and reload semantics can be exercised without compiling
/// shared objects.
pub trait ModuleLoader: Send + Sync {
    /// The handle type produced by this loader.
    type Handle: ModuleHandle;

    /// Loads a package, producing a fresh handle.
    ///
    /// Every call must produce a *distinct* handle even for an unchanged
    /// package name — reload depends on it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the package cannot be found or loaded.
    fn load(&self, package: &str) -> crate::Result<Self::Handle>;
}

/// Platform suffix of dynamic shared objects.
#[cfg(target_os = "macos")]
pub const DSO_SUFFIX: &str = "dylib";

/// Platform suffix of dynamic shared objects.
#[cfg(target_os = "windows")]
pub const DSO_SUFFIX: &str = "dll";

/// Platform suffix of dynamic shared objects.
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const DSO_SUFFIX: &str = "so";

/// Loads stored-procedure modules with `dlopen`.
///
/// The OS loader keys open libraries by path and would return the same
/// handle for a path loaded twice, which breaks reload. Loading therefore
/// goes through a shadow copy: the resolved file is copied into a unique
/// staging directory (under the platform temp dir, `TMPDIR` on Unix),
/// opened from there, and the copy is removed immediately — the open
/// handle keeps the mapping alive.
pub struct DsoLoader {
    search_paths: Vec<PathBuf>,
}

impl DsoLoader {
    /// Creates a loader searching the given directories.
    #[must_use]
    pub fn new<I, P>(search_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: search_paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolves a package name to an absolute module path.
    ///
    /// `a.b.c` maps to `a/b/c.<suffix>` under each search path in order.
    ///
    /// # Errors
    ///
    /// Will return `Err` if no search path holds the module.
    pub fn find(&self, package: &str) -> crate::Result<PathBuf> {
        let relative: PathBuf = package.split('.').collect();

        for dir in &self.search_paths {
            let candidate = dir.join(&relative).with_extension(DSO_SUFFIX);

            if candidate.is_file() {
                let absolute = candidate
                    .absolutize()
                    .map(|path| path.to_path_buf())
                    .map_err(crate::Error::Io)?;
                return Ok(absolute);
            }
        }

        Err(crate::Error::LoadModule {
            package: package.to_owned(),
            reason: "module not found in the search path".to_owned(),
        })
    }
}

impl ModuleLoader for DsoLoader {
    type Handle = DsoHandle;

    fn load(&self, package: &str) -> crate::Result<DsoHandle> {
        let path = self.find(package)?;

        let staging = tempfile::Builder::new()
            .prefix("wal-relay-mod.")
            .tempdir()
            .map_err(crate::Error::Io)?;

        let file_name = path.file_name().ok_or_else(|| crate::Error::LoadModule {
            package: package.to_owned(),
            reason: format!("module path {path:?} has no file name"),
        })?;

        let shadow = staging.path().join(file_name);
        std::fs::copy(&path, &shadow)?;

        log::debug!("loading module {package:?} from {path:?} via {shadow:?}");

        let library = open_library(&shadow).map_err(|e| crate::Error::LoadModule {
            package: package.to_owned(),
            reason: e.to_string(),
        })?;

        // The open handle keeps the mapping alive; drop the staging
        // directory (unlink + rmdir) right away
        if let Err(e) = staging.close() {
            log::warn!("failed to remove module staging dir: {e:?}");
        }

        Ok(DsoHandle {
            library: Arc::new(library),
        })
    }
}

/// Resolve symbols eagerly, keep them out of the global namespace.
#[cfg(unix)]
fn open_library(path: &Path) -> Result<libloading::Library, libloading::Error> {
    use libloading::os::unix::{Library, RTLD_LOCAL, RTLD_NOW};

    unsafe { Library::open(Some(path), RTLD_NOW | RTLD_LOCAL) }.map(Into::into)
}

#[cfg(not(unix))]
fn open_library(path: &Path) -> Result<libloading::Library, libloading::Error> {
    unsafe { libloading::Library::new(path) }
}

/// An open dynamic shared object.
pub struct DsoHandle {
    library: Arc<libloading::Library>,
}

impl ModuleHandle for DsoHandle {
    fn resolve(&self, symbol: &str) -> crate::Result<Arc<dyn ProcSymbol>> {
        let raw = unsafe {
            self.library
                .get::<ProcRawFn>(symbol.as_bytes())
                .map(|sym| *sym)
        }
        .map_err(|e| crate::Error::LoadFunction {
            name: symbol.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(Arc::new(DsoSymbol {
            raw,
            // Keeps the mapping alive for as long as any clone of the
            // resolved symbol can still be invoked
            _library: self.library.clone(),
        }))
    }
}

struct DsoSymbol {
    raw: ProcRawFn,
    _library: Arc<libloading::Library>,
}

impl ProcSymbol for DsoSymbol {
    fn invoke(&self, ctx: &mut ProcContext<'_>, args: &[u8]) -> i32 {
        let begin = args.as_ptr();
        // SAFETY: `begin + len` stays within (one past) the `args`
        // allocation; the symbol upholds the `(ctx, begin, end) -> int`
        // convention by contract of the module format
        unsafe {
            (self.raw)(
                std::ptr::addr_of_mut!(*ctx).cast(),
                begin,
                begin.add(args.len()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    #[allow(clippy::expect_used)]
    fn find_maps_dots_to_directories() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let nested = folder.path().join("acme").join("geo");
        std::fs::create_dir_all(&nested)?;

        let module = nested.join("distance").with_extension(DSO_SUFFIX);
        std::fs::write(&module, b"not really a library")?;

        let loader = DsoLoader::new([folder.path()]);
        let hit = loader.find("acme.geo.distance").expect("should resolve");

        assert!(hit.is_absolute());
        assert_eq!(module, hit);

        assert!(matches!(
            loader.find("acme.geo.area"),
            Err(crate::Error::LoadModule { .. })
        ));

        Ok(())
    }
}
