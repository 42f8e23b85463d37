// Copyright (c) 2024-present, wal-relay
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    proc::loader::{ModuleHandle, ModuleLoader, ProcSymbol},
    proc::port::ProcContext,
    row::Row,
    stream::RowStream,
    HashMap,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

type MockStreamInner = Mutex<Vec<Row>>;

/// Mock in-memory row sink
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Default)]
pub struct MockStream {
    rows: Arc<MockStreamInner>,
    fail_lsns: Arc<Mutex<Vec<(u32, i64)>>>,
}

impl MockStream {
    /// Returns a copy of the collected rows.
    #[must_use]
    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().expect("lock is poisoned").clone()
    }

    /// Counts collected rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().expect("lock is poisoned").len()
    }

    /// Returns `true` if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().expect("lock is poisoned").is_empty()
    }

    /// Makes the sink reject the row with the given position.
    pub fn fail_on(&self, replica_id: u32, lsn: i64) {
        self.fail_lsns
            .lock()
            .expect("lock is poisoned")
            .push((replica_id, lsn));
    }
}

impl RowStream for MockStream {
    fn write(&mut self, row: &Row) -> crate::Result<()> {
        if self
            .fail_lsns
            .lock()
            .expect("lock is poisoned")
            .contains(&(row.replica_id, row.lsn))
        {
            return Err(crate::Error::Proc(format!(
                "injected sink failure at {{{}: {}}}",
                row.replica_id, row.lsn,
            )));
        }

        self.rows.lock().expect("lock is poisoned").push(row.clone());
        Ok(())
    }
}

type MockProc = Arc<dyn Fn(&mut ProcContext<'_>, &[u8]) -> i32 + Send + Sync>;

#[derive(Default)]
struct MockLoaderInner {
    packages: Mutex<HashMap<String, HashMap<String, MockProc>>>,
    load_seq: AtomicU64,
    last_probe: Mutex<Option<Arc<AtomicBool>>>,
}

/// Mock module loader
///
/// Lets cache, reload and refcount semantics be exercised without
/// compiling shared objects. Each load snapshots the published symbol
/// table — like a real `dlopen`, later publications do not affect
/// already-open handles — and produces a distinct handle carrying a
/// fresh generation number.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Default)]
pub struct MockLoader(Arc<MockLoaderInner>);

impl MockLoader {
    /// Publishes a symbol in a package.
    pub fn publish<F>(&self, package: &str, symbol: &str, proc: F)
    where
        F: Fn(&mut ProcContext<'_>, &[u8]) -> i32 + Send + Sync + 'static,
    {
        self.0
            .packages
            .lock()
            .expect("lock is poisoned")
            .entry(package.to_owned())
            .or_default()
            .insert(symbol.to_owned(), Arc::new(proc));
    }

    /// Publishes a symbol that echoes its arguments and succeeds.
    pub fn publish_echo(&self, package: &str, symbol: &str) {
        self.publish(package, symbol, |ctx, args| {
            let bytes = args.to_vec();
            ctx.port().write_bytes(&bytes);
            0
        });
    }

    /// Removes a symbol from future loads of a package.
    pub fn retract(&self, package: &str, symbol: &str) {
        if let Some(symbols) = self
            .0
            .packages
            .lock()
            .expect("lock is poisoned")
            .get_mut(package)
        {
            symbols.remove(symbol);
        }
    }

    /// Returns the release probe of the most recent load: set to `true`
    /// when that handle is dropped.
    #[must_use]
    pub fn last_probe(&self) -> Option<Arc<AtomicBool>> {
        self.0.last_probe.lock().expect("lock is poisoned").clone()
    }
}

impl ModuleLoader for MockLoader {
    type Handle = MockHandle;

    fn load(&self, package: &str) -> crate::Result<MockHandle> {
        let packages = self.0.packages.lock().expect("lock is poisoned");

        let Some(symbols) = packages.get(package) else {
            return Err(crate::Error::LoadModule {
                package: package.to_owned(),
                reason: "module not found".to_owned(),
            });
        };

        let closed = Arc::new(AtomicBool::new(false));
        *self.0.last_probe.lock().expect("lock is poisoned") = Some(closed.clone());

        Ok(MockHandle {
            generation: self.0.load_seq.fetch_add(1, Ordering::AcqRel) + 1,
            symbols: symbols.clone(),
            closed,
        })
    }
}

/// Mock module handle
#[allow(clippy::module_name_repetitions)]
pub struct MockHandle {
    generation: u64,
    symbols: HashMap<String, MockProc>,
    closed: Arc<AtomicBool>,
}

impl MockHandle {
    /// Returns the load generation, distinct per load.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl ModuleHandle for MockHandle {
    fn resolve(&self, symbol: &str) -> crate::Result<Arc<dyn ProcSymbol>> {
        let proc = self
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| crate::Error::LoadFunction {
                name: symbol.to_owned(),
                reason: "symbol is not exported".to_owned(),
            })?;

        Ok(Arc::new(MockSymbol { proc }))
    }
}

struct MockSymbol {
    proc: MockProc,
}

impl ProcSymbol for MockSymbol {
    fn invoke(&self, ctx: &mut ProcContext<'_>, args: &[u8]) -> i32 {
        (self.proc)(ctx, args)
    }
}
