use std::sync::{Arc, Mutex};
use test_log::test;
use wal_relay::{
    Credentials, Func, FuncBackend, FuncDef, FuncRegistry, MockLoader, NativeBackend, Port,
    Session, UserDirectory, PRIV_USAGE,
};

fn admin_session() -> Session {
    Session::new(Credentials::admin(1))
}

#[test]
fn load_call_release() -> wal_relay::Result<()> {
    let loader = MockLoader::default();
    loader.publish_echo("geo", "distance");

    let registry = FuncRegistry::new(loader);
    let handle = registry.load("geo.distance")?;

    assert_eq!("geo.distance", handle.name());
    assert_eq!(1, registry.load_count("geo.distance"));

    let mut session = admin_session();
    let mut ret = Port::new();
    handle.call(&mut session, b"ping", &mut ret)?;
    assert_eq!(b"ping", ret.as_bytes());

    handle.release();
    assert_eq!(0, registry.load_count("geo.distance"));

    // Double release is a no-op, the refcount floor is zero
    handle.release();
    assert_eq!(0, registry.load_count("geo.distance"));

    // The module was dropped from the cache with its last binding
    assert!(registry.cache().is_empty());

    Ok(())
}

#[test]
fn loads_are_shared_and_counted() -> wal_relay::Result<()> {
    let loader = MockLoader::default();
    loader.publish_echo("geo", "distance");

    let registry = FuncRegistry::new(loader);

    let first = registry.load("geo.distance")?;
    let second = registry.load("geo.distance")?;
    assert_eq!(2, registry.load_count("geo.distance"));

    // Both handles wrap the same binding
    assert!(Arc::ptr_eq(first.binding(), second.binding()));

    registry.unload("geo.distance")?;
    assert_eq!(1, registry.load_count("geo.distance"));

    drop(first);
    assert_eq!(0, registry.load_count("geo.distance"));

    // A surviving wrapper still works: the call simply re-resolves
    let mut session = admin_session();
    let mut ret = Port::new();
    second.call(&mut session, b"again", &mut ret)?;
    assert_eq!(b"again", ret.as_bytes());

    Ok(())
}

#[test]
fn unload_of_an_unknown_function_fails() {
    let registry = FuncRegistry::new(MockLoader::default());

    assert!(matches!(
        registry.unload("ghost"),
        Err(wal_relay::Error::NoSuchFunction(_))
    ));
    assert!(matches!(
        registry.load(""),
        Err(wal_relay::Error::IllegalParams(_))
    ));
}

#[test]
fn reload_requires_a_loaded_module() -> wal_relay::Result<()> {
    let loader = MockLoader::default();
    loader.publish_echo("geo", "distance");

    let registry = FuncRegistry::new(loader);

    assert!(matches!(
        registry.reload("geo"),
        Err(wal_relay::Error::NoSuchModule(_))
    ));

    // First call pulls the module in; reload becomes possible
    let handle = registry.load("geo.distance")?;
    let mut session = admin_session();
    let mut ret = Port::new();
    handle.call(&mut session, b"", &mut ret)?;

    registry.reload("geo")?;

    Ok(())
}

#[test]
fn procedure_failure_without_diagnostic_is_synthesized() -> wal_relay::Result<()> {
    let loader = MockLoader::default();
    loader.publish("m", "fails_silently", |_ctx, _args| 1);
    loader.publish("m", "fails_loudly", |ctx, _args| {
        ctx.set_error(wal_relay::Error::Proc("told you so".to_owned()));
        1
    });

    let registry = FuncRegistry::new(loader);
    let mut session = admin_session();

    let silent = registry.load("m.fails_silently")?;
    let mut ret = Port::new();
    ret.write_bytes(b"stale");

    let result = silent.call(&mut session, b"", &mut ret);
    assert!(matches!(result, Err(wal_relay::Error::Proc(msg)) if msg == "unknown error"));

    // The port is truncated on failure
    assert!(ret.is_empty());

    // A callee-set diagnostic is not overwritten
    let loud = registry.load("m.fails_loudly")?;
    let result = loud.call(&mut session, b"", &mut ret);
    assert!(matches!(result, Err(wal_relay::Error::Proc(msg)) if msg == "told you so"));

    Ok(())
}

struct StaticUsers;

impl UserDirectory for StaticUsers {
    fn find(&self, uid: u32) -> Option<Credentials> {
        (uid == 42).then(|| Credentials::admin(42))
    }
}

/// Records the effective uid observed inside the call.
struct RecordingBackend(Arc<Mutex<Vec<u32>>>);

impl FuncBackend for RecordingBackend {
    fn call(&self, session: &mut Session, _args: &[u8], _ret: &mut Port) -> wal_relay::Result<()> {
        self.0
            .lock()
            .expect("lock is poisoned")
            .push(session.credentials().uid);
        Ok(())
    }
}

#[test]
fn setuid_switches_and_restores_identity() -> wal_relay::Result<()> {
    let observed = Arc::new(Mutex::new(Vec::new()));

    let func = Func::new(
        FuncDef {
            name: "admin_task".to_owned(),
            uid: 42,
            setuid: true,
        },
        Box::new(RecordingBackend(observed.clone())),
    );

    let mut session = Session::new(Credentials::admin(1));
    let mut ret = Port::new();

    func.call(&mut session, &StaticUsers, b"", &mut ret)?;

    // The callee ran as the owner, the caller got its identity back
    assert_eq!(vec![42], *observed.lock().expect("lock is poisoned"));
    assert_eq!(1, session.credentials().uid);

    Ok(())
}

struct FailingBackend;

impl FuncBackend for FailingBackend {
    fn call(&self, _session: &mut Session, _args: &[u8], _ret: &mut Port) -> wal_relay::Result<()> {
        Err(wal_relay::Error::Proc("boom".to_owned()))
    }
}

#[test]
fn identity_is_restored_on_failure_too() {
    let func = Func::new(
        FuncDef {
            name: "admin_task".to_owned(),
            uid: 42,
            setuid: true,
        },
        Box::new(FailingBackend),
    );

    let mut session = Session::new(Credentials::admin(1));
    let mut ret = Port::new();

    assert!(func.call(&mut session, &StaticUsers, b"", &mut ret).is_err());
    assert_eq!(1, session.credentials().uid);
}

#[test]
fn setuid_with_unknown_owner_fails() {
    let func = Func::new(
        FuncDef {
            name: "orphan".to_owned(),
            uid: 7,
            setuid: true,
        },
        Box::new(FailingBackend),
    );

    let mut session = Session::new(Credentials::admin(1));
    let mut ret = Port::new();

    assert!(matches!(
        func.call(&mut session, &StaticUsers, b"", &mut ret),
        Err(wal_relay::Error::IllegalParams(_))
    ));
}

#[test]
fn native_backend_dispatches_through_the_cache() -> wal_relay::Result<()> {
    let loader = MockLoader::default();
    loader.publish_echo("geo", "distance");

    let registry = FuncRegistry::new(loader);
    let handle = registry.load("geo.distance")?;

    let func = Func::new(
        FuncDef {
            name: "geo.distance".to_owned(),
            uid: 1,
            setuid: false,
        },
        Box::new(NativeBackend::new(
            registry.cache().clone(),
            Arc::clone(handle.binding()),
        )),
    );

    // A caller with USAGE only, executing its own function
    let mut session = Session::new(Credentials {
        uid: 1,
        universal: PRIV_USAGE,
        entity_func: 0,
    });
    let mut ret = Port::new();

    func.call(&mut session, &StaticUsers, b"payload", &mut ret)?;
    assert_eq!(b"payload", ret.as_bytes());

    Ok(())
}
