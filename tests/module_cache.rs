use std::sync::{mpsc, Arc, Mutex};
use test_log::test;
use wal_relay::{MockLoader, ModuleCache, Port, Region, SymbolBinding};

#[test]
fn bind_and_call_through_the_cache() -> wal_relay::Result<()> {
    let loader = MockLoader::default();
    loader.publish_echo("geo", "distance");

    let cache = ModuleCache::new(loader);
    let binding = SymbolBinding::new("geo.distance");

    let mut region = Region::new();
    let mut ret = Port::new();

    cache.call(&binding, &mut region, b"args", &mut ret)?;

    assert_eq!(b"args", ret.as_bytes());
    assert_eq!(1, cache.len());
    assert!(binding.is_resolved());

    // The argument scratch was rolled back
    assert_eq!(0, region.used());

    // No call in flight anymore
    let module = binding.module().expect("binding should be attached");
    assert_eq!(0, module.live_calls());

    Ok(())
}

#[test]
fn missing_module_is_a_load_error() {
    let cache = ModuleCache::new(MockLoader::default());
    let binding = SymbolBinding::new("ghost.f");

    assert!(matches!(
        cache.bind(&binding),
        Err(wal_relay::Error::LoadModule { .. })
    ));
    assert!(cache.is_empty());
}

#[test]
fn missing_symbol_keeps_the_module_cached() {
    let loader = MockLoader::default();
    loader.publish_echo("geo", "distance");

    let cache = ModuleCache::new(loader);
    let binding = SymbolBinding::new("geo.area");

    assert!(matches!(
        cache.bind(&binding),
        Err(wal_relay::Error::LoadFunction { .. })
    ));

    // The freshly loaded module stays cached and serves later binds
    assert!(cache.find("geo").is_some());

    let binding = SymbolBinding::new("geo.distance");
    assert!(cache.bind(&binding).is_ok());
}

#[test]
fn unbinding_the_last_symbol_releases_the_module() -> wal_relay::Result<()> {
    let loader = MockLoader::default();
    loader.publish_echo("geo", "distance");

    let cache = ModuleCache::new(loader.clone());
    let binding = SymbolBinding::new("geo.distance");
    cache.bind(&binding)?;

    let probe = loader.last_probe().expect("load should have happened");
    assert!(!probe.load(std::sync::atomic::Ordering::Acquire));

    cache.unbind(&binding);

    assert!(cache.is_empty());
    assert!(!binding.is_resolved());
    assert!(probe.load(std::sync::atomic::Ordering::Acquire));

    Ok(())
}

#[test]
fn reload_moves_bindings_to_the_fresh_module() -> wal_relay::Result<()> {
    let loader = MockLoader::default();
    loader.publish_echo("geo", "distance");
    loader.publish_echo("geo", "area");

    let cache = ModuleCache::new(loader.clone());
    let distance = SymbolBinding::new("geo.distance");
    let area = SymbolBinding::new("geo.area");
    cache.bind(&distance)?;
    cache.bind(&area)?;

    let old_probe = loader.last_probe().expect("load should have happened");
    let old_generation = distance
        .module()
        .expect("should be attached")
        .handle()
        .generation();

    let reloaded = cache.reload("geo")?.expect("module should be cached");

    // Every binding points into the fresh module now
    assert!(reloaded.handle().generation() > old_generation);
    for binding in [&distance, &area] {
        assert_eq!(
            reloaded.handle().generation(),
            binding
                .module()
                .expect("should stay attached")
                .handle()
                .generation(),
        );
    }

    // Nothing was in flight, the old module is gone
    assert!(old_probe.load(std::sync::atomic::Ordering::Acquire));

    // Calls keep working through the moved binding
    let mut region = Region::new();
    let mut ret = Port::new();
    cache.call(&distance, &mut region, b"x", &mut ret)?;
    assert_eq!(b"x", ret.as_bytes());

    Ok(())
}

#[test]
fn failed_reload_rolls_every_binding_back() -> wal_relay::Result<()> {
    let loader = MockLoader::default();
    loader.publish_echo("geo", "distance");
    loader.publish_echo("geo", "area");

    let cache = ModuleCache::new(loader.clone());
    let distance = SymbolBinding::new("geo.distance");
    let area = SymbolBinding::new("geo.area");
    cache.bind(&distance)?;
    cache.bind(&area)?;

    let old_module = distance.module().expect("should be attached");

    // The next load of the package will miss one symbol
    loader.retract("geo", "area");

    assert!(matches!(
        cache.reload("geo"),
        Err(wal_relay::Error::LoadFunction { .. })
    ));

    // The replacement module was destroyed
    let new_probe = loader.last_probe().expect("reload should have loaded");
    assert!(new_probe.load(std::sync::atomic::Ordering::Acquire));

    // Both bindings still resolve through the old module
    for binding in [&distance, &area] {
        assert_eq!(
            old_module.handle().generation(),
            binding
                .module()
                .expect("should stay attached")
                .handle()
                .generation(),
        );
    }

    let mut region = Region::new();
    let mut ret = Port::new();
    cache.call(&area, &mut region, b"y", &mut ret)?;
    assert_eq!(b"y", ret.as_bytes());

    Ok(())
}

#[test]
fn reload_of_an_unknown_package_is_a_noop() -> wal_relay::Result<()> {
    let cache: ModuleCache<MockLoader> = ModuleCache::new(MockLoader::default());
    assert!(cache.reload("ghost")?.is_none());
    Ok(())
}

#[test]
fn reload_does_not_release_a_module_with_a_call_in_flight() -> wal_relay::Result<()> {
    let loader = MockLoader::default();

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);

    // A procedure that blocks mid-call, the cooperative-yield analog
    loader.publish("geo", "slow", move |ctx, args| {
        let bytes = args.to_vec();
        entered_tx
            .lock()
            .expect("lock is poisoned")
            .send(())
            .expect("test channel should be alive");
        release_rx
            .lock()
            .expect("lock is poisoned")
            .recv()
            .expect("test channel should be alive");
        ctx.port().write_bytes(&bytes);
        0
    });

    let cache = ModuleCache::new(loader.clone());
    let binding = SymbolBinding::new("geo.slow");
    cache.bind(&binding)?;

    let old_probe = loader.last_probe().expect("load should have happened");
    let old_module = binding.module().expect("should be attached");

    // Caller A enters the procedure and blocks inside it
    let worker = {
        let cache = cache.clone();
        let binding = Arc::clone(&binding);
        std::thread::spawn(move || {
            let mut region = Region::new();
            let mut ret = Port::new();
            cache
                .call(&binding, &mut region, b"pinned", &mut ret)
                .map(|()| ret.as_bytes().to_vec())
        })
    };

    entered_rx
        .recv()
        .expect("worker should enter the procedure");
    assert_eq!(1, old_module.live_calls());

    // Caller B hot-swaps the module while A is still inside it
    let reloaded = cache.reload("geo")?.expect("module should be cached");
    assert!(reloaded.handle().generation() > old_module.handle().generation());

    // The old mapping must stay alive: A still executes inside it
    assert!(!old_probe.load(std::sync::atomic::Ordering::Acquire));

    // Let A return
    release_tx.send(()).expect("worker should be waiting");
    let result = worker.join().expect("worker should not panic");
    assert_eq!(b"pinned".to_vec(), result?);

    assert_eq!(0, old_module.live_calls());

    // Only now is the old module released
    drop(old_module);
    assert!(old_probe.load(std::sync::atomic::Ordering::Acquire));

    // New calls land in the fresh module
    let mut region = Region::new();
    let mut ret = Port::new();
    cache.call(&binding, &mut region, b"fresh", &mut ret)?;
    assert_eq!(
        reloaded.handle().generation(),
        binding
            .module()
            .expect("should be attached")
            .handle()
            .generation(),
    );

    Ok(())
}
