#[global_allocator]
static GLOBAL: mem_counters::AccountingAllocator = mem_counters::AccountingAllocator::new();

#[test]
fn single_counter_tracks_alloc_and_free() {
    let counter = mem_counters::new_counter("single");
    counter.enable();

    let buf = vec![0_u8; 4096];
    assert!(counter.current_size() >= 4096);
    assert_eq!(counter.current_allocations(), 1);

    drop(buf);
    counter.disable();
    assert_eq!(counter.current_size(), 0);
}

#[test]
fn peak_tracks_the_high_water_mark_not_the_final_value() {
    let counter = mem_counters::new_counter("peak");
    counter.enable();

    let a = vec![0_u8; 1000];
    let b = vec![0_u8; 2000];
    let peak_with_both = counter.current_size();
    assert!(peak_with_both >= 3000);

    drop(a);
    assert!(counter.current_size() < peak_with_both);
    assert_eq!(counter.peak_size(), peak_with_both);

    drop(b);
    counter.disable();
}

#[test]
fn realloc_grow_and_shrink_update_current_size() {
    let counter = mem_counters::new_counter("realloc");
    counter.enable();

    let mut v: Vec<u8> = Vec::with_capacity(64);
    v.resize(64, 0);
    let after_small = counter.current_size();

    v.resize(8192, 0);
    assert!(counter.current_size() > after_small);

    v.resize(16, 0);
    v.shrink_to_fit();
    assert!(counter.current_size() < after_small + 8192);

    drop(v);
    counter.disable();
}

#[test]
fn disabling_a_counter_stops_new_attribution_but_not_its_own_frees() {
    let counter = mem_counters::new_counter("tracked-free");
    counter.enable();

    let buf = vec![0_u8; 512];
    counter.disable();

    // Freeing a block allocated while enabled still credits this counter,
    // even though it is disabled again by the time the free happens.
    drop(buf);
    assert_eq!(counter.current_size(), 0);
}

#[test]
fn disabled_thread_allocations_are_invisible_even_after_reenabling() {
    let counter = mem_counters::new_counter("thread-disabled");
    counter.enable();

    mem_counters::disable_this_thread();
    let buf = vec![0_u8; 256];
    assert_eq!(counter.current_size(), 0, "no header should be placed while the thread is disabled");

    mem_counters::enable_this_thread();
    drop(buf);
    assert_eq!(
        counter.current_size(),
        0,
        "freeing a block allocated while the thread was disabled must not touch any counter"
    );
    counter.disable();
}

#[test]
fn unenabled_counter_sees_nothing() {
    let counter = mem_counters::new_counter("never-enabled");
    let _buf = vec![0_u8; 1024];
    assert_eq!(counter.current_size(), 0);
    assert_eq!(counter.current_allocations(), 0);
}

#[test]
fn sub_counter_narrows_attribution_and_disables_its_sibling() {
    let parent = mem_counters::new_counter("parent");
    let a = parent.create_child("a");
    let b = parent.create_child("b");

    a.enable();
    let buf_a = vec![0_u8; 111];
    assert!(a.current_size() >= 111);

    b.enable();
    assert!(!a.is_enabled(), "enabling b must disable its sibling a");
    let buf_b = vec![0_u8; 222];
    assert!(b.current_size() >= 222);

    drop(buf_a);
    drop(buf_b);
    b.disable();
}

#[test]
fn thread_isolation_keeps_counters_separate() {
    let main_counter = mem_counters::new_counter("main-thread");
    main_counter.enable();
    let _main_buf = vec![0_u8; 3000];
    let main_size = main_counter.current_size();

    let handle = std::thread::spawn(|| {
        let other = mem_counters::new_counter("other-thread");
        other.enable();
        let _buf = vec![0_u8; 5000];
        let size = other.current_size();
        other.disable();
        size
    });
    let other_size = handle.join().unwrap();

    assert!(main_size >= 3000);
    assert!(other_size >= 5000);
    // The spawned thread's allocations never reached the main thread's
    // counter, since each thread's enabled set is its own.
    assert!(main_counter.current_size() < main_size + 5000);
    main_counter.disable();
}
