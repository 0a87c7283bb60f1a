use kernel_sync::SyncOnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn second_set_is_refused() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(5u32), Ok(()));
    assert_eq!(cell.set(6u32), Err(6));
    assert_eq!(cell.get(), Some(&5));
}

#[test]
fn exactly_one_racing_set_wins() {
    const THREADS: usize = 8;
    let cell = SyncOnceCell::new();
    let wins = AtomicUsize::new(0);

    thread::scope(|s| {
        for i in 0..THREADS {
            let (cell, wins) = (&cell, &wins);
            s.spawn(move || {
                if cell.set(i).is_ok() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert!(cell.get().is_some_and(|v| *v < THREADS));
}

#[test]
fn stored_value_is_dropped_with_the_cell() {
    let marker = Arc::new(());
    {
        let cell = SyncOnceCell::new();
        assert!(cell.set(Arc::clone(&marker)).is_ok());
        assert_eq!(Arc::strong_count(&marker), 2);
    }
    assert_eq!(Arc::strong_count(&marker), 1);
}
