use crate::util::constants::BYTES_IN_KBYTE;
use crate::util::options::{HeuristicsMode, Options};
use std::panic;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

// https://github.com/rust-lang/rfcs/issues/2798#issuecomment-552949300
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let val = f();
        done_tx.send(()).expect("Unable to send completion signal");
        val
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(_) => handle.join().expect("Thread panicked"),
        Err(e) => panic!("Thread took too long: {}", e),
    }
}

lazy_static! {
    // A global lock to make tests serial.
    // If we do want more parallelism, we can allow each set of tests to have their own locks. But it seems unnecessary for now.
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

// force some tests to be executed serially
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // If one test fails, the lock will become poisoned. We would want to continue for other tests anyway.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

// Always execute a cleanup closure no matter the test panics or not.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}

/// Options for a small heap of 32 regions of 64 KiB that unit tests drive by hand.
/// Environment variables are ignored so tests do not depend on the caller's shell.
pub fn small_heap_options() -> Options {
    let mut options = Options::without_env();
    options.heap_size = 2 * 1024 * BYTES_IN_KBYTE;
    options.region_size = 64 * BYTES_IN_KBYTE;
    options.threads = 2;
    options.heuristics = HeuristicsMode::Passive;
    options.tlab_size = 4 * BYTES_IN_KBYTE;
    options.gclab_size = 4 * BYTES_IN_KBYTE;
    options.pacing = false;
    options.verify = true;
    options.guaranteed_gc_interval = 0;
    options
}
