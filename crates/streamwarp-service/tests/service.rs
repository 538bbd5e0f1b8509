//! Integration tests for the service runtime: lifecycle, work
//! dispatch, strand serialization and timers.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use streamwarp_core::config::Config;
use streamwarp_service::{Service, ServiceHandler, Timer};

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[derive(Default)]
struct FlagService {
    thread_initialize: AtomicBool,
    thread_cleanup: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    idle: AtomicBool,
    errors: AtomicBool,
}

impl ServiceHandler for FlagService {
    fn on_thread_initialize(&self) {
        self.thread_initialize.store(true, Ordering::Relaxed);
    }
    fn on_thread_cleanup(&self) {
        self.thread_cleanup.store(true, Ordering::Relaxed);
    }
    fn on_started(&self) {
        self.started.store(true, Ordering::Relaxed);
    }
    fn on_stopped(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
    fn on_idle(&self) {
        self.idle.store(true, Ordering::Relaxed);
    }
    fn on_error(&self, _error: &streamwarp_core::error::Error) {
        self.errors.store(true, Ordering::Relaxed);
    }
}

#[test]
fn lifecycle_flags_fire_in_order() {
    let handler = Arc::new(FlagService::default());
    let service = Service::new(Config { worker_count: 2, ..Config::default() }, handler.clone());

    assert!(!service.is_started());
    assert!(service.start());
    assert!(service.is_started());
    assert!(!service.start(), "double start must fail");
    assert!(handler.started.load(Ordering::Relaxed));
    assert!(wait_until(Duration::from_secs(1), || {
        handler.thread_initialize.load(Ordering::Relaxed)
    }));

    assert!(service.stop());
    assert!(!service.is_started());
    assert!(!service.stop(), "double stop must fail");
    assert!(handler.stopped.load(Ordering::Relaxed));
    assert!(handler.thread_cleanup.load(Ordering::Relaxed));
    assert!(!handler.errors.load(Ordering::Relaxed));
}

#[test]
fn restart_preserves_configuration() {
    let handler = Arc::new(FlagService::default());
    let service = Service::new(Config { worker_count: 1, ..Config::default() }, handler);
    assert!(service.start());
    assert!(service.restart());
    assert!(service.is_started());
    assert!(service.stop());
}

#[test]
fn polling_mode_reports_idle() {
    let handler = Arc::new(FlagService::default());
    let service = Service::new(Config { worker_count: 1, ..Config::default() }, handler.clone());
    assert!(service.start_with_polling(true));
    assert!(service.is_polling());
    assert!(wait_until(Duration::from_secs(1), || handler.idle.load(Ordering::Relaxed)));
    assert!(service.stop());
}

#[test]
fn posted_work_runs_on_a_worker() {
    let service = Service::new(Config { worker_count: 2, ..Config::default() }, Arc::new(()));
    assert!(service.start());

    let ran = Arc::new(AtomicBool::new(false));
    let observed_worker = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        let observed_worker = observed_worker.clone();
        assert!(service.post(move || {
            observed_worker.store(Service::is_worker_thread(), Ordering::Relaxed);
            ran.store(true, Ordering::Relaxed);
        }));
    }
    assert!(wait_until(Duration::from_secs(1), || ran.load(Ordering::Relaxed)));
    assert!(observed_worker.load(Ordering::Relaxed));

    // Dispatch from a non-worker thread defers like post.
    let ran_again = Arc::new(AtomicBool::new(false));
    {
        let ran_again = ran_again.clone();
        assert!(service.dispatch(move || ran_again.store(true, Ordering::Relaxed)));
    }
    assert!(wait_until(Duration::from_secs(1), || ran_again.load(Ordering::Relaxed)));
    assert!(service.stop());
}

#[test]
fn no_work_accepted_after_stop() {
    let service = Service::new(Config { worker_count: 2, ..Config::default() }, Arc::new(()));
    assert!(service.start());
    let executed = Arc::new(AtomicUsize::new(0));
    for _ in 0..32 {
        let executed = executed.clone();
        service.post(move || {
            executed.fetch_add(1, Ordering::Relaxed);
        });
    }
    assert!(service.stop());

    let snapshot = executed.load(Ordering::Relaxed);
    assert_eq!(snapshot, 32, "stop must drain queued work before returning");

    let executed_after = executed.clone();
    assert!(!service.post(move || {
        executed_after.fetch_add(1, Ordering::Relaxed);
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(executed.load(Ordering::Relaxed), snapshot);
}

#[test]
fn strand_serializes_concurrent_posters() {
    let service = Service::new(Config { worker_count: 4, ..Config::default() }, Arc::new(()));
    assert!(service.start());
    let strand = service.strand();

    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let executed = Arc::new(AtomicUsize::new(0));

    let posters: Vec<_> = (0..4)
        .map(|_| {
            let strand = strand.clone();
            let inside = inside.clone();
            let overlaps = overlaps.clone();
            let executed = executed.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let inside = inside.clone();
                    let overlaps = overlaps.clone();
                    let executed = executed.clone();
                    strand.post(move || {
                        if inside.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        // Hold the strand long enough for overlap to
                        // show if serialization were broken.
                        std::hint::spin_loop();
                        inside.store(false, Ordering::SeqCst);
                        executed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || executed.load(Ordering::SeqCst) == 400));
    assert_eq!(overlaps.load(Ordering::SeqCst), 0, "strand jobs must never overlap");
    assert!(service.stop());
}

#[test]
fn strand_preserves_post_order() {
    let service = Service::new(Config { worker_count: 4, ..Config::default() }, Arc::new(()));
    assert!(service.start());
    let strand = service.strand();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    for i in 0..50usize {
        let order = order.clone();
        strand.post(move || order.lock().unwrap().push(i));
    }
    assert!(wait_until(Duration::from_secs(2), || order.lock().unwrap().len() == 50));
    let observed = order.lock().unwrap().clone();
    assert_eq!(observed, (0..50).collect::<Vec<_>>());
    assert!(service.stop());
}

#[test]
fn timer_fires_once_near_its_deadline() {
    let service = Service::new(Config { worker_count: 1, ..Config::default() }, Arc::new(()));
    assert!(service.start());

    let fired = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicBool::new(false));
    let timer = {
        let fired = fired.clone();
        let cancelled = cancelled.clone();
        Timer::with_action(service.clone(), move |was_cancelled| {
            if was_cancelled {
                cancelled.store(true, Ordering::Relaxed);
            } else {
                fired.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    let start = Instant::now();
    assert!(timer.setup_after(Duration::from_millis(50)));
    assert!(timer.expire_timespan() > 0);
    assert!(timer.wait_async());
    assert!(!timer.wait_async(), "only one outstanding wait is allowed");

    assert!(wait_until(Duration::from_secs(1), || fired.load(Ordering::Relaxed) == 1));
    assert!(start.elapsed() >= Duration::from_millis(45));
    assert!(!cancelled.load(Ordering::Relaxed));
    thread::sleep(Duration::from_millis(80));
    assert_eq!(fired.load(Ordering::Relaxed), 1, "one-shot timers fire once");
    assert!(timer.expire_timespan() < 0);
    assert!(service.stop());
}

#[test]
fn cancel_reports_cancelled_not_fired() {
    let service = Service::new(Config { worker_count: 1, ..Config::default() }, Arc::new(()));
    assert!(service.start());

    let fired = Arc::new(AtomicBool::new(false));
    let cancelled = Arc::new(AtomicBool::new(false));
    let timer = {
        let fired = fired.clone();
        let cancelled = cancelled.clone();
        Timer::with_action(service.clone(), move |was_cancelled| {
            if was_cancelled {
                cancelled.store(true, Ordering::Relaxed);
            } else {
                fired.store(true, Ordering::Relaxed);
            }
        })
    };
    timer.setup_after(Duration::from_secs(30));
    assert!(timer.wait_async());
    assert!(timer.cancel());
    assert!(!timer.cancel(), "nothing left to cancel");

    assert!(wait_until(Duration::from_secs(1), || cancelled.load(Ordering::Relaxed)));
    assert!(!fired.load(Ordering::Relaxed));
    assert!(service.stop());
}

#[test]
fn service_stop_cancels_pending_waits() {
    let service = Service::new(Config { worker_count: 1, ..Config::default() }, Arc::new(()));
    assert!(service.start());

    let cancelled = Arc::new(AtomicBool::new(false));
    let timer = {
        let cancelled = cancelled.clone();
        Timer::with_action(service.clone(), move |was_cancelled| {
            cancelled.store(was_cancelled, Ordering::Relaxed);
        })
    };
    timer.setup_after(Duration::from_secs(60));
    assert!(timer.wait_async());
    assert!(service.stop());
    assert!(cancelled.load(Ordering::Relaxed), "shutdown maps to cancelled=true");
}

#[test]
fn wait_sync_blocks_until_expiry() {
    let service = Service::new(Config { worker_count: 1, ..Config::default() }, Arc::new(()));
    assert!(service.start());

    let timer = Timer::new(service.clone());
    timer.setup_after(Duration::from_millis(30));
    let start = Instant::now();
    assert!(timer.wait_sync());
    assert!(start.elapsed() >= Duration::from_millis(25));
    assert!(service.stop());
}
