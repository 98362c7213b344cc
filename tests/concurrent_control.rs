//! Runtime behaviour while launcher calls are in flight on another thread

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use mcu_kube::{
    ContainerConfig, ContainerHandle, ContainerRuntime, ContainerState, Error, Image,
    LivenessProbe, LocalFileStore, ProbeKind, ProcessLauncher,
};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(5);

/// Launcher that can hold starts or liveness checks until the test lets them go
struct GatedLauncher {
    held_starts: AtomicUsize,
    held_checks: AtomicUsize,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

/// Test side of the gate
struct Gate {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl Gate {
    fn wait_entered(&self) {
        self.entered
            .recv_timeout(WAIT)
            .expect("launcher call never reached the gate");
    }

    fn open(&self) {
        self.release.send(()).unwrap();
    }
}

impl GatedLauncher {
    fn new() -> (Arc<Self>, Gate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let launcher = Arc::new(Self {
            held_starts: AtomicUsize::new(0),
            held_checks: AtomicUsize::new(0),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });
        let gate = Gate {
            entered: entered_rx,
            release: release_tx,
        };
        (launcher, gate)
    }

    fn hold(&self, held: &AtomicUsize) {
        let claimed = held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if claimed {
            self.entered.lock().send(()).unwrap();
            self.release.lock().recv().unwrap();
        }
    }
}

impl ProcessLauncher for GatedLauncher {
    fn start(&self, _image: &Image, _args: Option<&str>) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.hold(&self.held_starts);
        self.running.store(true, Ordering::SeqCst);
        true
    }

    fn stop(&self, _image: &Image, _force: bool) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_app_running(&self, _image: &Image) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_locked(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn probe(&self, _image: &Image, _kind: &ProbeKind) -> bool {
        self.hold(&self.held_checks);
        true
    }
}

fn runtime(launcher: Arc<GatedLauncher>) -> Arc<ContainerRuntime> {
    Arc::new(ContainerRuntime::new(launcher, Arc::new(LocalFileStore::new())))
}

fn state(runtime: &ContainerRuntime, handle: ContainerHandle) -> ContainerState {
    runtime.info(handle).unwrap().status.state
}

#[test]
fn test_stop_during_start_wins() {
    let (launcher, gate) = GatedLauncher::new();
    launcher.held_starts.store(1, Ordering::SeqCst);
    let runtime = runtime(launcher.clone());
    let config = ContainerConfig::builder().name("clock").image("clock").build();
    let handle = runtime.create(config).unwrap();

    let starter = {
        let runtime = runtime.clone();
        thread::spawn(move || runtime.start_container(handle))
    };
    gate.wait_entered();

    runtime.stop_container(handle, true).unwrap();
    assert_eq!(state(&runtime, handle), ContainerState::Terminated);
    gate.open();

    let result = starter.join().unwrap();
    assert!(matches!(result, Err(Error::InvalidState { .. })));
    assert_eq!(state(&runtime, handle), ContainerState::Terminated);
    // The late process was stopped as well
    assert!(!launcher.running.load(Ordering::SeqCst));
    assert_eq!(launcher.stops.load(Ordering::SeqCst), 2);

    for _ in 0..3 {
        runtime.tick();
    }
    assert_eq!(state(&runtime, handle), ContainerState::Terminated);
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_scheduler_leaves_starting_container_alone() {
    let (launcher, gate) = GatedLauncher::new();
    let runtime = runtime(launcher.clone());
    let config = ContainerConfig::builder().name("clock").image("clock").build();
    let handle = runtime.create(config).unwrap();
    runtime.start_container(handle).unwrap();

    // Crash, observed without a restart
    launcher.running.store(false, Ordering::SeqCst);
    assert_eq!(runtime.get_status(handle).unwrap().state, ContainerState::Terminated);

    launcher.held_starts.store(1, Ordering::SeqCst);
    let starter = {
        let runtime = runtime.clone();
        thread::spawn(move || runtime.start_container(handle))
    };
    gate.wait_entered();

    assert!(runtime.tick());
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 2);
    assert!(runtime.start_container(handle).is_err());
    gate.open();

    starter.join().unwrap().unwrap();
    let status = runtime.info(handle).unwrap().status;
    assert_eq!(status.state, ContainerState::Running);
    assert_eq!(status.restart_count, 0);
    assert_eq!(launcher.starts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_liveness_check_does_not_hold_table() {
    let (launcher, gate) = GatedLauncher::new();
    let runtime = runtime(launcher.clone());
    let probe = LivenessProbe {
        kind: ProbeKind::Command("check-clock".into()),
        initial_delay: 0,
        period: 1,
        failure_threshold: 3,
    };
    let config = ContainerConfig::builder()
        .name("clock")
        .image("clock")
        .liveness_probe(probe)
        .build();
    let handle = runtime.create(config).unwrap();
    runtime.start_container(handle).unwrap();

    launcher.held_checks.store(1, Ordering::SeqCst);
    let ticker = {
        let runtime = runtime.clone();
        thread::spawn(move || runtime.tick())
    };
    gate.wait_entered();

    // Foreground calls proceed while the check is still running
    let (done_tx, done_rx) = mpsc::channel();
    let reader = {
        let runtime = runtime.clone();
        thread::spawn(move || {
            let count = runtime.get_count();
            let listed = runtime.list().len();
            done_tx.send((count, listed)).unwrap();
        })
    };
    let observed = done_rx.recv_timeout(WAIT);
    gate.open();

    assert_eq!(observed, Ok((1, 1)));
    assert!(ticker.join().unwrap());
    reader.join().unwrap();

    let status = runtime.info(handle).unwrap().status;
    assert_eq!(status.state, ContainerState::Running);
    assert_eq!(status.liveness_failures, 0);
}
