//! Device-level multi-semaphore wait tests.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::device::{Device, DeviceParams};
use crate::error::UnavailableSnafu;
use crate::executor::LocalExecutor;
use crate::sync::{Deadline, Semaphore, SemaphoreWait, TimelineSemaphore, WaitMode};

fn device() -> Device {
    Device::create("cpu0", DeviceParams::default(), Vec::new(), LocalExecutor::new()).unwrap()
}

fn wait_for(semaphore: &Arc<TimelineSemaphore>, value: u64) -> SemaphoreWait {
    SemaphoreWait { semaphore: Arc::clone(semaphore) as Arc<dyn Semaphore>, value }
}

#[test]
fn all_mode_needs_every_semaphore() {
    let device = device();
    let a = device.create_semaphore(0).unwrap();
    let b = device.create_semaphore(0).unwrap();
    let waits = [wait_for(&a, 2), wait_for(&b, 5)];

    a.signal(2).unwrap();
    assert!(
        device
            .wait_semaphores(WaitMode::All, &waits, Deadline::Now)
            .unwrap_err()
            .is_deadline_exceeded()
    );

    let waiter = {
        let (device, waits) = (device, waits.clone());
        thread::spawn(move || device.wait_semaphores(WaitMode::All, &waits, Deadline::Forever))
    };
    thread::sleep(Duration::from_millis(10));
    b.signal(5).unwrap();
    waiter.join().unwrap().unwrap();
}

#[test]
fn any_mode_resolves_on_one_semaphore() {
    let device = device();
    let a = device.create_semaphore(0).unwrap();
    let b = device.create_semaphore(0).unwrap();
    let waits = [wait_for(&a, 1), wait_for(&b, 1)];

    let waiter = {
        let (device, waits) = (device, waits.clone());
        thread::spawn(move || device.wait_semaphores(WaitMode::Any, &waits, Deadline::Forever))
    };
    thread::sleep(Duration::from_millis(10));
    a.signal(1).unwrap();
    waiter.join().unwrap().unwrap();
}

#[test]
fn all_mode_surfaces_member_failure() {
    let device = device();
    let a = device.create_semaphore(0).unwrap();
    let b = device.create_semaphore(0).unwrap();
    a.signal(1).unwrap();
    b.fail(UnavailableSnafu { reason: "device lost" }.build());

    let err = device
        .wait_semaphores(WaitMode::All, &[wait_for(&a, 1), wait_for(&b, 1)], Deadline::Forever)
        .unwrap_err();
    assert!(err.to_string().contains("device lost"));
}

#[test]
fn timed_wait_expires_without_signals() {
    let device = device();
    let a = device.create_semaphore(0).unwrap();
    let err = device
        .wait_semaphores(
            WaitMode::All,
            &[wait_for(&a, 1)],
            Deadline::after(Duration::from_millis(30)),
        )
        .unwrap_err();
    assert!(err.is_deadline_exceeded());
    // The semaphore is untouched by the expired wait.
    assert_eq!(a.query().unwrap(), 0);
}

#[test]
fn empty_wait_list_resolves_immediately() {
    let device = device();
    device.wait_semaphores(WaitMode::All, &[], Deadline::Now).unwrap();
    device.wait_semaphores(WaitMode::Any, &[], Deadline::Now).unwrap();
}
