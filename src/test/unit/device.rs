//! Device-level orchestration tests.

use std::sync::Arc;

use crate::device::{Device, DeviceParams};
use crate::command_buffer::{CommandCategories, ExecutionMode};
use crate::executor::LocalExecutor;
use crate::queue::SubmissionBatch;
use crate::sync::{Deadline, Semaphore, TimelineSemaphore};

fn device(queue_count: usize) -> Device {
    Device::create(
        "cpu0",
        DeviceParams { queue_count, ..Default::default() },
        Vec::new(),
        LocalExecutor::new(),
    )
    .unwrap()
}

#[test]
fn wait_idle_drains_every_queue() {
    let device = device(3);
    let gate = TimelineSemaphore::new(0).unwrap();
    let outputs: Vec<_> = (0..3).map(|_| device.create_semaphore(0).unwrap()).collect();

    // One gated batch per queue.
    for (affinity, output) in outputs.iter().enumerate() {
        device
            .submit(
                CommandCategories::ANY,
                affinity as u64,
                vec![
                    SubmissionBatch::new()
                        .wait(Arc::clone(&gate) as Arc<dyn Semaphore>, 1)
                        .signal(Arc::clone(output) as Arc<dyn Semaphore>, 1),
                ],
            )
            .unwrap();
    }
    assert!(device.wait_idle(Deadline::Now).unwrap_err().is_deadline_exceeded());

    gate.signal(1).unwrap();
    device.wait_idle(Deadline::Forever).unwrap();
    for output in &outputs {
        assert_eq!(output.query().unwrap(), 1);
    }
    // Idle-wait is idempotent once drained.
    device.wait_idle(Deadline::Now).unwrap();
}

#[test]
fn queues_run_independently() {
    let device = device(2);
    let gate = TimelineSemaphore::new(0).unwrap();
    let free_out = device.create_semaphore(0).unwrap();

    // Queue 0 is blocked on the gate; queue 1 must still make progress.
    device
        .submit(CommandCategories::ANY, 0, vec![SubmissionBatch::new().wait(Arc::clone(&gate) as Arc<dyn Semaphore>, 1)])
        .unwrap();
    device
        .submit(CommandCategories::ANY, 1, vec![SubmissionBatch::new().signal(Arc::clone(&free_out) as Arc<dyn Semaphore>, 1)])
        .unwrap();

    free_out.wait(1, Deadline::Forever).unwrap();
    gate.signal(1).unwrap();
    device.wait_idle(Deadline::Forever).unwrap();
}

#[test]
fn trim_returns_pooled_blocks() {
    let device = device(1);
    let sem = device.create_semaphore(0).unwrap();

    let cb = device.create_command_buffer(ExecutionMode::OneShot, CommandCategories::DISPATCH);
    cb.call(|| Ok(())).unwrap();
    cb.finish().unwrap();
    device
        .submit(
            CommandCategories::DISPATCH,
            0,
            vec![
                SubmissionBatch::new()
                    .execute(Arc::new(cb))
                    .signal(Arc::clone(&sem) as Arc<dyn Semaphore>, 1),
            ],
        )
        .unwrap();
    sem.wait(1, Deadline::Forever).unwrap();
    device.wait_idle(Deadline::Forever).unwrap();

    // After trimming nothing stays pooled; this only checks it is callable
    // and does not disturb idle state.
    device.trim();
    device.wait_idle(Deadline::Now).unwrap();
}
