//! Cross-queue submission lifecycle tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::device::{Device, DeviceParams};
use crate::command_buffer::{CommandCategories, ExecutionMode};
use crate::error::UnavailableSnafu;
use crate::executor::LocalExecutor;
use crate::queue::SubmissionBatch;
use crate::sync::{Deadline, Semaphore};

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
fn semaphore_orders_batches_across_queues() {
    let device = device(2);
    let sem = device.create_semaphore(0).unwrap();
    let buffer = device.allocator().allocate(8).unwrap();

    // Producer on queue 0 writes the first half and signals 1.
    let produce = device.create_command_buffer(ExecutionMode::OneShot, CommandCategories::ANY);
    produce.update_buffer(Arc::clone(&buffer), 0, &[1, 1, 1, 1]).unwrap();
    produce.finish().unwrap();

    // Consumer on queue 1 waits for 1, then writes the second half only if
    // the first half is already there.
    let consume = device.create_command_buffer(ExecutionMode::OneShot, CommandCategories::ANY);
    {
        let buffer = Arc::clone(&buffer);
        consume
            .call(move || {
                assert_eq!(buffer.read(0, 4)?, vec![1, 1, 1, 1]);
                buffer.write(4, &[2, 2, 2, 2])
            })
            .unwrap();
    }
    consume.finish().unwrap();

    // Submit the consumer first: the semaphore, not submission order, must
    // provide the cross-queue edge.
    device
        .submit(
            CommandCategories::ANY,
            1,
            vec![
                SubmissionBatch::new()
                    .wait(Arc::clone(&sem) as Arc<dyn Semaphore>, 1)
                    .execute(Arc::new(consume))
                    .signal(Arc::clone(&sem) as Arc<dyn Semaphore>, 2),
            ],
        )
        .unwrap();
    device
        .submit(
            CommandCategories::ANY,
            0,
            vec![
                SubmissionBatch::new()
                    .execute(Arc::new(produce))
                    .signal(Arc::clone(&sem) as Arc<dyn Semaphore>, 1),
            ],
        )
        .unwrap();

    sem.wait(2, Deadline::Forever).unwrap();
    assert_eq!(buffer.read(0, 8).unwrap(), vec![1, 1, 1, 1, 2, 2, 2, 2]);
    device.wait_idle(Deadline::Forever).unwrap();
}

#[test]
fn multi_batch_submit_runs_all_batches() {
    let device = device(1);
    let sem = device.create_semaphore(0).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let mut batches = Vec::new();
    for id in 0..4u64 {
        let cb = device.create_command_buffer(ExecutionMode::OneShot, CommandCategories::ANY);
        {
            let ran = Arc::clone(&ran);
            cb.call(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        cb.finish().unwrap();
        batches.push(
            SubmissionBatch::new()
                .execute(Arc::new(cb))
                .signal(Arc::clone(&sem) as Arc<dyn Semaphore>, id + 1),
        );
    }
    device.submit(CommandCategories::DISPATCH, 0, batches).unwrap();

    sem.wait(4, Deadline::Forever).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 4);
}

#[test]
fn failure_propagates_through_a_chain_of_batches() {
    let device = device(2);
    let first = device.create_semaphore(0).unwrap();
    let second = device.create_semaphore(0).unwrap();

    let failing = device.create_command_buffer(ExecutionMode::OneShot, CommandCategories::ANY);
    failing.call(|| UnavailableSnafu { reason: "dispatch fault" }.fail()).unwrap();
    failing.finish().unwrap();

    device
        .submit(
            CommandCategories::ANY,
            0,
            vec![
                SubmissionBatch::new()
                    .execute(Arc::new(failing))
                    .signal(Arc::clone(&first) as Arc<dyn Semaphore>, 1),
            ],
        )
        .unwrap();
    // A dependent batch on the other queue inherits the failure through its
    // wait-list and passes it on to its own signal semaphore.
    device
        .submit(
            CommandCategories::ANY,
            1,
            vec![
                SubmissionBatch::new()
                    .wait(Arc::clone(&first) as Arc<dyn Semaphore>, 1)
                    .signal(Arc::clone(&second) as Arc<dyn Semaphore>, 1),
            ],
        )
        .unwrap();

    let err = second.wait(1, Deadline::Forever).unwrap_err();
    assert!(err.to_string().contains("dispatch fault"));
}

#[test]
fn reusable_command_buffer_submits_twice() {
    let device = device(1);
    let sem = device.create_semaphore(0).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let cb = device.create_command_buffer(ExecutionMode::Reusable, CommandCategories::DISPATCH);
    {
        let count = Arc::clone(&count);
        cb.call(move || {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    }
    cb.finish().unwrap();
    let cb = Arc::new(cb);

    device
        .submit(
            CommandCategories::ANY,
            0,
            vec![
                SubmissionBatch::new()
                    .execute(Arc::clone(&cb))
                    .signal(Arc::clone(&sem) as Arc<dyn Semaphore>, 1),
                SubmissionBatch::new()
                    .execute(cb)
                    .signal(Arc::clone(&sem) as Arc<dyn Semaphore>, 2),
            ],
        )
        .unwrap();
    sem.wait(2, Deadline::Forever).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn spent_one_shot_fails_its_second_batch_only() {
    let device = device(1);
    let sem = device.create_semaphore(0).unwrap();

    let cb = device.create_command_buffer(ExecutionMode::OneShot, CommandCategories::ANY);
    cb.finish().unwrap();
    let cb = Arc::new(cb);

    let replay_out = device.create_semaphore(0).unwrap();
    device
        .submit(
            CommandCategories::ANY,
            0,
            vec![
                SubmissionBatch::new()
                    .execute(Arc::clone(&cb))
                    .signal(Arc::clone(&sem) as Arc<dyn Semaphore>, 1),
                SubmissionBatch::new()
                    .execute(cb)
                    .signal(Arc::clone(&replay_out) as Arc<dyn Semaphore>, 1),
            ],
        )
        .unwrap();

    sem.wait(1, Deadline::Forever).unwrap();
    let err = replay_out.wait(1, Deadline::Forever).unwrap_err();
    assert!(err.is_failed());
}
