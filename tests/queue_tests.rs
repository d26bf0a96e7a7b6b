//! Production queue operations through the persisted, per-machine documents.


use cnc_conductor::error::ConductorError;
use cnc_conductor::queue::{BatchOp, QueueJob};
use test_harness::Services;
use uuid::Uuid;

async fn queue_of_three(svc: &Services) -> Vec<QueueJob> {
    svc.add_machine("M1", None).await;
    let mut jobs = Vec::new();
    for (request, program) in [("R1", "p1"), ("R2", "p2"), ("R3", "p3")] {
        jobs.push(
            svc.queue
                .enqueue(QueueJob::new("M1", request, program), false)
                .await
                .unwrap(),
        );
    }
    jobs
}

fn ids(jobs: &[QueueJob]) -> Vec<Uuid> {
    jobs.iter().map(|j| j.id).collect()
}

fn orders(jobs: &[QueueJob]) -> Vec<u32> {
    jobs.iter().map(|j| j.order).collect()
}

#[tokio::test]
async fn enqueue_assigns_dense_orders() {
    let svc = Services::new();
    let jobs = queue_of_three(&svc).await;
    assert_eq!(orders(&jobs), vec![1, 2, 3]);

    svc.queue.remove(jobs[0].id).await.unwrap();
    let remaining = svc.queue.jobs("M1").await.unwrap();
    assert_eq!(ids(&remaining), vec![jobs[1].id, jobs[2].id]);
    assert_eq!(orders(&remaining), vec![1, 2]);
}

#[tokio::test]
async fn batch_with_unknown_job_leaves_queue_unchanged() {
    let svc = Services::new();
    let jobs = queue_of_three(&svc).await;
    let before = svc.queue.jobs("M1").await.unwrap();

    let ops = vec![
        BatchOp::qty(jobs[0].id, 5),
        BatchOp::delete(Uuid::new_v4()),
        BatchOp::pause(jobs[2].id, true),
    ];
    match svc.queue.batch_apply("M1", &ops).await {
        Err(ConductorError::StaleBatchApply { current, .. }) => {
            assert_eq!(current, before);
        }
        other => panic!("expected StaleBatchApply, got {:?}", other),
    }
    assert_eq!(svc.queue.jobs("M1").await.unwrap(), before);
}

#[tokio::test]
async fn batch_applies_all_ops_together() {
    let svc = Services::new();
    let jobs = queue_of_three(&svc).await;

    let result = svc
        .queue
        .batch_apply(
            "M1",
            &[
                BatchOp::delete(jobs[1].id),
                BatchOp::qty(jobs[2].id, 4),
                BatchOp::move_to(jobs[2].id, 1),
            ],
        )
        .await
        .unwrap();

    assert_eq!(ids(&result), vec![jobs[2].id, jobs[0].id]);
    assert_eq!(orders(&result), vec![1, 2]);
    assert_eq!(result[0].quantity, 4);
    assert_eq!(svc.queue.jobs("M1").await.unwrap(), result);
}

#[tokio::test]
async fn invalid_quantity_in_batch_rejects_everything() {
    let svc = Services::new();
    let jobs = queue_of_three(&svc).await;
    let before = svc.queue.jobs("M1").await.unwrap();

    let res = svc
        .queue
        .batch_apply("M1", &[BatchOp::delete(jobs[0].id), BatchOp::qty(jobs[1].id, 0)])
        .await;
    assert!(matches!(res, Err(ConductorError::InvalidQuantity(0))));
    assert_eq!(svc.queue.jobs("M1").await.unwrap(), before);
}

#[tokio::test]
async fn reorder_returns_exact_order() {
    let svc = Services::new();
    let jobs = queue_of_three(&svc).await;
    let wanted = vec![jobs[2].id, jobs[0].id, jobs[1].id];

    let result = svc.queue.reorder("M1", &wanted).await.unwrap();
    assert_eq!(ids(&result), wanted);
    assert_eq!(orders(&result), vec![1, 2, 3]);
    assert_eq!(ids(&svc.queue.jobs("M1").await.unwrap()), wanted);
}

#[tokio::test]
async fn reorder_must_name_every_job_once() {
    let svc = Services::new();
    let jobs = queue_of_three(&svc).await;

    let missing = svc.queue.reorder("M1", &[jobs[0].id, jobs[1].id]).await;
    assert!(matches!(missing, Err(ConductorError::StaleBatchApply { .. })));

    let duplicate = svc
        .queue
        .reorder("M1", &[jobs[0].id, jobs[0].id, jobs[1].id])
        .await;
    assert!(matches!(duplicate, Err(ConductorError::StaleBatchApply { .. })));
    assert_eq!(ids(&svc.queue.jobs("M1").await.unwrap()), ids(&jobs));
}

#[tokio::test]
async fn alarmed_machine_refuses_jobs_unless_forced() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    svc.bridge.set_status("M1", "ALARM");
    svc.dispatcher.service_machine("M1").await.unwrap();

    let res = svc.queue.enqueue(QueueJob::new("M1", "R1", "p1"), false).await;
    assert!(matches!(res, Err(ConductorError::MachineUnavailable { .. })));

    let job = svc
        .queue
        .enqueue(QueueJob::new("M1", "R1", "p1"), true)
        .await
        .unwrap();
    assert_eq!(job.order, 1);
}

#[tokio::test]
async fn enqueue_validates_quantity_and_machine() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;

    let zero = svc
        .queue
        .enqueue(QueueJob::new("M1", "R1", "p1").with_quantity(0), false)
        .await;
    assert!(matches!(zero, Err(ConductorError::InvalidQuantity(0))));

    let unknown = svc.queue.enqueue(QueueJob::new("M9", "R1", "p1"), false).await;
    assert!(matches!(unknown, Err(ConductorError::MachineNotFound(_))));
}

#[tokio::test]
async fn cancel_withdraws_waiting_jobs_across_machines() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    svc.add_machine("M2", None).await;
    svc.queue.enqueue(QueueJob::new("M1", "R1", "a"), false).await.unwrap();
    let keep = svc.queue.enqueue(QueueJob::new("M1", "R2", "b"), false).await.unwrap();
    svc.queue.enqueue(QueueJob::new("M2", "R1", "c"), false).await.unwrap();

    let flagged = svc.queue.cancel_request("R1").await.unwrap();
    assert!(flagged.is_empty());
    assert!(!svc.queue.contains_request("R1").await);

    let m1 = svc.queue.jobs("M1").await.unwrap();
    assert_eq!(ids(&m1), vec![keep.id]);
    assert_eq!(m1[0].order, 1);
    assert!(svc.queue.jobs("M2").await.unwrap().is_empty());

    let depths = svc.queue.depth_by_machine().await;
    assert_eq!(depths.get("M1"), Some(&1));
    assert_eq!(depths.get("M2"), Some(&0));
}

#[tokio::test]
async fn queue_survives_leader_change() {
    let svc = Services::new();
    let jobs = queue_of_three(&svc).await;
    svc.queue.pause(jobs[1].id, true).await.unwrap();

    let next = Services::over(svc.store.clone(), std::time::Duration::from_secs(1));
    next.load().await;
    let restored = next.queue.jobs("M1").await.unwrap();
    assert_eq!(ids(&restored), ids(&jobs));
    assert!(restored[1].paused);
}

#[tokio::test]
async fn enqueue_stamps_jobs_from_the_queue_clock() {
    use std::sync::Arc;

    use chrono::TimeZone;
    use cnc_conductor::clock::{Clock, ManualClock};
    use cnc_conductor::machine::{Machine, MachineRegistry};
    use cnc_conductor::queue::ProductionQueue;
    use cnc_conductor::store::{MemoryStore, StateStore};

    let start = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let machines = Arc::new(MachineRegistry::new(store.clone(), clock.clone() as Arc<dyn Clock>));
    machines.register(Machine::new("M1")).await.unwrap();
    let queue = ProductionQueue::new(store, machines, clock.clone(), 10);

    let first = queue.enqueue(QueueJob::new("M1", "R1", "p1"), false).await.unwrap();
    clock.advance(chrono::Duration::minutes(5));
    let second = queue.enqueue(QueueJob::new("M1", "R2", "p2"), false).await.unwrap();

    assert_eq!(first.created_at, start);
    assert_eq!(second.created_at, start + chrono::Duration::minutes(5));

    // Re-enqueueing a waiting job is refused
    let dup = queue.enqueue(first.clone(), false).await;
    assert!(matches!(dup, Err(ConductorError::InvalidRequest(_))));
}
