//! Dispatch loop behavior against a scripted bridge.


use std::time::Duration;

use cnc_conductor::bridge::{
    CallbackEvent, CompletionEvent, JobRef, MachiningCallback, RecordStatus,
};
use cnc_conductor::machine::MachineStatus;
use cnc_conductor::queue::{InFlightState, QueueJob};
use cnc_conductor::stage::{ReviewStatus, Stage};
use test_harness::Services;

#[tokio::test]
async fn paused_job_is_skipped_on_back_to_back_dispatch() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    let job1 = svc.queue.enqueue(QueueJob::new("M1", "R1", "p1"), false).await.unwrap();
    let job2 = svc.queue.enqueue(QueueJob::new("M1", "R2", "p2"), false).await.unwrap();
    let job3 = svc.queue.enqueue(QueueJob::new("M1", "R3", "p3"), false).await.unwrap();
    svc.queue.pause(job2.id, true).await.unwrap();

    let started = svc.dispatcher.tick().await.unwrap();
    assert_eq!(started, 1);
    assert_eq!(svc.bridge.started_program(0).as_deref(), Some("p1"));

    let snapshot = svc.queue.snapshot("M1").await.unwrap();
    assert_eq!(snapshot.in_flight.as_ref().unwrap().job.id, job1.id);

    let finished = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::success("M1", finished))
        .await
        .unwrap();

    // Completion triggers the next start without waiting for a tick
    assert_eq!(svc.bridge.starts().len(), 2);
    assert_eq!(svc.bridge.started_program(1).as_deref(), Some("p3"));

    let snapshot = svc.queue.snapshot("M1").await.unwrap();
    assert_eq!(snapshot.in_flight.as_ref().unwrap().job.id, job3.id);
    assert_eq!(snapshot.jobs.len(), 1);
    assert_eq!(snapshot.jobs[0].id, job2.id);
    assert_eq!(snapshot.jobs[0].order, 1);
}

#[tokio::test]
async fn at_most_one_unit_in_flight_per_machine() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    svc.queue
        .enqueue(QueueJob::new("M1", "R1", "p1").with_quantity(3), false)
        .await
        .unwrap();

    assert_eq!(svc.dispatcher.tick().await.unwrap(), 1);
    assert_eq!(svc.dispatcher.tick().await.unwrap(), 0);

    // Even if the machine claims to be idle, the running unit blocks a second start
    svc.bridge.set_status("M1", "IDLE");
    assert_eq!(svc.dispatcher.tick().await.unwrap(), 0);
    assert_eq!(svc.bridge.starts().len(), 1);

    let snapshot = svc.queue.snapshot("M1").await.unwrap();
    assert_eq!(snapshot.jobs[0].quantity, 2);
    assert_eq!(snapshot.in_flight.unwrap().job.quantity, 1);
}

#[tokio::test]
async fn machines_are_dispatched_independently() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    svc.add_machine("M2", None).await;
    svc.queue.enqueue(QueueJob::new("M1", "R1", "p1"), false).await.unwrap();
    svc.queue.enqueue(QueueJob::new("M2", "R2", "p2"), false).await.unwrap();
    svc.bridge.set_status("M2", "ALARM");

    assert_eq!(svc.dispatcher.tick().await.unwrap(), 1);
    assert_eq!(svc.machines.get("M2").await.unwrap().status, MachineStatus::Alarm);
    assert_eq!(svc.queue.jobs("M2").await.unwrap().len(), 1);

    svc.dispatcher.reset_machine("M2").await.unwrap();
    assert_eq!(svc.bridge.starts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn start_timeout_marks_machine_unknown_until_resolved() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    let job = svc.queue.enqueue(QueueJob::new("M1", "R1", "p1"), false).await.unwrap();
    svc.bridge.set_start_delay(Some(Duration::from_secs(5)));

    // Bridge errors stay on their machine; the pass itself succeeds
    assert_eq!(svc.dispatcher.tick().await.unwrap(), 0);
    assert_eq!(svc.machines.get("M1").await.unwrap().status, MachineStatus::Unknown);

    let in_flight = svc.queue.snapshot("M1").await.unwrap().in_flight.unwrap();
    assert_eq!(in_flight.job.id, job.id);
    assert_eq!(in_flight.state, InFlightState::Uncertain);
    assert_eq!(in_flight.job_ref, Some(JobRef::new("M1-1")));

    // The start went through after all
    svc.bridge.set_start_delay(None);
    svc.bridge.set_status("M1", "RUNNING");
    svc.dispatcher.service_machine("M1").await.unwrap();

    let in_flight = svc.queue.snapshot("M1").await.unwrap().in_flight.unwrap();
    assert_eq!(in_flight.state, InFlightState::Running);
    assert_eq!(svc.machines.get("M1").await.unwrap().status, MachineStatus::Running);
    assert_eq!(
        svc.records.get(&JobRef::new("M1-1")).await.unwrap().status,
        RecordStatus::Running
    );
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_unit_on_idle_machine_returns_to_queue_head() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    let first = svc.queue.enqueue(QueueJob::new("M1", "R1", "p1"), false).await.unwrap();
    let second = svc.queue.enqueue(QueueJob::new("M1", "R2", "p2"), false).await.unwrap();
    svc.bridge.set_start_delay(Some(Duration::from_secs(5)));
    svc.dispatcher.tick().await.unwrap();

    svc.bridge.set_start_delay(None);
    svc.machines.set_allow_job_start("M1", false).await.unwrap();
    svc.dispatcher.service_machine("M1").await.unwrap();

    let snapshot = svc.queue.snapshot("M1").await.unwrap();
    assert!(snapshot.in_flight.is_none());
    let ids: Vec<_> = snapshot.jobs.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert_eq!(snapshot.jobs[0].order, 1);
    assert!(svc.bridge.starts().is_empty());
}

#[tokio::test]
async fn rejected_start_moves_unit_to_failed_list() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    let job = svc.queue.enqueue(QueueJob::new("M1", "R1", "p1"), false).await.unwrap();
    svc.bridge.reject_starts(true);

    let res = svc.dispatcher.service_machine("M1").await;
    assert!(res.is_err());

    let failed = svc.queue.failed("M1").await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job.id, job.id);
    assert!(failed[0].reason.contains("door open"));

    svc.bridge.reject_starts(false);
    svc.queue.retry_failed("M1", job.id).await.unwrap();
    assert!(svc.queue.failed("M1").await.unwrap().is_empty());
    assert_eq!(svc.dispatcher.tick().await.unwrap(), 1);
}

#[tokio::test]
async fn completion_for_another_job_is_ignored() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    svc.queue
        .enqueue(QueueJob::new("M1", "R1", "p1").with_quantity(2), false)
        .await
        .unwrap();
    svc.dispatcher.tick().await.unwrap();

    svc.bridge.set_status("M1", "IDLE");
    svc.dispatcher
        .handle_completion(CompletionEvent::success("M1", JobRef::new("stale-ref")))
        .await
        .unwrap();

    let snapshot = svc.queue.snapshot("M1").await.unwrap();
    assert_eq!(snapshot.in_flight.unwrap().job_ref, Some(JobRef::new("M1-1")));
    assert_eq!(snapshot.jobs[0].quantity, 1);
    assert_eq!(svc.bridge.starts().len(), 1);
}

#[tokio::test]
async fn failed_completion_lands_on_failed_shelf() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    svc.queue.enqueue(QueueJob::new("M1", "R1", "p1"), false).await.unwrap();
    svc.dispatcher.tick().await.unwrap();

    let job_ref = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::fail("M1", job_ref.clone(), "spindle overload"))
        .await
        .unwrap();

    let failed = svc.queue.failed("M1").await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason, "spindle overload");
    let record = svc.records.get(&job_ref).await.unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
}

#[tokio::test]
async fn final_unit_advances_request_to_packing() {
    let svc = Services::new();
    svc.add_machine("M1", Some("8")).await;
    svc.request_at_machining("R1", "8", 2).await;
    svc.stages
        .review("R1", Stage::Machining, ReviewStatus::Approved, "qa", None)
        .await
        .unwrap();

    assert_eq!(svc.production.feed().await.unwrap(), 1);
    svc.dispatcher.tick().await.unwrap();

    let first = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::success("M1", first))
        .await
        .unwrap();
    assert_eq!(svc.stages.get("R1").await.unwrap().stage, Stage::Machining);

    let second = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::success("M1", second.clone()))
        .await
        .unwrap();

    let request = svc.stages.get("R1").await.unwrap();
    assert_eq!(request.stage, Stage::Packing);
    assert_eq!(
        request.artifact(Stage::Packing).unwrap().key,
        format!("machining-record/{}", second)
    );
    assert_eq!(svc.bridge.starts().len(), 2);
}

#[tokio::test]
async fn cancelled_request_is_stopped_on_next_poll() {
    let svc = Services::new();
    svc.add_machine("M1", Some("8")).await;
    svc.request_at_machining("R1", "8", 1).await;
    svc.production.feed().await.unwrap();
    svc.dispatcher.tick().await.unwrap();
    let job_ref = svc.bridge.starts()[0].1.clone();

    let request = svc.production.cancel_request("R1", "ops", Some("customer withdrew".into())).await.unwrap();
    assert!(request.archived && request.cancelled);
    assert!(svc.queue.snapshot("M1").await.unwrap().in_flight.unwrap().cancel_requested);

    svc.dispatcher.service_machine("M1").await.unwrap();

    assert_eq!(svc.bridge.stops(), vec!["M1".to_string()]);
    let snapshot = svc.queue.snapshot("M1").await.unwrap();
    assert!(snapshot.in_flight.is_none());
    assert!(snapshot.failed[0].reason.contains("request cancelled"));
    assert_eq!(svc.records.get(&job_ref).await.unwrap().status, RecordStatus::Canceled);
}

#[tokio::test]
async fn new_leader_does_not_machine_a_completed_unit_twice() {
    let old = Services::new();
    old.add_machine("M1", None).await;
    old.queue.enqueue(QueueJob::new("M1", "R1", "p1"), false).await.unwrap();
    old.dispatcher.tick().await.unwrap();
    let job_ref = old.bridge.starts()[0].1.clone();

    // The completion callback was recorded, but the old leader died before
    // the dispatch loop consumed it
    let (_, completion) = old
        .records
        .apply(
            "M1",
            CallbackEvent::Complete,
            MachiningCallback {
                job_ref: job_ref.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(completion.is_some());

    let new = Services::over(old.store.clone(), Duration::from_secs(1));
    new.load().await;
    assert_eq!(new.dispatcher.recover().await.unwrap(), 1);
    assert_eq!(
        new.queue.snapshot("M1").await.unwrap().in_flight.unwrap().state,
        InFlightState::Uncertain
    );

    new.dispatcher.tick().await.unwrap();

    let snapshot = new.queue.snapshot("M1").await.unwrap();
    assert!(snapshot.in_flight.is_none());
    assert!(snapshot.jobs.is_empty());
    assert!(new.bridge.starts().is_empty());
}

#[tokio::test]
async fn new_leader_requeues_a_unit_that_never_started() {
    let old = Services::new();
    old.add_machine("M1", None).await;
    let job = old
        .queue
        .enqueue(QueueJob::new("M1", "R1", "p1").with_quantity(2), false)
        .await
        .unwrap();
    old.dispatcher.tick().await.unwrap();

    let new = Services::over(old.store.clone(), Duration::from_secs(1));
    new.load().await;
    new.dispatcher.recover().await.unwrap();
    new.machines.set_allow_job_start("M1", false).await.unwrap();

    // New bridge reports the machine idle and has no record of the job finishing
    new.dispatcher.service_machine("M1").await.unwrap();

    let snapshot = new.queue.snapshot("M1").await.unwrap();
    assert!(snapshot.in_flight.is_none());
    assert_eq!(snapshot.jobs.len(), 1);
    assert_eq!(snapshot.jobs[0].id, job.id);
    assert_eq!(snapshot.jobs[0].quantity, 2);
}

#[tokio::test]
async fn retried_unit_rejoins_its_multi_unit_job() {
    let svc = Services::new();
    svc.add_machine("M1", None).await;
    let job1 = svc
        .queue
        .enqueue(QueueJob::new("M1", "R1", "p1").with_quantity(3), false)
        .await
        .unwrap();
    let job2 = svc.queue.enqueue(QueueJob::new("M1", "R2", "p2"), false).await.unwrap();
    svc.dispatcher.tick().await.unwrap();

    let job_ref = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::fail("M1", job_ref, "tool breakage"))
        .await
        .unwrap();
    // The next unit of the same job started back to back
    assert_eq!(svc.bridge.starts().len(), 2);

    let job = svc.queue.retry_failed("M1", job1.id).await.unwrap();
    assert_eq!(job.id, job1.id);
    assert_eq!(job.quantity, 2);
    assert!(svc.queue.failed("M1").await.unwrap().is_empty());

    let jobs = svc.queue.jobs("M1").await.unwrap();
    let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![job1.id, job2.id]);

    let reordered = svc.queue.reorder("M1", &[job2.id, job1.id]).await.unwrap();
    assert_eq!(reordered[0].id, job2.id);
    assert_eq!(reordered[1].id, job1.id);
    assert_eq!(reordered[1].quantity, 2);
}

#[tokio::test]
async fn failed_unit_holds_request_at_machining_until_retried() {
    let svc = Services::new();
    svc.add_machine("M1", Some("8")).await;
    svc.request_at_machining("R1", "8", 2).await;
    svc.stages
        .review("R1", Stage::Machining, ReviewStatus::Approved, "qa", None)
        .await
        .unwrap();
    svc.production.feed().await.unwrap();
    svc.dispatcher.tick().await.unwrap();

    let first = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::fail("M1", first, "chatter"))
        .await
        .unwrap();
    let second = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::success("M1", second))
        .await
        .unwrap();

    let request = svc.stages.get("R1").await.unwrap();
    assert_eq!(request.stage, Stage::Machining);
    assert!(request.artifact(Stage::Packing).is_none());
    let failed = svc.queue.failed("M1").await.unwrap();
    assert_eq!(failed.len(), 1);

    svc.queue.retry_failed("M1", failed[0].job.id).await.unwrap();
    svc.dispatcher.tick().await.unwrap();
    let third = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::success("M1", third))
        .await
        .unwrap();

    assert_eq!(svc.stages.get("R1").await.unwrap().stage, Stage::Packing);
    assert_eq!(svc.bridge.starts().len(), 3);
}

#[tokio::test]
async fn unit_from_replaced_program_does_not_finish_machining() {
    let svc = Services::new();
    svc.add_machine("M1", Some("8")).await;
    svc.request_at_machining("R1", "8", 1).await;
    svc.production.feed().await.unwrap();
    svc.dispatcher.tick().await.unwrap();

    svc.stages
        .put_artifact("R1", Stage::Machining, "R1/program-v2.nc", "cam")
        .await
        .unwrap();
    svc.stages
        .review("R1", Stage::Machining, ReviewStatus::Approved, "qa", None)
        .await
        .unwrap();

    let old = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::success("M1", old))
        .await
        .unwrap();
    assert_eq!(svc.stages.get("R1").await.unwrap().stage, Stage::Machining);

    assert_eq!(svc.production.feed().await.unwrap(), 1);
    svc.dispatcher.tick().await.unwrap();
    assert_eq!(svc.bridge.started_program(1).as_deref(), Some("R1/program-v2.nc"));
    let new = svc.bridge.finish("M1");
    svc.dispatcher
        .handle_completion(CompletionEvent::success("M1", new))
        .await
        .unwrap();
    assert_eq!(svc.stages.get("R1").await.unwrap().stage, Stage::Packing);
}
