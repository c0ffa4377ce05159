//! Child-process worker tests, using `sh` scripts as workers.
//!
//! Run with: cargo test --test process_worker_tests


use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use geo_broker::config::WorkerCommandConfig;
use geo_broker::identity::ClientId;
use geo_broker::scheduler::FailureReason;
use geo_broker::worker::{ProcessSpawner, ProcessWorker, WorkerCall, WorkerEvent, WorkerProxy};
use geo_broker::BrokerError;
use test_harness::{stewart_args, test_broker_config, TestBroker};

/// Announces itself, then answers every call with `done`.
const ECHO_WORKER: &str = r#"
echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"signal\":\"ready\"}"
while IFS= read -r line; do
  job_id=$(printf '%s' "$line" | sed 's/.*"job_id":"\([^"]*\)".*/\1/')
  echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"job_id\":\"$job_id\",\"result_bytes\":\"done\"}"
done
"#;

/// Announces itself, then answers every call with an error marker.
const FAILING_WORKER: &str = r#"
echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"signal\":\"ready\"}"
while IFS= read -r line; do
  job_id=$(printf '%s' "$line" | sed 's/.*"job_id":"\([^"]*\)".*/\1/')
  echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"job_id\":\"$job_id\",\"error_marker\":\"Error in stewart_to_json\"}"
done
"#;

/// Announces itself and exits on the first call.
const CRASHING_WORKER: &str = r#"
echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"signal\":\"ready\"}"
read -r line
exit 1
"#;

/// Worker 1 sends one heartbeat on its first call, then wedges without
/// answering. Every other worker answers with its own id.
const WEDGING_WORKER: &str = r#"
echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"signal\":\"ready\"}"
while IFS= read -r line; do
  job_id=$(printf '%s' "$line" | sed 's/.*"job_id":"\([^"]*\)".*/\1/')
  if [ "$GEO_BROKER_WORKER_ID" = "1" ]; then
    echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"signal\":\"heartbeat\"}"
    sleep 5
  fi
  echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"job_id\":\"$job_id\",\"result_bytes\":\"done-$GEO_BROKER_WORKER_ID\"}"
done
"#;

/// Computes for about half a second, heartbeating throughout.
const SLOW_HEARTBEATING_WORKER: &str = r#"
echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"signal\":\"ready\"}"
while IFS= read -r line; do
  job_id=$(printf '%s' "$line" | sed 's/.*"job_id":"\([^"]*\)".*/\1/')
  for i in 1 2 3 4 5 6 7 8 9 10; do
    echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"signal\":\"heartbeat\"}"
    sleep 0.05
  done
  echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"job_id\":\"$job_id\",\"result_bytes\":\"slow-$GEO_BROKER_WORKER_ID\"}"
done
"#;

/// Writes a non-UTF-8 line and a line of noise before each reply.
const NOISY_WORKER: &str = r#"
echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"signal\":\"ready\"}"
while IFS= read -r line; do
  job_id=$(printf '%s' "$line" | sed 's/.*"job_id":"\([^"]*\)".*/\1/')
  printf '\377\376 loading R packages\n'
  echo "Warning message: something odd"
  echo "{\"worker_id\":$GEO_BROKER_WORKER_ID,\"job_id\":\"$job_id\",\"result_bytes\":[0,159,146,150]}"
done
"#;

fn script(body: &str) -> WorkerCommandConfig {
    WorkerCommandConfig::new("sh").with_arg("-c").with_arg(body)
}

async fn next_non_heartbeat(worker: &ProcessWorker) -> Option<WorkerEvent> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), worker.receive())
            .await
            .expect("worker did not answer in time")
            .unwrap()
        {
            Some(WorkerEvent::Heartbeat) => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn test_process_worker_round_trip() {
    let worker = ProcessWorker::spawn(7, &script(ECHO_WORKER), Duration::from_millis(50)).unwrap();
    assert_eq!(worker.worker_id(), 7);
    assert_eq!(next_non_heartbeat(&worker).await, Some(WorkerEvent::Ready));

    let job_id = Uuid::new_v4();
    let call = WorkerCall {
        worker_id: 7,
        job_id,
        call_template: "stewart_to_json(var_name=var_name)".to_string(),
        json_args: serde_json::json!({"var_name": "pop"}),
    };
    worker.send(&call).await.unwrap();

    assert_eq!(
        next_non_heartbeat(&worker).await,
        Some(WorkerEvent::Reply {
            job_id,
            outcome: Ok(b"done".to_vec()),
        })
    );

    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_synthetic_heartbeats_while_process_runs() {
    let config = script(ECHO_WORKER).with_synthetic_heartbeats();
    let worker = ProcessWorker::spawn(1, &config, Duration::from_millis(20)).unwrap();

    let mut heartbeats = 0;
    while heartbeats < 3 {
        match tokio::time::timeout(Duration::from_secs(5), worker.receive())
            .await
            .unwrap()
            .unwrap()
        {
            Some(WorkerEvent::Heartbeat) => heartbeats += 1,
            Some(_) => {}
            None => panic!("worker closed unexpectedly"),
        }
    }

    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_process_exit_closes_the_channel() {
    let worker = ProcessWorker::spawn(1, &script("exit 0"), Duration::from_millis(20)).unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match worker.receive().await.unwrap() {
                None => break,
                Some(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "exited worker should close its event stream");
}

#[tokio::test]
async fn test_missing_program_fails_to_spawn() {
    let config = WorkerCommandConfig::new("definitely-not-a-worker-binary");
    let err = ProcessWorker::spawn(3, &config, Duration::from_millis(20)).err().unwrap();
    assert!(matches!(err, BrokerError::WorkerSpawn { worker_id: 3, .. }));
}

#[tokio::test]
async fn test_broker_over_process_workers() {
    let spawner = ProcessSpawner::new(script(ECHO_WORKER), Duration::from_millis(20));
    let broker = TestBroker::start(test_broker_config(1, 2), Arc::new(spawner));

    let result = broker
        .handle
        .submit("stewart", stewart_args("pop"), ClientId::from("c"))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result, b"done");

    broker.stop().await;
}

#[tokio::test]
async fn test_error_marker_from_process_worker() {
    let spawner = ProcessSpawner::new(script(FAILING_WORKER), Duration::from_millis(20));
    let broker = TestBroker::start(test_broker_config(1, 1), Arc::new(spawner));

    let err = broker
        .handle
        .submit("stewart", stewart_args("pop"), ClientId::from("c"))
        .unwrap()
        .await
        .unwrap_err();
    match err {
        BrokerError::ComputationFailed { reason, .. } => {
            assert_eq!(reason, FailureReason::WorkerError("Error in stewart_to_json".to_string()))
        }
        other => panic!("expected ComputationFailed, got {other}"),
    }

    broker.stop().await;
}

#[tokio::test]
async fn test_crashing_process_workers_fail_the_job_after_one_retry() {
    let spawner = ProcessSpawner::new(script(CRASHING_WORKER), Duration::from_millis(20));
    let broker = TestBroker::start(test_broker_config(1, 1), Arc::new(spawner));

    let err = broker
        .handle
        .submit("stewart", stewart_args("pop"), ClientId::from("c"))
        .unwrap()
        .await
        .unwrap_err();
    match err {
        BrokerError::ComputationFailed { reason, .. } => {
            assert!(matches!(reason, FailureReason::WorkerError(_)), "unexpected reason {reason}")
        }
        other => panic!("expected ComputationFailed, got {other}"),
    }

    broker.stop().await;
}

#[tokio::test]
async fn test_silent_process_sends_no_heartbeats() {
    let worker = ProcessWorker::spawn(1, &script(ECHO_WORKER), Duration::from_millis(20)).unwrap();
    assert_eq!(next_non_heartbeat(&worker).await, Some(WorkerEvent::Ready));

    let quiet = tokio::time::timeout(Duration::from_millis(200), worker.receive()).await;
    assert!(quiet.is_err(), "a worker writing nothing must stay silent");

    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_wedged_process_worker_retried_within_liveness_window() {
    let spawner = ProcessSpawner::new(script(WEDGING_WORKER), Duration::from_millis(20));
    let config = test_broker_config(1, 1);
    let liveness = config.pool.liveness_timeout();
    let job_timeout = config.job_timeout();
    let broker = TestBroker::start(config, Arc::new(spawner));
    assert!(broker.wait_for_idle(1, Duration::from_secs(5)).await);

    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        broker
            .handle
            .submit("stewart", stewart_args("pop"), ClientId::from("c"))
            .unwrap(),
    )
    .await
    .expect("job was never redispatched")
    .unwrap();

    assert_eq!(result, b"done-2");
    let elapsed = started.elapsed();
    assert!(
        elapsed < job_timeout / 2,
        "retry took {:?}; heartbeat loss ({:?}) should trigger it, not the job deadline",
        elapsed,
        liveness
    );

    broker.stop().await;
}

#[tokio::test]
async fn test_heartbeating_process_worker_outlives_liveness_timeout() {
    let spawner = ProcessSpawner::new(script(SLOW_HEARTBEATING_WORKER), Duration::from_millis(20));
    let broker = TestBroker::start(test_broker_config(1, 1), Arc::new(spawner));

    let result = broker
        .handle
        .submit("stewart", stewart_args("pop"), ClientId::from("c"))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(result, b"slow-1", "job must finish on the first worker");

    broker.stop().await;
}

#[tokio::test]
async fn test_noise_on_stdout_is_skipped() {
    let spawner = ProcessSpawner::new(script(NOISY_WORKER), Duration::from_millis(20));
    let broker = TestBroker::start(test_broker_config(1, 1), Arc::new(spawner));

    for _ in 0..2 {
        let result = broker
            .handle
            .submit("stewart", stewart_args("pop"), ClientId::from("c"))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(result, vec![0u8, 159, 146, 150]);
    }
    assert_eq!(broker.stats().await.pool_size, 1);

    broker.stop().await;
}
