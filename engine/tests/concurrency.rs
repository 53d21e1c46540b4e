//! One generation at a time per loaded model.

mod common;

use common::{config_with_policy, pair, scripted_manager_with, CHAT_PROMPT};
use engine::config::BusyPolicy;
use engine::device::DeviceKind;
use engine::model::mock::{ExecutionLog, ScriptedSpec};
use engine::model::HostLink;
use engine::EngineError;
use std::sync::Arc;
use std::time::Duration;

fn slow_model(log: Arc<ExecutionLog>) -> ScriptedSpec {
    ScriptedSpec::decoder(4)
        .with_compute_delay(Duration::from_millis(40))
        .with_log(log)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_overlap() {
    let log = Arc::new(ExecutionLog::default());
    let manager = Arc::new(scripted_manager_with(
        slow_model(Arc::clone(&log)),
        pair(DeviceKind::Cuda, DeviceKind::Cpu),
        config_with_policy(BusyPolicy::Queue { timeout_ms: 10_000 }),
        Arc::new(HostLink),
    ));
    manager.load().await.unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.generate(CHAT_PROMPT, None).await })
        })
        .collect();

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.text, "ok");
    }

    assert_eq!(log.windows().len(), 4);
    assert!(!log.has_overlap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reject_policy_turns_away_second_request() {
    let log = Arc::new(ExecutionLog::default());
    let spec = ScriptedSpec::decoder(4)
        .with_compute_delay(Duration::from_millis(300))
        .with_log(Arc::clone(&log));
    let manager = Arc::new(scripted_manager_with(
        spec,
        pair(DeviceKind::Cuda, DeviceKind::Cpu),
        config_with_policy(BusyPolicy::Reject),
        Arc::new(HostLink),
    ));
    manager.load().await.unwrap();

    let first = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.generate(CHAT_PROMPT, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = manager.generate(CHAT_PROMPT, None).await;

    assert!(matches!(second, Err(EngineError::Busy(_))));
    assert!(first.await.unwrap().is_ok());
    assert_eq!(manager.stats().snapshot().requests_rejected, 1);
    assert_eq!(log.windows().len(), 1);
}
