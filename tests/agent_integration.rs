//! Agent integration tests
//!
//! Full agents against one in-process coordination store, exercising the
//! cold-start, formation, flap-suppression and crash scenarios end to end
//! over the real control ports.

#[allow(dead_code)]
mod common;

use common::*;
use ochopod::coord::MemoryStore;
use ochopod::types::{ClusterView, PodRole, ProcessState};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

// =============================================================================
// Cold start
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_single_pod_cold_start() {
    let store = MemoryStore::new();
    let hook = TestHook::new("sleep 3600", Duration::from_millis(400));
    let _pod = spawn_pod(&store, "demo.app", hook.clone());

    let pods = wait_for(&store, "demo.app", Duration::from_secs(15), "pod running", |p| {
        converged(p, 1)
    })
    .await;

    // Only candidate wins the lock, sweep commits, child is up.
    let descriptor = &pods[0].1;
    assert_eq!(descriptor.state, PodRole::Leader);
    assert_eq!(descriptor.process, ProcessState::Running);
    assert!(committed_hash(&store, "demo.app").is_some());
    assert_eq!(hook.last_size.load(Ordering::SeqCst), 1);

    let (code, body) = post(descriptor, "/info", None).await;
    assert_eq!(code, 200);
    assert_eq!(body["process"], "running");
    assert_eq!(body["state"], "leader");
    assert_eq!(body["cluster"], "demo.app");
}

// =============================================================================
// Three-pod formation
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_three_pod_formation() {
    let store = MemoryStore::new();
    let damper = Duration::from_millis(1500);
    let hooks: Vec<_> = (0..3)
        .map(|_| TestHook::new("sleep 3600", damper))
        .collect();
    let _pods: Vec<_> = hooks
        .iter()
        .map(|hook| spawn_pod(&store, "demo.ensemble", hook.clone()))
        .collect();

    let pods = wait_for(
        &store,
        "demo.ensemble",
        Duration::from_secs(20),
        "ensemble formation",
        |p| converged(p, 3),
    )
    .await;

    // One leader, seq-ordered members, and a single damped sweep: every
    // pod was configured exactly once and saw the full ensemble.
    let seqs: Vec<u64> = pods.iter().map(|(_, d)| d.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    for hook in &hooks {
        assert_eq!(hook.configure_count(), 1);
        assert_eq!(hook.last_size.load(Ordering::SeqCst), 3);
    }
}

// =============================================================================
// Flap suppression
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_flap_is_damped() {
    let store = MemoryStore::new();
    let damper = Duration::from_millis(1000);
    let hooks: Vec<_> = (0..2)
        .map(|_| TestHook::new("sleep 3600", damper))
        .collect();
    let _pods: Vec<_> = hooks
        .iter()
        .map(|hook| spawn_pod(&store, "demo.flap", hook.clone()))
        .collect();

    let pods = wait_for(&store, "demo.flap", Duration::from_secs(20), "pair running", |p| {
        converged(p, 2)
    })
    .await;
    let hash_before = committed_hash(&store, "demo.flap").unwrap();
    let configured_before: Vec<u32> = hooks.iter().map(|h| h.configure_count()).collect();

    // Expire the follower's session: its node vanishes and the agent
    // re-registers well inside the damper window.
    let (follower_path, follower) = pods
        .iter()
        .find(|(_, d)| d.state == PodRole::Follower)
        .cloned()
        .unwrap();
    let session = store.session_of(&follower_path).unwrap();
    store.expire(session);

    // Leader sees the drop and the return; the damper bridges both.
    tokio::time::sleep(damper * 4).await;

    let pods = members(&store, "demo.flap").await;
    assert!(converged(&pods, 2), "pair did not re-form: {:?}", pods);
    assert_eq!(committed_hash(&store, "demo.flap").unwrap(), hash_before);
    let configured_after: Vec<u32> = hooks.iter().map(|h| h.configure_count()).collect();
    assert_eq!(configured_before, configured_after);

    // Same identity, fresh registration node.
    let (returned_path, returned) = pods
        .iter()
        .find(|(_, d)| d.uuid == follower.uuid)
        .cloned()
        .unwrap();
    assert_ne!(returned_path, follower_path);
    assert_eq!(returned.seq, follower.seq);
}

// =============================================================================
// Crash handling
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_repeated_child_crash_goes_failed() {
    let store = MemoryStore::new();
    let hook = TestHook::with_checks("exit 1", Duration::from_millis(400), 2);
    let _pod = spawn_pod(&store, "demo.crash", hook.clone());

    let pods = wait_for(
        &store,
        "demo.crash",
        Duration::from_secs(30),
        "restart budget exhaustion",
        |p| p.len() == 1 && p[0].1.process == ProcessState::Failed,
    )
    .await;

    let descriptor = &pods[0].1;
    let (code, body) = post(descriptor, "/info", None).await;
    assert_eq!(code, 200);
    assert_eq!(body["process"], "failed");

    // An explicit on re-attempts configuration from scratch.
    let configured = hook.configure_count();
    let (code, body) = control(descriptor, "on", None).await;
    assert_eq!(code, 200);
    assert_eq!(body["state"], "running");
    assert_eq!(hook.configure_count(), configured + 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_voluntary_exit_goes_dead() {
    let store = MemoryStore::new();
    let hook = TestHook::new("true", Duration::from_millis(300));
    let _pod = spawn_pod(&store, "demo.oneshot", hook);

    // A clean exit idles the pod rather than burning restarts.
    wait_for(
        &store,
        "demo.oneshot",
        Duration::from_secs(15),
        "voluntary exit",
        |p| p.len() == 1 && p[0].1.process == ProcessState::Dead,
    )
    .await;
}

// =============================================================================
// Control surface
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_kill_is_terminal() {
    let store = MemoryStore::new();
    let hook = TestHook::new("sleep 3600", Duration::from_millis(300));
    let _pod = spawn_pod(&store, "demo.kill", hook);

    let pods = wait_for(&store, "demo.kill", Duration::from_secs(15), "pod running", |p| {
        converged(p, 1)
    })
    .await;
    let descriptor = &pods[0].1;

    let (code, body) = control(descriptor, "kill", None).await;
    assert_eq!(code, 200);
    assert_eq!(body["state"], "dead");

    // Dead is permanent: every control request is a 410 no-op from here.
    let (code, _) = post(descriptor, "/info", None).await;
    assert_eq!(code, 410);
    let (code, _) = control(descriptor, "on", None).await;
    assert_eq!(code, 410);

    wait_for(&store, "demo.kill", Duration::from_secs(5), "dead registered", |p| {
        p.len() == 1 && p[0].1.process == ProcessState::Dead
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_on_is_idempotent() {
    let store = MemoryStore::new();
    let hook = TestHook::new("sleep 3600", Duration::from_millis(300));
    let _pod = spawn_pod(&store, "demo.idem", hook.clone());

    let pods = wait_for(&store, "demo.idem", Duration::from_secs(15), "pod running", |p| {
        converged(p, 1)
    })
    .await;
    let descriptor = pods[0].1.clone();
    let hash = committed_hash(&store, "demo.idem").unwrap();
    let configured = hook.configure_count();

    let view = ClusterView {
        key: descriptor.uuid.to_string(),
        pods: BTreeMap::from([(descriptor.uuid.to_string(), descriptor.clone())]),
        dependencies: BTreeMap::new(),
    };
    let payload = serde_json::to_value(&view).unwrap();

    for _ in 0..2 {
        let (code, body) = control(&descriptor, "on", Some(payload.clone())).await;
        assert_eq!(code, 200);
        assert_eq!(body["state"], "running");
    }

    // Identical snapshot: the child kept running and nothing re-ran.
    assert_eq!(hook.configure_count(), configured);
    assert_eq!(committed_hash(&store, "demo.idem").unwrap(), hash);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_verdicts() {
    let store = MemoryStore::new();
    let hook = TestHook::new("sleep 3600", Duration::from_millis(300));
    let _pod = spawn_pod(&store, "demo.check", hook.clone());

    let pods = wait_for(&store, "demo.check", Duration::from_secs(15), "pod running", |p| {
        converged(p, 1)
    })
    .await;
    let descriptor = pods[0].1.clone();

    // An empty check is a no-op probe.
    let (code, body) = control(&descriptor, "check", None).await;
    assert_eq!(code, 200);
    assert_eq!(body["ok"], true);

    let view = ClusterView {
        key: descriptor.uuid.to_string(),
        pods: BTreeMap::from([(descriptor.uuid.to_string(), descriptor.clone())]),
        dependencies: BTreeMap::new(),
    };
    let payload = serde_json::to_value(&view).unwrap();

    let (code, body) = control(&descriptor, "check", Some(payload.clone())).await;
    assert_eq!(code, 200);
    assert_eq!(body["ok"], true);

    // A rejecting hook surfaces as 406 to the leader.
    hook.reject.store(true, Ordering::SeqCst);
    let (code, _) = control(&descriptor, "check", Some(payload)).await;
    assert_eq!(code, 406);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_log_and_reset() {
    let store = MemoryStore::new();
    let hook = TestHook::new("sleep 3600", Duration::from_millis(300));
    let _pod = spawn_pod(&store, "demo.reset", hook);

    let pods = wait_for(&store, "demo.reset", Duration::from_secs(15), "pod running", |p| {
        converged(p, 1)
    })
    .await;
    let (old_path, descriptor) = pods[0].clone();

    let (code, body) = post(&descriptor, "/log", None).await;
    assert_eq!(code, 200);
    assert!(body["lines"].is_array());

    let (code, body) = post(&descriptor, "/reset", None).await;
    assert_eq!(code, 200);
    assert_eq!(body["ok"], true);

    // The pod drops its session and re-registers: fresh node, same seq,
    // untouched child.
    wait_for(&store, "demo.reset", Duration::from_secs(15), "re-registration", |p| {
        converged(p, 1) && p[0].0 != old_path && p[0].1.seq == descriptor.seq
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_probe_status_reaches_info() {
    let store = MemoryStore::new();
    let hook = TestHook::with_probe(
        "sleep 3600",
        Duration::from_millis(300),
        "1 pod, all good",
        Duration::from_millis(200),
    );
    let _pod = spawn_pod(&store, "demo.probe", hook.clone());

    let pods = wait_for(&store, "demo.probe", Duration::from_secs(15), "pod running", |p| {
        converged(p, 1)
    })
    .await;
    let descriptor = pods[0].1.clone();

    // The leader keeps assessing the settled cluster; the snippet shows up
    // as the pod status.
    let started = std::time::Instant::now();
    loop {
        let (code, body) = post(&descriptor, "/info", None).await;
        assert_eq!(code, 200);
        if body["status"] == "1 pod, all good" {
            break;
        }
        if started.elapsed() > Duration::from_secs(10) {
            panic!("probe status never surfaced: {}", body);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(hook.probed.load(Ordering::SeqCst) > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sanity_metrics_reach_info() {
    let store = MemoryStore::new();
    let hook = TestHook::with_metrics(
        "sleep 3600",
        Duration::from_millis(300),
        Duration::from_millis(200),
        json!({"connections": 42}),
    );
    let _pod = spawn_pod(&store, "demo.metrics", hook);

    let pods = wait_for(&store, "demo.metrics", Duration::from_secs(15), "pod running", |p| {
        converged(p, 1)
    })
    .await;
    let descriptor = pods[0].1.clone();

    // Whatever the sanity check returns becomes the pod metrics.
    let started = std::time::Instant::now();
    loop {
        let (code, body) = post(&descriptor, "/info", None).await;
        assert_eq!(code, 200);
        if body["metrics"]["connections"] == 42 {
            break;
        }
        if started.elapsed() > Duration::from_secs(10) {
            panic!("metrics never surfaced: {}", body);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signal_round_trip() {
    let store = MemoryStore::new();
    let hook = TestHook::new("sleep 3600", Duration::from_millis(300));
    let _pod = spawn_pod(&store, "demo.signal", hook);

    let pods = wait_for(&store, "demo.signal", Duration::from_secs(15), "pod running", |p| {
        converged(p, 1)
    })
    .await;

    let (code, _) = control(&pods[0].1, "signal", Some(json!({"op": "noop"}))).await;
    assert_eq!(code, 200);
}
