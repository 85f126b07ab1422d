//! End-to-end dispatch scenarios against in-memory providers.
//!
//! Completion order is steered with per-mock delays; every scenario uses
//! short real sleeps and no network.

use std::sync::Arc;
use std::time::{Duration, Instant};

use beaconrpc_core::{
    AggregationPolicy, BeaconProvider, CallContext, Capability, CapabilitySet, DispatchError,
    HealthState, MultiClient, MultiClientConfig, ProviderId, Selection,
};
use beaconrpc_core::types::{
    AttesterDutiesOpts, Epoch, FinalityOpts, ValidatorIndex, VoluntaryExitPoolOpts,
};
use beaconrpc_mock::MockProvider;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn config(policy: AggregationPolicy) -> MultiClientConfig {
    let mut config = MultiClientConfig::default();
    config.dispatch.default_policy = policy;
    config
}

/// Build a client over `mocks`, keeping typed handles for inspection.
fn client(mocks: &[Arc<MockProvider>], config: MultiClientConfig) -> MultiClient {
    let providers = mocks.iter().map(|m| m.clone() as Arc<dyn BeaconProvider>);
    MultiClient::new(providers, config).unwrap()
}

fn finalized(name: &str, epoch: u64, delay_ms: u64) -> Arc<MockProvider> {
    Arc::new(
        MockProvider::new(name)
            .with_finalized_epoch(epoch)
            .with_delay(ms(delay_ms)),
    )
}

fn state_of(client: &MultiClient, name: &str) -> HealthState {
    client
        .health_summary()
        .into_iter()
        .find(|s| s.provider.as_str() == name)
        .map(|s| s.health.state)
        .unwrap()
}

fn sorted(ids: &[ProviderId]) -> Vec<String> {
    let mut names: Vec<String> = ids.iter().map(|p| p.to_string()).collect();
    names.sort();
    names
}

// ─── Health ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn inactive_provider_excluded_until_it_succeeds() {
    let flaky = Arc::new(MockProvider::new("flaky").down());
    let steady = finalized("steady", 10, 20);
    let mut cfg = MultiClientConfig::default();
    cfg.health.degraded_after = 2;
    cfg.dispatch.selection = Selection::AllowDegraded;
    let client = client(&[flaky.clone(), steady.clone()], cfg);
    let opts = FinalityOpts::default();

    // K = 2: degraded after two failures, inactive after four.
    for expected in [
        HealthState::Active,
        HealthState::Degraded,
        HealthState::Degraded,
        HealthState::Inactive,
    ] {
        let env = client.finality(&opts).await.unwrap();
        assert_eq!(env.providers(), &[ProviderId::from("steady")]);
        assert_eq!(state_of(&client, "flaky"), expected);
    }
    assert_eq!(flaky.calls(Capability::Finality).started, 4);

    // Inactive: no longer attempted at all.
    client.finality(&opts).await.unwrap();
    assert_eq!(flaky.calls(Capability::Finality).started, 4);
    let eligible = client
        .dispatcher()
        .registry()
        .eligible(Capability::Finality, Selection::AllowDegraded)
        .unwrap();
    assert_eq!(eligible.len(), 1);

    // A probe that fails keeps it out; one that succeeds brings it back.
    let reports = client.probe_unhealthy().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(state_of(&client, "flaky"), HealthState::Inactive);

    flaky.set_down(false);
    let reports = client.probe_unhealthy().await;
    assert!(reports[0].recovered());
    let status = client
        .health_summary()
        .into_iter()
        .find(|s| s.provider.as_str() == "flaky")
        .unwrap();
    assert_eq!(status.health.state, HealthState::Active);
    assert_eq!(status.health.consecutive_errors, 0);
    assert_eq!(flaky.probes(), 2);
}

#[tokio::test]
async fn background_prober_restores_provider() {
    let flaky = Arc::new(MockProvider::new("flaky").down());
    let steady = finalized("steady", 10, 20);
    let mut cfg = MultiClientConfig::default();
    cfg.health.degraded_after = 1;
    cfg.dispatch.selection = Selection::AllowDegraded;
    cfg.probe_interval = ms(10);
    let client = client(&[flaky.clone(), steady], cfg);

    client.finality(&FinalityOpts::default()).await.unwrap();
    client.finality(&FinalityOpts::default()).await.unwrap();
    assert_eq!(state_of(&client, "flaky"), HealthState::Inactive);

    let prober = client.spawn_prober();
    flaky.set_down(false);
    tokio::time::sleep(ms(60)).await;
    assert_eq!(state_of(&client, "flaky"), HealthState::Active);
    prober.shutdown().await;
}

// ─── FirstSuccess ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_success_returns_fastest_and_leaves_losers_untouched() {
    let fast = finalized("fast", 10, 10);
    let slow_a = finalized("slow-a", 10, 300);
    let slow_b = finalized("slow-b", 10, 300);
    let client = client(
        &[slow_a.clone(), fast.clone(), slow_b.clone()],
        config(AggregationPolicy::FirstSuccess),
    );

    let started = Instant::now();
    let env = client.finality(&FinalityOpts::default()).await.unwrap();
    assert!(started.elapsed() < ms(250), "waited for slow providers");
    assert_eq!(env.providers(), &[ProviderId::from("fast")]);
    assert_eq!(env.value().unwrap().data.finalized.epoch, Epoch(10));
    assert!(!env.is_disagreement());

    // The losers were started, then cancelled before they could answer.
    tokio::time::sleep(ms(400)).await;
    for slow in [&slow_a, &slow_b] {
        let calls = slow.calls(Capability::Finality);
        assert_eq!(calls.started, 1);
        assert_eq!(calls.completed, 0);
    }
    for status in client.health_summary() {
        assert_eq!(status.health.state, HealthState::Active);
        assert_eq!(status.health.consecutive_errors, 0);
        if status.provider.as_str() != "fast" {
            assert!(status.health.last_success.is_none());
        }
    }
}

// ─── Majority ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn majority_of_two_picks_the_agreeing_pair() {
    let client = client(
        &[finalized("a", 10, 0), finalized("b", 11, 0), finalized("c", 10, 0)],
        config(AggregationPolicy::majority(2)),
    );
    let env = client.finality(&FinalityOpts::default()).await.unwrap();
    assert!(!env.is_disagreement());
    assert_eq!(env.value().unwrap().data.finalized.epoch, Epoch(10));
    assert_eq!(sorted(env.providers()), vec!["a", "c"]);
}

#[tokio::test]
async fn majority_without_quorum_reports_disagreement() {
    let client = client(
        &[finalized("a", 10, 0), finalized("b", 11, 0), finalized("c", 12, 0)],
        config(AggregationPolicy::majority(2)),
    );
    let env = client.finality(&FinalityOpts::default()).await.unwrap();
    assert!(env.is_disagreement());
    assert!(env.value().is_none());
    assert_eq!(env.candidates().len(), 3);
    assert_eq!(sorted(env.providers()), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn majority_tolerates_a_failing_provider() {
    let down = Arc::new(MockProvider::new("down").down());
    let client = client(
        &[down, finalized("a", 10, 5), finalized("b", 10, 5)],
        config(AggregationPolicy::majority(2)),
    );
    let env = client.finality(&FinalityOpts::default()).await.unwrap();
    assert_eq!(sorted(env.providers()), vec!["a", "b"]);
}

// ─── AllMustAgree ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn all_must_agree_on_equal_answers() {
    let client = client(
        &[finalized("a", 10, 0), finalized("b", 10, 5), finalized("c", 10, 10)],
        config(AggregationPolicy::AllMustAgree),
    );
    let env = client.finality(&FinalityOpts::default()).await.unwrap();
    assert_eq!(env.value().unwrap().data.finalized.epoch, Epoch(10));
    assert_eq!(sorted(env.providers()), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn all_must_agree_reports_divergence() {
    let client = client(
        &[finalized("a", 10, 0), finalized("b", 10, 0), finalized("c", 11, 0)],
        config(AggregationPolicy::AllMustAgree),
    );
    let env = client.finality(&FinalityOpts::default()).await.unwrap();
    assert!(env.is_disagreement());
    assert_eq!(env.candidates().len(), 2);
}

#[tokio::test]
async fn all_must_agree_fails_when_one_provider_fails() {
    let down = Arc::new(MockProvider::new("down").down());
    let client = client(
        &[finalized("a", 10, 0), down],
        config(AggregationPolicy::AllMustAgree),
    );
    let err = client.finality(&FinalityOpts::default()).await.unwrap_err();
    assert!(matches!(err, DispatchError::Incomplete { .. }));
    assert_eq!(err.failures()[0].provider.as_str(), "down");
}

// ─── Capabilities ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn unsupported_everywhere_is_no_providers_without_any_call() {
    let finality_only = CapabilitySet::empty().with(Capability::Finality);
    let mocks: Vec<Arc<MockProvider>> = ["a", "b"]
        .into_iter()
        .map(|n| Arc::new(MockProvider::new(n).with_capabilities(finality_only)))
        .collect();
    let client = client(&mocks, MultiClientConfig::default());

    let err = client
        .voluntary_exit_pool(&VoluntaryExitPoolOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::NoProviders { capability: Capability::VoluntaryExitPool }
    ));
    assert!(err.is_fatal());
    for mock in &mocks {
        assert_eq!(mock.total_calls(), 0);
    }
}

#[tokio::test]
async fn incapable_providers_are_skipped_not_penalized() {
    let duties_only = Arc::new(
        MockProvider::new("duties").with_capabilities(CapabilitySet::empty().with(Capability::AttesterDuties)),
    );
    let full = Arc::new(MockProvider::new("full"));
    let client = client(&[duties_only.clone(), full], MultiClientConfig::default());

    let exits = client
        .voluntary_exit_pool(&VoluntaryExitPoolOpts::default())
        .await
        .unwrap();
    assert_eq!(exits.providers(), &[ProviderId::from("full")]);
    assert_eq!(exits.value().unwrap().data.len(), 5);
    assert_eq!(duties_only.total_calls(), 0);

    let duties = client
        .attester_duties(&AttesterDutiesOpts {
            epoch: Epoch(2),
            indices: vec![ValidatorIndex(1), ValidatorIndex(2)],
        })
        .await
        .unwrap();
    assert_eq!(duties.value().unwrap().data.len(), 2);
}

// ─── Cancellation and deadlines ───────────────────────────────────────────────

#[tokio::test]
async fn caller_cancellation_aborts_promptly_without_health_changes() {
    let mocks = [finalized("a", 10, 500), finalized("b", 10, 500)];
    let client = client(&mocks, MultiClientConfig::default());

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ms(20)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let ctx = CallContext::new(Capability::Finality).with_cancellation(token);
    let err = client
        .dispatcher()
        .dispatch(ctx, |p, _| async move {
            Ok(p.finality(&FinalityOpts::default()).await?.data)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled));
    assert!(started.elapsed() < ms(200));

    tokio::time::sleep(ms(50)).await;
    for status in client.health_summary() {
        assert_eq!(status.health.state, HealthState::Active);
        assert_eq!(status.health.consecutive_errors, 0);
        assert!(status.health.last_success.is_none());
    }
    for mock in &mocks {
        assert_eq!(mock.calls(Capability::Finality).completed, 0);
    }
}

#[tokio::test]
async fn already_cancelled_call_makes_no_attempt() {
    let mock = finalized("a", 10, 0);
    let client = client(&[mock.clone()], MultiClientConfig::default());
    let token = CancellationToken::new();
    token.cancel();

    let err = client
        .dispatcher()
        .dispatch(
            CallContext::new(Capability::Finality).with_cancellation(token),
            |p, _| async move { Ok(p.finality(&FinalityOpts::default()).await?.data) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Cancelled));
    assert_eq!(mock.total_calls(), 0);
}

#[tokio::test]
async fn per_call_policy_overrides_default() {
    let client = client(
        &[finalized("a", 10, 0), finalized("b", 11, 30)],
        config(AggregationPolicy::FirstSuccess),
    );
    let env = client
        .dispatcher()
        .dispatch(
            CallContext::new(Capability::Finality).with_policy(AggregationPolicy::AllMustAgree),
            |p, _| async move { Ok(p.finality(&FinalityOpts::default()).await?.data) },
        )
        .await
        .unwrap();
    assert!(env.is_disagreement());
    assert_eq!(env.metadata().policy, AggregationPolicy::AllMustAgree);
}

// ─── Registry changes and concurrency ─────────────────────────────────────────

#[tokio::test]
async fn removal_during_a_call_lets_the_attempt_finish() {
    let slow = finalized("slow", 10, 80);
    let client = client(&[slow.clone()], MultiClientConfig::default());
    let opts = FinalityOpts::default();

    let (reply, removed) = tokio::join!(client.finality(&opts), async {
        tokio::time::sleep(ms(20)).await;
        client.remove_provider(&ProviderId::from("slow"))
    });
    assert!(removed.is_some());
    let env = reply.unwrap();
    assert_eq!(env.providers(), &[ProviderId::from("slow")]);
    assert_eq!(slow.calls(Capability::Finality).started, 1);

    // Later calls no longer see it.
    let err = client.finality(&opts).await.unwrap_err();
    assert!(matches!(err, DispatchError::NoProviders { .. }));
    assert_eq!(slow.calls(Capability::Finality).started, 1);
}

#[tokio::test]
async fn provider_added_during_a_call_joins_the_next_one() {
    let first = finalized("first", 10, 40);
    let client = client(&[first], MultiClientConfig::default());
    let late = finalized("late", 10, 0);
    let opts = FinalityOpts::default();

    let (reply, _) = tokio::join!(client.finality(&opts), async {
        tokio::time::sleep(ms(10)).await;
        client.add_provider(late.clone()).unwrap();
    });
    assert_eq!(reply.unwrap().providers(), &[ProviderId::from("first")]);
    assert_eq!(late.total_calls(), 0);

    let env = client.finality(&opts).await.unwrap();
    assert_eq!(env.providers(), &[ProviderId::from("late")]);
}

#[tokio::test]
async fn concurrent_failures_on_one_provider_are_all_counted() {
    let down = Arc::new(MockProvider::new("down").down().with_delay(ms(10)));
    let client = client(&[down.clone()], MultiClientConfig::default());
    let opts = FinalityOpts::default();

    let replies = join_all((0..20).map(|_| client.finality(&opts))).await;
    assert!(replies.iter().all(|r| r.is_err()));

    let status = &client.health_summary()[0];
    assert_eq!(down.calls(Capability::Finality).started, 20);
    assert_eq!(status.health.consecutive_errors, 20);
    assert_eq!(status.health.state, HealthState::Inactive);
}
