//! The check loop.
//!
//! Every second the scheduler reads the enabled targets and launches a check
//! for each one whose interval divides the current epoch second. A target is
//! never checked twice concurrently; distinct targets run in parallel with no
//! cap. Firings are tied to wall-clock alignment, so a tick that runs late
//! skips that firing rather than catching up.

use crate::broadcast::Broadcaster;
use crate::model::{CheckResult, CheckResultEvent, NewCheckResult, Status, Target};
use crate::notify::{Notifier, TransitionEvent};
use crate::probe::Prober;
use crate::store::{ChannelRegistry, TargetRegistry};
use chrono::Utc;
use dashmap::DashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

/// Marks a target in flight for as long as it lives.
struct InFlightGuard {
    set: Arc<DashSet<u64>>,
    target_id: u64,
}

impl InFlightGuard {
    /// `None` when the target already has a check running.
    fn acquire(set: &Arc<DashSet<u64>>, target_id: u64) -> Option<Self> {
        set.insert(target_id).then(|| Self {
            set: set.clone(),
            target_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.target_id);
    }
}

pub fn is_due(target: &Target, now_epoch_secs: u64) -> bool {
    target.interval_sec > 0 && now_epoch_secs % target.interval_sec == 0
}

/// The newest result when the two most recent results differ in status.
/// Fewer than two results is never a transition.
pub fn detect_transition(newest_first: &[CheckResult]) -> Option<&CheckResult> {
    match newest_first {
        [latest, previous] if latest.status != previous.status => Some(latest),
        _ => None,
    }
}

#[derive(Clone)]
pub struct Scheduler {
    targets: Arc<dyn TargetRegistry>,
    channels: Arc<dyn ChannelRegistry>,
    prober: Arc<dyn Prober>,
    notifier: Arc<dyn Notifier>,
    broadcaster: Arc<dyn Broadcaster>,
    in_flight: Arc<DashSet<u64>>,
}

impl Scheduler {
    pub fn new(
        targets: Arc<dyn TargetRegistry>,
        channels: Arc<dyn ChannelRegistry>,
        prober: Arc<dyn Prober>,
        notifier: Arc<dyn Notifier>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            targets,
            channels,
            prober,
            notifier,
            broadcaster,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    pub fn in_flight(&self, target_id: u64) -> bool {
        self.in_flight.contains(&target_id)
    }

    /// Ticks once a second forever.
    pub async fn run(self) {
        tracing::info!("Starting health check scheduler...");
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = Utc::now().timestamp().max(0) as u64;
            self.tick_at(now).await;
        }
    }

    /// Launches checks for every enabled target due at `now_epoch_secs` and
    /// returns their handles without waiting on them.
    pub async fn tick_at(&self, now_epoch_secs: u64) -> Vec<JoinHandle<()>> {
        let targets = match self.targets.list_enabled().await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::error!("Scheduler error: {}", e);
                return Vec::new();
            }
        };

        let mut launched = Vec::new();
        for target in targets {
            if !is_due(&target, now_epoch_secs) {
                continue;
            }
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, target.id) else {
                tracing::debug!("Check for {} still running, skipping", target.name);
                continue;
            };
            let scheduler = self.clone();
            launched.push(tokio::spawn(async move {
                let _guard = guard;
                scheduler.run_check(target).await;
            }));
        }
        launched
    }

    /// Probe, persist, broadcast, then notify on a status change.
    pub async fn run_check(&self, target: Target) {
        let outcome = self.prober.run(&target).await;
        let status = Status::from_ok(outcome.ok);
        tracing::debug!(
            target_id = target.id,
            latency_ms = outcome.latency_ms,
            "{} {} -> {} ({})",
            target.kind.as_str(),
            target.endpoint,
            status.as_str(),
            outcome.message
        );

        let result = NewCheckResult::new(
            target.id,
            status,
            outcome.latency_ms,
            outcome.code,
            &outcome.message,
        );
        let stored = match self.targets.append_result(result).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(target_id = target.id, "Failed to store check result: {}", e);
                return;
            }
        };

        self.broadcaster.publish(&CheckResultEvent::new(&target, &stored));

        let recent = match self.targets.last_results(target.id, 2).await {
            Ok(recent) => recent,
            Err(e) => {
                tracing::error!(target_id = target.id, "Failed to read recent results: {}", e);
                return;
            }
        };
        let Some(latest) = detect_transition(&recent) else {
            return;
        };

        tracing::info!("State changed for {}: now {}", target.name, latest.status.as_str());
        let event = TransitionEvent::new(&target, latest);

        if let Some(to) = &target.alert_email {
            self.notifier.send_alert_email(to, &event).await;
        }

        // Read fresh so enable/disable takes effect on the next transition.
        match self.channels.list_enabled().await {
            Ok(channels) => self.notifier.notify(&event, &channels).await,
            Err(e) => tracing::error!("Failed to load notification channels: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LiveBroadcaster;
    use crate::config::AppConfig;
    use crate::model::{ChannelInput, ChannelKind, CheckKind, NotificationChannel, TargetInput};
    use crate::probe::ProbeOutcome;
    use crate::store::{Store, StoreError};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    // 1_700_000_040 is a multiple of 60 (and of 10).
    const T: u64 = 1_700_000_040;

    struct ScriptedProber {
        outcomes: Mutex<VecDeque<bool>>,
        calls: AtomicUsize,
    }

    impl ScriptedProber {
        fn new(outcomes: &[bool]) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Prober for ScriptedProber {
        async fn run(&self, _target: &Target) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
            ProbeOutcome {
                ok,
                latency_ms: 5,
                code: if ok { 200 } else { 500 },
                message: if ok { "OK".into() } else { "Internal Server Error".into() },
            }
        }
    }

    /// Holds every probe until the test releases it.
    struct GatedProber {
        gate: Semaphore,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Prober for GatedProber {
        async fn run(&self, _target: &Target) -> ProbeOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.unwrap();
            self.active.fetch_sub(1, Ordering::SeqCst);
            ProbeOutcome { ok: true, latency_ms: 1, code: 1, message: "connected".into() }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(TransitionEvent, usize)>>,
        emails: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &TransitionEvent, channels: &[NotificationChannel]) {
            self.events.lock().unwrap().push((event.clone(), channels.len()));
        }

        async fn send_alert_email(&self, to: &str, _event: &TransitionEvent) {
            self.emails.lock().unwrap().push(to.to_string());
        }
    }

    struct BrokenRegistry;

    #[async_trait::async_trait]
    impl TargetRegistry for BrokenRegistry {
        async fn list_enabled(&self) -> Result<Vec<Target>, StoreError> {
            Err(StoreError::Persistence(anyhow::anyhow!("disk on fire")))
        }
        async fn last_results(&self, _: u64, _: usize) -> Result<Vec<CheckResult>, StoreError> {
            Ok(Vec::new())
        }
        async fn append_result(&self, r: NewCheckResult) -> Result<CheckResult, StoreError> {
            Err(StoreError::TargetNotFound(r.target_id))
        }
    }

    fn http_target(interval_sec: u64) -> TargetInput {
        TargetInput {
            name: "api".into(),
            kind: CheckKind::Http,
            endpoint: "http://127.0.0.1:9/health".into(),
            interval_sec,
            timeout_ms: 1000,
            expected_code: None,
            alert_email: Some("oncall@example.com".into()),
            enabled: true,
        }
    }

    fn scheduler(
        store: &Arc<Store>,
        prober: Arc<dyn Prober>,
        notifier: &Arc<RecordingNotifier>,
        live: &LiveBroadcaster,
    ) -> Scheduler {
        Scheduler::new(
            store.clone(),
            store.clone(),
            prober,
            notifier.clone(),
            Arc::new(live.clone()),
        )
    }

    fn result(id: u64, status: Status) -> CheckResult {
        CheckResult {
            id,
            target_id: 1,
            status,
            latency_ms: 1,
            code: 0,
            message: String::new(),
            created_at: Utc::now(),
        }
    }

    async fn join(handles: Vec<JoinHandle<()>>) -> usize {
        let n = handles.len();
        for h in handles {
            h.await.unwrap();
        }
        n
    }

    #[test]
    fn transition_needs_two_differing_results() {
        assert!(detect_transition(&[]).is_none());
        assert!(detect_transition(&[result(1, Status::Down)]).is_none());
        assert!(detect_transition(&[result(2, Status::Down), result(1, Status::Down)]).is_none());
        assert!(detect_transition(&[result(2, Status::Up), result(1, Status::Up)]).is_none());

        let down = [result(2, Status::Down), result(1, Status::Up)];
        assert_eq!(detect_transition(&down).map(|r| r.id), Some(2));
        let up = [result(2, Status::Up), result(1, Status::Down)];
        assert_eq!(detect_transition(&up).map(|r| r.status), Some(Status::Up));
    }

    #[tokio::test]
    async fn fires_only_on_interval_boundaries() {
        let store = Arc::new(Store::in_memory(AppConfig::default()));
        store.create_target(http_target(60)).await.unwrap();
        let prober = Arc::new(ScriptedProber::new(&[]));
        let notifier = Arc::new(RecordingNotifier::default());
        let sched = scheduler(&store, prober.clone(), &notifier, &LiveBroadcaster::new(16));

        assert_eq!(join(sched.tick_at(T).await).await, 1);
        for now in T + 1..T + 60 {
            assert_eq!(join(sched.tick_at(now).await).await, 0, "fired at T+{}", now - T);
        }
        assert_eq!(join(sched.tick_at(T + 60).await).await, 1);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn never_two_checks_for_one_target() {
        let store = Arc::new(Store::in_memory(AppConfig::default()));
        let target = store.create_target(http_target(10)).await.unwrap();
        let prober = Arc::new(GatedProber {
            gate: Semaphore::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let sched = scheduler(&store, prober.clone(), &notifier, &LiveBroadcaster::new(16));

        let first = sched.tick_at(T).await;
        assert_eq!(first.len(), 1);
        assert!(sched.in_flight(target.id));

        // Due again while the first probe is still blocked.
        assert!(sched.tick_at(T + 10).await.is_empty());

        prober.gate.add_permits(1);
        join(first).await;
        assert!(!sched.in_flight(target.id));

        let third = sched.tick_at(T + 20).await;
        assert_eq!(third.len(), 1);
        prober.gate.add_permits(1);
        join(third).await;

        assert_eq!(prober.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(store.results_for(target.id, 10).len(), 2);
    }

    #[tokio::test]
    async fn late_result_for_deleted_target_is_dropped() {
        let store = Arc::new(Store::in_memory(AppConfig::default()));
        let old = store.create_target(http_target(10)).await.unwrap();
        let prober = Arc::new(GatedProber {
            gate: Semaphore::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let live = LiveBroadcaster::new(16);
        let mut rx = live.subscribe();
        let sched = scheduler(&store, prober.clone(), &notifier, &live);

        let pending = sched.tick_at(T).await;
        assert_eq!(pending.len(), 1);
        while prober.active.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }

        store.delete_target(old.id).await.unwrap();
        let mut input = http_target(60);
        input.name = "brand-new".into();
        let fresh = store.create_target(input).await.unwrap();
        assert_ne!(fresh.id, old.id);

        prober.gate.add_permits(1);
        join(pending).await;
        assert!(store.results_for(old.id, 10).is_empty());
        assert!(store.results_for(fresh.id, 10).is_empty());
        assert!(rx.try_recv().is_err());

        let first = Scheduler::new(
            store.clone(),
            store.clone(),
            Arc::new(ScriptedProber::new(&[false])),
            notifier.clone(),
            Arc::new(live.clone()),
        );
        first.run_check(fresh.clone()).await;
        assert_eq!(store.results_for(fresh.id, 10).len(), 1);
        assert!(notifier.events.lock().unwrap().is_empty());
        assert!(notifier.emails.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn different_targets_run_side_by_side() {
        let store = Arc::new(Store::in_memory(AppConfig::default()));
        store.create_target(http_target(10)).await.unwrap();
        store.create_target(http_target(20)).await.unwrap();
        let prober = Arc::new(GatedProber {
            gate: Semaphore::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let sched = scheduler(&store, prober.clone(), &notifier, &LiveBroadcaster::new(16));

        let handles = sched.tick_at(T).await;
        assert_eq!(handles.len(), 2);
        while prober.active.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        prober.gate.add_permits(2);
        join(handles).await;
    }

    #[tokio::test]
    async fn notifies_once_per_transition() {
        let store = Arc::new(Store::in_memory(AppConfig::default()));
        let target = store.create_target(http_target(60)).await.unwrap();
        store
            .create_channel(ChannelInput {
                name: "ops".into(),
                kind: ChannelKind::Webhook,
                enabled: true,
                config: r#"{"url":"http://127.0.0.1:9/hook"}"#.into(),
            })
            .await
            .unwrap();
        let prober = Arc::new(ScriptedProber::new(&[false, false, true, true, false]));
        let notifier = Arc::new(RecordingNotifier::default());
        let live = LiveBroadcaster::new(16);
        let mut rx = live.subscribe();
        let sched = scheduler(&store, prober, &notifier, &live);

        for _ in 0..5 {
            sched.run_check(target.clone()).await;
        }

        let events = notifier.events.lock().unwrap().clone();
        let statuses: Vec<Status> = events.iter().map(|(e, _)| e.status).collect();
        assert_eq!(statuses, vec![Status::Up, Status::Down]);
        assert!(events.iter().all(|(_, channels)| *channels == 1));
        assert_eq!(events[1].0.message.as_deref(), Some("Internal Server Error"));
        assert_eq!(events[0].0.message, None);
        assert_eq!(notifier.emails.lock().unwrap().len(), 2);

        // Every check is broadcast, transition or not.
        for _ in 0..5 {
            rx.try_recv().unwrap();
        }
    }

    #[tokio::test]
    async fn first_check_down_is_silent() {
        let store = Arc::new(Store::in_memory(AppConfig::default()));
        let target = store.create_target(http_target(60)).await.unwrap();
        let prober = Arc::new(ScriptedProber::new(&[false]));
        let notifier = Arc::new(RecordingNotifier::default());
        let sched = scheduler(&store, prober, &notifier, &LiveBroadcaster::new(16));

        sched.run_check(target.clone()).await;
        assert_eq!(store.results_for(target.id, 5).len(), 1);
        assert!(notifier.events.lock().unwrap().is_empty());
        assert!(notifier.emails.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn registry_failures_are_contained() {
        let registry = Arc::new(BrokenRegistry);
        let store = Arc::new(Store::in_memory(AppConfig::default()));
        let notifier = Arc::new(RecordingNotifier::default());
        let live = LiveBroadcaster::new(16);
        let mut rx = live.subscribe();
        let sched = Scheduler::new(
            registry,
            store.clone(),
            Arc::new(ScriptedProber::new(&[false])),
            notifier.clone(),
            Arc::new(live.clone()),
        );

        assert!(sched.tick_at(T).await.is_empty());

        // Unstored results are neither broadcast nor alerted on.
        let target = http_target(60).into_target(42, Utc::now());
        sched.run_check(target).await;
        assert!(rx.try_recv().is_err());
        assert!(notifier.events.lock().unwrap().is_empty());
    }
}
