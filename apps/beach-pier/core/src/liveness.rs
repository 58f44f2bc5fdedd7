use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::engine::{Detached, Engine};
use crate::protocol::{ServerMessage, SessionId};

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub sweep_interval: Duration,
    /// Heartbeat age after which a session counts as dead; `None` trusts the transport alone.
    pub stale_after: Option<Duration>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_after: Some(Duration::from_secs(120)),
        }
    }
}

/// Point-in-time view of one session handed to a [`LivenessProbe`].
#[derive(Debug, Clone)]
pub struct Heartbeat {
    id: SessionId,
    last_liveness: Instant,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl Heartbeat {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn last_liveness(&self) -> Instant {
        self.last_liveness
    }

    pub fn transport_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Decides whether a session's transport is still there.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, heartbeat: &Heartbeat, now: Instant) -> bool;
}

impl<F> LivenessProbe for F
where
    F: Fn(&Heartbeat, Instant) -> bool + Send + Sync,
{
    fn is_alive(&self, heartbeat: &Heartbeat, now: Instant) -> bool {
        self(heartbeat, now)
    }
}

/// Treats a closed outbound channel, or a heartbeat older than `stale_after`, as dead.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportProbe {
    pub stale_after: Option<Duration>,
}

impl LivenessProbe for TransportProbe {
    fn is_alive(&self, heartbeat: &Heartbeat, now: Instant) -> bool {
        if !heartbeat.transport_open() {
            return false;
        }
        match self.stale_after {
            Some(limit) => now.saturating_duration_since(heartbeat.last_liveness) <= limit,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub waiting_evicted: usize,
    pub links_dissolved: usize,
    pub idle_evicted: usize,
}

impl SweepReport {
    pub fn evicted(&self) -> usize {
        self.waiting_evicted + self.links_dissolved + self.idle_evicted
    }
}

impl Engine {
    /// Evicts every session `probe` reports dead, cascading the same cleanup
    /// as an explicit disconnect. Evicted sessions lose their outbound channel,
    /// so a connection that is still open gets closed by its writer.
    ///
    /// Probing runs without the lock. Each verdict is re-checked against the
    /// session's heartbeat under the lock before anything is removed, so a
    /// session that showed signs of life mid-sweep survives.
    pub fn sweep<P>(&self, probe: &P, now: Instant) -> SweepReport
    where
        P: LivenessProbe + ?Sized,
    {
        let heartbeats: Vec<Heartbeat> = {
            let state = self.lock();
            state
                .registry
                .iter()
                .map(|session| Heartbeat {
                    id: session.id(),
                    last_liveness: session.last_liveness(),
                    outbound: session.outbound().clone(),
                })
                .collect()
        };

        let mut report = SweepReport {
            scanned: heartbeats.len(),
            ..SweepReport::default()
        };
        let dead: Vec<Heartbeat> = heartbeats
            .into_iter()
            .filter(|heartbeat| !probe.is_alive(heartbeat, now))
            .collect();
        if dead.is_empty() {
            return report;
        }

        let mut state = self.lock();
        let mut queue_shrunk = false;
        for heartbeat in &dead {
            let unchanged = state
                .registry
                .get(heartbeat.id)
                .is_some_and(|session| session.last_liveness() == heartbeat.last_liveness);
            if !unchanged {
                continue;
            }
            match state.detach(heartbeat.id) {
                Detached::Unlinked(partner) => {
                    report.links_dissolved += 1;
                    info!(session_id = %heartbeat.id, partner_id = %partner, "evicting dead paired session");
                }
                Detached::LeftQueue => {
                    report.waiting_evicted += 1;
                    queue_shrunk = true;
                    info!(session_id = %heartbeat.id, "evicting dead waiting session");
                }
                Detached::Idle => {
                    report.idle_evicted += 1;
                    debug!(session_id = %heartbeat.id, "evicting dead idle session");
                }
            }
            state.discard(heartbeat.id);
        }
        if queue_shrunk {
            state.broadcast_positions();
        }
        drop(state);

        counter!("beach_pier_sweep_evictions_total", report.waiting_evicted as u64, "state" => "waiting");
        counter!("beach_pier_sweep_evictions_total", report.links_dissolved as u64, "state" => "paired");
        counter!("beach_pier_sweep_evictions_total", report.idle_evicted as u64, "state" => "idle");
        counter!("beach_pier_links_dissolved_total", report.links_dissolved as u64, "reason" => "eviction");
        report
    }

    /// Runs [`Engine::sweep`] with a [`TransportProbe`] on a fixed interval.
    pub fn spawn_liveness_monitor(&self, config: LivenessConfig) -> JoinHandle<()> {
        let engine = self.clone();
        let probe = TransportProbe {
            stale_after: config.stale_after,
        };
        let mut interval = tokio::time::interval(config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let report = engine.sweep(&probe, Instant::now());
                if report.evicted() > 0 {
                    info!(
                        scanned = report.scanned,
                        waiting = report.waiting_evicted,
                        paired = report.links_dissolved,
                        idle = report.idle_evicted,
                        "liveness sweep evicted sessions"
                    );
                } else {
                    debug!(scanned = report.scanned, "liveness sweep found nothing to evict");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionState;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test_timeout::timeout]
    fn sweep_dissolves_links_with_a_silent_member() {
        let engine = Engine::new();
        let (a, mut rx_a) = engine.connect();
        let (b, _rx_b) = engine.connect();
        engine.request_pairing(a);
        engine.request_pairing(b);
        drain(&mut rx_a);

        let b_is_dead = move |heartbeat: &Heartbeat, _now: Instant| heartbeat.id() != b;
        let report = engine.sweep(&b_is_dead, Instant::now());

        assert_eq!(report.links_dissolved, 1);
        assert_eq!(drain(&mut rx_a), vec![ServerMessage::PartnerGone]);
        assert!(engine.get(b).is_none());
        assert_eq!(engine.get(a).unwrap().state(), &SessionState::Idle);
        engine.assert_invariants();
    }

    #[test_timeout::timeout]
    fn sweep_prunes_dead_waiters_and_renumbers_the_rest() {
        let engine = Engine::new();
        let (a, rx_a) = engine.connect();
        let (b, mut rx_b) = engine.connect();
        let (c, mut rx_c) = engine.connect();
        engine.seed_queue(&[a, b, c]);
        drain(&mut rx_b);
        drain(&mut rx_c);
        drop(rx_a);

        let report = engine.sweep(&TransportProbe::default(), Instant::now());

        assert_eq!(report.waiting_evicted, 1);
        assert!(engine.get(a).is_none());
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::QueueUpdate {
                position: 1,
                total: 2
            }]
        );
        assert_eq!(
            drain(&mut rx_c),
            vec![ServerMessage::QueueUpdate {
                position: 2,
                total: 2
            }]
        );
        engine.assert_invariants();
    }

    #[test_timeout::timeout]
    fn both_members_dead_counts_one_link() {
        let engine = Engine::new();
        let (a, rx_a) = engine.connect();
        let (b, rx_b) = engine.connect();
        engine.request_pairing(a);
        engine.request_pairing(b);
        drop(rx_a);
        drop(rx_b);

        let report = engine.sweep(&TransportProbe::default(), Instant::now());
        assert_eq!(report.links_dissolved, 1);
        assert_eq!(report.idle_evicted, 1);
        assert_eq!(engine.stats().sessions, 0);
    }

    #[test_timeout::timeout]
    fn healthy_sessions_survive_a_sweep() {
        let engine = Engine::new();
        let (a, mut rx_a) = engine.connect();
        let (b, _rx_b) = engine.connect();
        let (_c, _rx_c) = engine.connect();
        engine.request_pairing(a);
        engine.request_pairing(b);
        drain(&mut rx_a);

        let report = engine.sweep(&TransportProbe::default(), Instant::now());
        assert_eq!(report.evicted(), 0);
        assert_eq!(report.scanned, 3);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(engine.get(a).unwrap().partner(), Some(b));
    }

    #[test_timeout::timeout]
    fn stale_heartbeats_only_evict_when_a_threshold_is_set() {
        let engine = Engine::new();
        let (quiet, _rx_quiet) = engine.connect();
        let (chatty, _rx_chatty) = engine.connect();
        let later = Instant::now() + Duration::from_secs(121);

        let trusting = TransportProbe { stale_after: None };
        assert_eq!(engine.sweep(&trusting, later).evicted(), 0);

        engine.touch(chatty);
        let probe = TransportProbe {
            stale_after: Some(Duration::from_secs(120)),
        };
        let chatty_seen = engine.get(chatty).unwrap().last_liveness();
        let report = engine.sweep(&probe, chatty_seen + Duration::from_secs(119));
        assert_eq!(report.evicted(), 0);

        let report = engine.sweep(&probe, later + Duration::from_secs(1));
        assert_eq!(report.idle_evicted, 2);
        assert!(engine.get(quiet).is_none());
    }

    #[test_timeout::timeout]
    fn evicting_a_stale_but_open_session_closes_its_channel() {
        let engine = Engine::new();
        let (quiet, mut rx_quiet) = engine.connect();
        drain(&mut rx_quiet);
        let stale_check = TransportProbe {
            stale_after: Some(Duration::from_secs(120)),
        };

        let report = engine.sweep(&stale_check, Instant::now() + Duration::from_secs(121));
        assert_eq!(report.idle_evicted, 1);
        assert!(engine.get(quiet).is_none());
        assert_eq!(engine.stats().sessions_removed, 1);
        assert_eq!(
            rx_quiet.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test_timeout::timeout]
    fn touched_sessions_are_spared_mid_sweep() {
        let engine = Engine::new();
        let (a, _rx_a) = engine.connect();
        std::thread::sleep(Duration::from_millis(5));

        let toucher = engine.clone();
        let touch_then_condemn = move |heartbeat: &Heartbeat, _now: Instant| {
            toucher.touch(heartbeat.id());
            false
        };
        let report = engine.sweep(&touch_then_condemn, Instant::now());
        assert_eq!(report.evicted(), 0);
        assert!(engine.get(a).is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn monitor_task_evicts_on_its_interval() {
        let engine = Engine::new();
        let (a, mut rx_a) = engine.connect();
        let (b, rx_b) = engine.connect();
        engine.request_pairing(a);
        engine.request_pairing(b);
        drain(&mut rx_a);
        drop(rx_b);

        let monitor = engine.spawn_liveness_monitor(LivenessConfig {
            sweep_interval: Duration::from_millis(20),
            stale_after: None,
        });
        let notice = tokio::time::timeout(Duration::from_secs(5), rx_a.recv())
            .await
            .unwrap();
        monitor.abort();

        assert_eq!(notice, Some(ServerMessage::PartnerGone));
        assert!(engine.get(b).is_none());
        engine.assert_invariants();
    }
}
