//! Barrier state machine
//!
//! Pure: consumes decoded messages and returns the messages to broadcast.
//! The gatherer drives it from its owning thread only.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::{BarrierConfig, LateJoinPolicy, ReadinessCondition};
use crate::messages::{BarrierMessage, ReplayPhase};
use crate::whitelist::AgentWhitelist;

/// What the gatherer knows about one participant this round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParticipantStatus {
    /// Sent `identify`; kept across rounds for whitelisted participants
    pub identified: bool,
    pub ready: bool,
    /// Was sent `go`, by broadcast or replay
    pub notified: bool,
}

/// Barrier counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BarrierStats {
    /// Completed rounds
    pub round: u64,
    pub go_emitted: u64,
    pub stop_emitted: u64,
    pub ready_emitted: u64,
    pub duplicate_reports: u64,
    pub late_joiners: u64,
    pub unhandled: u64,
    pub ready_participants: usize,
}

#[derive(Debug, Clone)]
pub struct Barrier {
    condition: ReadinessCondition,
    whitelist: AgentWhitelist,
    late_join: LateJoinPolicy,
    producer_ready: bool,
    go_sent: bool,
    participants: BTreeMap<String, ParticipantStatus>,
    stats: BarrierStats,
}

impl Barrier {
    pub fn new(config: &BarrierConfig) -> Self {
        let condition = config.readiness();
        let whitelist = match &condition {
            ReadinessCondition::Whitelist(agents) => AgentWhitelist::new(agents.iter().cloned()),
            _ => AgentWhitelist::default(),
        };
        debug!(?condition, late_join = ?config.late_join, "Barrier::new: called");
        Self {
            condition,
            whitelist,
            late_join: config.late_join,
            producer_ready: false,
            go_sent: false,
            participants: BTreeMap::new(),
            stats: BarrierStats::default(),
        }
    }

    /// Apply one inbound message and return what to broadcast
    pub fn handle(&mut self, message: &BarrierMessage) -> Vec<BarrierMessage> {
        match message {
            BarrierMessage::ProducerReady => self.on_producer_ready(),
            BarrierMessage::ParticipantReady { id } => self.on_participant_ready(id),
            BarrierMessage::Identify { id } => self.on_identify(id),
            BarrierMessage::ProducerCompleted => self.on_producer_completed(),
            BarrierMessage::Ready | BarrierMessage::Go | BarrierMessage::Stop | BarrierMessage::Replay { .. } => {
                // our own broadcasts come back through the `*` binding
                Vec::new()
            }
        }
    }

    /// Count a body that could not be decoded
    pub fn record_unhandled(&mut self) {
        self.stats.unhandled += 1;
    }

    pub fn participants_ready(&self) -> bool {
        match &self.condition {
            ReadinessCondition::Whitelist(_) => self.whitelist.all_reported(),
            ReadinessCondition::FirstN(n) => self.whitelist.reported_count() >= *n,
            ReadinessCondition::Unconditional => true,
        }
    }

    pub fn producer_ready(&self) -> bool {
        self.producer_ready
    }

    pub fn go_sent(&self) -> bool {
        self.go_sent
    }

    pub fn participant(&self, id: &str) -> Option<ParticipantStatus> {
        self.participants.get(id).copied()
    }

    pub fn stats(&self) -> BarrierStats {
        BarrierStats {
            ready_participants: self.whitelist.reported_count(),
            ..self.stats.clone()
        }
    }

    fn on_producer_ready(&mut self) -> Vec<BarrierMessage> {
        if self.go_sent {
            debug!("Barrier: producer-ready after go in the same round, ignoring");
            return Vec::new();
        }
        self.producer_ready = true;
        if self.participants_ready() {
            vec![self.open()]
        } else {
            info!(missing = ?self.whitelist.missing(), "Producer ready, waiting on participants");
            self.stats.ready_emitted += 1;
            vec![BarrierMessage::Ready]
        }
    }

    fn on_participant_ready(&mut self, id: &str) -> Vec<BarrierMessage> {
        if !self.whitelist.add_reported(id) {
            self.stats.duplicate_reports += 1;
            return Vec::new();
        }
        self.participants.entry(id.to_string()).or_default().ready = true;
        info!(%id, reported = self.whitelist.reported_count(), "Participant ready");

        if self.go_sent {
            self.stats.late_joiners += 1;
            return match self.late_join {
                LateJoinPolicy::Replay => {
                    debug!(%id, "Barrier: replaying go to late participant");
                    if let Some(status) = self.participants.get_mut(id) {
                        status.notified = true;
                    }
                    vec![BarrierMessage::Replay {
                        id: id.to_string(),
                        phase: ReplayPhase::Go,
                    }]
                }
                LateJoinPolicy::Ignore => {
                    warn!(%id, "Participant reported after go; it will wait for the next round");
                    Vec::new()
                }
            };
        }

        if self.producer_ready && self.participants_ready() {
            vec![self.open()]
        } else {
            Vec::new()
        }
    }

    fn on_identify(&mut self, id: &str) -> Vec<BarrierMessage> {
        self.participants.entry(id.to_string()).or_default().identified = true;
        debug!(%id, "Barrier: participant identified");
        if !self.producer_ready || self.whitelist.has_reported(id) {
            return Vec::new();
        }
        match self.late_join {
            LateJoinPolicy::Replay => vec![BarrierMessage::Replay {
                id: id.to_string(),
                phase: ReplayPhase::Ready,
            }],
            LateJoinPolicy::Ignore => {
                warn!(%id, "Participant identified after ready; it will wait for the next round");
                Vec::new()
            }
        }
    }

    fn on_producer_completed(&mut self) -> Vec<BarrierMessage> {
        self.producer_ready = false;
        self.go_sent = false;
        self.whitelist.reset_reported();
        // monitors stop consuming on `stop`, so only whitelisted entries carry over
        let whitelist = &self.whitelist;
        self.participants.retain(|id, _| whitelist.is_necessary(id));
        for status in self.participants.values_mut() {
            status.ready = false;
            status.notified = false;
        }
        self.stats.round += 1;
        self.stats.stop_emitted += 1;
        info!(round = self.stats.round, "Producer completed, sending stop");
        vec![BarrierMessage::Stop]
    }

    fn open(&mut self) -> BarrierMessage {
        self.go_sent = true;
        for status in self.participants.values_mut() {
            status.notified = true;
        }
        self.stats.go_emitted += 1;
        info!(round = self.stats.round, "Barrier open, sending go");
        BarrierMessage::Go
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ready(id: &str) -> BarrierMessage {
        BarrierMessage::ParticipantReady { id: id.to_string() }
    }

    fn whitelisted(agents: &[&str]) -> Barrier {
        Barrier::new(&BarrierConfig::with_agents(agents.iter().copied()))
    }

    #[test]
    fn test_ordered_reports_emit_one_go() {
        let mut barrier = whitelisted(&["agent1", "agent2"]);
        assert_eq!(barrier.handle(&BarrierMessage::ProducerReady), vec![BarrierMessage::Ready]);
        assert!(barrier.handle(&ready("agent1")).is_empty());
        assert_eq!(barrier.handle(&ready("agent2")), vec![BarrierMessage::Go]);
        assert_eq!(barrier.stats().go_emitted, 1);
    }

    #[test]
    fn test_duplicate_report_does_not_open_barrier() {
        let mut barrier = whitelisted(&["agent1", "agent2"]);
        assert!(barrier.handle(&ready("agent1")).is_empty());
        assert!(barrier.handle(&ready("agent1")).is_empty());
        assert_eq!(barrier.handle(&BarrierMessage::ProducerReady), vec![BarrierMessage::Ready]);
        assert!(!barrier.go_sent());
        assert_eq!(barrier.handle(&ready("agent2")), vec![BarrierMessage::Go]);

        let stats = barrier.stats();
        assert_eq!(stats.duplicate_reports, 1);
        assert_eq!(stats.ready_participants, 2);
    }

    #[test]
    fn test_producer_ready_opens_immediately_when_satisfied() {
        let mut barrier = whitelisted(&["agent1"]);
        barrier.handle(&BarrierMessage::Identify { id: "agent1".to_string() });
        barrier.handle(&ready("agent1"));
        assert_eq!(barrier.handle(&BarrierMessage::ProducerReady), vec![BarrierMessage::Go]);
        assert_eq!(barrier.participant("agent1").map(|p| p.notified), Some(true));
    }

    #[test]
    fn test_unconditional_barrier_opens_on_producer() {
        let mut barrier = Barrier::new(&BarrierConfig::default());
        assert_eq!(barrier.handle(&BarrierMessage::ProducerReady), vec![BarrierMessage::Go]);
    }

    #[test]
    fn test_first_n_counts_distinct_participants() {
        let config = BarrierConfig {
            required_count: Some(2),
            ..BarrierConfig::default()
        };
        let mut barrier = Barrier::new(&config);
        barrier.handle(&BarrierMessage::ProducerReady);
        assert!(barrier.handle(&ready("x")).is_empty());
        assert!(barrier.handle(&ready("x")).is_empty());
        assert_eq!(barrier.handle(&ready("y")), vec![BarrierMessage::Go]);
    }

    #[test]
    fn test_extra_participant_does_not_replace_whitelisted_one() {
        let mut barrier = whitelisted(&["agent1"]);
        barrier.handle(&BarrierMessage::ProducerReady);
        assert!(barrier.handle(&ready("stranger")).is_empty());
        assert_eq!(barrier.handle(&ready("agent1")), vec![BarrierMessage::Go]);
    }

    #[test]
    fn test_completion_always_stops_and_starts_new_round() {
        let mut barrier = whitelisted(&["agent1"]);
        assert_eq!(barrier.handle(&BarrierMessage::ProducerCompleted), vec![BarrierMessage::Stop]);

        barrier.handle(&BarrierMessage::ProducerReady);
        barrier.handle(&ready("agent1"));
        assert_eq!(barrier.handle(&BarrierMessage::ProducerCompleted), vec![BarrierMessage::Stop]);
        assert!(!barrier.producer_ready());
        assert!(!barrier.go_sent());

        // readiness from the previous round does not carry over
        assert_eq!(barrier.handle(&BarrierMessage::ProducerReady), vec![BarrierMessage::Ready]);
        assert_eq!(barrier.stats().round, 2);
    }

    #[test]
    fn test_late_participant_gets_directed_replay() {
        let mut barrier = whitelisted(&["agent1"]);
        barrier.handle(&ready("agent1"));
        barrier.handle(&BarrierMessage::ProducerReady);

        let identify = barrier.handle(&BarrierMessage::Identify { id: "late".to_string() });
        assert_eq!(
            identify,
            vec![BarrierMessage::Replay {
                id: "late".to_string(),
                phase: ReplayPhase::Ready
            }]
        );
        assert_eq!(
            barrier.handle(&ready("late")),
            vec![BarrierMessage::Replay {
                id: "late".to_string(),
                phase: ReplayPhase::Go
            }]
        );
        let stats = barrier.stats();
        assert_eq!(stats.go_emitted, 1);
        assert_eq!(stats.late_joiners, 1);
    }

    #[test]
    fn test_late_participant_ignored_by_policy() {
        let config = BarrierConfig {
            late_join: LateJoinPolicy::Ignore,
            ..BarrierConfig::default()
        };
        let mut barrier = Barrier::new(&config);
        barrier.handle(&BarrierMessage::ProducerReady);
        assert!(barrier.handle(&BarrierMessage::Identify { id: "late".to_string() }).is_empty());
        assert!(barrier.handle(&ready("late")).is_empty());
    }

    #[test]
    fn test_completion_forgets_participants_outside_whitelist() {
        let mut barrier = whitelisted(&["agent1"]);
        barrier.handle(&BarrierMessage::Identify { id: "agent1".to_string() });
        barrier.handle(&BarrierMessage::Identify { id: "monitor-1a2b3c4d".to_string() });
        barrier.handle(&BarrierMessage::ProducerReady);
        barrier.handle(&ready("monitor-1a2b3c4d"));
        barrier.handle(&ready("agent1"));

        barrier.handle(&BarrierMessage::ProducerCompleted);

        assert!(barrier.participant("monitor-1a2b3c4d").is_none());
        let kept = barrier.participant("agent1").unwrap();
        assert!(kept.identified);
        assert!(!kept.ready);
        assert!(!kept.notified);
    }

    #[test]
    fn test_repeated_producer_ready_after_go_is_ignored() {
        let mut barrier = Barrier::new(&BarrierConfig::default());
        assert_eq!(barrier.handle(&BarrierMessage::ProducerReady), vec![BarrierMessage::Go]);
        assert!(barrier.handle(&BarrierMessage::ProducerReady).is_empty());
        assert_eq!(barrier.stats().go_emitted, 1);
    }

    #[test]
    fn test_own_broadcasts_are_ignored() {
        let mut barrier = whitelisted(&["agent1"]);
        for echo in [BarrierMessage::Ready, BarrierMessage::Go, BarrierMessage::Stop] {
            assert!(barrier.handle(&echo).is_empty());
        }
        assert!(!barrier.producer_ready());
    }

    fn event() -> impl Strategy<Value = BarrierMessage> {
        prop_oneof![
            Just(BarrierMessage::ProducerReady),
            Just(BarrierMessage::ProducerCompleted),
            (0..4u8).prop_map(|i| BarrierMessage::ParticipantReady { id: format!("agent{i}") }),
            (0..4u8).prop_map(|i| BarrierMessage::Identify { id: format!("agent{i}") }),
        ]
    }

    proptest! {
        #[test]
        fn prop_go_at_most_once_per_round(
            events in prop::collection::vec(event(), 0..60),
            whitelist_size in 0..4usize,
        ) {
            let agents: Vec<String> = (0..whitelist_size).map(|i| format!("agent{i}")).collect();
            let mut barrier = Barrier::new(&BarrierConfig::with_agents(agents));
            let mut go_this_round = 0;
            let mut completions = 0;
            let mut stops = 0;

            for event in &events {
                let out = barrier.handle(event);
                if *event == BarrierMessage::ProducerCompleted {
                    completions += 1;
                    go_this_round = 0;
                }
                for msg in &out {
                    match msg {
                        BarrierMessage::Go => {
                            go_this_round += 1;
                            prop_assert!(barrier.producer_ready());
                            prop_assert!(barrier.participants_ready());
                        }
                        BarrierMessage::Stop => stops += 1,
                        _ => {}
                    }
                }
                prop_assert!(go_this_round <= 1);
                prop_assert!(barrier.stats().ready_participants <= 4);
            }
            prop_assert_eq!(stops, completions);
        }
    }
}
