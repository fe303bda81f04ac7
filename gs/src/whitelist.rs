//! Checklist of agents that must report before the barrier opens

use std::collections::BTreeSet;

use tracing::debug;

/// Agents that must report, and agents that have.
///
/// An empty whitelist is satisfied by anyone. Agents outside the whitelist
/// may report; they are tracked but never required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentWhitelist {
    necessary: BTreeSet<String>,
    reported: BTreeSet<String>,
}

impl AgentWhitelist {
    pub fn new<I, S>(necessary: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            necessary: necessary.into_iter().map(Into::into).collect(),
            reported: BTreeSet::new(),
        }
    }

    pub fn add_necessary(&mut self, agent: impl Into<String>) {
        self.necessary.insert(agent.into());
    }

    pub fn clear_whitelist(&mut self) {
        self.necessary.clear();
    }

    pub fn reset_reported(&mut self) {
        self.reported.clear();
    }

    /// Record a report. Returns false if the agent had already reported.
    pub fn add_reported(&mut self, agent: impl Into<String>) -> bool {
        let agent = agent.into();
        let added = self.reported.insert(agent.clone());
        if !added {
            debug!(%agent, "AgentWhitelist::add_reported: duplicate report");
        }
        added
    }

    pub fn all_reported(&self) -> bool {
        self.necessary.is_subset(&self.reported)
    }

    pub fn is_necessary(&self, agent: &str) -> bool {
        self.necessary.contains(agent)
    }

    pub fn has_reported(&self, agent: &str) -> bool {
        self.reported.contains(agent)
    }

    pub fn is_empty(&self) -> bool {
        self.necessary.is_empty()
    }

    pub fn reported_count(&self) -> usize {
        self.reported.len()
    }

    /// Whitelisted agents that have not reported yet
    pub fn missing(&self) -> Vec<&str> {
        self.necessary.difference(&self.reported).map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_whitelist() {
        let mut whitelist = AgentWhitelist::default();
        assert!(whitelist.all_reported());
        whitelist.add_reported("agent");
        assert!(whitelist.all_reported());
    }

    #[test]
    fn test_single_whitelist() {
        let mut whitelist = AgentWhitelist::default();
        whitelist.add_necessary("agent1");
        assert!(!whitelist.all_reported());
        whitelist.add_reported("agent1");
        assert!(whitelist.all_reported());
    }

    #[test]
    fn test_multiple_whitelist() {
        let mut whitelist = AgentWhitelist::new(["agent1", "agent2"]);
        whitelist.add_necessary("agent3");
        assert!(!whitelist.all_reported());
        whitelist.add_reported("agent1");
        whitelist.add_reported("agent2");
        assert!(!whitelist.all_reported());
        assert_eq!(whitelist.missing(), vec!["agent3"]);
        whitelist.add_reported("agent3");
        assert!(whitelist.all_reported());
    }

    #[test]
    fn test_extra_agents() {
        let mut whitelist = AgentWhitelist::new(["agent1"]);
        whitelist.add_reported("agent2");
        assert!(!whitelist.all_reported());
        whitelist.add_reported("agent1");
        assert!(whitelist.all_reported());
        assert_eq!(whitelist.reported_count(), 2);
    }

    #[test]
    fn test_duplicate_report_counts_once() {
        let mut whitelist = AgentWhitelist::new(["agent1", "agent2"]);
        assert!(whitelist.add_reported("agent1"));
        assert!(!whitelist.add_reported("agent1"));
        assert_eq!(whitelist.reported_count(), 1);
        assert!(!whitelist.all_reported());
    }

    #[test]
    fn test_is_necessary_ignores_extras() {
        let mut whitelist = AgentWhitelist::new(["agent1"]);
        whitelist.add_reported("agent2");
        assert!(whitelist.is_necessary("agent1"));
        assert!(!whitelist.is_necessary("agent2"));
    }

    #[test]
    fn test_reset_and_clear() {
        let mut whitelist = AgentWhitelist::new(["agent1"]);
        whitelist.add_reported("agent1");
        whitelist.reset_reported();
        assert!(!whitelist.all_reported());
        assert!(!whitelist.has_reported("agent1"));

        whitelist.clear_whitelist();
        assert!(whitelist.is_empty());
        assert!(whitelist.all_reported());
    }
}
