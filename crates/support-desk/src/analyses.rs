//! Expert analyses kept per ticket for the support team

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::activities::ExpertAnalysis;

/// Key an analysis is stored under
pub fn analysis_key(ticket_id: &str) -> String {
    format!("analysis-{ticket_id}")
}

/// In-memory store of the latest expert analysis per ticket
///
/// Saving is an overwrite, so a re-run analysis attempt replaces the earlier
/// result instead of adding a second entry.
#[derive(Debug, Default)]
pub struct AnalysisStore {
    analyses: RwLock<BTreeMap<String, ExpertAnalysis>>,
}

impl AnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save an analysis, returning its key
    pub fn save(&self, analysis: &ExpertAnalysis) -> String {
        let key = analysis_key(&analysis.ticket_id);
        self.analyses.write().insert(key.clone(), analysis.clone());
        key
    }

    pub fn get(&self, ticket_id: &str) -> Option<ExpertAnalysis> {
        self.analyses.read().get(&analysis_key(ticket_id)).cloned()
    }

    /// All analyses ordered by key
    pub fn list(&self) -> Vec<(String, ExpertAnalysis)> {
        self.analyses
            .read()
            .iter()
            .map(|(key, analysis)| (key.clone(), analysis.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.analyses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyses.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(ticket_id: &str, topic: &str) -> ExpertAnalysis {
        ExpertAnalysis {
            ticket_id: ticket_id.to_string(),
            topic: topic.to_string(),
            issue_analysis: "analysis".to_string(),
            proposed_solution: "solution".to_string(),
            confidence_score: 0.5,
            status: "analysis_complete".to_string(),
        }
    }

    #[test]
    fn test_save_overwrites_per_ticket() {
        let store = AnalysisStore::new();
        assert!(store.is_empty());

        assert_eq!(store.save(&analysis("T1", "connection")), "analysis-T1");
        store.save(&analysis("T2", "version"));
        store.save(&analysis("T1", "configuration"));

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("T1").unwrap().topic, "configuration");
        assert!(store.get("T3").is_none());

        let keys: Vec<_> = store.list().into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["analysis-T1", "analysis-T2"]);
    }
}
