//! # Persisted Trial Records
//!
//! Experiment drivers serialize one record per trial: the simulator and
//! network configurations plus a result list. Density matrices are not
//! embedded; a result references a separate `.qu` binary file by name and the
//! core only emits that reference.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource_manager::MemoryInfo;
use crate::simulation::SimulatorConfig;
use crate::topology::TopologyConfig;
use crate::{Result, SimulationError};

/// One entangled-pair observation in a trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRecord {
    pub node: String,
    pub info: MemoryInfo,
}

/// One trial's results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrialResult {
    #[serde(rename = "initial entangled states")]
    pub initial_entangled_states: Vec<PairRecord>,
    #[serde(rename = "purified states")]
    pub purified_states: Vec<PairRecord>,
    /// Filename of the `.qu` density-matrix dump, when one was produced
    #[serde(rename = "GHZ state", skip_serializing_if = "Option::is_none")]
    pub ghz_state: Option<String>,
}

/// The persisted record of one experiment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub simulation_config: SimulatorConfig,
    pub network_config: TopologyConfig,
    pub results: Vec<TrialResult>,
    pub recorded_at: DateTime<Utc>,
}

impl TrialRecord {
    pub fn new(simulation_config: SimulatorConfig, network_config: TopologyConfig) -> Self {
        Self {
            simulation_config,
            network_config,
            results: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    /// Reference a density-matrix file for the latest result. The `.qu`
    /// suffix identifies the single-object binary format; contents are
    /// written by the experiment driver, not here.
    pub fn reference_ghz_file(&mut self, stem: &str) -> String {
        let filename = format!("{stem}.qu");
        if let Some(result) = self.results.last_mut() {
            result.ghz_state = Some(filename.clone());
        }
        filename
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SimulationError::Serialization(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| SimulationError::Serialization(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json =
            std::fs::read_to_string(path).map_err(|e| SimulationError::Serialization(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| SimulationError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_manager::MemoryInfoState;

    fn sample_record() -> TrialRecord {
        let topology: TopologyConfig = serde_json::from_str(
            r#"{"nodes": [{"name": "r1", "type": "QuantumRouter"}],
                "qconnections": [], "cconnections": []}"#,
        )
        .unwrap();
        let mut record = TrialRecord::new(SimulatorConfig::default(), topology);
        record.results.push(TrialResult {
            initial_entangled_states: vec![PairRecord {
                node: "r1".to_string(),
                info: MemoryInfo {
                    index: 0,
                    state: MemoryInfoState::Entangled,
                    remote_node: Some("r2".to_string()),
                    remote_memo: Some("r2.memo[0]".to_string()),
                    entangle_time: Some(1_000_000),
                    fidelity: 0.9,
                    reservation: None,
                },
            }],
            purified_states: Vec::new(),
            ghz_state: None,
        });
        record
    }

    #[test]
    fn test_json_roundtrip() {
        let record = sample_record();
        let json = record.to_json().unwrap();
        assert!(json.contains("initial entangled states"));
        let parsed: TrialRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(
            parsed.results[0].initial_entangled_states[0].info.fidelity,
            0.9
        );
    }

    #[test]
    fn test_ghz_reference_uses_qu_suffix() {
        let mut record = sample_record();
        let filename = record.reference_ghz_file("trial_0_ghz");
        assert_eq!(filename, "trial_0_ghz.qu");
        assert_eq!(
            record.results.last().unwrap().ghz_state.as_deref(),
            Some("trial_0_ghz.qu")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trial.json");
        let record = sample_record();
        record.save(&path).unwrap();
        let loaded = TrialRecord::load(&path).unwrap();
        assert_eq!(loaded.results.len(), record.results.len());
    }
}
