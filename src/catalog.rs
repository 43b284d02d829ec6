//! Static workflow sequence definitions.
//!
//! The catalog is externally supplied configuration: an ordered list of
//! agent steps per workflow, with an estimated duration per step. It is
//! immutable after load and used only for progress arithmetic and the
//! watchdog's timeout thresholds. A catalog that fails validation aborts
//! initialization; nothing else in the crate does.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One step of a declared workflow sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub agent_id: String,
    /// 1-based position in the declared sequence.
    pub step_number: u32,
    pub estimated_duration_secs: u64,
}

impl WorkflowStep {
    pub fn estimated_duration(&self) -> Duration {
        Duration::seconds(i64::try_from(self.estimated_duration_secs).unwrap_or(i64::MAX))
    }
}

/// An ordered sequence of agent steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.steps.iter().any(|s| s.agent_id == agent_id)
    }

    /// Estimated duration for one agent's step, if it is part of this
    /// workflow.
    pub fn step_duration(&self, agent_id: &str) -> Option<Duration> {
        self.steps
            .iter()
            .find(|s| s.agent_id == agent_id)
            .map(WorkflowStep::estimated_duration)
    }

    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            bail!("workflow '{}' declares no steps", self.workflow_id);
        }
        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if !seen.insert(step.agent_id.as_str()) {
                bail!(
                    "workflow '{}' lists agent '{}' more than once",
                    self.workflow_id,
                    step.agent_id
                );
            }
            let expected = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
            if step.step_number != expected {
                bail!(
                    "workflow '{}': step '{}' is numbered {} but sits at position {}",
                    self.workflow_id,
                    step.agent_id,
                    step.step_number,
                    expected
                );
            }
        }
        Ok(())
    }
}

/// Immutable table of workflow definitions, keyed by workflow id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSequenceCatalog {
    workflows: Vec<WorkflowDefinition>,
}

impl WorkflowSequenceCatalog {
    /// Loads and validates a catalog from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow catalog: {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid workflow catalog: {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let catalog: Self =
            serde_yaml::from_str(raw).context("Failed to parse workflow catalog as YAML")?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// The built-in marketing strategy sequence.
    pub fn standard() -> Self {
        const STANDARD_WORKFLOWS_YAML: &str = include_str!("../workflows.yaml");

        Self::from_yaml_str(STANDARD_WORKFLOWS_YAML)
            .expect("Failed to parse embedded workflows.yaml - this is a bug in workflows.yaml")
    }

    pub fn workflows(&self) -> &[WorkflowDefinition] {
        &self.workflows
    }

    pub fn get(&self, workflow_id: &str) -> Option<&WorkflowDefinition> {
        self.workflows.iter().find(|w| w.workflow_id == workflow_id)
    }

    /// Every workflow that includes the given agent as a step.
    pub fn workflows_containing<'a>(
        &'a self,
        agent_id: &'a str,
    ) -> impl Iterator<Item = &'a WorkflowDefinition> {
        self.workflows.iter().filter(move |w| w.contains_agent(agent_id))
    }

    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.workflows.iter().any(|w| w.contains_agent(agent_id))
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for workflow in &self.workflows {
            if !ids.insert(workflow.workflow_id.as_str()) {
                bail!("duplicate workflow id '{}'", workflow.workflow_id);
            }
            workflow.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn standard_catalog_has_the_nine_step_pipeline() {
        let catalog = WorkflowSequenceCatalog::standard();
        let workflow = catalog.get("marketing_strategy").unwrap();
        assert_eq!(workflow.total_steps(), 9);
        assert_eq!(workflow.steps[0].agent_id, "discovery");
        assert_eq!(workflow.steps[8].agent_id, "summary_composer");
        assert!(catalog.contains_agent("geo_audit"));
        assert!(!catalog.contains_agent("unknown_agent"));
        assert_eq!(
            workflow.step_duration("geo_audit"),
            Some(Duration::seconds(120))
        );
    }

    #[test]
    fn unknown_workflow_id_is_none() {
        let catalog = WorkflowSequenceCatalog::standard();
        assert!(catalog.get("no_such_workflow").is_none());
    }

    #[test]
    fn duplicate_agent_in_a_workflow_is_rejected() {
        let yaml = r#"
workflows:
  - workflow_id: w
    name: W
    steps:
      - { agent_id: a, step_number: 1, estimated_duration_secs: 10 }
      - { agent_id: a, step_number: 2, estimated_duration_secs: 10 }
"#;
        let err = WorkflowSequenceCatalog::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn non_contiguous_step_numbers_are_rejected() {
        let yaml = r#"
workflows:
  - workflow_id: w
    name: W
    steps:
      - { agent_id: a, step_number: 1, estimated_duration_secs: 10 }
      - { agent_id: b, step_number: 3, estimated_duration_secs: 10 }
"#;
        assert!(WorkflowSequenceCatalog::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn empty_workflow_is_rejected() {
        let yaml = r#"
workflows:
  - workflow_id: w
    name: W
    steps: []
"#;
        let err = WorkflowSequenceCatalog::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn duplicate_workflow_id_is_rejected() {
        let yaml = r#"
workflows:
  - workflow_id: w
    name: W1
    steps:
      - { agent_id: a, step_number: 1, estimated_duration_secs: 10 }
  - workflow_id: w
    name: W2
    steps:
      - { agent_id: b, step_number: 1, estimated_duration_secs: 10 }
"#;
        let err = WorkflowSequenceCatalog::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate workflow id"));
    }

    #[test]
    fn load_reads_a_catalog_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
workflows:
  - workflow_id: smoke
    name: Smoke
    steps:
      - {{ agent_id: a, step_number: 1, estimated_duration_secs: 5 }}
"#
        )
        .unwrap();
        let catalog = WorkflowSequenceCatalog::load(file.path()).unwrap();
        assert!(catalog.get("smoke").is_some());
    }

    #[test]
    fn load_surfaces_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkflowSequenceCatalog::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read workflow catalog"));
    }
}
