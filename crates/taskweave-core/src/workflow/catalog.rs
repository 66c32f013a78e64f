//! In-process catalog of versioned workflow definitions.
//!
//! Versions are immutable: registering a different definition under an
//! existing `(id, version)` is rejected, and executions keep the `Arc` of the
//! version they started with.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use semver::{Version, VersionReq};
use taskweave_types::workflow::Workflow;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("workflow '{id}' version {version} is already registered with a different definition")]
    VersionConflict { id: String, version: Version },

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("no version of workflow '{id}' matches {requirement}")]
    NoMatchingVersion { id: String, requirement: VersionReq },
}

/// Registered workflow definitions keyed by id, then version.
#[derive(Debug, Default)]
pub struct WorkflowCatalog {
    workflows: DashMap<String, BTreeMap<Version, Arc<Workflow>>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition. Re-registering an identical definition is a no-op.
    pub fn register(&self, workflow: Workflow) -> Result<Arc<Workflow>, CatalogError> {
        let mut versions = self.workflows.entry(workflow.id.clone()).or_default();
        if let Some(existing) = versions.get(&workflow.version) {
            if **existing != workflow {
                return Err(CatalogError::VersionConflict {
                    id: workflow.id.clone(),
                    version: workflow.version.clone(),
                });
            }
            return Ok(Arc::clone(existing));
        }
        tracing::debug!(workflow_id = %workflow.id, version = %workflow.version, "registered workflow");
        let workflow = Arc::new(workflow);
        versions.insert(workflow.version.clone(), Arc::clone(&workflow));
        Ok(workflow)
    }

    pub fn get(&self, id: &str, version: &Version) -> Option<Arc<Workflow>> {
        self.workflows
            .get(id)
            .and_then(|versions| versions.get(version).cloned())
    }

    /// Highest registered version.
    pub fn latest(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows
            .get(id)
            .and_then(|versions| versions.values().next_back().cloned())
    }

    /// Highest version matching `requirement`, or the latest when `None`.
    pub fn resolve(&self, id: &str, requirement: Option<&VersionReq>) -> Result<Arc<Workflow>, CatalogError> {
        let versions = self
            .workflows
            .get(id)
            .ok_or_else(|| CatalogError::UnknownWorkflow(id.to_string()))?;
        let found = match requirement {
            None => versions.values().next_back().cloned(),
            Some(req) => versions
                .iter()
                .rev()
                .find(|(version, _)| req.matches(version))
                .map(|(_, wf)| Arc::clone(wf)),
        };
        found.ok_or_else(|| match requirement {
            Some(req) => CatalogError::NoMatchingVersion {
                id: id.to_string(),
                requirement: req.clone(),
            },
            None => CatalogError::UnknownWorkflow(id.to_string()),
        })
    }

    /// Registered versions of `id`, ascending.
    pub fn versions(&self, id: &str) -> Vec<Version> {
        self.workflows
            .get(id)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Registered workflow ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use taskweave_types::workflow::TaskSpec;

    use super::*;

    fn wf(version: &str) -> Workflow {
        Workflow::new("report", vec![TaskSpec::new("a", "builtin", "echo")])
            .with_version(Version::parse(version).unwrap())
    }

    #[test]
    fn test_latest_and_exact() {
        let catalog = WorkflowCatalog::new();
        catalog.register(wf("1.0.0")).unwrap();
        catalog.register(wf("1.2.0")).unwrap();
        catalog.register(wf("2.0.0")).unwrap();

        assert_eq!(catalog.latest("report").unwrap().version, Version::new(2, 0, 0));
        assert!(catalog.get("report", &Version::new(1, 2, 0)).is_some());
        assert_eq!(
            catalog.versions("report"),
            vec![Version::new(1, 0, 0), Version::new(1, 2, 0), Version::new(2, 0, 0)]
        );
        assert_eq!(catalog.ids(), vec!["report".to_string()]);
    }

    #[test]
    fn test_resolve_with_requirement() {
        let catalog = WorkflowCatalog::new();
        for v in ["1.0.0", "1.4.2", "2.1.0"] {
            catalog.register(wf(v)).unwrap();
        }
        let req = VersionReq::parse("^1").unwrap();
        assert_eq!(
            catalog.resolve("report", Some(&req)).unwrap().version,
            Version::new(1, 4, 2)
        );
        assert_eq!(catalog.resolve("report", None).unwrap().version, Version::new(2, 1, 0));

        let none = VersionReq::parse(">=3").unwrap();
        assert!(matches!(
            catalog.resolve("report", Some(&none)),
            Err(CatalogError::NoMatchingVersion { .. })
        ));
        assert_eq!(
            catalog.resolve("ghost", None).unwrap_err(),
            CatalogError::UnknownWorkflow("ghost".to_string())
        );
    }

    #[test]
    fn test_versions_are_immutable() {
        let catalog = WorkflowCatalog::new();
        let first = catalog.register(wf("1.0.0")).unwrap();
        let again = catalog.register(wf("1.0.0")).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let changed = wf("1.0.0").with_variable("x", json!(1));
        assert!(matches!(
            catalog.register(changed),
            Err(CatalogError::VersionConflict { .. })
        ));
        assert!(catalog.get("report", &Version::new(1, 0, 0)).unwrap().variables.is_empty());
    }
}
