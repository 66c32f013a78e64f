//! Prebuilt workflows shipped with the binary.
//!
//! Every template runs on the `builtin` capability, so `tweave templates
//! <name> --output flow.yaml && tweave run flow.yaml` works out of the box.

use taskweave_core::workflow::definition::{DefinitionError, parse_workflow_yaml};
use taskweave_types::workflow::Workflow;

pub struct Template {
    pub name: &'static str,
    pub yaml: &'static str,
}

impl Template {
    pub fn workflow(&self) -> Result<Workflow, DefinitionError> {
        parse_workflow_yaml(self.yaml)
    }
}

pub const TEMPLATES: &[Template] = &[
    Template {
        name: "price-comparison",
        yaml: include_str!("../templates/price-comparison.yaml"),
    },
    Template {
        name: "content-aggregation",
        yaml: include_str!("../templates/content-aggregation.yaml"),
    },
    Template {
        name: "form-filling",
        yaml: include_str!("../templates/form-filling.yaml"),
    },
    Template {
        name: "data-extraction",
        yaml: include_str!("../templates/data-extraction.yaml"),
    },
    Template {
        name: "price-monitoring",
        yaml: include_str!("../templates/price-monitoring.yaml"),
    },
    Template {
        name: "pagination-scraping",
        yaml: include_str!("../templates/pagination-scraping.yaml"),
    },
    Template {
        name: "multi-tab-comparison",
        yaml: include_str!("../templates/multi-tab-comparison.yaml"),
    },
];

pub fn find(name: &str) -> Option<&'static Template> {
    TEMPLATES.iter().find(|t| t.name == name)
}
