use std::collections::HashMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use duet_tasks::TaskStore;
use duet_types::{Result, TaskType, DEFAULT_PRIORITY};

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Names of other tasks in the same plan this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// The JSON document the planner returns when asked to decompose a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevelopmentPlan {
    pub project_name: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
    #[serde(default)]
    pub technical_considerations: String,
}

impl DevelopmentPlan {
    /// Tolerant parse: planners like to wrap their JSON in prose or code
    /// fences, so take the outermost braced span.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let start = text.find('{').context("no JSON object in plan text")?;
        let end = text.rfind('}').context("no closing brace in plan text")?;
        anyhow::ensure!(start < end, "malformed plan text");
        let plan = serde_json::from_str(&text[start..=end]).context("invalid plan JSON")?;
        Ok(plan)
    }

    /// Create a store task per planned task, then wire dependencies by
    /// resolving declared names against the ids created in this same plan.
    /// Unknown dependency names are skipped with a warning.
    pub async fn instantiate(&self, store: &TaskStore) -> Result<Vec<String>> {
        let mut ids_by_name: HashMap<&str, String> = HashMap::new();
        let mut created = Vec::new();

        for planned in &self.tasks {
            let priority = planned.priority.clamp(1, 5);
            let id = store
                .create(planned.task_type, planned.description.clone(), priority, Vec::new())
                .await?;
            ids_by_name.insert(planned.name.as_str(), id.clone());
            created.push(id);
        }

        for (planned, id) in self.tasks.iter().zip(&created) {
            if planned.dependencies.is_empty() {
                continue;
            }
            let mut dep_ids = Vec::new();
            for name in &planned.dependencies {
                match ids_by_name.get(name.as_str()) {
                    Some(dep_id) => dep_ids.push(dep_id.clone()),
                    None => {
                        tracing::warn!(
                            "plan task `{}` depends on unknown task `{}`",
                            planned.name,
                            name
                        );
                    }
                }
            }
            if !dep_ids.is_empty() {
                store.set_dependencies(id, dep_ids).await?;
            }
        }

        Ok(created)
    }
}
