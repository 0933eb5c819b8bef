//! Plan wire format exchanged with the planning model.
//!
//! ```json
//! { "steps": [
//!     { "stepNumber": 1, "description": "...",
//!       "toolName": "search" | null, "toolArguments": {},
//!       "dependsOn": [] } ] }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A plan as written by the model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanSpec {
    pub steps: Vec<StepSpec>,
}

/// One step as written by the model. Dependencies are step numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub step_number: u32,

    pub description: String,

    #[serde(default)]
    pub tool_name: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tool_arguments: Map<String, Value>,

    /// Numbers that cannot name a step (above `u32::MAX`) are dropped.
    #[serde(default, deserialize_with = "step_numbers")]
    pub depends_on: Vec<u32>,
}

impl StepSpec {
    /// A model-delegated step with no dependencies.
    pub fn new(step_number: u32, description: impl Into<String>) -> Self {
        Self {
            step_number,
            description: description.into(),
            tool_name: None,
            tool_arguments: Map::new(),
            depends_on: Vec::new(),
        }
    }

    /// Route this step to a tool.
    pub fn with_tool(mut self, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_arguments = arguments;
        self
    }

    /// Declare the step numbers this step waits for.
    pub fn depends_on(mut self, step_numbers: impl IntoIterator<Item = u32>) -> Self {
        self.depends_on = step_numbers.into_iter().collect();
        self
    }
}

impl PlanSpec {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self { steps }
    }

    /// Render as the exact wire JSON.
    pub fn to_json(&self) -> String {
        // Only strings, maps and integers: serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_else(|_| String::from("{\"steps\":[]}"))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn step_numbers<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let numbers = Option::<Vec<u64>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(numbers
        .into_iter()
        .filter_map(|n| match u32::try_from(n) {
            Ok(n) => Some(n),
            Err(_) => {
                tracing::debug!(depends_on = n, "dropping out-of-range dependency");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let spec = PlanSpec::new(vec![StepSpec::new(1, "Answer")]);
        let value = serde_json::to_value(&spec).unwrap();

        assert_eq!(
            value,
            json!({
                "steps": [{
                    "stepNumber": 1,
                    "description": "Answer",
                    "toolName": null,
                    "toolArguments": {},
                    "dependsOn": []
                }]
            })
        );
    }

    #[test]
    fn test_nulls_and_omissions_default() {
        let spec: PlanSpec = serde_json::from_value(json!({
            "steps": [
                { "stepNumber": 1, "description": "a", "toolArguments": null, "dependsOn": null },
                { "stepNumber": 2, "description": "b" }
            ]
        }))
        .unwrap();

        assert!(spec.steps[0].tool_arguments.is_empty());
        assert!(spec.steps[0].depends_on.is_empty());
        assert_eq!(spec.steps[1].tool_name, None);
    }
}
