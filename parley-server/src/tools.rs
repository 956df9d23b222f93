use async_openai::types::{ChatCompletionTool, ChatCompletionToolType, FunctionObject};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::warn;

struct ToolSpec {
    name: &'static str,
    description: &'static str,
    parameters: Value,
}

/// Function definitions the model may call. Which ones are advertised is
/// chosen per request through `selectedTools`; executing them is up to the
/// client.
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn builtin() -> Self {
        let get_current_datetime = ToolSpec {
            name: "get_current_datetime",
            description: "Return the current date and time",
            parameters: json!({
                "type": "object",
                "properties": {
                    "timezone": {
                        "type": "string",
                        "description": "IANA timezone name, e.g. 'Europe/Berlin'. Defaults to UTC."
                    }
                },
                "required": [],
                "additionalProperties": false
            }),
        };

        let web_search = ToolSpec {
            name: "web_search",
            description: "Search the web and return the most relevant results",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search terms"
                    },
                    "max_results": {
                        "type": "integer",
                        "description": "Number of results to return",
                        "default": 5
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        };

        Self {
            tools: vec![get_current_datetime, web_search],
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tools.iter().map(|t| t.name)
    }

    /// Definitions for `selected`, in request order. A configuration entry
    /// may override a tool's `description`.
    pub fn select(
        &self,
        selected: &[String],
        configurations: &HashMap<String, Value>,
    ) -> Vec<ChatCompletionTool> {
        selected
            .iter()
            .filter_map(|name| {
                let Some(spec) = self.tools.iter().find(|t| t.name == name.as_str()) else {
                    warn!(tool = %name, "ignoring unknown tool");
                    return None;
                };
                let description = configurations
                    .get(name)
                    .and_then(|c| c.get("description"))
                    .and_then(Value::as_str)
                    .unwrap_or(spec.description);
                Some(ChatCompletionTool {
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionObject {
                        name: spec.name.to_string(),
                        description: Some(description.to_string()),
                        parameters: Some(spec.parameters.clone()),
                        strict: None,
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_known_tools_in_request_order() {
        let registry = ToolRegistry::builtin();
        let selected = vec![
            "web_search".to_string(),
            "launch_rockets".to_string(),
            "get_current_datetime".to_string(),
        ];
        let tools = registry.select(&selected, &HashMap::new());
        let names: Vec<_> = tools.iter().map(|t| t.function.name.as_str()).collect();
        assert_eq!(names, vec!["web_search", "get_current_datetime"]);
    }

    #[test]
    fn configuration_overrides_description() {
        let registry = ToolRegistry::builtin();
        let mut configurations = HashMap::new();
        configurations.insert(
            "web_search".to_string(),
            json!({"description": "Search the company wiki"}),
        );
        let tools = registry.select(&["web_search".to_string()], &configurations);
        assert_eq!(
            tools[0].function.description.as_deref(),
            Some("Search the company wiki")
        );
    }

    #[test]
    fn nothing_selected_means_no_tools() {
        let registry = ToolRegistry::builtin();
        assert!(registry.select(&[], &HashMap::new()).is_empty());
        assert_eq!(registry.names().count(), 2);
    }
}
