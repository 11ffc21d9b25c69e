//! Crews, agents, tasks and templates, plus the built-in presets.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::{drop_nulls, new_id, rename_keys, timestamp};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrewStatus {
    #[default]
    Active,
    Inactive,
    Draft,
    /// Anything else, e.g. the `idle` older list endpoints report.
    #[serde(other)]
    Idle,
}

impl fmt::Display for CrewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CrewStatus::Active => "active",
            CrewStatus::Inactive => "inactive",
            CrewStatus::Draft => "draft",
            CrewStatus::Idle => "idle",
        };
        f.pad(s)
    }
}

/// A configured persona taking part in a crew.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backstory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub allow_delegation: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A unit of work, optionally assigned to an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A named collection of agents and tasks, the unit of execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Crew {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub status: CrewStatus,
    #[serde(default, deserialize_with = "lenient_list")]
    pub agents: Vec<Agent>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub tasks: Vec<Task>,
    #[serde(default, with = "timestamp::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Number of times this crew has been launched.
    #[serde(default)]
    pub executions: u64,
    #[serde(default, with = "timestamp::option")]
    pub last_executed: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A template member is either a preset kind name or an inline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Member<T> {
    Preset(String),
    Inline(T),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub agents: Vec<Member<Agent>>,
    #[serde(default)]
    pub tasks: Vec<Member<Task>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Older list endpoints report member counts (`"agents": 3`) instead of
/// member objects; those read as an empty list.
fn lenient_list<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    match Value::deserialize(d)? {
        Value::Array(items) => items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(serde::de::Error::custom))
            .collect(),
        _ => Ok(Vec::new()),
    }
}

const CREW_ALIASES: &[(&str, &str)] = &[
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("lastExecuted", "last_executed"),
];

const CREW_NON_NULL: &[&str] = &["id", "name", "status", "agents", "tasks", "executions"];

pub fn canonicalize_crew(map: &mut Map<String, Value>) {
    rename_keys(map, CREW_ALIASES);
    drop_nulls(map, CREW_NON_NULL);
    canonicalize_members(map, "agents", canonicalize_agent);
    canonicalize_members(map, "tasks", canonicalize_task);
}

/// Applies `f` to every object element of `map[key]`; preset names and
/// count placeholders are left alone.
fn canonicalize_members(map: &mut Map<String, Value>, key: &str, f: fn(&mut Map<String, Value>)) {
    if let Some(Value::Array(items)) = map.get_mut(key) {
        for item in items.iter_mut() {
            if let Value::Object(obj) = item {
                f(obj);
            }
        }
    }
}

pub fn canonicalize_agent(map: &mut Map<String, Value>) {
    rename_keys(map, &[("allowDelegation", "allow_delegation")]);
    drop_nulls(map, &["id", "name", "role", "goal", "verbose", "allow_delegation"]);
}

pub fn canonicalize_task(map: &mut Map<String, Value>) {
    rename_keys(map, &[("expectedOutput", "expected_output")]);
    drop_nulls(map, &["id", "description", "expected_output"]);
}

pub fn canonicalize_template(map: &mut Map<String, Value>) {
    drop_nulls(map, &["id", "name", "agents", "tasks"]);
    canonicalize_members(map, "agents", canonicalize_agent);
    canonicalize_members(map, "tasks", canonicalize_task);
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

/// Built-in agent persona for a kind name (`researcher`, `writer`, ...).
pub fn agent_preset(kind: &str) -> Option<Agent> {
    let (name, role, goal, backstory, delegate) = match kind.to_ascii_lowercase().as_str() {
        "researcher" => (
            "Researcher",
            "Research and gather information on given topics",
            "Provide comprehensive and accurate research findings",
            "An expert researcher with years of experience in data gathering and analysis",
            false,
        ),
        "writer" => (
            "Writer",
            "Create high-quality written content based on research",
            "Produce engaging and informative content",
            "A skilled writer with expertise in various writing styles and formats",
            false,
        ),
        "analyst" => (
            "Analyst",
            "Analyze data and provide insights",
            "Generate actionable insights from data analysis",
            "A data analyst with strong analytical and problem-solving skills",
            false,
        ),
        "coordinator" => (
            "Coordinator",
            "Coordinate and manage crew activities",
            "Ensure smooth execution and optimal resource utilization",
            "An experienced project coordinator with excellent organizational skills",
            true,
        ),
        "validator" => (
            "Validator",
            "Validate and quality-check outputs",
            "Ensure high quality and accuracy of all deliverables",
            "A quality assurance expert with attention to detail",
            false,
        ),
        _ => return None,
    };
    Some(Agent {
        id: new_id(),
        name: name.to_string(),
        role: role.to_string(),
        goal: goal.to_string(),
        backstory: Some(backstory.to_string()),
        model: None,
        verbose: true,
        allow_delegation: delegate,
        extra: Map::new(),
    })
}

/// Built-in task for a kind name (`research`, `write`, ...).
pub fn task_preset(kind: &str) -> Option<Task> {
    let (description, expected_output, agent) = match kind.to_ascii_lowercase().as_str() {
        "research" => (
            "Research the given topic thoroughly",
            "Comprehensive research findings with sources",
            "researcher",
        ),
        "write" => (
            "Write content based on research findings",
            "Well-written content in the specified format",
            "writer",
        ),
        "analyze" => (
            "Analyze data and provide insights",
            "Detailed analysis with actionable insights",
            "analyst",
        ),
        "validate" => (
            "Validate the quality and accuracy of outputs",
            "Validation report with recommendations",
            "validator",
        ),
        "coordinate" => (
            "Coordinate crew activities and manage workflow",
            "Coordination report and workflow status",
            "coordinator",
        ),
        _ => return None,
    };
    Some(Task {
        id: new_id(),
        name: None,
        description: description.to_string(),
        expected_output: expected_output.to_string(),
        agent: Some(agent.to_string()),
        extra: Map::new(),
    })
}

/// Templates shipped with the client, available without a server.
pub fn builtin_templates() -> Vec<Template> {
    fn preset<T>(names: &[&str]) -> Vec<Member<T>> {
        names.iter().map(|n| Member::Preset(n.to_string())).collect()
    }

    vec![
        Template {
            id: "research_and_write".to_string(),
            name: "Research and Write".to_string(),
            description: Some("A crew for researching topics and writing content".to_string()),
            category: Some("Research".to_string()),
            agents: preset(&["researcher", "writer", "validator"]),
            tasks: preset(&["research", "write", "validate"]),
            extra: Map::new(),
        },
        Template {
            id: "data_analysis".to_string(),
            name: "Data Analysis".to_string(),
            description: Some("A crew for analyzing data and generating insights".to_string()),
            category: Some("Analytics".to_string()),
            agents: preset(&["analyst", "researcher", "coordinator"]),
            tasks: preset(&["analyze", "research", "coordinate"]),
            extra: Map::new(),
        },
        Template {
            id: "content_creation".to_string(),
            name: "Content Creation".to_string(),
            description: Some("A crew for creating various types of content".to_string()),
            category: Some("Marketing".to_string()),
            agents: preset(&["writer", "researcher", "validator"]),
            tasks: preset(&["write", "research", "validate"]),
            extra: Map::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_crew_accepts_member_counts() {
        let mut map = json!({
            "id": "1",
            "name": "Research & Analysis Team",
            "status": "idle",
            "agents": 3,
            "tasks": 5,
            "createdAt": "2025-01-01T00:00:00Z",
            "rating": 4.8
        })
        .as_object()
        .cloned()
        .unwrap();
        canonicalize_crew(&mut map);
        let crew: Crew = serde_json::from_value(Value::Object(map)).unwrap();
        assert!(crew.agents.is_empty());
        assert_eq!(crew.status, CrewStatus::Idle);
        assert!(crew.created_at.is_some());
        assert_eq!(crew.extra.get("rating"), Some(&json!(4.8)));
    }

    #[test]
    fn test_crew_members_accept_camel_case_keys() {
        let mut map = json!({
            "name": "Research",
            "agents": [{"id": null, "name": "Ada", "role": "Researcher", "goal": "Facts", "allowDelegation": true}],
            "tasks": [{"id": null, "description": "Do", "expectedOutput": "Notes"}, "legacy"]
        })
        .as_object()
        .cloned()
        .unwrap();
        canonicalize_crew(&mut map);
        assert_eq!(map["tasks"][1], json!("legacy"));
        map["tasks"].as_array_mut().unwrap().pop();

        let crew: Crew = serde_json::from_value(Value::Object(map)).unwrap();
        assert!(crew.agents[0].allow_delegation);
        assert!(crew.agents[0].extra.is_empty());
        assert_eq!(crew.tasks[0].expected_output, "Notes");
        assert!(crew.tasks[0].extra.is_empty());
    }

    #[test]
    fn test_template_inline_members_accept_camel_case_keys() {
        let mut map = json!({
            "id": "t1",
            "name": "Mixed",
            "agents": ["writer", {"name": "Critic", "role": "Review", "goal": "Judge", "allowDelegation": true}],
            "tasks": [{"description": "Review", "expectedOutput": "Verdict"}]
        })
        .as_object()
        .cloned()
        .unwrap();
        canonicalize_template(&mut map);
        let tpl: Template = serde_json::from_value(Value::Object(map)).unwrap();
        assert!(matches!(tpl.agents[1], Member::Inline(ref a) if a.allow_delegation));
        assert!(matches!(tpl.tasks[0], Member::Inline(ref t) if t.expected_output == "Verdict"));
    }

    #[test]
    fn test_template_members_mix_presets_and_inline() {
        let tpl: Template = serde_json::from_value(json!({
            "id": "template-1",
            "name": "Research Team",
            "agents": ["writer", {"name": "Research Analyst", "role": "Senior", "goal": "Dig"}],
            "tasks": [{"description": "Analyze", "expected_output": "Report"}]
        }))
        .unwrap();
        assert!(matches!(tpl.agents[0], Member::Preset(ref k) if k == "writer"));
        assert!(matches!(tpl.agents[1], Member::Inline(ref a) if a.name == "Research Analyst"));
        assert_eq!(tpl.tasks.len(), 1);
    }

    #[test]
    fn test_presets_cover_builtin_templates() {
        for tpl in builtin_templates() {
            for m in &tpl.agents {
                if let Member::Preset(kind) = m {
                    assert!(agent_preset(kind).is_some(), "missing agent preset {kind}");
                }
            }
            for m in &tpl.tasks {
                if let Member::Preset(kind) = m {
                    assert!(task_preset(kind).is_some(), "missing task preset {kind}");
                }
            }
        }
        assert!(agent_preset("juggler").is_none());
    }
}
