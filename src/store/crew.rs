//! Crew, agent, task and template collections.
//!
//! Each collection mirrors one REST resource. Mutations go to the service
//! first; when it is unreachable the configured [`FallbackPolicy`] decides
//! whether the change is applied locally or the error is returned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{FallbackPolicy, Origin, StoreError, Synced};
use crate::api::{ApiError, CrewApi, Kind};
use crate::model::crew::{
    agent_preset, builtin_templates, canonicalize_agent, canonicalize_crew, canonicalize_task,
    canonicalize_template, task_preset,
};
use crate::model::{merge_patch, new_id, Agent, Crew, Member, Task, Template};
use crate::storage::{self, Pool};

/// A record kept in a [`Collection`].
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: Kind;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);

    /// Rename legacy keys of a raw object in place.
    fn canonicalize(map: &mut Map<String, Value>);

    /// Stamp timestamps on a local mutation.
    fn touch(&mut self, _now: DateTime<Utc>, _created: bool) {}

    fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Object(mut map) => {
                Self::canonicalize(&mut map);
                serde_json::from_value(Value::Object(map))
            }
            other => serde_json::from_value(other),
        }
    }
}

impl Entity for Crew {
    const KIND: Kind = Kind::Crews;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn canonicalize(map: &mut Map<String, Value>) {
        canonicalize_crew(map);
    }

    fn touch(&mut self, now: DateTime<Utc>, created: bool) {
        if created {
            self.created_at = Some(now);
        }
        self.updated_at = Some(now);
    }
}

impl Entity for Agent {
    const KIND: Kind = Kind::Agents;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn canonicalize(map: &mut Map<String, Value>) {
        canonicalize_agent(map);
    }
}

impl Entity for Task {
    const KIND: Kind = Kind::Tasks;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn canonicalize(map: &mut Map<String, Value>) {
        canonicalize_task(map);
    }
}

impl Entity for Template {
    const KIND: Kind = Kind::Templates;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn canonicalize(map: &mut Map<String, Value>) {
        canonicalize_template(map);
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// In-memory list of one entity kind, synced with the service.
pub struct Collection<T: Entity> {
    api: Arc<dyn CrewApi>,
    fallback: FallbackPolicy,
    pool: Option<Pool>,
    items: RwLock<Vec<T>>,
}

impl<T: Entity> Collection<T> {
    pub fn new(api: Arc<dyn CrewApi>, fallback: FallbackPolicy, pool: Option<Pool>) -> Self {
        Self {
            api,
            fallback,
            pool,
            items: RwLock::new(Vec::new()),
        }
    }

    /// Load the stored list, if any.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let items: Vec<T> = storage::load_entities(pool, T::KIND)?;
        let count = items.len();
        *self.items.write().await = items;
        Ok(count)
    }

    pub async fn list(&self) -> Vec<T> {
        self.items.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        self.items.read().await.iter().find(|i| i.id() == id).cloned()
    }

    /// Replace the local list with the server's.
    pub async fn fetch(&self) -> Result<Synced<Vec<T>>, StoreError> {
        let raw = match self.api.list(T::KIND).await {
            Ok(raw) => raw,
            Err(e) if self.falls_back(&e) => {
                warn!(kind = %T::KIND, error = %e, "service unreachable, keeping stored list");
                return Ok(Synced::local(self.list().await));
            }
            Err(e) => return Err(e.into()),
        };
        let items: Vec<T> = raw
            .into_iter()
            .filter_map(|v| match T::from_json(v) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(kind = %T::KIND, error = %e, "skipping unreadable item");
                    None
                }
            })
            .collect();
        debug!(kind = %T::KIND, count = items.len(), "fetched");
        *self.items.write().await = items.clone();
        self.persist().await;
        Ok(Synced::remote(items))
    }

    pub async fn create(&self, mut item: T) -> Result<Synced<T>, StoreError> {
        let mut body = serde_json::to_value(&item).map_err(|e| self.merge_error(item.id(), e))?;
        if item.id().is_empty() {
            if let Value::Object(map) = &mut body {
                map.remove("id");
            }
        }
        let path = T::KIND.path();
        match self.api.create(T::KIND, &body).await {
            Ok(raw) => {
                let created = T::from_json(raw).map_err(|e| decode(path, e))?;
                if created.id().is_empty() {
                    return Err(decode(path, "response has no id"));
                }
                info!(kind = %T::KIND, id = %created.id(), "created");
                self.items.write().await.push(created.clone());
                self.persist().await;
                Ok(Synced::remote(created))
            }
            Err(e) if self.falls_back(&e) => {
                warn!(kind = %T::KIND, error = %e, "service unreachable, creating locally");
                if item.id().is_empty() {
                    item.set_id(new_id());
                }
                item.touch(Utc::now(), true);
                self.items.write().await.push(item.clone());
                self.persist().await;
                Ok(Synced::local(item))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shallow-merge `patch` into the item with `id`.
    pub async fn update(&self, id: &str, patch: Map<String, Value>) -> Result<Synced<T>, StoreError> {
        let mut patch = patch;
        T::canonicalize(&mut patch);
        patch.remove("id");

        match self.api.update(T::KIND, id, &Value::Object(patch.clone())).await {
            Ok(raw) => {
                let updated = T::from_json(raw).map_err(|e| decode(T::KIND.path(), e))?;
                info!(kind = %T::KIND, %id, "updated");
                self.replace(id, updated.clone()).await;
                Ok(Synced::remote(updated))
            }
            Err(e) if self.falls_back(&e) => {
                warn!(kind = %T::KIND, %id, error = %e, "service unreachable, updating locally");
                let current = self.get(id).await.ok_or_else(|| self.not_found(id))?;
                let mut updated: T = merge_patch(&current, &patch).map_err(|e| self.merge_error(id, e))?;
                updated.touch(Utc::now(), false);
                self.replace(id, updated.clone()).await;
                Ok(Synced::local(updated))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<Origin, StoreError> {
        let origin = match self.api.delete(T::KIND, id).await {
            Ok(()) => Origin::Remote,
            Err(e) if self.falls_back(&e) => {
                warn!(kind = %T::KIND, %id, error = %e, "service unreachable, deleting locally");
                Origin::Local
            }
            Err(e) => return Err(e.into()),
        };
        let removed = {
            let mut items = self.items.write().await;
            let before = items.len();
            items.retain(|i| i.id() != id);
            items.len() != before
        };
        if removed {
            self.persist().await;
        }
        info!(kind = %T::KIND, %id, ?origin, "deleted");
        Ok(origin)
    }

    /// Add an item without contacting the service.
    pub async fn insert_local(&self, item: T) {
        self.items.write().await.push(item);
        self.persist().await;
    }

    /// Change one item locally. Returns the updated item.
    pub async fn modify<F>(&self, id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut T),
    {
        let updated = {
            let mut items = self.items.write().await;
            let item = items.iter_mut().find(|i| i.id() == id)?;
            f(item);
            item.clone()
        };
        self.persist().await;
        Some(updated)
    }

    async fn replace(&self, id: &str, item: T) {
        {
            let mut items = self.items.write().await;
            match items.iter_mut().find(|i| i.id() == id) {
                Some(slot) => *slot = item,
                None => items.push(item),
            }
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(pool) = &self.pool else {
            return;
        };
        let rows: Vec<(String, T)> = self
            .items
            .read()
            .await
            .iter()
            .map(|i| (i.id().to_string(), i.clone()))
            .collect();
        if let Err(e) = storage::replace_entities(pool, T::KIND, &rows) {
            warn!(kind = %T::KIND, error = %e, "failed to persist collection");
        }
    }

    fn falls_back(&self, e: &ApiError) -> bool {
        e.is_transport() && self.fallback == FallbackPolicy::Local
    }

    fn not_found(&self, id: &str) -> StoreError {
        StoreError::NotFound {
            kind: T::KIND.noun(),
            id: id.to_string(),
        }
    }

    fn merge_error(&self, id: &str, e: serde_json::Error) -> StoreError {
        StoreError::Merge {
            kind: T::KIND.noun(),
            id: id.to_string(),
            reason: e.to_string(),
        }
    }
}

fn decode(path: &str, reason: impl ToString) -> StoreError {
    StoreError::Api(ApiError::Decode {
        path: path.to_string(),
        reason: reason.to_string(),
    })
}

// ---------------------------------------------------------------------------
// CrewStore
// ---------------------------------------------------------------------------

pub struct CrewStore {
    pub crews: Collection<Crew>,
    pub agents: Collection<Agent>,
    pub tasks: Collection<Task>,
    pub templates: Collection<Template>,
    api: Arc<dyn CrewApi>,
}

impl CrewStore {
    pub fn new(api: Arc<dyn CrewApi>, fallback: FallbackPolicy, pool: Option<Pool>) -> Self {
        Self {
            crews: Collection::new(api.clone(), fallback, pool.clone()),
            agents: Collection::new(api.clone(), fallback, pool.clone()),
            tasks: Collection::new(api.clone(), fallback, pool.clone()),
            templates: Collection::new(api.clone(), fallback, pool),
            api,
        }
    }

    /// Load every stored collection.
    pub async fn load(&self) -> anyhow::Result<()> {
        let crews = self.crews.load().await?;
        let agents = self.agents.load().await?;
        let tasks = self.tasks.load().await?;
        let templates = self.templates.load().await?;
        debug!(crews, agents, tasks, templates, "loaded stored collections");
        Ok(())
    }

    /// Fetched templates followed by the built-in ones they don't shadow.
    pub async fn all_templates(&self) -> Vec<Template> {
        let mut all = self.templates.list().await;
        for builtin in builtin_templates() {
            if !all.iter().any(|t| t.id == builtin.id) {
                all.push(builtin);
            }
        }
        all
    }

    pub async fn template(&self, id: &str) -> Option<Template> {
        self.all_templates().await.into_iter().find(|t| t.id == id)
    }

    /// Find a crew by id, or failing that by exact name.
    pub async fn find_crew(&self, key: &str) -> Option<Crew> {
        let crews = self.crews.list().await;
        crews
            .iter()
            .find(|c| c.id == key)
            .or_else(|| crews.iter().find(|c| c.name == key))
            .cloned()
    }

    /// Build a crew from `template` with fresh member ids and keep it locally.
    pub async fn crew_from_template(&self, template: &Template, name: Option<&str>) -> Crew {
        let agents = template
            .agents
            .iter()
            .filter_map(|m| match m {
                Member::Preset(kind) => agent_preset(kind).or_else(|| {
                    warn!(template = %template.id, %kind, "unknown agent preset skipped");
                    None
                }),
                Member::Inline(agent) => Some(Agent {
                    id: new_id(),
                    ..agent.clone()
                }),
            })
            .collect();
        let tasks = template
            .tasks
            .iter()
            .filter_map(|m| match m {
                Member::Preset(kind) => task_preset(kind).or_else(|| {
                    warn!(template = %template.id, %kind, "unknown task preset skipped");
                    None
                }),
                Member::Inline(task) => Some(Task {
                    id: new_id(),
                    ..task.clone()
                }),
            })
            .collect();

        let now = Utc::now();
        let crew = Crew {
            id: new_id(),
            name: name.map(str::to_string).unwrap_or_else(|| template.name.clone()),
            description: template.description.clone(),
            category: template.category.clone(),
            agents,
            tasks,
            created_at: Some(now),
            updated_at: Some(now),
            ..Crew::default()
        };
        info!(template = %template.id, crew_id = %crew.id, "crew created from template");
        self.crews.insert_local(crew.clone()).await;
        crew
    }

    /// Server-side export document for a crew.
    pub async fn export_crew(&self, id: &str) -> Result<Value, StoreError> {
        Ok(self.api.export_crew(id).await?)
    }

    /// Hand an exported crew to the service and keep the crew it returns.
    pub async fn import_crew(&self, document: &Value) -> Result<Crew, StoreError> {
        let raw = self.api.import_crew(document).await?;
        let crew = Crew::from_json(raw).map_err(|e| decode("crews/import", e))?;
        info!(crew_id = %crew.id, name = %crew.name, "crew imported");
        self.crews.insert_local(crew.clone()).await;
        Ok(crew)
    }

    /// Count a launch against the crew. Unknown ids are ignored.
    pub async fn record_execution(&self, crew_id: &str) -> Option<Crew> {
        let now = Utc::now();
        self.crews
            .modify(crew_id, |crew| {
                crew.executions += 1;
                crew.last_executed = Some(now);
            })
            .await
    }
}

/// Human-readable problems with a crew definition, empty when valid.
pub fn validate(crew: &Crew) -> Vec<String> {
    fn missing(s: &str) -> bool {
        s.trim().is_empty()
    }

    let mut errors = Vec::new();
    if missing(&crew.name) {
        errors.push("Crew name is required".to_string());
    }
    if crew.agents.is_empty() {
        errors.push("At least one agent is required".to_string());
    }
    if crew.tasks.is_empty() {
        errors.push("At least one task is required".to_string());
    }
    for (i, agent) in crew.agents.iter().enumerate() {
        let n = i + 1;
        if missing(&agent.name) {
            errors.push(format!("Agent {} name is required", n));
        }
        if missing(&agent.role) {
            errors.push(format!("Agent {} role is required", n));
        }
        if missing(&agent.goal) {
            errors.push(format!("Agent {} goal is required", n));
        }
    }
    for (i, task) in crew.tasks.iter().enumerate() {
        let n = i + 1;
        if missing(&task.description) {
            errors.push(format!("Task {} description is required", n));
        }
        if missing(&task.expected_output) {
            errors.push(format!("Task {} expected output is required", n));
        }
    }
    errors
}
