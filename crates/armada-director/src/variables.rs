//! Variable resolution and version pinning.
//!
//! Every deploy resolves the manifest's `((placeholders))` against the
//! secret store and pins the exact version ids in a new variable set.
//! Instances remember the set they last converged with, so a value that
//! changes in the store only reaches an instance when it is redeployed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use armada_core::manifest::VariableDefinition;
use armada_core::placeholder;
use armada_state::{
    Mutation, PinnedVariable, RevisionStatus, StateStore, VariableSetRecord, now_epoch,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{DirectorError, DirectorResult};

/// One immutable version of a secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretVersion {
    pub id: String,
    pub path: String,
    pub value: Value,
}

/// External, versioned secret store.
#[async_trait]
pub trait SecretStore: fmt::Debug + Send + Sync {
    /// Latest version at `path`.
    async fn get(&self, path: &str) -> DirectorResult<Option<SecretVersion>>;

    async fn get_by_id(&self, id: &str) -> DirectorResult<Option<SecretVersion>>;

    /// Write a new version.
    async fn put(&self, path: &str, value: Value) -> DirectorResult<SecretVersion>;

    /// Generate a new version of the given variable type.
    async fn generate(&self, path: &str, kind: &str, options: &Value) -> DirectorResult<SecretVersion>;

    async fn delete(&self, path: &str) -> DirectorResult<()>;
}

#[derive(Debug, Default)]
struct SecretState {
    next_id: u64,
    latest: HashMap<String, String>,
    versions: HashMap<String, SecretVersion>,
}

/// In-process secret store.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    state: Arc<Mutex<SecretState>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SecretState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, path: &str, value: Value) -> SecretVersion {
        let mut state = self.lock();
        state.next_id += 1;
        let version = SecretVersion {
            id: state.next_id.to_string(),
            path: path.to_string(),
            value,
        };
        state.latest.insert(path.to_string(), version.id.clone());
        state.versions.insert(version.id.clone(), version.clone());
        version
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, path: &str) -> DirectorResult<Option<SecretVersion>> {
        let state = self.lock();
        Ok(state
            .latest
            .get(path)
            .and_then(|id| state.versions.get(id))
            .cloned())
    }

    async fn get_by_id(&self, id: &str) -> DirectorResult<Option<SecretVersion>> {
        Ok(self.lock().versions.get(id).cloned())
    }

    async fn put(&self, path: &str, value: Value) -> DirectorResult<SecretVersion> {
        Ok(self.insert(path, value))
    }

    async fn generate(&self, path: &str, kind: &str, options: &Value) -> DirectorResult<SecretVersion> {
        let value = match kind {
            "password" => {
                let length = options
                    .get("length")
                    .and_then(Value::as_u64)
                    .unwrap_or(20)
                    .clamp(1, 64) as usize;
                let mut password = String::new();
                while password.len() < length {
                    password.push_str(&uuid::Uuid::new_v4().simple().to_string());
                }
                password.truncate(length);
                Value::String(password)
            }
            other => {
                return Err(DirectorError::Secret(format!(
                    "cannot generate '{path}': variable type '{other}' is not supported"
                )));
            }
        };
        debug!(%path, kind, "generated secret");
        Ok(self.insert(path, value))
    }

    async fn delete(&self, path: &str) -> DirectorResult<()> {
        self.lock().latest.remove(path);
        Ok(())
    }
}

/// `cert.ca` → (`cert`, Some(`ca`)).
fn split_field(name: &str) -> (&str, Option<&str>) {
    match name.split_once('.') {
        Some((base, field)) => (base, Some(field)),
        None => (name, None),
    }
}

/// Resolves, pins and garbage-collects variable sets.
#[derive(Debug, Clone)]
pub struct VariableTracker {
    store: StateStore,
    secrets: Arc<dyn SecretStore>,
    director: String,
}

impl VariableTracker {
    pub fn new(store: StateStore, secrets: Arc<dyn SecretStore>, director: &str) -> Self {
        Self {
            store,
            secrets,
            director: director.to_string(),
        }
    }

    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    /// Absolute store path: names starting with `/` are used as-is,
    /// everything else lives under `/<director>/<deployment>/`.
    pub fn path_for(&self, deployment: &str, name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}/{deployment}/{name}", self.director)
        }
    }

    fn definitions(manifest: &Value) -> DirectorResult<Vec<VariableDefinition>> {
        match manifest.get("variables") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| DirectorError::Validation(format!("invalid variables section: {e}"))),
        }
    }

    /// Resolve every placeholder and defined variable in the raw manifest
    /// and pin the versions in a new variable set.
    pub async fn resolve(&self, deployment: &str, manifest: &Value) -> DirectorResult<VariableSetRecord> {
        let mut record = self.preview(deployment, manifest).await?;
        record.id = self.store.next_sequence("variable_set")?;
        self.store.apply(&[Mutation::PutVariableSet(record.clone())])?;
        info!(%deployment, set = record.id, variables = record.variables.len(), "pinned variable set");
        Ok(record)
    }

    /// Like [`resolve`](Self::resolve) but nothing is pinned: the returned
    /// set has id 0 and is not stored. Missing defined variables are still
    /// generated.
    pub async fn preview(&self, deployment: &str, manifest: &Value) -> DirectorResult<VariableSetRecord> {
        let definitions = Self::definitions(manifest)?;
        let mut names: BTreeSet<String> = placeholder::scan(manifest)
            .iter()
            .map(|n| split_field(n).0.to_string())
            .collect();
        names.extend(definitions.iter().map(|d| d.name.clone()));

        let mut variables = BTreeMap::new();
        for name in names {
            let path = self.path_for(deployment, &name);
            let version = match self.secrets.get(&path).await? {
                Some(v) => v,
                None => match definitions.iter().find(|d| d.name == name) {
                    Some(def) => self.secrets.generate(&path, &def.kind, &def.options).await?,
                    None => {
                        return Err(DirectorError::Validation(format!(
                            "failed to find variable '{path}' from config server: doesn't exist"
                        )));
                    }
                },
            };
            variables.insert(
                path.clone(),
                PinnedVariable {
                    path,
                    version_id: version.id,
                },
            );
        }

        Ok(VariableSetRecord {
            deployment: deployment.to_string(),
            id: 0,
            variables,
            created_at: now_epoch(),
        })
    }

    /// Placeholder values for `manifest` as pinned in `set`.
    pub async fn values(
        &self,
        manifest: &Value,
        set: &VariableSetRecord,
    ) -> DirectorResult<BTreeMap<String, Value>> {
        let mut values = BTreeMap::new();
        for name in placeholder::scan(manifest) {
            let (base, field) = split_field(&name);
            let path = self.path_for(&set.deployment, base);
            let pinned = set.variables.get(&path).ok_or_else(|| {
                DirectorError::Validation(format!(
                    "variable '{path}' is not pinned in variable set {}",
                    set.id
                ))
            })?;
            let version = self
                .secrets
                .get_by_id(&pinned.version_id)
                .await?
                .ok_or_else(|| {
                    DirectorError::Secret(format!(
                        "version '{}' of '{path}' no longer exists",
                        pinned.version_id
                    ))
                })?;
            let value = match field {
                None => version.value,
                Some(field) => version.value.get(field).cloned().ok_or_else(|| {
                    DirectorError::Validation(format!("variable '{path}' has no field '{field}'"))
                })?,
            };
            values.insert(name, value);
        }
        Ok(values)
    }

    /// Interpolate `manifest` with the versions pinned in `set`.
    pub async fn interpolate(&self, manifest: &Value, set: &VariableSetRecord) -> DirectorResult<Value> {
        let values = self.values(manifest, set).await?;
        Ok(placeholder::interpolate(manifest, &values)?)
    }

    pub fn get_set(&self, deployment: &str, id: u64) -> DirectorResult<VariableSetRecord> {
        self.store
            .get_variable_set(deployment, id)?
            .ok_or_else(|| DirectorError::not_found("variable set", format!("{deployment}/{id}")))
    }

    /// Drop variable sets nothing references any more.
    ///
    /// Only runs after a fully successful deploy. Keeps the latest
    /// revision's set and every set still referenced by an instance;
    /// revisions pointing at dropped sets are collapsed away.
    pub fn collect_garbage(&self, deployment: &str) -> DirectorResult<usize> {
        let Some(mut record) = self.store.get_deployment(deployment)? else {
            return Ok(0);
        };
        let Some(latest) = record.latest_revision().cloned() else {
            return Ok(0);
        };
        if latest.status != RevisionStatus::Succeeded {
            debug!(%deployment, "latest revision not successful; keeping variable sets");
            return Ok(0);
        }

        let mut keep: BTreeSet<u64> = self
            .store
            .list_instances(deployment)?
            .iter()
            .filter_map(|i| i.variable_set)
            .collect();
        keep.insert(latest.variable_set);
        keep.extend(
            record
                .revisions
                .iter()
                .filter(|r| r.status == RevisionStatus::InProgress)
                .map(|r| r.variable_set),
        );

        record
            .revisions
            .retain(|r| r.id == latest.id || keep.contains(&r.variable_set));

        let mut writes = vec![Mutation::PutDeployment(record)];
        let mut dropped = 0;
        for set in self.store.list_variable_sets(deployment)? {
            if !keep.contains(&set.id) {
                writes.push(Mutation::DeleteVariableSet {
                    deployment: deployment.to_string(),
                    id: set.id,
                });
                dropped += 1;
            }
        }
        self.store.apply(&writes)?;
        if dropped > 0 {
            info!(%deployment, dropped, kept = keep.len(), "garbage-collected variable sets");
        }
        Ok(dropped)
    }

    /// Writes removing every variable set of a deployment.
    pub fn delete_all(&self, deployment: &str) -> DirectorResult<Vec<Mutation>> {
        Ok(self
            .store
            .list_variable_sets(deployment)?
            .into_iter()
            .map(|s| Mutation::DeleteVariableSet {
                deployment: deployment.to_string(),
                id: s.id,
            })
            .collect())
    }
}
