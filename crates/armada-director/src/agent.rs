//! Agent protocol, as seen from the director.
//!
//! Every VM runs an agent that applies specs, runs lifecycle scripts,
//! starts and stops jobs and manages mounted disks. The wire protocol is
//! not modelled; [`AgentFactory`] hands out a client per agent id.
//!
//! [`DummyAgentHub`] is the in-memory implementation used by tests and
//! by the `dummy` CPI. It records every call and supports failure
//! injection matched against the instance an agent was applied for.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent '{0}' is unresponsive")]
    Unresponsive(String),

    #[error("'{script}' script failed: {message}")]
    ScriptFailed { script: String, message: String },

    #[error("agent call '{method}' failed: {message}")]
    Failed { method: String, message: String },
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Job state reported by `get_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Starting,
    Failing,
    Stopped,
}

/// Lifecycle scripts the director asks an agent to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    PreStart,
    PostStart,
    PreStop,
    PostDeploy,
}

impl Script {
    pub fn as_str(self) -> &'static str {
        match self {
            Script::PreStart => "pre-start",
            Script::PostStart => "post-start",
            Script::PreStop => "pre-stop",
            Script::PostDeploy => "post-deploy",
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait AgentClient: fmt::Debug + Send + Sync {
    async fn apply(&self, spec: &Value) -> AgentResult<()>;

    async fn get_state(&self) -> AgentResult<JobState>;

    async fn run_script(&self, script: Script) -> AgentResult<()>;

    /// Returns how long to wait (seconds) before stopping jobs.
    async fn drain(&self) -> AgentResult<u64>;

    async fn stop(&self) -> AgentResult<()>;

    async fn start(&self) -> AgentResult<()>;

    async fn mount_disk(&self, disk_cid: &str) -> AgentResult<()>;

    async fn unmount_disk(&self, disk_cid: &str) -> AgentResult<()>;

    /// Copy data from the old persistent disk onto the new one.
    async fn migrate_disk(&self, from: &str, to: &str) -> AgentResult<()>;

    /// Compile one package; returns the compiled blob id.
    async fn compile_package(&self, name: &str, version: &str, dependencies: &Value) -> AgentResult<String>;

    async fn delete_arp_entries(&self, ips: &[Ipv4Addr]) -> AgentResult<()>;
}

pub trait AgentFactory: fmt::Debug + Send + Sync {
    fn connect(&self, agent_id: &str) -> Arc<dyn AgentClient>;
}

// ── Dummy implementation ──────────────────────────────────────────

/// One recorded agent call.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    pub agent_id: String,
    /// Instance name (`group/index`) from the last applied spec.
    pub instance: Option<String>,
    pub method: String,
    pub args: Value,
}

#[derive(Debug, Clone)]
struct Failure {
    method: String,
    instance: Option<String>,
    /// `None` fails forever.
    remaining: Option<u32>,
    message: String,
}

#[derive(Debug, Default)]
struct AgentRecord {
    /// `group/index` then `group/uuid`, once a spec has been applied.
    names: Vec<String>,
    running: bool,
    mounted: Vec<String>,
}

#[derive(Debug, Default)]
struct HubState {
    agents: HashMap<String, AgentRecord>,
    calls: Vec<AgentCall>,
    failures: Vec<Failure>,
}

/// In-memory agents, shared by every VM a test creates.
#[derive(Debug, Clone, Default)]
pub struct DummyAgentHub {
    state: Arc<Mutex<HubState>>,
    latency: Duration,
}

impl DummyAgentHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every state-changing call, so concurrent updates overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next call to `method` on `instance` (any instance when
    /// `None`). `instance` matches `group/index` or `group/uuid`.
    pub fn fail_next(&self, method: &str, instance: Option<&str>, message: &str) {
        self.push_failure(method, instance, Some(1), message);
    }

    /// Fail every call to `method` on `instance` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, method: &str, instance: Option<&str>, message: &str) {
        self.push_failure(method, instance, None, message);
    }

    fn push_failure(&self, method: &str, instance: Option<&str>, remaining: Option<u32>, message: &str) {
        self.lock().failures.push(Failure {
            method: method.to_string(),
            instance: instance.map(str::to_string),
            remaining,
            message: message.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, method: &str) -> Vec<AgentCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Disks the agent for `agent_id` currently has mounted.
    pub fn mounted(&self, agent_id: &str) -> Vec<String> {
        self.lock()
            .agents
            .get(agent_id)
            .map(|a| a.mounted.clone())
            .unwrap_or_default()
    }

    fn call(&self, agent_id: &str, method: &str, args: Value) -> Result<MutexGuard<'_, HubState>, String> {
        let mut state = self.lock();
        let names = state.agents.entry(agent_id.to_string()).or_default().names.clone();
        state.calls.push(AgentCall {
            agent_id: agent_id.to_string(),
            instance: names.first().cloned(),
            method: method.to_string(),
            args,
        });

        let pos = state.failures.iter().position(|f| {
            f.method == method && f.instance.as_ref().is_none_or(|want| names.contains(want))
        });
        if let Some(pos) = pos {
            let message = state.failures[pos].message.clone();
            let exhausted = match &mut state.failures[pos].remaining {
                Some(n) => {
                    *n = n.saturating_sub(1);
                    *n == 0
                }
                None => false,
            };
            if exhausted {
                state.failures.remove(pos);
            }
            debug!(agent_id, method, "injected agent failure");
            return Err(message);
        }
        Ok(state)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl AgentFactory for DummyAgentHub {
    fn connect(&self, agent_id: &str) -> Arc<dyn AgentClient> {
        Arc::new(DummyAgent {
            hub: self.clone(),
            agent_id: agent_id.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DummyAgent {
    hub: DummyAgentHub,
    agent_id: String,
}

fn failed(method: &'static str) -> impl FnOnce(String) -> AgentError {
    move |message| AgentError::Failed {
        method: method.to_string(),
        message,
    }
}

#[async_trait]
impl AgentClient for DummyAgent {
    async fn apply(&self, spec: &Value) -> AgentResult<()> {
        self.hub.pause().await;
        {
            // Learn the identity first so failures can match on it.
            let mut state = self.hub.lock();
            let agent = state.agents.entry(self.agent_id.clone()).or_default();
            if let Some(group) = spec["name"].as_str() {
                agent.names.clear();
                if let Some(index) = spec["index"].as_u64() {
                    agent.names.push(format!("{group}/{index}"));
                }
                if let Some(id) = spec["id"].as_str() {
                    agent.names.push(format!("{group}/{id}"));
                }
            }
        }
        self.hub
            .call(&self.agent_id, "apply", spec.clone())
            .map_err(failed("apply"))?;
        Ok(())
    }

    async fn get_state(&self) -> AgentResult<JobState> {
        let state = self
            .hub
            .call(&self.agent_id, "get_state", Value::Null)
            .map_err(|_| AgentError::Unresponsive(self.agent_id.clone()))?;
        let running = state.agents.get(&self.agent_id).is_some_and(|a| a.running);
        Ok(if running { JobState::Running } else { JobState::Stopped })
    }

    async fn run_script(&self, script: Script) -> AgentResult<()> {
        self.hub
            .call(&self.agent_id, script.as_str(), Value::Null)
            .map_err(|message| AgentError::ScriptFailed {
                script: script.to_string(),
                message,
            })?;
        Ok(())
    }

    async fn drain(&self) -> AgentResult<u64> {
        self.hub.pause().await;
        self.hub
            .call(&self.agent_id, "drain", Value::Null)
            .map_err(failed("drain"))?;
        Ok(0)
    }

    async fn stop(&self) -> AgentResult<()> {
        self.hub.pause().await;
        let mut state = self
            .hub
            .call(&self.agent_id, "stop", Value::Null)
            .map_err(failed("stop"))?;
        if let Some(a) = state.agents.get_mut(&self.agent_id) {
            a.running = false;
        }
        Ok(())
    }

    async fn start(&self) -> AgentResult<()> {
        self.hub.pause().await;
        let mut state = self
            .hub
            .call(&self.agent_id, "start", Value::Null)
            .map_err(failed("start"))?;
        if let Some(a) = state.agents.get_mut(&self.agent_id) {
            a.running = true;
        }
        Ok(())
    }

    async fn mount_disk(&self, disk_cid: &str) -> AgentResult<()> {
        let mut state = self
            .hub
            .call(&self.agent_id, "mount_disk", json!({"disk_cid": disk_cid}))
            .map_err(failed("mount_disk"))?;
        if let Some(a) = state.agents.get_mut(&self.agent_id)
            && !a.mounted.iter().any(|d| d == disk_cid)
        {
            a.mounted.push(disk_cid.to_string());
        }
        Ok(())
    }

    async fn unmount_disk(&self, disk_cid: &str) -> AgentResult<()> {
        let mut state = self
            .hub
            .call(&self.agent_id, "unmount_disk", json!({"disk_cid": disk_cid}))
            .map_err(failed("unmount_disk"))?;
        if let Some(a) = state.agents.get_mut(&self.agent_id) {
            a.mounted.retain(|d| d != disk_cid);
        }
        Ok(())
    }

    async fn migrate_disk(&self, from: &str, to: &str) -> AgentResult<()> {
        self.hub
            .call(&self.agent_id, "migrate_disk", json!({"from": from, "to": to}))
            .map_err(failed("migrate_disk"))?;
        Ok(())
    }

    async fn compile_package(&self, name: &str, version: &str, dependencies: &Value) -> AgentResult<String> {
        self.hub.pause().await;
        self.hub
            .call(
                &self.agent_id,
                "compile_package",
                json!({"name": name, "version": version, "dependencies": dependencies}),
            )
            .map_err(failed("compile_package"))?;
        Ok(format!("blob-{name}-{version}-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn delete_arp_entries(&self, ips: &[Ipv4Addr]) -> AgentResult<()> {
        self.hub
            .call(&self.agent_id, "delete_arp_entries", json!({"ips": ips}))
            .map_err(failed("delete_arp_entries"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn applied(hub: &DummyAgentHub, agent_id: &str, group: &str, index: u64) -> Arc<dyn AgentClient> {
        let agent = hub.connect(agent_id);
        agent
            .apply(&json!({"name": group, "index": index, "id": format!("uuid-{index}")}))
            .await
            .unwrap();
        agent
    }

    #[tokio::test]
    async fn start_stop_drive_reported_state() {
        let hub = DummyAgentHub::new();
        let agent = applied(&hub, "agent-1", "web", 0).await;
        assert_eq!(agent.get_state().await.unwrap(), JobState::Stopped);
        agent.start().await.unwrap();
        assert_eq!(agent.get_state().await.unwrap(), JobState::Running);
        agent.stop().await.unwrap();
        assert_eq!(agent.get_state().await.unwrap(), JobState::Stopped);
        assert_eq!(hub.calls_of("start").len(), 1);
        assert_eq!(hub.calls_of("start")[0].instance.as_deref(), Some("web/0"));
    }

    #[tokio::test]
    async fn failures_match_instance_by_index_or_uuid() {
        let hub = DummyAgentHub::new();
        let web0 = applied(&hub, "agent-0", "web", 0).await;
        let web1 = applied(&hub, "agent-1", "web", 1).await;

        hub.fail_next("post-start", Some("web/1"), "exit 1");
        web0.run_script(Script::PostStart).await.unwrap();
        let err = web1.run_script(Script::PostStart).await.unwrap_err();
        assert_eq!(
            err,
            AgentError::ScriptFailed {
                script: "post-start".into(),
                message: "exit 1".into()
            }
        );
        // One-shot.
        web1.run_script(Script::PostStart).await.unwrap();

        hub.fail_always("pre-stop", Some("web/uuid-0"), "busy");
        assert!(web0.run_script(Script::PreStop).await.is_err());
        assert!(web0.run_script(Script::PreStop).await.is_err());
        hub.clear_failures();
        web0.run_script(Script::PreStop).await.unwrap();
    }

    #[tokio::test]
    async fn mounts_are_tracked() {
        let hub = DummyAgentHub::new();
        let agent = hub.connect("agent-9");
        agent.mount_disk("disk-1").await.unwrap();
        agent.mount_disk("disk-2").await.unwrap();
        agent.unmount_disk("disk-1").await.unwrap();
        assert_eq!(hub.mounted("agent-9"), vec!["disk-2".to_string()]);
    }
}
