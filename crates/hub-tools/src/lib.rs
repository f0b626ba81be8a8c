//! Executes the three tools exposed to the LLM: `search_skills`,
//! `describe_function`, and `python_exec`.
//!
//! The first two are pure reads served entirely in-process from
//! [`hub_skills`]. `python_exec` is always forwarded to a Spoke — the
//! Hub never evaluates user-provided Python itself — through whatever
//! implements [`ToolForwarder`].

pub mod cache;
pub mod route;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hub_domain::error::{Error, Result};
use hub_domain::tool::{DESCRIBE_FUNCTION, PYTHON_EXEC, SEARCH_SKILLS};
use hub_skills::{DevicePresence, SkillRegistry};
use hub_store::Db;

pub use cache::ToolCache;

/// Forwards a `python_exec` call to the Spoke hosting the target device.
/// Implemented by whatever owns the Spoke channel registry (outside this
/// crate, to avoid a dependency on its transport).
#[async_trait]
pub trait ToolForwarder: Send + Sync {
    async fn forward_tool_call(
        &self,
        device_id: &str,
        tool_name: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value>;
}

pub struct ToolOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub cached: bool,
}

impl ToolOutcome {
    fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            cached: false,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
            cached: false,
        }
    }

    fn cached(mut self) -> Self {
        self.cached = true;
        self
    }
}

pub struct ToolTimeouts {
    pub search_secs: u64,
    pub describe_secs: u64,
    pub exec_secs: u64,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            search_secs: 5,
            describe_secs: 5,
            exec_secs: 30,
        }
    }
}

pub struct ToolDispatcher {
    db: Arc<Db>,
    skills: Arc<SkillRegistry>,
    timeouts: ToolTimeouts,
}

impl ToolDispatcher {
    pub fn new(db: Arc<Db>, skills: Arc<SkillRegistry>, timeouts: ToolTimeouts) -> Self {
        Self { db, skills, timeouts }
    }

    /// Dispatch one LLM tool call. `cache` is scoped to the enclosing
    /// turn; `forwarder` reaches the Spoke channel for `python_exec`.
    pub async fn dispatch(
        &self,
        user_id: &str,
        caller_device_id: &str,
        tool_name: &str,
        arguments: Value,
        cache: &ToolCache,
        presence: &dyn DevicePresence,
        forwarder: &dyn ToolForwarder,
    ) -> ToolOutcome {
        if let Some(cached) = cache.get(tool_name, &arguments) {
            return ToolOutcome::ok(cached).cached();
        }

        let outcome = match tool_name {
            SEARCH_SKILLS => self.search_skills(user_id, caller_device_id, &arguments, presence),
            DESCRIBE_FUNCTION => self.describe_function(user_id, &arguments, presence),
            PYTHON_EXEC => {
                self.python_exec(user_id, caller_device_id, &arguments, forwarder)
                    .await
            }
            other => ToolOutcome::err(format!("unknown tool: {other}")),
        };

        if outcome.success {
            if let Some(result) = &outcome.result {
                cache.insert(tool_name, &arguments, result.clone());
            }
        }
        outcome
    }

    fn search_skills(
        &self,
        user_id: &str,
        caller_device_id: &str,
        arguments: &Value,
        presence: &dyn DevicePresence,
    ) -> ToolOutcome {
        let query = arguments.get("query").and_then(Value::as_str).unwrap_or("");
        let hits = match self
            .skills
            .search(user_id, query, Some(caller_device_id), presence)
        {
            Ok(h) => h,
            Err(e) => return ToolOutcome::err(e.to_string()),
        };

        // Group identical (class, method) pairs across devices into one
        // entry, per the search_skills tool's compact result shape.
        let mut grouped: BTreeMap<(String, String), (String, String, Vec<String>)> = BTreeMap::new();
        for hit in hits {
            let key = (hit.skill.class_name.clone(), hit.skill.method_name.clone());
            grouped
                .entry(key)
                .and_modify(|(_, _, devices)| devices.push(hit.device_display_name.clone()))
                .or_insert_with(|| {
                    (hit.skill.signature.clone(), hit.skill.docstring.clone(), vec![hit.device_display_name.clone()])
                });
        }

        let results: Vec<Value> = grouped
            .into_iter()
            .map(|((class_name, method_name), (signature, summary, devices))| {
                json!({
                    "path": format!("{class_name}.{method_name}"),
                    "signature": signature,
                    "summary": summary,
                    "devices": devices,
                })
            })
            .collect();

        ToolOutcome::ok(json!({ "results": results }))
    }

    fn describe_function(
        &self,
        user_id: &str,
        arguments: &Value,
        presence: &dyn DevicePresence,
    ) -> ToolOutcome {
        let path = arguments.get("path").and_then(Value::as_str).unwrap_or("");
        match self.skills.describe(user_id, path, presence) {
            Ok(Some(hit)) => ToolOutcome::ok(json!({
                "path": path,
                "signature": hit.skill.signature,
                "docstring": hit.skill.docstring,
            })),
            Ok(None) => ToolOutcome::err(format!("no live function at {path}")),
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }

    async fn python_exec(
        &self,
        user_id: &str,
        caller_device_id: &str,
        arguments: &Value,
        forwarder: &dyn ToolForwarder,
    ) -> ToolOutcome {
        let code = arguments.get("code").and_then(Value::as_str).unwrap_or("");
        let explicit_device = arguments.get("device").and_then(Value::as_str);

        let target_device_id = match self.resolve_target(user_id, caller_device_id, code, explicit_device) {
            Ok(id) => id,
            Err(e) => return ToolOutcome::err(e.to_string()),
        };

        let deadline = Duration::from_secs(self.timeouts.exec_secs);
        match forwarder
            .forward_tool_call(&target_device_id, PYTHON_EXEC, arguments.clone(), deadline)
            .await
        {
            Ok(result) => ToolOutcome::ok(result),
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }

    /// Priority: an explicit `device` argument, then a `devices.<Name>...`
    /// reference found in the code, then the caller's own device.
    fn resolve_target(
        &self,
        user_id: &str,
        caller_device_id: &str,
        code: &str,
        explicit_device: Option<&str>,
    ) -> Result<String> {
        let display_name = explicit_device
            .map(str::to_string)
            .or_else(|| route::extract_target_display_name(code));

        match display_name {
            None => Ok(caller_device_id.to_string()),
            Some(name) => {
                let conn = self.db.lock();
                hub_store::devices::find_by_display_name(&conn, user_id, &name)?
                    .map(|d| d.id)
                    .ok_or_else(|| Error::NotFound(format!("device {name}")))
            }
        }
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.search_secs)
    }

    pub fn describe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.describe_secs)
    }
}
