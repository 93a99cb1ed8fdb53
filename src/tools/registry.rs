use std::sync::{Arc, LazyLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::access::{Caller, Permission};
use super::handler::{is_soft_error, Tool};
use crate::error::{RegistryError, ToolError};

/// Argument every offered tool must carry: a short reason for the call.
pub const JUSTIFICATION_ARG: &str = "justification";

/// Name of the built-in tool for paging through buffered tool output.
pub const READ_TOOL_OUTPUT: &str = "read_tool_output";

static TOOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

/// Metadata attached to a tool at registration.
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    pub category: String,
    pub dependencies: Vec<String>,
    pub permissions: Vec<Permission>,
    pub tags: Vec<String>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            category: "general".into(),
            dependencies: Vec::new(),
            permissions: Vec::new(),
            tags: Vec::new(),
        }
    }
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn depends_on(mut self, tool: impl Into<String>) -> Self {
        self.dependencies.push(tool.into());
        self
    }

    pub fn requires(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Running counters for one tool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolStats {
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration_ms: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct ToolRegistration {
    pub tool: Arc<dyn Tool>,
    pub category: String,
    pub dependencies: Vec<String>,
    pub permissions: Vec<Permission>,
    pub tags: Vec<String>,
    pub enabled: bool,
    pub registered_at: DateTime<Utc>,
    pub stats: ToolStats,
}

impl ToolRegistration {
    pub fn name(&self) -> &str {
        self.tool.name()
    }
}

/// Catalog of callable tools. Validates registrations, derives the schemas
/// offered to the model, and runs tools with permission and dependency
/// checks while keeping per-tool statistics.
pub struct ToolRegistry {
    tools: Vec<ToolRegistration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register_tool(
        &mut self,
        tool: impl Tool + 'static,
        options: RegisterOptions,
    ) -> Result<(), RegistryError> {
        self.register_shared(Arc::new(tool), options)
    }

    /// Register an already shared tool instance.
    pub fn register_shared(
        &mut self,
        tool: Arc<dyn Tool>,
        options: RegisterOptions,
    ) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if !TOOL_NAME_RE.is_match(&name) {
            return Err(RegistryError::InvalidTool(format!(
                "name {name:?} must be 1-64 characters of [A-Za-z0-9_-]"
            )));
        }
        if name == READ_TOOL_OUTPUT {
            return Err(RegistryError::InvalidTool(format!("{name} is reserved")));
        }
        if tool.description().trim().is_empty() {
            return Err(RegistryError::InvalidTool(format!("{name} has no description")));
        }
        if self.contains(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        if let Some(missing) = options.dependencies.iter().find(|d| !self.contains(d)) {
            return Err(RegistryError::UnresolvedDependency {
                tool: name,
                dependency: missing.clone(),
            });
        }

        debug!(tool = %name, category = %options.category, "tool registered");
        self.tools.push(ToolRegistration {
            tool,
            category: options.category,
            dependencies: options.dependencies,
            permissions: options.permissions,
            tags: options.tags,
            enabled: true,
            registered_at: Utc::now(),
            stats: ToolStats::default(),
        });
        Ok(())
    }

    /// Remove a tool. Refused while other tools depend on it.
    pub fn unregister_tool(&mut self, name: &str) -> Result<(), RegistryError> {
        let index = self
            .position(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let dependents: Vec<String> = self
            .tools
            .iter()
            .filter(|t| t.dependencies.iter().any(|d| d == name))
            .map(|t| t.name().to_string())
            .collect();
        if !dependents.is_empty() {
            return Err(RegistryError::HasDependents {
                tool: name.to_string(),
                dependents,
            });
        }
        self.tools.remove(index);
        debug!(tool = %name, "tool unregistered");
        Ok(())
    }

    /// Disabled tools stay registered but are not offered and refuse to run.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let reg = self
            .tools
            .iter_mut()
            .find(|t| t.tool.name() == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        reg.enabled = enabled;
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ToolRegistration> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn stats(&self, name: &str) -> Option<&ToolStats> {
        self.get(name).map(|t| &t.stats)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.tools.iter().position(|t| t.name() == name)
    }

    /// OpenAI-style function schemas for every enabled tool, each with the
    /// required `justification` argument injected.
    pub fn get_tool_schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .filter(|t| t.enabled)
            .map(|t| {
                let params = t.tool.dynamic_schema().or_else(|| t.tool.schema());
                function_schema(t.name(), t.tool.description(), params)
            })
            .collect()
    }

    /// Search tools by keyword across name, description, category and tags.
    /// Returns compact summaries without parameter schemas.
    pub fn search(&self, query: &str) -> Vec<Value> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();

        self.tools
            .iter()
            .filter(|t| {
                let haystack = format!(
                    "{} {} {} {}",
                    t.name(),
                    t.tool.description(),
                    t.category,
                    t.tags.join(" ")
                )
                .to_lowercase();
                terms.iter().any(|term| haystack.contains(term))
            })
            .map(|t| {
                json!({
                    "name": t.name(),
                    "description": t.tool.description(),
                    "category": t.category,
                    "enabled": t.enabled,
                })
            })
            .collect()
    }

    /// Run a tool on behalf of `caller`.
    ///
    /// The `justification` argument is logged and stripped before the tool
    /// sees its arguments. A tool's own `Err` becomes
    /// [`ToolError::Execution`]; soft failures are returned as `Ok` but
    /// counted as failures in the stats.
    pub async fn execute_tool(
        &mut self,
        name: &str,
        args: &Value,
        caller: &Caller,
    ) -> Result<Value, ToolError> {
        let index = self
            .position(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        self.check_runnable(index, caller)?;

        let (args, justification) = strip_justification(args);
        let execution_id = Uuid::new_v4().to_string();
        info!(
            tool = %name,
            execution_id = %execution_id,
            user = %caller.user_id,
            justification = justification.as_deref().unwrap_or(""),
            "executing tool"
        );

        let tool = Arc::clone(&self.tools[index].tool);
        let started = Instant::now();
        let result = tool.execute(&args).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let stats = &mut self.tools[index].stats;
        stats.execution_count += 1;
        stats.total_duration_ms += elapsed;
        stats.last_executed_at = Some(Utc::now());

        match result {
            Ok(output) if is_soft_error(&output) => {
                stats.failure_count += 1;
                stats.last_error = Some(output["error"].to_string());
                warn!(tool = %name, execution_id = %execution_id, "tool reported an error");
                Ok(output)
            }
            Ok(output) => {
                stats.success_count += 1;
                Ok(output)
            }
            Err(cause) => {
                stats.failure_count += 1;
                stats.last_error = Some(cause.clone());
                warn!(tool = %name, execution_id = %execution_id, error = %cause, "tool failed");
                Err(ToolError::Execution {
                    tool: name.to_string(),
                    execution_id,
                    cause,
                })
            }
        }
    }

    fn check_runnable(&self, index: usize, caller: &Caller) -> Result<(), ToolError> {
        let reg = &self.tools[index];
        let name = reg.name().to_string();
        if !reg.enabled {
            return Err(ToolError::Disabled(name));
        }
        if let Some(p) = reg.permissions.iter().find(|p| !caller.access.grants(**p)) {
            return Err(ToolError::PermissionDenied {
                tool: name,
                permission: p.to_string(),
            });
        }
        for dep in &reg.dependencies {
            let available = self.get(dep).is_some_and(|d| d.enabled);
            if !available {
                return Err(ToolError::DependencyUnavailable {
                    tool: name,
                    dependency: dep.clone(),
                });
            }
        }
        Ok(())
    }

    /// Schema for the built-in `read_tool_output` tool, offered alongside
    /// registered tools when large outputs are buffered.
    pub fn read_tool_output_schema() -> Value {
        function_schema(
            READ_TOOL_OUTPUT,
            "Read a line range from a tool output that was too large to show in full. \
             Use the tool_call_id from the truncated result.",
            Some(json!({
                "type": "object",
                "properties": {
                    "tool_call_id": {"type": "string", "description": "Id of the tool call whose output to read"},
                    "start_line": {"type": "integer", "description": "First line to read, 1-based"},
                    "end_line": {"type": "integer", "description": "Last line to read, inclusive"}
                },
                "required": ["tool_call_id", "start_line", "end_line"]
            })),
        )
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn function_schema(name: &str, description: &str, params: Option<Value>) -> Value {
    let mut params = match params {
        Some(p @ Value::Object(_)) => p,
        _ => json!({}),
    };
    params["type"] = json!("object");
    if !params["properties"].is_object() {
        params["properties"] = json!({});
    }
    params["properties"][JUSTIFICATION_ARG] = json!({
        "type": "string",
        "description": "One short sentence explaining why this call is needed"
    });
    if !params["required"].is_array() {
        params["required"] = json!([]);
    }
    if let Some(required) = params["required"].as_array_mut() {
        if !required.iter().any(|r| r == JUSTIFICATION_ARG) {
            required.push(json!(JUSTIFICATION_ARG));
        }
    }

    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": params,
        }
    })
}

/// Split the justification off a call's arguments.
pub fn strip_justification(args: &Value) -> (Value, Option<String>) {
    let mut args = args.clone();
    let justification = args
        .as_object_mut()
        .and_then(|o| o.remove(JUSTIFICATION_ARG))
        .map(|j| match j {
            Value::String(s) => s,
            other => other.to_string(),
        });
    (args, justification)
}
