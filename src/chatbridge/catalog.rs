//! Tool descriptor table compiled from an OpenAPI document.
//!
//! Each exposed operation becomes a [`ToolDescriptor`]: name, HTTP method, URL
//! template, parameter routing (path / query / body) and an optional
//! authentication hint read from the `x-auth-type` family of extensions.
//! The table is immutable for the lifetime of a session.
//!
//! Path exposure honors the configured allow/deny lists; both support exact
//! prefixes and trailing-`*` wildcards.
//!
//! # Example
//!
//! ```rust
//! use chatbridge::{BridgeConfig, ToolCatalog};
//!
//! let spec = serde_json::json!({
//!     "openapi": "3.1.0",
//!     "servers": [{"url": "https://api.example.com"}],
//!     "paths": {
//!         "/api/v1/users/{user_id}": {
//!             "get": {
//!                 "operationId": "get_user",
//!                 "summary": "Fetch one user",
//!                 "parameters": [
//!                     {"name": "user_id", "in": "path", "required": true,
//!                      "schema": {"type": "integer"}}
//!                 ]
//!             }
//!         }
//!     }
//! });
//!
//! let catalog = ToolCatalog::from_openapi(&spec, &BridgeConfig::default()).unwrap();
//! let tool = catalog.get("get_user").unwrap();
//! assert_eq!(tool.method, "GET");
//! assert_eq!(tool.path, "/api/v1/users/{user_id}");
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use serde_json::Value;

use crate::chatbridge::config::BridgeConfig;
use crate::chatbridge::credentials::AuthHint;

/// Errors raised while compiling the descriptor table.
#[derive(Debug, Clone)]
pub enum CatalogError {
    /// The document is not a usable OpenAPI spec.
    InvalidSpec(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::InvalidSpec(msg) => write!(f, "invalid OpenAPI spec: {}", msg),
        }
    }
}

impl Error for CatalogError {}

/// Where an argument is routed when the request is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Path,
    Query,
    Body,
}

/// One parameter of a tool's schema.
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: String,
    /// JSON-schema primitive type name ("string", "integer", ...).
    pub schema_type: String,
    pub description: Option<String>,
    pub required: bool,
    pub location: ParamLocation,
    pub enum_values: Option<Vec<Value>>,
    pub default: Option<Value>,
}

/// Immutable description of one callable API operation.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// Upper-case HTTP method.
    pub method: String,
    /// Path template with `{param}` placeholders.
    pub path: String,
    pub parameters: Vec<ToolParameter>,
    pub auth_hint: Option<AuthHint>,
}

impl ToolDescriptor {
    /// Validate `arguments` against the parameter schema.
    ///
    /// Returns a human-readable diagnostic on the first violation so the model
    /// can correct itself on the next round.
    pub fn validate_args(&self, arguments: &Value) -> Result<(), String> {
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => {
                if self.parameters.iter().any(|p| p.required) {
                    return Err(format!("tool {} requires arguments", self.name));
                }
                return Ok(());
            }
            _ => return Err(format!("arguments for {} must be a JSON object", self.name)),
        };

        for param in &self.parameters {
            match args.get(&param.name) {
                None if param.required => {
                    return Err(format!(
                        "missing required parameter '{}' for tool '{}'",
                        param.name, self.name
                    ));
                }
                None => {}
                Some(value) => {
                    if !type_matches(value, &param.schema_type) {
                        return Err(format!(
                            "parameter '{}' of tool '{}' must be of type {}",
                            param.name, self.name, param.schema_type
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// JSON-schema function description handed to the model-family adapters.
    pub fn schema_json(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), Value::String(param.schema_type.clone()));
            if let Some(desc) = &param.description {
                prop.insert("description".into(), Value::String(desc.clone()));
            }
            if let Some(values) = &param.enum_values {
                prop.insert("enum".into(), Value::Array(values.clone()));
            }
            if let Some(default) = &param.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}

fn type_matches(value: &Value, schema_type: &str) -> bool {
    match schema_type {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown type, allow it.
        _ => true,
    }
}

/// Immutable table of tool descriptors indexed by name.
pub struct ToolCatalog {
    tools: HashMap<String, ToolDescriptor>,
    base_url: String,
}

impl ToolCatalog {
    /// An empty catalog targeting `base_url` (mainly for tests and manual wiring).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            tools: HashMap::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Register a descriptor, replacing any existing one with the same name.
    pub fn insert(&mut self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    /// Compile the descriptor table from an OpenAPI document.
    pub fn from_openapi(spec: &Value, config: &BridgeConfig) -> Result<Self, CatalogError> {
        let paths = spec
            .get("paths")
            .and_then(|p| p.as_object())
            .ok_or_else(|| CatalogError::InvalidSpec("missing paths object".into()))?;

        let base_url = config
            .api_base_url
            .clone()
            .or_else(|| {
                spec.get("servers")
                    .and_then(|s| s.get(0))
                    .and_then(|s| s.get("url"))
                    .and_then(|u| u.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| "http://localhost:8000".to_string());

        let mut catalog = Self::new(base_url);

        for (path, path_item) in paths {
            if path_excluded(path, &config.excluded_paths) {
                continue;
            }
            if !config.allowed_paths.is_empty() && !path_allowed(path, &config.allowed_paths) {
                continue;
            }
            let Some(operations) = path_item.as_object() else {
                continue;
            };
            for (method, operation) in operations {
                let method = method.to_uppercase();
                if !matches!(method.as_str(), "GET" | "POST" | "PUT" | "DELETE" | "PATCH") {
                    continue;
                }
                match compile_operation(spec, path, &method, operation) {
                    Some(descriptor) => catalog.insert(descriptor),
                    None => {
                        log::warn!("skipping {} {}: unusable operation object", method, path)
                    }
                }
            }
        }

        log::info!("compiled {} tools from OpenAPI spec", catalog.tools.len());
        Ok(catalog)
    }

    /// Look up a descriptor by tool name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// True when no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Base URL for outbound tool calls.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Schema descriptions for all tools, for the model-family adapters.
    pub fn schema_functions(&self) -> Vec<Value> {
        let mut functions: Vec<Value> = self.tools.values().map(|t| t.schema_json()).collect();
        // Stable ordering keeps formatted payloads deterministic.
        functions.sort_by(|a, b| {
            a.get("name")
                .and_then(Value::as_str)
                .cmp(&b.get("name").and_then(Value::as_str))
        });
        functions
    }
}

fn path_matches(path: &str, rule: &str) -> bool {
    let path = path.trim_end_matches('/');
    let rule = rule.trim_end_matches('/');
    if let Some(prefix) = rule.strip_suffix('*') {
        return path.starts_with(prefix);
    }
    path.starts_with(rule)
}

fn path_excluded(path: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|rule| path_matches(path, rule))
}

fn path_allowed(path: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|rule| path_matches(path, rule))
}

fn compile_operation(
    spec: &Value,
    path: &str,
    method: &str,
    operation: &Value,
) -> Option<ToolDescriptor> {
    let operation = operation.as_object()?;

    let name = operation
        .get("operationId")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| {
            let clean = path.replace('/', "_").replace(['{', '}'], "");
            format!("{}{}", method.to_lowercase(), clean)
        });
    let name = sanitize_name(&name);

    let description = operation
        .get("description")
        .or_else(|| operation.get("summary"))
        .and_then(Value::as_str)
        .map(|d| format!("{}. (HTTP {} {})", d.trim_end_matches('.'), method, path))
        .unwrap_or_else(|| default_description(method, path));

    let mut parameters = Vec::new();

    if let Some(params) = operation.get("parameters").and_then(Value::as_array) {
        for param in params {
            let Some(param_name) = param.get("name").and_then(Value::as_str) else {
                continue;
            };
            let location = match param.get("in").and_then(Value::as_str) {
                Some("path") => ParamLocation::Path,
                _ => ParamLocation::Query,
            };
            let schema = param.get("schema").cloned().unwrap_or(Value::Null);
            parameters.push(ToolParameter {
                name: param_name.to_string(),
                schema_type: schema
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("string")
                    .to_string(),
                description: param
                    .get("description")
                    .and_then(Value::as_str)
                    .map(String::from),
                required: param
                    .get("required")
                    .and_then(Value::as_bool)
                    .unwrap_or(location == ParamLocation::Path),
                location,
                enum_values: schema.get("enum").and_then(Value::as_array).cloned(),
                default: schema.get("default").cloned(),
            });
        }
    }

    if let Some(body_schema) = request_body_schema(spec, operation) {
        let required_fields: Vec<&str> = body_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(props) = body_schema.get("properties").and_then(Value::as_object) {
            for (prop_name, prop_schema) in props {
                parameters.push(ToolParameter {
                    name: prop_name.clone(),
                    schema_type: prop_schema
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("string")
                        .to_string(),
                    description: prop_schema
                        .get("description")
                        .and_then(Value::as_str)
                        .map(String::from),
                    required: required_fields.contains(&prop_name.as_str()),
                    location: ParamLocation::Body,
                    enum_values: prop_schema.get("enum").and_then(Value::as_array).cloned(),
                    default: prop_schema.get("default").cloned(),
                });
            }
        }
    }

    Some(ToolDescriptor {
        name,
        description,
        method: method.to_string(),
        path: path.to_string(),
        parameters,
        auth_hint: compile_auth_hint(operation),
    })
}

/// Extract the JSON request-body schema, resolving one level of `$ref`.
fn request_body_schema(spec: &Value, operation: &serde_json::Map<String, Value>) -> Option<Value> {
    let schema = operation
        .get("requestBody")?
        .get("content")?
        .get("application/json")?
        .get("schema")?;
    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        return resolve_ref(spec, reference);
    }
    Some(schema.clone())
}

fn resolve_ref(spec: &Value, reference: &str) -> Option<Value> {
    let path = reference.strip_prefix("#/")?;
    let mut current = spec;
    for part in path.split('/') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

/// Read the `x-auth-type` extension family into an [`AuthHint`].
fn compile_auth_hint(operation: &serde_json::Map<String, Value>) -> Option<AuthHint> {
    let mut hint = AuthHint::default();
    let mut present = false;

    if let Some(v) = operation.get("x-auth-type").and_then(Value::as_str) {
        hint.auth_type = Some(v.to_string());
        present = true;
    }
    if let Some(v) = operation
        .get("x-bearer-token-header")
        .and_then(Value::as_str)
    {
        hint.bearer_header = Some(v.to_string());
        present = true;
    }
    if let Some(v) = operation.get("x-api-key-header").and_then(Value::as_str) {
        hint.api_key_header = Some(v.to_string());
        present = true;
    }
    if let Some(v) = operation.get("x-oauth2-token-url").and_then(Value::as_str) {
        hint.oauth2_token_url = Some(v.to_string());
        present = true;
    }
    if let Some(v) = operation.get("x-oauth2-scope").and_then(Value::as_str) {
        hint.oauth2_scope = Some(v.to_string());
        present = true;
    }
    if let Some(map) = operation
        .get("x-custom-auth-headers")
        .and_then(Value::as_object)
    {
        for (name, value) in map {
            if let Some(value) = value.as_str() {
                hint.custom_headers
                    .insert(name.clone(), value.to_string());
            }
        }
        present = true;
    }

    present.then_some(hint)
}

fn sanitize_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        cleaned = format!("api_{}", cleaned);
    }
    if cleaned.is_empty() {
        cleaned = "api_function".to_string();
    }
    cleaned
}

fn default_description(method: &str, path: &str) -> String {
    let action = match method {
        "GET" if path.contains('{') => "Retrieve",
        "GET" => "List",
        "POST" => "Create",
        "PUT" => "Update",
        "PATCH" => "Partially update",
        "DELETE" => "Delete",
        other => other,
    };
    let resource = path
        .split('/')
        .filter(|p| !p.is_empty() && !p.starts_with('{'))
        .next_back()
        .unwrap_or("resource");
    format!("{} {} via {} {}", action, resource, method, path)
}
