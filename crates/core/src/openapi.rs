// OpenAPI 3.x / Swagger 2.0 documents translated into callable API operations

use crate::config::OpenApiConfig;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

const METHODS: [&str; 5] = ["get", "post", "put", "delete", "patch"];
const MAX_REF_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
    Cookie,
    Body,
    FormData,
}

impl ParameterLocation {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "path" => Some(Self::Path),
            "query" => Some(Self::Query),
            "header" => Some(Self::Header),
            "cookie" => Some(Self::Cookie),
            "body" => Some(Self::Body),
            "formData" => Some(Self::FormData),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Cookie => "cookie",
            Self::Body => "body",
            Self::FormData => "formData",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiParameter {
    pub name: String,
    pub location: ParameterLocation,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl ApiParameter {
    /// JSON type named by the parameter schema, `string` when absent
    pub fn json_type(&self) -> &str {
        self.schema
            .as_ref()
            .and_then(|s| s.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("string")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBodySpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    /// Resolved `application/json` schema, if the body declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// One HTTP method on one path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiOperation {
    pub name: String,
    pub description: String,
    pub method: String,
    pub path: String,
    pub parameters: Vec<ApiParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<RequestBodySpec>,
}

impl ApiOperation {
    pub fn parameters_in(&self, location: ParameterLocation) -> impl Iterator<Item = &ApiParameter> {
        self.parameters.iter().filter(move |p| p.location == location)
    }

    pub fn sends_body(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT" | "PATCH")
    }

    /// JSON schema describing the tool arguments
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            if param.location == ParameterLocation::Body {
                continue;
            }
            properties.insert(
                param.name.clone(),
                json!({
                    "type": param.json_type(),
                    "description": format!("{} (in {})", param.description, param.location),
                }),
            );
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        if let Some(body) = &self.request_body {
            let schema = body.schema.clone().unwrap_or_else(|| {
                json!({
                    "type": "object",
                    "description": "Request body data",
                })
            });
            properties.insert("body".to_string(), schema);
            if body.required {
                required.push(Value::String("body".to_string()));
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Parse document text as JSON, falling back to YAML
pub fn parse_document(content: &str) -> Result<Value> {
    match serde_json::from_str::<Value>(content) {
        Ok(doc) => Ok(doc),
        Err(json_err) => serde_yaml::from_str::<Value>(content).with_context(|| {
            format!("document is neither valid JSON ({}) nor valid YAML", json_err)
        }),
    }
}

pub fn load_document_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        bail!("OpenAPI spec file not found: {}", path.display());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read OpenAPI spec file {}", path.display()))?;
    parse_document(&content)
}

/// Generate one operation per path and method, honoring include/exclude filters
pub fn generate_operations(doc: &Value, config: &OpenApiConfig) -> Result<Vec<ApiOperation>> {
    let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
        bail!("OpenAPI document has no 'paths' object");
    };
    let filter = PathFilter::new(&config.include_paths, &config.exclude_paths)?;
    let swagger2 = doc.get("swagger").and_then(Value::as_str) == Some("2.0");
    let resolver = RefResolver { doc };

    let mut operations = Vec::new();
    for (path, item) in paths {
        if !filter.allows(path) {
            tracing::debug!(path = %path, "Skipping filtered path");
            continue;
        }
        let item = resolver.shallow(item);
        let shared = item.get("parameters").cloned().unwrap_or(Value::Null);

        for method in METHODS {
            let Some(op) = item.get(method) else {
                continue;
            };
            operations.push(build_operation(
                path,
                method,
                op,
                &shared,
                swagger2,
                &resolver,
                &config.tool_prefix,
            ));
        }
    }
    Ok(operations)
}

fn build_operation(
    path: &str,
    method: &str,
    op: &Value,
    shared_params: &Value,
    swagger2: bool,
    resolver: &RefResolver<'_>,
    prefix: &str,
) -> ApiOperation {
    let text = |key: &str| {
        op.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let description = text("summary")
        .or_else(|| text("description"))
        .unwrap_or_else(|| "API endpoint".to_string());

    // Operation-level parameters override path-level ones with the same name and location.
    let mut parameters: Vec<ApiParameter> = Vec::new();
    for raw in [op.get("parameters").unwrap_or(&Value::Null), shared_params] {
        for param in raw.as_array().into_iter().flatten() {
            let Some(param) = parse_parameter(&resolver.shallow(param), resolver) else {
                continue;
            };
            if !parameters
                .iter()
                .any(|p| p.name == param.name && p.location == param.location)
            {
                parameters.push(param);
            }
        }
    }

    let request_body = if swagger2 {
        parameters
            .iter()
            .find(|p| p.location == ParameterLocation::Body)
            .map(|p| RequestBodySpec {
                description: p.description.clone(),
                required: p.required,
                schema: p.schema.clone(),
            })
    } else {
        op.get("requestBody").map(|body| {
            let body = resolver.shallow(body);
            RequestBodySpec {
                description: body
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                required: body.get("required").and_then(Value::as_bool).unwrap_or(false),
                schema: body
                    .pointer("/content/application~1json/schema")
                    .map(|schema| resolver.resolve(schema)),
            }
        })
    };

    ApiOperation {
        name: tool_name(path, method, prefix),
        description,
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        parameters,
        request_body,
    }
}

fn parse_parameter(raw: &Value, resolver: &RefResolver<'_>) -> Option<ApiParameter> {
    let name = raw.get("name")?.as_str()?.to_string();
    let location = ParameterLocation::parse(raw.get("in")?.as_str()?)?;

    // Swagger 2.0 non-body parameters carry their type inline.
    let schema = match raw.get("schema") {
        Some(schema) => Some(resolver.resolve(schema)),
        None => raw
            .get("type")
            .map(|ty| json!({ "type": ty })),
    };

    Some(ApiParameter {
        name,
        location,
        description: raw
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        required: location == ParameterLocation::Path
            || raw.get("required").and_then(Value::as_bool).unwrap_or(false),
        schema,
    })
}

/// snake_case name: method, then path segments, with `{id}` rendered as `by_id`
pub fn tool_name(path: &str, method: &str, prefix: &str) -> String {
    let mut name = method.to_ascii_lowercase();
    for segment in path.trim_start_matches('/').split('/') {
        if segment.is_empty() {
            continue;
        }
        name.push('_');
        match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(param) => {
                name.push_str("by_");
                name.push_str(&sanitize(param));
            }
            None => name.push_str(&sanitize(segment)),
        }
    }
    if prefix.is_empty() {
        name
    } else {
        format!("{}_{}", prefix, name)
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Base URL from the document itself: `servers[0].url` or Swagger `schemes`/`host`/`basePath`
pub fn base_url_from_document(doc: &Value) -> Option<String> {
    if let Some(url) = doc.pointer("/servers/0/url").and_then(Value::as_str) {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Some(url.trim_end_matches('/').to_string());
        }
    }
    let host = doc.get("host")?.as_str()?;
    let scheme = doc
        .pointer("/schemes/0")
        .and_then(Value::as_str)
        .unwrap_or("https");
    let base_path = doc.get("basePath").and_then(Value::as_str).unwrap_or("");
    Some(format!("{}://{}{}", scheme, host, base_path.trim_end_matches('/')))
}

/// `scheme://host[:port]` of a remote spec URL; default ports are omitted
pub fn base_url_from_spec_url(spec_url: &str) -> Option<String> {
    if !spec_url.starts_with("http://") && !spec_url.starts_with("https://") {
        return None;
    }
    let parsed = url::Url::parse(spec_url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// Include/exclude patterns; `*` matches any run of characters
struct PathFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathFilter {
    fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| {
                    let pattern = format!("^{}$", regex::escape(p).replace(r"\*", ".*"));
                    Regex::new(&pattern).with_context(|| format!("invalid path pattern '{}'", p))
                })
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    fn allows(&self, path: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(path)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(path))
    }
}

/// Inlines local `$ref`s (`#/components/...`, `#/definitions/...`)
struct RefResolver<'a> {
    doc: &'a Value,
}

impl RefResolver<'_> {
    /// Follow a top-level `$ref` chain only; nested references are left alone
    fn shallow(&self, value: &Value) -> Value {
        let mut current = value;
        for _ in 0..MAX_REF_DEPTH {
            let target = current
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix('#'))
                .and_then(|pointer| self.doc.pointer(pointer));
            match target {
                Some(target) => current = target,
                None => break,
            }
        }
        current.clone()
    }

    fn resolve(&self, value: &Value) -> Value {
        self.resolve_inner(value, &mut HashSet::new(), 0)
    }

    fn resolve_inner(&self, value: &Value, visiting: &mut HashSet<String>, depth: usize) -> Value {
        if depth > MAX_REF_DEPTH {
            return value.clone();
        }
        match value {
            Value::Object(map) => {
                if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
                    let target = reference
                        .strip_prefix('#')
                        .and_then(|pointer| self.doc.pointer(pointer));
                    return match target {
                        Some(target) if visiting.insert(reference.to_string()) => {
                            let resolved = self.resolve_inner(target, visiting, depth + 1);
                            visiting.remove(reference);
                            resolved
                        }
                        // Cycles and external references stay as references.
                        _ => value.clone(),
                    };
                }
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), self.resolve_inner(v, visiting, depth + 1)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_inner(v, visiting, depth + 1))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn petstore() -> Value {
        json!({
            "openapi": "3.0.0",
            "info": {"title": "Petstore", "version": "1.0"},
            "servers": [{"url": "https://petstore.example.com/v1/"}],
            "paths": {
                "/pets": {
                    "get": {
                        "summary": "List pets",
                        "parameters": [
                            {"name": "limit", "in": "query", "description": "Max items", "schema": {"type": "integer"}}
                        ]
                    },
                    "post": {
                        "description": "Create a pet",
                        "requestBody": {
                            "required": true,
                            "content": {"application/json": {"schema": {"$ref": "#/components/schemas/Pet"}}}
                        }
                    }
                },
                "/pets/{petId}": {
                    "parameters": [
                        {"name": "petId", "in": "path", "required": true, "schema": {"type": "string"}}
                    ],
                    "get": {},
                    "delete": {"summary": "Delete a pet"}
                },
                "/admin/stats": {"get": {"summary": "Stats"}}
            },
            "components": {
                "schemas": {
                    "Pet": {
                        "type": "object",
                        "required": ["name"],
                        "properties": {
                            "name": {"type": "string"},
                            "owner": {"$ref": "#/components/schemas/Owner"}
                        }
                    },
                    "Owner": {
                        "type": "object",
                        "properties": {"pets": {"type": "array", "items": {"$ref": "#/components/schemas/Pet"}}}
                    }
                }
            }
        })
    }

    fn find<'a>(ops: &'a [ApiOperation], name: &str) -> &'a ApiOperation {
        ops.iter().find(|op| op.name == name).unwrap()
    }

    #[test]
    fn test_tool_names() {
        assert_eq!(tool_name("/users/{username}", "GET", ""), "get_users_by_username");
        assert_eq!(tool_name("/pet/findByStatus", "get", ""), "get_pet_findbystatus");
        assert_eq!(tool_name("/", "POST", "store"), "store_post");
        assert_eq!(tool_name("/v1.0/items", "put", ""), "put_v1_0_items");
    }

    #[test]
    fn test_generate_operations() {
        let ops = generate_operations(&petstore(), &OpenApiConfig::default()).unwrap();
        assert_eq!(ops.len(), 5);

        let list = find(&ops, "get_pets");
        assert_eq!(list.description, "List pets");
        assert_eq!(list.method, "GET");

        let create = find(&ops, "post_pets");
        assert_eq!(create.description, "Create a pet");
        let body = create.request_body.as_ref().unwrap();
        assert!(body.required);
        assert_eq!(body.schema.as_ref().unwrap()["required"], json!(["name"]));

        let get = find(&ops, "get_pets_by_petid");
        assert_eq!(get.description, "API endpoint");
        assert_eq!(get.parameters_in(ParameterLocation::Path).count(), 1);
    }

    #[test]
    fn test_recursive_refs_terminate() {
        let ops = generate_operations(&petstore(), &OpenApiConfig::default()).unwrap();
        let schema = find(&ops, "post_pets").request_body.clone().unwrap().schema.unwrap();
        let owner = &schema["properties"]["owner"];
        assert_eq!(owner["type"], "object");
        assert_eq!(
            owner["properties"]["pets"]["items"]["$ref"],
            "#/components/schemas/Pet"
        );
    }

    #[test]
    fn test_input_schema() {
        let ops = generate_operations(&petstore(), &OpenApiConfig::default()).unwrap();

        let schema = find(&ops, "get_pets").input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["limit"]["type"], "integer");
        assert_eq!(schema["properties"]["limit"]["description"], "Max items (in query)");
        assert_eq!(schema["required"], json!([]));

        let schema = find(&ops, "post_pets").input_schema();
        assert_eq!(schema["properties"]["body"]["type"], "object");
        assert_eq!(schema["required"], json!(["body"]));

        let schema = find(&ops, "delete_pets_by_petid").input_schema();
        assert_eq!(schema["properties"]["petId"]["type"], "string");
        assert_eq!(schema["required"], json!(["petId"]));
    }

    #[test]
    fn test_include_and_exclude_filters() {
        let config = OpenApiConfig {
            exclude_paths: vec!["/admin/*".to_string()],
            tool_prefix: "shop".to_string(),
            ..Default::default()
        };
        let ops = generate_operations(&petstore(), &config).unwrap();
        assert_eq!(ops.len(), 4);
        assert!(ops.iter().all(|op| op.name.starts_with("shop_")));

        let config = OpenApiConfig {
            include_paths: vec!["/pets/*".to_string()],
            ..Default::default()
        };
        let ops = generate_operations(&petstore(), &config).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.path == "/pets/{petId}"));
    }

    #[test]
    fn test_swagger2_body_and_inline_types() {
        let doc = json!({
            "swagger": "2.0",
            "host": "api.example.com",
            "basePath": "/v2",
            "schemes": ["http"],
            "paths": {
                "/user": {
                    "post": {
                        "summary": "Create user",
                        "parameters": [
                            {"name": "payload", "in": "body", "required": true, "schema": {"$ref": "#/definitions/User"}},
                            {"name": "X-Trace", "in": "header", "type": "string"},
                            {"name": "dry_run", "in": "query", "type": "boolean"}
                        ]
                    }
                }
            },
            "definitions": {"User": {"type": "object", "properties": {"name": {"type": "string"}}}}
        });

        let ops = generate_operations(&doc, &OpenApiConfig::default()).unwrap();
        let op = &ops[0];
        let body = op.request_body.as_ref().unwrap();
        assert_eq!(body.schema.as_ref().unwrap()["properties"]["name"]["type"], "string");

        let schema = op.input_schema();
        assert!(schema["properties"].get("payload").is_none());
        assert_eq!(schema["properties"]["dry_run"]["type"], "boolean");
        assert_eq!(schema["required"], json!(["body"]));

        assert_eq!(
            base_url_from_document(&doc).as_deref(),
            Some("http://api.example.com/v2")
        );
    }

    #[test]
    fn test_base_urls() {
        assert_eq!(
            base_url_from_document(&petstore()).as_deref(),
            Some("https://petstore.example.com/v1")
        );
        assert_eq!(
            base_url_from_spec_url("http://localhost:8080/swagger.json").as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(
            base_url_from_spec_url("https://api.example.com:443/openapi.yaml").as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(base_url_from_spec_url("./local.json"), None);
    }

    #[test]
    fn test_parse_document_yaml_fallback() {
        let doc = parse_document("openapi: 3.0.0\npaths: {}\n").unwrap();
        assert_eq!(doc["openapi"], "3.0.0");
        assert!(parse_document("{not: [valid").is_err());
    }

    #[test]
    fn test_missing_paths_is_error() {
        let err = generate_operations(&json!({"openapi": "3.0.0"}), &OpenApiConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("paths"));
    }
}
