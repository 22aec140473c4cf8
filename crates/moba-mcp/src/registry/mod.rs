//! Tool and resource registry.
//!
//! The registry is assembled once at startup through [`RegistryBuilder`] and
//! is immutable afterwards, so lookups need no locking. Input schemas are
//! compiled at registration time; a schema that does not compile fails
//! startup.

mod handler;
mod template;

pub use handler::{
    FnResource, FnTool, InvocationContext, ResourceHandler, ToolHandler, resource_fn, tool_fn,
};
pub use template::{TemplateVars, UriTemplate};

use crate::error::{RegistryError, ValidationError};
use crate::protocol::{
    ResourceDefinition, ResourceTemplateDefinition, ToolAnnotations, ToolDefinition,
};
use jsonschema::Validator;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Maximum number of schema violations reported per call.
const MAX_REPORTED_ERRORS: usize = 20;

/// Whether a tool changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideEffect {
    #[default]
    ReadOnly,
    Mutating,
}

/// A tool as supplied by a collaborator.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub side_effect: SideEffect,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, input_schema: Value, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema,
            side_effect: SideEffect::ReadOnly,
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_side_effect(mut self, side_effect: SideEffect) -> Self {
        self.side_effect = side_effect;
        self
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("side_effect", &self.side_effect)
            .finish_non_exhaustive()
    }
}

/// A registered tool with its compiled schema.
pub struct RegisteredTool {
    descriptor: ToolDescriptor,
    validator: Validator,
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.descriptor.handler)
    }

    /// Check arguments against the compiled input schema.
    pub fn validate(&self, arguments: &Value) -> Result<(), ValidationError> {
        if self.validator.is_valid(arguments) {
            return Ok(());
        }

        let errors = self
            .validator
            .iter_errors(arguments)
            .take(MAX_REPORTED_ERRORS)
            .map(|e| {
                let path = e.instance_path().to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        Err(ValidationError {
            tool: self.descriptor.name.clone(),
            errors,
        })
    }

    pub fn definition(&self) -> ToolDefinition {
        let d = &self.descriptor;
        let read_only = d.side_effect == SideEffect::ReadOnly;
        ToolDefinition {
            name: d.name.clone(),
            description: d.description.clone(),
            input_schema: d.input_schema.clone(),
            annotations: Some(ToolAnnotations {
                read_only_hint: Some(read_only),
                destructive_hint: Some(!read_only),
            }),
        }
    }
}

impl fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.descriptor.fmt(f)
    }
}

/// A resource family addressed by a URI template.
#[derive(Clone)]
pub struct ResourceDescriptor {
    pub template: UriTemplate,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub subscribable: bool,
    pub handler: Arc<dyn ResourceHandler>,
}

impl ResourceDescriptor {
    pub fn new(
        template: &str,
        name: impl Into<String>,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            template: UriTemplate::parse(template)?,
            name: name.into(),
            description: None,
            mime_type: None,
            subscribable: false,
            handler,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn subscribable(mut self, subscribable: bool) -> Self {
        self.subscribable = subscribable;
        self
    }
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("template", &self.template.as_str())
            .field("name", &self.name)
            .field("subscribable", &self.subscribable)
            .finish_non_exhaustive()
    }
}

/// Collects descriptors before the registry is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    strict: bool,
    tools: Vec<RegisteredTool>,
    resources: Vec<ResourceDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject unknown argument properties on every tool whose schema does not
    /// say otherwise.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn register_tool(&mut self, descriptor: ToolDescriptor) -> Result<&mut Self, RegistryError> {
        if self.tools.iter().any(|t| t.name() == descriptor.name) {
            return Err(RegistryError::DuplicateTool(descriptor.name));
        }

        let mut schema = descriptor.input_schema.clone();
        if self.strict {
            close_object_schema(&mut schema);
        }

        let validator =
            jsonschema::validator_for(&schema).map_err(|e| RegistryError::InvalidSchema {
                tool: descriptor.name.clone(),
                reason: e.to_string(),
            })?;

        self.tools.push(RegisteredTool {
            descriptor: ToolDescriptor {
                input_schema: schema,
                ..descriptor
            },
            validator,
        });
        Ok(self)
    }

    pub fn register_resource(
        &mut self,
        descriptor: ResourceDescriptor,
    ) -> Result<&mut Self, RegistryError> {
        if self
            .resources
            .iter()
            .any(|r| r.template.as_str() == descriptor.template.as_str())
        {
            return Err(RegistryError::DuplicateResource(
                descriptor.template.as_str().to_string(),
            ));
        }
        self.resources.push(descriptor);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        let tool_index = self
            .tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name().to_string(), i))
            .collect();
        Registry {
            tools: self.tools,
            tool_index,
            resources: self.resources,
        }
    }
}

/// Immutable catalog of tools and resources.
#[derive(Debug, Default)]
pub struct Registry {
    tools: Vec<RegisteredTool>,
    tool_index: HashMap<String, usize>,
    resources: Vec<ResourceDescriptor>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up a tool by exact name.
    pub fn resolve_tool(&self, name: &str) -> Option<&RegisteredTool> {
        self.tool_index.get(name).map(|&i| &self.tools[i])
    }

    /// Find the resource serving `uri`.
    ///
    /// When several templates match, the most specific one wins; equally
    /// specific templates resolve to the first registered.
    pub fn resolve_resource(&self, uri: &str) -> Option<(&ResourceDescriptor, TemplateVars)> {
        let mut best: Option<(&ResourceDescriptor, TemplateVars)> = None;
        for descriptor in &self.resources {
            let Some(vars) = descriptor.template.matches(uri) else {
                continue;
            };
            let better = match &best {
                Some((current, _)) => {
                    descriptor.template.specificity() > current.template.specificity()
                }
                None => true,
            };
            if better {
                best = Some((descriptor, vars));
            }
        }
        best
    }

    /// Tool definitions in registration order.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(RegisteredTool::definition).collect()
    }

    /// Concrete (placeholder-free) resources.
    pub fn resource_definitions(&self) -> Vec<ResourceDefinition> {
        self.resources
            .iter()
            .filter(|r| r.template.is_static())
            .map(|r| ResourceDefinition {
                uri: r.template.as_str().to_string(),
                name: r.name.clone(),
                description: r.description.clone(),
                mime_type: r.mime_type.clone(),
            })
            .collect()
    }

    /// Parameterized resources.
    pub fn template_definitions(&self) -> Vec<ResourceTemplateDefinition> {
        self.resources
            .iter()
            .filter(|r| !r.template.is_static())
            .map(|r| ResourceTemplateDefinition {
                uri_template: r.template.as_str().to_string(),
                name: r.name.clone(),
                description: r.description.clone(),
                mime_type: r.mime_type.clone(),
            })
            .collect()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn has_subscribable_resources(&self) -> bool {
        self.resources.iter().any(|r| r.subscribable)
    }
}

/// Add `additionalProperties: false` to an object schema that leaves it open.
fn close_object_schema(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };
    let is_object = obj.get("type").and_then(Value::as_str) == Some("object")
        || obj.contains_key("properties");
    if is_object && !obj.contains_key("additionalProperties") {
        obj.insert("additionalProperties".to_string(), Value::Bool(false));
    }
    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        let props: &mut Map<String, Value> = props;
        for prop in props.values_mut() {
            close_object_schema(prop);
        }
    }
}
