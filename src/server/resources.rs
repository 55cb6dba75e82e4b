//! In-memory resource and prompt registries.

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{
    Content, GetPromptResult, Prompt, PromptMessage, ReadResourceResult, Resource,
    ResourceContents,
};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::debug;

/// Static resources keyed by exact URI.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: DashMap<String, (Resource, ResourceContents)>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_text(&self, resource: Resource, text: impl Into<String>) {
        let contents = ResourceContents {
            uri: resource.uri.clone(),
            mime_type: resource.mime_type.clone(),
            text: Some(text.into()),
            blob: None,
        };
        self.register(resource, contents);
    }

    pub fn register(&self, resource: Resource, contents: ResourceContents) {
        debug!("Registering resource: {}", resource.uri);
        self.resources
            .insert(resource.uri.clone(), (resource, contents));
    }

    pub fn unregister(&self, uri: &str) -> bool {
        self.resources.remove(uri).is_some()
    }

    pub fn list(&self) -> Vec<Resource> {
        let mut resources: Vec<Resource> =
            self.resources.iter().map(|r| r.value().0.clone()).collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }

    pub fn read(&self, uri: &str) -> ProtocolResult<ReadResourceResult> {
        self.resources
            .get(uri)
            .map(|r| ReadResourceResult {
                contents: vec![r.value().1.clone()],
            })
            .ok_or_else(|| ProtocolError::InvalidParams(format!("Resource not found: {uri}").into()))
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Prompt templates keyed by exact name. Text content may reference
/// arguments as `{{name}}`.
#[derive(Default)]
pub struct PromptRegistry {
    prompts: DashMap<String, (Prompt, Vec<PromptMessage>)>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, prompt: Prompt, messages: Vec<PromptMessage>) {
        debug!("Registering prompt: {}", prompt.name);
        self.prompts.insert(prompt.name.clone(), (prompt, messages));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.prompts.remove(name).is_some()
    }

    pub fn list(&self) -> Vec<Prompt> {
        let mut prompts: Vec<Prompt> = self.prompts.iter().map(|r| r.value().0.clone()).collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts
    }

    pub fn get(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> ProtocolResult<GetPromptResult> {
        let (prompt, messages) = self
            .prompts
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| ProtocolError::InvalidParams(format!("Prompt not found: {name}").into()))?;

        for argument in prompt.arguments.iter().flatten() {
            if argument.required.unwrap_or(false) && !arguments.contains_key(&argument.name) {
                return Err(ProtocolError::InvalidParams(
                    format!(
                        "Missing required argument '{}' for prompt '{}'",
                        argument.name, name
                    )
                    .into(),
                ));
            }
        }

        let messages = messages
            .into_iter()
            .map(|mut message| {
                if let Content::Text { text } = &mut message.content {
                    *text = render(text, arguments);
                }
                message
            })
            .collect();

        Ok(GetPromptResult {
            description: prompt.description,
            messages,
        })
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

fn render(template: &str, arguments: &HashMap<String, String>) -> String {
    arguments
        .iter()
        .fold(template.to_string(), |text, (key, value)| {
            text.replace(&format!("{{{{{key}}}}}"), value)
        })
}
