//! Capability discovery for agents.
//!
//! Tools and skills an agent can use are described by [`Capability`] entries
//! from one or more [`CapabilityProvider`]s. The [`CapabilityRegistry`]
//! aggregates providers; the heartbeat runner uses it to build the review
//! prompt and to derive budget-exempt tool names for the turn policy.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Skill,
}

/// One tool or skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: CapabilityKind,
    /// Calls do not count toward the turn's tool budget.
    #[serde(default)]
    pub budget_exempt: bool,
}

impl Capability {
    pub fn tool(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: CapabilityKind::Tool,
            budget_exempt: false,
        }
    }

    pub fn skill(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: CapabilityKind::Skill,
            ..Self::tool(name, description)
        }
    }

    pub fn exempt(mut self) -> Self {
        self.budget_exempt = true;
        self
    }
}

/// Source of capabilities.
pub trait CapabilityProvider: Send + Sync {
    /// Names of available capabilities, sorted.
    fn list_available(&self) -> Vec<String>;

    /// Details for one capability.
    fn describe(&self, name: &str) -> Option<Capability>;
}

/// Fixed capability list, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilities {
    entries: Vec<Capability>,
}

impl StaticCapabilities {
    pub fn new(entries: Vec<Capability>) -> Self {
        Self { entries }
    }
}

impl CapabilityProvider for StaticCapabilities {
    fn list_available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|c| c.name.clone()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    fn describe(&self, name: &str) -> Option<Capability> {
        self.entries.iter().find(|c| c.name == name).cloned()
    }
}

/// Aggregates providers. Earlier providers win on name clashes.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    providers: Vec<Arc<dyn CapabilityProvider>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn CapabilityProvider>) {
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Every available capability, resolved through [`describe`](CapabilityProvider::describe).
    pub fn all(&self) -> Vec<Capability> {
        self.list_available()
            .iter()
            .filter_map(|name| self.describe(name))
            .collect()
    }

    /// Names of budget-exempt capabilities.
    pub fn exempt_names(&self) -> BTreeSet<String> {
        self.all()
            .into_iter()
            .filter(|c| c.budget_exempt)
            .map(|c| c.name)
            .collect()
    }

    /// `- name (kind): description` lines for prompts.
    pub fn render(&self) -> String {
        self.all()
            .iter()
            .map(|c| {
                let kind = match c.kind {
                    CapabilityKind::Tool => "tool",
                    CapabilityKind::Skill => "skill",
                };
                if c.description.is_empty() {
                    format!("- {} ({kind})", c.name)
                } else {
                    format!("- {} ({kind}): {}", c.name, c.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl CapabilityProvider for CapabilityRegistry {
    fn list_available(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .providers
            .iter()
            .flat_map(|p| p.list_available())
            .collect();
        names.into_iter().collect()
    }

    fn describe(&self, name: &str) -> Option<Capability> {
        self.providers.iter().find_map(|p| p.describe(name))
    }
}
