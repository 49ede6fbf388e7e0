use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::scanner::{find_sub_classes, load_single_subclass, ScanError};
use super::{ClassRef, Marker, ModelType, PluginModule, PluginObject, RuntimeContext};
use crate::endpoint::{EndpointMatch, EndpointRouter};

/// Which capabilities a plugin provides and which classes implement them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginDeclaration {
    pub tool_providers: Vec<ToolProviderDeclaration>,
    pub model_providers: Vec<ModelProviderDeclaration>,
    pub agent_strategy_providers: Vec<AgentStrategyProviderDeclaration>,
    pub endpoints: Vec<EndpointDeclaration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolProviderDeclaration {
    pub name: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub cpu_bound: bool,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub cpu_bound: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelProviderDeclaration {
    pub name: String,
    #[serde(default)]
    pub class: Option<String>,
    /// Model class names; empty means every concrete `Model` class.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub cpu_bound: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStrategyProviderDeclaration {
    pub name: String,
    #[serde(default)]
    pub strategies: Vec<AgentStrategyDeclaration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStrategyDeclaration {
    pub name: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub cpu_bound: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointDeclaration {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub cpu_bound: bool,
}

#[derive(Debug, Clone)]
pub struct ToolRegistration {
    pub name: String,
    pub class: ClassRef,
    pub cpu_bound: bool,
}

pub struct ToolProviderRegistration {
    pub name: String,
    pub instance: Arc<dyn PluginObject>,
    pub tools: HashMap<String, ToolRegistration>,
    pub cpu_bound: bool,
}

pub struct ModelProviderRegistration {
    pub name: String,
    pub instance: Arc<dyn PluginObject>,
    pub models: HashMap<ModelType, Arc<dyn PluginObject>>,
    pub cpu_bound: bool,
}

#[derive(Debug, Clone)]
pub struct AgentStrategyRegistration {
    pub provider: String,
    pub name: String,
    pub class: ClassRef,
    pub cpu_bound: bool,
}

#[derive(Debug, Clone)]
pub struct EndpointRegistration {
    pub path: String,
    pub method: String,
    pub class: ClassRef,
    pub cpu_bound: bool,
}

/// Counts reported in the ready message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub tool_providers: usize,
    pub tools: usize,
    pub model_providers: usize,
    pub models: usize,
    pub agent_strategies: usize,
    pub endpoints: usize,
}

/// Registry of every capability a plugin exposes, built once at startup.
#[derive(Default)]
pub struct CapabilityRegistry {
    tool_providers: HashMap<String, ToolProviderRegistration>,
    model_providers: HashMap<String, ModelProviderRegistration>,
    agent_strategies: HashMap<String, HashMap<String, AgentStrategyRegistration>>,
    endpoints: EndpointRouter<EndpointRegistration>,
}

fn instantiate(class: &ClassRef) -> Result<Arc<dyn PluginObject>, ScanError> {
    class
        .construct(&RuntimeContext::default())
        .map_err(|source| ScanError::Construct {
            class: class.name().to_string(),
            source,
        })
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every declared capability against `module`.
    pub fn build(module: &PluginModule, declaration: &PluginDeclaration) -> Result<Self, ScanError> {
        let mut registry = Self::new();
        let module = Some(module);

        for decl in &declaration.tool_providers {
            let provider =
                load_single_subclass(module, Marker::ToolProvider, decl.class.as_deref())?;
            let mut tools = HashMap::new();
            for tool in &decl.tools {
                let info = load_single_subclass(module, Marker::Tool, tool.class.as_deref())?;
                tools.insert(
                    tool.name.clone(),
                    ToolRegistration {
                        name: tool.name.clone(),
                        class: info.class,
                        cpu_bound: tool.cpu_bound,
                    },
                );
            }
            info!(provider = %decl.name, tools = tools.len(), "registered tool provider");
            registry.tool_providers.insert(
                decl.name.clone(),
                ToolProviderRegistration {
                    name: decl.name.clone(),
                    instance: instantiate(&provider.class)?,
                    tools,
                    cpu_bound: decl.cpu_bound,
                },
            );
        }

        for decl in &declaration.model_providers {
            let provider =
                load_single_subclass(module, Marker::ModelProvider, decl.class.as_deref())?;
            let mut models = HashMap::new();
            for info in find_sub_classes(module, Marker::Model)? {
                if info.class.is_abstract()
                    || (!decl.models.is_empty() && !decl.models.contains(&info.name))
                {
                    continue;
                }
                let instance = instantiate(&info.class)?;
                let model_type = instance
                    .as_model()
                    .map(|m| m.model_type())
                    .ok_or_else(|| ScanError::InvalidClass {
                        class: info.name.clone(),
                        marker: Marker::Model,
                    })?;
                models.insert(model_type, instance);
            }
            info!(provider = %decl.name, models = models.len(), "registered model provider");
            registry.model_providers.insert(
                decl.name.clone(),
                ModelProviderRegistration {
                    name: decl.name.clone(),
                    instance: instantiate(&provider.class)?,
                    models,
                    cpu_bound: decl.cpu_bound,
                },
            );
        }

        for decl in &declaration.agent_strategy_providers {
            let mut strategies = HashMap::new();
            for strategy in &decl.strategies {
                let info =
                    load_single_subclass(module, Marker::AgentStrategy, strategy.class.as_deref())?;
                strategies.insert(
                    strategy.name.clone(),
                    AgentStrategyRegistration {
                        provider: decl.name.clone(),
                        name: strategy.name.clone(),
                        class: info.class,
                        cpu_bound: strategy.cpu_bound,
                    },
                );
            }
            info!(provider = %decl.name, strategies = strategies.len(), "registered agent strategies");
            registry.agent_strategies.insert(decl.name.clone(), strategies);
        }

        for decl in &declaration.endpoints {
            let info = load_single_subclass(module, Marker::Endpoint, decl.class.as_deref())?;
            registry.endpoints.add(
                &decl.method,
                &decl.path,
                EndpointRegistration {
                    path: decl.path.clone(),
                    method: decl.method.clone(),
                    class: info.class,
                    cpu_bound: decl.cpu_bound,
                },
            )?;
            info!(method = %decl.method, path = %decl.path, "registered endpoint");
        }

        Ok(registry)
    }

    pub fn tool_provider(&self, provider: &str) -> Option<&ToolProviderRegistration> {
        self.tool_providers.get(provider)
    }

    pub fn tool(&self, provider: &str, tool: &str) -> Option<&ToolRegistration> {
        self.tool_providers.get(provider)?.tools.get(tool)
    }

    pub fn model_provider(&self, provider: &str) -> Option<&ModelProviderRegistration> {
        self.model_providers.get(provider)
    }

    pub fn model(&self, provider: &str, model_type: ModelType) -> Option<&Arc<dyn PluginObject>> {
        self.model_providers.get(provider)?.models.get(&model_type)
    }

    pub fn agent_strategy(&self, provider: &str, strategy: &str) -> Option<&AgentStrategyRegistration> {
        self.agent_strategies.get(provider)?.get(strategy)
    }

    pub fn dispatch_endpoint(
        &self,
        method: &str,
        path: &str,
    ) -> Option<EndpointMatch<'_, EndpointRegistration>> {
        self.endpoints.dispatch(method, path)
    }

    /// The tool provider registered under `provider`, if it is also an OAuth provider.
    pub fn oauth_provider(&self, provider: &str) -> Option<Arc<dyn PluginObject>> {
        self.tool_providers
            .get(provider)
            .filter(|r| r.instance.as_oauth_provider().is_some())
            .map(|r| r.instance.clone())
    }

    /// The tool provider registered under `provider`, if it can list dynamic options.
    pub fn dynamic_select(&self, provider: &str) -> Option<Arc<dyn PluginObject>> {
        self.tool_providers
            .get(provider)
            .filter(|r| r.instance.as_dynamic_select().is_some())
            .map(|r| r.instance.clone())
    }

    pub fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            tool_providers: self.tool_providers.len(),
            tools: self.tool_providers.values().map(|p| p.tools.len()).sum(),
            model_providers: self.model_providers.len(),
            models: self.model_providers.values().map(|p| p.models.len()).sum(),
            agent_strategies: self.agent_strategies.values().map(HashMap::len).sum(),
            endpoints: self.endpoints.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary() == RegistrySummary::default()
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    #[test]
    fn test_build_registry() {
        let registry = CapabilityRegistry::build(&demo_module(), &demo_declaration()).unwrap();
        let summary = registry.summary();
        assert_eq!(summary.tool_providers, 1);
        assert_eq!(summary.tools, 2);
        assert_eq!(summary.models, 1);
        assert_eq!(summary.agent_strategies, 1);
        assert_eq!(summary.endpoints, 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_empty_registry() {
        let registry = CapabilityRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.tool("demo", "echo").is_none());
        assert!(registry.dispatch_endpoint("GET", "/").is_none());
    }

    #[test]
    fn test_lookups() {
        let registry = CapabilityRegistry::build(&demo_module(), &demo_declaration()).unwrap();
        let echo = registry.tool("demo", "echo").unwrap();
        assert_eq!(echo.class.name(), "EchoTool");
        assert!(!echo.cpu_bound);
        assert!(registry.tool("demo", "sum").unwrap().cpu_bound);
        assert!(registry.tool("demo", "missing").is_none());
        assert!(registry.tool("other", "echo").is_none());

        assert!(registry.model("demo-models", ModelType::Llm).is_some());
        assert!(registry.model("demo-models", ModelType::Tts).is_none());
        assert!(registry.agent_strategy("agents", "steps").is_some());

        let m = registry.dispatch_endpoint("get", "/hello/world").unwrap();
        assert_eq!(m.params["name"], "world");
    }

    #[test]
    fn test_provider_doubles_as_oauth() {
        let registry = CapabilityRegistry::build(&demo_module(), &demo_declaration()).unwrap();
        assert!(registry.oauth_provider("demo").is_some());
        assert!(registry.dynamic_select("demo").is_none());
    }

    #[test]
    fn test_missing_class_fails_build() {
        let mut decl = demo_declaration();
        decl.endpoints[0].class = Some("Nope".into());
        let module = PluginModule::new().class::<HelloEndpoint>("HelloEndpoint");
        let decl = PluginDeclaration {
            endpoints: decl.endpoints,
            ..Default::default()
        };
        let err = CapabilityRegistry::build(&module, &decl).err().unwrap();
        assert!(matches!(err, ScanError::NotFound { marker: Marker::Endpoint, .. }));
    }

    #[test]
    fn test_declaration_from_toml() {
        let decl: PluginDeclaration = toml::from_str(
            r#"
            [[tool_providers]]
            name = "demo"

            [[tool_providers.tools]]
            name = "echo"
            class = "EchoTool"
            cpu_bound = true
            "#,
        )
        .unwrap();
        assert_eq!(decl.tool_providers[0].tools[0].name, "echo");
        assert!(decl.tool_providers[0].tools[0].cpu_bound);
        assert!(decl.endpoints.is_empty());
    }
}
