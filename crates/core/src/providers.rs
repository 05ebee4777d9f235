//! Provider keywords and the clients registered for them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use glue_llm::ChatProvider;

use crate::tool::{LocalFiles, PythonInterpreter, TavilySearch, ToolClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Model,
    Tool,
}

/// Keyword spellings that name the same provider.
const ALIASES: [(&str, &str); 3] = [
    ("anthropic_direct", "anthropic"),
    ("open_router", "openrouter"),
    ("javascript", "python"),
];

/// Provider for a tool block that names none, from the tool's name.
pub fn infer_tool_provider(tool: &str) -> Option<&'static str> {
    match tool {
        "web_search" | "search" | "web" => Some("tavily"),
        "file_handler" | "file" | "files" => Some("local"),
        "code_interpreter" | "code" | "interpreter" => Some("python"),
        _ => None,
    }
}

/// Provider keywords known at build time, and whether each one backs models
/// or tools.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    kinds: HashMap<String, ProviderKind>,
}

impl ProviderCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register("openrouter", ProviderKind::Model);
        catalog.register("tavily", ProviderKind::Tool);
        catalog.register("python", ProviderKind::Tool);
        catalog.register("local", ProviderKind::Tool);
        catalog
    }

    pub fn register(&mut self, name: &str, kind: ProviderKind) {
        self.kinds.insert(self.canonical(name), kind);
    }

    /// Lower-cased keyword with aliases applied.
    pub fn canonical(&self, keyword: &str) -> String {
        let lower = keyword.to_ascii_lowercase();
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == lower)
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or(lower)
    }

    pub fn kind(&self, provider: &str) -> Option<ProviderKind> {
        self.kinds.get(&self.canonical(provider)).copied()
    }
}

/// Runtime clients keyed by provider keyword.
#[derive(Clone, Default)]
pub struct Providers {
    models: HashMap<String, Arc<dyn ChatProvider>>,
    tools: HashMap<String, Arc<dyn ToolClient>>,
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut models: Vec<_> = self.models.keys().collect();
        let mut tools: Vec<_> = self.tools.keys().collect();
        models.sort();
        tools.sort();
        f.debug_struct("Providers")
            .field("models", &models)
            .field("tools", &tools)
            .finish()
    }
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bundled clients: OpenRouter, Tavily, the code interpreter and
    /// local files.
    pub fn builtin() -> Self {
        let providers = Self::new()
            .register_tool(Arc::new(TavilySearch::new()))
            .register_tool(Arc::new(PythonInterpreter::new()))
            .register_tool(Arc::new(LocalFiles::new()));
        #[cfg(feature = "openrouter")]
        let providers = providers.with_model(
            "openrouter",
            Arc::new(glue_llm::backends::openrouter::OpenRouter::from_env()),
        );
        providers
    }

    pub fn with_model(mut self, name: &str, provider: Arc<dyn ChatProvider>) -> Self {
        self.models.insert(name.to_ascii_lowercase(), provider);
        self
    }

    pub fn with_tool(mut self, name: &str, client: Arc<dyn ToolClient>) -> Self {
        self.tools.insert(name.to_ascii_lowercase(), client);
        self
    }

    /// Registers `client` under its own provider keyword.
    pub fn register_tool(self, client: Arc<dyn ToolClient>) -> Self {
        let name = client.provider().to_string();
        self.with_tool(&name, client)
    }

    pub fn model(&self, name: &str) -> Option<Arc<dyn ChatProvider>> {
        self.models.get(name).cloned()
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn ToolClient>> {
        self.tools.get(name).cloned()
    }

    /// Catalog of everything registered here.
    pub fn catalog(&self) -> ProviderCatalog {
        let mut catalog = ProviderCatalog::empty();
        for name in self.models.keys() {
            catalog.register(name, ProviderKind::Model);
        }
        for name in self.tools.keys() {
            catalog.register(name, ProviderKind::Tool);
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog() {
        let catalog = ProviderCatalog::builtin();
        assert_eq!(catalog.kind("openrouter"), Some(ProviderKind::Model));
        assert_eq!(catalog.kind("TAVILY"), Some(ProviderKind::Tool));
        assert_eq!(catalog.kind("javascript"), Some(ProviderKind::Tool));
        assert_eq!(catalog.kind("groq"), None);
        assert_eq!(catalog.canonical("Anthropic_Direct"), "anthropic");
    }

    #[test]
    fn test_infer_tool_provider() {
        assert_eq!(infer_tool_provider("web_search"), Some("tavily"));
        assert_eq!(infer_tool_provider("files"), Some("local"));
        assert_eq!(infer_tool_provider("code"), Some("python"));
        assert_eq!(infer_tool_provider("calculator"), None);
    }

    #[test]
    fn test_builtin_providers_match_catalog() {
        let providers = Providers::builtin();
        let catalog = providers.catalog();
        for tool in ["tavily", "python", "local"] {
            assert_eq!(providers.tool(tool).unwrap().provider(), tool);
            assert_eq!(catalog.kind(tool), Some(ProviderKind::Tool));
        }
        assert!(providers.model("openrouter").is_some());
        assert!(format!("{providers:?}").contains("openrouter"));
    }

    #[test]
    fn test_register_tool_uses_provider_keyword() {
        let providers = Providers::new().register_tool(Arc::new(LocalFiles::new()));
        assert!(providers.tool("local").is_some());
        assert!(providers.tool("python").is_none());
        assert_eq!(providers.catalog().kind("local"), Some(ProviderKind::Tool));
    }
}
