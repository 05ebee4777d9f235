use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::dsl::{self, Document};
use crate::engine::{Engine, EngineConfig};
use crate::error::Error;
use crate::graph::BindingGraph;
use crate::providers::{ProviderCatalog, Providers};
use crate::registry::{BuildError, BuildOptions, Registry};
use crate::secret::SecretResolver;

/// A parsed, resolved and bound `.glue` program, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    document: Document,
    registry: Registry,
    graph: BindingGraph,
}

impl Program {
    /// Parse, build the registry and bind. The source must end with
    /// `apply glue`.
    pub fn parse(
        source: &str,
        catalog: &ProviderCatalog,
        options: &BuildOptions,
    ) -> Result<Self, Error> {
        let document = dsl::parse(source)?;
        if !document.applied {
            return Err(BuildError::NotApplied.into());
        }
        let registry = Registry::build(&document, catalog, options)?;
        let graph = BindingGraph::build(&registry)?;
        info!(
            "Loaded `{}`: {} model(s), {} tool(s), {} binding(s)",
            registry.app().name,
            registry.models().len(),
            registry.tools().len(),
            graph.bindings().len()
        );
        Ok(Self {
            document,
            registry,
            graph,
        })
    }

    pub async fn from_path(
        path: impl AsRef<Path>,
        catalog: &ProviderCatalog,
        options: &BuildOptions,
    ) -> Result<Self, Error> {
        let source = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::parse(&source, catalog, options)
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn graph(&self) -> &BindingGraph {
        &self.graph
    }

    pub fn into_parts(self) -> (Registry, BindingGraph) {
        (self.registry, self.graph)
    }

    /// An engine for this program with the app block's settings applied on
    /// top of `config`.
    pub fn into_engine(
        self,
        providers: Providers,
        secrets: Arc<dyn SecretResolver>,
        config: EngineConfig,
    ) -> Engine {
        let config = config.with_app_overrides(&self.registry.app().settings);
        Engine::new(self.registry, self.graph, providers, secrets, config)
    }
}
