//! The binding graph: models and tools as nodes, tape/glue/magnet bindings
//! as directed edges. Cycles are allowed; termination is the engine's job.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use serde::Serialize;
use strum_macros::Display;

use crate::dsl::{Decl, Document};
use crate::registry::{BuildError, CoordinatorSpec, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum NodeKind {
    Model,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BindingKind {
    /// Model output feeds another model.
    Tape,
    /// Tool owned by exactly one model.
    Glue,
    /// Tool shared between models.
    Magnet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub kind: BindingKind,
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingGraph {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
    bindings: Vec<Binding>,
    entry: NodeId,
    /// Tape edges that close a cycle, as `(from, to)`.
    feedback: HashSet<(NodeId, NodeId)>,
}

impl BindingGraph {
    /// Build the graph for `registry`. Pure; nothing is contacted.
    pub fn build(registry: &Registry) -> Result<Self, BuildError> {
        let mut builder = GraphBuilder::new(registry);

        if let Some(coordinator) = registry.coordinator() {
            for chain in &coordinator.tape {
                for pair in chain.windows(2) {
                    builder.tape(&pair[0], &pair[1])?;
                }
            }
        }

        for model in registry.models() {
            for tool in &model.chain {
                builder.glue(tool, &model.name, &format!("tool chain of `{}`", model.name))?;
            }
        }

        if let Some(coordinator) = registry.coordinator() {
            for (tool, model) in &coordinator.glue {
                builder.glue(tool, model, "glue")?;
            }
            for (tool, models) in &coordinator.magnets {
                for model in models {
                    builder.magnet(tool, model, "magnets")?;
                }
            }
        }

        let entry = match registry.coordinator() {
            Some(coordinator) => {
                for member in &coordinator.models {
                    builder.model(member, "coordinator models")?;
                }
                let entry = coordinator
                    .entry
                    .clone()
                    .or_else(|| coordinator.members().into_iter().next())
                    .ok_or_else(|| BuildError::InvalidValue {
                        block: coordinator.name.clone(),
                        key: "models".to_string(),
                        reason: "no member models".to_string(),
                    })?;
                builder.model(&entry, "entry")?
            }
            None => {
                let entry = builder.model(&registry.app().model, "app model")?;
                for tool in &registry.app().tools {
                    let id = builder.tool(tool, "app tools")?;
                    if !builder.graph.bindings.iter().any(|b| b.from == id) {
                        builder.push(BindingKind::Magnet, id, entry);
                    }
                }
                entry
            }
        };

        builder.graph.entry = entry;
        builder.mark_feedback();
        Ok(builder.graph)
    }

    /// Rebuild from a rendered binding section (see [`Self::to_glue_section`]).
    /// The first coordinator-shaped block of `document` replaces any
    /// coordinator in `registry`.
    pub fn from_section(document: &Document, registry: &Registry) -> Result<Self, BuildError> {
        let block = document
            .items
            .iter()
            .find_map(|item| match item {
                Decl::Block(b) if b.words().next().is_none() => Some(b),
                _ => None,
            })
            .ok_or_else(|| BuildError::InvalidValue {
                block: "<document>".to_string(),
                key: "glue".to_string(),
                reason: "no binding section found".to_string(),
            })?;
        let coordinator = CoordinatorSpec::from_block(block)?;
        Self::build(&registry.with_coordinator(Some(coordinator)))
    }

    /// Render every binding as a coordinator block named `name`.
    pub fn to_glue_section(&self, name: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{name} {{");

        let models: Vec<&str> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Model)
            .map(|n| n.name.as_str())
            .collect();
        let _ = writeln!(out, "    models = [{}]", models.join(", "));
        let _ = writeln!(out, "    entry = {}", self.name(self.entry));

        let mut chains: Vec<Vec<&str>> = Vec::new();
        for binding in self.of_kind(BindingKind::Tape) {
            match chains.last_mut() {
                Some(chain) if chain.last() == Some(&self.name(binding.from)) => {
                    chain.push(self.name(binding.to))
                }
                _ => chains.push(vec![self.name(binding.from), self.name(binding.to)]),
            }
        }
        if !chains.is_empty() {
            let rendered: Vec<String> = chains.iter().map(|c| c.join(" >> ")).collect();
            let _ = writeln!(out, "    double_side_tape = {{ {} }}", rendered.join(", "));
        }

        let glue: Vec<String> = self
            .of_kind(BindingKind::Glue)
            .map(|b| format!("{}: {}", self.name(b.from), self.name(b.to)))
            .collect();
        if !glue.is_empty() {
            let _ = writeln!(out, "    glue {{ {} }}", glue.join(", "));
        }

        let mut magnets: Vec<(&str, Vec<&str>)> = Vec::new();
        for binding in self.of_kind(BindingKind::Magnet) {
            let tool = self.name(binding.from);
            match magnets.last_mut() {
                Some((last, models)) if *last == tool => models.push(self.name(binding.to)),
                _ => magnets.push((tool, vec![self.name(binding.to)])),
            }
        }
        if !magnets.is_empty() {
            let rendered: Vec<String> = magnets
                .iter()
                .map(|(tool, models)| format!("{tool}: [{}]", models.join(", ")))
                .collect();
            let _ = writeln!(out, "    magnets {{ {} }}", rendered.join(", "));
        }

        out.push('}');
        out
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    fn of_kind(&self, kind: BindingKind) -> impl Iterator<Item = &Binding> {
        self.bindings.iter().filter(move |b| b.kind == kind)
    }

    /// Tape successors of `model`, in binding order.
    pub fn successors(&self, model: NodeId) -> Vec<NodeId> {
        self.of_kind(BindingKind::Tape)
            .filter(|b| b.from == model)
            .map(|b| b.to)
            .collect()
    }

    /// Tape predecessors of `model`, in binding order.
    pub fn predecessors(&self, model: NodeId) -> Vec<NodeId> {
        self.of_kind(BindingKind::Tape)
            .filter(|b| b.to == model)
            .map(|b| b.from)
            .collect()
    }

    /// Predecessors over forward (non-feedback) tape edges.
    pub fn forward_predecessors(&self, model: NodeId) -> Vec<NodeId> {
        self.of_kind(BindingKind::Tape)
            .filter(|b| b.to == model && !self.is_feedback(b.from, b.to))
            .map(|b| b.from)
            .collect()
    }

    /// Whether the tape edge `from >> to` leads back to a model that is
    /// still upstream of `from`, i.e. it starts another pass.
    pub fn is_feedback(&self, from: NodeId, to: NodeId) -> bool {
        self.feedback.contains(&(from, to))
    }

    /// Models reachable from `start` over tape edges, `start` included.
    pub fn reachable(&self, start: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::from([start]);
        let mut queue = vec![start];
        while let Some(model) = queue.pop() {
            for next in self.successors(model) {
                if seen.insert(next) {
                    queue.push(next);
                }
            }
        }
        seen
    }

    /// Tools glued or magnet-bound to `model`.
    pub fn tools_of(&self, model: NodeId) -> Vec<(NodeId, BindingKind)> {
        self.bindings
            .iter()
            .filter(|b| b.kind != BindingKind::Tape && b.to == model)
            .map(|b| (b.from, b.kind))
            .collect()
    }

    /// Model a tool is glued to, if any.
    pub fn glue_owner(&self, tool: NodeId) -> Option<NodeId> {
        self.of_kind(BindingKind::Glue)
            .find(|b| b.from == tool)
            .map(|b| b.to)
    }
}

struct GraphBuilder {
    graph: BindingGraph,
}

impl GraphBuilder {
    fn new(registry: &Registry) -> Self {
        let nodes: Vec<Node> = registry
            .models()
            .iter()
            .map(|m| Node {
                name: m.name.clone(),
                kind: NodeKind::Model,
            })
            .chain(registry.tools().iter().map(|t| Node {
                name: t.name.clone(),
                kind: NodeKind::Tool,
            }))
            .collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), NodeId(i)))
            .collect();
        Self {
            graph: BindingGraph {
                nodes,
                index,
                bindings: Vec::new(),
                entry: NodeId(0),
                feedback: HashSet::new(),
            },
        }
    }

    fn lookup(&self, name: &str, context: &str) -> Result<NodeId, BuildError> {
        self.graph.id(name).ok_or_else(|| BuildError::UnknownReference {
            name: name.to_string(),
            context: context.to_string(),
        })
    }

    fn model(&self, name: &str, context: &str) -> Result<NodeId, BuildError> {
        let id = self.lookup(name, context)?;
        if self.graph.node(id).kind != NodeKind::Model {
            return Err(BuildError::InvalidValue {
                block: context.to_string(),
                key: name.to_string(),
                reason: "expected a model, found a tool".to_string(),
            });
        }
        Ok(id)
    }

    fn tool(&self, name: &str, context: &str) -> Result<NodeId, BuildError> {
        let id = self.lookup(name, context)?;
        if self.graph.node(id).kind != NodeKind::Tool {
            return Err(BuildError::InvalidValue {
                block: context.to_string(),
                key: name.to_string(),
                reason: "expected a tool, found a model".to_string(),
            });
        }
        Ok(id)
    }

    fn push(&mut self, kind: BindingKind, from: NodeId, to: NodeId) {
        let binding = Binding { kind, from, to };
        if !self.graph.bindings.contains(&binding) {
            self.graph.bindings.push(binding);
        }
    }

    fn endpoints(
        &self,
        from: &str,
        to: &str,
        context: &str,
        expect: (NodeKind, NodeKind),
        reason: &str,
    ) -> Result<(NodeId, NodeId), BuildError> {
        let f = self.lookup(from, context)?;
        let t = self.lookup(to, context)?;
        if (self.graph.node(f).kind, self.graph.node(t).kind) != expect {
            return Err(BuildError::InvalidBinding {
                from: from.to_string(),
                to: to.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok((f, t))
    }

    fn tape(&mut self, from: &str, to: &str) -> Result<(), BuildError> {
        let (f, t) = self.endpoints(
            from,
            to,
            "double_side_tape",
            (NodeKind::Model, NodeKind::Model),
            "tape connects models only",
        )?;
        self.push(BindingKind::Tape, f, t);
        Ok(())
    }

    fn glue(&mut self, tool: &str, model: &str, context: &str) -> Result<(), BuildError> {
        let (f, t) = self.endpoints(
            tool,
            model,
            context,
            (NodeKind::Tool, NodeKind::Model),
            "glue binds a tool to a model",
        )?;
        if let Some(existing) = self.graph.glue_owner(f) {
            if existing != t {
                return Err(BuildError::ConflictingBinding {
                    tool: tool.to_string(),
                    existing: self.graph.name(existing).to_string(),
                    attempted: model.to_string(),
                });
            }
        }
        self.push(BindingKind::Glue, f, t);
        Ok(())
    }

    /// Depth-first walk over tape edges, entry first, then every other
    /// model in declaration order. An edge into a model still on the walk
    /// stack is a feedback edge.
    fn mark_feedback(&mut self) {
        #[derive(Clone, Copy, PartialEq)]
        enum Visit {
            New,
            Active,
            Done,
        }

        let graph = &self.graph;
        let mut state = vec![Visit::New; graph.nodes.len()];
        let mut feedback = HashSet::new();
        let roots = std::iter::once(graph.entry).chain(
            (0..graph.nodes.len())
                .map(NodeId)
                .filter(|id| graph.node(*id).kind == NodeKind::Model),
        );

        for root in roots {
            if state[root.0] != Visit::New {
                continue;
            }
            state[root.0] = Visit::Active;
            let mut stack = vec![(root, graph.successors(root), 0usize)];
            while let Some(top) = stack.last_mut() {
                let node = top.0;
                match top.1.get(top.2).copied() {
                    Some(next) => {
                        top.2 += 1;
                        match state[next.0] {
                            Visit::New => {
                                state[next.0] = Visit::Active;
                                stack.push((next, graph.successors(next), 0));
                            }
                            Visit::Active => {
                                feedback.insert((node, next));
                            }
                            Visit::Done => {}
                        }
                    }
                    None => {
                        state[node.0] = Visit::Done;
                        stack.pop();
                    }
                }
            }
        }
        self.graph.feedback = feedback;
    }

    fn magnet(&mut self, tool: &str, model: &str, context: &str) -> Result<(), BuildError> {
        let (f, t) = self.endpoints(
            tool,
            model,
            context,
            (NodeKind::Tool, NodeKind::Model),
            "magnets bind a tool to models",
        )?;
        self.push(BindingKind::Magnet, f, t);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse;
    use crate::providers::ProviderCatalog;
    use crate::registry::BuildOptions;

    fn registry(source: &str) -> Registry {
        Registry::build(
            &parse(source).unwrap(),
            &ProviderCatalog::builtin(),
            &BuildOptions::default(),
        )
        .unwrap()
    }

    const TEAM: &str = r#"
        glue app { tools = web_search, file_handler, code_interpreter, model = team }
        planner { openrouter }
        researcher { openrouter }
        executor { openrouter }
        validator { openrouter }
        web_search { tavily }
        file_handler { local }
        code_interpreter { python }
        team {
            models = planner, researcher, executor, validator
            double_side_tape = { planner >> researcher >> executor >> validator >> planner }
            glue { web_search: researcher, file_handler: executor }
            magnets { code_interpreter: [executor, validator] }
        }
        apply glue
    "#;

    #[test]
    fn test_team_graph() {
        let graph = BindingGraph::build(&registry(TEAM)).unwrap();
        let id = |n: &str| graph.id(n).unwrap();

        assert_eq!(graph.name(graph.entry()), "planner");
        assert_eq!(graph.successors(id("validator")), vec![id("planner")]);
        assert_eq!(graph.predecessors(id("planner")), vec![id("validator")]);
        assert_eq!(graph.glue_owner(id("web_search")), Some(id("researcher")));
        assert_eq!(
            graph.tools_of(id("executor")),
            vec![
                (id("file_handler"), BindingKind::Glue),
                (id("code_interpreter"), BindingKind::Magnet)
            ]
        );
        assert_eq!(
            graph
                .bindings()
                .iter()
                .filter(|b| b.kind == BindingKind::Tape)
                .count(),
            4
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = BindingGraph::build(&registry(TEAM)).unwrap();
        let b = BindingGraph::build(&registry(TEAM)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_conflicting_glue() {
        let source = TEAM.replace(
            "glue { web_search: researcher, file_handler: executor }",
            "glue { web_search: researcher, web_search: planner }",
        );
        let err = BindingGraph::build(&registry(&source)).unwrap_err();
        assert_eq!(
            err,
            BuildError::ConflictingBinding {
                tool: "web_search".into(),
                existing: "researcher".into(),
                attempted: "planner".into()
            }
        );
    }

    #[test]
    fn test_identical_glue_is_noop() {
        let source = TEAM.replace(
            "glue { web_search: researcher, file_handler: executor }",
            "glue { web_search: researcher, web_search: researcher }",
        );
        let graph = BindingGraph::build(&registry(&source)).unwrap();
        let glued = graph
            .bindings()
            .iter()
            .filter(|b| b.kind == BindingKind::Glue)
            .count();
        assert_eq!(glued, 1);
    }

    #[test]
    fn test_opposite_tape_pairs_are_kept() {
        let source = TEAM.replace(
            "planner >> researcher >> executor >> validator >> planner",
            "planner >> researcher, researcher >> planner",
        );
        let graph = BindingGraph::build(&registry(&source)).unwrap();
        let planner = graph.id("planner").unwrap();
        let researcher = graph.id("researcher").unwrap();
        assert_eq!(graph.successors(planner), vec![researcher]);
        assert_eq!(graph.successors(researcher), vec![planner]);
    }

    #[test]
    fn test_feedback_edges() {
        let graph = BindingGraph::build(&registry(TEAM)).unwrap();
        let id = |name: &str| graph.id(name).unwrap();
        assert!(graph.is_feedback(id("validator"), id("planner")));
        assert!(!graph.is_feedback(id("planner"), id("researcher")));
        assert!(graph.forward_predecessors(id("planner")).is_empty());
        assert_eq!(graph.predecessors(id("planner")), vec![id("validator")]);

        // Uneven fan-in without a cycle has no feedback edges.
        let source = TEAM.replace(
            "planner >> researcher >> executor >> validator >> planner",
            "planner >> researcher >> validator, planner >> validator",
        );
        let graph = BindingGraph::build(&registry(&source)).unwrap();
        let id = |name: &str| graph.id(name).unwrap();
        assert!(graph
            .bindings()
            .iter()
            .all(|b| !graph.is_feedback(b.from, b.to)));
        assert_eq!(
            graph.forward_predecessors(id("validator")),
            vec![id("researcher"), id("planner")]
        );
    }

    #[test]
    fn test_invalid_endpoints() {
        let source = TEAM.replace("validator >> planner", "validator >> web_search");
        assert!(matches!(
            BindingGraph::build(&registry(&source)),
            Err(BuildError::InvalidBinding { to, .. }) if to == "web_search"
        ));

        let source = TEAM.replace("file_handler: executor", "file_handler: ghost");
        assert_eq!(
            BindingGraph::build(&registry(&source)).unwrap_err(),
            BuildError::UnknownReference {
                name: "ghost".into(),
                context: "glue".into()
            }
        );

        let source = TEAM.replace("[executor, validator]", "[executor, web_search]");
        assert!(matches!(
            BindingGraph::build(&registry(&source)),
            Err(BuildError::InvalidBinding { .. })
        ));
    }

    #[test]
    fn test_single_model_implicit_magnets() {
        let registry = registry(
            r#"
            glue app { tools = web_search, code_interpreter, model = researcher }
            researcher { openrouter double_side_tape = { web_search } }
            web_search { tavily }
            code_interpreter { python }
            apply glue
            "#,
        );
        let graph = BindingGraph::build(&registry).unwrap();
        let researcher = graph.id("researcher").unwrap();
        assert_eq!(graph.entry(), researcher);
        assert_eq!(
            graph.tools_of(researcher),
            vec![
                (graph.id("web_search").unwrap(), BindingKind::Glue),
                (graph.id("code_interpreter").unwrap(), BindingKind::Magnet)
            ]
        );
    }

    #[test]
    fn test_explicit_entry() {
        let source = TEAM.replace("models = planner", "entry = researcher\n models = planner");
        let graph = BindingGraph::build(&registry(&source)).unwrap();
        assert_eq!(graph.name(graph.entry()), "researcher");
    }

    #[test]
    fn test_section_round_trip() {
        let registry = registry(TEAM);
        let graph = BindingGraph::build(&registry).unwrap();
        let text = graph.to_glue_section("team");
        let rebuilt = BindingGraph::from_section(&parse(&text).unwrap(), &registry).unwrap();
        assert_eq!(graph, rebuilt);
    }
}
