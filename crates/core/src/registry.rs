//! Typed resources resolved from a parsed [`Document`].

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::dsl::{Block, Decl, Document, Value};
use crate::providers::{infer_tool_provider, ProviderCatalog, ProviderKind};
use crate::secret::SecretRef;

pub const DEFAULT_MODEL: &str = "liquid/lfm-40b:free";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

const ROLE_SUFFIXES: [&str; 6] = [
    "_role",
    "_system",
    "_prompt",
    "_instruction",
    "_behavior",
    "_personality",
];

const TOP_LEVEL: &str = "<top level>";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("`{name}` is defined more than once")]
    DuplicateDefinition { name: String },

    #[error("block `{block}` uses unknown provider `{provider}`")]
    UnknownProvider { block: String, provider: String },

    #[error("tool `{tool}` is glued to `{existing}` and cannot also be glued to `{attempted}`")]
    ConflictingBinding {
        tool: String,
        existing: String,
        attempted: String,
    },

    #[error("{context} references undeclared `{name}`")]
    UnknownReference { name: String, context: String },

    #[error("invalid binding `{from}` -> `{to}`: {reason}")]
    InvalidBinding {
        from: String,
        to: String,
        reason: String,
    },

    #[error("invalid value for `{key}` in `{block}`: {reason}")]
    InvalidValue {
        block: String,
        key: String,
        reason: String,
    },

    #[error("no `glue app` block found")]
    MissingApp,

    #[error("block `{block}` declares no provider")]
    MissingProvider { block: String },

    #[error("configuration does not end with `apply glue`")]
    NotApplied,
}

fn invalid(block: &str, key: &str, reason: impl Into<String>) -> BuildError {
    BuildError::InvalidValue {
        block: block.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// What to do with a provider keyword the catalog does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownProviderPolicy {
    /// Fail the build with [`BuildError::UnknownProvider`].
    #[default]
    Reject,
    /// Keep the block; the engine re-checks at activation.
    Defer,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub unknown_provider: UnknownProviderPolicy,
}

impl BuildOptions {
    pub fn defer_unknown_providers(mut self) -> Self {
        self.unknown_provider = UnknownProviderPolicy::Defer;
        self
    }
}

/// Optional run settings declared in the app block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    pub max_iterations: Option<u32>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub approval: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub name: String,
    pub tools: Vec<String>,
    /// Entry model, or the coordinator block.
    pub model: String,
    pub settings: AppSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub secret: Option<SecretRef>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub role: Option<String>,
    /// Fixed tool chain run before every call, in order.
    pub chain: Vec<String>,
    pub params: BTreeMap<String, Json>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            secret: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: None,
            role: None,
            chain: Vec::new(),
            params: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub provider: String,
    pub secret: Option<SecretRef>,
    pub params: BTreeMap<String, Json>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            secret: None,
            params: BTreeMap::new(),
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Json::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Json::as_u64)
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(Json::as_f64)
    }
}

/// The coordinating block named by the app's `model` key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CoordinatorSpec {
    pub name: String,
    pub models: Vec<String>,
    /// `a >> b >> c` chains in declaration order.
    pub tape: Vec<Vec<String>>,
    /// `(tool, model)` pairs.
    pub glue: Vec<(String, String)>,
    /// `(tool, models)` pairs.
    pub magnets: Vec<(String, Vec<String>)>,
    pub entry: Option<String>,
}

impl CoordinatorSpec {
    const KEYS: [&'static str; 7] = [
        "models",
        "double_side_tape",
        "chain",
        "sequence",
        "glue",
        "magnets",
        "entry",
    ];

    fn looks_like(block: &Block) -> bool {
        block.words().next().is_none()
            && block.body.iter().any(|d| match d {
                Decl::Assign { key, .. } => Self::KEYS.contains(&key.as_str()),
                Decl::Block(b) => b.name == "glue" || b.name == "magnets",
                _ => false,
            })
    }

    /// Read a coordinator block. Endpoints are validated by the graph builder.
    pub fn from_block(block: &Block) -> Result<Self, BuildError> {
        let mut spec = CoordinatorSpec {
            name: block.name.clone(),
            ..Default::default()
        };
        for decl in &block.body {
            match decl {
                Decl::Assign { key, value } => match key.as_str() {
                    "models" => spec.models = value.as_names(),
                    "entry" => {
                        spec.entry = Some(
                            value
                                .as_str()
                                .ok_or_else(|| invalid(&block.name, key, "expected a model name"))?
                                .to_string(),
                        )
                    }
                    "double_side_tape" | "chain" | "sequence" => {
                        spec.tape.extend(tape_chains(&block.name, key, value)?)
                    }
                    "glue" => spec.glue.extend(
                        binding_entries(&block.name, key, object_body(&block.name, key, value)?)?
                            .into_iter()
                            .flat_map(|(tool, models)| {
                                models.into_iter().map(move |m| (tool.clone(), m))
                            }),
                    ),
                    "magnets" => spec.magnets.extend(binding_entries(
                        &block.name,
                        key,
                        object_body(&block.name, key, value)?,
                    )?),
                    other => return Err(invalid(&block.name, other, "unknown coordinator setting")),
                },
                Decl::Block(b) if b.name == "glue" => spec.glue.extend(
                    binding_entries(&block.name, "glue", &b.body)?
                        .into_iter()
                        .flat_map(|(tool, models)| models.into_iter().map(move |m| (tool.clone(), m))),
                ),
                Decl::Block(b) if b.name == "magnets" => {
                    spec.magnets
                        .extend(binding_entries(&block.name, "magnets", &b.body)?)
                }
                other => {
                    return Err(invalid(
                        &block.name,
                        &describe(other),
                        "unexpected declaration in coordinator",
                    ))
                }
            }
        }
        Ok(spec)
    }

    /// Member models: the explicit list, else tape endpoints in order.
    pub fn members(&self) -> Vec<String> {
        if !self.models.is_empty() {
            return self.models.clone();
        }
        let mut seen = HashSet::new();
        self.tape
            .iter()
            .flatten()
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }
}

fn object_body<'a>(block: &str, key: &str, value: &'a Value) -> Result<&'a [Decl], BuildError> {
    match value {
        Value::Object(decls) => Ok(decls),
        _ => Err(invalid(block, key, "expected `{ tool: model, ... }`")),
    }
}

fn tape_chains(block: &str, key: &str, value: &Value) -> Result<Vec<Vec<String>>, BuildError> {
    match value {
        Value::Chain(names) => Ok(vec![names.clone()]),
        Value::Object(decls) => decls
            .iter()
            .map(|d| match d {
                Decl::Chain(names) => Ok(names.clone()),
                other => Err(invalid(
                    block,
                    key,
                    format!("expected `a >> b`, found `{}`", describe(other)),
                )),
            })
            .collect(),
        _ => Err(invalid(block, key, "expected `{ a >> b, ... }`")),
    }
}

fn binding_entries(
    block: &str,
    key: &str,
    decls: &[Decl],
) -> Result<Vec<(String, Vec<String>)>, BuildError> {
    decls
        .iter()
        .map(|d| match d {
            Decl::Entry { key: tool, value } | Decl::Assign { key: tool, value } => {
                let models = value.as_names();
                if models.is_empty() {
                    Err(invalid(block, key, format!("`{tool}` binds to no model")))
                } else {
                    Ok((tool.clone(), models))
                }
            }
            other => Err(invalid(
                block,
                key,
                format!("expected `tool: model`, found `{}`", describe(other)),
            )),
        })
        .collect()
}

fn describe(decl: &Decl) -> String {
    match decl {
        Decl::Assign { key, .. } | Decl::Entry { key, .. } => key.clone(),
        Decl::Block(b) => b.name.clone(),
        Decl::Word(w) => w.clone(),
        Decl::Secret(r) => r.to_string(),
        Decl::Chain(names) => names.join(" >> "),
    }
}

/// Model name targeted by `<model>_role = "..."` and its suffix variants.
fn role_target(key: &str) -> Option<&str> {
    ROLE_SUFFIXES
        .iter()
        .find_map(|suffix| key.strip_suffix(suffix))
        .filter(|model| !model.is_empty())
}

fn is_app_block(block: &Block) -> bool {
    match block.keyword.as_deref() {
        Some("glue") => matches!(block.name.as_str(), "app" | "application"),
        None => matches!(block.name.as_str(), "app" | "application"),
        Some(_) => false,
    }
}

fn to_json(block: &str, key: &str, value: &Value) -> Result<Json, BuildError> {
    Ok(match value {
        Value::Str(s) | Value::Ident(s) => Json::String(s.clone()),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Json::from(*n as i64),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .ok_or_else(|| invalid(block, key, "number out of range"))?,
        Value::Bool(b) => Json::Bool(*b),
        Value::List(items) => Json::Array(
            items
                .iter()
                .map(|v| to_json(block, key, v))
                .collect::<Result<_, _>>()?,
        ),
        Value::Chain(names) => Json::Array(names.iter().cloned().map(Json::String).collect()),
        Value::Object(decls) => {
            let mut map = serde_json::Map::new();
            for decl in decls {
                match decl {
                    Decl::Assign { key: k, value } | Decl::Entry { key: k, value } => {
                        map.insert(k.clone(), to_json(block, k, value)?);
                    }
                    other => {
                        return Err(invalid(
                            block,
                            key,
                            format!("unexpected `{}` in object", describe(other)),
                        ))
                    }
                }
            }
            Json::Object(map)
        }
        Value::Secret(r) => {
            return Err(invalid(
                block,
                key,
                format!("secret `{r}` may only be used as the block's credential"),
            ))
        }
    })
}

fn number(block: &str, key: &str, value: &Value) -> Result<f64, BuildError> {
    value
        .as_number()
        .filter(|n| n.is_finite())
        .ok_or_else(|| invalid(block, key, "expected a number"))
}

fn unsigned(block: &str, key: &str, value: &Value, min: u32) -> Result<u32, BuildError> {
    let n = number(block, key, value)?;
    if n.fract() != 0.0 || n < f64::from(min) || n > f64::from(u32::MAX) {
        return Err(invalid(
            block,
            key,
            format!("expected a whole number of at least {min}"),
        ));
    }
    Ok(n as u32)
}

fn ranged(block: &str, key: &str, value: &Value, lo: f64, hi: f64) -> Result<f32, BuildError> {
    let n = number(block, key, value)?;
    if !(lo..=hi).contains(&n) {
        return Err(invalid(block, key, format!("expected a value in {lo}..={hi}")));
    }
    Ok(n as f32)
}

fn string(block: &str, key: &str, value: &Value) -> Result<String, BuildError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(block, key, "expected a string"))
}

fn set_secret(
    slot: &mut Option<SecretRef>,
    block: &str,
    reference: &SecretRef,
) -> Result<(), BuildError> {
    if slot.is_some() {
        return Err(invalid(block, "os", "more than one secret reference"));
    }
    *slot = Some(reference.clone());
    Ok(())
}

fn parse_app(block: &Block) -> Result<AppSpec, BuildError> {
    let ctx = "app";
    let mut name = None;
    let mut tools = Vec::new();
    let mut model = None;
    let mut settings = AppSettings::default();

    for decl in &block.body {
        let Decl::Assign { key, value } = decl else {
            return Err(invalid(ctx, &describe(decl), "expected `key = value`"));
        };
        match key.as_str() {
            "name" | "app_name" | "title" => name = Some(string(ctx, key, value)?),
            "tools" | "components" => tools = value.as_names(),
            "model" | "agent" => model = Some(string(ctx, key, value)?),
            "max_iterations" => settings.max_iterations = Some(unsigned(ctx, key, value, 1)?),
            "retries" => settings.retries = Some(unsigned(ctx, key, value, 0)?),
            "timeout" => {
                let secs = number(ctx, key, value)?;
                if secs <= 0.0 {
                    return Err(invalid(ctx, key, "expected a positive number of seconds"));
                }
                let timeout = Duration::try_from_secs_f64(secs)
                    .map_err(|e| invalid(ctx, key, e.to_string()))?;
                settings.timeout = Some(timeout);
            }
            "approval" => settings.approval = Some(string(ctx, key, value)?),
            other => return Err(invalid(ctx, other, "unknown app setting")),
        }
    }

    let mut seen = HashSet::new();
    if let Some(dup) = tools.iter().find(|t| !seen.insert(t.as_str())) {
        return Err(BuildError::DuplicateDefinition { name: dup.clone() });
    }

    Ok(AppSpec {
        name: name.unwrap_or_else(|| "app".to_string()),
        tools,
        model: model.ok_or_else(|| invalid(ctx, "model", "missing entry model"))?,
        settings,
    })
}

/// Registry of the resources a program declares.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    app: AppSpec,
    models: Vec<ModelSpec>,
    tools: Vec<ToolSpec>,
    coordinator: Option<CoordinatorSpec>,
}

impl Registry {
    /// Resolve every block of `document`. Secret references stay unresolved.
    pub fn build(
        document: &Document,
        catalog: &ProviderCatalog,
        options: &BuildOptions,
    ) -> Result<Self, BuildError> {
        let mut app_block = None;
        let mut blocks: Vec<&Block> = Vec::new();
        let mut names = HashSet::new();
        let mut roles: Vec<(&str, String)> = Vec::new();
        let mut tool_paths: Vec<(&str, String)> = Vec::new();

        for item in &document.items {
            match item {
                Decl::Block(block) if is_app_block(block) => {
                    if app_block.replace(block).is_some() {
                        return Err(BuildError::DuplicateDefinition {
                            name: "app".to_string(),
                        });
                    }
                }
                Decl::Block(block) => {
                    if let Some(keyword) = &block.keyword {
                        return Err(invalid(&block.name, keyword, "unexpected block keyword"));
                    }
                    if !names.insert(block.name.as_str()) {
                        return Err(BuildError::DuplicateDefinition {
                            name: block.name.clone(),
                        });
                    }
                    blocks.push(block);
                }
                Decl::Assign { key, value } => match role_target(key) {
                    Some(model) => roles.push((model, string(TOP_LEVEL, key, value)?)),
                    None => return Err(invalid(TOP_LEVEL, key, "unknown top-level setting")),
                },
                Decl::Entry { key, value } => {
                    if tool_paths.iter().any(|(t, _)| *t == key.as_str()) {
                        return Err(BuildError::DuplicateDefinition { name: key.clone() });
                    }
                    tool_paths.push((key.as_str(), string(TOP_LEVEL, key, value)?));
                }
                other => {
                    return Err(invalid(
                        TOP_LEVEL,
                        &describe(other),
                        "unexpected top-level declaration",
                    ))
                }
            }
        }

        let app = parse_app(app_block.ok_or(BuildError::MissingApp)?)?;

        let coordinator = blocks
            .iter()
            .find(|b| b.name == app.model && CoordinatorSpec::looks_like(b))
            .map(|b| CoordinatorSpec::from_block(b))
            .transpose()?;

        let mut models = Vec::new();
        let mut tools = Vec::new();
        for block in blocks {
            if coordinator.as_ref().is_some_and(|c| c.name == block.name) {
                continue;
            }
            let listed_as_tool = app.tools.contains(&block.name);
            let (provider, kind) = resolve_provider(block, listed_as_tool, catalog, options)?;
            match kind {
                ProviderKind::Model => models.push(parse_model(block, provider)?),
                ProviderKind::Tool => tools.push(parse_tool(block, provider)?),
            }
        }

        for (name, path) in tool_paths {
            if models.iter().any(|m: &ModelSpec| m.name == name) {
                return Err(invalid(TOP_LEVEL, name, "path definitions apply to tools only"));
            }
            match tools.iter_mut().find(|t: &&mut ToolSpec| t.name == name) {
                Some(tool) => {
                    tool.params
                        .entry("path".to_string())
                        .or_insert(Json::String(path));
                }
                None => {
                    let provider = infer_tool_provider(name).ok_or_else(|| {
                        BuildError::MissingProvider {
                            block: name.to_string(),
                        }
                    })?;
                    let mut tool = ToolSpec::new(name, provider);
                    tool.params.insert("path".to_string(), Json::String(path));
                    tools.push(tool);
                }
            }
        }

        for name in &app.tools {
            if models.iter().any(|m| &m.name == name) {
                return Err(invalid("app", "tools", format!("`{name}` is a model")));
            }
            if !tools.iter().any(|t| &t.name == name) {
                let provider =
                    infer_tool_provider(name).ok_or_else(|| BuildError::UnknownReference {
                        name: name.clone(),
                        context: "app tools".to_string(),
                    })?;
                debug!("Tool `{name}` has no block, using provider `{provider}`");
                tools.push(ToolSpec::new(name.clone(), provider));
            }
        }

        for (model, text) in roles {
            let spec = models.iter_mut().find(|m| m.name == model).ok_or_else(|| {
                BuildError::UnknownReference {
                    name: model.to_string(),
                    context: "role assignment".to_string(),
                }
            })?;
            if spec.role.is_some() {
                return Err(BuildError::DuplicateDefinition {
                    name: format!("{model}_role"),
                });
            }
            spec.role = Some(text);
        }

        if coordinator.is_none() {
            if tools.iter().any(|t| t.name == app.model) {
                return Err(invalid("app", "model", format!("`{}` is a tool", app.model)));
            }
            if !models.iter().any(|m| m.name == app.model) {
                return Err(BuildError::UnknownReference {
                    name: app.model.clone(),
                    context: "app model".to_string(),
                });
            }
        }

        Ok(Registry {
            app,
            models,
            tools,
            coordinator,
        })
    }

    pub fn app(&self) -> &AppSpec {
        &self.app
    }

    /// Models in declaration order.
    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    /// Tools in declaration order.
    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn coordinator(&self) -> Option<&CoordinatorSpec> {
        self.coordinator.as_ref()
    }

    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// A registry whose coordinator is replaced, used to rebuild graphs
    /// from rendered sections.
    pub(crate) fn with_coordinator(&self, coordinator: Option<CoordinatorSpec>) -> Self {
        Self {
            coordinator,
            ..self.clone()
        }
    }
}

fn resolve_provider(
    block: &Block,
    listed_as_tool: bool,
    catalog: &ProviderCatalog,
    options: &BuildOptions,
) -> Result<(String, ProviderKind), BuildError> {
    let mut words = block.words();
    let keyword = words.next();
    if let Some(extra) = words.next() {
        return Err(invalid(&block.name, extra, "more than one provider keyword"));
    }

    let Some(keyword) = keyword else {
        return match infer_tool_provider(&block.name) {
            Some(provider) if listed_as_tool => Ok((provider.to_string(), ProviderKind::Tool)),
            _ => Err(BuildError::MissingProvider {
                block: block.name.clone(),
            }),
        };
    };

    let provider = catalog.canonical(keyword);
    match catalog.kind(&provider) {
        Some(kind) => Ok((provider, kind)),
        None => match options.unknown_provider {
            UnknownProviderPolicy::Reject => Err(BuildError::UnknownProvider {
                block: block.name.clone(),
                provider,
            }),
            UnknownProviderPolicy::Defer => {
                let kind = if listed_as_tool {
                    ProviderKind::Tool
                } else {
                    ProviderKind::Model
                };
                warn!(
                    "Provider `{provider}` for `{}` is not registered yet, deferring to activation",
                    block.name
                );
                Ok((provider, kind))
            }
        },
    }
}

fn parse_model(block: &Block, provider: String) -> Result<ModelSpec, BuildError> {
    let name = block.name.as_str();
    let mut spec = ModelSpec::new(name, provider);
    for decl in &block.body {
        match decl {
            Decl::Word(_) => {}
            Decl::Secret(reference) => set_secret(&mut spec.secret, name, reference)?,
            Decl::Assign { key, value } => match (key.as_str(), value) {
                ("api_key" | "key" | "secret", Value::Secret(reference)) => {
                    set_secret(&mut spec.secret, name, reference)?
                }
                ("model" | "model_name" | "model_id", _) => spec.model = string(name, key, value)?,
                ("temperature" | "temp", _) => spec.temperature = ranged(name, key, value, 0.0, 2.0)?,
                ("max_tokens" | "length" | "limit", _) => {
                    spec.max_tokens = unsigned(name, key, value, 1)?
                }
                ("top_p" | "sampling", _) => spec.top_p = Some(ranged(name, key, value, 0.0, 1.0)?),
                ("role" | "system" | "prompt" | "instruction" | "behavior" | "personality", _) => {
                    if spec.role.is_some() {
                        return Err(BuildError::DuplicateDefinition {
                            name: format!("{name}_role"),
                        });
                    }
                    spec.role = Some(string(name, key, value)?);
                }
                ("double_side_tape" | "chain" | "sequence", _) => {
                    spec.chain.extend(tool_chain(name, key, value)?)
                }
                _ => {
                    spec.params.insert(key.clone(), to_json(name, key, value)?);
                }
            },
            other => {
                return Err(invalid(
                    name,
                    &describe(other),
                    "unexpected declaration in model block",
                ))
            }
        }
    }
    Ok(spec)
}

/// `{ a }`, `{ a >> b }`, `a >> b` or `[a, b]` as an ordered tool list.
fn tool_chain(block: &str, key: &str, value: &Value) -> Result<Vec<String>, BuildError> {
    match value {
        Value::Object(decls) => {
            let mut tools = Vec::new();
            for decl in decls {
                match decl {
                    Decl::Word(w) => tools.push(w.clone()),
                    Decl::Chain(names) => tools.extend(names.iter().cloned()),
                    other => {
                        return Err(invalid(
                            block,
                            key,
                            format!("expected tool names, found `{}`", describe(other)),
                        ))
                    }
                }
            }
            Ok(tools)
        }
        Value::Chain(names) => Ok(names.clone()),
        other => {
            let names = other.as_names();
            if names.is_empty() {
                Err(invalid(block, key, "expected tool names"))
            } else {
                Ok(names)
            }
        }
    }
}

fn parse_tool(block: &Block, provider: String) -> Result<ToolSpec, BuildError> {
    let name = block.name.as_str();
    let mut spec = ToolSpec::new(name, provider);
    for decl in &block.body {
        match decl {
            Decl::Word(_) => {}
            Decl::Secret(reference) => set_secret(&mut spec.secret, name, reference)?,
            Decl::Assign { key, value } => match value {
                Value::Secret(reference) => set_secret(&mut spec.secret, name, reference)?,
                _ => {
                    spec.params.insert(key.clone(), to_json(name, key, value)?);
                }
            },
            other => {
                return Err(invalid(
                    name,
                    &describe(other),
                    "unexpected declaration in tool block",
                ))
            }
        }
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse;

    fn build(source: &str) -> Result<Registry, BuildError> {
        Registry::build(
            &parse(source).unwrap(),
            &ProviderCatalog::builtin(),
            &BuildOptions::default(),
        )
    }

    const RESEARCH: &str = r#"
        glue app {
            name = "Research Assistant"
            tools = web_search
            model = researcher
        }

        researcher {
            openrouter
            os.openrouter_api_key
            model = "liquid/lfm-40b:free"
            temperature = 0.7
            double_side_tape = { web_search }
        }

        web_search {
            tavily
            os.tavily_api_key
        }

        researcher_role = "You are a research assistant."

        apply glue
    "#;

    #[test]
    fn test_single_model_app() {
        let registry = build(RESEARCH).unwrap();
        assert_eq!(registry.app().name, "Research Assistant");
        assert_eq!(registry.app().tools, vec!["web_search"]);
        assert!(registry.coordinator().is_none());

        let researcher = registry.model("researcher").unwrap();
        assert_eq!(researcher.provider, "openrouter");
        assert_eq!(
            researcher.secret,
            Some(SecretRef::new("openrouter_api_key"))
        );
        assert_eq!(researcher.chain, vec!["web_search"]);
        assert_eq!(researcher.role.as_deref(), Some("You are a research assistant."));
        assert_eq!(researcher.max_tokens, DEFAULT_MAX_TOKENS);

        let search = registry.tool("web_search").unwrap();
        assert_eq!(search.provider, "tavily");
        assert_eq!(search.secret, Some(SecretRef::new("tavily_api_key")));
    }

    #[test]
    fn test_aliases_and_inferred_tools() {
        let registry = build(
            r#"
            app {
                title = "Aliases"
                components = code_interpreter, file_handler
                agent = coder
            }
            coder {
                openrouter
                temp = 0.2
                limit = 256
                sampling = 0.9
                coder_prompt_style = "x"
            }
            file_handler: "./out"
            coder_instruction = "Write code."
            apply glue
            "#,
        )
        .unwrap();
        let coder = registry.model("coder").unwrap();
        assert_eq!(coder.temperature, 0.2);
        assert_eq!(coder.max_tokens, 256);
        assert_eq!(coder.top_p, Some(0.9));
        assert_eq!(coder.role.as_deref(), Some("Write code."));
        assert_eq!(coder.params["coder_prompt_style"], Json::from("x"));

        let files = registry.tool("file_handler").unwrap();
        assert_eq!(files.provider, "local");
        assert_eq!(files.param_str("path"), Some("./out"));
        assert_eq!(registry.tool("code_interpreter").unwrap().provider, "python");
    }

    #[test]
    fn test_coordinator_block() {
        let registry = build(
            r#"
            glue app { tools = web_search, code_interpreter, model = team }
            a { openrouter }
            b { openrouter }
            web_search { tavily }
            code_interpreter { python }
            team {
                models = a, b
                double_side_tape = { a >> b, b >> a }
                glue { web_search: a }
                magnets { code_interpreter: [a, b] }
            }
            apply glue
            "#,
        )
        .unwrap();
        let team = registry.coordinator().unwrap();
        assert_eq!(team.models, vec!["a", "b"]);
        assert_eq!(
            team.tape,
            vec![vec!["a".to_string(), "b".to_string()], vec!["b".to_string(), "a".to_string()]]
        );
        assert_eq!(team.glue, vec![("web_search".to_string(), "a".to_string())]);
        assert_eq!(
            team.magnets,
            vec![(
                "code_interpreter".to_string(),
                vec!["a".to_string(), "b".to_string()]
            )]
        );
        assert_eq!(registry.models().len(), 2);
        assert_eq!(registry.tools().len(), 2);
    }

    #[test]
    fn test_duplicate_definitions() {
        let err = build("app { model = a } a { openrouter } a { openrouter }").unwrap_err();
        assert_eq!(err, BuildError::DuplicateDefinition { name: "a".into() });

        let err = build("app { model = a } a { openrouter role = \"x\" } a_role = \"y\"")
            .unwrap_err();
        assert_eq!(err, BuildError::DuplicateDefinition { name: "a_role".into() });

        let err = build("app { model = a } app { model = a } a { openrouter }").unwrap_err();
        assert_eq!(err, BuildError::DuplicateDefinition { name: "app".into() });
    }

    #[test]
    fn test_unknown_provider_policies() {
        let source = "app { model = a } a { groq }";
        let err = build(source).unwrap_err();
        assert_eq!(
            err,
            BuildError::UnknownProvider {
                block: "a".into(),
                provider: "groq".into()
            }
        );

        let registry = Registry::build(
            &parse(source).unwrap(),
            &ProviderCatalog::builtin(),
            &BuildOptions::default().defer_unknown_providers(),
        )
        .unwrap();
        assert_eq!(registry.model("a").unwrap().provider, "groq");
    }

    #[test]
    fn test_provider_alias_is_canonicalised() {
        let mut catalog = ProviderCatalog::builtin();
        catalog.register("anthropic", ProviderKind::Model);
        let registry = Registry::build(
            &parse("app { model = a } a { Anthropic_Direct }").unwrap(),
            &catalog,
            &BuildOptions::default(),
        )
        .unwrap();
        assert_eq!(registry.model("a").unwrap().provider, "anthropic");
    }

    #[test]
    fn test_missing_pieces() {
        assert_eq!(build("a { openrouter }").unwrap_err(), BuildError::MissingApp);
        assert_eq!(
            build("app { model = a } a { temperature = 0.1 }").unwrap_err(),
            BuildError::MissingProvider { block: "a".into() }
        );
        assert_eq!(
            build("app { model = ghost }").unwrap_err(),
            BuildError::UnknownReference {
                name: "ghost".into(),
                context: "app model".into()
            }
        );
        assert_eq!(
            build("app { model = a } a { openrouter } b_role = \"x\"").unwrap_err(),
            BuildError::UnknownReference {
                name: "b".into(),
                context: "role assignment".into()
            }
        );
        assert_eq!(
            build("app { tools = mystery, model = a } a { openrouter }").unwrap_err(),
            BuildError::UnknownReference {
                name: "mystery".into(),
                context: "app tools".into()
            }
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            build("app { model = a } a { openrouter temperature = \"hot\" }"),
            Err(BuildError::InvalidValue { key, .. }) if key == "temperature"
        ));
        assert!(matches!(
            build("app { model = a } a { openrouter max_tokens = 0 }"),
            Err(BuildError::InvalidValue { key, .. }) if key == "max_tokens"
        ));
        assert!(matches!(
            build("app { model = a, max_iterations = 2.5 } a { openrouter }"),
            Err(BuildError::InvalidValue { key, .. }) if key == "max_iterations"
        ));
        assert!(matches!(
            build("app { model = a } a { openrouter os.x os.y }"),
            Err(BuildError::InvalidValue { key, .. }) if key == "os"
        ));
        assert!(matches!(
            build("app { model = a, timeout = 100000000000000000000000 } a { openrouter }"),
            Err(BuildError::InvalidValue { key, .. }) if key == "timeout"
        ));
    }

    #[test]
    fn test_app_settings() {
        let registry = build(
            r#"app { model = a, max_iterations = 3, timeout = 2.5, retries = 0, approval = "LGTM" }
               a { openrouter }"#,
        )
        .unwrap();
        let settings = &registry.app().settings;
        assert_eq!(settings.max_iterations, Some(3));
        assert_eq!(settings.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(settings.retries, Some(0));
        assert_eq!(settings.approval.as_deref(), Some("LGTM"));
    }
}
