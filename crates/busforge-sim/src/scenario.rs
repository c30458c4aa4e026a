//! Scenario Model & Loader
//!
//! A scenario names a run, bounds its duration, seeds the random
//! streams and binds a data generator to each ICD field. Binding
//! resolution order: per-field spec, then the message's default mode,
//! then the scenario default, then an implicit uniform random over the
//! field's encoding range. Constant ICD fields keep their constants.
//!
//! ## Example
//!
//! ```yaml
//! name: Box Pattern Mission
//! duration_s: 300
//! seed: 12345
//! bus:
//!   packet_bytes_target: 65536
//!   time_packet_interval_s: 1.0
//! defaults:
//!   data_mode: random
//! messages:
//!   NAV_DATA:
//!     fields:
//!       altitude: { mode: sine, center: 10000, amplitude: 500, frequency: 0.05 }
//!       mach: { mode: expression, formula: "airspeed / 661.0" }
//! ```

use crate::generator::expr::{ExprError, Resolver};
use crate::generator::{field_seed, GeneratorError, GeneratorKind, GeneratorSpec};
use crate::inject::ErrorInjectionSpec;
use busforge_core::encode::Encoding;
use busforge_core::icd::{Icd, MessageDef};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Bus and packetization settings supplied by the scenario.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Target packet size budget in bytes
    pub packet_bytes_target: usize,
    /// Time-F1 cadence in seconds
    pub time_packet_interval_s: f64,
    /// Bounded scheduling jitter, +/- milliseconds
    pub jitter_ms: f64,
    /// Optional fault injection
    pub errors: Option<ErrorInjectionSpec>,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            packet_bytes_target: 65_536,
            time_packet_interval_s: 1.0,
            jitter_ms: 0.0,
            errors: None,
        }
    }
}

/// Scenario-wide fallback generator for unbound fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefaultsSpec {
    pub data_mode: Option<String>,
    pub default_config: serde_yaml::Mapping,
}

/// Per-message overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageOverrides {
    pub default_mode: Option<String>,
    pub default_config: serde_yaml::Mapping,
    pub fields: BTreeMap<String, GeneratorSpec>,
}

/// A parsed scenario document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub name: String,
    pub duration_s: f64,
    pub start_time_utc: Option<DateTime<Utc>>,
    pub seed: Option<u64>,
    pub bus: BusSettings,
    pub defaults: DefaultsSpec,
    pub messages: BTreeMap<String, MessageOverrides>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            name: "Unnamed Scenario".to_string(),
            duration_s: 60.0,
            start_time_utc: None,
            seed: None,
            bus: BusSettings::default(),
            defaults: DefaultsSpec::default(),
            messages: BTreeMap::new(),
        }
    }
}

impl Scenario {
    /// Parse from YAML text. Both a flat document and one nested under a
    /// top-level `scenario:` key are accepted.
    pub fn from_yaml(text: &str) -> Result<Self, ScenarioError> {
        #[derive(Deserialize)]
        struct Nested {
            scenario: Scenario,
        }
        let scenario = match serde_yaml::from_str::<Nested>(text) {
            Ok(nested) => nested.scenario,
            Err(_) => serde_yaml::from_str(text)?,
        };
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load from a file.
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Check scalar constraints.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if !(self.duration_s > 0.0) {
            return Err(ScenarioError::Invalid(format!(
                "duration_s {} must be positive",
                self.duration_s
            )));
        }
        if !(self.bus.time_packet_interval_s > 0.0) {
            return Err(ScenarioError::Invalid(format!(
                "time_packet_interval_s {} must be positive",
                self.bus.time_packet_interval_s
            )));
        }
        if self.bus.packet_bytes_target < 64 {
            return Err(ScenarioError::Invalid(format!(
                "packet_bytes_target {} is too small",
                self.bus.packet_bytes_target
            )));
        }
        if self.bus.jitter_ms < 0.0 {
            return Err(ScenarioError::Invalid("jitter_ms must be >= 0".into()));
        }
        Ok(())
    }
}

/// One field's compiled generator and its local dependencies.
#[derive(Debug, Clone)]
pub struct CompiledField {
    pub generator: GeneratorKind,
    pub deps: Vec<usize>,
}

/// Generators for one message, in a safe evaluation order.
#[derive(Debug, Clone)]
pub struct CompiledMessage {
    /// Index of the message within the ICD
    pub index: usize,
    /// Field indices: independents in declaration order, then
    /// expressions topologically sorted
    pub eval_order: Vec<usize>,
    /// Per-field generator, indexed by field declaration order
    pub fields: Vec<CompiledField>,
    /// Per-field random stream seeds
    pub seeds: Vec<u64>,
}

/// The full generator table produced by binding a scenario to an ICD.
#[derive(Debug, Clone)]
pub struct Bindings {
    pub messages: Vec<CompiledMessage>,
}

impl Bindings {
    /// Field counts per message, for sizing the cross-value store.
    pub fn field_counts(&self) -> Vec<usize> {
        self.messages.iter().map(|m| m.fields.len()).collect()
    }
}

/// Bind every ICD field to a generator and order the evaluation.
pub fn bind(icd: &Icd, scenario: &Scenario) -> Result<Bindings, ScenarioError> {
    // every message/field the scenario names must exist
    for (msg_name, overrides) in &scenario.messages {
        let Some((_, msg)) = icd.message(msg_name) else {
            return Err(ScenarioError::UnknownMessage(msg_name.clone()));
        };
        for field_key in overrides.fields.keys() {
            let field_name = strip_qualifier(field_key, msg_name);
            if msg.field(field_name).is_none() {
                return Err(ScenarioError::UnknownField {
                    message: msg_name.clone(),
                    field: field_key.clone(),
                });
            }
        }
    }

    let seed = scenario.seed.unwrap_or(0);
    let mut messages = Vec::with_capacity(icd.messages.len());
    for (mi, msg) in icd.messages.iter().enumerate() {
        let overrides = scenario.messages.get(&msg.name);
        let resolver = IcdResolver { icd, message: mi };

        let mut fields = Vec::with_capacity(msg.words.len());
        let mut seeds = Vec::with_capacity(msg.words.len());
        for word in &msg.words {
            let spec = select_spec(scenario, overrides, msg, word)?;
            let (generator, deps) =
                spec.compile(&resolver)
                    .map_err(|source| ScenarioError::Generator {
                        message: msg.name.clone(),
                        field: word.name.clone(),
                        source,
                    })?;
            fields.push(CompiledField { generator, deps });
            seeds.push(field_seed(seed, &msg.name, &word.name));
        }

        let eval_order = evaluation_order(msg, &fields)?;
        messages.push(CompiledMessage {
            index: mi,
            eval_order,
            fields,
            seeds,
        });
    }
    Ok(Bindings { messages })
}

fn strip_qualifier<'a>(key: &'a str, message: &str) -> &'a str {
    key.strip_prefix(message)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(key)
}

/// Pick the generator spec for one field per the resolution order.
fn select_spec(
    scenario: &Scenario,
    overrides: Option<&MessageOverrides>,
    msg: &MessageDef,
    word: &busforge_core::icd::WordDef,
) -> Result<GeneratorSpec, ScenarioError> {
    if let Some(overrides) = overrides {
        let qualified = format!("{}.{}", msg.name, word.name);
        if let Some(spec) = overrides
            .fields
            .get(&word.name)
            .or_else(|| overrides.fields.get(&qualified))
        {
            return Ok(spec.clone());
        }
    }
    if let Some(value) = word.const_value {
        return Ok(GeneratorSpec::Constant { value });
    }
    if let Some(overrides) = overrides {
        if let Some(mode) = &overrides.default_mode {
            return spec_from_mode(mode, &overrides.default_config, msg, word);
        }
    }
    if let Some(mode) = &scenario.defaults.data_mode {
        return spec_from_mode(mode, &scenario.defaults.default_config, msg, word);
    }
    Ok(implicit_uniform(word))
}

/// Assemble `{mode: ..., ...config}` and parse it as a generator spec.
fn spec_from_mode(
    mode: &str,
    config: &serde_yaml::Mapping,
    msg: &MessageDef,
    word: &busforge_core::icd::WordDef,
) -> Result<GeneratorSpec, ScenarioError> {
    if mode == "random" && config.is_empty() {
        // bare random defaults to the field's own encoding range
        return Ok(implicit_uniform(word));
    }
    let mut map = config.clone();
    map.insert(
        serde_yaml::Value::String("mode".into()),
        serde_yaml::Value::String(mode.into()),
    );
    serde_yaml::from_value(serde_yaml::Value::Mapping(map)).map_err(|source| {
        ScenarioError::Generator {
            message: msg.name.clone(),
            field: word.name.clone(),
            source: GeneratorError::Invalid(format!("default mode '{}': {}", mode, source)),
        }
    })
}

/// Uniform random over the engineering range the encoding can represent.
fn implicit_uniform(word: &busforge_core::icd::WordDef) -> GeneratorSpec {
    let (raw_lo, raw_hi) = match word.mask {
        Some(mask) => (0.0, f64::from(mask)),
        None => word.encode.natural_range(word.digits),
    };
    let (a, b) = match word.encode {
        Encoding::Float32Split => (raw_lo, raw_hi),
        _ => (
            raw_lo * word.scale + word.offset,
            raw_hi * word.scale + word.offset,
        ),
    };
    GeneratorSpec::Random {
        min: a.min(b),
        max: a.max(b),
    }
}

/// Independents first in declaration order, then expressions in
/// topological order of their local dependencies.
fn evaluation_order(msg: &MessageDef, fields: &[CompiledField]) -> Result<Vec<usize>, ScenarioError> {
    let mut order: Vec<usize> = (0..fields.len())
        .filter(|&i| !fields[i].generator.is_expression())
        .collect();

    let expressions: Vec<usize> = (0..fields.len())
        .filter(|&i| fields[i].generator.is_expression())
        .collect();
    if expressions.is_empty() {
        return Ok(order);
    }

    // Kahn's algorithm over expression fields; edges run dep -> user.
    // The ready set stays sorted so the order is deterministic.
    let mut indegree: BTreeMap<usize, usize> = expressions.iter().map(|&i| (i, 0)).collect();
    for &i in &expressions {
        for &dep in &fields[i].deps {
            if fields[dep].generator.is_expression() {
                *indegree.get_mut(&i).expect("expression node") += 1;
            }
        }
    }
    let mut placed = Vec::with_capacity(expressions.len());
    loop {
        let Some(node) = indegree
            .iter()
            .find(|(_, &d)| d == 0)
            .map(|(&i, _)| i)
        else {
            break;
        };
        indegree.remove(&node);
        placed.push(node);
        for (&i, degree) in indegree.iter_mut() {
            if fields[i].deps.contains(&node) {
                *degree -= 1;
            }
        }
    }

    if placed.len() != expressions.len() {
        let chain = cycle_chain(msg, fields, &expressions);
        return Err(ScenarioError::CircularDependency {
            message: msg.name.clone(),
            chain,
        });
    }

    order.extend(placed);
    Ok(order)
}

/// Walk the dependency graph to report one full cycle by field name.
fn cycle_chain(msg: &MessageDef, fields: &[CompiledField], expressions: &[usize]) -> String {
    for &start in expressions {
        let mut path = Vec::new();
        if let Some(cycle) = dfs_cycle(fields, start, &mut path) {
            return cycle
                .iter()
                .map(|&i| msg.words[i].name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
        }
    }
    "unresolvable expression ordering".to_string()
}

fn dfs_cycle(fields: &[CompiledField], node: usize, path: &mut Vec<usize>) -> Option<Vec<usize>> {
    path.push(node);
    for &dep in &fields[node].deps {
        if !fields[dep].generator.is_expression() {
            continue;
        }
        if let Some(pos) = path.iter().position(|&p| p == dep) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(dep);
            return Some(cycle);
        }
        if let Some(cycle) = dfs_cycle(fields, dep, path) {
            return Some(cycle);
        }
    }
    path.pop();
    None
}

struct IcdResolver<'a> {
    icd: &'a Icd,
    message: usize,
}

impl Resolver for IcdResolver<'_> {
    fn message_name(&self) -> &str {
        &self.icd.messages[self.message].name
    }

    fn resolve_local(&self, field: &str) -> Option<usize> {
        self.icd.messages[self.message].field(field).map(|(i, _)| i)
    }

    fn resolve_cross(&self, message: &str, field: &str) -> Option<(usize, usize)> {
        let (mi, msg) = self.icd.message(message)?;
        let (fi, _) = msg.field(field)?;
        Some((mi, fi))
    }
}

/// Errors raised while loading a scenario or binding it to an ICD.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid scenario: {0}")]
    Invalid(String),

    #[error("scenario references unknown message '{0}'")]
    UnknownMessage(String),

    #[error("message '{message}': scenario references unknown field '{field}'")]
    UnknownField { message: String, field: String },

    #[error("message '{message}' field '{field}': {source}")]
    Generator {
        message: String,
        field: String,
        #[source]
        source: GeneratorError,
    },

    #[error("message '{message}': circular dependency: {chain}")]
    CircularDependency { message: String, chain: String },
}

impl ScenarioError {
    /// Whether the failure is an undefined reference or a cycle, the two
    /// dependency-analysis outcomes.
    pub fn is_dependency_error(&self) -> bool {
        matches!(self, ScenarioError::CircularDependency { .. })
            || matches!(
                self,
                ScenarioError::Generator {
                    source: GeneratorError::Expr(ExprError::UnknownIdentifier(_)),
                    ..
                }
            )
    }
}
