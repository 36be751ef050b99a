//! Layered step configuration.
//!
//! Layers, lowest precedence first:
//!
//! 1. step defaults from the [`StepSpec`]
//! 2. defaults files: `general`, then `steps.<step>`
//! 3. values read from the pipeline environment
//! 4. custom config: `general`, `stages.<stage>`, `steps.<step>`
//! 5. `PIPESTEP_<name>` environment variables
//! 6. host parameters: `--stepConfig` file, then `--parametersJSON`
//! 7. CLI flags
//!
//! Parameters still unset after merging may be filled from a credential
//! store or vault. Coercion and validation run on the merged result.

pub mod coerce;
pub mod file;
pub mod stores;

pub use file::{
    expand_path, parse_parameters, project_config_file, CollectorConfig, ConfigFile, HooksConfig,
    SplunkConfig,
};
pub use stores::{
    CredentialStore, FileCredentialStore, HttpVaultStore, SecretStores, VaultSettings, VaultStore,
};

use crate::error::{Error, Result};
use crate::pipeline_env::PipelineEnv;
use crate::secrets::SecretRegistry;
use crate::step::{ParamType, ParameterSpec, ResourceRef, Scope, StepSpec};
use crate::utils::template;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const ENV_PREFIX: &str = "PIPESTEP_";

pub const LAYER_DEFAULT: &str = "step default";
pub const LAYER_ENV: &str = "environment";
pub const LAYER_FLAGS: &str = "CLI flags";

/// Raw inputs to resolution, gathered once per invocation.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub defaults: Vec<ConfigFile>,
    pub custom: Option<ConfigFile>,
    pub stage: Option<String>,
    /// Environment variables with the prefix stripped.
    pub env: BTreeMap<String, String>,
    pub step_config: Option<Map<String, Value>>,
    pub parameters_json: Option<Map<String, Value>>,
    pub flags: Map<String, Value>,
}

impl ConfigSources {
    /// Capture `PIPESTEP_*` variables from the process environment.
    pub fn capture_env(&mut self) {
        self.env = std::env::vars_os()
            .filter_map(|(k, v)| {
                let key = k.into_string().ok()?;
                let name = key.strip_prefix(ENV_PREFIX)?.to_string();
                Some((name, v.to_string_lossy().into_owned()))
            })
            .collect();
    }

    pub fn hooks(&self) -> HooksConfig {
        self.custom
            .as_ref()
            .map(|c| c.hooks.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub step: String,
    pub values: BTreeMap<String, Value>,
    /// Layer each value came from.
    pub sources: BTreeMap<String, String>,
    /// Parameters whose values must be redacted.
    pub secret_names: BTreeSet<String>,
}

impl ResolvedConfig {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn string(&self, name: &str) -> Option<String> {
        self.str(name).map(str::to_string)
    }

    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.str(name)
            .ok_or_else(|| Error::config_missing_parameter(name))
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(Value::as_i64)
    }

    pub fn bool(&self, name: &str) -> bool {
        self.values
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn list(&self, name: &str) -> Vec<String> {
        match self.values.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Secret values, for seeding the redaction registry.
    pub fn secret_values(&self) -> Vec<String> {
        let mut out = Vec::new();
        for name in &self.secret_names {
            match self.values.get(name) {
                Some(Value::String(s)) => out.push(s.clone()),
                Some(Value::Array(items)) => {
                    out.extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)))
                }
                Some(other) if !other.is_null() => out.push(other.to_string()),
                _ => {}
            }
        }
        out
    }
}

struct Layer {
    name: String,
    values: Map<String, Value>,
    split_lists: bool,
}

struct Candidate {
    raw: Value,
    layer: String,
    split_lists: bool,
}

pub struct Resolver<'a> {
    sources: &'a ConfigSources,
    pipeline_env: Option<&'a PipelineEnv>,
    stores: &'a SecretStores,
    secrets: &'a SecretRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(
        sources: &'a ConfigSources,
        pipeline_env: Option<&'a PipelineEnv>,
        stores: &'a SecretStores,
        secrets: &'a SecretRegistry,
    ) -> Self {
        Self {
            sources,
            pipeline_env,
            stores,
            secrets,
        }
    }

    pub fn resolve(&self, spec: &StepSpec) -> Result<ResolvedConfig> {
        let layers = self.layers(spec)?;

        let mut merged: BTreeMap<String, Candidate> = BTreeMap::new();
        for layer in &layers {
            for (name, raw) in &layer.values {
                merged.insert(
                    name.clone(),
                    Candidate {
                        raw: raw.clone(),
                        layer: layer.name.clone(),
                        split_lists: layer.split_lists,
                    },
                );
            }
        }

        self.fill_from_stores(spec, &mut merged)?;

        let mut resolved = ResolvedConfig {
            step: spec.name.clone(),
            values: BTreeMap::new(),
            sources: BTreeMap::new(),
            secret_names: BTreeSet::new(),
        };

        for param in &spec.params {
            let Some(candidate) = merged.get(&param.name) else {
                if param.mandatory {
                    return Err(Error::config_missing_parameter(&param.name));
                }
                continue;
            };
            let value = coerce::coerce(param, &candidate.raw, &candidate.layer, candidate.split_lists)?;
            let empty = matches!(&value, Value::String(s) if s.is_empty());
            if empty && param.mandatory {
                return Err(Error::config_missing_parameter(&param.name)
                    .with_hint(format!("'{}' is set to an empty string in {}", param.name, candidate.layer)));
            }
            if !empty {
                coerce::check_possible_values(param, &value, &candidate.layer)?;
            }
            if param.secret {
                resolved.secret_names.insert(param.name.clone());
            }
            resolved.values.insert(param.name.clone(), value);
            resolved.sources.insert(param.name.clone(), candidate.layer.clone());
        }

        for secret in resolved.secret_values() {
            self.secrets.register(&secret);
        }
        Ok(resolved)
    }

    fn layers(&self, spec: &StepSpec) -> Result<Vec<Layer>> {
        let mut layers = Vec::new();

        let defaults: Map<String, Value> = spec
            .params
            .iter()
            .filter_map(|p| p.default.clone().map(|d| (p.name.clone(), d)))
            .collect();
        layers.push(Layer {
            name: LAYER_DEFAULT.to_string(),
            values: defaults,
            split_lists: false,
        });

        for (i, file) in self.sources.defaults.iter().enumerate() {
            let label = format!("defaults file #{}", i + 1);
            layers.push(section_layer(spec, &file.general, Some(Scope::General), format!("{} general", label))?);
            if let Some(step) = file.step(&spec.name) {
                layers.push(section_layer(spec, step, Some(Scope::Steps), format!("{} steps", label))?);
            }
        }

        layers.push(self.pipeline_env_layer(spec)?);

        if let Some(custom) = &self.sources.custom {
            layers.push(section_layer(spec, &custom.general, Some(Scope::General), "custom config general".to_string())?);
            if let Some(stage_name) = self.sources.stage.as_deref() {
                if let Some(stage) = custom.stage(stage_name) {
                    let name = format!("custom config stage '{}'", stage_name);
                    layers.push(section_layer(spec, stage, Some(Scope::Stages), name)?);
                }
            }
            if let Some(step) = custom.step(&spec.name) {
                layers.push(section_layer(spec, step, Some(Scope::Steps), "custom config steps".to_string())?);
            }
        }

        let env: Map<String, Value> = self
            .sources
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let mut env_layer = section_layer(spec, &env, None, LAYER_ENV.to_string())?;
        env_layer.split_lists = true;
        layers.push(env_layer);

        if let Some(step_config) = &self.sources.step_config {
            layers.push(section_layer(spec, step_config, Some(Scope::Parameters), "step config file".to_string())?);
        }
        if let Some(params) = &self.sources.parameters_json {
            layers.push(section_layer(spec, params, Some(Scope::Parameters), "parameters JSON".to_string())?);
        }
        layers.push(section_layer(spec, &self.sources.flags, Some(Scope::Parameters), LAYER_FLAGS.to_string())?);

        Ok(layers)
    }

    fn pipeline_env_layer(&self, spec: &StepSpec) -> Result<Layer> {
        let mut values = Map::new();
        if let Some(pe) = self.pipeline_env {
            for param in &spec.params {
                for reference in &param.resource_refs {
                    let ResourceRef::PipelineEnv { path, kind } = reference else {
                        continue;
                    };
                    if let Some(value) = pe.read_as(path, *kind)? {
                        let json = value.to_json();
                        let json = match (param.kind, json) {
                            (ParamType::String, v @ (Value::Object(_) | Value::Array(_))) => {
                                Value::String(v.to_string())
                            }
                            (_, v) => v,
                        };
                        values.insert(param.name.clone(), json);
                        break;
                    }
                }
            }
        }
        Ok(Layer {
            name: "pipeline environment".to_string(),
            values,
            split_lists: false,
        })
    }

    /// Flat string view of every raw key across all sections, used to expand
    /// `$(name)` templates and to look up credential ids.
    fn template_context(&self, merged: &BTreeMap<String, Candidate>) -> HashMap<String, String> {
        let mut context = HashMap::new();
        for file in &self.sources.defaults {
            absorb_scalars(&mut context, &file.general);
        }
        if let Some(custom) = &self.sources.custom {
            absorb_scalars(&mut context, &custom.general);
            if let Some(stage) = self.sources.stage.as_deref().and_then(|s| custom.stage(s)) {
                absorb_scalars(&mut context, stage);
            }
        }
        for (k, v) in &self.sources.env {
            context.insert(k.clone(), v.clone());
        }
        if let Some(map) = &self.sources.step_config {
            absorb_scalars(&mut context, map);
        }
        if let Some(map) = &self.sources.parameters_json {
            absorb_scalars(&mut context, map);
        }
        absorb_scalars(&mut context, &self.sources.flags);
        for (name, candidate) in merged {
            if let Some(s) = scalar_string(&candidate.raw) {
                context.insert(name.clone(), s);
            }
        }
        context
    }

    fn vault_settings(&self, context: &HashMap<String, String>) -> Option<VaultSettings> {
        let server_url = context.get("vaultServerUrl").filter(|s| !s.is_empty())?;
        let token = self.sources.env.get("vaultToken").filter(|s| !s.is_empty())?;
        Some(VaultSettings {
            server_url: server_url.clone(),
            namespace: context.get("vaultNamespace").filter(|s| !s.is_empty()).cloned(),
            token: token.clone(),
        })
    }

    fn fill_from_stores(&self, spec: &StepSpec, merged: &mut BTreeMap<String, Candidate>) -> Result<()> {
        let wants_store = |param: &ParameterSpec| {
            let explicit = merged
                .get(&param.name)
                .map(|c| c.layer != LAYER_DEFAULT)
                .unwrap_or(false);
            !explicit
                && param
                    .resource_refs
                    .iter()
                    .any(|r| !matches!(r, ResourceRef::PipelineEnv { .. }))
        };
        let pending: Vec<&ParameterSpec> = spec.params.iter().filter(|p| wants_store(*p)).collect();
        if pending.is_empty() {
            return Ok(());
        }

        let context = self.template_context(merged);
        let vault = self.vault_settings(&context);

        for param in pending {
            if let Some((value, layer)) = self.lookup_stores(param, &context, vault.as_ref())? {
                self.secrets.register(&value);
                merged.insert(
                    param.name.clone(),
                    Candidate {
                        raw: Value::String(value),
                        layer,
                        split_lists: false,
                    },
                );
            }
        }
        Ok(())
    }

    fn lookup_stores(
        &self,
        param: &ParameterSpec,
        context: &HashMap<String, String>,
        vault: Option<&VaultSettings>,
    ) -> Result<Option<(String, String)>> {
        for reference in &param.resource_refs {
            match reference {
                ResourceRef::Secret {
                    credential_param,
                    field,
                } => {
                    let (Some(store), Some(id)) =
                        (&self.stores.credentials, context.get(credential_param))
                    else {
                        continue;
                    };
                    if let Some(value) = store.credential(id, field)? {
                        tracing::debug!(parameter = %param.name, credential = %id, "resolved from credential store");
                        return Ok(Some((value, format!("credential '{}'", id))));
                    }
                }
                ResourceRef::Vault { paths, key } => {
                    let (Some(store), Some(settings)) = (&self.stores.vault, vault) else {
                        continue;
                    };
                    for template in paths {
                        let Some(path) = template::render_dollar(template, context) else {
                            continue;
                        };
                        let Some(secret) = store.read_secret(settings, &path)? else {
                            continue;
                        };
                        if let Some(value) = secret.get(key).and_then(scalar_string) {
                            tracing::debug!(parameter = %param.name, path = %path, "resolved from vault");
                            return Ok(Some((value, format!("vault '{}'", path))));
                        }
                    }
                }
                ResourceRef::PipelineEnv { .. } => {}
            }
        }
        Ok(None)
    }
}

fn absorb_scalars(context: &mut HashMap<String, String>, map: &Map<String, Value>) {
    for (k, v) in map {
        if let Some(s) = scalar_string(v) {
            context.insert(k.clone(), s);
        }
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Look up `a/b/c` in nested maps.
fn lookup_deep<'v>(map: &'v Map<String, Value>, key: &str) -> Option<&'v Value> {
    let mut parts = key.split('/');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Pick the values of one raw section that belong to `spec`, rewriting
/// aliases to canonical names. Two keys for the same parameter with
/// different values in one section is an error.
fn section_layer(
    spec: &StepSpec,
    raw: &Map<String, Value>,
    scope: Option<Scope>,
    name: String,
) -> Result<Layer> {
    let mut values = Map::new();
    for param in &spec.params {
        if let Some(scope) = scope {
            if !param.in_scope(scope) {
                continue;
            }
        }
        let mut found: Vec<(&str, &Value)> = Vec::new();
        if let Some(v) = raw.get(&param.name) {
            found.push((param.name.as_str(), v));
        }
        for alias in &param.aliases {
            if let Some(v) = lookup_deep(raw, alias) {
                found.push((alias.as_str(), v));
            }
        }
        found.retain(|(_, v)| !v.is_null());

        let Some((_, first)) = found.first() else {
            continue;
        };
        if found.iter().any(|(_, v)| v != first) {
            let keys = found.iter().map(|(k, _)| k.to_string()).collect();
            return Err(Error::config_alias_conflict(&param.name, &name, keys));
        }
        values.insert(param.name.clone(), (*first).clone());
    }
    Ok(Layer {
        name,
        values,
        split_lists: false,
    })
}
