//! Static step descriptions: parameters, their sources, and the PE entries a step writes.

use crate::pipeline_env::ValueKind;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamType {
    String,
    Int,
    Bool,
    StringList,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Int => "int",
            ParamType::Bool => "bool",
            ParamType::StringList => "[]string",
        }
    }
}

/// Configuration sections a parameter may be set from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    General,
    Stages,
    Steps,
    Parameters,
}

pub const ALL_SCOPES: &[Scope] = &[Scope::General, Scope::Stages, Scope::Steps, Scope::Parameters];

/// Where a parameter value may be sourced from besides the config layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResourceRef {
    /// A PE entry such as `git.commitId`.
    PipelineEnv { path: String, kind: ValueKind },
    /// A credential mounted by the host, addressed by the id held in another parameter.
    Secret {
        credential_param: String,
        field: String,
    },
    /// Vault KV path templates, tried in order; `key` names the field inside the secret.
    Vault { paths: Vec<String>, key: String },
}

/// Default vault path templates for a parameter.
pub fn vault_paths(field: &str) -> Vec<String> {
    vec![
        format!("$(vaultPath)/{}", field),
        format!("$(vaultBasePath)/$(vaultPipelineName)/{}", field),
        format!("$(vaultBasePath)/GROUP-SECRETS/{}", field),
    ]
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub mandatory: bool,
    pub scopes: Vec<Scope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_refs: Vec<ResourceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub possible_values: Option<Vec<Value>>,
    pub secret: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ParameterSpec {
    pub fn new(name: &str, kind: ParamType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            mandatory: false,
            scopes: vec![Scope::Parameters, Scope::Stages, Scope::Steps],
            default: None,
            aliases: Vec::new(),
            resource_refs: Vec::new(),
            possible_values: None,
            secret: false,
            description: String::new(),
        }
    }

    pub fn string(name: &str) -> Self {
        Self::new(name, ParamType::String)
    }

    pub fn int(name: &str) -> Self {
        Self::new(name, ParamType::Int)
    }

    pub fn bool(name: &str) -> Self {
        Self::new(name, ParamType::Bool)
    }

    pub fn list(name: &str) -> Self {
        Self::new(name, ParamType::StringList)
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn scopes(mut self, scopes: &[Scope]) -> Self {
        self.scopes = scopes.to_vec();
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    pub fn from_env(mut self, path: &str, kind: ValueKind) -> Self {
        self.resource_refs.push(ResourceRef::PipelineEnv {
            path: path.to_string(),
            kind,
        });
        self
    }

    /// Mark as secret and allow sourcing from the credential named by
    /// `credential_param` and from the default vault paths.
    pub fn from_credential(mut self, credential_param: &str, field: &str) -> Self {
        self.secret = true;
        self.resource_refs.push(ResourceRef::Secret {
            credential_param: credential_param.to_string(),
            field: field.to_string(),
        });
        self.resource_refs.push(ResourceRef::Vault {
            paths: vault_paths(credential_param),
            key: field.to_string(),
        });
        self
    }

    pub fn from_vault(mut self, paths: Vec<String>, key: &str) -> Self {
        self.secret = true;
        self.resource_refs.push(ResourceRef::Vault {
            paths,
            key: key.to_string(),
        });
        self
    }

    pub fn possible_values(mut self, values: &[&str]) -> Self {
        self.possible_values = Some(values.iter().map(|v| Value::String(v.to_string())).collect());
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn in_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A PE entry the step publishes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    pub key: String,
    pub kind: ValueKind,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHint {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParameterSpec>,
    pub secrets: Vec<SecretSpec>,
    pub outputs: Vec<OutputSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerHint>,
}

impl StepSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            secrets: Vec::new(),
            outputs: Vec::new(),
            containers: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParameterSpec) -> Self {
        if param.secret {
            self.secrets.push(SecretSpec {
                name: param.name.clone(),
                description: param.description.clone(),
            });
        }
        self.params.push(param);
        self
    }

    pub fn output(mut self, key: &str, kind: ValueKind) -> Self {
        self.outputs.push(OutputSpec {
            key: key.to_string(),
            kind,
        });
        self
    }

    pub fn container(mut self, image: &str) -> Self {
        self.containers.push(ContainerHint {
            image: image.to_string(),
            workdir: None,
        });
        self
    }

    pub fn find_param(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// PE entries the step reads (through parameters) or writes (outputs).
    pub fn resources(&self) -> Vec<ResourceRef> {
        let reads = self
            .params
            .iter()
            .flat_map(|p| p.resource_refs.iter())
            .filter(|r| matches!(r, ResourceRef::PipelineEnv { .. }))
            .cloned();
        let writes = self.outputs.iter().map(|o| ResourceRef::PipelineEnv {
            path: o.key.clone(),
            kind: o.kind,
        });
        reads.chain(writes).collect()
    }

    pub fn output_for(&self, key: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.key == key)
    }
}
