//! String template rendering utilities.
//!
//! Two placeholder dialects are in use:
//! - `$(name)` in secret store path templates (`$(vaultBasePath)/$(vaultPipelineName)/foo`)
//! - `{name}` in remote job URL templates (`https://host/jobs/{id}`)

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn dollar_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\(([A-Za-z0-9_.\-]+)\)").expect("static pattern"))
}

fn brace_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_.\-]+)\}").expect("static pattern"))
}

/// Names referenced by `$(name)` placeholders, in order of appearance.
pub fn dollar_names(template: &str) -> Vec<String> {
    dollar_placeholder()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Render `$(name)` placeholders. Returns `None` if any placeholder has no
/// value (or an empty one), so callers can skip incomplete templates.
pub fn render_dollar(template: &str, variables: &HashMap<String, String>) -> Option<String> {
    let mut missing = false;
    let rendered = dollar_placeholder().replace_all(template, |caps: &regex::Captures| {
        match variables.get(&caps[1]).filter(|v| !v.is_empty()) {
            Some(value) => value.clone(),
            None => {
                missing = true;
                String::new()
            }
        }
    });
    if missing {
        None
    } else {
        Some(rendered.into_owned())
    }
}

/// Render `{name}` placeholders. Unknown names are left untouched.
pub fn render_braces(template: &str, variables: &[(&str, &str)]) -> String {
    brace_placeholder()
        .replace_all(template, |caps: &regex::Captures| {
            variables
                .iter()
                .find(|(key, _)| *key == &caps[1])
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

pub fn is_present(template: &str, key: &str) -> bool {
    template.contains(&format!("{{{}}}", key))
}
