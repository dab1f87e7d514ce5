//! `${name}` and `${name|filter}` substitution over the merged record.
//!
//! The variable namespace is the runtime context, the process environment
//! (as `env.NAME`, expanding to the empty string when unset), and a fixed
//! list of scalar fields from the merged configuration itself. Unknown
//! variables and filters are hard errors naming the field they appeared in;
//! there is no fallback to the empty string.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::config::{ContainerConfig, Setting};

lazy_static! {
    static ref VAR_RE: Regex =
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)(?:\|([A-Za-z_][A-Za-z0-9_]*))?\}").unwrap();
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown variable ${{{name}}} in {field}")]
    UnknownVariable { field: String, name: String },

    #[error("unknown filter ${{{name}|{filter}}} in {field} (the only filter is \"slug\")")]
    UnknownFilter {
        field: String,
        name: String,
        filter: String,
    },
}

/// Replaces `/` and `:` with `-`, producing filesystem- and tag-safe
/// derivatives of image references and paths.
pub fn slug(s: &str) -> String {
    s.chars()
        .map(|c| if c == '/' || c == ':' { '-' } else { c })
        .collect()
}

/// The substitution namespace. Fixed names are looked up first; anything
/// under `env.` falls through to the process environment.
#[derive(Clone, Debug, Default)]
pub struct Vars {
    values: BTreeMap<String, String>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.values.get(name) {
            return Some(value.clone());
        }
        name.strip_prefix("env.")
            .map(|env_name| std::env::var(env_name).unwrap_or_default())
    }
}

/// Expands every `${...}` occurrence in `input`. `field` names the config
/// field being expanded, for error messages.
pub fn expand(field: &str, input: &str, vars: &Vars) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in VAR_RE.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        let name = caps.get(1).unwrap().as_str();
        let mut value = vars
            .lookup(name)
            .ok_or_else(|| TemplateError::UnknownVariable {
                field: field.to_owned(),
                name: name.to_owned(),
            })?;
        if let Some(filter) = caps.get(2) {
            value = match filter.as_str() {
                "slug" => slug(&value),
                other => {
                    return Err(TemplateError::UnknownFilter {
                        field: field.to_owned(),
                        name: name.to_owned(),
                        filter: other.to_owned(),
                    })
                }
            };
        }
        out.push_str(&input[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

fn expand_setting(
    field: &str,
    setting: &mut Setting<String>,
    vars: &Vars,
) -> Result<(), TemplateError> {
    if let Some(value) = setting.value_mut() {
        *value = expand(field, value, vars)?;
    }
    Ok(())
}

fn expand_list(
    field: &str,
    setting: &mut Setting<Vec<String>>,
    vars: &Vars,
) -> Result<(), TemplateError> {
    if let Some(items) = setting.value_mut() {
        for item in items {
            *item = expand(field, item, vars)?;
        }
    }
    Ok(())
}

/// Expands the whole merged record in place.
///
/// Scalar fields are expanded in a fixed order against the context/env
/// table, each one joining the table as it resolves, so a later field may
/// reference an earlier one (`container_name = "x-${image|slug}"` works
/// even when `image` itself references `${env.*}`). List fields and the
/// build section then see the completed table. `project_dir` is already
/// final when this runs and only serves as a variable.
pub fn expand_record(config: &mut ContainerConfig, base: &Vars) -> Result<(), TemplateError> {
    let mut vars = base.clone();

    let scalar_order: [(&str, fn(&mut ContainerConfig) -> &mut Setting<String>); 8] = [
        ("image", |c| &mut c.image),
        ("command", |c| &mut c.command),
        ("network", |c| &mut c.network),
        ("platform", |c| &mut c.platform),
        ("workdir", |c| &mut c.workdir),
        ("project_target", |c| &mut c.project_target),
        ("gosu_path", |c| &mut c.gosu_path),
        ("container_name", |c| &mut c.container_name),
    ];
    for (name, getter) in scalar_order {
        let setting = getter(config);
        expand_setting(name, setting, &vars)?;
        if let Some(value) = setting.value() {
            vars.set(name, value.clone());
        }
    }

    expand_list("subpaths", &mut config.subpaths, &vars)?;
    expand_list("env", &mut config.env, &vars)?;
    expand_list("volumes", &mut config.volumes, &vars)?;
    expand_list("post_start_commands", &mut config.post_start_commands, &vars)?;
    expand_list("run_args", &mut config.run_args, &vars)?;

    if let Some(ulimits) = config.ulimits.value_mut() {
        for (name, value) in ulimits.iter_mut() {
            if let crate::config::UlimitValue::SoftHard(pair) = value {
                *pair = expand(&format!("ulimits.{name}"), pair, &vars)?;
            }
        }
    }

    if let Some(build) = config.build.value_mut() {
        expand_setting("build.dockerfile", &mut build.dockerfile, &vars)?;
        expand_setting(
            "build.dockerfile_content",
            &mut build.dockerfile_content,
            &vars,
        )?;
        expand_setting("build.context", &mut build.context, &vars)?;
        expand_setting("build.tag", &mut build.tag, &vars)?;
        if let Some(args) = build.args.value_mut() {
            for (key, value) in args.iter_mut() {
                *value = expand(&format!("build.args.{key}"), value, &vars)?;
            }
        }
    }

    Ok(())
}
