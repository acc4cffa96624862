//! Test plans: a named batch of job layouts, parametrized by variables.
//!
//! ```yaml
//! description: nightly smoke run
//! variables:
//!   profile: fedora-minimal
//!   host: [vm1, vm2]
//! jobs:
//!   - testsuite: smoke
//!     profile: "{profile}"
//!     host: "{host}"
//!     additional_kargs: "console=ttyS0"
//! ```
//!
//! List-valued variables expand into the cartesian product of their values,
//! so the plan above yields one job per host.

use std::collections::BTreeMap;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};
use crate::log::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variable {
    One(String),
    Many(Vec<String>),
}

impl Variable {
    /// Values passed by callers at run time. A comma separated value becomes
    /// a list.
    pub fn from_override(value: &str) -> Self {
        if value.contains(',') {
            Variable::Many(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(String::from)
                    .collect(),
            )
        } else {
            Variable::One(value.to_string())
        }
    }

    fn values(&self) -> Vec<&str> {
        match self {
            Variable::One(value) => vec![value.as_str()],
            Variable::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// One line of a plan: which suite to run with which profile on which host.
/// Fields may contain `{variable}` placeholders.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLayout {
    testsuite: String,
    profile: String,
    host: String,
    #[serde(default)]
    additional_kargs: String,
}

impl JobLayout {
    pub fn new<S: Into<String>>(testsuite: S, profile: S, host: S) -> Self {
        Self {
            testsuite: testsuite.into(),
            profile: profile.into(),
            host: host.into(),
            additional_kargs: String::new(),
        }
    }

    pub fn with_additional_kargs<S: Into<String>>(mut self, kargs: S) -> Self {
        self.additional_kargs = kargs.into();
        self
    }
}

/// A fully rendered job layout, referring to inventory items by name.
#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    testsuite: String,
    profile: String,
    host: String,
    additional_kargs: String,
}

impl JobRequest {
    pub fn new<S: Into<String>>(testsuite: S, profile: S, host: S, additional_kargs: S) -> Self {
        Self {
            testsuite: testsuite.into(),
            profile: profile.into(),
            host: host.into(),
            additional_kargs: additional_kargs.into(),
        }
    }
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Testplan {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    variables: BTreeMap<String, Variable>,
    jobs: Vec<JobLayout>,
}

impl Testplan {
    pub fn new<S: Into<String>>(name: S, jobs: Vec<JobLayout>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            variables: BTreeMap::new(),
            jobs,
        }
    }

    pub fn with_variable<S: Into<String>>(mut self, key: S, value: Variable) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Parse a plan document; the plan is named after its file.
    pub fn from_yaml<S: Into<String>>(name: S, yaml: &str) -> Result<Self> {
        let mut plan: Testplan = serde_yaml::from_str(yaml)?;
        plan.name = name.into();
        Ok(plan)
    }

    /// Render every job layout for every variable binding. `overrides` take
    /// precedence over the plan's own variables.
    #[tracing::instrument(skip(self), fields(plan = %self.name))]
    pub fn expand(&self, overrides: &BTreeMap<String, Variable>) -> Result<Vec<JobRequest>> {
        let mut variables = self.variables.clone();
        variables.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let bindings = bindings(&variables)?;
        let mut requests = vec![];
        for binding in &bindings {
            for layout in &self.jobs {
                requests.push(JobRequest {
                    testsuite: render(&layout.testsuite, binding)?,
                    profile: render(&layout.profile, binding)?,
                    host: render(&layout.host, binding)?,
                    additional_kargs: render(&layout.additional_kargs, binding)?,
                });
            }
        }
        debug!(
            "testplan: {} bindings, {} job requests",
            bindings.len(),
            requests.len()
        );
        Ok(requests)
    }
}

/// The cartesian product of all variable values.
fn bindings(variables: &BTreeMap<String, Variable>) -> Result<Vec<BTreeMap<&str, &str>>> {
    let mut out = vec![BTreeMap::new()];
    for (key, variable) in variables {
        let values = variable.values();
        if values.is_empty() {
            return Err(LabError::InvalidRequest(format!(
                "variable '{key}' has no values"
            )));
        }
        out = out
            .into_iter()
            .flat_map(|binding| {
                values.iter().map(move |value| {
                    let mut binding = binding.clone();
                    binding.insert(key.as_str(), *value);
                    binding
                })
            })
            .collect();
    }
    Ok(out)
}

/// Substitute `{name}` placeholders. `{{` and `}}` are literal braces.
fn render(template: &str, binding: &BTreeMap<&str, &str>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let key: String = chars.by_ref().take_while(|c| *c != '}').collect();
                let value = binding.get(key.as_str()).ok_or_else(|| {
                    LabError::InvalidRequest(format!("undefined variable '{key}' in '{template}'"))
                })?;
                out.push_str(value);
            }
            c => out.push(c),
        }
    }
    Ok(out)
}
