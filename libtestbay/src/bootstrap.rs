//! The script a freshly booted host fetches to run its job.
//!
//! Templates use `${name}` placeholders. Known names are substituted, any
//! other `${...}` (and plain `$var`) is left for the shell, and `$$` is a
//! literal `$`.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::log::*;

pub const DEFAULT_TEMPLATE: &str = include_str!("../data/client-bootstrap.sh");

#[derive(Debug, Clone)]
pub struct BootstrapTemplate {
    template: String,
}

impl Default for BootstrapTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

impl BootstrapTemplate {
    pub fn new<S: Into<String>>(template: S) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        debug!("bootstrap: loading template from {}", path.display());
        Ok(Self::new(tokio::fs::read_to_string(path).await?))
    }

    pub fn render(&self, cookie: &str, current_step: usize, testsuite: &str) -> String {
        let current_step = current_step.to_string();
        let mut values = BTreeMap::new();
        values.insert("testbay_cookie", cookie);
        values.insert("testbay_current_step", current_step.as_str());
        values.insert("testbay_testsuite", testsuite);
        substitute(&self.template, &values)
    }
}

/// Replace `${name}` for every known `name`, leaving everything else as is.
pub fn substitute(template: &str, values: &BTreeMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        rest = &rest[at..];
        if let Some(after) = rest.strip_prefix("$$") {
            out.push('$');
            rest = after;
            continue;
        }
        let replaced = rest
            .strip_prefix("${")
            .and_then(|inner| inner.find('}').map(|end| (&inner[..end], &inner[end + 1..])))
            .filter(|(name, _)| is_identifier(name))
            .and_then(|(name, after)| values.get(name).map(|value| (*value, after)));
        match replaced {
            Some((value, after)) => {
                out.push_str(value);
                rest = after;
            }
            None => {
                out.push('$');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
