//! Test content: a [`Testsuite`] is an ordered list of [`Testset`]s, each an
//! ordered list of [`Testcase`]s. A job's steps are the flattened test cases
//! of its suite.

use std::collections::BTreeMap;

use derive_getters::Getters;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::*;

pub fn default_timeout() -> u64 {
    300
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Testcase {
    name: String,
    #[serde(skip_serializing, default)]
    source: String,
    /// Seconds the remote host may spend on this case.
    #[serde(default = "self::default_timeout")]
    timeout: u64,
    /// The case passes when its script fails.
    #[serde(default)]
    expect_failure: bool,
}

impl Testcase {
    pub fn new<S: Into<String>>(name: S, source: S) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            timeout: default_timeout(),
            expect_failure: false,
        }
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expect_failure(mut self, expect_failure: bool) -> Self {
        self.expect_failure = expect_failure;
        self
    }
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Testset {
    name: String,
    testcases: Vec<Testcase>,
}

impl Testset {
    pub fn new<S: Into<String>>(name: S, testcases: Vec<Testcase>) -> Self {
        Self {
            name: name.into(),
            testcases,
        }
    }
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Testsuite {
    name: String,
    testsets: Vec<Testset>,
}

impl Testsuite {
    pub fn new<S: Into<String>>(name: S, testsets: Vec<Testset>) -> Self {
        Self {
            name: name.into(),
            testsets,
        }
    }

    /// All test cases in execution order.
    pub fn testcases(&self) -> impl Iterator<Item = &Testcase> {
        self.testsets.iter().flat_map(|set| set.testcases.iter())
    }

    pub fn testcase_count(&self) -> usize {
        self.testsets.iter().map(|set| set.testcases.len()).sum()
    }

    pub fn find_testcase(&self, set: &str, case: &str) -> Option<&Testcase> {
        self.testsets
            .iter()
            .find(|s| s.name == set)?
            .testcases
            .iter()
            .find(|c| c.name == case)
    }

    /// Problems that would keep a host from running this suite. An empty
    /// list means the suite is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = vec![];
        if self.testcase_count() == 0 {
            problems.push(format!("testsuite '{}' has no testcases", self.name));
        }
        let mut seen = BTreeMap::new();
        for (set_name, case) in self
            .testsets
            .iter()
            .flat_map(|set| set.testcases.iter().map(move |c| (&set.name, c)))
        {
            if case.source.trim().is_empty() {
                problems.push(format!("testcase '{}/{}' is empty", set_name, case.name));
            }
            if case.name.contains('/') {
                problems.push(format!("testcase name '{}' contains a slash", case.name));
            }
            if let Some(other) = seen.insert(case.name.as_str(), set_name) {
                debug!(
                    "testsuite: '{}' appears in '{}' and '{}'",
                    case.name, other, set_name
                );
            }
        }
        problems
    }

    /// A gzipped tarball holding every test case as `<suite>/<index>-<name>`,
    /// where `index` is the step index the case runs at.
    #[tracing::instrument(skip(self), fields(testsuite = %self.name))]
    pub fn archive(&self) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (index, case) in self.testcases().enumerate() {
            let mut header = tar::Header::new_gnu();
            header.set_size(case.source.len() as u64);
            header.set_mode(0o755);
            header.set_mtime(0);
            let path = format!("{}/{:03}-{}", self.name, index, case.name);
            builder.append_data(&mut header, path, case.source.as_bytes())?;
        }
        let manifest = self
            .testcases()
            .enumerate()
            .map(|(index, case)| {
                format!(
                    "{:03}-{} timeout={} expect_failure={}\n",
                    index, case.name, case.timeout, case.expect_failure
                )
            })
            .collect::<String>();
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder.append_data(
            &mut header,
            format!("{}/testsuite", self.name),
            manifest.as_bytes(),
        )?;
        Ok(builder.into_inner()?.finish()?)
    }
}
