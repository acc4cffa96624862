//! Fakes shared by the unit tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{LabError, Result};
use crate::host::Host;
use crate::inventory::{Origin, ProfileFiles, ProfileOrigin};
use crate::job::JobSpec;
use crate::profile::{join_kargs, Profile};
use crate::testplan::Testplan;
use crate::testsuite::{Testcase, Testset, Testsuite};

pub fn smoke_suite() -> Testsuite {
    Testsuite::new(
        "smoke",
        vec![
            Testset::new(
                "boot",
                vec![
                    Testcase::new("check_uptime.sh", "#!/bin/sh\nuptime\n"),
                    Testcase::new("check_dmesg.sh", "#!/bin/sh\ndmesg\n"),
                ],
            ),
            Testset::new(
                "net",
                vec![Testcase::new("ping.sh", "#!/bin/sh\nping -c1 gw\n")],
            ),
        ],
    )
}

pub fn suite_with_cases(cases: usize) -> Testsuite {
    let testcases = (0..cases)
        .map(|i| Testcase::new(format!("case{i}.sh"), "#!/bin/sh\ntrue\n".to_string()))
        .collect();
    Testsuite::new("generated", vec![Testset::new("all", testcases)])
}

/// A job spec running `cases` test cases with `fedora-minimal` on `vm1`.
pub fn spec_with_cases(cases: usize) -> JobSpec {
    spec_for(cases, FakeProfile::new("fedora-minimal"), FakeHost::new("vm1"))
}

pub fn spec_for(cases: usize, profile: Arc<FakeProfile>, host: Arc<FakeHost>) -> JobSpec {
    JobSpec::new(
        Arc::new(suite_with_cases(cases)),
        profile,
        host,
        String::new(),
    )
}

#[derive(Debug)]
pub struct FakeHost {
    name: String,
    is_virtual: bool,
    fail_boot: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            is_virtual: false,
            fail_boot: AtomicBool::new(false),
            calls: Mutex::new(vec![]),
        })
    }

    pub fn virtual_host(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            is_virtual: true,
            fail_boot: AtomicBool::new(false),
            calls: Mutex::new(vec![]),
        })
    }

    pub fn fail_boot(&self) {
        self.fail_boot.store(true, Ordering::SeqCst);
    }

    /// Lifecycle calls in the order they happened.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().expect("calls").push(call.to_string());
    }
}

#[async_trait]
impl Host for FakeHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        "fake"
    }

    fn mac(&self) -> Option<&str> {
        Some("52:54:00:00:00:01")
    }

    fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    fn for_job(self: Arc<Self>, _cookie: &str, _session_dir: &Path) -> Arc<dyn Host> {
        self
    }

    async fn boot(&self) -> Result<()> {
        self.record("boot");
        if self.fail_boot.load(Ordering::SeqCst) {
            return Err(LabError::backend("fake", "power supply on fire"));
        }
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.record("reboot");
        if self.fail_boot.load(Ordering::SeqCst) {
            return Err(LabError::backend("fake", "power supply on fire"));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.record("shutdown");
        Ok(())
    }

    async fn define(&self) -> Result<()> {
        self.record("define");
        Ok(())
    }

    async fn undefine(&self) -> Result<()> {
        self.record("undefine");
        Ok(())
    }

    async fn create_images(&self) -> Result<()> {
        self.record("create_images");
        Ok(())
    }

    async fn remove_images(&self) -> Result<()> {
        self.record("remove_images");
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeProfile {
    name: String,
    pxe: Mutex<BTreeMap<String, bool>>,
    calls: Mutex<Vec<String>>,
}

impl FakeProfile {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            pxe: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(vec![]),
        })
    }

    /// Whether PXE was last enabled or disabled for `host`.
    pub fn pxe_enabled(&self, host: &str) -> Option<bool> {
        self.pxe.lock().expect("pxe").get(host).copied()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }
}

#[async_trait]
impl Profile for FakeProfile {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        "fake"
    }

    fn kargs(&self, additional: &str) -> String {
        join_kargs("console=ttyS0 testbay.cookie={testbay_cookie}", additional)
    }

    async fn assign_to(&self, host: &dyn Host, cookie: &str, _additional_kargs: &str) -> Result<()> {
        self.record(format!("assign {} {}", host.name(), cookie));
        Ok(())
    }

    async fn revoke_from(&self, host: &dyn Host) -> Result<()> {
        self.record(format!("revoke {}", host.name()));
        Ok(())
    }

    async fn enable_pxe(&self, host: &dyn Host, enable: bool) -> Result<()> {
        self.record(format!("pxe {} {}", host.name(), enable));
        self.pxe
            .lock()
            .expect("pxe")
            .insert(host.name().to_string(), enable);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.record("delete".to_string());
        Ok(())
    }
}

/// An origin listing a fixed set of items.
#[derive(Debug)]
pub struct StaticOrigin<T: ?Sized> {
    items: BTreeMap<String, Arc<T>>,
}

#[async_trait]
impl<T: ?Sized + Send + Sync + std::fmt::Debug> Origin<T> for StaticOrigin<T> {
    async fn items(&self) -> Result<BTreeMap<String, Arc<T>>> {
        Ok(self.items.clone())
    }
}

#[async_trait]
impl ProfileOrigin for StaticOrigin<dyn Profile> {
    async fn create_profile(&self, name: &str, _files: &ProfileFiles) -> Result<()> {
        if self.items.contains_key(name) {
            return Err(LabError::InvalidRequest(format!("profile '{name}' exists")));
        }
        Ok(())
    }
}

pub fn suites_origin(suites: Vec<Testsuite>) -> Arc<dyn Origin<Testsuite>> {
    Arc::new(StaticOrigin {
        items: suites
            .into_iter()
            .map(|s| (s.name().clone(), Arc::new(s)))
            .collect(),
    })
}

pub fn plans_origin(plans: Vec<Testplan>) -> Arc<dyn Origin<Testplan>> {
    Arc::new(StaticOrigin {
        items: plans
            .into_iter()
            .map(|p| (p.name().clone(), Arc::new(p)))
            .collect(),
    })
}

pub fn hosts_origin(hosts: Vec<Arc<FakeHost>>) -> Arc<dyn Origin<dyn Host>> {
    Arc::new(StaticOrigin::<dyn Host> {
        items: hosts
            .into_iter()
            .map(|h| (h.name().to_string(), h as Arc<dyn Host>))
            .collect(),
    })
}

pub fn profiles_origin(profiles: Vec<Arc<FakeProfile>>) -> Arc<dyn ProfileOrigin> {
    Arc::new(StaticOrigin::<dyn Profile> {
        items: profiles
            .into_iter()
            .map(|p| (p.name().to_string(), p as Arc<dyn Profile>))
            .collect(),
    })
}

/// A host origin whose backend is unreachable.
#[derive(Debug)]
pub struct FailingOrigin;

#[async_trait]
impl Origin<dyn Host> for FailingOrigin {
    async fn items(&self) -> Result<BTreeMap<String, Arc<dyn Host>>> {
        Err(LabError::backend("cobbler", "connection refused"))
    }
}
