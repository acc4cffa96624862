//! Boot/install definitions and their kernel arguments.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::host::Host;

/// Placeholder in kernel arguments replaced by the job's cookie, e.g.
/// `testbay.url=http://lab:8080/jobs/{testbay_cookie}/bootstrap`.
pub const COOKIE_PLACEHOLDER: &str = "{testbay_cookie}";

/// A boot/install image bound to a host for the duration of one job.
#[async_trait]
pub trait Profile: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn backend(&self) -> &str;

    /// The kernel arguments this profile boots with, extended by
    /// `additional`. The cookie placeholder is left in place.
    fn kargs(&self, additional: &str) -> String;

    /// Make `host` boot this profile, with kernel arguments calling back to
    /// the job identified by `cookie`.
    async fn assign_to(&self, host: &dyn Host, cookie: &str, additional_kargs: &str) -> Result<()>;

    /// Undo [`Profile::assign_to`].
    async fn revoke_from(&self, host: &dyn Host) -> Result<()>;

    /// Whether `host` PXE-boots into this profile on its next boot.
    async fn enable_pxe(&self, host: &dyn Host, enable: bool) -> Result<()>;

    async fn delete(&self) -> Result<()>;

    fn describe(&self) -> Value {
        serde_json::json!({
            "name": self.name(),
            "backend": self.backend(),
            "kargs": self.kargs(""),
        })
    }
}

/// Join a profile's base kernel arguments with additional ones. Later
/// arguments come last so they override earlier `key=value` pairs on the
/// kernel command line.
pub fn join_kargs(base: &str, additional: &str) -> String {
    let words = base
        .split_whitespace()
        .chain(additional.split_whitespace())
        .collect::<Vec<_>>();
    words.join(" ")
}

/// Substitute the cookie into `kargs`. Arguments without the placeholder get
/// `testbay_cookie=<cookie>` appended so a booted host can always call back.
pub fn render_kargs(kargs: &str, cookie: &str) -> String {
    if kargs.contains(COOKIE_PLACEHOLDER) {
        kargs.replace(COOKIE_PLACEHOLDER, cookie)
    } else {
        join_kargs(kargs, &format!("testbay_cookie={cookie}"))
    }
}

/// Joined kernel arguments, keyed by base and additional arguments. One
/// cache is shared by all profiles of an origin and outlives the profile
/// values the origin hands out.
pub struct KargsCache {
    cache: quick_cache::sync::Cache<(String, String), String>,
}

impl KargsCache {
    pub fn new() -> Self {
        Self {
            cache: quick_cache::sync::Cache::new(256),
        }
    }

    /// [`join_kargs`] of `base` and `additional`, computed once.
    pub fn join(&self, base: &str, additional: &str) -> String {
        let key = (base.to_string(), additional.to_string());
        if let Some(kargs) = self.cache.get(&key) {
            return kargs;
        }
        let kargs = join_kargs(base, additional);
        self.cache.insert(key, kargs.clone());
        kargs
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.len() == 0
    }
}

impl Default for KargsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KargsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KargsCache")
            .field("len", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_that_cookies_are_substituted() {
        assert_eq!(
            "console=ttyS0 testbay.url=http://lab/jobs/abc123/bootstrap",
            render_kargs(
                "console=ttyS0 testbay.url=http://lab/jobs/{testbay_cookie}/bootstrap",
                "abc123"
            )
        );
    }

    #[test]
    fn test_that_cookies_are_always_embedded() {
        assert_eq!(
            "quiet testbay_cookie=abc123",
            render_kargs("quiet", "abc123")
        );
    }

    #[test]
    fn test_that_kargs_are_joined_in_order() {
        assert_eq!("a=1 b=2 a=3", join_kargs(" a=1  b=2", "a=3 "));
        assert_eq!("a=1", join_kargs("a=1", ""));
    }

    #[test]
    fn test_that_kargs_are_cached_per_base_and_extra() {
        let cache = KargsCache::new();
        assert!(cache.is_empty());
        for _ in 0..3 {
            assert_eq!("base quiet", cache.join("base", "quiet"));
        }
        assert_eq!(1, cache.len());
        assert_eq!("other quiet", cache.join("other", "quiet"));
        assert_eq!(2, cache.len());
    }
}
