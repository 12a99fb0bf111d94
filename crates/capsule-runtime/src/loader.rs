//! Code loading
//!
//! A [`TaskLoader`] resolves unit names for one task, in this order:
//! 1. names under an isolated prefix are reloaded from the host classpath
//!    and rewritten for the task (shared process-wide per fingerprint)
//! 2. the task's own rewritten units and data
//! 3. the bridge units every task may reach (`host.task`, `host.lang`,
//!    `plugin.*`)
//! 4. anything else is delegated to the host only if the policy permits
//!
//! Host delegation looks at native units, then trusted classpath units
//! (executed as-is), then data.

use crate::bytecode::{CodeUnit, Unit};
use crate::natives::{NativeUnit, Natives};
use crate::rewrite::{RewriteContext, RewriteError, Rewriter};
use crate::security::permissions::name_has_prefix;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use thiserror::Error;

/// Units every task may reach regardless of policy
pub const BRIDGE_UNITS: &[&str] = &["host.task", "host.lang"];

/// Namespace of plugin native units, also always reachable
pub const PLUGIN_NAMESPACE: &str = "plugin.";

pub fn is_bridge(name: &str) -> bool {
    BRIDGE_UNITS.contains(&name) || name_has_prefix(name, PLUGIN_NAMESPACE)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("unit '{name}' is not visible to this task")]
    Denied { name: String },

    #[error("unit '{name}' not found")]
    NotFound { name: String },

    #[error("unit '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

/// An executable unit ready to run
#[derive(Debug)]
pub struct LoadedUnit {
    unit: Unit,
    trusted: bool,
}

impl LoadedUnit {
    /// Rewritten, confined code
    pub fn confined(unit: Unit) -> Self {
        Self {
            unit,
            trusted: false,
        }
    }

    /// Host code executed without instrumentation
    pub fn trusted(unit: Unit) -> Self {
        Self {
            unit,
            trusted: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.unit.name
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.unit.method_index(name)
    }
}

#[derive(Clone)]
pub enum Resolved {
    Code(Arc<LoadedUnit>),
    Native(Arc<NativeUnit>),
    Data(Arc<[u8]>),
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolved::Code(unit) => write!(f, "Code({})", unit.name()),
            Resolved::Native(unit) => write!(f, "Native({})", unit.name()),
            Resolved::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
        }
    }
}

/// Host-side units available for delegation and reloading
#[derive(Debug, Clone, Default)]
pub struct HostClasspath {
    units: HashMap<String, CodeUnit>,
}

impl HostClasspath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, unit: CodeUnit) -> Self {
        self.add(unit);
        self
    }

    pub fn add(&mut self, unit: CodeUnit) {
        self.units.insert(unit.name.clone(), unit);
    }

    pub fn get(&self, name: &str) -> Option<&CodeUnit> {
        self.units.get(name)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// What the host offers every task: natives and trusted classpath units
pub struct HostEnvironment {
    classpath: HostClasspath,
    natives: Natives,
    trusted: Mutex<HashMap<String, Arc<LoadedUnit>>>,
}

impl HostEnvironment {
    pub fn new(classpath: HostClasspath, natives: Natives) -> Self {
        Self {
            classpath,
            natives,
            trusted: Mutex::new(HashMap::new()),
        }
    }

    pub fn classpath(&self) -> &HostClasspath {
        &self.classpath
    }

    pub fn natives(&self) -> &Natives {
        &self.natives
    }

    /// Resolve `name` on the host side
    pub fn resolve(&self, name: &str) -> Result<Resolved, LoadError> {
        if let Some(native) = self.natives.get(name) {
            return Ok(Resolved::Native(native));
        }

        let unit = self.classpath.get(name).ok_or_else(|| LoadError::NotFound {
            name: name.to_string(),
        })?;
        if !unit.is_executable() {
            return Ok(Resolved::Data(unit.bytes.clone()));
        }

        let mut trusted = self.trusted.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(loaded) = trusted.get(name) {
            return Ok(Resolved::Code(loaded.clone()));
        }
        let decoded = Unit::from_bytes(&unit.bytes).map_err(|e| LoadError::Invalid {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let loaded = Arc::new(LoadedUnit::trusted(decoded));
        trusted.insert(name.to_string(), loaded.clone());
        Ok(Resolved::Code(loaded))
    }
}

type ReloadKey = (String, String);

fn reload_cache() -> MutexGuard<'static, HashMap<ReloadKey, Arc<Unit>>> {
    static CACHE: OnceLock<Mutex<HashMap<ReloadKey, Arc<Unit>>>> = OnceLock::new();
    CACHE
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Number of reloaded units held by the process-wide cache
pub fn reload_cache_len() -> usize {
    reload_cache().len()
}

/// A bundle's units after rewriting for one policy and plugin set
#[derive(Debug, Default)]
pub struct RewrittenBundle {
    code: HashMap<String, Arc<LoadedUnit>>,
    data: HashMap<String, Arc<[u8]>>,
}

impl RewrittenBundle {
    pub fn code(&self, name: &str) -> Option<&Arc<LoadedUnit>> {
        self.code.get(name)
    }
}

/// Caller-submitted units; one execution at a time
#[derive(Debug)]
pub struct CodeBundle {
    name: String,
    units: BTreeMap<String, CodeUnit>,
    occupied: AtomicBool,
    rewritten: Mutex<HashMap<String, Arc<RewrittenBundle>>>,
}

impl CodeBundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: BTreeMap::new(),
            occupied: AtomicBool::new(false),
            rewritten: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_unit(mut self, unit: CodeUnit) -> Self {
        self.units.insert(unit.name.clone(), unit);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, name: &str) -> Option<&CodeUnit> {
        self.units.get(name)
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::SeqCst)
    }

    /// Claim the bundle for one execution
    pub fn occupy(self: &Arc<Self>) -> Option<BundleLease> {
        self.occupied
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| BundleLease(Arc::clone(self)))
    }

    /// Rewrite every executable unit, once per rewriter fingerprint
    pub fn rewritten(&self, rewriter: &Rewriter) -> Result<Arc<RewrittenBundle>, (String, RewriteError)> {
        let mut cache = self.rewritten.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(done) = cache.get(rewriter.fingerprint()) {
            return Ok(done.clone());
        }

        let mut bundle = RewrittenBundle::default();
        for (name, unit) in &self.units {
            if !unit.is_executable() {
                bundle.data.insert(name.clone(), unit.bytes.clone());
                continue;
            }
            let decoded = Unit::from_bytes(&unit.bytes)
                .map_err(|e| (name.clone(), RewriteError::from(e)))?;
            let (rewritten, _) = rewriter
                .rewrite_unit(decoded, RewriteContext::Untrusted)
                .map_err(|e| (name.clone(), e))?;
            bundle
                .code
                .insert(name.clone(), Arc::new(LoadedUnit::confined(rewritten)));
        }

        let bundle = Arc::new(bundle);
        cache.insert(rewriter.fingerprint().to_string(), bundle.clone());
        Ok(bundle)
    }
}

/// Exclusive claim on a [`CodeBundle`]; released on drop
#[derive(Debug)]
pub struct BundleLease(Arc<CodeBundle>);

impl BundleLease {
    pub fn bundle(&self) -> &Arc<CodeBundle> {
        &self.0
    }
}

impl Drop for BundleLease {
    fn drop(&mut self) {
        self.0.occupied.store(false, Ordering::SeqCst);
    }
}

/// Per-task name resolution
pub struct TaskLoader {
    bundle: Arc<RewrittenBundle>,
    host: Arc<HostEnvironment>,
    plugin_natives: HashMap<String, Arc<NativeUnit>>,
    rewriter: Arc<Rewriter>,
    resolved: Mutex<HashMap<String, Resolved>>,
}

impl TaskLoader {
    pub fn new(
        bundle: Arc<RewrittenBundle>,
        host: Arc<HostEnvironment>,
        plugin_natives: Vec<NativeUnit>,
        rewriter: Arc<Rewriter>,
    ) -> Self {
        Self {
            bundle,
            host,
            plugin_natives: plugin_natives
                .into_iter()
                .map(|unit| (unit.name().to_string(), Arc::new(unit)))
                .collect(),
            rewriter,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `name`; successes are cached, denials are not
    pub fn resolve(&self, name: &str) -> Result<Resolved, LoadError> {
        if let Some(hit) = self
            .resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Ok(hit.clone());
        }

        let resolved = self.resolve_uncached(name)?;
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    fn resolve_uncached(&self, name: &str) -> Result<Resolved, LoadError> {
        let policy = self.rewriter.policy();

        if policy.is_isolated(name) && self.host.classpath().get(name).is_some() {
            if !policy.permits_unit(name) {
                return Err(LoadError::Denied {
                    name: name.to_string(),
                });
            }
            return self.reload(name);
        }

        if let Some(code) = self.bundle.code.get(name) {
            return Ok(Resolved::Code(code.clone()));
        }
        if let Some(data) = self.bundle.data.get(name) {
            return Ok(Resolved::Data(data.clone()));
        }

        if is_bridge(name) {
            if let Some(native) = self.plugin_natives.get(name) {
                return Ok(Resolved::Native(native.clone()));
            }
            return self.host.resolve(name);
        }

        if policy.permits_unit(name) {
            self.host.resolve(name)
        } else {
            Err(LoadError::Denied {
                name: name.to_string(),
            })
        }
    }

    fn reload(&self, name: &str) -> Result<Resolved, LoadError> {
        let unit = self
            .host
            .classpath()
            .get(name)
            .ok_or_else(|| LoadError::NotFound {
                name: name.to_string(),
            })?;
        if !unit.is_executable() {
            return Ok(Resolved::Data(unit.bytes.clone()));
        }

        let key = (name.to_string(), self.rewriter.fingerprint().to_string());
        let cacheable = !self.rewriter.requires_uncached_reload();
        if cacheable {
            if let Some(cached) = reload_cache().get(&key) {
                return Ok(Resolved::Code(Arc::new(LoadedUnit::confined(
                    (**cached).clone(),
                ))));
            }
        }

        let invalid = |reason: String| LoadError::Invalid {
            name: name.to_string(),
            reason,
        };
        let decoded = Unit::from_bytes(&unit.bytes).map_err(|e| invalid(e.to_string()))?;
        let (rewritten, _) = self
            .rewriter
            .rewrite_unit(decoded, RewriteContext::Reloaded)
            .map_err(|e| invalid(e.to_string()))?;
        tracing::debug!(unit = name, cached = cacheable, "reloaded isolated unit");

        if cacheable {
            reload_cache().insert(key, Arc::new(rewritten.clone()));
        }
        Ok(Resolved::Code(Arc::new(LoadedUnit::confined(rewritten))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::assembler::UnitBuilder;
    use crate::bytecode::Insn;
    use crate::security::policy::PermissionPolicy;

    fn unit(name: &str) -> CodeUnit {
        UnitBuilder::new(name)
            .method("main", 0, 0, |m| {
                m.op(Insn::Null).op(Insn::Return);
            })
            .build_code_unit()
            .unwrap()
    }

    #[test]
    fn test_bundle_occupancy() {
        let bundle = Arc::new(CodeBundle::new("b").with_unit(unit("app")));
        let lease = bundle.occupy().unwrap();
        assert!(bundle.occupy().is_none());
        drop(lease);
        assert!(bundle.occupy().is_some());
    }

    #[test]
    fn test_bundle_rewritten_once_per_fingerprint() {
        let bundle = CodeBundle::new("b")
            .with_unit(unit("app"))
            .with_unit(CodeUnit::data("app.txt", b"hi".to_vec()));
        let rewriter = Rewriter::new(Arc::new(PermissionPolicy::permissive()), Vec::new());

        let first = bundle.rewritten(&rewriter).unwrap();
        let second = bundle.rewritten(&rewriter).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.code("app").is_some());
        assert!(first.code("app.txt").is_none());
    }

    #[test]
    fn test_host_resolution_prefers_natives() {
        let mut natives = Natives::empty();
        natives.register(NativeUnit::new("lib.shared"));
        let host = HostEnvironment::new(HostClasspath::new().with_unit(unit("lib.shared")), natives);
        assert!(matches!(host.resolve("lib.shared"), Ok(Resolved::Native(_))));
        assert!(matches!(
            host.resolve("lib.none"),
            Err(LoadError::NotFound { .. })
        ));
    }

    #[test]
    fn test_bridge_names() {
        assert!(is_bridge("host.task"));
        assert!(is_bridge("plugin.counter"));
        assert!(!is_bridge("host.io"));
        assert!(!is_bridge("pluginx"));
    }
}
