//! CPI Router.
//!
//! [`CpiRegistry`] owns every provider the director has ever built, keyed
//! by CPI name. At the start of each operation the director takes a
//! [`CpiRouter`] snapshot from the current CPI config and cloud config;
//! the snapshot is never reused across deploys.
//!
//! Providers for CPIs that have since been removed from the CPI config
//! stay in the registry as *retained* bindings. They are never used for
//! new resources, only to dispose of resources recorded under that name.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use armada_core::{CpiConfig, CpiEntry};
use tracing::{debug, warn};

use crate::dummy::DummyCloud;
use crate::error::{CpiError, CpiResult};
use crate::provider::CloudProvider;

/// Builds a provider for one CPI config entry of a given type.
pub trait CpiBuilder: Send + Sync {
    fn build(&self, entry: &CpiEntry) -> CpiResult<Arc<dyn CloudProvider>>;
}

impl<F> CpiBuilder for F
where
    F: Fn(&CpiEntry) -> CpiResult<Arc<dyn CloudProvider>> + Send + Sync,
{
    fn build(&self, entry: &CpiEntry) -> CpiResult<Arc<dyn CloudProvider>> {
        self(entry)
    }
}

struct Built {
    entry: CpiEntry,
    provider: Arc<dyn CloudProvider>,
}

pub struct CpiRegistry {
    default: Arc<dyn CloudProvider>,
    builders: HashMap<String, Arc<dyn CpiBuilder>>,
    built: Mutex<HashMap<String, Built>>,
}

impl std::fmt::Debug for CpiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpiRegistry")
            .field("default", &self.default)
            .field("types", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CpiRegistry {
    /// A registry whose director-default CPI is `default`. The `dummy`
    /// type is always available.
    pub fn new(default: Arc<dyn CloudProvider>) -> Self {
        let mut builders: HashMap<String, Arc<dyn CpiBuilder>> = HashMap::new();
        builders.insert("dummy".to_string(), Arc::new(DummyCloud::build));
        Self {
            default,
            builders,
            built: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_type(&mut self, kind: &str, builder: Arc<dyn CpiBuilder>) {
        self.builders.insert(kind.to_string(), builder);
    }

    /// Pre-seed a provider under a name (used to share a test double).
    pub fn insert(&self, entry: CpiEntry, provider: Arc<dyn CloudProvider>) {
        self.lock().insert(entry.name.clone(), Built { entry, provider });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Built>> {
        self.built.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve the CPI config into a router for one operation.
    ///
    /// `az_cpis` maps each cloud-config AZ to its CPI name (if any).
    pub fn router(
        &self,
        cpi_config: Option<&CpiConfig>,
        az_cpis: BTreeMap<String, Option<String>>,
    ) -> CpiResult<CpiRouter> {
        let mut built = self.lock();
        let mut configured = HashMap::new();
        let mut aliases = HashMap::new();

        for entry in cpi_config.map(|c| c.cpis.as_slice()).unwrap_or_default() {
            let reuse = built
                .get(&entry.name)
                .filter(|b| b.entry.kind == entry.kind && b.entry.properties == entry.properties)
                .map(|b| b.provider.clone());
            let provider = match reuse {
                Some(p) => p,
                None => {
                    let builder = self
                        .builders
                        .get(&entry.kind)
                        .ok_or_else(|| CpiError::UnknownType(entry.kind.clone()))?;
                    let provider = builder.build(entry)?;
                    debug!(cpi = %entry.name, kind = %entry.kind, "built cpi");
                    built.insert(
                        entry.name.clone(),
                        Built {
                            entry: entry.clone(),
                            provider: provider.clone(),
                        },
                    );
                    provider
                }
            };
            for old in &entry.migrated_from {
                aliases.insert(old.name.clone(), entry.name.clone());
            }
            configured.insert(entry.name.clone(), provider);
        }

        let retained = built
            .iter()
            .filter(|(name, _)| !configured.contains_key(*name))
            .map(|(name, b)| (name.clone(), b.provider.clone()))
            .collect();

        Ok(CpiRouter {
            default: self.default.clone(),
            configured,
            aliases,
            retained,
            az_cpis,
        })
    }
}

/// Per-operation routing snapshot.
#[derive(Clone)]
pub struct CpiRouter {
    default: Arc<dyn CloudProvider>,
    configured: HashMap<String, Arc<dyn CloudProvider>>,
    /// Former CPI name → current name.
    aliases: HashMap<String, String>,
    retained: HashMap<String, Arc<dyn CloudProvider>>,
    az_cpis: BTreeMap<String, Option<String>>,
}

impl std::fmt::Debug for CpiRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpiRouter")
            .field("configured", &self.configured.keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases)
            .field("retained", &self.retained.keys().collect::<Vec<_>>())
            .field("az_cpis", &self.az_cpis)
            .finish()
    }
}

/// A provider plus the CPI name to record on resources it creates.
#[derive(Clone)]
pub struct RoutedCpi {
    pub name: Option<String>,
    pub provider: Arc<dyn CloudProvider>,
}

impl std::fmt::Debug for RoutedCpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedCpi").field("name", &self.name).finish()
    }
}

impl CpiRouter {
    /// A router with only the default CPI (no CPI config, no AZ mapping).
    pub fn single(default: Arc<dyn CloudProvider>) -> Self {
        Self {
            default,
            configured: HashMap::new(),
            aliases: HashMap::new(),
            retained: HashMap::new(),
            az_cpis: BTreeMap::new(),
        }
    }

    fn default_cpi(&self) -> RoutedCpi {
        RoutedCpi {
            name: None,
            provider: self.default.clone(),
        }
    }

    /// CPI name configured for an AZ in the cloud config.
    pub fn az_cpi_name(&self, az: &str) -> Option<&str> {
        self.az_cpis.get(az).and_then(|c| c.as_deref())
    }

    /// Provider for new resources in `az`.
    pub fn for_az(&self, az: Option<&str>) -> CpiResult<RoutedCpi> {
        let Some(az) = az else {
            return Ok(self.default_cpi());
        };
        let Some(cpi) = self.az_cpi_name(az) else {
            return Ok(self.default_cpi());
        };
        self.configured_or_alias(cpi).ok_or_else(|| CpiError::AzCpiNotFound {
            az: az.to_string(),
            cpi: cpi.to_string(),
        })
    }

    /// Whether new capacity can be placed in `az`.
    pub fn serves_az(&self, az: &str) -> bool {
        self.for_az(Some(az)).is_ok()
    }

    /// Provider by explicit CPI name; `None` or empty means the default.
    pub fn named(&self, name: Option<&str>) -> CpiResult<RoutedCpi> {
        match name.filter(|n| !n.is_empty()) {
            None => Ok(self.default_cpi()),
            Some(name) => self
                .configured_or_alias(name)
                .ok_or_else(|| CpiError::CpiNotFound {
                    cpi: name.to_string(),
                }),
        }
    }

    /// Provider for deleting or detaching a resource recorded under CPI
    /// `name` in `az`.
    ///
    /// The recorded CPI (or its migration target) wins. Otherwise, if the
    /// AZ has since been moved to a configured CPI, that one is used. A
    /// resource whose AZ still points at a removed CPI cannot be disposed
    /// of. Resources in AZs gone from the cloud config fall back to the
    /// retained binding for their CPI.
    pub fn for_disposal(&self, name: Option<&str>, az: Option<&str>) -> CpiResult<RoutedCpi> {
        let err = match self.named(name) {
            Ok(routed) => return Ok(routed),
            Err(err) => err,
        };
        if let Some(az) = az
            && let Some(current) = self.az_cpis.get(az)
        {
            return match current {
                Some(cpi) if cpi.as_str() != name.unwrap_or_default() => {
                    let routed = self.configured_or_alias(cpi).ok_or(err)?;
                    debug!(%az, cpi = %cpi, "disposing through the az's current cpi");
                    Ok(routed)
                }
                Some(_) => Err(err),
                None => Ok(self.default_cpi()),
            };
        }
        let name = name.unwrap_or_default();
        match self.retained.get(name) {
            Some(provider) => {
                warn!(cpi = %name, "cpi removed from config; using retained binding");
                Ok(RoutedCpi {
                    name: Some(name.to_string()),
                    provider: provider.clone(),
                })
            }
            None => Err(err),
        }
    }

    fn configured_or_alias(&self, name: &str) -> Option<RoutedCpi> {
        let (name, provider) = match self.configured.get(name) {
            Some(p) => (name.to_string(), p.clone()),
            None => {
                let current = self.aliases.get(name)?;
                (current.clone(), self.configured.get(current)?.clone())
            }
        };
        Some(RoutedCpi {
            name: Some(name),
            provider,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(v: serde_json::Value) -> CpiConfig {
        CpiConfig::parse(&v.to_string()).unwrap()
    }

    fn azs(pairs: &[(&str, Option<&str>)]) -> BTreeMap<String, Option<String>> {
        pairs
            .iter()
            .map(|(a, c)| (a.to_string(), c.map(str::to_string)))
            .collect()
    }

    fn registry() -> CpiRegistry {
        CpiRegistry::new(Arc::new(DummyCloud::new("default")))
    }

    #[test]
    fn az_routes_to_its_cpi() {
        let reg = registry();
        let cfg = config(json!({"cpis": [
            {"name": "cpi-a", "type": "dummy"},
            {"name": "cpi-b", "type": "dummy"}
        ]}));
        let router = reg
            .router(Some(&cfg), azs(&[("z1", Some("cpi-a")), ("z2", Some("cpi-b")), ("z3", None)]))
            .unwrap();
        assert_eq!(router.for_az(Some("z1")).unwrap().name.as_deref(), Some("cpi-a"));
        assert_eq!(router.for_az(Some("z2")).unwrap().name.as_deref(), Some("cpi-b"));
        assert_eq!(router.for_az(Some("z3")).unwrap().name, None);
        assert_eq!(router.for_az(None).unwrap().name, None);
    }

    #[test]
    fn missing_cpi_for_az_is_an_error() {
        let reg = registry();
        let cfg = config(json!({"cpis": [{"name": "cpi-a", "type": "dummy"}]}));
        let router = reg.router(Some(&cfg), azs(&[("z2", Some("cpi-name2"))])).unwrap();
        let err = router.for_az(Some("z2")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to load CPI for AZ 'z2': CPI 'cpi-name2' not found in cpi-config"
        );
        assert!(!router.serves_az("z2"));
        assert_eq!(
            router.named(Some("nope")).unwrap_err().to_string(),
            "CPI 'nope' not found in cpi-config"
        );
    }

    #[test]
    fn providers_survive_between_snapshots() {
        let reg = registry();
        let cfg = config(json!({"cpis": [{"name": "cpi-a", "type": "dummy"}]}));
        let first = reg.router(Some(&cfg), BTreeMap::new()).unwrap();
        let second = reg.router(Some(&cfg), BTreeMap::new()).unwrap();
        assert!(Arc::ptr_eq(
            &first.named(Some("cpi-a")).unwrap().provider,
            &second.named(Some("cpi-a")).unwrap().provider
        ));
    }

    #[test]
    fn renamed_cpi_serves_old_name_and_retains_binding() {
        let reg = registry();
        let old = config(json!({"cpis": [{"name": "cpi-old", "type": "dummy"}]}));
        reg.router(Some(&old), BTreeMap::new()).unwrap();

        let both = config(json!({"cpis": [
            {"name": "cpi-old", "type": "dummy"},
            {"name": "cpi-new", "type": "dummy", "migrated_from": [{"name": "cpi-old"}]}
        ]}));
        reg.router(Some(&both), BTreeMap::new()).unwrap();

        let only_new = config(json!({"cpis": [
            {"name": "cpi-new", "type": "dummy", "migrated_from": [{"name": "cpi-old"}]}
        ]}));
        let router = reg.router(Some(&only_new), BTreeMap::new()).unwrap();
        assert_eq!(router.named(Some("cpi-old")).unwrap().name.as_deref(), Some("cpi-new"));

        let bare = config(json!({"cpis": [{"name": "cpi-new", "type": "dummy"}]}));
        let router = reg.router(Some(&bare), BTreeMap::new()).unwrap();
        assert!(router.named(Some("cpi-old")).is_err());
        assert_eq!(
            router.for_disposal(Some("cpi-old"), None).unwrap().name.as_deref(),
            Some("cpi-old")
        );
        assert!(router.for_disposal(Some("never-existed"), None).is_err());
    }

    #[test]
    fn disposal_follows_az_transition() {
        let reg = registry();
        let old = config(json!({"cpis": [{"name": "cpi-a", "type": "dummy"}]}));
        reg.router(Some(&old), azs(&[("z1", Some("cpi-a"))])).unwrap();

        let renamed = config(json!({"cpis": [{"name": "cpi-a-new", "type": "dummy"}]}));
        let router = reg
            .router(Some(&renamed), azs(&[("z1", Some("cpi-a-new"))]))
            .unwrap();
        let routed = router.for_disposal(Some("cpi-a"), Some("z1")).unwrap();
        assert_eq!(routed.name.as_deref(), Some("cpi-a-new"));
    }

    #[test]
    fn disposal_fails_while_az_points_at_removed_cpi() {
        let reg = registry();
        let both = config(json!({"cpis": [
            {"name": "cpi-name1", "type": "dummy"},
            {"name": "cpi-name2", "type": "dummy"}
        ]}));
        let mapping = azs(&[("z1", Some("cpi-name1")), ("z2", Some("cpi-name2"))]);
        reg.router(Some(&both), mapping.clone()).unwrap();

        let one = config(json!({"cpis": [{"name": "cpi-name1", "type": "dummy"}]}));
        let router = reg.router(Some(&one), mapping).unwrap();
        let err = router
            .for_disposal(Some("cpi-name2"), Some("z2"))
            .unwrap_err();
        assert_eq!(err.to_string(), "CPI 'cpi-name2' not found in cpi-config");

        // z2 removed from the cloud config entirely: fall back to the retained binding.
        let router = reg
            .router(Some(&one), azs(&[("z1", Some("cpi-name1"))]))
            .unwrap();
        assert_eq!(
            router.for_disposal(Some("cpi-name2"), Some("z2")).unwrap().name.as_deref(),
            Some("cpi-name2")
        );
    }

    #[test]
    fn unknown_type_rejected() {
        let reg = registry();
        let cfg = config(json!({"cpis": [{"name": "x", "type": "openstack"}]}));
        assert!(matches!(
            reg.router(Some(&cfg), BTreeMap::new()),
            Err(CpiError::UnknownType(_))
        ));
    }

    #[test]
    fn registered_type_builds_providers() {
        let mut reg = registry();
        let shared = DummyCloud::new("lab");
        let handle = shared.clone();
        reg.register_type(
            "lab",
            Arc::new(move |_: &CpiEntry| -> CpiResult<Arc<dyn CloudProvider>> {
                Ok(Arc::new(handle.clone()))
            }),
        );
        let cfg = config(json!({"cpis": [{"name": "lab-1", "type": "lab", "properties": {"region": "eu"}}]}));
        let router = reg.router(Some(&cfg), BTreeMap::new()).unwrap();
        let routed = router.named(Some("lab-1")).unwrap();
        assert_eq!(routed.name.as_deref(), Some("lab-1"));
        assert!(format!("{:?}", routed.provider).contains("lab"));
    }
}
