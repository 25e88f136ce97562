use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};

use crate::config::DetectorSettings;
use crate::detect::result::Detection;
use crate::frame::Frame;

use super::backend::DetectorBackend;
use super::backends::StubBackend;

/// A detector instance that may be used from several worker threads.
///
/// `DetectorBackend::detect` takes `&mut self`, so every call goes through the
/// mutex: sharing one model across cameras serializes inference at call level.
pub type SharedDetector = Arc<Mutex<Box<dyn DetectorBackend>>>;

type BackendFactory = Box<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Wrap a backend for use by detector workers.
pub fn shared_detector<B: DetectorBackend + 'static>(backend: B) -> SharedDetector {
    Arc::new(Mutex::new(Box::new(backend)))
}

/// Run one detection call under the detector's lock.
pub fn detect_locked(detector: &SharedDetector, frame: &Frame) -> Result<Vec<Detection>> {
    let mut guard = detector
        .lock()
        .map_err(|_| anyhow!("detector lock poisoned"))?;
    guard.detect(frame)
}

/// Thread-safe registry of detector backend factories.
///
/// Cameras either get their own instance (`instantiate`) or all share one
/// lazily-built instance per backend name (`shared`).
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
    shared: Mutex<HashMap<String, SharedDetector>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            shared: Mutex::new(HashMap::new()),
            default_name: None,
        }
    }

    /// Registry with the built-in backends configured from `settings`.
    ///
    /// `stub` is always available; `tract` requires the `backend-tract` feature
    /// and a model path. The configured backend becomes the default.
    pub fn with_builtin(settings: &DetectorSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register("stub", || Ok(Box::new(StubBackend::new())));

        #[cfg(feature = "backend-tract")]
        if let Some(model_path) = settings.model_path.clone() {
            let input_size = settings.input_size;
            let threshold = settings.min_confidence;
            registry.register("tract", move || {
                let backend = super::backends::TractBackend::new(&model_path, input_size)?
                    .with_threshold(threshold);
                Ok(Box::new(backend))
            });
        }

        registry
            .set_default(&settings.backend)
            .with_context(|| format!("detector backend '{}' unavailable", settings.backend))?;
        Ok(registry)
    }

    /// Register a backend factory. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a fresh, warmed-up instance owned by the caller.
    pub fn instantiate(&self, name: &str) -> Result<SharedDetector> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        let mut backend = factory().with_context(|| format!("build backend '{}'", name))?;
        backend
            .warm_up()
            .with_context(|| format!("warm up backend '{}'", name))?;
        Ok(Arc::new(Mutex::new(backend)))
    }

    /// The single instance shared by every caller asking for `name`.
    pub fn shared(&self, name: &str) -> Result<SharedDetector> {
        let mut cache = self
            .shared
            .lock()
            .map_err(|_| anyhow!("backend cache lock poisoned"))?;
        if let Some(existing) = cache.get(name) {
            return Ok(existing.clone());
        }
        let detector = self.instantiate(name)?;
        cache.insert(name.to_string(), detector.clone());
        Ok(detector)
    }

    /// Instance of the default backend, shared or per-caller.
    pub fn default_detector(&self, shared: bool) -> Result<SharedDetector> {
        let name = self
            .default_name
            .clone()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        if shared {
            self.shared(&name)
        } else {
            self.instantiate(&name)
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    struct FixedBackend;

    impl DetectorBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(vec![Detection::new(
                "person",
                0.9,
                BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            )])
        }
    }

    #[test]
    fn first_registered_backend_is_default() {
        let mut registry = BackendRegistry::new();
        registry.register("fixed", || Ok(Box::new(FixedBackend)));
        registry.register("stub", || Ok(Box::new(StubBackend::new())));
        assert_eq!(registry.default_name(), Some("fixed"));
        assert_eq!(registry.list(), vec!["fixed".to_string(), "stub".to_string()]);
        assert!(registry.set_default("missing").is_err());
    }

    #[test]
    fn shared_returns_same_instance_and_instantiate_does_not() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register("fixed", || Ok(Box::new(FixedBackend)));

        let a = registry.shared("fixed")?;
        let b = registry.shared("fixed")?;
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.instantiate("fixed")?;
        assert!(!Arc::ptr_eq(&a, &c));

        let frame = Frame::filled(4, 4, 0, 1, 0.0);
        let dets = detect_locked(&c, &frame)?;
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "person");
        Ok(())
    }

    #[test]
    fn builtin_registry_selects_configured_backend() -> Result<()> {
        let settings = DetectorSettings::default();
        let registry = BackendRegistry::with_builtin(&settings)?;
        assert_eq!(registry.default_name(), Some("stub"));

        let bad = DetectorSettings {
            backend: "does-not-exist".to_string(),
            ..DetectorSettings::default()
        };
        assert!(BackendRegistry::with_builtin(&bad).is_err());
        Ok(())
    }
}
