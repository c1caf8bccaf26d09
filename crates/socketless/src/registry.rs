//! Capability registry: resolves `module:attr` locators to applications and reset hooks.
//!
//! Nothing is looked up reflectively. The worker binary registers module factories up
//! front; a locator on the command line only selects among them. A module is built at
//! most once per resolution, so an application and its reset hook close over the same
//! state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::app::Application;

/// Zero-argument callable that restores an application to its freshly built state.
pub type ResetHook = Arc<dyn Fn() + Send + Sync>;

/// `module:attr` reference to an exported application or hook.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    module: String,
    attr: String,
}

impl Locator {
    pub fn parse(s: &str) -> Result<Self, ImportError> {
        match s.split_once(':') {
            Some((module, attr)) if !module.is_empty() && !attr.is_empty() => Ok(Self {
                module: module.to_string(),
                attr: attr.to_string(),
            }),
            _ => Err(ImportError::InvalidLocator(s.to_string())),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.module, self.attr)
    }
}

impl std::str::FromStr for Locator {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("invalid import locator '{0}', expected module:attr")]
    InvalidLocator(String),
    #[error("no module named '{0}'")]
    ModuleNotFound(String),
    #[error("module '{module}' has no application '{attr}'")]
    AppNotFound { module: String, attr: String },
    #[error("module '{module}' has no reset hook '{attr}'")]
    HookNotFound { module: String, attr: String },
}

/// Exports of one module: named applications and named reset hooks.
#[derive(Default)]
pub struct Module {
    apps: HashMap<String, Application>,
    hooks: HashMap<String, ResetHook>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app(mut self, name: impl Into<String>, app: Application) -> Self {
        self.apps.insert(name.into(), app);
        self
    }

    pub fn reset_hook<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.insert(name.into(), Arc::new(hook));
        self
    }
}

type ModuleFactory = Box<dyn Fn() -> Module + Send + Sync>;

/// Set of modules a worker binary can host.
#[derive(Default)]
pub struct AppRegistry {
    modules: HashMap<String, ModuleFactory>,
}

/// What a worker resolved at startup.
pub struct Resolved {
    pub app: Application,
    pub reset_hook: Option<ResetHook>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Module + Send + Sync + 'static,
    {
        self.modules.insert(name.into(), Box::new(factory));
        self
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Build the modules referenced by `app` and `reset_hook` and pick out the exports.
    pub fn resolve(
        &self,
        app: &Locator,
        reset_hook: Option<&Locator>,
    ) -> Result<Resolved, ImportError> {
        let mut built: HashMap<&str, Module> = HashMap::new();

        let module = self.build(&mut built, app.module())?;
        let application = module
            .apps
            .get(app.attr())
            .cloned()
            .ok_or_else(|| ImportError::AppNotFound {
                module: app.module().to_string(),
                attr: app.attr().to_string(),
            })?;

        let reset_hook = match reset_hook {
            Some(locator) => {
                let module = self.build(&mut built, locator.module())?;
                let hook = module.hooks.get(locator.attr()).cloned().ok_or_else(|| {
                    ImportError::HookNotFound {
                        module: locator.module().to_string(),
                        attr: locator.attr().to_string(),
                    }
                })?;
                Some(hook)
            }
            None => None,
        };

        Ok(Resolved {
            app: application,
            reset_hook,
        })
    }

    fn build<'a, 'b>(
        &self,
        built: &'b mut HashMap<&'a str, Module>,
        name: &'a str,
    ) -> Result<&'b Module, ImportError> {
        if !built.contains_key(name) {
            let factory = self
                .modules
                .get(name)
                .ok_or_else(|| ImportError::ModuleNotFound(name.to_string()))?;
            tracing::debug!(module = name, "Building module");
            built.insert(name, factory());
        }
        built
            .get(name)
            .ok_or_else(|| ImportError::ModuleNotFound(name.to_string()))
    }
}
