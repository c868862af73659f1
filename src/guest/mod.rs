//! Guest standard library.
//!
//! A curated emulation of the Node.js built-ins, callable from inside the
//! sandbox. Each module contributes an *ops object* of host-implemented
//! functions; thin guest-side shims (see `js/`) shape those ops into the
//! Node-facing surfaces. Everything crossing the boundary is a primitive, a
//! byte buffer, or a structured clone; callbacks cross as saved function
//! references that fire on the guest's event loop.
//!
//! The registry is a static whitelist: requiring any name outside it fails
//! with a clear denial error raised by the guest-side resolver.

pub mod buffer;
pub mod console;
pub mod crypto;
pub mod dns;
pub mod fs;
pub mod http;
pub mod mime;
pub mod net;
pub mod path;
pub mod process;
pub mod timers;
pub mod url;
pub mod util;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rquickjs::{Ctx, Object};

use crate::sandbox::state::GuestCell;

/// Host-side half of one emulated module.
pub trait GuestModule: Send + Sync {
    /// Guest-visible module name (`"fs"`, `"timers/promises"`, ...).
    fn name(&self) -> &'static str;

    /// Build this module's ops object for one guest. Called once per
    /// invocation during bootstrap, before any user code runs.
    fn ops<'js>(&self, ctx: &Ctx<'js>, state: &GuestCell) -> rquickjs::Result<Object<'js>>;
}

/// Registry mapping guest module names to their host implementations.
pub struct ModuleRegistry {
    modules: HashMap<&'static str, Arc<dyn GuestModule>>,
}

impl ModuleRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Create a registry with every built-in module.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // Pure and near-pure modules
        registry.register(Arc::new(path::PathModule));
        registry.register(Arc::new(process::ProcessModule));
        registry.register(Arc::new(console::ConsoleModule));
        registry.register(Arc::new(util::UtilModule));
        registry.register(Arc::new(mime::MimeModule));
        registry.register(Arc::new(buffer::BufferModule));
        registry.register(Arc::new(crypto::CryptoModule));

        // Filesystem and timers
        registry.register(Arc::new(fs::FsModule));
        registry.register(Arc::new(timers::TimersModule));

        // CommonJS loader ops, surfaced to the bootstrap as `module`
        registry.register(Arc::new(crate::sandbox::require::ModuleLoaderModule));

        // Network stack
        registry.register(Arc::new(http::HttpModule::plain()));
        registry.register(Arc::new(http::HttpModule::secure()));
        registry.register(Arc::new(net::NetModule));
        registry.register(Arc::new(net::TlsModule));
        registry.register(Arc::new(dns::DnsModule));
        registry.register(Arc::new(url::UrlModule));
        registry.register(Arc::new(ws::WsModule));

        registry
    }

    /// Register a module.
    pub fn register(&mut self, module: Arc<dyn GuestModule>) {
        self.modules.insert(module.name(), module);
    }

    /// Check if a module contributes host ops.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.modules.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Build the `__hostops` object handed to the guest bootstrap: one ops
    /// object per registered module, keyed by module name.
    pub fn install_ops<'js>(
        &self,
        ctx: &Ctx<'js>,
        state: &GuestCell,
    ) -> rquickjs::Result<Object<'js>> {
        let all = Object::new(ctx.clone())?;
        for (name, module) in &self.modules {
            let ops = module.ops(ctx, state)?;
            all.set(*name, ops)?;
        }
        Ok(all)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Process-wide registry instance. Modules are stateless; per-guest state
/// rides in the [`GuestCell`] their ops close over.
pub static REGISTRY: Lazy<ModuleRegistry> = Lazy::new(ModuleRegistry::with_builtins);
