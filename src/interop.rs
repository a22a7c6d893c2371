//! Wiring of the layouts, bridge and injector for one runtime

use std::sync::Arc;

use tracing::info;

use crate::config::InteropConfig;
use crate::error::{InteropError, Result};
use crate::il2cpp::{Il2CppApi, Il2CppBridge, IcallTable};
use crate::injector::managed::ManagedType;
use crate::injector::{ClassInjector, Detour, HookTargets, RegisterOptions};
use crate::layout::LayoutRegistry;
use crate::memory::NativeHandle;
use crate::version::{detect_unity_version, UnityVersion};

/// Everything needed to talk to one running IL2CPP runtime
pub struct Interop {
    config: InteropConfig,
    layouts: Arc<LayoutRegistry>,
    bridge: Arc<Il2CppBridge>,
    injector: ClassInjector,
}

impl std::fmt::Debug for Interop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interop").field("version", &self.layouts.version()).field("injector", &self.injector).finish()
    }
}

impl Interop {
    /// Load the configured game library and select layouts for its version
    #[cfg(feature = "exports")]
    pub fn new(config: InteropConfig) -> Result<Self> {
        let version = Self::resolve_version(&config)?;
        let api = Arc::new(crate::il2cpp::ExportTable::load(&config.game_assembly)?);
        Self::with_api(config, api, version)
    }

    /// Wire an already bound runtime
    pub fn with_api(config: InteropConfig, api: Arc<dyn Il2CppApi>, version: UnityVersion) -> Result<Self> {
        let layouts = Arc::new(LayoutRegistry::new(version)?);
        let icalls = match &config.icall_table {
            Some(path) => IcallTable::from_file(path)?,
            None => IcallTable::builtin(),
        };
        let bridge = Arc::new(Il2CppBridge::with_icalls(api, layouts.clone(), icalls, &config.icall_module));
        let images = bridge.load_images();
        info!("il2cpp interop ready for unity {} with {} images", version, images);
        let injector = ClassInjector::new(bridge.clone());
        Ok(Interop { config, layouts, bridge, injector })
    }

    /// Version from the configuration, else from the host executable
    pub fn resolve_version(config: &InteropConfig) -> Result<UnityVersion> {
        match config.version()? {
            Some(version) => Ok(version),
            None => detect_unity_version().ok_or(InteropError::VersionUnknown),
        }
    }

    pub fn config(&self) -> &InteropConfig {
        &self.config
    }

    pub fn layouts(&self) -> &Arc<LayoutRegistry> {
        &self.layouts
    }

    pub fn bridge(&self) -> &Arc<Il2CppBridge> {
        &self.bridge
    }

    pub fn injector(&self) -> &ClassInjector {
        &self.injector
    }

    /// See [`ClassInjector::install_hooks`]
    ///
    /// # Safety
    /// `targets` must be the addresses of the intercepted runtime functions.
    pub unsafe fn install_hooks(&self, detour: &dyn Detour, targets: HookTargets) -> Result<()> {
        self.injector.install_hooks(detour, targets)
    }

    /// Register `ty` with the configured logging
    pub fn register(&self, ty: &Arc<ManagedType>) -> Result<NativeHandle> {
        let options = RegisterOptions { log_success: self.config.log_registrations, ..RegisterOptions::default() };
        self.injector.register(ty, &options)
    }
}
