//! Backend descriptors
//!
//! A host discovers backends through [`AudioBackendInfo`]: instantiate one
//! with a client name, then ask it for the backend and its port engine. Both
//! factories hand out the same shared instance until `deinstantiate`.

use std::sync::{Arc, Mutex};

use crate::backend::AudioBackend;
use crate::config::BackendConfig;
use crate::error::BackendResult;
use crate::port_engine::PortEngine;
use crate::server::AudioServer;
use crate::sync::lock;

pub trait AudioBackendInfo: Send + Sync {
    fn name(&self) -> &str;

    /// Create the backend instance; a no-op if one exists
    fn instantiate(&self, client_name: &str, session_id: Option<&str>) -> BackendResult<()>;

    /// Stop and drop the instance
    fn deinstantiate(&self) -> BackendResult<()>;

    fn backend_factory(&self) -> Option<Arc<AudioBackend>>;

    fn portengine_factory(&self) -> Option<Arc<PortEngine>>;

    /// True if a server is already running, so parameters are not ours to set
    fn already_configured(&self) -> bool;
}

/// Descriptor for one server implementation
pub struct BackendDescriptor {
    name: String,
    server: Arc<dyn AudioServer>,
    config: BackendConfig,
    instance: Mutex<Option<Arc<AudioBackend>>>,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>, server: Arc<dyn AudioServer>) -> Self {
        Self {
            name: name.into(),
            server,
            config: BackendConfig::default(),
            instance: Mutex::new(None),
        }
    }

    /// Targets used for every instance; client name and session are
    /// replaced by the `instantiate` arguments
    pub fn with_config(mut self, config: BackendConfig) -> Self {
        self.config = config;
        self
    }
}

impl AudioBackendInfo for BackendDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self, client_name: &str, session_id: Option<&str>) -> BackendResult<()> {
        let mut instance = lock(&self.instance);
        if instance.is_some() {
            return Ok(());
        }
        let mut config = self.config.clone().with_client_name(client_name);
        config.session_id = session_id.map(str::to_string);
        *instance = Some(AudioBackend::new(self.server.clone(), config)?);
        log::info!("[REGISTRY] {} backend instantiated as '{}'", self.name, client_name);
        Ok(())
    }

    fn deinstantiate(&self) -> BackendResult<()> {
        let Some(backend) = lock(&self.instance).take() else {
            return Ok(());
        };
        backend.stop()?;
        log::info!("[REGISTRY] {} backend released", self.name);
        Ok(())
    }

    fn backend_factory(&self) -> Option<Arc<AudioBackend>> {
        lock(&self.instance).clone()
    }

    fn portengine_factory(&self) -> Option<Arc<PortEngine>> {
        lock(&self.instance)
            .as_ref()
            .map(|backend| backend.port_engine().clone())
    }

    fn already_configured(&self) -> bool {
        self.server.is_running()
    }
}

/// Process-wide JACK descriptor
#[cfg(all(target_os = "linux", feature = "jack-backend"))]
pub fn global() -> &'static BackendDescriptor {
    use std::sync::OnceLock;

    use crate::server::jack::JackServer;

    static JACK: OnceLock<BackendDescriptor> = OnceLock::new();
    JACK.get_or_init(|| BackendDescriptor::new("JACK", Arc::new(JackServer::new())))
}
