//! The runtime: registries wired together, profiles loaded, satellite link up

use crate::sequence::SequenceRunner;
use anyhow::{anyhow, Context as _, Result};
use cm_actions::{register_core_actions, ActionRegistry};
use cm_config::{load_yaml_dir, RuntimeConfig, RuntimeMode};
use cm_core::{QualifiedId, SettingsStore, SharedSettings};
use cm_resources::{LoadReport, Resource, ResourceRegistry, ResourceStorage, SharedResourceRegistry};
use cm_satellite::{connect_stream, serve_stream, RpcTable, SatelliteClient, SatelliteHost};
use cm_schema::ConfigResolver;
use cm_template::TemplateEngine;
use cm_triggers::{
    register_core_triggers, Profile, ProfileManager, SharedProfileManager, TriggerHandle,
    TriggerRegistry,
};
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running automation runtime
pub struct Runtime {
    config: RuntimeConfig,
    settings: SharedSettings,
    actions: ActionRegistry,
    triggers: TriggerRegistry,
    resources: SharedResourceRegistry,
    sequences: SequenceRunner,
    /// Serves resource RPC to a satellite; unused in satellite mode
    host: Arc<SatelliteHost>,
    /// Link to the primary, in satellite mode
    satellite: Option<Arc<SatelliteClient>>,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Wire up the registries and register the `core` plugin
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let templates = Arc::new(TemplateEngine::new());
        let resolver = Arc::new(ConfigResolver::new(templates.clone()));
        let settings: SharedSettings = Arc::new(SettingsStore::from_map(config.settings.clone()));
        let resources: SharedResourceRegistry = Arc::new(ResourceRegistry::new());

        let actions = ActionRegistry::new(resolver.clone(), settings.clone())
            .with_resources(resources.clone());
        register_core_actions(&actions).context("registering core actions")?;

        let sequences = SequenceRunner::new(actions.clone());
        let profiles: SharedProfileManager = Arc::new(ProfileManager::new(templates));
        let watcher = profiles.watch_settings(settings.clone());

        let triggers = TriggerRegistry::new(
            resolver,
            settings.clone(),
            profiles,
            Arc::new(sequences.clone()),
        )
        .with_resources(resources.clone());
        register_core_triggers(&triggers).context("registering core triggers")?;

        info!(
            mode = ?config.mode,
            data_dir = ?config.data_dir,
            actions = actions.action_count(),
            triggers = triggers.trigger_count(),
            "Runtime initialized"
        );

        Ok(Self {
            config,
            settings,
            actions,
            triggers,
            resources,
            sequences,
            host: Arc::new(SatelliteHost::new()),
            satellite: None,
            child: None,
            tasks: vec![watcher],
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn triggers(&self) -> &TriggerRegistry {
        &self.triggers
    }

    pub fn profiles(&self) -> &SharedProfileManager {
        self.triggers.profiles()
    }

    pub fn resources(&self) -> &SharedResourceRegistry {
        &self.resources
    }

    pub fn sequences(&self) -> &SequenceRunner {
        &self.sequences
    }

    pub fn satellite_host(&self) -> &Arc<SatelliteHost> {
        &self.host
    }

    /// Client for the primary's resources, once connected in satellite mode
    pub fn satellite_client(&self) -> Option<&Arc<SatelliteClient>> {
        self.satellite.as_ref()
    }

    /// Fire handle for a defined trigger
    pub fn trigger(&self, id: &QualifiedId) -> Option<TriggerHandle> {
        self.triggers.handle(id)
    }

    /// Load every profile under `<data_dir>/profiles`, replacing the current set
    ///
    /// A missing directory means no profiles.
    pub fn load_profiles(&self) -> Result<usize> {
        let dir = self.config.profiles_dir();
        let profiles: Vec<Profile> = if dir.is_dir() {
            load_yaml_dir(&dir).with_context(|| format!("loading profiles from {}", dir.display()))?
        } else {
            info!(dir = ?dir, "No profiles directory");
            Vec::new()
        };

        let count = profiles.len();
        self.profiles()
            .reload(profiles, self.settings.snapshot())
            .context("activating profiles")?;
        Ok(count)
    }

    /// Register a resource kind, load its persisted resources and serve its
    /// methods to satellites
    ///
    /// Resources are stored under `<data_dir>/resources/<KIND>`. Resources
    /// that fail to load are reported, not fatal.
    pub async fn expose_resources<R: Resource>(&self, rpc: RpcTable<R>) -> Result<Arc<ResourceStorage<R>>> {
        let storage = Arc::new(ResourceStorage::<R>::file_backed(
            self.config.resources_dir(R::KIND),
        ));
        self.resources
            .register(storage.clone())
            .with_context(|| format!("registering {} resources", R::KIND))?;
        self.host
            .define_slot_handler(storage.clone(), rpc)
            .with_context(|| format!("serving {} resources", R::KIND))?;

        let report: LoadReport = storage.load_all().await?;
        for failure in &report.failed {
            warn!(kind = R::KIND, id = %failure.id, error = %failure.source, "Resource failed to load");
        }
        Ok(storage)
    }

    /// Bring up the satellite link for the configured mode
    ///
    /// A primary with a `satellite` entry spawns it and serves resource RPC
    /// over its stdio. A satellite connects to its primary over its own
    /// stdin/stdout.
    pub fn start_satellite(&mut self) -> Result<()> {
        match self.config.mode {
            RuntimeMode::Primary => {
                if let Some(satellite) = self.config.satellite.clone() {
                    self.spawn_satellite(&satellite.command, &satellite.args)?;
                }
            }
            RuntimeMode::Satellite => {
                let (client, reader) = connect_stream(tokio::io::stdin(), tokio::io::stdout());
                info!("Connected to primary over stdio");
                self.satellite = Some(client);
                self.tasks.push(reader);
            }
        }
        Ok(())
    }

    fn spawn_satellite(&mut self, command: &str, args: &[String]) -> Result<()> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning satellite {}", command))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to capture satellite stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture satellite stdout"))?;

        info!(command = %command, pid = ?child.id(), "Spawned satellite");
        let host = self.host.clone();
        self.tasks.push(tokio::spawn(async move {
            match serve_stream(host, stdout, stdin).await {
                Ok(()) => info!("Satellite disconnected"),
                Err(e) => warn!(error = %e, "Satellite link failed"),
            }
        }));
        self.child = Some(child);
        Ok(())
    }

    /// Run until `shutdown` resolves, then stop
    pub async fn run_until<F: Future<Output = ()>>(mut self, shutdown: F) -> Result<()> {
        info!("Runtime is running");
        shutdown.await;
        self.shutdown().await;
        Ok(())
    }

    /// Abort running sequences, stop background tasks and the satellite
    pub async fn shutdown(&mut self) {
        info!("Shutting down");
        let aborted = self.sequences.abort_all();
        debug!(aborted = aborted, "Aborted running sequences");

        if let Some(client) = self.satellite.take() {
            client.fail_all();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to stop satellite");
            }
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_core::CORE_PLUGIN;
    use std::fs;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> RuntimeConfig {
        RuntimeConfig {
            data_dir: dir.path().to_path_buf(),
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_registers_core_plugin() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(config(&dir)).unwrap();

        assert_eq!(runtime.actions().plugin_actions(CORE_PLUGIN).len(), 2);
        assert!(runtime
            .trigger(&QualifiedId::new(CORE_PLUGIN, "command").unwrap())
            .is_some());
        assert!(runtime.satellite_client().is_none());
    }

    #[tokio::test]
    async fn test_missing_profiles_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::new(config(&dir)).unwrap();

        assert_eq!(runtime.load_profiles().unwrap(), 0);
        assert_eq!(runtime.profiles().profile_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_profile_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let profiles = dir.path().join("profiles");
        fs::create_dir_all(&profiles).unwrap();
        fs::write(profiles.join("a.yaml"), "id: stream\n").unwrap();
        fs::write(profiles.join("b.yaml"), "id: stream\n").unwrap();

        let runtime = Runtime::new(config(&dir)).unwrap();
        assert!(runtime.load_profiles().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut runtime = Runtime::new(config(&dir)).unwrap();
        runtime.start_satellite().unwrap();

        runtime.shutdown().await;
        runtime.shutdown().await;
        assert_eq!(runtime.sequences().running_count(), 0);
    }
}
