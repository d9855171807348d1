use daycare_core::{DaycareError, Result};
use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::schema::DaycareConfig;

/// Loads and optionally hot-reloads the Daycare configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<DaycareConfig>>,
    config_path: PathBuf,
    /// Held shared by readers that must not observe a reload half-way.
    reload_lock: Arc<tokio::sync::RwLock<()>>,
    /// Bumped after every successful reload.
    version: Arc<watch::Sender<u64>>,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > DAYCARE_CONFIG env > ~/.daycare/daycare.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("DAYCARE_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".daycare")
            .join("daycare.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            DaycareConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        // Validate config: log warnings, fail on errors
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(DaycareError::Config(e));
            }
        }

        Ok(Self::from_config(config, config_path))
    }

    /// Wrap an already-built config (embedding, tests).
    pub fn from_config(config: DaycareConfig, config_path: PathBuf) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            reload_lock: Arc::new(tokio::sync::RwLock::new(())),
            version: Arc::new(version),
        }
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> DaycareConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<DaycareConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// The lock reloads take exclusively. Hand it to components that must run
    /// against a stable configuration (the model router).
    pub fn reload_lock(&self) -> Arc<tokio::sync::RwLock<()>> {
        Arc::clone(&self.reload_lock)
    }

    /// Run `fut` while holding the reload lock in shared mode.
    pub async fn in_read_lock<F: Future>(&self, fut: F) -> F::Output {
        let _guard = self.reload_lock.read().await;
        fut.await
    }

    /// Receiver that changes whenever a reload lands.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn read_file(path: &Path) -> Result<DaycareConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<DaycareConfig>(&raw).map_err(|e| {
            DaycareError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply env var overrides (DAYCARE_LOG_LEVEL, DAYCARE_HISTORY_PATH, etc.)
    fn apply_env_overrides(mut config: DaycareConfig) -> DaycareConfig {
        if let Ok(v) = std::env::var("DAYCARE_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("DAYCARE_HISTORY_PATH") {
            config.history.path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("DAYCARE_WORKER_COMMAND") {
            config.rlm.worker_command = v;
        }
        if let Ok(v) = std::env::var("DAYCARE_MAX_ITERATIONS") {
            if let Ok(n) = v.parse::<usize>() {
                config.agent.max_iterations = n;
            }
        }
        config
    }

    fn store(config: &RwLock<DaycareConfig>, version: &watch::Sender<u64>, new_config: DaycareConfig) {
        *config.write() = new_config;
        version.send_modify(|v| *v += 1);
    }

    /// Reload the config from disk. Waits for in-flight readers to finish first.
    pub async fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(DaycareError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::read_file(&self.config_path)?);
        if let Err(e) = new_config.validate() {
            return Err(DaycareError::Config(e));
        }
        let _guard = self.reload_lock.write().await;
        Self::store(&self.config, &self.version, new_config);
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads when the config file changes.
    /// Returns a handle to the watcher (must be kept alive for watching to continue).
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let reload_lock = Arc::clone(&self.reload_lock);
        let version = Arc::clone(&self.version);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_event.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    match ConfigLoader::read_file(&path_for_event) {
                        Ok(new_config) => {
                            let new_config = ConfigLoader::apply_env_overrides(new_config);
                            if let Err(e) = new_config.validate() {
                                warn!(error = %e, "config file has errors, keeping current config");
                                return;
                            }
                            // notify delivers events on its own thread, outside the runtime.
                            let _guard = reload_lock.blocking_write();
                            ConfigLoader::store(&config, &version, new_config);
                            info!("configuration hot-reloaded successfully");
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            },
        )
        .map_err(|e| DaycareError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| DaycareError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
