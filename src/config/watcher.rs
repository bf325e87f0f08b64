//! Configuration file watcher for live credential reload.
//!
//! Only `auth.users` is applied live, and only additively: users that appear
//! in the reloaded file are appended to the running [`AuthorizationGate`].
//! Removing a user from the file does not revoke it until restart.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::{AuthorizationGate, BasicAuthValidator};
use crate::config::loader::load_config;
use crate::config::schema::{ProxyConfig, UserCredentials};

/// Watches the configuration file and widens the authorization gate.
pub struct ConfigWatcher {
    path: PathBuf,
    gate: Arc<AuthorizationGate>,
    known_users: Arc<Mutex<HashSet<UserCredentials>>>,
    baseline: Arc<ProxyConfig>,
}

impl ConfigWatcher {
    /// Create a watcher seeded with the users of the config already in effect.
    ///
    /// `current` is the config as loaded from `path`, before any command-line
    /// overrides, so reloads are compared against what the file said.
    pub fn new(path: &Path, gate: Arc<AuthorizationGate>, current: &ProxyConfig) -> Self {
        let known_users = current.auth.users.iter().cloned().collect();
        Self {
            path: path.to_path_buf(),
            gate,
            known_users: Arc::new(Mutex::new(known_users)),
            baseline: Arc::new(current.clone()),
        }
    }

    /// Apply the credentials of a freshly loaded config. Returns how many
    /// validators were added.
    pub fn apply(&self, config: &ProxyConfig) -> usize {
        apply_new_users(&self.gate, &self.known_users, config)
    }

    /// Whether `reloaded` changes settings that only apply on restart.
    pub fn requires_restart(&self, reloaded: &ProxyConfig) -> bool {
        restart_required(&self.baseline, reloaded)
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let gate = Arc::clone(&self.gate);
        let known_users = Arc::clone(&self.known_users);
        let baseline = Arc::clone(&self.baseline);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        match load_config(&path) {
                            Ok(new_config) => {
                                if restart_required(&baseline, &new_config) {
                                    tracing::warn!("Config changes outside auth.users take effect on restart");
                                }
                                let added = apply_new_users(&gate, &known_users, &new_config);
                                tracing::info!(added, "Config reloaded");
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to reload config, keeping current credentials");
                            }
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Whether anything other than `auth.users` differs from the config in effect.
fn restart_required(current: &ProxyConfig, reloaded: &ProxyConfig) -> bool {
    let without_users = |config: &ProxyConfig| {
        let mut config = config.clone();
        config.auth.users.clear();
        toml::to_string(&config).ok()
    };
    without_users(current) != without_users(reloaded)
}

fn apply_new_users(
    gate: &AuthorizationGate,
    known_users: &Mutex<HashSet<UserCredentials>>,
    config: &ProxyConfig,
) -> usize {
    let mut known = match known_users.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut added = 0;
    for user in &config.auth.users {
        if known.insert(user.clone()) {
            gate.add_handler(Arc::new(BasicAuthValidator::new(&user.username, &user.password)));
            tracing::info!(username = %user.username, "Added proxy credentials");
            added += 1;
        }
    }
    added
}
