//! Profiles and their activation

use crate::cooldown::CooldownTable;
use crate::{TriggerError, TriggerResult};
use cm_core::{ContextData, QualifiedId, QualifiedIdError, SharedSettings, TriggerMapping};
use cm_template::TemplateEngine;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

fn default_enabled() -> bool {
    true
}

/// A configured trigger inside a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInstance {
    /// Unique within the profile
    pub id: String,
    pub plugin: String,
    pub trigger: String,
    #[serde(default)]
    pub config: Value,
    /// Action sequence run on activation; opaque to the trigger layer
    #[serde(default)]
    pub sequence: Value,
}

impl TriggerInstance {
    pub fn trigger_id(&self) -> Result<QualifiedId, QualifiedIdError> {
        QualifiedId::new(self.plugin.as_str(), self.trigger.as_str())
    }

    /// Whether this instance configures `trigger`
    pub fn is_for(&self, trigger: &QualifiedId) -> bool {
        self.plugin == trigger.plugin() && self.trigger == trigger.id()
    }
}

/// A named, activatable set of trigger instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Template evaluated against the settings; the profile is active while
    /// it is truthy. Absent means always active.
    #[serde(default)]
    pub activation: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerInstance>,
}

impl Profile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            enabled: true,
            activation: None,
            triggers: Vec::new(),
        }
    }

    pub fn with_activation(mut self, template: impl Into<String>) -> Self {
        self.activation = Some(template.into());
        self
    }

    pub fn with_trigger(mut self, instance: TriggerInstance) -> Self {
        self.triggers.push(instance);
        self
    }

    /// Instances of `trigger` in declaration order
    pub fn iter_triggers<'a>(
        &'a self,
        trigger: &'a QualifiedId,
    ) -> impl Iterator<Item = &'a TriggerInstance> + 'a {
        self.triggers.iter().filter(move |instance| instance.is_for(trigger))
    }

    pub fn mapping(&self, instance: &TriggerInstance) -> TriggerMapping {
        TriggerMapping::new(self.id.as_str(), instance.id.as_str())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// The partition of profiles at one point in time
#[derive(Debug, Default)]
pub struct ProfileSnapshot {
    pub active: Vec<Arc<Profile>>,
    pub inactive: Vec<Arc<Profile>>,
}

impl ProfileSnapshot {
    pub fn is_active(&self, profile_id: &str) -> bool {
        self.active.iter().any(|profile| profile.id == profile_id)
    }

    pub fn active_ids(&self) -> Vec<&str> {
        self.active.iter().map(|profile| profile.id.as_str()).collect()
    }

    fn same_partition(&self, other: &ProfileSnapshot) -> bool {
        fn ids(profiles: &[Arc<Profile>]) -> Vec<&str> {
            profiles.iter().map(|profile| profile.id.as_str()).collect()
        }
        ids(&self.active) == ids(&other.active) && ids(&self.inactive) == ids(&other.inactive)
    }
}

/// Listener called with `(active, inactive)` when the partition changes
pub type ProfilesChangedFn = Arc<dyn Fn(&[Arc<Profile>], &[Arc<Profile>]) + Send + Sync>;

/// Key profiles by id, rejecting duplicate profile ids and duplicate
/// instance ids within a profile
fn index_profiles(profiles: Vec<Profile>) -> TriggerResult<IndexMap<String, Arc<Profile>>> {
    let mut by_id = IndexMap::with_capacity(profiles.len());
    for profile in profiles {
        if by_id.contains_key(&profile.id) {
            return Err(TriggerError::DuplicateProfile(profile.id));
        }
        let mut seen = HashSet::with_capacity(profile.triggers.len());
        if let Some(duplicate) = profile
            .triggers
            .iter()
            .find(|instance| !seen.insert(instance.id.as_str()))
        {
            return Err(TriggerError::DuplicateTrigger(profile.mapping(duplicate)));
        }
        by_id.insert(profile.id.clone(), Arc::new(profile));
    }
    Ok(by_id)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds all profiles and publishes the active subset
///
/// The partition is published as one immutable [`ProfileSnapshot`]. A fire
/// takes the snapshot once, so it sees either the old or the new set, never
/// a mix.
pub struct ProfileManager {
    profiles: RwLock<IndexMap<String, Arc<Profile>>>,
    snapshot: RwLock<Arc<ProfileSnapshot>>,
    /// State the last recompute ran against
    state: Mutex<ContextData>,
    cooldowns: Arc<CooldownTable>,
    templates: Arc<TemplateEngine>,
    listeners: Mutex<Vec<ProfilesChangedFn>>,
    /// Serializes recomputes so listeners see partitions in order
    recompute: Mutex<()>,
}

impl ProfileManager {
    pub fn new(templates: Arc<TemplateEngine>) -> Self {
        Self {
            profiles: RwLock::new(IndexMap::new()),
            snapshot: RwLock::new(Arc::new(ProfileSnapshot::default())),
            state: Mutex::new(ContextData::new()),
            cooldowns: Arc::new(CooldownTable::new()),
            templates,
            listeners: Mutex::new(Vec::new()),
            recompute: Mutex::new(()),
        }
    }

    /// Register a listener for partition changes
    ///
    /// Listeners run synchronously and must not call back into the manager.
    pub fn on_profiles_changed<F>(&self, listener: F)
    where
        F: Fn(&[Arc<Profile>], &[Arc<Profile>]) + Send + Sync + 'static,
    {
        lock(&self.listeners).push(Arc::new(listener));
    }

    /// Replace all profiles and recompute against `state`
    ///
    /// Listeners are always notified, since profile contents changed. A
    /// rejected set leaves the current profiles in place.
    #[instrument(skip(self, profiles, state))]
    pub fn load(&self, profiles: Vec<Profile>, state: ContextData) -> TriggerResult<()> {
        let by_id = index_profiles(profiles)?;
        self.install(by_id, state);
        Ok(())
    }

    /// Replace all profiles and reset cooldowns
    ///
    /// Cooldowns survive a rejected set.
    pub fn reload(&self, profiles: Vec<Profile>, state: ContextData) -> TriggerResult<()> {
        let by_id = index_profiles(profiles)?;
        self.install(by_id, state);
        self.cooldowns.clear();
        Ok(())
    }

    fn install(&self, by_id: IndexMap<String, Arc<Profile>>, state: ContextData) {
        let count = by_id.len();
        *self
            .profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner) = by_id;
        info!(count = count, "Loaded profiles");

        self.publish(state, true);
    }

    /// Recompute the active set against new state
    ///
    /// Returns whether the partition changed.
    pub fn recompute(&self, state: ContextData) -> bool {
        self.publish(state, false)
    }

    fn publish(&self, state: ContextData, force_notify: bool) -> bool {
        let _serial = lock(&self.recompute);

        let profiles: Vec<Arc<Profile>> = self
            .profiles
            .read()
            .map(|profiles| profiles.values().cloned().collect())
            .unwrap_or_default();

        let mut next = ProfileSnapshot::default();
        for profile in profiles {
            if self.is_active(&profile, &state) {
                next.active.push(profile);
            } else {
                next.inactive.push(profile);
            }
        }

        let next = Arc::new(next);
        let changed = {
            let mut current = self
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let changed = !current.same_partition(&next);
            *current = next.clone();
            changed
        };
        *lock(&self.state) = state;

        if changed || force_notify {
            debug!(active = ?next.active_ids(), "Active profiles changed");
            let listeners = lock(&self.listeners).clone();
            for listener in listeners {
                listener(&next.active, &next.inactive);
            }
        }
        changed
    }

    fn is_active(&self, profile: &Profile, state: &ContextData) -> bool {
        if !profile.enabled {
            return false;
        }
        let Some(condition) = &profile.activation else {
            return true;
        };
        match self.templates.is_truthy(condition, state) {
            Ok(active) => active,
            Err(e) => {
                warn!(
                    profile_id = %profile.id,
                    error = %e,
                    "Activation condition failed, treating profile as inactive"
                );
                false
            }
        }
    }

    /// Current partition
    pub fn snapshot(&self) -> Arc<ProfileSnapshot> {
        self.snapshot
            .read()
            .map(|snapshot| snapshot.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// State the active set was last computed against
    pub fn state(&self) -> ContextData {
        lock(&self.state).clone()
    }

    /// Recompute whenever a setting changes
    pub fn watch_settings(self: &Arc<Self>, settings: SharedSettings) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut changes = settings.subscribe();
        manager.recompute(settings.snapshot());

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        debug!(key = %change.key, "Setting changed, recomputing profiles");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped = skipped, "Settings watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
                manager.recompute(settings.snapshot());
            }
        })
    }

    pub fn get(&self, profile_id: &str) -> Option<Arc<Profile>> {
        self.profiles
            .read()
            .ok()
            .and_then(|profiles| profiles.get(profile_id).cloned())
    }

    pub fn all(&self) -> Vec<Arc<Profile>> {
        self.profiles
            .read()
            .map(|profiles| profiles.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every instance of `trigger` across all profiles, active or not
    pub fn all_instances(&self, trigger: &QualifiedId) -> Vec<(TriggerMapping, TriggerInstance)> {
        self.all()
            .iter()
            .flat_map(|profile| {
                profile
                    .iter_triggers(trigger)
                    .map(|instance| (profile.mapping(instance), instance.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn cooldowns(&self) -> Arc<CooldownTable> {
        self.cooldowns.clone()
    }
}

/// Thread-safe wrapper for ProfileManager
pub type SharedProfileManager = Arc<ProfileManager>;
