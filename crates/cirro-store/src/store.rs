use std::sync::Arc;

use cirro_domain::{ComponentName, DatacenterName, EnvironmentName};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::StoreError;
use crate::state::{ComponentState, DatacenterState, EnvironmentRef, EnvironmentState};

/// Canonical key layout for persisted entities.
pub mod keys {
    use cirro_domain::{ComponentName, DatacenterName, EnvironmentName};

    pub fn datacenter(dc: &DatacenterName) -> String {
        format!("datacenters/{}/datacenter.state.json", dc)
    }

    pub fn environments_prefix(dc: &DatacenterName) -> String {
        format!("datacenters/{}/environments/", dc)
    }

    pub fn environment(dc: &DatacenterName, env: &EnvironmentName) -> String {
        format!(
            "datacenters/{}/environments/{}/environment.state.json",
            dc, env
        )
    }

    pub fn components_prefix(dc: &DatacenterName, env: &EnvironmentName) -> String {
        format!("datacenters/{}/environments/{}/components/", dc, env)
    }

    pub fn component(
        dc: &DatacenterName,
        env: &EnvironmentName,
        comp: &ComponentName,
    ) -> String {
        format!(
            "datacenters/{}/environments/{}/components/{}/component.state.json",
            dc, env, comp
        )
    }
}

/// Typed facade over a raw [`Backend`].
///
/// Each entity is read and written whole; atomicity per key is the backend's
/// responsibility. There are no cross-key transactions — the executor's
/// write ordering provides the consistency the engine needs.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn Backend>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Raw backend access for migration tooling. Normal code paths never use
    /// this.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    // ── Datacenter ────────────────────────────────────────────────────────────

    pub async fn get_datacenter(
        &self,
        dc: &DatacenterName,
    ) -> Result<Option<DatacenterState>, StoreError> {
        self.get(&keys::datacenter(dc)).await
    }

    pub async fn save_datacenter(&self, state: &DatacenterState) -> Result<(), StoreError> {
        self.put(&keys::datacenter(&state.name), state).await
    }

    pub async fn delete_datacenter(&self, dc: &DatacenterName) -> Result<(), StoreError> {
        self.backend.delete(&keys::datacenter(dc)).await
    }

    // ── Environment ───────────────────────────────────────────────────────────

    pub async fn get_environment(
        &self,
        dc: &DatacenterName,
        env: &EnvironmentName,
    ) -> Result<Option<EnvironmentState>, StoreError> {
        self.get(&keys::environment(dc, env)).await
    }

    pub async fn save_environment(&self, state: &EnvironmentState) -> Result<(), StoreError> {
        self.put(&keys::environment(&state.datacenter, &state.name), state)
            .await
    }

    pub async fn delete_environment(
        &self,
        dc: &DatacenterName,
        env: &EnvironmentName,
    ) -> Result<(), StoreError> {
        self.backend.delete(&keys::environment(dc, env)).await
    }

    /// List environment references under a datacenter from key layout alone,
    /// without reading each entity.
    pub async fn list_environments(
        &self,
        dc: &DatacenterName,
    ) -> Result<Vec<EnvironmentRef>, StoreError> {
        let prefix = keys::environments_prefix(dc);
        let mut refs = Vec::new();
        for key in self.backend.list(&prefix).await? {
            let rest = &key[prefix.len()..];
            let mut segments = rest.split('/');
            if let (Some(env), Some("environment.state.json")) =
                (segments.next(), segments.next())
            {
                if segments.next().is_none() {
                    refs.push(EnvironmentRef {
                        datacenter: dc.clone(),
                        name: EnvironmentName::new(env),
                    });
                }
            }
        }
        Ok(refs)
    }

    // ── Component ─────────────────────────────────────────────────────────────

    pub async fn get_component(
        &self,
        dc: &DatacenterName,
        env: &EnvironmentName,
        comp: &ComponentName,
    ) -> Result<Option<ComponentState>, StoreError> {
        self.get(&keys::component(dc, env, comp)).await
    }

    pub async fn save_component(&self, state: &ComponentState) -> Result<(), StoreError> {
        self.put(
            &keys::component(&state.datacenter, &state.environment, &state.name),
            state,
        )
        .await
    }

    pub async fn delete_component(
        &self,
        dc: &DatacenterName,
        env: &EnvironmentName,
        comp: &ComponentName,
    ) -> Result<(), StoreError> {
        self.backend.delete(&keys::component(dc, env, comp)).await
    }

    /// List component names under an environment from key layout alone.
    pub async fn list_components(
        &self,
        dc: &DatacenterName,
        env: &EnvironmentName,
    ) -> Result<Vec<ComponentName>, StoreError> {
        let prefix = keys::components_prefix(dc, env);
        let mut names = Vec::new();
        for key in self.backend.list(&prefix).await? {
            let rest = &key[prefix.len()..];
            let mut segments = rest.split('/');
            if let (Some(comp), Some("component.state.json")) =
                (segments.next(), segments.next())
            {
                if segments.next().is_none() {
                    names.push(ComponentName::new(comp));
                }
            }
        }
        Ok(names)
    }

    // ── Migration ─────────────────────────────────────────────────────────────

    /// Rekey every entity under `old_prefix` through `rekey`, deleting each
    /// source only after its copy is written. A `None` from `rekey` leaves the
    /// entity in place. Idempotent: re-running after a partial failure
    /// re-copies and re-deletes without data loss.
    pub async fn migrate<F>(&self, old_prefix: &str, rekey: F) -> Result<usize, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut moved = 0;
        for key in self.backend.list(old_prefix).await? {
            let Some(new_key) = rekey(&key) else {
                continue;
            };
            if new_key == key {
                continue;
            }
            let Some(bytes) = self.backend.read(&key).await? else {
                continue;
            };
            self.backend.write(&new_key, &bytes).await?;
            self.backend.delete(&key).await?;
            debug!(from = %key, to = %new_key, "migrated state entity");
            moved += 1;
        }
        if moved > 0 {
            info!(moved, old_prefix, "state migration complete");
        }
        Ok(moved)
    }

    // ── Raw JSON plumbing ─────────────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.read(key).await? {
            Some(bytes) => {
                let entity = serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode {
                    key: key.to_string(),
                    source: e,
                })?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    async fn put<T: Serialize>(&self, key: &str, entity: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(entity)?;
        self.backend.write(key, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::state::{DatacenterState, EnvironmentState};

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryBackend::new()))
    }

    fn dc(name: &str) -> DatacenterName {
        DatacenterName::new(name)
    }

    fn env(name: &str) -> EnvironmentName {
        EnvironmentName::new(name)
    }

    #[tokio::test]
    async fn datacenter_round_trip() {
        let store = store();
        let state = DatacenterState::new(dc("dc1"));
        store.save_datacenter(&state).await.unwrap();

        let got = store.get_datacenter(&dc("dc1")).await.unwrap().unwrap();
        assert_eq!(got, state);
        assert!(store.get_datacenter(&dc("other")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn environment_round_trip_and_listing() {
        let store = store();
        store
            .save_environment(&EnvironmentState::new(dc("dc1"), env("prod")))
            .await
            .unwrap();
        store
            .save_environment(&EnvironmentState::new(dc("dc1"), env("dev")))
            .await
            .unwrap();
        store
            .save_environment(&EnvironmentState::new(dc("dc2"), env("prod")))
            .await
            .unwrap();

        let mut names: Vec<String> = store
            .list_environments(&dc("dc1"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name.0)
            .collect();
        names.sort();
        assert_eq!(names, vec!["dev", "prod"]);
    }

    #[tokio::test]
    async fn component_round_trip_and_listing() {
        let store = store();
        let mut state = ComponentState::new(dc("dc1"), env("prod"), ComponentName::new("api"));
        state.source = Some("v1".into());
        store.save_component(&state).await.unwrap();

        let got = store
            .get_component(&dc("dc1"), &env("prod"), &ComponentName::new("api"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, state);

        let listed = store.list_components(&dc("dc1"), &env("prod")).await.unwrap();
        assert_eq!(listed, vec![ComponentName::new("api")]);

        store
            .delete_component(&dc("dc1"), &env("prod"), &ComponentName::new("api"))
            .await
            .unwrap();
        assert!(store
            .list_components(&dc("dc1"), &env("prod"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn migrate_rekeys_and_deletes_source() {
        let store = store();
        let backend = store.backend().clone();
        backend.write("flat/dc1.json", b"{}").await.unwrap();
        backend.write("flat/dc2.json", b"{}").await.unwrap();

        let moved = store
            .migrate("flat/", |key| {
                let name = key.strip_prefix("flat/")?.strip_suffix(".json")?;
                Some(format!("datacenters/{}/datacenter.state.json", name))
            })
            .await
            .unwrap();
        assert_eq!(moved, 2);

        assert!(backend.read("flat/dc1.json").await.unwrap().is_none());
        assert!(backend
            .read("datacenters/dc1/datacenter.state.json")
            .await
            .unwrap()
            .is_some());

        // Idempotent: nothing left under the old prefix.
        let moved_again = store.migrate("flat/", |k| Some(k.to_string())).await.unwrap();
        assert_eq!(moved_again, 0);
    }
}
