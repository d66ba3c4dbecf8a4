//! Test doubles shared by unit and scenario tests

use crate::manager::{ResourceEvent, ResourceWatcher};
use crate::providers::{MetricsSourceProvider, ProviderHandler};
use crate::resource::ResourceKind;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Provider handler recording every call
#[derive(Default)]
pub struct RecordingProviders {
    added: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    live: Mutex<BTreeMap<String, Arc<dyn MetricsSourceProvider>>>,
}

impl RecordingProviders {
    pub fn added(&self) -> Vec<String> {
        self.added.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Names of providers currently added, sorted
    pub fn live(&self) -> Vec<String> {
        self.live.lock().unwrap().keys().cloned().collect()
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn MetricsSourceProvider>> {
        self.live.lock().unwrap().get(name).cloned()
    }
}

impl ProviderHandler for RecordingProviders {
    fn add_provider(&self, provider: Arc<dyn MetricsSourceProvider>) {
        self.added.lock().unwrap().push(provider.name().to_string());
        self.live
            .lock()
            .unwrap()
            .insert(provider.name().to_string(), provider);
    }

    fn delete_provider(&self, name: &str) {
        self.deleted.lock().unwrap().push(name.to_string());
        self.live.lock().unwrap().remove(name);
    }
}

/// Watcher replaying a fixed list of events, then idling until shutdown
pub struct StaticWatcher {
    kind: ResourceKind,
    events: Vec<ResourceEvent>,
}

impl StaticWatcher {
    pub fn new(kind: ResourceKind, events: Vec<ResourceEvent>) -> Self {
        Self { kind, events }
    }
}

#[async_trait]
impl ResourceWatcher for StaticWatcher {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn watch(
        &self,
        events: mpsc::Sender<ResourceEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        for event in self.events.clone() {
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
        let _ = shutdown.recv().await;
        Ok(())
    }
}

/// Poll `condition` for up to a second
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
