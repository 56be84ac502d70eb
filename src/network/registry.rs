use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{NetLayer, NetLayerKind};

/// Instantiated layers, at most one per kind
///
/// Construction is done by the owner (see `TorContext::net_layer`); the
/// registry only stores the first instance registered for each kind.
#[derive(Default)]
pub struct NetLayerRegistry {
    layers: Mutex<HashMap<NetLayerKind, Arc<dyn NetLayer>>>,
}

impl NetLayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: NetLayerKind) -> Option<Arc<dyn NetLayer>> {
        self.layers.lock().ok()?.get(&kind).cloned()
    }

    /// Replace whatever is registered for `kind`
    pub fn register(&self, kind: NetLayerKind, layer: Arc<dyn NetLayer>) {
        if let Ok(mut layers) = self.layers.lock() {
            layers.insert(kind, layer);
        }
    }

    /// Keep an existing instance if another caller got there first
    pub fn insert_if_absent(
        &self,
        kind: NetLayerKind,
        layer: Arc<dyn NetLayer>,
    ) -> Arc<dyn NetLayer> {
        match self.layers.lock() {
            Ok(mut layers) => layers.entry(kind).or_insert(layer).clone(),
            Err(_) => layer,
        }
    }

    pub fn kinds(&self) -> Vec<NetLayerKind> {
        self.layers
            .lock()
            .map(|layers| layers.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Clear every instantiated layer and forget them
    pub async fn clear_all(&self) {
        let layers: Vec<_> = match self.layers.lock() {
            Ok(mut layers) => layers.drain().map(|(_, layer)| layer).collect(),
            Err(_) => Vec::new(),
        };
        for layer in layers {
            log::debug!("clearing {} layer", layer.kind());
            layer.clear().await;
        }
    }
}
