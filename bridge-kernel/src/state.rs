use crate::models::LiveData;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Live State Store : snapshot canonique des données BMS.
/// Un seul écrivain (ingest), remplacement complet à chaque cycle ; les lecteurs
/// récupèrent un `Arc` et ne voient jamais un LiveData à moitié mis à jour.
pub struct LiveStore {
    current: RwLock<Arc<LiveData>>,
    revisions: AtomicU64,
}

impl LiveStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(LiveData::default())),
            revisions: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Arc<LiveData> {
        self.current.read().clone()
    }

    pub fn replace(&self, data: LiveData) -> Arc<LiveData> {
        let data = Arc::new(data);
        *self.current.write() = data.clone();
        self.revisions.fetch_add(1, Ordering::Relaxed);
        data
    }

    /// Nombre de remplacements depuis le démarrage
    pub fn revisions(&self) -> u64 {
        self.revisions.load(Ordering::Relaxed)
    }

    /// Vrai dès qu'un cycle d'ingest a produit des données
    pub fn has_data(&self) -> bool {
        self.current.read().origin.is_some()
    }
}

impl Default for LiveStore {
    fn default() -> Self {
        Self::new()
    }
}
