use super::Mode;
use parking_lot::Mutex;
use std::sync::Arc;

/// Process-wide cache of loaded models, one slot per mode.
///
/// Slots are filled on first use and never evicted. Each slot has its own lock, so a
/// slow load for one mode does not hold back the others, and concurrent first requests
/// for the same mode wait for a single load instead of racing.
pub struct ModelRegistry<M> {
    slots: [Mutex<Option<Arc<M>>>; 3],
}

impl<M> ModelRegistry<M> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(None)),
        }
    }

    /// A failed load leaves the slot empty so a later frame can retry it.
    pub fn get_or_load<E, F>(&self, mode: Mode, load: F) -> Result<Arc<M>, E>
    where
        F: FnOnce(Mode) -> Result<M, E>,
    {
        let mut slot = self.slots[mode.index()].lock();
        if let Some(model) = slot.as_ref() {
            return Ok(model.clone());
        }

        tracing::info!(mode = %mode, "Loading model");
        let model = Arc::new(load(mode)?);
        *slot = Some(model.clone());
        Ok(model)
    }

    #[cfg(test)]
    pub fn is_loaded(&self, mode: Mode) -> bool {
        self.slots[mode.index()].lock().is_some()
    }
}

impl<M> Default for ModelRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}
