use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::tensor::{ParamId, ParamStore, WeightTensor};

/// Common interface for network components.
///
/// Components only hold [`ParamId`]s; the weights themselves live in a
/// [`ParamStore`], one per device, so the same component value drives every
/// replica.
pub trait Layer {
    /// Parameters in persistence order.
    fn params(&self) -> Vec<ParamId>;

    /// Writes every parameter of this component from `store`.
    fn save(&self, store: &ParamStore, w: &mut dyn Write) -> Result<()> {
        for id in self.params() {
            owned(store, id)?.save(w)?;
        }
        Ok(())
    }

    /// Reads every parameter of this component into `store`, in the order
    /// [`Layer::save`] wrote them.
    fn load(&self, store: &mut ParamStore, r: &mut dyn Read) -> Result<()> {
        for id in self.params() {
            owned_mut(store, id)?.load(r)?;
        }
        Ok(())
    }
}

pub(crate) fn owned(store: &ParamStore, id: ParamId) -> Result<&WeightTensor> {
    store
        .owned(id)
        .ok_or_else(|| Error::ModelFormat(format!("parameter {} is not owned by device {}", id.0, store.device_id)))
}

pub(crate) fn owned_mut(store: &mut ParamStore, id: ParamId) -> Result<&mut WeightTensor> {
    let device = store.device_id;
    store
        .owned_mut(id)
        .ok_or_else(|| Error::ModelFormat(format!("parameter {} is not owned by device {device}", id.0)))
}
