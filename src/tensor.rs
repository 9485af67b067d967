use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};
use crate::math::Matrix;

/// Index of a parameter inside a [`ParamStore`]. Every device replica numbers
/// its parameters identically, so an id is valid on any device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub usize);

/// A named, device-resident parameter with weight, gradient and optimizer
/// cache planes.
///
/// `cache` holds the RMSProp moving average (Adam's second moment) and
/// `moment` holds Adam's first moment; it stays empty under RMSProp.
#[derive(Clone, Debug)]
pub struct WeightTensor {
    pub name: String,
    pub device_id: usize,
    pub weight: Matrix,
    pub gradient: Matrix,
    pub cache: Matrix,
    pub moment: Matrix,
    pub trainable: bool,
}

impl WeightTensor {
    pub fn new(name: impl Into<String>, weight: Matrix, device_id: usize, trainable: bool) -> Self {
        let (rows, cols) = weight.shape();
        Self {
            name: name.into(),
            device_id,
            weight,
            gradient: Matrix::zeros(rows, cols),
            cache: Matrix::zeros(rows, cols),
            moment: Matrix::zeros(0, 0),
            trainable,
        }
    }

    pub fn rows(&self) -> usize {
        self.weight.rows
    }

    pub fn cols(&self) -> usize {
        self.weight.cols
    }

    pub fn copy_weights_from(&mut self, src: &WeightTensor) {
        assert_eq!(self.weight.shape(), src.weight.shape(), "{}", self.name);
        self.weight.data.copy_from_slice(&src.weight.data);
    }

    pub fn add_gradient_from(&mut self, src: &WeightTensor) {
        self.gradient.add_assign(&src.gradient);
    }

    pub fn clear_gradient(&mut self) {
        self.gradient.data.iter_mut().for_each(|g| *g = 0.0);
    }

    pub fn clean_cache(&mut self) {
        self.cache.data.iter_mut().for_each(|c| *c = 0.0);
        self.moment.data.iter_mut().for_each(|m| *m = 0.0);
    }

    pub fn set_weight_at_row(&mut self, row: usize, values: &[f32]) {
        self.weight.row_mut(row).copy_from_slice(values);
    }

    /// Writes the weight plane as `rows u32, cols u32, rows*cols f32`.
    pub fn save<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.rows() as u32)?;
        w.write_u32::<LittleEndian>(self.cols() as u32)?;
        for &v in &self.weight.data {
            w.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }

    /// Reads a blob written by [`WeightTensor::save`] into this tensor. The
    /// stored shape must match the shape built from the model header.
    pub fn load<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<()> {
        let rows = r.read_u32::<LittleEndian>()? as usize;
        let cols = r.read_u32::<LittleEndian>()? as usize;
        if (rows, cols) != self.weight.shape() {
            return Err(Error::ShapeMismatch {
                name: self.name.clone(),
                expected: self.weight.shape(),
                found: (rows, cols),
            });
        }
        r.read_f32_into::<LittleEndian>(&mut self.weight.data)?;
        Ok(())
    }
}

/// Where a device finds the storage for one parameter slot.
#[derive(Clone, Debug)]
pub enum Ownership {
    /// The device keeps its own copy, synchronized by broadcast and reduce.
    Owned(WeightTensor),
    /// The device reads (and accumulates gradients into) the copy held by
    /// another device. Broadcast and reduce never touch aliased slots.
    AliasOf(usize),
}

/// All parameter slots of one device replica.
#[derive(Clone, Debug, Default)]
pub struct ParamStore {
    pub device_id: usize,
    pub slots: Vec<Ownership>,
}

impl ParamStore {
    pub fn new(device_id: usize) -> Self {
        Self {
            device_id,
            slots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, tensor: WeightTensor) -> ParamId {
        self.slots.push(Ownership::Owned(tensor));
        ParamId(self.slots.len() - 1)
    }

    /// The locally owned tensor, or `None` for an aliased slot.
    pub fn owned(&self, id: ParamId) -> Option<&WeightTensor> {
        match &self.slots[id.0] {
            Ownership::Owned(t) => Some(t),
            Ownership::AliasOf(_) => None,
        }
    }

    pub fn owned_mut(&mut self, id: ParamId) -> Option<&mut WeightTensor> {
        match &mut self.slots[id.0] {
            Ownership::Owned(t) => Some(t),
            Ownership::AliasOf(_) => None,
        }
    }

    pub fn tensors(&self) -> impl Iterator<Item = &WeightTensor> {
        self.slots.iter().filter_map(|s| match s {
            Ownership::Owned(t) => Some(t),
            Ownership::AliasOf(_) => None,
        })
    }

    pub fn tensors_mut(&mut self) -> impl Iterator<Item = &mut WeightTensor> {
        self.slots.iter_mut().filter_map(|s| match s {
            Ownership::Owned(t) => Some(t),
            Ownership::AliasOf(_) => None,
        })
    }

    /// Builds the replica used by `device_id`: every slot is an owned copy
    /// except `aliased`, which point back at this store's device.
    pub fn replicate(&self, device_id: usize, aliased: &[ParamId]) -> ParamStore {
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                if aliased.contains(&ParamId(i)) {
                    return Ownership::AliasOf(self.device_id);
                }
                match slot {
                    Ownership::Owned(t) => {
                        let mut copy = t.clone();
                        copy.device_id = device_id;
                        copy.clean_cache();
                        copy.clear_gradient();
                        Ownership::Owned(copy)
                    }
                    Ownership::AliasOf(d) => Ownership::AliasOf(*d),
                }
            })
            .collect();
        ParamStore { device_id, slots }
    }

    pub fn clear_gradients(&mut self) {
        self.tensors_mut().for_each(WeightTensor::clear_gradient);
    }

    /// Adds per-parameter gradients produced by a backward pass to the
    /// tensors owned by this store. Aliased entries are returned so the
    /// caller can deliver them to the owning device.
    pub fn accumulate(&mut self, grads: Gradients) -> Vec<(usize, ParamId, Matrix)> {
        let mut forwarded = Vec::new();
        for (id, g) in grads.0 {
            match &mut self.slots[id.0] {
                Ownership::Owned(t) => t.gradient.add_assign(&g),
                Ownership::AliasOf(owner) => forwarded.push((*owner, id, g)),
            }
        }
        forwarded
    }
}

/// Read-only view of the parameters a device computes with. Aliased slots
/// are resolved against the other devices' stores.
#[derive(Clone, Copy)]
pub struct ParamView<'a> {
    stores: &'a [ParamStore],
    device: usize,
}

impl<'a> ParamView<'a> {
    /// `device` is an index into `stores`.
    pub fn new(stores: &'a [ParamStore], device: usize) -> Self {
        Self { stores, device }
    }

    pub fn single(store: &'a ParamStore) -> Self {
        Self {
            stores: std::slice::from_ref(store),
            device: 0,
        }
    }

    pub fn device_id(&self) -> usize {
        self.stores[self.device].device_id
    }

    pub fn tensor(&self, id: ParamId) -> &'a WeightTensor {
        let mut store = &self.stores[self.device];
        loop {
            match &store.slots[id.0] {
                Ownership::Owned(t) => return t,
                Ownership::AliasOf(owner) => {
                    store = self
                        .stores
                        .iter()
                        .find(|s| s.device_id == *owner)
                        .unwrap_or_else(|| panic!("no store for device {owner}"));
                }
            }
        }
    }
}

/// Parameter gradients collected from one backward pass.
#[derive(Debug, Default)]
pub struct Gradients(pub Vec<(ParamId, Matrix)>);

impl Gradients {
    pub fn get(&self, id: ParamId) -> Option<&Matrix> {
        self.0.iter().find(|(p, _)| *p == id).map(|(_, g)| g)
    }
}

/// Creates named parameters in a store with random initialisation.
pub struct ParamBuilder<'a, R: Rng> {
    store: &'a mut ParamStore,
    rng: &'a mut R,
}

impl<'a, R: Rng> ParamBuilder<'a, R> {
    pub fn new(store: &'a mut ParamStore, rng: &'a mut R) -> Self {
        Self { store, rng }
    }

    /// Gaussian init scaled by fan-in plus fan-out.
    pub fn normal(&mut self, name: &str, rows: usize, cols: usize) -> ParamId {
        let std = (2.0 / (rows + cols) as f32).sqrt();
        let data = match Normal::new(0.0, std) {
            Ok(dist) => (0..rows * cols).map(|_| dist.sample(self.rng)).collect(),
            Err(_) => vec![0.0; rows * cols],
        };
        self.push(name, Matrix::from_vec(rows, cols, data))
    }

    pub fn zeros(&mut self, name: &str, rows: usize, cols: usize) -> ParamId {
        self.push(name, Matrix::zeros(rows, cols))
    }

    pub fn ones(&mut self, name: &str, rows: usize, cols: usize) -> ParamId {
        self.push(name, Matrix::filled(rows, cols, 1.0))
    }

    fn push(&mut self, name: &str, weight: Matrix) -> ParamId {
        let device = self.store.device_id;
        self.store.push(WeightTensor::new(name, weight, device, true))
    }
}
