//! Batch replication across devices.
//!
//! [`DataParallel`] splits its inputs along `dim`, runs one shard per device and concatenates
//! the results. [`DataContainer`]s carry data that is already split per device. Without
//! devices, the inputs still go through a single-shard scatter so the module always sees
//! unwrapped containers.

use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::backend::{kernels, Op};
use crate::error::Error;
use crate::head::{HeadInputs, Sparse4DHead, TemporalInputs, TEMPORAL_INPUTS};
use crate::tensor::Value;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device(pub i32);

impl Device {
    /// The host, also the degenerate target of a device-less scatter.
    pub const CPU: Device = Device(-1);

    #[inline]
    pub fn cuda(index: i32) -> Self {
        Device(index)
    }

    #[inline]
    pub fn is_cpu(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cpu() {
            f.write_str("cpu")
        } else {
            write!(f, "cuda:{}", self.0)
        }
    }
}

/// Data split by the caller, one entry per device.
#[derive(Debug, Clone, PartialEq)]
pub struct DataContainer {
    pub data: Vec<Batch>,
    pub cpu_only: bool,
    pub stack: bool,
}

impl DataContainer {
    /// The same batch handed to each of `copies` devices.
    pub fn replicate(batch: Batch, copies: usize) -> Self {
        Self {
            data: vec![batch; copies],
            cpu_only: true,
            stack: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    Tensor(Value),
    Container(DataContainer),
    List(Vec<Batch>),
    Map(BTreeMap<String, Batch>),
    Text(String),
}

impl Batch {
    pub fn as_tensor(&self) -> Option<&Value> {
        match self {
            Batch::Tensor(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Batch>> {
        match self {
            Batch::Map(map) => Some(map),
            _ => None,
        }
    }
}

/// Positional and keyword arguments of one module call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    pub args: Vec<Batch>,
    pub kwargs: BTreeMap<String, Batch>,
}

impl Inputs {
    pub fn kwargs(kwargs: impl IntoIterator<Item = (String, Batch)>) -> Self {
        Self {
            args: vec![],
            kwargs: kwargs.into_iter().collect(),
        }
    }
}

/// Splits `batch` into per-device shards.
///
/// Tensors are chunked along `dim` into at most `devices.len()` pieces of `ceil(n / devices)`
/// rows. A `[Device::CPU]` target keeps them whole. Containers hand out `data[i]` to shard
/// `i`, text is replicated and lists and maps are scattered element-wise. Composite values
/// yield as many shards as their shortest element.
pub fn scatter(batch: &Batch, devices: &[Device], dim: usize) -> Result<Vec<Batch>, Error> {
    match batch {
        Batch::Tensor(value) => {
            if devices == [Device::CPU] {
                return Ok(vec![batch.clone()]);
            }
            Ok(chunk(value, devices.len(), dim)?
                .into_iter()
                .map(Batch::Tensor)
                .collect())
        }
        Batch::Container(container) => Ok(container.data.iter().take(devices.len()).cloned().collect()),
        Batch::List(items) if !items.is_empty() => {
            let scattered = items
                .iter()
                .map(|item| scatter(item, devices, dim))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(transpose(scattered).into_iter().map(Batch::List).collect())
        }
        Batch::Map(map) if !map.is_empty() => {
            let keys: Vec<&String> = map.keys().collect();
            let scattered = map
                .values()
                .map(|item| scatter(item, devices, dim))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(transpose(scattered)
                .into_iter()
                .map(|values| {
                    Batch::Map(keys.iter().map(|k| (*k).clone()).zip(values).collect())
                })
                .collect())
        }
        _ => Ok(vec![batch.clone(); devices.len()]),
    }
}

/// Scatters positional and keyword arguments, padding the shorter side with empty shards.
pub fn scatter_kwargs(inputs: &Inputs, devices: &[Device], dim: usize) -> Result<Vec<Inputs>, Error> {
    let args = if inputs.args.is_empty() {
        vec![]
    } else {
        transpose(
            inputs
                .args
                .iter()
                .map(|arg| scatter(arg, devices, dim))
                .collect::<Result<Vec<_>, _>>()?,
        )
    };
    let kwargs = if inputs.kwargs.is_empty() {
        vec![]
    } else {
        scatter(&Batch::Map(inputs.kwargs.clone()), devices, dim)?
            .into_iter()
            .map(|shard| match shard {
                Batch::Map(map) => map,
                _ => BTreeMap::new(),
            })
            .collect::<Vec<_>>()
    };

    let count = args.len().max(kwargs.len()).max(1);
    let mut args = args.into_iter();
    let mut kwargs = kwargs.into_iter();

    Ok((0..count)
        .map(|_| Inputs {
            args: args.next().unwrap_or_default(),
            kwargs: kwargs.next().unwrap_or_default(),
        })
        .collect())
}

/// Concatenates per-shard outputs along `dim`, recursing into lists and maps.
pub fn gather(outputs: Vec<Batch>, dim: usize) -> Result<Batch, Error> {
    let first = match outputs.first() {
        Some(first) => first.clone(),
        None => return Err(Error::Replication("nothing to gather".into())),
    };
    if outputs.len() == 1 {
        return Ok(first);
    }

    match first {
        Batch::Tensor(_) => {
            let values = outputs
                .iter()
                .map(|out| {
                    out.as_tensor()
                        .ok_or_else(|| Error::Replication("shards returned mixed outputs".into()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let mut concatenated = kernels::eval(&Op::Concat { axis: dim }, &values)?;
            concatenated
                .pop()
                .map(Batch::Tensor)
                .ok_or_else(|| Error::Replication("concat produced no tensor".into()))
        }
        Batch::List(items) => {
            let mut columns = vec![Vec::with_capacity(outputs.len()); items.len()];
            for out in outputs {
                match out {
                    Batch::List(row) if row.len() == columns.len() => {
                        for (column, item) in columns.iter_mut().zip(row) {
                            column.push(item);
                        }
                    }
                    _ => return Err(Error::Replication("shards returned mixed outputs".into())),
                }
            }
            Ok(Batch::List(
                columns
                    .into_iter()
                    .map(|column| gather(column, dim))
                    .collect::<Result<_, _>>()?,
            ))
        }
        Batch::Map(map) => {
            let mut columns: BTreeMap<String, Vec<Batch>> =
                map.keys().map(|k| (k.clone(), vec![])).collect();
            for out in outputs {
                match out {
                    Batch::Map(row) if row.len() == columns.len() => {
                        for (key, item) in row {
                            columns
                                .get_mut(&key)
                                .ok_or_else(|| Error::Replication(format!("unexpected output `{}`", key)))?
                                .push(item);
                        }
                    }
                    _ => return Err(Error::Replication("shards returned mixed outputs".into())),
                }
            }
            Ok(Batch::Map(
                columns
                    .into_iter()
                    .map(|(key, column)| gather(column, dim).map(|v| (key, v)))
                    .collect::<Result<_, _>>()?,
            ))
        }
        other => Ok(other),
    }
}

fn chunk(value: &Value, chunks: usize, dim: usize) -> Result<Vec<Value>, Error> {
    let shape = value.shape();
    if dim >= shape.len() {
        return Err(Error::shape(
            "scatter",
            format!("cannot split {:?} along axis {}", shape, dim),
        ));
    }

    let len = shape[dim];
    let size = ((len + chunks.max(1) - 1) / chunks.max(1)).max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < len || pieces.is_empty() {
        let end = (start + size).min(len);
        let op = Op::Slice { axis: dim, start, end };
        pieces.extend(kernels::eval(&op, &[value])?);
        start = end.max(start + 1);
    }

    Ok(pieces)
}

fn transpose(columns: Vec<Vec<Batch>>) -> Vec<Vec<Batch>> {
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = vec![Vec::with_capacity(columns.len()); rows];
    for column in columns {
        for (row, item) in out.iter_mut().zip(column) {
            row.push(item);
        }
    }
    out
}

/// A module that [`DataParallel`] can run shard by shard.
pub trait Replicable: Sync {
    /// Devices of every parameter and buffer.
    fn devices(&self) -> Vec<Device>;

    fn forward(&self, inputs: &Inputs) -> Result<Batch, Error>;

    fn train_step(&self, _inputs: &Inputs) -> Result<Batch, Error> {
        Err(Error::Unsupported("train_step"))
    }

    fn val_step(&self, inputs: &Inputs) -> Result<Batch, Error> {
        self.forward(inputs)
    }
}

pub struct DataParallel<M> {
    module: M,
    device_ids: Vec<Device>,
    output_device: Device,
    dim: usize,
}

impl<M: Replicable> DataParallel<M> {
    pub fn new(module: M, device_ids: Vec<Device>) -> Self {
        let output_device = device_ids.first().copied().unwrap_or(Device::CPU);
        Self {
            module,
            device_ids,
            output_device,
            dim: 0,
        }
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    pub fn with_output_device(mut self, device: Device) -> Self {
        self.output_device = device;
        self
    }

    #[inline]
    pub fn module(&self) -> &M {
        &self.module
    }

    #[inline]
    pub fn device_ids(&self) -> &[Device] {
        &self.device_ids
    }

    #[inline]
    pub fn output_device(&self) -> Device {
        self.output_device
    }

    pub fn scatter(&self, inputs: &Inputs, devices: &[Device]) -> Result<Vec<Inputs>, Error> {
        scatter_kwargs(inputs, devices, self.dim)
    }

    pub fn forward(&self, inputs: &Inputs) -> Result<Batch, Error> {
        if self.device_ids.is_empty() {
            let shards = self.scatter(inputs, &[Device::CPU])?;
            return self.module.forward(&shards[0]);
        }

        self.check_placement()?;
        let shards = self.scatter(inputs, &self.device_ids)?;
        if self.device_ids.len() == 1 {
            return self.module.forward(&shards[0]);
        }

        debug!(shards = shards.len(), output_device = %self.output_device, "replicated forward");
        let outputs = shards
            .par_iter()
            .map(|shard| self.module.forward(shard))
            .collect::<Result<Vec<_>, _>>()?;

        gather(outputs, self.dim)
    }

    pub fn train_step(&self, inputs: &Inputs) -> Result<Batch, Error> {
        let shard = self.single_device_shard(inputs)?;
        self.module.train_step(&shard)
    }

    pub fn val_step(&self, inputs: &Inputs) -> Result<Batch, Error> {
        let shard = self.single_device_shard(inputs)?;
        self.module.val_step(&shard)
    }

    fn single_device_shard(&self, inputs: &Inputs) -> Result<Inputs, Error> {
        let devices = if self.device_ids.is_empty() {
            vec![Device::CPU]
        } else {
            if self.device_ids.len() != 1 {
                return Err(Error::Replication(format!(
                    "train_step and val_step run on a single device, got {}",
                    self.device_ids.len()
                )));
            }
            self.check_placement()?;
            self.device_ids.clone()
        };

        let mut shards = self.scatter(inputs, &devices)?;
        Ok(shards.swap_remove(0))
    }

    fn check_placement(&self) -> Result<(), Error> {
        let expected = self.device_ids.first().copied().unwrap_or(Device::CPU);
        match self.module.devices().into_iter().find(|d| *d != expected) {
            Some(found) => Err(Error::DevicePlacement { expected, found }),
            None => Ok(()),
        }
    }
}

impl Replicable for Sparse4DHead {
    fn devices(&self) -> Vec<Device> {
        vec![self.device()]
    }

    /// Runs the eager head on keyword arguments named after the graph inputs. The temporal
    /// head is used whenever `temp_instance_feature` is given.
    fn forward(&self, inputs: &Inputs) -> Result<Batch, Error> {
        let tensor = |name: &str| -> Result<Value, Error> {
            inputs
                .kwargs
                .get(name)
                .and_then(Batch::as_tensor)
                .cloned()
                .ok_or_else(|| Error::Replication(format!("missing tensor input `{}`", name)))
        };

        let head_inputs = HeadInputs::try_from_vec(
            TEMPORAL_INPUTS[4..]
                .iter()
                .map(|name| tensor(name))
                .collect::<Result<Vec<_>, _>>()?,
        )?;

        let b = crate::backend::Eager;
        let outputs = if inputs.kwargs.contains_key(TEMPORAL_INPUTS[0]) {
            let temporal = TemporalInputs {
                temp_instance_feature: tensor(TEMPORAL_INPUTS[0])?,
                temp_anchor: tensor(TEMPORAL_INPUTS[1])?,
                mask: tensor(TEMPORAL_INPUTS[2])?,
                track_id: tensor(TEMPORAL_INPUTS[3])?,
            };
            self.forward_temporal(&b, &temporal, &head_inputs)?
        } else {
            self.forward_first(&b, &head_inputs)?
        };

        Ok(Batch::Map(
            outputs
                .named()
                .into_iter()
                .map(|(name, value)| (name.to_string(), Batch::Tensor(value.clone())))
                .collect(),
        ))
    }
}
