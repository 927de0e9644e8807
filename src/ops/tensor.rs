use std::fmt;
use std::ptr::NonNull;

use crate::ops::registry::OperatorId;

/// Shape of a tensor
pub type Shape = Vec<usize>;

/// Stable tensor identity (fuid), independent of any container position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(pub usize);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float32,
    Float64,
    Float16,
    BFloat16,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
}

impl DataType {
    /// Get the size in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float64 => 8,
            DataType::Float16 => 2,
            DataType::BFloat16 => 2,
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Uint8 => 1,
            DataType::Uint16 => 2,
            DataType::Uint32 => 4,
            DataType::Uint64 => 8,
            DataType::Bool => 1,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float32 => "Float32",
            DataType::Float64 => "Float64",
            DataType::Float16 => "Float16",
            DataType::BFloat16 => "BFloat16",
            DataType::Int8 => "Int8",
            DataType::Int16 => "Int16",
            DataType::Int32 => "Int32",
            DataType::Int64 => "Int64",
            DataType::Uint8 => "UInt8",
            DataType::Uint16 => "UInt16",
            DataType::Uint32 => "UInt32",
            DataType::Uint64 => "UInt64",
            DataType::Bool => "Bool",
        };
        f.write_str(name)
    }
}

/// Storage bound to a tensor: a region of the planner's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlob {
    base: NonNull<u8>,
    offset: usize,
}

impl DataBlob {
    pub fn new(base: NonNull<u8>, offset: usize) -> Self {
        Self { base, offset }
    }

    /// Base pointer of the whole buffer
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Byte offset of this tensor inside the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// A tensor node of the computation graph.
///
/// Producer and consumer links are ids into the owning graph and carry no
/// ownership. `targets` holds one entry per consuming input slot.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub(crate) fuid: TensorId,
    pub(crate) dims: Shape,
    pub(crate) dtype: DataType,
    pub(crate) source: Option<OperatorId>,
    pub(crate) targets: Vec<OperatorId>,
    pub(crate) blob: Option<DataBlob>,
}

impl Tensor {
    pub(crate) fn new(fuid: TensorId, dims: Shape, dtype: DataType) -> Self {
        Self {
            fuid,
            dims,
            dtype,
            source: None,
            targets: Vec::new(),
            blob: None,
        }
    }

    pub fn fuid(&self) -> TensorId {
        self.fuid
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Number of elements; a rank-0 tensor holds one. Saturates at `usize::MAX`.
    pub fn size(&self) -> usize {
        self.dims.iter().fold(1usize, |acc, &d| acc.saturating_mul(d))
    }

    /// Byte footprint of the tensor, saturating at `usize::MAX`
    pub fn bytes(&self) -> usize {
        self.size().saturating_mul(self.dtype.size_in_bytes())
    }

    /// Operator producing this tensor, if any
    pub fn source(&self) -> Option<OperatorId> {
        self.source
    }

    /// Operators consuming this tensor, one entry per input slot
    pub fn targets(&self) -> &[OperatorId] {
        &self.targets
    }

    pub fn data_blob(&self) -> Option<&DataBlob> {
        self.blob.as_ref()
    }

    pub(crate) fn set_shape(&mut self, dims: Shape) {
        self.dims = dims;
    }

    pub(crate) fn set_data_blob(&mut self, blob: DataBlob) {
        self.blob = Some(blob);
    }

    pub(crate) fn add_target(&mut self, op: OperatorId) {
        self.targets.push(op);
    }

    /// Drop one consumer slot of `op`
    pub(crate) fn remove_target(&mut self, op: OperatorId) {
        if let Some(pos) = self.targets.iter().position(|&t| t == op) {
            self.targets.remove(pos);
        }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor {}, shape {:?}, dtype {}", self.fuid, self.dims, self.dtype)?;
        match self.source {
            Some(op) => write!(f, ", source {}", op)?,
            None => write!(f, ", source None")?,
        }
        let targets: Vec<usize> = self.targets.iter().map(|op| op.0).collect();
        write!(f, ", targets {:?}", targets)?;
        match &self.blob {
            Some(blob) => write!(f, ", offset {}", blob.offset()),
            None => write!(f, ", unbound"),
        }
    }
}
