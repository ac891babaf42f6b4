//! Buffer metadata and the per-thread named buffer registry
//!
//! A buffer is declared by a [`BufferDesc`]: name, element type, count and a
//! storage optimization. The registry maps names to live buffers in
//! insertion order, which is also ascending binding-ID order, and hands out
//! IDs from a counter that never goes backwards.

use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::codegen::glsl::JOB_INDEX_NAME;
use crate::device::{Device, DeviceId};
use crate::driver::{BufferHandle, BufferId, StorageHint};
use crate::error::{GpuError, GpuResult};

/// Semantic element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferType {
    Float,
    Double,
    Int,
    Uint,
    Bool,
    Vec,
    DVec,
    BVec,
    IVec,
    UVec,
    Mat2,
    DMat2,
    Mat3,
    DMat3,
    Mat4,
    DMat4,
    /// A caller-defined struct; the type name comes from the descriptor.
    Custom,
}

impl BufferType {
    /// Shader spelling of the element type. `None` for [`BufferType::Custom`].
    pub fn glsl_name(self) -> Option<&'static str> {
        Some(match self {
            Self::Float => "float",
            Self::Double => "double",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Bool => "bool",
            Self::Vec => "vec4",
            Self::DVec => "dvec4",
            Self::BVec => "bvec4",
            Self::IVec => "ivec4",
            Self::UVec => "uvec4",
            Self::Mat2 => "mat2",
            Self::DMat2 => "dmat2",
            Self::Mat3 => "mat3",
            Self::DMat3 => "dmat3",
            Self::Mat4 => "mat4",
            Self::DMat4 => "dmat4",
            Self::Custom => return None,
        })
    }

    /// Element stride under std430 layout. `None` for [`BufferType::Custom`].
    pub fn std430_size(self) -> Option<usize> {
        Some(match self {
            Self::Float | Self::Int | Self::Uint | Self::Bool => 4,
            Self::Double => 8,
            Self::Vec | Self::BVec | Self::IVec | Self::UVec | Self::Mat2 => 16,
            Self::DVec | Self::DMat2 => 32,
            Self::Mat3 => 48,
            Self::Mat4 => 64,
            Self::DMat3 => 96,
            Self::DMat4 => 128,
            Self::Custom => return None,
        })
    }
}

/// How the buffer will be accessed from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferOptimization {
    /// Written once at creation, then only touched by shaders.
    #[default]
    GpuStatic,
    Read,
    ReadWrite,
}

impl BufferOptimization {
    pub fn storage_hint(self) -> StorageHint {
        match self {
            Self::GpuStatic => StorageHint::NoReadWrite,
            Self::Read => StorageHint::Read,
            Self::ReadWrite => StorageHint::ReadWrite,
        }
    }
}

/// `true` if `name` can be declared in a shader: `[A-Za-z_][A-Za-z0-9_]*`,
/// not in the reserved `gl_` namespace.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    head_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("gl_")
}

/// Declaration of a buffer to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub ty: BufferType,
    pub custom_type: Option<String>,
    /// Number of elements.
    pub count: usize,
    /// First element of the source slice to upload.
    pub offset: usize,
    pub optimization: BufferOptimization,
    /// Declare as an unsized array even when `count == 1`.
    pub collection: bool,
}

impl BufferDesc {
    pub fn new(name: impl Into<String>, ty: BufferType, count: usize) -> Self {
        BufferDesc {
            name: name.into(),
            ty,
            custom_type: None,
            count,
            offset: 0,
            optimization: BufferOptimization::default(),
            collection: false,
        }
    }

    /// A buffer of caller-defined struct `type_name`.
    pub fn custom(name: impl Into<String>, type_name: impl Into<String>, count: usize) -> Self {
        BufferDesc {
            custom_type: Some(type_name.into()),
            ..Self::new(name, BufferType::Custom, count)
        }
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn optimization(mut self, optimization: BufferOptimization) -> Self {
        self.optimization = optimization;
        self
    }

    pub fn collection(mut self, collection: bool) -> Self {
        self.collection = collection;
        self
    }

    pub fn is_array(&self) -> bool {
        self.count != 1 || self.collection
    }

    /// Check the descriptor and resolve its shader element type.
    pub(crate) fn element_type(&self) -> GpuResult<ElementType> {
        if self.name.is_empty() {
            return Err(GpuError::InvalidArgument("buffer name is empty".into()));
        }
        if !is_valid_identifier(&self.name) || self.name == JOB_INDEX_NAME {
            return Err(GpuError::InvalidArgument(format!(
                "'{}' is not a usable shader identifier",
                self.name
            )));
        }
        if self.count == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{}' has zero elements",
                self.name
            )));
        }

        let base = match (self.ty.glsl_name(), self.custom_type.as_deref()) {
            (Some(name), _) => name.to_string(),
            (None, Some(custom)) if is_valid_identifier(custom) => custom.to_string(),
            (None, Some(custom)) => {
                return Err(GpuError::InvalidArgument(format!(
                    "custom type '{}' is not a valid identifier",
                    custom
                )))
            }
            (None, None) => {
                return Err(GpuError::InvalidArgument(format!(
                    "custom buffer '{}' needs a type name",
                    self.name
                )))
            }
        };

        Ok(ElementType {
            base,
            array: self.is_array(),
        })
    }
}

/// Resolved shader element type of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementType {
    /// Scalar spelling, e.g. `float` or a custom struct name.
    pub base: String,
    /// Declared as an unsized array.
    pub array: bool,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.array {
            write!(f, "{}[]", self.base)
        } else {
            f.write_str(&self.base)
        }
    }
}

/// Snapshot of a registered buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub name: String,
    pub id: BufferId,
    pub element: ElementType,
    pub byte_len: usize,
    pub device: DeviceId,
}

/// A live buffer owned by a thread context.
#[derive(Debug)]
pub(crate) struct Buffer {
    pub id: BufferId,
    pub element: ElementType,
    pub byte_len: usize,
    pub handle: BufferHandle,
    pub device: Device,
}

impl Buffer {
    pub fn info(&self, name: &str) -> BufferInfo {
        BufferInfo {
            name: name.to_string(),
            id: self.id,
            element: self.element.clone(),
            byte_len: self.byte_len,
            device: self.device.id(),
        }
    }

    /// `true` if `[byte_offset, byte_offset + len)` lies inside the buffer.
    pub fn contains(&self, byte_offset: u64, len: usize) -> bool {
        u64::try_from(len)
            .ok()
            .and_then(|len| byte_offset.checked_add(len))
            .is_some_and(|end| end <= self.byte_len as u64)
    }
}

/// Name → buffer table of one thread context.
#[derive(Debug)]
pub(crate) struct BufferRegistry {
    entries: IndexMap<String, Buffer>,
    next_id: BufferId,
}

impl BufferRegistry {
    /// An empty table whose first buffer gets `next_id`.
    pub fn starting_at(next_id: BufferId) -> Self {
        BufferRegistry {
            entries: IndexMap::new(),
            next_id,
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// ID the next inserted buffer will receive.
    pub fn next_id(&self) -> BufferId {
        self.next_id
    }

    /// Insert a buffer that was allocated with [`Self::next_id`].
    pub fn insert(&mut self, name: String, buffer: Buffer) {
        debug_assert_eq!(buffer.id, self.next_id);
        debug_assert!(!self.entries.contains_key(&name));
        self.next_id += 1;
        self.entries.insert(name, buffer);
    }

    pub fn get(&self, name: &str) -> Option<&Buffer> {
        self.entries.get(name)
    }

    /// Remove an entry, keeping the remaining ones in ID order.
    pub fn remove(&mut self, name: &str) -> Option<Buffer> {
        self.entries.shift_remove(name)
    }

    /// Entries in ascending ID order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Buffer)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (String, Buffer)> + '_ {
        self.entries.drain(..)
    }
}
