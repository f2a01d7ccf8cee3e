//! Tagged values crossing the host/sandbox boundary.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A host-side object crossing the sandbox boundary.
///
/// The bridge never looks inside the box. The `Arc` allocation address is
/// the object's identity, and the strong count plays the role of the host
/// collector's reachability edge: the bridge retains an object by holding a
/// clone and makes it collectible again by dropping that clone.
pub type HostValue = Arc<dyn Any + Send + Sync>;

/// Stable identity key for a [`HostValue`]: the allocation's data pointer.
///
/// Pointer identity, never content hash. Two boxes with equal contents get
/// distinct identities, and an identity stays valid for as long as the
/// bridge holds a strong clone of the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ObjectId(usize);

impl ObjectId {
    pub(crate) fn of(value: &HostValue) -> Self {
        // Fat pointer to thin pointer: only the data address carries identity.
        ObjectId(Arc::as_ptr(value) as *const () as usize)
    }
}

/// Host-side stand-in for a sandbox-originated reference.
///
/// When a call returns an externref this bridge never minted, the value is
/// wrapped on first sight in one of these so the host has an identity to
/// hold and pass back. Downcast a returned [`HostValue`] to this type to
/// detect such wrappers.
#[derive(Debug)]
pub struct OpaqueSandboxRef;

/// An argument handed to a sandbox call.
///
/// Scalars pass by value, host objects pass by externref handle, and buffer
/// arguments are copied into sandbox linear memory and lowered as a
/// `(base, len)` pair of `i32`s. `Seed` writes the persistent payload slot
/// instead of a per-call scratch region.
pub enum Arg {
    /// 32-bit integer scalar
    I32(i32),
    /// 64-bit integer scalar
    I64(i64),
    /// 32-bit float scalar
    F32(f32),
    /// 64-bit float scalar
    F64(f64),
    /// Host object, marshaled through the identity bridge
    Ref(HostValue),
    /// Null externref
    NullRef,
    /// Byte buffer, copied into a scratch region freed when the call returns
    Bytes(Vec<u8>),
    /// Byte buffer written to the persistent seed slot; the region survives
    /// the call and is replaced by the next `Seed` argument
    Seed(Vec<u8>),
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::I32(v) => write!(f, "I32({v})"),
            Arg::I64(v) => write!(f, "I64({v})"),
            Arg::F32(v) => write!(f, "F32({v})"),
            Arg::F64(v) => write!(f, "F64({v})"),
            Arg::Ref(_) => f.write_str("Ref(<host object>)"),
            Arg::NullRef => f.write_str("NullRef"),
            Arg::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Arg::Seed(b) => write!(f, "Seed({} bytes)", b.len()),
        }
    }
}

/// A value coming back across the boundary: sandbox call results, or the
/// arguments a host callback receives.
#[derive(Clone)]
pub enum Value {
    /// 32-bit integer scalar
    I32(i32),
    /// 64-bit integer scalar
    I64(i64),
    /// 32-bit float scalar
    F32(f32),
    /// 64-bit float scalar
    F64(f64),
    /// Host object recovered from an externref handle
    Ref(HostValue),
    /// Null externref
    NullRef,
}

impl Value {
    /// The scalar as an `i32`, if it is one.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// The host object behind this value, if it is a reference.
    pub fn host_ref(&self) -> Option<&HostValue> {
        match self {
            Value::Ref(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "I32({v})"),
            Value::I64(v) => write!(f, "I64({v})"),
            Value::F32(v) => write!(f, "F32({v})"),
            Value::F64(v) => write!(f, "F64({v})"),
            Value::Ref(_) => f.write_str("Ref(<host object>)"),
            Value::NullRef => f.write_str("NullRef"),
        }
    }
}

/// Wasm-level type tag, used to declare host callback signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// Externref
    Ref,
}

/// A temporary allocation inside the sandbox's linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegion {
    /// Address within sandbox linear memory
    pub base: u32,
    /// Byte size
    pub len: u32,
}
