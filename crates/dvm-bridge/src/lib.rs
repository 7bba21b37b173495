//! dvm-bridge - ARM64 JNI/Dalvik native-ABI emulation
//!
//! This crate lets a host process execute unmodified ARM64 native code
//! compiled against the Android JNI ABI, by rebuilding the entire
//! native-side interface over a substitute object runtime:
//!
//! - `JNIEnv` / `JavaVM` function tables at their canonical byte offsets,
//!   laid out in guest memory exactly as on a real device
//! - one trampoline per populated slot, dispatched when the guest traps
//!   through a table pointer
//! - AAPCS64-aware argument reading and return writing ([`arm64`])
//! - local/global/weak reference tables mapping integer handles to host
//!   objects ([`refs`])
//! - the three JNI argument protocols normalized onto one typed reader
//!   ([`marshal`])
//!
//! The CPU emulator itself is external: anything that can read and write
//! registers and guest memory, allocate scoped guest blocks, and hand out
//! trappable addresses implements [`backend::Backend`]. A pure-software
//! [`backend::mock::MockBackend`] drives the bridge headlessly in tests.
//!
//! Control flow is always: guest code calls through a table slot, the
//! driver catches the trap and hands the faulting address to
//! [`DalvikVm::handle_trap`], the dispatcher performs the operation and
//! writes the typed return value, and the driver resumes the guest at the
//! link register.

#![warn(rust_2018_idioms)]

pub mod arm64;
pub mod backend;
pub mod env;
pub mod marshal;
pub mod refs;
pub mod vm;

pub use backend::{Backend, BackendError, BackendExt, BackendResult};
pub use refs::{RefKind, RefSpace};
pub use vm::DalvikVm;

// Re-export the facade contract so embedders depend on one crate.
pub use dvm_sdk::{
    Arguments, DvmClass, DvmField, DvmMethod, DvmObject, JValue, JavaType, Jni, JniContext,
    JniError, JniResult, MemoryBlock, MethodSignature, NoopJni, Payload,
};

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Host-side fatal faults.
///
/// These abort the current guest call and are never visible to the guest;
/// the cooperative pending-exception channel lives on [`DalvikVm`]
/// instead. Every dispatch failure is wrapped in [`BridgeError::Slot`] so
/// the offending table entry is part of the diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The CPU/memory backend refused an operation
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The facade had no behavior for a resolved member, or a value
    /// disagreed with its descriptor
    #[error(transparent)]
    Jni(#[from] JniError),

    /// A class handle did not resolve
    #[error("unknown class handle {handle:#x}")]
    UnknownClass {
        /// The handle the guest passed
        handle: u64,
    },

    /// A method id did not resolve on the receiver's class
    #[error("unknown method id {id:#x} on {class}")]
    UnknownMethod {
        /// Class searched
        class: String,
        /// The `jmethodID` the guest passed
        id: u32,
    },

    /// A field id did not resolve on the receiver's class
    #[error("unknown field id {id:#x} on {class}")]
    UnknownField {
        /// Class searched
        class: String,
        /// The `jfieldID` the guest passed
        id: u32,
    },

    /// A non-null object handle resolved to nothing
    #[error("stale object handle {handle:#x}")]
    StaleHandle {
        /// The handle the guest passed
        handle: u64,
    },

    /// An operation that needs a genuine receiver got the null handle
    #[error("null handle where {expected} is required")]
    NullHandle {
        /// What the slot needed
        expected: &'static str,
    },

    /// An object's payload was not what the slot required
    #[error("expected {expected}, got {got}")]
    PayloadMismatch {
        /// Payload kind the slot operates on
        expected: &'static str,
        /// Payload kind actually found
        got: &'static str,
    },

    /// A negative length reached an array constructor
    #[error("negative array length {0}")]
    InvalidLength(i32),

    /// An array or string index range fell outside the value
    #[error("range {start}..{} out of bounds (length {len})", .start + .count)]
    OutOfBounds {
        /// First element of the requested window
        start: usize,
        /// Window length
        count: usize,
        /// Actual value length
        len: usize,
    },

    /// Fatal fault annotated with the table slot that raised it
    #[error("{name} (JNIEnv offset {offset:#x}): {source}")]
    Slot {
        /// Byte offset of the slot in its table
        offset: u64,
        /// Slot name, e.g. `CallStaticIntMethodV`
        name: &'static str,
        /// The underlying fault
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    pub(crate) fn at_slot(self, offset: u64, name: &'static str) -> BridgeError {
        BridgeError::Slot {
            offset,
            name,
            source: Box::new(self),
        }
    }
}
