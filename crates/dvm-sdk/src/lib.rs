//! dvm-sdk - Object-model contract for the Dalvik native-ABI bridge
//!
//! This crate defines the minimal types and traits a host process needs to
//! stand in for the managed runtime behind a guest's JNI calls, without
//! depending on the bridge or on any CPU emulator:
//!
//! - [`JValue`] / [`JavaType`] / [`MethodSignature`] — the Java-side value
//!   and descriptor model
//! - [`DvmObject`] / [`DvmClass`] / [`DvmMethod`] / [`DvmField`] — the
//!   substitute object graph handed across the guest/host boundary
//! - [`Arguments`] — the normalized per-parameter argument reader all
//!   call protocols converge on
//! - [`Jni`] — the facade trait the embedder implements to supply method,
//!   constructor and field behavior
//! - [`JniContext`] — the services the bridge offers back to facade code
//!   (class resolution, reference vending, pending-exception state)
//!
//! # Example
//!
//! ```ignore
//! use dvm_sdk::{Arguments, DvmMethod, DvmObject, JValue, Jni, JniContext, JniResult};
//!
//! struct MyRuntime;
//!
//! impl Jni for MyRuntime {
//!     fn call_method(
//!         &mut self,
//!         _ctx: &mut dyn JniContext,
//!         _receiver: &DvmObject,
//!         method: &DvmMethod,
//!         args: &mut Arguments,
//!     ) -> JniResult<JValue> {
//!         match method.key().as_str() {
//!             "add(II)I" => Ok(JValue::Int(args.next_int()? + args.next_int()?)),
//!             _ => Err(dvm_sdk::JniError::unhandled(method.qualified())),
//!         }
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod args;
pub mod error;
pub mod jni;
pub mod object;
pub mod value;

pub use args::Arguments;
pub use error::{JniError, JniResult};
pub use jni::{Jni, JniContext, NoopJni};
pub use object::{signature_hash, DvmClass, DvmField, DvmMethod, DvmObject, MemoryBlock, Payload};
pub use value::{JValue, JavaType, MethodSignature};
