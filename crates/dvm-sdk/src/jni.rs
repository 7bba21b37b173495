//! The facade contract between the bridge and the embedder
//!
//! [`JniContext`] is what the bridge provides (implemented by its
//! per-process context); [`Jni`] is what the embedder provides. Every
//! `Jni` method receives the context so host code can resolve classes,
//! vend references and raise guest-visible exceptions while servicing a
//! call — including from nested calls, since the guest commonly re-enters
//! the environment tables before a native method returns.
//!
//! All behavior methods default to [`JniError::Unhandled`]; the bridge
//! escalates that to a fatal fault, because a guest invoking a member the
//! host never modeled means the two sides have diverged.

use crate::args::Arguments;
use crate::error::{JniError, JniResult};
use crate::object::{DvmClass, DvmField, DvmMethod, DvmObject};
use crate::value::JValue;

/// Services the bridge exposes to facade implementations
pub trait JniContext {
    /// Resolve (auto-registering) a class by internal-form name
    fn resolve_class(&mut self, name: &str) -> DvmClass;

    /// Resolve a class, declaring the interfaces it implements
    fn resolve_class_with_interfaces(&mut self, name: &str, interfaces: &[DvmClass]) -> DvmClass;

    /// Create a `java/lang/String` object from host text
    fn new_string(&mut self, value: &str) -> DvmObject;

    /// Resolve a guest handle to its object (references and class mirrors)
    fn resolve_handle(&self, handle: u64) -> Option<DvmObject>;

    /// Vend a local reference for `object`, returning its handle
    fn add_local_ref(&mut self, object: &DvmObject) -> u64;

    /// Vend a (possibly weak) global reference for `object`
    fn add_global_ref(&mut self, object: &DvmObject, weak: bool) -> u64;

    /// Set the pending exception, overwriting any outstanding one
    fn set_pending_exception(&mut self, throwable: DvmObject);

    /// The currently pending exception, if any
    fn pending_exception(&self) -> Option<DvmObject>;

    /// Clear the pending exception
    fn clear_pending_exception(&mut self);
}

/// Behavior the host supplies for the substitute runtime.
///
/// One value-typed method per operation family instead of one method per
/// Java return type; the bridge coerces the returned [`JValue`] to the
/// slot's declared kind and faults on disagreement.
#[allow(unused_variables)]
pub trait Jni {
    /// Invoke an instance method
    fn call_method(
        &mut self,
        ctx: &mut dyn JniContext,
        receiver: &DvmObject,
        method: &DvmMethod,
        args: &mut Arguments,
    ) -> JniResult<JValue> {
        Err(JniError::unhandled(method.qualified()))
    }

    /// Invoke a static method
    fn call_static_method(
        &mut self,
        ctx: &mut dyn JniContext,
        class: &DvmClass,
        method: &DvmMethod,
        args: &mut Arguments,
    ) -> JniResult<JValue> {
        Err(JniError::unhandled(method.qualified()))
    }

    /// Run a constructor, producing the new instance
    fn new_object(
        &mut self,
        ctx: &mut dyn JniContext,
        class: &DvmClass,
        method: &DvmMethod,
        args: &mut Arguments,
    ) -> JniResult<DvmObject> {
        Err(JniError::unhandled(method.qualified()))
    }

    /// Allocate an instance without running a constructor
    fn alloc_object(&mut self, ctx: &mut dyn JniContext, class: &DvmClass) -> JniResult<DvmObject> {
        Ok(DvmObject::instance(class.clone()))
    }

    /// Read an instance field
    fn get_field(
        &mut self,
        ctx: &mut dyn JniContext,
        receiver: &DvmObject,
        field: &DvmField,
    ) -> JniResult<JValue> {
        Err(JniError::unhandled(field.qualified()))
    }

    /// Write an instance field
    fn set_field(
        &mut self,
        ctx: &mut dyn JniContext,
        receiver: &DvmObject,
        field: &DvmField,
        value: JValue,
    ) -> JniResult<()> {
        Err(JniError::unhandled(field.qualified()))
    }

    /// Read a static field
    fn get_static_field(
        &mut self,
        ctx: &mut dyn JniContext,
        class: &DvmClass,
        field: &DvmField,
    ) -> JniResult<JValue> {
        Err(JniError::unhandled(field.qualified()))
    }

    /// Write a static field
    fn set_static_field(
        &mut self,
        ctx: &mut dyn JniContext,
        class: &DvmClass,
        field: &DvmField,
        value: JValue,
    ) -> JniResult<()> {
        Err(JniError::unhandled(field.qualified()))
    }
}

/// A facade that models nothing; every behavior call is unhandled.
///
/// Useful for guests whose native code never calls back into the managed
/// side, and as a base case in tests.
pub struct NoopJni;

impl Jni for NoopJni {}
