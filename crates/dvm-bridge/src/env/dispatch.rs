//! Trampoline dispatch
//!
//! One arm per tagged operation family. Every arm follows the same
//! shape the trap contract dictates: read the fixed arguments out of the
//! trapped register context (argument 0 is always the table pointer and
//! is never re-read), resolve identifiers through the class pool and
//! reference tables, perform the operation — possibly through the facade
//! — and produce a typed [`RetValue`] for the caller to write back.
//!
//! Null tolerances mirror the reference ABI: `NewGlobalRef(null)` and
//! `NewStringUTF(null)` answer null, deleting a dead handle is a no-op,
//! but a call or field access on the null handle is a fatal fault, as is
//! any non-null handle that resolves to nothing.

use tracing::{debug, warn};

use dvm_sdk::{
    Arguments, DvmClass, DvmMethod, DvmObject, JValue, JavaType, Jni, JniError, Payload,
};

use crate::arm64::{CallContext, RetValue};
use crate::backend::{Backend, BackendExt};
use crate::env::{
    ArrayKind, CallForm, EnvOp, Scope, VmOp, JNI_ABORT, JNI_COMMIT, JNI_OK, JNI_TRUE,
    JNI_VERSION_1_8,
};
use crate::marshal;
use crate::vm::DalvikVm;
use crate::{BridgeError, BridgeResult};

impl DalvikVm {
    pub(crate) fn dispatch_env(
        &mut self,
        backend: &mut dyn Backend,
        jni: &mut dyn Jni,
        op: EnvOp,
        name: &'static str,
    ) -> BridgeResult<RetValue> {
        match op {
            EnvOp::GetVersion => Ok(RetValue::Int(JNI_VERSION_1_8)),

            EnvOp::FindClass => {
                let name_ptr = CallContext::new(backend).ptr_arg(1)?;
                let class_name = backend.read_c_string(name_ptr)?;
                if self.is_not_found(&class_name) {
                    debug!(class = %class_name, "FindClass -> NoClassDefFoundError");
                    self.throw_new("java/lang/NoClassDefFoundError", &class_name);
                    return Ok(RetValue::Raw(0));
                }
                let class = self.resolve_class(&class_name);
                debug!(class = %class_name, handle = format_args!("{:#x}", class.id()), "FindClass");
                Ok(RetValue::Raw(u64::from(class.id())))
            }

            EnvOp::ToReflectedMethod => {
                let (class_h, mid) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)? as u32)
                };
                let class = self.require_class(class_h)?;
                let method = class.any_method(mid).ok_or(BridgeError::UnknownMethod {
                    class: class.name().to_string(),
                    id: mid,
                })?;
                debug!(method = %method.qualified(), "ToReflectedMethod");
                let reflected_class = self.resolve_class("java/lang/reflect/Method");
                let reflected = DvmObject::new(
                    reflected_class,
                    Payload::Instance(Some(Box::new(method.clone()))),
                );
                Ok(RetValue::Raw(self.add_local_ref(&reflected)))
            }

            EnvOp::Throw => {
                let handle = CallContext::new(backend).ptr_arg(1)?;
                let throwable = self.require_object(handle, "throwable")?;
                warn!(throwable = ?throwable, "Throw");
                self.set_pending_exception(throwable);
                Ok(RetValue::Int(JNI_OK))
            }

            EnvOp::ThrowNew => {
                let (class_h, msg_ptr) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?)
                };
                let class = self.require_class(class_h)?;
                let detail = if msg_ptr == 0 {
                    String::new()
                } else {
                    backend.read_c_string(msg_ptr)?
                };
                let throwable = DvmObject::new(class, Payload::String(detail));
                warn!(throwable = ?throwable, "ThrowNew");
                self.set_pending_exception(throwable);
                Ok(RetValue::Int(JNI_OK))
            }

            EnvOp::ExceptionOccurred => {
                let pending = self.pending_exception();
                Ok(RetValue::Raw(self.vend_local(pending)))
            }

            EnvOp::ExceptionDescribe => {
                if let Some(throwable) = self.pending_exception() {
                    warn!(throwable = ?throwable, "ExceptionDescribe");
                }
                Ok(RetValue::Unit)
            }

            EnvOp::ExceptionClear => {
                self.clear_pending_exception();
                Ok(RetValue::Unit)
            }

            EnvOp::ExceptionCheck => Ok(RetValue::Boolean(self.pending_exception().is_some())),

            EnvOp::PushLocalFrame => {
                let capacity = CallContext::new(backend).int_arg(1)?;
                debug!(capacity, "PushLocalFrame");
                Ok(RetValue::Int(JNI_OK))
            }

            EnvOp::PopLocalFrame => {
                // The survivor handle passes through unchanged; local
                // frames are not scoped here (single-threaded guest).
                let survivor = CallContext::new(backend).ptr_arg(1)?;
                Ok(RetValue::Raw(survivor))
            }

            EnvOp::EnsureLocalCapacity => Ok(RetValue::Int(JNI_OK)),

            EnvOp::NewGlobalRef | EnvOp::NewWeakGlobalRef => {
                let handle = CallContext::new(backend).ptr_arg(1)?;
                if handle == 0 {
                    return Ok(RetValue::Raw(0));
                }
                let object = self.require_object(handle, "reference target")?;
                let weak = matches!(op, EnvOp::NewWeakGlobalRef);
                debug!(object = ?object, weak, "NewGlobalRef");
                Ok(RetValue::Raw(self.refs_mut().add_global(&object, weak)))
            }

            EnvOp::DeleteGlobalRef => {
                let handle = CallContext::new(backend).ptr_arg(1)?;
                if let Some(gone) = self.refs_mut().delete_global(handle) {
                    self.release_object(backend, &gone);
                }
                Ok(RetValue::Unit)
            }

            EnvOp::DeleteWeakGlobalRef => {
                let handle = CallContext::new(backend).ptr_arg(1)?;
                if let Some(gone) = self.refs_mut().delete_weak_global(handle) {
                    self.release_object(backend, &gone);
                }
                Ok(RetValue::Unit)
            }

            EnvOp::DeleteLocalRef => {
                let handle = CallContext::new(backend).ptr_arg(1)?;
                if let Some(gone) = self.refs_mut().delete_local(handle) {
                    self.release_object(backend, &gone);
                }
                Ok(RetValue::Unit)
            }

            EnvOp::IsSameObject => {
                let (h1, h2) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?)
                };
                Ok(RetValue::Boolean(self.is_same_handles(h1, h2)))
            }

            EnvOp::NewLocalRef => {
                let handle = CallContext::new(backend).ptr_arg(1)?;
                if handle == 0 {
                    return Ok(RetValue::Raw(0));
                }
                let object = self.require_object(handle, "reference target")?;
                Ok(RetValue::Raw(self.add_local_ref(&object)))
            }

            EnvOp::AllocObject => {
                let class_h = CallContext::new(backend).ptr_arg(1)?;
                let class = self.require_class(class_h)?;
                debug!(class = class.name(), "AllocObject");
                let object = jni.alloc_object(self, &class)?;
                Ok(RetValue::Raw(self.add_local_ref(&object)))
            }

            EnvOp::NewObject(form) => {
                let (class_h, mid, proto) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)? as u32, ctx.ptr_arg(3)?)
                };
                let class = self.require_class(class_h)?;
                let method = class.instance_method(mid).ok_or(BridgeError::UnknownMethod {
                    class: class.name().to_string(),
                    id: mid,
                })?;
                let mut args = self.decode_args(backend, form, &method, 3, proto)?;
                debug!(ctor = %method.qualified(), args = ?args, "NewObject");
                let object = jni.new_object(self, &class, &method, &mut args)?;
                Ok(RetValue::Raw(self.add_local_ref(&object)))
            }

            EnvOp::GetObjectClass => {
                let handle = CallContext::new(backend).ptr_arg(1)?;
                let object = self.require_object(handle, "receiver")?;
                Ok(RetValue::Raw(u64::from(object.class().id())))
            }

            EnvOp::IsInstanceOf => {
                let (obj_h, class_h) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?)
                };
                let object = self.require_object(obj_h, "instance")?;
                let class = self.require_class(class_h)?;
                Ok(RetValue::Boolean(object.class().assignable_to(&class)))
            }

            EnvOp::GetMethodId(scope) => {
                let (class_h, name_ptr, desc_ptr) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?, ctx.ptr_arg(3)?)
                };
                let class = self.require_class(class_h)?;
                let method_name = backend.read_c_string(name_ptr)?;
                let descriptor = backend.read_c_string(desc_ptr)?;
                let id = class.method_id(&method_name, &descriptor, scope == Scope::Static)?;
                debug!(
                    slot = name,
                    method = format_args!("{}->{method_name}{descriptor}", class.name()),
                    id = format_args!("{id:#x}"),
                    "method resolved"
                );
                Ok(RetValue::Raw(u64::from(id)))
            }

            EnvOp::GetFieldId(scope) => {
                let (class_h, name_ptr, desc_ptr) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?, ctx.ptr_arg(3)?)
                };
                let class = self.require_class(class_h)?;
                let field_name = backend.read_c_string(name_ptr)?;
                let descriptor = backend.read_c_string(desc_ptr)?;
                let id = class.field_id(&field_name, &descriptor, scope == Scope::Static)?;
                debug!(
                    slot = name,
                    field = format_args!("{}->{field_name}:{descriptor}", class.name()),
                    id = format_args!("{id:#x}"),
                    "field resolved"
                );
                Ok(RetValue::Raw(u64::from(id)))
            }

            EnvOp::Call { scope, form, ret } => {
                let (target_h, mid, proto) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)? as u32, ctx.ptr_arg(3)?)
                };
                let (receiver, class, method) = self.resolve_call_target(scope, target_h, mid)?;
                let mut args = self.decode_args(backend, form, &method, 3, proto)?;
                debug!(slot = name, method = %method.qualified(), args = ?args, "call");
                let value = match &receiver {
                    Some(object) => jni.call_method(self, object, &method, &mut args),
                    None => jni.call_static_method(self, &class, &method, &mut args),
                }?;
                self.coerce_return(ret, value)
            }

            EnvOp::CallNonvirtualVoid(form) => {
                let (obj_h, class_h, mid, proto) = {
                    let mut ctx = CallContext::new(backend);
                    (
                        ctx.ptr_arg(1)?,
                        ctx.ptr_arg(2)?,
                        ctx.ptr_arg(3)? as u32,
                        ctx.ptr_arg(4)?,
                    )
                };
                let receiver = self.require_object(obj_h, "receiver")?;
                let class = self.require_class(class_h)?;
                let method = class.instance_method(mid).ok_or(BridgeError::UnknownMethod {
                    class: class.name().to_string(),
                    id: mid,
                })?;
                let mut args = self.decode_args(backend, form, &method, 4, proto)?;
                debug!(method = %method.qualified(), "CallNonvirtualVoidMethod");
                // Super-constructor pattern: run the named constructor and
                // install its result into the already-vended receiver.
                let constructed = jni.new_object(self, &class, &method, &mut args)?;
                receiver.replace_payload(constructed.replace_payload(Payload::Instance(None)));
                Ok(RetValue::Unit)
            }

            EnvOp::GetField { scope, ty } => {
                let (target_h, fid) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)? as u32)
                };
                let value = match scope {
                    Scope::Instance => {
                        let object = self.require_object(target_h, "field receiver")?;
                        let field =
                            object
                                .class()
                                .instance_field(fid)
                                .ok_or(BridgeError::UnknownField {
                                    class: object.class().name().to_string(),
                                    id: fid,
                                })?;
                        debug!(slot = name, field = %field.qualified(), "get field");
                        jni.get_field(self, &object, &field)?
                    }
                    Scope::Static => {
                        let class = self.require_class(target_h)?;
                        let field = class.static_field(fid).ok_or(BridgeError::UnknownField {
                            class: class.name().to_string(),
                            id: fid,
                        })?;
                        debug!(slot = name, field = %field.qualified(), "get static field");
                        jni.get_static_field(self, &class, &field)?
                    }
                };
                self.coerce_return(ty, value)
            }

            EnvOp::SetField { scope, ty } => {
                let (target_h, fid) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)? as u32)
                };
                let value = self.read_set_value(backend, ty)?;
                match scope {
                    Scope::Instance => {
                        let object = self.require_object(target_h, "field receiver")?;
                        let field =
                            object
                                .class()
                                .instance_field(fid)
                                .ok_or(BridgeError::UnknownField {
                                    class: object.class().name().to_string(),
                                    id: fid,
                                })?;
                        debug!(slot = name, field = %field.qualified(), value = ?value, "set field");
                        jni.set_field(self, &object, &field, value)?;
                    }
                    Scope::Static => {
                        let class = self.require_class(target_h)?;
                        let field = class.static_field(fid).ok_or(BridgeError::UnknownField {
                            class: class.name().to_string(),
                            id: fid,
                        })?;
                        debug!(slot = name, field = %field.qualified(), value = ?value, "set static field");
                        jni.set_static_field(self, &class, &field, value)?;
                    }
                }
                Ok(RetValue::Unit)
            }

            EnvOp::NewString => {
                let (chars_ptr, len) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.int_arg(2)?)
                };
                if chars_ptr == 0 {
                    return Ok(RetValue::Raw(0));
                }
                let count = usize::try_from(len).map_err(|_| BridgeError::InvalidLength(len))?;
                let bytes = backend.read_bytes(chars_ptr, count * 2)?;
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                let object = {
                    let text = String::from_utf16_lossy(&units);
                    self.new_string_object(&text)
                };
                Ok(RetValue::Raw(self.add_local_ref(&object)))
            }

            EnvOp::GetStringLength => {
                let text = self.string_arg(backend)?;
                Ok(RetValue::Int(text.encode_utf16().count() as i32))
            }

            EnvOp::GetStringChars | EnvOp::GetStringCritical => {
                let (handle, is_copy) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?)
                };
                let object = self.require_object(handle, "string")?;
                let text = require_string(&object)?;
                let mut data: Vec<u8> = text
                    .encode_utf16()
                    .flat_map(|unit| unit.to_le_bytes())
                    .collect();
                data.extend_from_slice(&[0, 0]);
                let addr = self.alloc_block(backend, &object, &data, name)?;
                write_is_copy(backend, is_copy)?;
                Ok(RetValue::Raw(addr))
            }

            EnvOp::GetStringUtfLength => {
                let text = self.string_arg(backend)?;
                Ok(RetValue::Int(text.len() as i32))
            }

            EnvOp::GetStringUtfChars => {
                let (handle, is_copy) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?)
                };
                let object = self.require_object(handle, "string")?;
                let text = require_string(&object)?;
                let mut data = text.into_bytes();
                data.push(0);
                let addr = self.alloc_block(backend, &object, &data, name)?;
                write_is_copy(backend, is_copy)?;
                Ok(RetValue::Raw(addr))
            }

            EnvOp::NewStringUtf => {
                let bytes_ptr = CallContext::new(backend).ptr_arg(1)?;
                if bytes_ptr == 0 {
                    return Ok(RetValue::Raw(0));
                }
                let text = backend.read_c_string(bytes_ptr)?;
                debug!(value = %text, "NewStringUTF");
                let object = self.new_string_object(&text);
                Ok(RetValue::Raw(self.add_local_ref(&object)))
            }

            EnvOp::ReleaseStringChars
            | EnvOp::ReleaseStringUtfChars
            | EnvOp::ReleaseStringCritical => {
                let (handle, block_ptr) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?)
                };
                let object = self.require_object(handle, "string")?;
                if let Some(block) = object.take_block(block_ptr) {
                    backend.free(block.addr)?;
                }
                Ok(RetValue::Unit)
            }

            EnvOp::GetStringRegion => {
                let (handle, start, count, buf) = {
                    let mut ctx = CallContext::new(backend);
                    (
                        ctx.ptr_arg(1)?,
                        ctx.int_arg(2)?,
                        ctx.int_arg(3)?,
                        ctx.ptr_arg(4)?,
                    )
                };
                let object = self.require_object(handle, "string")?;
                let units: Vec<u16> = require_string(&object)?.encode_utf16().collect();
                let (start, count) = check_window(start, count, units.len())?;
                let bytes: Vec<u8> = units[start..start + count]
                    .iter()
                    .flat_map(|unit| unit.to_le_bytes())
                    .collect();
                backend.write_mem(buf, &bytes)?;
                Ok(RetValue::Unit)
            }

            EnvOp::GetStringUtfRegion => {
                let (handle, start, count, buf) = {
                    let mut ctx = CallContext::new(backend);
                    (
                        ctx.ptr_arg(1)?,
                        ctx.int_arg(2)?,
                        ctx.int_arg(3)?,
                        ctx.ptr_arg(4)?,
                    )
                };
                let object = self.require_object(handle, "string")?;
                let units: Vec<u16> = require_string(&object)?.encode_utf16().collect();
                let (start, count) = check_window(start, count, units.len())?;
                let text = String::from_utf16_lossy(&units[start..start + count]);
                backend.write_mem(buf, text.as_bytes())?;
                Ok(RetValue::Unit)
            }

            EnvOp::GetArrayLength => {
                let handle = CallContext::new(backend).ptr_arg(1)?;
                let object = self.require_object(handle, "array")?;
                let len = object
                    .payload()
                    .array_length()
                    .ok_or_else(|| payload_mismatch("array", &object))?;
                Ok(RetValue::Int(len as i32))
            }

            EnvOp::NewObjectArray => {
                let (len, class_h, init_h) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.int_arg(1)?, ctx.ptr_arg(2)?, ctx.ptr_arg(3)?)
                };
                let count = usize::try_from(len).map_err(|_| BridgeError::InvalidLength(len))?;
                let element_class = self.require_class(class_h)?;
                let initial = if init_h == 0 {
                    None
                } else {
                    Some(self.require_object(init_h, "initial element")?)
                };
                let object = self.new_object_array(&element_class, vec![initial; count]);
                Ok(RetValue::Raw(self.add_local_ref(&object)))
            }

            EnvOp::GetObjectArrayElement => {
                let (handle, index) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.int_arg(2)?)
                };
                let object = self.require_object(handle, "object array")?;
                let element = {
                    let payload = object.payload();
                    match &*payload {
                        Payload::ObjectArray(elements) => {
                            let (index, _) = check_window(index, 1, elements.len())?;
                            elements[index].clone()
                        }
                        other => {
                            return Err(BridgeError::PayloadMismatch {
                                expected: "object[]",
                                got: other.kind_name(),
                            })
                        }
                    }
                };
                Ok(RetValue::Raw(self.vend_local(element)))
            }

            EnvOp::SetObjectArrayElement => {
                let (handle, index, value_h) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.int_arg(2)?, ctx.ptr_arg(3)?)
                };
                let object = self.require_object(handle, "object array")?;
                let value = if value_h == 0 {
                    None
                } else {
                    Some(self.require_object(value_h, "array element")?)
                };
                let mut payload = object.payload_mut();
                match &mut *payload {
                    Payload::ObjectArray(elements) => {
                        let (index, _) = check_window(index, 1, elements.len())?;
                        elements[index] = value;
                        Ok(RetValue::Unit)
                    }
                    other => Err(BridgeError::PayloadMismatch {
                        expected: "object[]",
                        got: other.kind_name(),
                    }),
                }
            }

            EnvOp::NewArray(kind) => {
                let len = CallContext::new(backend).int_arg(1)?;
                let count = usize::try_from(len).map_err(|_| BridgeError::InvalidLength(len))?;
                let payload = match kind {
                    ArrayKind::Byte => Payload::ByteArray(vec![0; count]),
                    ArrayKind::Short => Payload::ShortArray(vec![0; count]),
                    ArrayKind::Int => Payload::IntArray(vec![0; count]),
                    ArrayKind::Double => Payload::DoubleArray(vec![0.0; count]),
                };
                debug!(slot = name, len = count, "new primitive array");
                let object = self.new_array_object(payload);
                Ok(RetValue::Raw(self.add_local_ref(&object)))
            }

            EnvOp::GetArrayElements(kind) => {
                let (handle, is_copy) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?)
                };
                let object = self.require_object(handle, "array")?;
                let addr = self.vend_elements(backend, &object, kind, name)?;
                write_is_copy(backend, is_copy)?;
                Ok(RetValue::Raw(addr))
            }

            EnvOp::ReleaseArrayElements(kind) => {
                let (handle, block_ptr, mode) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?, ctx.int_arg(3)?)
                };
                let object = self.require_object(handle, "array")?;
                self.release_elements(backend, &object, kind, block_ptr, mode)?;
                Ok(RetValue::Unit)
            }

            EnvOp::GetPrimitiveArrayCritical => {
                let (handle, is_copy) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?)
                };
                let object = self.require_object(handle, "array")?;
                let kind = dynamic_kind(&object)?;
                let addr = self.vend_elements(backend, &object, kind, name)?;
                write_is_copy(backend, is_copy)?;
                Ok(RetValue::Raw(addr))
            }

            EnvOp::ReleasePrimitiveArrayCritical => {
                let (handle, block_ptr, mode) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?, ctx.int_arg(3)?)
                };
                let object = self.require_object(handle, "array")?;
                let kind = dynamic_kind(&object)?;
                self.release_elements(backend, &object, kind, block_ptr, mode)?;
                Ok(RetValue::Unit)
            }

            EnvOp::GetArrayRegion(kind) => {
                let (handle, start, count, buf) = {
                    let mut ctx = CallContext::new(backend);
                    (
                        ctx.ptr_arg(1)?,
                        ctx.int_arg(2)?,
                        ctx.int_arg(3)?,
                        ctx.ptr_arg(4)?,
                    )
                };
                let object = self.require_object(handle, "array")?;
                let len = array_len(&object, kind)?;
                let (start, count) = check_window(start, count, len)?;
                let bytes = window_bytes(&object, kind, start, count)?;
                backend.write_mem(buf, &bytes)?;
                Ok(RetValue::Unit)
            }

            EnvOp::SetArrayRegion(kind) => {
                let (handle, start, count, buf) = {
                    let mut ctx = CallContext::new(backend);
                    (
                        ctx.ptr_arg(1)?,
                        ctx.int_arg(2)?,
                        ctx.int_arg(3)?,
                        ctx.ptr_arg(4)?,
                    )
                };
                let object = self.require_object(handle, "array")?;
                let len = array_len(&object, kind)?;
                let (start, count) = check_window(start, count, len)?;
                let bytes = backend.read_bytes(buf, count * kind.elem_size())?;
                write_window(&object, kind, start, &bytes)?;
                Ok(RetValue::Unit)
            }

            EnvOp::RegisterNatives => {
                let (class_h, records, count) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.ptr_arg(2)?, ctx.int_arg(3)?)
                };
                let class = self.require_class(class_h)?;
                for index in 0..count.max(0) as u64 {
                    // Fixed-stride records: name, descriptor, function.
                    let record = records + index * 24;
                    let method_name = {
                        let ptr = backend.read_u64(record)?;
                        backend.read_c_string(ptr)?
                    };
                    let descriptor = {
                        let ptr = backend.read_u64(record + 8)?;
                        backend.read_c_string(ptr)?
                    };
                    let fn_ptr = backend.read_u64(record + 16)?;
                    debug!(
                        class = class.name(),
                        method = format_args!("{method_name}{descriptor}"),
                        fn_ptr = format_args!("{fn_ptr:#x}"),
                        "RegisterNatives"
                    );
                    class.bind_native(&method_name, &descriptor, fn_ptr);
                }
                Ok(RetValue::Int(JNI_OK))
            }

            EnvOp::GetJavaVm => {
                let out = CallContext::new(backend).ptr_arg(1)?;
                let java_vm = self.java_vm_ptr();
                backend.write_u64(out, java_vm)?;
                Ok(RetValue::Int(JNI_OK))
            }

            EnvOp::GetObjectRefType => {
                let handle = CallContext::new(backend).ptr_arg(1)?;
                Ok(RetValue::Int(self.ref_kind(handle) as i32))
            }
        }
    }

    pub(crate) fn dispatch_vm(
        &mut self,
        backend: &mut dyn Backend,
        op: VmOp,
    ) -> BridgeResult<RetValue> {
        match op {
            VmOp::AttachCurrentThread | VmOp::AttachCurrentThreadAsDaemon => {
                // One shared environment for the whole process; every
                // attach answers the same pointer.
                let env_out = CallContext::new(backend).ptr_arg(1)?;
                let env = self.env_ptr();
                backend.write_u64(env_out, env)?;
                Ok(RetValue::Int(JNI_OK))
            }
            VmOp::DetachCurrentThread => Ok(RetValue::Int(JNI_OK)),
            VmOp::GetEnv => {
                let (env_out, version) = {
                    let mut ctx = CallContext::new(backend);
                    (ctx.ptr_arg(1)?, ctx.int_arg(2)?)
                };
                debug!(version = format_args!("{version:#x}"), "GetEnv");
                let env = self.env_ptr();
                backend.write_u64(env_out, env)?;
                Ok(RetValue::Int(JNI_OK))
            }
        }
    }

    // ========================================================================
    // Shared decode/invoke plumbing
    // ========================================================================

    fn require_object(&self, handle: u64, what: &'static str) -> BridgeResult<DvmObject> {
        if handle == 0 {
            return Err(BridgeError::NullHandle { expected: what });
        }
        self.lookup_object(handle)
            .ok_or(BridgeError::StaleHandle { handle })
    }

    fn require_class(&self, handle: u64) -> BridgeResult<DvmClass> {
        if handle == 0 {
            return Err(BridgeError::NullHandle { expected: "class" });
        }
        self.class_by_handle(handle)
            .ok_or(BridgeError::UnknownClass { handle })
    }

    fn resolve_call_target(
        &self,
        scope: Scope,
        handle: u64,
        mid: u32,
    ) -> BridgeResult<(Option<DvmObject>, DvmClass, DvmMethod)> {
        match scope {
            Scope::Instance => {
                let object = self.require_object(handle, "method receiver")?;
                let class = object.class().clone();
                let method = class.instance_method(mid).ok_or(BridgeError::UnknownMethod {
                    class: class.name().to_string(),
                    id: mid,
                })?;
                Ok((Some(object), class, method))
            }
            Scope::Static => {
                let class = self.require_class(handle)?;
                let method = class.static_method(mid).ok_or(BridgeError::UnknownMethod {
                    class: class.name().to_string(),
                    id: mid,
                })?;
                Ok((None, class, method))
            }
        }
    }

    fn decode_args(
        &mut self,
        backend: &mut dyn Backend,
        form: CallForm,
        method: &DvmMethod,
        fixed_gprs: usize,
        proto_ptr: u64,
    ) -> BridgeResult<Arguments> {
        let sig = method.signature();
        match form {
            CallForm::Fixed => marshal::from_registers(self, backend, sig, fixed_gprs),
            CallForm::VaList => marshal::from_va_list(self, backend, sig, proto_ptr),
            CallForm::Array => marshal::from_jvalue_array(self, backend, sig, proto_ptr),
        }
    }

    /// Coerce a facade result to the slot's declared return kind
    fn coerce_return(&mut self, expect: JavaType, value: JValue) -> BridgeResult<RetValue> {
        Ok(match (expect, value) {
            (JavaType::Void, _) => RetValue::Unit,
            (JavaType::Boolean, JValue::Boolean(v)) => RetValue::Boolean(v),
            (JavaType::Byte, JValue::Byte(v)) => RetValue::Byte(v),
            (JavaType::Char, JValue::Char(v)) => RetValue::Char(v),
            (JavaType::Short, JValue::Short(v)) => RetValue::Short(v),
            (JavaType::Int, JValue::Int(v)) => RetValue::Int(v),
            (JavaType::Long, JValue::Long(v)) => RetValue::Long(v),
            (JavaType::Float, JValue::Float(v)) => RetValue::Float(v),
            (JavaType::Double, JValue::Double(v)) => RetValue::Double(v),
            (JavaType::Reference, JValue::Object(object)) => {
                RetValue::Raw(self.vend_local(object))
            }
            (expect, got) => {
                return Err(JniError::mismatch(expect.name(), got.kind().name()).into())
            }
        })
    }

    /// Read a `Set*Field` value: the 4th logical argument, from the FP
    /// file for floating kinds per the call convention
    fn read_set_value(&self, backend: &mut dyn Backend, ty: JavaType) -> BridgeResult<JValue> {
        match ty {
            JavaType::Float => {
                let lanes = backend.read_vector(0)?;
                Ok(JValue::Float(f32::from_le_bytes(
                    lanes[..4].try_into().unwrap(),
                )))
            }
            JavaType::Double => {
                let lanes = backend.read_vector(0)?;
                Ok(JValue::Double(f64::from_le_bytes(
                    lanes[..8].try_into().unwrap(),
                )))
            }
            _ => {
                let word = CallContext::new(backend).long_arg(3)?;
                marshal::decode_word(self, ty, word)
            }
        }
    }

    fn string_arg(&self, backend: &mut dyn Backend) -> BridgeResult<String> {
        let handle = CallContext::new(backend).ptr_arg(1)?;
        let object = self.require_object(handle, "string")?;
        require_string(&object)
    }

    /// Copy `data` into a fresh guest block recorded on `object`
    fn alloc_block(
        &mut self,
        backend: &mut dyn Backend,
        object: &DvmObject,
        data: &[u8],
        label: &str,
    ) -> BridgeResult<u64> {
        let addr = backend.allocate(data.len(), label)?;
        backend.write_mem(addr, data)?;
        object.push_block(dvm_sdk::MemoryBlock {
            addr,
            size: data.len(),
        });
        Ok(addr)
    }

    fn vend_elements(
        &mut self,
        backend: &mut dyn Backend,
        object: &DvmObject,
        kind: ArrayKind,
        label: &str,
    ) -> BridgeResult<u64> {
        let len = array_len(object, kind)?;
        let bytes = window_bytes(object, kind, 0, len)?;
        self.alloc_block(backend, object, &bytes, label)
    }

    fn release_elements(
        &mut self,
        backend: &mut dyn Backend,
        object: &DvmObject,
        kind: ArrayKind,
        block_ptr: u64,
        mode: i32,
    ) -> BridgeResult<()> {
        let Some(block) = object.take_block(block_ptr) else {
            // Releasing a buffer this object never vended is a no-op.
            return Ok(());
        };
        if mode != JNI_ABORT {
            let bytes = backend.read_bytes(block.addr, block.size)?;
            write_window(object, kind, 0, &bytes)?;
        }
        if mode == JNI_COMMIT {
            object.push_block(block);
        } else {
            backend.free(block.addr)?;
        }
        Ok(())
    }
}

fn require_string(object: &DvmObject) -> BridgeResult<String> {
    object
        .string_value()
        .ok_or_else(|| payload_mismatch("string", object))
}

fn payload_mismatch(expected: &'static str, object: &DvmObject) -> BridgeError {
    BridgeError::PayloadMismatch {
        expected,
        got: object.payload().kind_name(),
    }
}

fn write_is_copy(backend: &mut dyn Backend, is_copy_ptr: u64) -> BridgeResult<()> {
    if is_copy_ptr != 0 {
        backend.write_u32(is_copy_ptr, JNI_TRUE as u32)?;
    }
    Ok(())
}

/// Validate a `[start, start+count)` window against a value of `len`
/// elements, converting to usize
fn check_window(start: i32, count: i32, len: usize) -> BridgeResult<(usize, usize)> {
    let out_of_bounds = BridgeError::OutOfBounds {
        start: start.max(0) as usize,
        count: count.max(0) as usize,
        len,
    };
    if start < 0 || count < 0 {
        return Err(out_of_bounds);
    }
    let (start, count) = (start as usize, count as usize);
    match start.checked_add(count) {
        Some(end) if end <= len => Ok((start, count)),
        _ => Err(out_of_bounds),
    }
}

fn array_len(object: &DvmObject, kind: ArrayKind) -> BridgeResult<usize> {
    let payload = object.payload();
    match (kind, &*payload) {
        (ArrayKind::Byte, Payload::ByteArray(v)) => Ok(v.len()),
        (ArrayKind::Short, Payload::ShortArray(v)) => Ok(v.len()),
        (ArrayKind::Int, Payload::IntArray(v)) => Ok(v.len()),
        (ArrayKind::Double, Payload::DoubleArray(v)) => Ok(v.len()),
        (kind, other) => Err(BridgeError::PayloadMismatch {
            expected: kind_name(kind),
            got: other.kind_name(),
        }),
    }
}

/// Element window encoded as little-endian guest bytes
fn window_bytes(
    object: &DvmObject,
    kind: ArrayKind,
    start: usize,
    count: usize,
) -> BridgeResult<Vec<u8>> {
    let payload = object.payload();
    match (kind, &*payload) {
        (ArrayKind::Byte, Payload::ByteArray(v)) => Ok(v[start..start + count].to_vec()),
        (ArrayKind::Short, Payload::ShortArray(v)) => Ok(v[start..start + count]
            .iter()
            .flat_map(|e| e.to_le_bytes())
            .collect()),
        (ArrayKind::Int, Payload::IntArray(v)) => Ok(v[start..start + count]
            .iter()
            .flat_map(|e| e.to_le_bytes())
            .collect()),
        (ArrayKind::Double, Payload::DoubleArray(v)) => Ok(v[start..start + count]
            .iter()
            .flat_map(|e| e.to_le_bytes())
            .collect()),
        (kind, other) => Err(BridgeError::PayloadMismatch {
            expected: kind_name(kind),
            got: other.kind_name(),
        }),
    }
}

/// Decode little-endian guest bytes into an element window
fn write_window(
    object: &DvmObject,
    kind: ArrayKind,
    start: usize,
    bytes: &[u8],
) -> BridgeResult<()> {
    let mut payload = object.payload_mut();
    match (kind, &mut *payload) {
        (ArrayKind::Byte, Payload::ByteArray(v)) => {
            for (slot, &b) in v[start..].iter_mut().zip(bytes) {
                *slot = b;
            }
        }
        (ArrayKind::Short, Payload::ShortArray(v)) => {
            for (slot, pair) in v[start..].iter_mut().zip(bytes.chunks_exact(2)) {
                *slot = i16::from_le_bytes([pair[0], pair[1]]);
            }
        }
        (ArrayKind::Int, Payload::IntArray(v)) => {
            for (slot, quad) in v[start..].iter_mut().zip(bytes.chunks_exact(4)) {
                *slot = i32::from_le_bytes(quad.try_into().unwrap());
            }
        }
        (ArrayKind::Double, Payload::DoubleArray(v)) => {
            for (slot, oct) in v[start..].iter_mut().zip(bytes.chunks_exact(8)) {
                *slot = f64::from_le_bytes(oct.try_into().unwrap());
            }
        }
        (kind, other) => {
            return Err(BridgeError::PayloadMismatch {
                expected: kind_name(kind),
                got: other.kind_name(),
            })
        }
    }
    Ok(())
}

/// The element kind backing a critical-section access
fn dynamic_kind(object: &DvmObject) -> BridgeResult<ArrayKind> {
    let payload = object.payload();
    match &*payload {
        Payload::ByteArray(_) => Ok(ArrayKind::Byte),
        Payload::ShortArray(_) => Ok(ArrayKind::Short),
        Payload::IntArray(_) => Ok(ArrayKind::Int),
        Payload::DoubleArray(_) => Ok(ArrayKind::Double),
        other => Err(BridgeError::PayloadMismatch {
            expected: "primitive array",
            got: other.kind_name(),
        }),
    }
}

fn kind_name(kind: ArrayKind) -> &'static str {
    match kind {
        ArrayKind::Byte => "byte[]",
        ArrayKind::Short => "short[]",
        ArrayKind::Int => "int[]",
        ArrayKind::Double => "double[]",
    }
}
