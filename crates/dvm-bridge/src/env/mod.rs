//! Guest-visible function tables
//!
//! Two pointer-slot tables reproduce the target ABI's struct layout
//! bit-for-bit: the `JNIEnv` function table (0xE9 pointer slots) and the
//! 8-slot `JavaVM` invoke interface. Guest code computes call targets
//! purely as `*env + compile-time-offset`, so the populated offsets below
//! are an external compatibility contract, not a design choice.
//!
//! Every slot is default-initialized to its own byte offset. An
//! unimplemented entry therefore faults at a small, recognizable address
//! that names the slot ([`DalvikVm::explain_fault`] decodes it).
//!
//! Populated slots hold synthetic supervisor-call addresses obtained from
//! the backend; executing one lands in [`DalvikVm::handle_trap`], which
//! looks the address back up here and runs the slot's operation.
//!
//! [`DalvikVm::explain_fault`]: crate::vm::DalvikVm::explain_fault
//! [`DalvikVm::handle_trap`]: crate::vm::DalvikVm::handle_trap

pub(crate) mod dispatch;

use rustc_hash::FxHashMap;

use dvm_sdk::JavaType;

use crate::backend::{Backend, BackendExt};
use crate::BridgeResult;

/// `JNI_OK`
pub const JNI_OK: i32 = 0;
/// `JNI_TRUE`
pub const JNI_TRUE: u64 = 1;
/// `JNI_FALSE`
pub const JNI_FALSE: u64 = 0;
/// Version reported by `GetVersion` (JNI 1.8)
pub const JNI_VERSION_1_8: i32 = 0x0001_0008;
/// `JNI_COMMIT` release mode: copy back, keep the buffer
pub const JNI_COMMIT: i32 = 1;
/// `JNI_ABORT` release mode: free the buffer, discard changes
pub const JNI_ABORT: i32 = 2;

/// Pointer slots in the `JNIEnv` function table
pub const ENV_SLOT_COUNT: usize = 0xE9;
/// Pointer slots in the `JavaVM` invoke interface
pub const VM_SLOT_COUNT: usize = 8;

/// Whether a member operation targets an instance or the class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Instance member; argument 1 is the receiver handle
    Instance,
    /// Static member; argument 1 is the class handle
    Static,
}

/// The three argument-passing protocols (`...`, `V`, `A` entry families)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallForm {
    /// Live registers with stack spill
    Fixed,
    /// Guest-memory `va_list` cursor
    VaList,
    /// Packed `jvalue` array
    Array,
}

/// Primitive array element kinds the bridge plumbs directly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    /// `byte[]`
    Byte,
    /// `short[]`
    Short,
    /// `int[]`
    Int,
    /// `double[]`
    Double,
}

impl ArrayKind {
    /// Element width in guest memory
    pub fn elem_size(self) -> usize {
        match self {
            ArrayKind::Byte => 1,
            ArrayKind::Short => 2,
            ArrayKind::Int => 4,
            ArrayKind::Double => 8,
        }
    }
}

/// The closed set of `JNIEnv` table operations.
///
/// Families that differ only in scope, protocol or declared type collapse
/// into one tagged variant; the dispatcher owns each family's decode and
/// invoke logic in a single place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvOp {
    GetVersion,
    FindClass,
    ToReflectedMethod,
    Throw,
    ThrowNew,
    ExceptionOccurred,
    ExceptionDescribe,
    ExceptionClear,
    PushLocalFrame,
    PopLocalFrame,
    NewGlobalRef,
    DeleteGlobalRef,
    DeleteLocalRef,
    IsSameObject,
    NewLocalRef,
    EnsureLocalCapacity,
    AllocObject,
    NewObject(CallForm),
    GetObjectClass,
    IsInstanceOf,
    GetMethodId(Scope),
    Call {
        scope: Scope,
        form: CallForm,
        ret: JavaType,
    },
    CallNonvirtualVoid(CallForm),
    GetFieldId(Scope),
    GetField {
        scope: Scope,
        ty: JavaType,
    },
    SetField {
        scope: Scope,
        ty: JavaType,
    },
    NewString,
    GetStringLength,
    GetStringChars,
    ReleaseStringChars,
    NewStringUtf,
    GetStringUtfLength,
    GetStringUtfChars,
    ReleaseStringUtfChars,
    GetArrayLength,
    NewObjectArray,
    GetObjectArrayElement,
    SetObjectArrayElement,
    NewArray(ArrayKind),
    GetArrayElements(ArrayKind),
    ReleaseArrayElements(ArrayKind),
    GetArrayRegion(ArrayKind),
    SetArrayRegion(ArrayKind),
    RegisterNatives,
    GetJavaVm,
    GetStringRegion,
    GetStringUtfRegion,
    GetPrimitiveArrayCritical,
    ReleasePrimitiveArrayCritical,
    GetStringCritical,
    ReleaseStringCritical,
    NewWeakGlobalRef,
    DeleteWeakGlobalRef,
    ExceptionCheck,
    GetObjectRefType,
}

/// Operations behind the `JavaVM` invoke interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOp {
    AttachCurrentThread,
    DetachCurrentThread,
    GetEnv,
    AttachCurrentThreadAsDaemon,
}

/// Which table a trapped slot belongs to
#[derive(Debug, Clone, Copy)]
pub(crate) enum TableOp {
    Env(EnvOp),
    Vm(VmOp),
}

/// One registered trampoline: its table offset, printable name, and
/// tagged operation
#[derive(Debug, Clone, Copy)]
pub(crate) struct Slot {
    pub offset: u64,
    pub name: &'static str,
    pub op: TableOp,
}

/// Populated `JNIEnv` slots at their canonical ARM64 byte offsets.
///
/// A different guest pointer width or ABI revision needs that revision's
/// published offsets; these are compile-time constants in guest binaries.
#[rustfmt::skip]
pub(crate) const ENV_SLOTS: &[(u64, &str, EnvOp)] = &[
    (0x020, "GetVersion",                    EnvOp::GetVersion),
    (0x030, "FindClass",                     EnvOp::FindClass),
    (0x048, "ToReflectedMethod",             EnvOp::ToReflectedMethod),
    (0x068, "Throw",                         EnvOp::Throw),
    (0x070, "ThrowNew",                      EnvOp::ThrowNew),
    (0x078, "ExceptionOccurred",             EnvOp::ExceptionOccurred),
    (0x080, "ExceptionDescribe",             EnvOp::ExceptionDescribe),
    (0x088, "ExceptionClear",                EnvOp::ExceptionClear),
    (0x098, "PushLocalFrame",                EnvOp::PushLocalFrame),
    (0x0A0, "PopLocalFrame",                 EnvOp::PopLocalFrame),
    (0x0A8, "NewGlobalRef",                  EnvOp::NewGlobalRef),
    (0x0B0, "DeleteGlobalRef",               EnvOp::DeleteGlobalRef),
    (0x0B8, "DeleteLocalRef",                EnvOp::DeleteLocalRef),
    (0x0C0, "IsSameObject",                  EnvOp::IsSameObject),
    (0x0C8, "NewLocalRef",                   EnvOp::NewLocalRef),
    (0x0D0, "EnsureLocalCapacity",           EnvOp::EnsureLocalCapacity),
    (0x0D8, "AllocObject",                   EnvOp::AllocObject),
    (0x0E0, "NewObject",                     EnvOp::NewObject(CallForm::Fixed)),
    (0x0E8, "NewObjectV",                    EnvOp::NewObject(CallForm::VaList)),
    (0x0F0, "NewObjectA",                    EnvOp::NewObject(CallForm::Array)),
    (0x0F8, "GetObjectClass",                EnvOp::GetObjectClass),
    (0x100, "IsInstanceOf",                  EnvOp::IsInstanceOf),
    (0x108, "GetMethodID",                   EnvOp::GetMethodId(Scope::Instance)),
    (0x110, "CallObjectMethod",              EnvOp::Call { scope: Scope::Instance, form: CallForm::Fixed,  ret: JavaType::Reference }),
    (0x118, "CallObjectMethodV",             EnvOp::Call { scope: Scope::Instance, form: CallForm::VaList, ret: JavaType::Reference }),
    (0x120, "CallObjectMethodA",             EnvOp::Call { scope: Scope::Instance, form: CallForm::Array,  ret: JavaType::Reference }),
    (0x128, "CallBooleanMethod",             EnvOp::Call { scope: Scope::Instance, form: CallForm::Fixed,  ret: JavaType::Boolean }),
    (0x130, "CallBooleanMethodV",            EnvOp::Call { scope: Scope::Instance, form: CallForm::VaList, ret: JavaType::Boolean }),
    (0x138, "CallBooleanMethodA",            EnvOp::Call { scope: Scope::Instance, form: CallForm::Array,  ret: JavaType::Boolean }),
    (0x148, "CallByteMethodV",               EnvOp::Call { scope: Scope::Instance, form: CallForm::VaList, ret: JavaType::Byte }),
    (0x178, "CallShortMethodV",              EnvOp::Call { scope: Scope::Instance, form: CallForm::VaList, ret: JavaType::Short }),
    (0x188, "CallIntMethod",                 EnvOp::Call { scope: Scope::Instance, form: CallForm::Fixed,  ret: JavaType::Int }),
    (0x190, "CallIntMethodV",                EnvOp::Call { scope: Scope::Instance, form: CallForm::VaList, ret: JavaType::Int }),
    (0x198, "CallIntMethodA",                EnvOp::Call { scope: Scope::Instance, form: CallForm::Array,  ret: JavaType::Int }),
    (0x1A0, "CallLongMethod",                EnvOp::Call { scope: Scope::Instance, form: CallForm::Fixed,  ret: JavaType::Long }),
    (0x1A8, "CallLongMethodV",               EnvOp::Call { scope: Scope::Instance, form: CallForm::VaList, ret: JavaType::Long }),
    (0x1C0, "CallFloatMethodV",              EnvOp::Call { scope: Scope::Instance, form: CallForm::VaList, ret: JavaType::Float }),
    (0x1D0, "CallDoubleMethod",              EnvOp::Call { scope: Scope::Instance, form: CallForm::Fixed,  ret: JavaType::Double }),
    (0x1E8, "CallVoidMethod",                EnvOp::Call { scope: Scope::Instance, form: CallForm::Fixed,  ret: JavaType::Void }),
    (0x1F0, "CallVoidMethodV",               EnvOp::Call { scope: Scope::Instance, form: CallForm::VaList, ret: JavaType::Void }),
    (0x1F8, "CallVoidMethodA",               EnvOp::Call { scope: Scope::Instance, form: CallForm::Array,  ret: JavaType::Void }),
    (0x2E0, "CallNonvirtualVoidMethodV",     EnvOp::CallNonvirtualVoid(CallForm::VaList)),
    (0x2F0, "GetFieldID",                    EnvOp::GetFieldId(Scope::Instance)),
    (0x2F8, "GetObjectField",                EnvOp::GetField { scope: Scope::Instance, ty: JavaType::Reference }),
    (0x300, "GetBooleanField",               EnvOp::GetField { scope: Scope::Instance, ty: JavaType::Boolean }),
    (0x320, "GetIntField",                   EnvOp::GetField { scope: Scope::Instance, ty: JavaType::Int }),
    (0x328, "GetLongField",                  EnvOp::GetField { scope: Scope::Instance, ty: JavaType::Long }),
    (0x330, "GetFloatField",                 EnvOp::GetField { scope: Scope::Instance, ty: JavaType::Float }),
    (0x340, "SetObjectField",                EnvOp::SetField { scope: Scope::Instance, ty: JavaType::Reference }),
    (0x348, "SetBooleanField",               EnvOp::SetField { scope: Scope::Instance, ty: JavaType::Boolean }),
    (0x368, "SetIntField",                   EnvOp::SetField { scope: Scope::Instance, ty: JavaType::Int }),
    (0x370, "SetLongField",                  EnvOp::SetField { scope: Scope::Instance, ty: JavaType::Long }),
    (0x380, "SetDoubleField",                EnvOp::SetField { scope: Scope::Instance, ty: JavaType::Double }),
    (0x388, "GetStaticMethodID",             EnvOp::GetMethodId(Scope::Static)),
    (0x390, "CallStaticObjectMethod",        EnvOp::Call { scope: Scope::Static, form: CallForm::Fixed,  ret: JavaType::Reference }),
    (0x398, "CallStaticObjectMethodV",       EnvOp::Call { scope: Scope::Static, form: CallForm::VaList, ret: JavaType::Reference }),
    (0x3A0, "CallStaticObjectMethodA",       EnvOp::Call { scope: Scope::Static, form: CallForm::Array,  ret: JavaType::Reference }),
    (0x3A8, "CallStaticBooleanMethod",       EnvOp::Call { scope: Scope::Static, form: CallForm::Fixed,  ret: JavaType::Boolean }),
    (0x3B0, "CallStaticBooleanMethodV",      EnvOp::Call { scope: Scope::Static, form: CallForm::VaList, ret: JavaType::Boolean }),
    (0x408, "CallStaticIntMethod",           EnvOp::Call { scope: Scope::Static, form: CallForm::Fixed,  ret: JavaType::Int }),
    (0x410, "CallStaticIntMethodV",          EnvOp::Call { scope: Scope::Static, form: CallForm::VaList, ret: JavaType::Int }),
    (0x418, "CallStaticIntMethodA",          EnvOp::Call { scope: Scope::Static, form: CallForm::Array,  ret: JavaType::Int }),
    (0x420, "CallStaticLongMethod",          EnvOp::Call { scope: Scope::Static, form: CallForm::Fixed,  ret: JavaType::Long }),
    (0x428, "CallStaticLongMethodV",         EnvOp::Call { scope: Scope::Static, form: CallForm::VaList, ret: JavaType::Long }),
    (0x438, "CallStaticFloatMethod",         EnvOp::Call { scope: Scope::Static, form: CallForm::Fixed,  ret: JavaType::Float }),
    (0x458, "CallStaticDoubleMethodV",       EnvOp::Call { scope: Scope::Static, form: CallForm::VaList, ret: JavaType::Double }),
    (0x468, "CallStaticVoidMethod",          EnvOp::Call { scope: Scope::Static, form: CallForm::Fixed,  ret: JavaType::Void }),
    (0x470, "CallStaticVoidMethodV",         EnvOp::Call { scope: Scope::Static, form: CallForm::VaList, ret: JavaType::Void }),
    (0x478, "CallStaticVoidMethodA",         EnvOp::Call { scope: Scope::Static, form: CallForm::Array,  ret: JavaType::Void }),
    (0x480, "GetStaticFieldID",              EnvOp::GetFieldId(Scope::Static)),
    (0x488, "GetStaticObjectField",          EnvOp::GetField { scope: Scope::Static, ty: JavaType::Reference }),
    (0x490, "GetStaticBooleanField",         EnvOp::GetField { scope: Scope::Static, ty: JavaType::Boolean }),
    (0x4B0, "GetStaticIntField",             EnvOp::GetField { scope: Scope::Static, ty: JavaType::Int }),
    (0x4B8, "GetStaticLongField",            EnvOp::GetField { scope: Scope::Static, ty: JavaType::Long }),
    (0x4F8, "SetStaticIntField",             EnvOp::SetField { scope: Scope::Static, ty: JavaType::Int }),
    (0x500, "SetStaticLongField",            EnvOp::SetField { scope: Scope::Static, ty: JavaType::Long }),
    (0x518, "NewString",                     EnvOp::NewString),
    (0x520, "GetStringLength",               EnvOp::GetStringLength),
    (0x528, "GetStringChars",                EnvOp::GetStringChars),
    (0x530, "ReleaseStringChars",            EnvOp::ReleaseStringChars),
    (0x538, "NewStringUTF",                  EnvOp::NewStringUtf),
    (0x540, "GetStringUTFLength",            EnvOp::GetStringUtfLength),
    (0x548, "GetStringUTFChars",             EnvOp::GetStringUtfChars),
    (0x550, "ReleaseStringUTFChars",         EnvOp::ReleaseStringUtfChars),
    (0x558, "GetArrayLength",                EnvOp::GetArrayLength),
    (0x560, "NewObjectArray",                EnvOp::NewObjectArray),
    (0x568, "GetObjectArrayElement",         EnvOp::GetObjectArrayElement),
    (0x570, "SetObjectArrayElement",         EnvOp::SetObjectArrayElement),
    (0x580, "NewByteArray",                  EnvOp::NewArray(ArrayKind::Byte)),
    (0x590, "NewShortArray",                 EnvOp::NewArray(ArrayKind::Short)),
    (0x598, "NewIntArray",                   EnvOp::NewArray(ArrayKind::Int)),
    (0x5B0, "NewDoubleArray",                EnvOp::NewArray(ArrayKind::Double)),
    (0x5C0, "GetByteArrayElements",          EnvOp::GetArrayElements(ArrayKind::Byte)),
    (0x5D8, "GetIntArrayElements",           EnvOp::GetArrayElements(ArrayKind::Int)),
    (0x600, "ReleaseByteArrayElements",      EnvOp::ReleaseArrayElements(ArrayKind::Byte)),
    (0x618, "ReleaseIntArrayElements",       EnvOp::ReleaseArrayElements(ArrayKind::Int)),
    (0x640, "GetByteArrayRegion",            EnvOp::GetArrayRegion(ArrayKind::Byte)),
    (0x650, "GetShortArrayRegion",           EnvOp::GetArrayRegion(ArrayKind::Short)),
    (0x670, "GetDoubleArrayRegion",          EnvOp::GetArrayRegion(ArrayKind::Double)),
    (0x680, "SetByteArrayRegion",            EnvOp::SetArrayRegion(ArrayKind::Byte)),
    (0x698, "SetIntArrayRegion",             EnvOp::SetArrayRegion(ArrayKind::Int)),
    (0x6B0, "SetDoubleArrayRegion",          EnvOp::SetArrayRegion(ArrayKind::Double)),
    (0x6B8, "RegisterNatives",               EnvOp::RegisterNatives),
    (0x6D8, "GetJavaVM",                     EnvOp::GetJavaVm),
    (0x6E0, "GetStringRegion",               EnvOp::GetStringRegion),
    (0x6E8, "GetStringUTFRegion",            EnvOp::GetStringUtfRegion),
    (0x6F0, "GetPrimitiveArrayCritical",     EnvOp::GetPrimitiveArrayCritical),
    (0x6F8, "ReleasePrimitiveArrayCritical", EnvOp::ReleasePrimitiveArrayCritical),
    (0x700, "GetStringCritical",             EnvOp::GetStringCritical),
    (0x708, "ReleaseStringCritical",         EnvOp::ReleaseStringCritical),
    (0x710, "NewWeakGlobalRef",              EnvOp::NewWeakGlobalRef),
    (0x718, "DeleteWeakGlobalRef",           EnvOp::DeleteWeakGlobalRef),
    (0x720, "ExceptionCheck",                EnvOp::ExceptionCheck),
    (0x740, "GetObjectRefType",              EnvOp::GetObjectRefType),
];

/// Populated `JavaVM` invoke-interface slots (pointer-size × index)
#[rustfmt::skip]
pub(crate) const VM_SLOTS: &[(u64, &str, VmOp)] = &[
    (0x20, "AttachCurrentThread",         VmOp::AttachCurrentThread),
    (0x28, "DetachCurrentThread",         VmOp::DetachCurrentThread),
    (0x30, "GetEnv",                      VmOp::GetEnv),
    (0x38, "AttachCurrentThreadAsDaemon", VmOp::AttachCurrentThreadAsDaemon),
];

/// Guest addresses of the constructed tables
#[derive(Debug, Clone, Copy)]
pub struct JniTables {
    /// `JNIEnv*` handed to guest natives (points at the function table)
    pub env: u64,
    /// `JavaVM*` (points at the invoke interface)
    pub java_vm: u64,
    /// The `JNIEnv` function table itself
    pub env_impl: u64,
    /// The invoke interface table itself
    pub invoke_impl: u64,
}

/// Allocate and populate both tables, returning the trap registry
pub(crate) fn build_tables(
    backend: &mut dyn Backend,
) -> BridgeResult<(JniTables, FxHashMap<u64, Slot>)> {
    let mut traps = FxHashMap::default();

    let env_impl = backend.allocate(ENV_SLOT_COUNT * 8, "JNIEnv.impl")?;
    for index in 0..ENV_SLOT_COUNT {
        let offset = (index * 8) as u64;
        backend.write_u64(env_impl + offset, offset)?;
    }
    for &(offset, name, op) in ENV_SLOTS {
        let svc = backend.register_svc(name)?;
        backend.write_u64(env_impl + offset, svc)?;
        traps.insert(
            svc,
            Slot {
                offset,
                name,
                op: TableOp::Env(op),
            },
        );
    }
    let env = backend.allocate(8, "_JNIEnv")?;
    backend.write_u64(env, env_impl)?;

    let invoke_impl = backend.allocate(VM_SLOT_COUNT * 8, "_JNIInvokeInterface")?;
    for index in 0..VM_SLOT_COUNT {
        let offset = (index * 8) as u64;
        backend.write_u64(invoke_impl + offset, offset)?;
    }
    for &(offset, name, op) in VM_SLOTS {
        let svc = backend.register_svc(name)?;
        backend.write_u64(invoke_impl + offset, svc)?;
        traps.insert(
            svc,
            Slot {
                offset,
                name,
                op: TableOp::Vm(op),
            },
        );
    }
    let java_vm = backend.allocate(8, "_JavaVM")?;
    backend.write_u64(java_vm, invoke_impl)?;

    Ok((
        JniTables {
            env,
            java_vm,
            env_impl,
            invoke_impl,
        },
        traps,
    ))
}

/// Name of the populated slot at `offset`, if any
pub(crate) fn slot_name(offset: u64) -> Option<&'static str> {
    ENV_SLOTS
        .iter()
        .find(|&&(o, _, _)| o == offset)
        .map(|&(_, name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_offsets_are_unique_and_in_range() {
        let mut seen = std::collections::HashSet::new();
        for &(offset, name, _) in ENV_SLOTS {
            assert_eq!(offset % 8, 0, "{name} misaligned");
            assert!((offset as usize) < ENV_SLOT_COUNT * 8, "{name} out of table");
            assert!(seen.insert(offset), "{name} duplicates offset {offset:#x}");
        }
    }

    #[test]
    fn test_contract_offsets_match_published_layout() {
        // Spot checks against the published ARM64 layout; these numbers
        // are baked into guest binaries.
        assert_eq!(slot_name(0x30), Some("FindClass"));
        assert_eq!(slot_name(0x108), Some("GetMethodID"));
        assert_eq!(slot_name(0x198), Some("CallIntMethodA"));
        assert_eq!(slot_name(0x4B0), Some("GetStaticIntField"));
        assert_eq!(slot_name(0x538), Some("NewStringUTF"));
        assert_eq!(slot_name(0x6B8), Some("RegisterNatives"));
        assert_eq!(slot_name(0x740), Some("GetObjectRefType"));
        assert_eq!(slot_name(0x690), None);
    }
}
