//! Per-process bridge context
//!
//! One [`DalvikVm`] models one emulated process: the class pool, the
//! reference tables, the pending-exception slot and the guest-visible
//! function tables. There are no ambient globals — everything the
//! dispatcher touches hangs off this struct, and its lifetime is the
//! lifetime of the emulated process.
//!
//! The context deliberately does not own the CPU backend or the facade:
//! the embedding driver passes both into [`DalvikVm::handle_trap`], which
//! keeps reentrancy trivial (facade code receives `&mut dyn JniContext`
//! — this same context — and may resolve classes, vend references and
//! throw while a call is in flight).

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use dvm_sdk::{DvmClass, DvmObject, Jni, JniContext, MemoryBlock, Payload, signature_hash};

use crate::backend::Backend;
use crate::env::{self, build_tables, JniTables, Slot, TableOp, ENV_SLOT_COUNT};
use crate::refs::{RefKind, RefSpace};
use crate::BridgeResult;

/// The per-process JNI bridge context
pub struct DalvikVm {
    /// Local/global/weak reference tables
    refs: RefSpace,
    /// Class pool, by internal-form name
    classes_by_name: FxHashMap<String, DvmClass>,
    /// Class pool, by stable class id (guest `jclass` handles)
    classes_by_id: FxHashMap<u32, DvmClass>,
    /// Mirror objects standing in for `jclass` values
    class_objects: FxHashMap<u32, DvmObject>,
    /// Names `FindClass` must report as missing
    not_found: FxHashSet<String>,
    /// The single pending-exception slot
    throwable: Option<DvmObject>,
    /// Guest addresses of the constructed tables
    tables: JniTables,
    /// svc address → slot registry for trap dispatch
    traps: FxHashMap<u64, Slot>,
}

impl DalvikVm {
    /// Build the function tables in guest memory and return the context
    pub fn new(backend: &mut dyn Backend) -> BridgeResult<Self> {
        let (tables, traps) = build_tables(backend)?;
        debug!(
            env = format_args!("{:#x}", tables.env),
            java_vm = format_args!("{:#x}", tables.java_vm),
            "jni tables constructed"
        );
        Ok(DalvikVm {
            refs: RefSpace::new(),
            classes_by_name: FxHashMap::default(),
            classes_by_id: FxHashMap::default(),
            class_objects: FxHashMap::default(),
            not_found: FxHashSet::default(),
            throwable: None,
            tables,
            traps,
        })
    }

    /// The `JNIEnv*` value guest natives receive
    pub fn env_ptr(&self) -> u64 {
        self.tables.env
    }

    /// The `JavaVM*` value (`JNI_OnLoad`'s first argument)
    pub fn java_vm_ptr(&self) -> u64 {
        self.tables.java_vm
    }

    /// Guest addresses of both tables
    pub fn tables(&self) -> JniTables {
        self.tables
    }

    /// Direct access to the reference tables
    pub fn refs(&self) -> &RefSpace {
        &self.refs
    }

    pub(crate) fn refs_mut(&mut self) -> &mut RefSpace {
        &mut self.refs
    }

    /// Mark a class name so `FindClass` raises `NoClassDefFoundError`
    pub fn add_not_found_class(&mut self, name: impl Into<String>) {
        self.not_found.insert(name.into());
    }

    pub(crate) fn is_not_found(&self, name: &str) -> bool {
        self.not_found.contains(name)
    }

    /// Resolve a handle to an object: reference tables first, then class
    /// mirrors (a `jclass` is an object too). `0` resolves to `None`.
    pub fn lookup_object(&self, handle: u64) -> Option<DvmObject> {
        if handle == 0 {
            return None;
        }
        if let Some(obj) = self.refs.resolve(handle) {
            return Some(obj);
        }
        u32::try_from(handle)
            .ok()
            .and_then(|id| self.class_objects.get(&id).cloned())
    }

    /// Resolve a `jclass` handle
    pub fn class_by_handle(&self, handle: u64) -> Option<DvmClass> {
        let id = u32::try_from(handle).ok()?;
        self.classes_by_id.get(&id).cloned().or_else(|| {
            // A class can also arrive through an object reference to its
            // mirror (e.g. a globally cached jclass).
            match &*self.refs.resolve(handle)?.payload() {
                Payload::Class(class) => Some(class.clone()),
                _ => None,
            }
        })
    }

    /// Identity comparison over any two handles, mirrors included
    pub fn is_same_handles(&self, h1: u64, h2: u64) -> bool {
        match (self.lookup_object(h1), self.lookup_object(h2)) {
            (Some(a), Some(b)) => a.is_same(&b),
            (None, None) => h1 == h2,
            _ => false,
        }
    }

    /// Vend a local reference
    pub fn add_local_ref(&mut self, object: &DvmObject) -> u64 {
        self.refs.add_local(object)
    }

    /// Vend a local reference for an optional object (`None` → null)
    pub(crate) fn vend_local(&mut self, object: Option<DvmObject>) -> u64 {
        match object {
            Some(obj) => self.refs.add_local(&obj),
            None => 0,
        }
    }

    /// The pending exception, if any
    pub fn pending_exception(&self) -> Option<DvmObject> {
        self.throwable.clone()
    }

    /// Set the pending exception (overwrites an outstanding one)
    pub fn set_pending_exception(&mut self, throwable: DvmObject) {
        if let Some(old) = &self.throwable {
            debug!(old = ?old, "pending exception overwritten");
        }
        self.throwable = Some(throwable);
    }

    /// Clear the pending exception
    pub fn clear_pending_exception(&mut self) {
        self.throwable = None;
    }

    // ========================================================================
    // Class pool
    // ========================================================================

    /// Resolve (auto-registering) a class by internal-form name
    pub fn resolve_class(&mut self, name: &str) -> DvmClass {
        self.intern_class(name, None, &[])
    }

    /// Resolve a class, declaring superclass and interfaces on first use
    pub fn resolve_class_with_interfaces(
        &mut self,
        name: &str,
        super_class: Option<&DvmClass>,
        interfaces: &[DvmClass],
    ) -> DvmClass {
        self.intern_class(name, super_class, interfaces)
    }

    fn intern_class(
        &mut self,
        name: &str,
        super_class: Option<&DvmClass>,
        interfaces: &[DvmClass],
    ) -> DvmClass {
        if let Some(class) = self.classes_by_name.get(name) {
            return class.clone();
        }
        // Probe past hash collisions; the id must be unique because it is
        // the guest-visible jclass handle.
        let mut id = signature_hash(name);
        while self.classes_by_id.contains_key(&id) {
            id = id.wrapping_add(1).max(1);
        }
        let class = DvmClass::new(id, name, super_class.cloned(), interfaces.to_vec());
        self.classes_by_name.insert(name.to_string(), class.clone());
        self.classes_by_id.insert(id, class.clone());

        let mirror_class = if name == "java/lang/Class" {
            class.clone()
        } else {
            self.resolve_class("java/lang/Class")
        };
        let mirror = DvmObject::with_id(u64::from(id), mirror_class, Payload::Class(class.clone()));
        self.class_objects.insert(id, mirror);

        debug!(class = name, id = format_args!("{id:#x}"), "class interned");
        class
    }

    // ========================================================================
    // Object construction helpers
    // ========================================================================

    /// Create a `java/lang/String` object (no reference is vended)
    pub fn new_string_object(&mut self, value: &str) -> DvmObject {
        let class = self.resolve_class("java/lang/String");
        DvmObject::new(class, Payload::String(value.to_string()))
    }

    /// Create a throwable of `class_name` carrying `detail`, and make it
    /// the pending exception
    pub fn throw_new(&mut self, class_name: &str, detail: &str) -> DvmObject {
        let class = self.resolve_class(class_name);
        let throwable = DvmObject::new(class, Payload::String(detail.to_string()));
        warn!(class = class_name, detail, "guest exception raised");
        self.set_pending_exception(throwable.clone());
        throwable
    }

    /// Create a primitive array object of the right array class
    pub fn new_array_object(&mut self, payload: Payload) -> DvmObject {
        let class_name = match &payload {
            Payload::ByteArray(_) => "[B",
            Payload::ShortArray(_) => "[S",
            Payload::IntArray(_) => "[I",
            Payload::DoubleArray(_) => "[D",
            Payload::ObjectArray(_) => "[Ljava/lang/Object;",
            _ => "java/lang/Object",
        };
        let class = self.resolve_class(class_name);
        DvmObject::new(class, payload)
    }

    /// Create a reference array whose class names the element type
    pub fn new_object_array(
        &mut self,
        element_class: &DvmClass,
        elements: Vec<Option<DvmObject>>,
    ) -> DvmObject {
        let class = self.resolve_class(&format!("[L{};", element_class.name()));
        DvmObject::new(class, Payload::ObjectArray(elements))
    }

    /// Release every memory block still tied to an object that just lost
    /// its last table entry (the going-away hook)
    pub(crate) fn release_object(&mut self, backend: &mut dyn Backend, object: &DvmObject) {
        for MemoryBlock { addr, size } in object.drain_blocks() {
            debug!(
                addr = format_args!("{addr:#x}"),
                size,
                object = ?object,
                "releasing leaked memory block"
            );
            let _ = backend.free(addr);
        }
    }

    // ========================================================================
    // Trap dispatch
    // ========================================================================

    /// Service a trap at `addr`.
    ///
    /// Returns `Ok(false)` when the address belongs to no bridge slot (the
    /// driver owns other synthetic calls too). On `Ok(true)` the return
    /// registers are written and the driver should resume the guest at the
    /// link register.
    pub fn handle_trap(
        &mut self,
        backend: &mut dyn Backend,
        jni: &mut dyn Jni,
        addr: u64,
    ) -> BridgeResult<bool> {
        let Some(slot) = self.traps.get(&addr).copied() else {
            return Ok(false);
        };
        let result = match slot.op {
            TableOp::Env(op) => self.dispatch_env(backend, jni, op, slot.name),
            TableOp::Vm(op) => self.dispatch_vm(backend, op),
        };
        match result {
            Ok(ret) => {
                crate::arm64::write_return(backend, ret)
                    .map_err(|e| e.at_slot(slot.offset, slot.name))?;
                Ok(true)
            }
            Err(e) => Err(e.at_slot(slot.offset, slot.name)),
        }
    }

    /// Decode a fault address that is really an unpopulated slot's
    /// self-describing default value
    pub fn explain_fault(&self, pc: u64) -> Option<String> {
        if pc % 8 != 0 || pc as usize >= ENV_SLOT_COUNT * 8 {
            return None;
        }
        Some(match env::slot_name(pc) {
            Some(name) => format!(
                "call through JNIEnv slot {name} (offset {pc:#x}) reached its default value"
            ),
            None => format!(
                "call through unpopulated JNIEnv slot index {} (offset {pc:#x})",
                pc / 8
            ),
        })
    }
}

impl JniContext for DalvikVm {
    fn resolve_class(&mut self, name: &str) -> DvmClass {
        DalvikVm::resolve_class(self, name)
    }

    fn resolve_class_with_interfaces(&mut self, name: &str, interfaces: &[DvmClass]) -> DvmClass {
        DalvikVm::resolve_class_with_interfaces(self, name, None, interfaces)
    }

    fn new_string(&mut self, value: &str) -> DvmObject {
        self.new_string_object(value)
    }

    fn resolve_handle(&self, handle: u64) -> Option<DvmObject> {
        self.lookup_object(handle)
    }

    fn add_local_ref(&mut self, object: &DvmObject) -> u64 {
        self.refs.add_local(object)
    }

    fn add_global_ref(&mut self, object: &DvmObject, weak: bool) -> u64 {
        self.refs.add_global(object, weak)
    }

    fn set_pending_exception(&mut self, throwable: DvmObject) {
        DalvikVm::set_pending_exception(self, throwable);
    }

    fn pending_exception(&self) -> Option<DvmObject> {
        DalvikVm::pending_exception(self)
    }

    fn clear_pending_exception(&mut self) {
        DalvikVm::clear_pending_exception(self);
    }
}

impl DalvikVm {
    /// Guest ref-type classification for a handle (class mirrors and
    /// unknown handles are invalid, matching the reference ABI)
    pub fn ref_kind(&self, handle: u64) -> RefKind {
        self.refs.ref_kind(handle)
    }
}
