//! Substitute object graph: classes, members and objects
//!
//! The bridge hands integer handles to the guest; those handles always
//! resolve back to the [`DvmObject`]s and [`DvmClass`]es defined here.
//! Identity is explicit: every object gets a process-unique id at
//! construction, and that id *is* its guest handle on every vending path,
//! so handle equality and object identity agree for live references.
//!
//! Method and field ids are 31-based string hashes of `name + descriptor`,
//! cached per class so a resolved id stays valid for the life of the
//! process without re-resolution.
//!
//! Everything here is single-threaded by contract (`Rc`/`RefCell`); the
//! bridge never runs concurrently with the guest CPU loop.

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::JniResult;
use crate::value::{parse_field_type, JavaType, MethodSignature};

/// Process-wide object id source. Ids double as guest handles, so they
/// must never repeat within one emulated process; a single counter for
/// all contexts is the cheapest way to guarantee that. The low 32-bit
/// space is left to class and member identifier hashes, which share the
/// guest's handle namespace.
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(0x1_0000_0000);

fn fresh_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// 31-based string hash over UTF-16 code units, the id scheme resolved
/// method/field/class identifiers use. Never returns zero (zero is the
/// null handle).
pub fn signature_hash(text: &str) -> u32 {
    let mut h: i32 = 0;
    for unit in text.encode_utf16() {
        h = h.wrapping_mul(31).wrapping_add(unit as i32);
    }
    match h as u32 {
        0 => 1,
        nonzero => nonzero,
    }
}

// ============================================================================
// Classes and members
// ============================================================================

/// A resolved class: name, hierarchy, and interior-mutable member tables
#[derive(Clone)]
pub struct DvmClass {
    inner: Rc<ClassInner>,
}

struct ClassInner {
    id: u32,
    name: String,
    super_class: Option<DvmClass>,
    interfaces: Vec<DvmClass>,
    methods: RefCell<HashMap<u32, DvmMethod>>,
    static_methods: RefCell<HashMap<u32, DvmMethod>>,
    fields: RefCell<HashMap<u32, DvmField>>,
    static_fields: RefCell<HashMap<u32, DvmField>>,
    natives: RefCell<HashMap<String, u64>>,
}

impl DvmClass {
    /// Create a class with an externally assigned id (the class pool owns
    /// id allocation so it can probe away hash collisions).
    pub fn new(
        id: u32,
        name: impl Into<String>,
        super_class: Option<DvmClass>,
        interfaces: Vec<DvmClass>,
    ) -> Self {
        DvmClass {
            inner: Rc::new(ClassInner {
                id,
                name: name.into(),
                super_class,
                interfaces,
                methods: RefCell::new(HashMap::new()),
                static_methods: RefCell::new(HashMap::new()),
                fields: RefCell::new(HashMap::new()),
                static_fields: RefCell::new(HashMap::new()),
                natives: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Stable class id; also the guest handle for this class
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Internal-form class name, e.g. `java/lang/String`
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Direct superclass, if one was declared at resolution time
    pub fn super_class(&self) -> Option<&DvmClass> {
        self.inner.super_class.as_ref()
    }

    /// Resolve (and cache) a method id for `name` + `descriptor`.
    ///
    /// Resolution never fails for well-formed descriptors: the substitute
    /// runtime assumes guest code only asks for members that exist, and
    /// the facade supplies behavior at call time.
    pub fn method_id(&self, name: &str, descriptor: &str, is_static: bool) -> JniResult<u32> {
        let signature = MethodSignature::parse(descriptor)?;
        let id = signature_hash(&format!("{name}{descriptor}"));
        let method = DvmMethod {
            inner: Rc::new(MethodInner {
                id,
                class_name: self.inner.name.clone(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                signature,
                is_static,
            }),
        };
        let table = if is_static {
            &self.inner.static_methods
        } else {
            &self.inner.methods
        };
        table.borrow_mut().entry(id).or_insert(method);
        Ok(id)
    }

    /// Look up a previously resolved instance method
    pub fn instance_method(&self, id: u32) -> Option<DvmMethod> {
        self.inner.methods.borrow().get(&id).cloned()
    }

    /// Look up a previously resolved static method
    pub fn static_method(&self, id: u32) -> Option<DvmMethod> {
        self.inner.static_methods.borrow().get(&id).cloned()
    }

    /// Look up a resolved method of either kind (reflection paths)
    pub fn any_method(&self, id: u32) -> Option<DvmMethod> {
        self.static_method(id).or_else(|| self.instance_method(id))
    }

    /// Resolve (and cache) a field id for `name` + `descriptor`
    pub fn field_id(&self, name: &str, descriptor: &str, is_static: bool) -> JniResult<u32> {
        let ty = parse_field_type(descriptor)?;
        let id = signature_hash(&format!("{name}{descriptor}"));
        let field = DvmField {
            inner: Rc::new(FieldInner {
                id,
                class_name: self.inner.name.clone(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                ty,
                is_static,
            }),
        };
        let table = if is_static {
            &self.inner.static_fields
        } else {
            &self.inner.fields
        };
        table.borrow_mut().entry(id).or_insert(field);
        Ok(id)
    }

    /// Look up a previously resolved instance field
    pub fn instance_field(&self, id: u32) -> Option<DvmField> {
        self.inner.fields.borrow().get(&id).cloned()
    }

    /// Look up a previously resolved static field
    pub fn static_field(&self, id: u32) -> Option<DvmField> {
        self.inner.static_fields.borrow().get(&id).cloned()
    }

    /// Record a `RegisterNatives` binding, keyed `name + descriptor`
    pub fn bind_native(&self, name: &str, descriptor: &str, fn_ptr: u64) {
        self.inner
            .natives
            .borrow_mut()
            .insert(format!("{name}{descriptor}"), fn_ptr);
    }

    /// Guest function pointer registered for `name + descriptor`, if any.
    ///
    /// This is how the embedding driver finds `JNI_OnLoad`-registered
    /// natives to execute on the CPU emulator.
    pub fn native_function(&self, key: &str) -> Option<u64> {
        self.inner.natives.borrow().get(key).copied()
    }

    /// Number of recorded native bindings
    pub fn native_count(&self) -> usize {
        self.inner.natives.borrow().len()
    }

    /// Whether a value of this class can be treated as `target`
    /// (same class, superclass chain, or declared interface closure)
    pub fn assignable_to(&self, target: &DvmClass) -> bool {
        if self.inner.id == target.inner.id {
            return true;
        }
        if let Some(sup) = &self.inner.super_class {
            if sup.assignable_to(target) {
                return true;
            }
        }
        self.inner
            .interfaces
            .iter()
            .any(|itf| itf.assignable_to(target))
    }
}

impl PartialEq for DvmClass {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for DvmClass {}

impl fmt::Debug for DvmClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {}", self.inner.name)
    }
}

/// A resolved method descriptor
#[derive(Clone)]
pub struct DvmMethod {
    inner: Rc<MethodInner>,
}

struct MethodInner {
    id: u32,
    class_name: String,
    name: String,
    descriptor: String,
    signature: MethodSignature,
    is_static: bool,
}

impl DvmMethod {
    /// Stable method id (the guest-visible `jmethodID`)
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Method name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Raw descriptor, e.g. `(II)I`
    pub fn descriptor(&self) -> &str {
        &self.inner.descriptor
    }

    /// Parsed signature
    pub fn signature(&self) -> &MethodSignature {
        &self.inner.signature
    }

    /// Whether this resolved as a static method
    pub fn is_static(&self) -> bool {
        self.inner.is_static
    }

    /// `name + descriptor`, the native-binding table key
    pub fn key(&self) -> String {
        format!("{}{}", self.inner.name, self.inner.descriptor)
    }

    /// Fully qualified form used in diagnostics: `class->name(descriptor)`
    pub fn qualified(&self) -> String {
        format!(
            "{}->{}{}",
            self.inner.class_name, self.inner.name, self.inner.descriptor
        )
    }
}

impl fmt::Debug for DvmMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// A resolved field descriptor
#[derive(Clone)]
pub struct DvmField {
    inner: Rc<FieldInner>,
}

struct FieldInner {
    id: u32,
    class_name: String,
    name: String,
    descriptor: String,
    ty: JavaType,
    is_static: bool,
}

impl DvmField {
    /// Stable field id (the guest-visible `jfieldID`)
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Field name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Raw descriptor, e.g. `J` or `Ljava/lang/String;`
    pub fn descriptor(&self) -> &str {
        &self.inner.descriptor
    }

    /// Declared value kind
    pub fn value_type(&self) -> JavaType {
        self.inner.ty
    }

    /// Whether this resolved as a static field
    pub fn is_static(&self) -> bool {
        self.inner.is_static
    }

    /// Fully qualified form used in diagnostics: `class->name:descriptor`
    pub fn qualified(&self) -> String {
        format!(
            "{}->{}:{}",
            self.inner.class_name, self.inner.name, self.inner.descriptor
        )
    }
}

impl fmt::Debug for DvmField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

// ============================================================================
// Objects
// ============================================================================

/// A guest-memory allocation tied to an object by a `Get*Chars` /
/// `Get*Elements` call; freed only by the matching release (or when the
/// object's last reference goes away).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    /// Guest address of the allocation
    pub addr: u64,
    /// Allocation size in bytes
    pub size: usize,
}

/// Object payloads the bridge plumbs generically.
///
/// `Instance` carries an optional opaque host value so embedder code can
/// attach arbitrary state to constructed objects; the typed variants back
/// the string/array table entries.
pub enum Payload {
    /// Plain instance; the slot is for embedder-owned host state
    Instance(Option<Box<dyn Any>>),
    /// `java/lang/String` contents
    String(String),
    /// `byte[]`
    ByteArray(Vec<u8>),
    /// `short[]`
    ShortArray(Vec<i16>),
    /// `int[]`
    IntArray(Vec<i32>),
    /// `double[]`
    DoubleArray(Vec<f64>),
    /// Reference array; `None` elements are null
    ObjectArray(Vec<Option<DvmObject>>),
    /// Mirror object standing in for a `jclass`
    Class(DvmClass),
}

impl Payload {
    /// Kind name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Instance(_) => "instance",
            Payload::String(_) => "string",
            Payload::ByteArray(_) => "byte[]",
            Payload::ShortArray(_) => "short[]",
            Payload::IntArray(_) => "int[]",
            Payload::DoubleArray(_) => "double[]",
            Payload::ObjectArray(_) => "object[]",
            Payload::Class(_) => "class",
        }
    }

    /// Element count if this payload is an array
    pub fn array_length(&self) -> Option<usize> {
        match self {
            Payload::ByteArray(v) => Some(v.len()),
            Payload::ShortArray(v) => Some(v.len()),
            Payload::IntArray(v) => Some(v.len()),
            Payload::DoubleArray(v) => Some(v.len()),
            Payload::ObjectArray(v) => Some(v.len()),
            _ => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::String(s) => write!(f, "{s:?}"),
            other => f.write_str(other.kind_name()),
        }
    }
}

/// A host object visible to the guest through an integer handle.
///
/// Clones share the same underlying object (`Rc`); identity comparisons
/// go through [`DvmObject::is_same`].
#[derive(Clone)]
pub struct DvmObject {
    inner: Rc<ObjectInner>,
}

struct ObjectInner {
    id: u64,
    class: DvmClass,
    payload: RefCell<Payload>,
    blocks: RefCell<Vec<MemoryBlock>>,
}

impl DvmObject {
    /// Create an object with a fresh process-unique id
    pub fn new(class: DvmClass, payload: Payload) -> Self {
        Self::with_id(fresh_object_id(), class, payload)
    }

    /// Create an object with a caller-chosen id.
    ///
    /// Used for class mirror objects, which share their class's id so
    /// `FindClass` and `NewGlobalRef` agree on one handle value.
    pub fn with_id(id: u64, class: DvmClass, payload: Payload) -> Self {
        DvmObject {
            inner: Rc::new(ObjectInner {
                id,
                class,
                payload: RefCell::new(payload),
                blocks: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Plain instance of `class` with no host state attached
    pub fn instance(class: DvmClass) -> Self {
        DvmObject::new(class, Payload::Instance(None))
    }

    /// The object's id; equal to its guest handle
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Runtime class of the object
    pub fn class(&self) -> &DvmClass {
        &self.inner.class
    }

    /// Borrow the payload
    pub fn payload(&self) -> Ref<'_, Payload> {
        self.inner.payload.borrow()
    }

    /// Mutably borrow the payload
    pub fn payload_mut(&self) -> RefMut<'_, Payload> {
        self.inner.payload.borrow_mut()
    }

    /// Replace the payload, returning the previous one.
    ///
    /// Covers the super-constructor pattern where a constructed value is
    /// installed into an already-vended receiver.
    pub fn replace_payload(&self, payload: Payload) -> Payload {
        self.inner.payload.replace(payload)
    }

    /// String contents, if this is a string object
    pub fn string_value(&self) -> Option<String> {
        match &*self.payload() {
            Payload::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Identity comparison (same underlying object, however vended)
    pub fn is_same(&self, other: &DvmObject) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Record a scoped guest allocation owned by this object
    pub fn push_block(&self, block: MemoryBlock) {
        self.inner.blocks.borrow_mut().push(block);
    }

    /// Detach the recorded block at `addr`, if present
    pub fn take_block(&self, addr: u64) -> Option<MemoryBlock> {
        let mut blocks = self.inner.blocks.borrow_mut();
        let idx = blocks.iter().position(|b| b.addr == addr)?;
        Some(blocks.swap_remove(idx))
    }

    /// Detach every recorded block (going-away hook)
    pub fn drain_blocks(&self) -> Vec<MemoryBlock> {
        std::mem::take(&mut *self.inner.blocks.borrow_mut())
    }
}

impl fmt::Debug for DvmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{:#x} [{:?}]",
            self.inner.class.name(),
            self.inner.id,
            self.inner.payload.borrow()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> DvmClass {
        DvmClass::new(signature_hash(name), name, None, Vec::new())
    }

    #[test]
    fn test_signature_hash_matches_java() {
        // Values pinned to String.hashCode so resolved ids are stable
        // across runs and match traces taken from real guests.
        assert_eq!(signature_hash("add(II)I"), 0xb33bb687_u32);
        assert_ne!(signature_hash("a"), signature_hash("b"));
        assert_ne!(signature_hash(""), 0);
    }

    #[test]
    fn test_method_resolution_is_stable() {
        let c = class("com/example/Calc");
        let id1 = c.method_id("add", "(II)I", true).unwrap();
        let id2 = c.method_id("add", "(II)I", true).unwrap();
        assert_eq!(id1, id2);
        let m = c.static_method(id1).unwrap();
        assert_eq!(m.name(), "add");
        assert_eq!(m.qualified(), "com/example/Calc->add(II)I");
        assert!(c.instance_method(id1).is_none());
    }

    #[test]
    fn test_field_resolution() {
        let c = class("com/example/Calc");
        let id = c.field_id("count", "I", false).unwrap();
        let f = c.instance_field(id).unwrap();
        assert_eq!(f.value_type(), JavaType::Int);
        assert!(!f.is_static());
        assert_eq!(f.qualified(), "com/example/Calc->count:I");
    }

    #[test]
    fn test_object_identity() {
        let c = class("java/lang/Object");
        let a = DvmObject::instance(c.clone());
        let b = DvmObject::instance(c);
        assert!(a.is_same(&a.clone()));
        assert!(!a.is_same(&b));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_assignability_walks_hierarchy() {
        let object = class("java/lang/Object");
        let iface = class("java/io/Serializable");
        let base = DvmClass::new(
            signature_hash("com/example/Base"),
            "com/example/Base",
            Some(object.clone()),
            vec![iface.clone()],
        );
        let derived = DvmClass::new(
            signature_hash("com/example/Derived"),
            "com/example/Derived",
            Some(base.clone()),
            Vec::new(),
        );
        assert!(derived.assignable_to(&derived));
        assert!(derived.assignable_to(&base));
        assert!(derived.assignable_to(&object));
        assert!(derived.assignable_to(&iface));
        assert!(!base.assignable_to(&derived));
    }

    #[test]
    fn test_memory_block_bookkeeping() {
        let obj = DvmObject::instance(class("java/lang/String"));
        obj.push_block(MemoryBlock { addr: 0x1000, size: 8 });
        obj.push_block(MemoryBlock { addr: 0x2000, size: 16 });
        assert_eq!(obj.take_block(0x1000), Some(MemoryBlock { addr: 0x1000, size: 8 }));
        assert_eq!(obj.take_block(0x1000), None);
        assert_eq!(obj.drain_blocks().len(), 1);
        assert!(obj.drain_blocks().is_empty());
    }

    #[test]
    fn test_native_binding_table() {
        let c = class("com/example/Native");
        c.bind_native("nativeAdd", "(II)I", 0x4000_1000);
        assert_eq!(c.native_function("nativeAdd(II)I"), Some(0x4000_1000));
        assert_eq!(c.native_function("nativeAdd(JJ)J"), None);
    }
}
