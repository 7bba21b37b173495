//! Shared test harness: drives the real guest-visible tables on the
//! software backend, the way an emulated native library would

#![allow(dead_code)]

use std::collections::HashMap;

use dvm_bridge::backend::mock::MockBackend;
use dvm_bridge::backend::{Backend, BackendExt};
use dvm_bridge::{
    Arguments, BridgeError, DalvikVm, DvmClass, DvmField, DvmMethod, DvmObject, JValue, Jni,
    JniContext, JniError, JniResult, Payload,
};

/// A context, a software backend and a scripted facade
pub struct Harness {
    pub be: MockBackend,
    pub vm: DalvikVm,
    pub jni: TestJni,
}

impl Harness {
    pub fn new() -> Self {
        let mut be = MockBackend::with_default_arena();
        let vm = DalvikVm::new(&mut be).expect("table construction");
        Harness {
            be,
            vm,
            jni: TestJni::default(),
        }
    }

    /// Read a slot's function pointer out of guest memory, exactly as
    /// guest code computes it: `*(*env + offset)`
    pub fn env_slot(&mut self, offset: u64) -> u64 {
        let table = self.be.read_u64(self.vm.env_ptr()).unwrap();
        self.be.read_u64(table + offset).unwrap()
    }

    /// Same for the invoke interface: `*(*java_vm + 8 * index)`
    pub fn vm_slot(&mut self, index: u64) -> u64 {
        let table = self.be.read_u64(self.vm.java_vm_ptr()).unwrap();
        self.be.read_u64(table + index * 8).unwrap()
    }

    /// Call through an env slot: `x0` = env, `x1..` = `args`. Returns
    /// `x0` after the trap completes.
    pub fn call(&mut self, offset: u64, args: &[u64]) -> u64 {
        self.try_call(offset, args).unwrap()
    }

    pub fn try_call(&mut self, offset: u64, args: &[u64]) -> Result<u64, BridgeError> {
        let target = self.env_slot(offset);
        let env = self.vm.env_ptr();
        self.be.write_gpr(0, env).unwrap();
        for (i, &value) in args.iter().enumerate() {
            self.be.write_gpr(i + 1, value).unwrap();
        }
        let handled = self.vm.handle_trap(&mut self.be, &mut self.jni, target)?;
        assert!(handled, "trap address {target:#x} not owned by the bridge");
        Ok(self.be.read_gpr(0).unwrap())
    }

    /// Call through an invoke-interface slot: `x0` = java_vm
    pub fn call_vm(&mut self, index: u64, args: &[u64]) -> u64 {
        let target = self.vm_slot(index);
        let java_vm = self.vm.java_vm_ptr();
        self.be.write_gpr(0, java_vm).unwrap();
        for (i, &value) in args.iter().enumerate() {
            self.be.write_gpr(i + 1, value).unwrap();
        }
        let handled = self
            .vm
            .handle_trap(&mut self.be, &mut self.jni, target)
            .unwrap();
        assert!(handled);
        self.be.read_gpr(0).unwrap()
    }

    pub fn find_class(&mut self, name: &str) -> u64 {
        let name_ptr = self.be.alloc_c_string(name, "class name").unwrap();
        self.call(0x30, &[name_ptr])
    }

    pub fn method_id(&mut self, class: u64, name: &str, descriptor: &str, is_static: bool) -> u64 {
        let name_ptr = self.be.alloc_c_string(name, "method name").unwrap();
        let desc_ptr = self.be.alloc_c_string(descriptor, "descriptor").unwrap();
        let offset = if is_static { 0x388 } else { 0x108 };
        self.call(offset, &[class, name_ptr, desc_ptr])
    }

    pub fn field_id(&mut self, class: u64, name: &str, descriptor: &str, is_static: bool) -> u64 {
        let name_ptr = self.be.alloc_c_string(name, "field name").unwrap();
        let desc_ptr = self.be.alloc_c_string(descriptor, "descriptor").unwrap();
        let offset = if is_static { 0x480 } else { 0x2F0 };
        self.call(offset, &[class, name_ptr, desc_ptr])
    }

    pub fn new_string_utf(&mut self, text: &str) -> u64 {
        let bytes = self.be.alloc_c_string(text, "utf").unwrap();
        self.call(0x538, &[bytes])
    }

    /// Host-side view of a string handle's contents
    pub fn string_of(&self, handle: u64) -> String {
        self.vm
            .lookup_object(handle)
            .and_then(|obj| obj.string_value())
            .expect("string handle")
    }

    /// Build an AArch64 `va_list` record with the given saved general
    /// and vector register contents and an (empty) overflow stack
    pub fn build_va_list(&mut self, gp: &[u64], fp: &[u64]) -> u64 {
        let gr_size = gp.len() * 8;
        let gr_base = self.be.allocate(gr_size.max(8), "va gr").unwrap();
        for (i, &word) in gp.iter().enumerate() {
            self.be.write_u64(gr_base + (i as u64) * 8, word).unwrap();
        }
        let vr_size = fp.len() * 16;
        let vr_base = self.be.allocate(vr_size.max(16), "va vr").unwrap();
        for (i, &bits) in fp.iter().enumerate() {
            self.be.write_u64(vr_base + (i as u64) * 16, bits).unwrap();
        }
        let overflow = self.be.allocate(64, "va stack").unwrap();

        let header = self.be.allocate(32, "va_list").unwrap();
        self.be.write_u64(header, overflow).unwrap();
        self.be.write_u64(header + 8, gr_base + gr_size as u64).unwrap();
        self.be.write_u64(header + 16, vr_base + vr_size as u64).unwrap();
        self.be.write_u32(header + 24, (-(gr_size as i64)) as u32).unwrap();
        self.be.write_u32(header + 28, (-(vr_size as i64)) as u32).unwrap();
        header
    }

    /// Build a packed `jvalue` array from raw 8-byte words
    pub fn build_jvalues(&mut self, words: &[u64]) -> u64 {
        let base = self.be.allocate((words.len() * 8).max(8), "jvalues").unwrap();
        for (i, &word) in words.iter().enumerate() {
            self.be.write_u64(base + (i as u64) * 8, word).unwrap();
        }
        base
    }

    /// Stage a double into an FP argument register
    pub fn set_fp_arg(&mut self, index: usize, value: f64) {
        let mut lanes = [0u8; 16];
        lanes[..8].copy_from_slice(&value.to_le_bytes());
        self.be.write_vector(index, lanes).unwrap();
    }

    /// Bits of `v0` interpreted as a double
    pub fn fp_result_f64(&mut self) -> f64 {
        let lanes = self.be.read_vector(0).unwrap();
        f64::from_le_bytes(lanes[..8].try_into().unwrap())
    }

    /// Bits of `v0` interpreted as a float
    pub fn fp_result_f32(&mut self) -> f32 {
        let lanes = self.be.read_vector(0).unwrap();
        f32::from_le_bytes(lanes[..4].try_into().unwrap())
    }
}

/// Scripted facade covering the members the test guests use
#[derive(Default)]
pub struct TestJni {
    pub static_fields: HashMap<String, JValue>,
    pub instance_fields: HashMap<(u64, String), JValue>,
}

impl Jni for TestJni {
    fn call_method(
        &mut self,
        ctx: &mut dyn JniContext,
        receiver: &DvmObject,
        method: &DvmMethod,
        args: &mut Arguments,
    ) -> JniResult<JValue> {
        match method.key().as_str() {
            "add(II)I" => Ok(JValue::Int(args.next_int()? + args.next_int()?)),
            "sum10(IIIIIIIIII)I" => {
                let mut total = 0;
                for _ in 0..10 {
                    total += args.next_int()?;
                }
                Ok(JValue::Int(total))
            }
            "half(D)D" => Ok(JValue::Double(args.next_double()? / 2.0)),
            "sumd(DDDDDDDDDD)D" => {
                let mut total = 0.0;
                for _ in 0..10 {
                    total += args.next_double()?;
                }
                Ok(JValue::Double(total))
            }
            "get()I" => match &*receiver.payload() {
                Payload::Instance(Some(value)) => value
                    .downcast_ref::<i32>()
                    .copied()
                    .map(JValue::Int)
                    .ok_or_else(|| JniError::from("receiver holds no i32")),
                _ => Err(JniError::from("uninitialized receiver")),
            },
            "name()Ljava/lang/String;" => Ok(JValue::Object(Some(ctx.new_string("bob")))),
            "use(Ljava/lang/String;)V" => {
                args.next_object()?;
                Ok(JValue::Void)
            }
            _ => Err(JniError::unhandled(method.qualified())),
        }
    }

    fn call_static_method(
        &mut self,
        _ctx: &mut dyn JniContext,
        _class: &DvmClass,
        method: &DvmMethod,
        args: &mut Arguments,
    ) -> JniResult<JValue> {
        match method.key().as_str() {
            "add(II)I" => Ok(JValue::Int(args.next_int()? + args.next_int()?)),
            "sumd(DDDDDDDDDD)D" => {
                let mut total = 0.0;
                for _ in 0..10 {
                    total += args.next_double()?;
                }
                Ok(JValue::Double(total))
            }
            "mix(IDID)D" => {
                let a = args.next_int()? as f64;
                let b = args.next_double()?;
                let c = args.next_int()? as f64;
                let d = args.next_double()?;
                Ok(JValue::Double(a + b + c + d))
            }
            "testStaticFloat(FD)F" => {
                args.next_float()?;
                args.next_double()?;
                Ok(JValue::Float(0.002_394_201_7))
            }
            "floatBits(F)I" => Ok(JValue::Int(args.next_float()?.to_bits() as i32)),
            _ => Err(JniError::unhandled(method.qualified())),
        }
    }

    fn new_object(
        &mut self,
        _ctx: &mut dyn JniContext,
        class: &DvmClass,
        method: &DvmMethod,
        args: &mut Arguments,
    ) -> JniResult<DvmObject> {
        match method.key().as_str() {
            "<init>(I)V" => Ok(DvmObject::new(
                class.clone(),
                Payload::Instance(Some(Box::new(args.next_int()?))),
            )),
            _ => Err(JniError::unhandled(method.qualified())),
        }
    }

    fn get_field(
        &mut self,
        _ctx: &mut dyn JniContext,
        receiver: &DvmObject,
        field: &DvmField,
    ) -> JniResult<JValue> {
        self.instance_fields
            .get(&(receiver.id(), field.qualified()))
            .cloned()
            .ok_or_else(|| JniError::unhandled(field.qualified()))
    }

    fn set_field(
        &mut self,
        _ctx: &mut dyn JniContext,
        receiver: &DvmObject,
        field: &DvmField,
        value: JValue,
    ) -> JniResult<()> {
        self.instance_fields
            .insert((receiver.id(), field.qualified()), value);
        Ok(())
    }

    fn get_static_field(
        &mut self,
        _ctx: &mut dyn JniContext,
        _class: &DvmClass,
        field: &DvmField,
    ) -> JniResult<JValue> {
        self.static_fields
            .get(&field.qualified())
            .cloned()
            .ok_or_else(|| JniError::unhandled(field.qualified()))
    }

    fn set_static_field(
        &mut self,
        _ctx: &mut dyn JniContext,
        _class: &DvmClass,
        field: &DvmField,
        value: JValue,
    ) -> JniResult<()> {
        self.static_fields.insert(field.qualified(), value);
        Ok(())
    }
}
