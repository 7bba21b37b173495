//! Method invocation through every argument protocol
//!
//! Exercises the calling-convention reader (register, stack spill, FP
//! file), the three call forms, facade dispatch and typed return
//! writing, end to end through the constructed tables.

mod common;

use common::Harness;
use dvm_bridge::backend::mock::ARENA_BASE;
use dvm_bridge::backend::{Backend, BackendExt};

/// Class with an instance `add(II)I` plus a vended receiver
fn calc_receiver(h: &mut Harness) -> (u64, u64) {
    let class = h.find_class("com/example/Calc");
    let obj = h.call(0xD8, &[class]); // AllocObject
    (class, obj)
}

#[test]
fn test_call_int_method_three_forms_agree() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let mid = h.method_id(class, "add", "(II)I", false);
    assert_ne!(mid, 0);

    // Register form: varargs continue in x3, x4.
    assert_eq!(h.call(0x188, &[obj, mid, 2, 3]), 5);

    // va_list form: both ints in the saved general-register area.
    let va = h.build_va_list(&[2, 3], &[]);
    assert_eq!(h.call(0x190, &[obj, mid, va]), 5);

    // jvalue-array form: packed 8-byte unions.
    let jv = h.build_jvalues(&[2, 3]);
    assert_eq!(h.call(0x198, &[obj, mid, jv]), 5);
}

#[test]
fn test_call_static_int_method_three_forms_agree() {
    let mut h = Harness::new();
    let class = h.find_class("com/example/Calc");
    let mid = h.method_id(class, "add", "(II)I", true);

    assert_eq!(h.call(0x408, &[class, mid, 2, 3]), 5);
    let va = h.build_va_list(&[2, 3], &[]);
    assert_eq!(h.call(0x410, &[class, mid, va]), 5);
    let jv = h.build_jvalues(&[2, 3]);
    assert_eq!(h.call(0x418, &[class, mid, jv]), 5);
}

#[test]
fn test_method_ids_are_scoped_static_vs_instance() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let static_mid = h.method_id(class, "add", "(II)I", true);

    // An id resolved as static does not dispatch as an instance method.
    let err = h.try_call(0x188, &[obj, static_mid, 2, 3]).unwrap_err();
    assert!(err.to_string().contains("unknown method id"), "{err}");
}

#[test]
fn test_register_form_spills_to_stack() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let mid = h.method_id(class, "sum10", "(IIIIIIIIII)I", false);

    // x1 = obj, x2 = mid, x3..x7 carry the first five ints, the last
    // five live in 8-byte stack slots.
    let sp = ARENA_BASE + 0x8000;
    h.be.set_sp(sp);
    for (i, v) in (6u64..=10).enumerate() {
        h.be.write_u64(sp + (i as u64) * 8, v).unwrap();
    }
    assert_eq!(h.call(0x188, &[obj, mid, 1, 2, 3, 4, 5]), 55);
}

#[test]
fn test_float_and_double_arguments_use_fp_file() {
    let mut h = Harness::new();
    let class = h.find_class("com/example/Calc");
    let mid = h.method_id(class, "testStaticFloat", "(FD)F", true);

    // Variadic promotion: the float travels as a double in v0, the
    // double in v1; the general file carries only class and method id.
    h.set_fp_arg(0, 0.456f32 as f64);
    h.set_fp_arg(1, 0.789123);
    let x0_before = h.vm.env_ptr();
    let x0_after = h.call(0x438, &[class, mid]); // CallStaticFloatMethod

    assert_eq!(h.fp_result_f32(), 0.002_394_201_7);
    assert_eq!(
        x0_after, x0_before,
        "general return path keeps its incoming value"
    );
}

#[test]
fn test_double_return_bit_pattern() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let mid = h.method_id(class, "half", "(D)D", false);

    h.set_fp_arg(0, 0.25);
    // Poison v0's high lanes to prove the return rewrites them.
    let mut lanes = h.be.read_vector(0).unwrap();
    lanes[8..].copy_from_slice(&[0xAA; 8]);
    h.be.write_vector(0, lanes).unwrap();

    h.call(0x1D0, &[obj, mid]); // CallDoubleMethod
    assert_eq!(h.fp_result_f64(), 0.125);
}

#[test]
fn test_va_list_with_mixed_int_and_fp_args() {
    let mut h = Harness::new();
    let class = h.find_class("com/example/Calc");
    let mid = h.method_id(class, "mix", "(IDID)D", true);

    let va = h.build_va_list(&[1, 2], &[3.5f64.to_bits(), 4.25f64.to_bits()]);
    h.call(0x458, &[class, mid, va]); // CallStaticDoubleMethodV
    assert_eq!(h.fp_result_f64(), 1.0 + 3.5 + 2.0 + 4.25);
}

#[test]
fn test_register_form_fp_args_spill_to_stack() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let mid = h.method_id(class, "sumd", "(DDDDDDDDDD)D", false);

    // v0..v7 carry the first eight doubles; the FP file exhausts
    // independently of the general one, so the last two land in 8-byte
    // stack slots even though x3..x7 are untouched.
    for i in 0..8 {
        h.set_fp_arg(i, (i + 1) as f64);
    }
    let sp = ARENA_BASE + 0x8800;
    h.be.set_sp(sp);
    h.be.write_u64(sp, 9.0f64.to_bits()).unwrap();
    h.be.write_u64(sp + 8, 10.0f64.to_bits()).unwrap();

    h.call(0x1D0, &[obj, mid]); // CallDoubleMethod
    assert_eq!(h.fp_result_f64(), 55.0);
}

#[test]
fn test_va_list_overflow_area() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let mid = h.method_id(class, "sum10", "(IIIIIIIIII)I", false);

    // Two ints in the saved-register area, eight on the overflow stack:
    // the cursor must switch regions when gr_offs reaches zero.
    let va = h.build_va_list(&[1, 2], &[]);
    let overflow = h.be.read_u64(va).unwrap();
    for (i, v) in (3u64..=10).enumerate() {
        h.be.write_u64(overflow + (i as u64) * 8, v).unwrap();
    }
    assert_eq!(h.call(0x190, &[obj, mid, va]), 55);
}

#[test]
fn test_va_list_fp_overflow_area() {
    let mut h = Harness::new();
    let class = h.find_class("com/example/Calc");
    let mid = h.method_id(class, "sumd", "(DDDDDDDDDD)D", true);

    // Two doubles in the saved vector area, eight more on the overflow
    // stack; the cursor leaves the vr region once vr_offs reaches zero.
    let va = h.build_va_list(&[], &[1.0f64.to_bits(), 2.0f64.to_bits()]);
    let overflow = h.be.read_u64(va).unwrap();
    for (i, v) in (3u64..=10).enumerate() {
        h.be.write_u64(overflow + (i as u64) * 8, (v as f64).to_bits())
            .unwrap();
    }
    h.call(0x458, &[class, mid, va]); // CallStaticDoubleMethodV
    assert_eq!(h.fp_result_f64(), 55.0);
}

#[test]
fn test_jvalue_array_keeps_unpromoted_floats() {
    let mut h = Harness::new();
    let class = h.find_class("com/example/Calc");
    let mid = h.method_id(class, "floatBits", "(F)I", true);

    // A jvalue union stores the float itself, not a promoted double.
    let jv = h.build_jvalues(&[u64::from(0.5f32.to_bits())]);
    let bits = h.call(0x418, &[class, mid, jv]); // CallStaticIntMethodA
    assert_eq!(bits as u32, 0.5f32.to_bits());
}

#[test]
fn test_object_arguments_resolve_through_reference_tables() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let mid = h.method_id(class, "use", "(Ljava/lang/String;)V", false);

    let s = h.new_string_utf("arg");
    assert_eq!(h.call(0x1E8, &[obj, mid, s]), 0); // CallVoidMethod

    // A stale handle as an argument is fatal, never silently null.
    let err = h.try_call(0x1E8, &[obj, mid, 0x4_0000_9999]).unwrap_err();
    assert!(err.to_string().contains("stale object handle"), "{err}");

    // Null is a legitimate reference argument.
    assert_eq!(h.call(0x1E8, &[obj, mid, 0]), 0);
}

#[test]
fn test_object_return_vends_a_local_reference() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let mid = h.method_id(class, "name", "()Ljava/lang/String;", false);

    let s = h.call(0x110, &[obj, mid]); // CallObjectMethod
    assert_ne!(s, 0);
    assert_eq!(h.string_of(s), "bob");
    assert_eq!(h.call(0x540, &[s]), 3, "usable as a string handle");
}

#[test]
fn test_new_object_runs_constructor() {
    let mut h = Harness::new();
    let class = h.find_class("com/example/Box");
    let ctor = h.method_id(class, "<init>", "(I)V", false);

    let obj = h.call(0xE0, &[class, ctor, 42]); // NewObject
    assert_ne!(obj, 0);
    let get = h.method_id(class, "get", "()I", false);
    assert_eq!(h.call(0x188, &[obj, get]), 42);

    // NewObjectV drives the same constructor through a va_list.
    let va = h.build_va_list(&[7], &[]);
    let obj2 = h.call(0xE8, &[class, ctor, va]);
    assert_eq!(h.call(0x188, &[obj2, get]), 7);
    assert_eq!(h.call(0xC0, &[obj, obj2]), 0, "distinct instances");
}

#[test]
fn test_nonvirtual_void_installs_constructed_state() {
    let mut h = Harness::new();
    let class = h.find_class("com/example/Box");
    let ctor = h.method_id(class, "<init>", "(I)V", false);
    let obj = h.call(0xD8, &[class]); // AllocObject, uninitialized

    let va = h.build_va_list(&[99], &[]);
    h.call(0x2E0, &[obj, class, ctor, va]); // CallNonvirtualVoidMethodV

    let get = h.method_id(class, "get", "()I", false);
    assert_eq!(h.call(0x188, &[obj, get]), 99);
}

#[test]
fn test_unhandled_method_is_a_fatal_fault() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let mid = h.method_id(class, "missing", "()V", false);

    let err = h.try_call(0x1E8, &[obj, mid]).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("no host implementation"), "{text}");
    assert!(text.contains("CallVoidMethod"), "slot context: {text}");

    // Nothing became guest-visible: the pending-exception slot is empty.
    assert_eq!(h.call(0x720, &[]), 0);
}

#[test]
fn test_return_kind_mismatch_is_fatal() {
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    // The facade answers int for add(II)I, but the guest dispatches
    // through the long-returning slot; the disagreement must not be
    // silently widened.
    let mid = h.method_id(class, "add", "(II)I", false);
    let va = h.build_va_list(&[2, 3], &[]);
    let err = h.try_call(0x1A8, &[obj, mid, va]).unwrap_err(); // CallLongMethodV
    let text = err.to_string();
    assert!(text.contains("type mismatch"), "{text}");
    assert!(text.contains("CallLongMethodV"), "{text}");
}

#[test]
fn test_reentrant_context_use_from_facade() {
    // name() calls back into the context (ctx.new_string) while its own
    // dispatch is still on the stack; the vended string must be a live
    // local reference afterwards.
    let mut h = Harness::new();
    let (class, obj) = calc_receiver(&mut h);
    let mid = h.method_id(class, "name", "()Ljava/lang/String;", false);
    let s = h.call(0x110, &[obj, mid]);
    assert_eq!(
        h.call(0x740, &[s]),
        dvm_bridge::RefKind::Local as u64,
        "returned reference is local"
    );
}

#[test]
fn test_to_reflected_method() {
    let mut h = Harness::new();
    let class = h.find_class("com/example/Calc");
    let mid = h.method_id(class, "add", "(II)I", true);
    let reflected = h.call(0x48, &[class, mid]);
    assert_ne!(reflected, 0);
    let obj = h.vm.lookup_object(reflected).unwrap();
    assert_eq!(obj.class().name(), "java/lang/reflect/Method");
}
