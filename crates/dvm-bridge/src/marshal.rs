//! The three guest argument protocols
//!
//! Variadic table entries receive their Java-level arguments one of three
//! ways, and all of them decode here into one [`Arguments`] cursor:
//!
//! - **registers** (`Call*Method`): the call continues the fixed-argument
//!   sequence, so integer arguments pick up in the general file after the
//!   fixed slots and floating arguments start at `v0`, each class
//!   spilling to 8-byte stack slots once its registers run out. C
//!   variadic promotion applies: floats arrive as doubles, sub-int
//!   integers as full words.
//! - **va_list** (`Call*MethodV`): the AArch64 `va_list` record in guest
//!   memory — `{ stack, gr_top, vr_top, gr_offs, vr_offs }` with negative
//!   offsets walking up the saved register regions (8-byte general slots,
//!   16-byte vector slots) before falling back to the overflow stack.
//!   Promotion applies as above.
//! - **jvalue array** (`Call*MethodA`): packed 8-byte unions, one per
//!   declared parameter, each holding an unpromoted value of exactly the
//!   declared type.
//!
//! Object-typed parameters are resolved through the reference tables at
//! decode time; a non-null handle that resolves to nothing means the
//! guest is passing stale state and the call is aborted.

use dvm_sdk::{Arguments, JValue, JavaType, MethodSignature};

use crate::arm64::{FPR_ARGS, GPR_ARGS};
use crate::backend::{Backend, BackendExt};
use crate::vm::DalvikVm;
use crate::{BridgeError, BridgeResult};

/// Decode arguments passed in live registers, continuing after
/// `fixed_gprs` already-consumed general slots
pub fn from_registers(
    vm: &DalvikVm,
    backend: &mut dyn Backend,
    sig: &MethodSignature,
    fixed_gprs: usize,
) -> BridgeResult<Arguments> {
    let mut gpr = fixed_gprs;
    let mut fpr = 0usize;
    let mut stack = 0usize;
    let sp = backend.read_sp()?;

    let mut stack_slot = |backend: &mut dyn Backend, stack: &mut usize| -> BridgeResult<u64> {
        let value = backend.read_u64(sp + (*stack as u64) * 8)?;
        *stack += 1;
        Ok(value)
    };

    let mut values = Vec::with_capacity(sig.params().len());
    for &ty in sig.params() {
        let value = if ty.is_floating() {
            let bits = if fpr < FPR_ARGS {
                let lanes = backend.read_vector(fpr)?;
                fpr += 1;
                u64::from_le_bytes(lanes[..8].try_into().unwrap())
            } else {
                stack_slot(backend, &mut stack)?
            };
            promoted_float(ty, bits)
        } else {
            let word = if gpr < GPR_ARGS {
                let value = backend.read_gpr(gpr)?;
                gpr += 1;
                value
            } else {
                stack_slot(backend, &mut stack)?
            };
            decode_word(vm, ty, word)?
        };
        values.push(value);
    }
    Ok(Arguments::new(values))
}

/// Decode arguments from an AArch64 `va_list` record at `va_ptr`
pub fn from_va_list(
    vm: &DalvikVm,
    backend: &mut dyn Backend,
    sig: &MethodSignature,
    va_ptr: u64,
) -> BridgeResult<Arguments> {
    let mut stack = backend.read_u64(va_ptr)?;
    let gr_top = backend.read_u64(va_ptr + 8)?;
    let vr_top = backend.read_u64(va_ptr + 16)?;
    let mut gr_offs = backend.read_i32(va_ptr + 24)?;
    let mut vr_offs = backend.read_i32(va_ptr + 28)?;

    let mut overflow = |backend: &mut dyn Backend, stack: &mut u64| -> BridgeResult<u64> {
        let value = backend.read_u64(*stack)?;
        *stack += 8;
        Ok(value)
    };

    let mut values = Vec::with_capacity(sig.params().len());
    for &ty in sig.params() {
        let value = if ty.is_floating() {
            let bits = if vr_offs < 0 {
                let addr = vr_top.wrapping_add_signed(i64::from(vr_offs));
                vr_offs += 16;
                backend.read_u64(addr)?
            } else {
                overflow(backend, &mut stack)?
            };
            promoted_float(ty, bits)
        } else {
            let word = if gr_offs < 0 {
                let addr = gr_top.wrapping_add_signed(i64::from(gr_offs));
                gr_offs += 8;
                backend.read_u64(addr)?
            } else {
                overflow(backend, &mut stack)?
            };
            decode_word(vm, ty, word)?
        };
        values.push(value);
    }
    Ok(Arguments::new(values))
}

/// Decode arguments from a packed `jvalue` array at `array_ptr`
pub fn from_jvalue_array(
    vm: &DalvikVm,
    backend: &mut dyn Backend,
    sig: &MethodSignature,
    array_ptr: u64,
) -> BridgeResult<Arguments> {
    let mut values = Vec::with_capacity(sig.params().len());
    for (index, &ty) in sig.params().iter().enumerate() {
        let word = backend.read_u64(array_ptr + (index as u64) * 8)?;
        let value = match ty {
            // jvalue members are stored unpromoted.
            JavaType::Float => JValue::Float(f32::from_bits(word as u32)),
            JavaType::Double => JValue::Double(f64::from_bits(word)),
            _ => decode_word(vm, ty, word)?,
        };
        values.push(value);
    }
    Ok(Arguments::new(values))
}

/// A promoted floating argument: variadic callers widen `float` to
/// `double`, so both kinds travel as 64-bit patterns and `float`
/// narrows back on decode.
fn promoted_float(ty: JavaType, bits: u64) -> JValue {
    let wide = f64::from_bits(bits);
    match ty {
        JavaType::Float => JValue::Float(wide as f32),
        _ => JValue::Double(wide),
    }
}

/// Decode one integer/reference word per the declared kind
pub(crate) fn decode_word(vm: &DalvikVm, ty: JavaType, word: u64) -> BridgeResult<JValue> {
    Ok(match ty {
        JavaType::Boolean => JValue::Boolean(word as u8 != 0),
        JavaType::Byte => JValue::Byte(word as u8 as i8),
        JavaType::Char => JValue::Char(word as u16),
        JavaType::Short => JValue::Short(word as u16 as i16),
        JavaType::Int => JValue::Int(word as u32 as i32),
        JavaType::Long => JValue::Long(word as i64),
        JavaType::Reference => {
            if word == 0 {
                JValue::Object(None)
            } else {
                let object = vm
                    .lookup_object(word)
                    .ok_or(BridgeError::StaleHandle { handle: word })?;
                JValue::Object(Some(object))
            }
        }
        JavaType::Float | JavaType::Double | JavaType::Void => {
            // Callers route floating kinds through promoted_float and
            // never declare void parameters.
            return Err(BridgeError::Jni(dvm_sdk::JniError::mismatch(
                "integer or reference parameter",
                ty.name(),
            )));
        }
    })
}
