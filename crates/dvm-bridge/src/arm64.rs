//! AAPCS64 argument access and return writing
//!
//! Trampolines see the guest exactly as it was at the call instruction:
//! the first eight integer/pointer arguments in `x0..x7`, later ones
//! spilled to the stack in 8-byte slots, and floating-point arguments in
//! `v0..v7` counted independently of the general file. Argument 0 is
//! always the `JNIEnv*` / `JavaVM*` table pointer.
//!
//! Return writing mirrors the target ABI: integer results are written to
//! `x0` extended per result width, boolean results normalize to exactly
//! `0`/`1`, and float/double results place their IEEE-754 bit pattern in
//! `v0` while `x0` is rewritten with its incoming value so the general
//! return path stays deterministic.

use crate::backend::{Backend, BackendExt};
use crate::BridgeResult;

/// Integer/pointer argument registers before stack spill
pub const GPR_ARGS: usize = 8;
/// Floating-point argument registers before stack spill
pub const FPR_ARGS: usize = 8;
/// Architectural index of the link register
pub const LR: usize = 30;

/// Fixed-argument reader over a trapped call frame
pub struct CallContext<'a> {
    backend: &'a mut dyn Backend,
}

impl<'a> CallContext<'a> {
    /// Wrap the trapped backend state
    pub fn new(backend: &'a mut dyn Backend) -> Self {
        CallContext { backend }
    }

    /// Logical integer/pointer argument `n` as a raw 64-bit value
    pub fn long_arg(&mut self, n: usize) -> BridgeResult<u64> {
        if n < GPR_ARGS {
            Ok(self.backend.read_gpr(n)?)
        } else {
            let sp = self.backend.read_sp()?;
            Ok(self.backend.read_u64(sp + ((n - GPR_ARGS) as u64) * 8)?)
        }
    }

    /// Logical argument `n` as a pointer (alias of [`CallContext::long_arg`])
    pub fn ptr_arg(&mut self, n: usize) -> BridgeResult<u64> {
        self.long_arg(n)
    }

    /// Logical argument `n` truncated to `jint`
    pub fn int_arg(&mut self, n: usize) -> BridgeResult<i32> {
        Ok(self.long_arg(n)? as u32 as i32)
    }

    /// Link register (call site, for diagnostics)
    pub fn lr(&mut self) -> BridgeResult<u64> {
        Ok(self.backend.read_gpr(LR)?)
    }
}

/// A typed return value to be written back into the trapped frame
#[derive(Debug, Clone, Copy)]
pub enum RetValue {
    /// `void`; `x0` is cleared
    Unit,
    /// `jboolean`, normalized to 0/1
    Boolean(bool),
    /// `jbyte`, sign-extended
    Byte(i8),
    /// `jchar`, zero-extended
    Char(u16),
    /// `jshort`, sign-extended
    Short(i16),
    /// `jint`, sign-extended
    Int(i32),
    /// `jlong`
    Long(i64),
    /// `jfloat`, delivered through `v0`
    Float(f32),
    /// `jdouble`, delivered through `v0`
    Double(f64),
    /// Handle or pointer, delivered raw
    Raw(u64),
}

/// Write `ret` into the trapped frame per the procedure-call standard
pub fn write_return(backend: &mut dyn Backend, ret: RetValue) -> BridgeResult<()> {
    match ret {
        RetValue::Unit => backend.write_gpr(0, 0)?,
        RetValue::Boolean(b) => backend.write_gpr(0, u64::from(b))?,
        RetValue::Byte(v) => backend.write_gpr(0, v as i64 as u64)?,
        RetValue::Char(v) => backend.write_gpr(0, u64::from(v))?,
        RetValue::Short(v) => backend.write_gpr(0, v as i64 as u64)?,
        RetValue::Int(v) => backend.write_gpr(0, v as i64 as u64)?,
        RetValue::Long(v) => backend.write_gpr(0, v as u64)?,
        RetValue::Raw(v) => backend.write_gpr(0, v)?,
        RetValue::Float(v) => {
            let mut lanes = [0u8; 16];
            lanes[..4].copy_from_slice(&v.to_le_bytes());
            backend.write_vector(0, lanes)?;
            let x0 = backend.read_gpr(0)?;
            backend.write_gpr(0, x0)?;
        }
        RetValue::Double(v) => {
            let mut lanes = [0u8; 16];
            lanes[..8].copy_from_slice(&v.to_le_bytes());
            backend.write_vector(0, lanes)?;
            let x0 = backend.read_gpr(0)?;
            backend.write_gpr(0, x0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::backend::BackendExt;

    #[test]
    fn test_register_and_stack_args() {
        let mut be = MockBackend::new(1 << 16);
        for i in 0..8 {
            be.write_gpr(i, 100 + i as u64).unwrap();
        }
        let sp = crate::backend::mock::ARENA_BASE + 0x100;
        be.set_sp(sp);
        be.write_u64(sp, 108).unwrap();
        be.write_u64(sp + 8, 109).unwrap();

        let mut ctx = CallContext::new(&mut be);
        assert_eq!(ctx.long_arg(0).unwrap(), 100);
        assert_eq!(ctx.long_arg(7).unwrap(), 107);
        assert_eq!(ctx.long_arg(8).unwrap(), 108);
        assert_eq!(ctx.long_arg(9).unwrap(), 109);
    }

    #[test]
    fn test_int_arg_ignores_high_half() {
        let mut be = MockBackend::new(4096);
        be.write_gpr(1, 0xdead_beef_ffff_fff6).unwrap();
        let mut ctx = CallContext::new(&mut be);
        assert_eq!(ctx.int_arg(1).unwrap(), -10);
    }

    #[test]
    fn test_integer_return_extension() {
        let mut be = MockBackend::new(4096);
        write_return(&mut be, RetValue::Byte(-1)).unwrap();
        assert_eq!(be.read_gpr(0).unwrap(), u64::MAX);
        write_return(&mut be, RetValue::Short(-2)).unwrap();
        assert_eq!(be.read_gpr(0).unwrap(), 0xffff_ffff_ffff_fffe);
        write_return(&mut be, RetValue::Char(0xffff)).unwrap();
        assert_eq!(be.read_gpr(0).unwrap(), 0xffff);
        write_return(&mut be, RetValue::Boolean(true)).unwrap();
        assert_eq!(be.read_gpr(0).unwrap(), 1);
    }

    #[test]
    fn test_float_return_leaves_gpr_path_populated() {
        let mut be = MockBackend::new(4096);
        be.write_gpr(0, 0x4242).unwrap();
        write_return(&mut be, RetValue::Double(0.12345)).unwrap();
        let lanes = be.read_vector(0).unwrap();
        assert_eq!(&lanes[..8], &0.12345f64.to_le_bytes());
        assert_eq!(be.read_gpr(0).unwrap(), 0x4242);

        write_return(&mut be, RetValue::Float(0.456)).unwrap();
        let lanes = be.read_vector(0).unwrap();
        assert_eq!(&lanes[..4], &0.456f32.to_le_bytes());
    }
}
