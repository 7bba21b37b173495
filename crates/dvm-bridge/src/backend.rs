//! CPU/memory backend contract
//!
//! The bridge never owns an instruction emulator. Whatever executes the
//! guest — Unicorn, a hypervisor, an in-process interpreter — is adapted
//! through [`Backend`]: general and SIMD register access, guest memory
//! access, scoped allocation for tables and `Get*Chars`-style blocks, and
//! registration of synthetic supervisor-call addresses that trap back
//! into the dispatcher.
//!
//! [`mock::MockBackend`] is a complete software implementation (register
//! file plus a flat arena) used by the test suites and by embedders that
//! want to exercise facade code without booting an emulator.

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Faults raised by the CPU/memory backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Access to an unmapped or partially mapped guest range
    #[error("unmapped guest memory access at {addr:#x} (+{len})")]
    Unmapped {
        /// Start of the faulting access
        addr: u64,
        /// Access length in bytes
        len: usize,
    },

    /// Register index outside the architectural file
    #[error("invalid register x{0}")]
    InvalidRegister(usize),

    /// Guest allocation could not be satisfied
    #[error("guest allocation of {size} bytes failed")]
    OutOfMemory {
        /// Requested size
        size: usize,
    },

    /// Backend-specific failure
    #[error("{0}")]
    Other(String),
}

/// The bridge's view of the external CPU emulator.
///
/// Register indices follow the architectural numbering: `0..=30` for
/// `x0..x30` (so 30 is the link register), and `0..=31` for the `v`
/// SIMD/FP file.
pub trait Backend {
    /// Read general register `xN`
    fn read_gpr(&mut self, index: usize) -> BackendResult<u64>;

    /// Write general register `xN`
    fn write_gpr(&mut self, index: usize, value: u64) -> BackendResult<()>;

    /// Read the stack pointer
    fn read_sp(&mut self) -> BackendResult<u64>;

    /// Read SIMD/FP register `vN` (full 128 bits, little-endian lanes)
    fn read_vector(&mut self, index: usize) -> BackendResult<[u8; 16]>;

    /// Write SIMD/FP register `vN`
    fn write_vector(&mut self, index: usize, value: [u8; 16]) -> BackendResult<()>;

    /// Read guest memory into `buf`
    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> BackendResult<()>;

    /// Write guest memory from `data`
    fn write_mem(&mut self, addr: u64, data: &[u8]) -> BackendResult<()>;

    /// Allocate a guest block; `label` is diagnostic only
    fn allocate(&mut self, size: usize, label: &str) -> BackendResult<u64>;

    /// Release a block previously returned by [`Backend::allocate`].
    ///
    /// Backends without reclamation may accept and ignore this.
    fn free(&mut self, addr: u64) -> BackendResult<()> {
        let _ = addr;
        Ok(())
    }

    /// Reserve a fresh guest address that traps to the host when executed
    fn register_svc(&mut self, label: &str) -> BackendResult<u64>;
}

/// Typed guest-memory helpers layered over raw [`Backend`] access
pub trait BackendExt: Backend {
    /// Read a little-endian `u64`
    fn read_u64(&mut self, addr: u64) -> BackendResult<u64> {
        let mut buf = [0u8; 8];
        self.read_mem(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian `u64`
    fn write_u64(&mut self, addr: u64, value: u64) -> BackendResult<()> {
        self.write_mem(addr, &value.to_le_bytes())
    }

    /// Read a little-endian `u32`
    fn read_u32(&mut self, addr: u64) -> BackendResult<u32> {
        let mut buf = [0u8; 4];
        self.read_mem(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a little-endian `u32`
    fn write_u32(&mut self, addr: u64, value: u32) -> BackendResult<()> {
        self.write_mem(addr, &value.to_le_bytes())
    }

    /// Read a little-endian `i32`
    fn read_i32(&mut self, addr: u64) -> BackendResult<i32> {
        Ok(self.read_u32(addr)? as i32)
    }

    /// Read `len` bytes
    fn read_bytes(&mut self, addr: u64, len: usize) -> BackendResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_mem(addr, &mut buf)?;
        Ok(buf)
    }

    /// Read a NUL-terminated string, replacing invalid UTF-8
    fn read_c_string(&mut self, addr: u64) -> BackendResult<String> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        let mut byte = [0u8; 1];
        loop {
            self.read_mem(cursor, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
            cursor += 1;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<B: Backend + ?Sized> BackendExt for B {}

pub mod mock {
    //! Software backend: a register file and a flat memory arena

    use super::{Backend, BackendError, BackendResult};

    /// Base guest address of the arena
    pub const ARENA_BASE: u64 = 0x1000_0000;
    /// Synthetic supervisor-call addresses are vended from here, outside
    /// the arena, so executing one can never alias real guest memory.
    pub const SVC_BASE: u64 = 0xffff_0000_0000;

    /// In-process backend with no instruction execution.
    ///
    /// Allocation is a bump pointer from the top of the arena; the lower
    /// part is free for test stacks and scratch buffers.
    pub struct MockBackend {
        gprs: [u64; 31],
        sp: u64,
        vectors: [[u8; 16]; 32],
        arena: Vec<u8>,
        alloc_next: u64,
        svc_next: u64,
    }

    impl MockBackend {
        /// Create a backend with an arena of `size` bytes
        pub fn new(size: usize) -> Self {
            MockBackend {
                gprs: [0; 31],
                sp: ARENA_BASE + size as u64 / 2,
                vectors: [[0; 16]; 32],
                arena: vec![0; size],
                alloc_next: ARENA_BASE + size as u64 / 2,
                svc_next: SVC_BASE,
            }
        }

        /// Default 16 MiB arena
        pub fn with_default_arena() -> Self {
            MockBackend::new(16 * 1024 * 1024)
        }

        fn range(&self, addr: u64, len: usize) -> BackendResult<std::ops::Range<usize>> {
            let end = addr
                .checked_add(len as u64)
                .ok_or(BackendError::Unmapped { addr, len })?;
            let limit = ARENA_BASE + self.arena.len() as u64;
            if addr < ARENA_BASE || end > limit {
                return Err(BackendError::Unmapped { addr, len });
            }
            let start = (addr - ARENA_BASE) as usize;
            Ok(start..start + len)
        }

        /// Copy `data` into freshly allocated guest memory
        pub fn alloc_bytes(&mut self, data: &[u8], label: &str) -> BackendResult<u64> {
            let addr = self.allocate(data.len(), label)?;
            self.write_mem(addr, data)?;
            Ok(addr)
        }

        /// Copy `text` plus a NUL terminator into guest memory
        pub fn alloc_c_string(&mut self, text: &str, label: &str) -> BackendResult<u64> {
            let mut data = text.as_bytes().to_vec();
            data.push(0);
            self.alloc_bytes(&data, label)
        }
    }

    impl Backend for MockBackend {
        fn read_gpr(&mut self, index: usize) -> BackendResult<u64> {
            self.gprs
                .get(index)
                .copied()
                .ok_or(BackendError::InvalidRegister(index))
        }

        fn write_gpr(&mut self, index: usize, value: u64) -> BackendResult<()> {
            match self.gprs.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(BackendError::InvalidRegister(index)),
            }
        }

        fn read_sp(&mut self) -> BackendResult<u64> {
            Ok(self.sp)
        }

        fn read_vector(&mut self, index: usize) -> BackendResult<[u8; 16]> {
            self.vectors
                .get(index)
                .copied()
                .ok_or(BackendError::InvalidRegister(index))
        }

        fn write_vector(&mut self, index: usize, value: [u8; 16]) -> BackendResult<()> {
            match self.vectors.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(BackendError::InvalidRegister(index)),
            }
        }

        fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> BackendResult<()> {
            let range = self.range(addr, buf.len())?;
            buf.copy_from_slice(&self.arena[range]);
            Ok(())
        }

        fn write_mem(&mut self, addr: u64, data: &[u8]) -> BackendResult<()> {
            let range = self.range(addr, data.len())?;
            self.arena[range].copy_from_slice(data);
            Ok(())
        }

        fn allocate(&mut self, size: usize, _label: &str) -> BackendResult<u64> {
            // 8-byte aligned bump allocation; nothing is ever reclaimed.
            let aligned = (size.max(1) + 7) & !7;
            let limit = ARENA_BASE + self.arena.len() as u64;
            if self.alloc_next + aligned as u64 > limit {
                return Err(BackendError::OutOfMemory { size });
            }
            let addr = self.alloc_next;
            self.alloc_next += aligned as u64;
            Ok(addr)
        }

        fn register_svc(&mut self, _label: &str) -> BackendResult<u64> {
            let addr = self.svc_next;
            self.svc_next += 4;
            Ok(addr)
        }
    }

    impl MockBackend {
        /// Set the stack pointer (tests build call frames by hand)
        pub fn set_sp(&mut self, sp: u64) {
            self.sp = sp;
        }
    }
}
