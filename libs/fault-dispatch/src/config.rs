// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Result;

/// Shape of the OS fault callback the handler is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAbi {
    /// `extern "C" fn(signum: i32, info: *mut siginfo_t, context: *mut c_void)`
    Posix,
    /// `extern "system" fn(info: *mut EXCEPTION_POINTERS) -> i32`
    Windows,
}

/// Where the handler reads whether the faulting access was a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFlagSource {
    /// A word in the `EXCEPTION_RECORD`.
    Record { offset: usize, mask: u32 },
    /// A word at a fixed offset into the `ucontext_t`.
    Context { offset: usize, mask: u32 },
    /// A word behind the machine context pointer stored in the `ucontext_t`.
    ContextIndirect {
        pointer_offset: usize,
        offset: usize,
        mask: u32,
    },
    /// The WnR bit of the ESR record in the Linux AArch64 `__reserved` context area, which
    /// starts at `reserved_offset` into the `ucontext_t`.
    EsrScan { reserved_offset: usize },
    /// The access kind is not available, every fault is reported as a read.
    None,
}

/// Where the OS puts everything the fault handler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultAbiConfig {
    pub abi: FaultAbi,
    /// Offset of the faulting address in the `siginfo_t` or `EXCEPTION_RECORD`.
    pub address_offset: usize,
    pub write_flag: WriteFlagSource,
    /// Faults delivered with this signal number chain to the previous `SIGBUS` disposition,
    /// all others to the previous `SIGSEGV` one.
    pub sigbus: i32,
}

impl FaultAbiConfig {
    /// Size of the Linux AArch64 `__reserved` context area.
    pub const ESR_SCAN_LIMIT: usize = 4096;
    /// Magic number of the ESR record in the Linux AArch64 `__reserved` context area.
    pub const ESR_MAGIC: u32 = 0x4553_5201;
    /// Bit of the ESR that is set for data aborts caused by a write.
    pub const ESR_WNR_BIT: u32 = 6;

    /// The fault ABI of the OS and architecture this crate was compiled for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedPlatform`](crate::Error::UnsupportedPlatform) if the layout of
    /// the OS fault structures is not known for this target.
    #[allow(
        clippy::unnecessary_wraps,
        reason = "only unsupported targets return an error"
    )]
    pub fn host() -> Result<Self> {
        cfg_if::cfg_if! {
            if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
                Ok(Self {
                    abi: FaultAbi::Posix,
                    address_offset: 16,
                    // uc_mcontext.gregs[REG_ERR], bit 1 is set for writes
                    write_flag: WriteFlagSource::Context {
                        offset: 0xc0,
                        mask: 1 << 1,
                    },
                    sigbus: libc::SIGBUS,
                })
            } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
                Ok(Self {
                    abi: FaultAbi::Posix,
                    address_offset: 16,
                    write_flag: WriteFlagSource::EsrScan {
                        reserved_offset: 464,
                    },
                    sigbus: libc::SIGBUS,
                })
            } else if #[cfg(all(target_vendor = "apple", target_arch = "x86_64"))] {
                Ok(Self {
                    abi: FaultAbi::Posix,
                    address_offset: 24,
                    // uc_mcontext->__es.__err
                    write_flag: WriteFlagSource::ContextIndirect {
                        pointer_offset: 48,
                        offset: 4,
                        mask: 1 << 1,
                    },
                    sigbus: libc::SIGBUS,
                })
            } else if #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))] {
                Ok(Self {
                    abi: FaultAbi::Posix,
                    address_offset: 24,
                    // uc_mcontext->__es.__esr
                    write_flag: WriteFlagSource::ContextIndirect {
                        pointer_offset: 48,
                        offset: 8,
                        mask: 1 << Self::ESR_WNR_BIT,
                    },
                    sigbus: libc::SIGBUS,
                })
            } else if #[cfg(all(windows, target_pointer_width = "64"))] {
                use core::mem::offset_of;
                use windows_sys::Win32::System::Diagnostics::Debug::EXCEPTION_RECORD;

                let information = offset_of!(EXCEPTION_RECORD, ExceptionInformation);
                Ok(Self {
                    abi: FaultAbi::Windows,
                    // ExceptionInformation[1]
                    address_offset: information + size_of::<usize>(),
                    // ExceptionInformation[0] is 1 for writes, 0 for reads and 8 for DEP
                    write_flag: WriteFlagSource::Record {
                        offset: information,
                        mask: 1,
                    },
                    sigbus: 0,
                })
            } else {
                Err(crate::Error::UnsupportedPlatform)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn fault_address_offset_matches_siginfo() {
        let config = FaultAbiConfig::host().unwrap();
        assert_eq!(config.abi, FaultAbi::Posix);

        // Safety: siginfo_t is plain old data
        let mut info: libc::siginfo_t = unsafe { core::mem::zeroed() };
        let base = (&raw mut info).cast::<u8>();
        // Safety: the offset lies within the siginfo_t
        unsafe {
            base.add(config.address_offset)
                .cast::<usize>()
                .write_unaligned(0xdead_b000);
            assert_eq!(info.si_addr() as usize, 0xdead_b000);
        }
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn write_flag_offset_matches_ucontext() {
        let config = FaultAbiConfig::host().unwrap();
        let WriteFlagSource::Context { offset, .. } = config.write_flag else {
            panic!("unexpected write flag source {:?}", config.write_flag);
        };

        // Safety: ucontext_t is plain old data
        let context: libc::ucontext_t = unsafe { core::mem::zeroed() };
        let base = (&raw const context) as usize;
        let reg_err = usize::try_from(libc::REG_ERR).unwrap();
        let err = (&raw const context.uc_mcontext.gregs[reg_err]) as usize;
        assert_eq!(err - base, offset);
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    fn reserved_offset_matches_ucontext() {
        let config = FaultAbiConfig::host().unwrap();
        let WriteFlagSource::EsrScan { reserved_offset } = config.write_flag else {
            panic!("unexpected write flag source {:?}", config.write_flag);
        };

        // Safety: ucontext_t is plain old data
        let context: libc::ucontext_t = unsafe { core::mem::zeroed() };
        let base = (&raw const context) as usize;
        let reserved = (&raw const context.uc_mcontext.__reserved) as usize;
        assert_eq!(reserved - base, reserved_offset);
    }
}
