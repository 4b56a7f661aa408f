// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Backend-neutral unwind metadata of mapped functions.
//!
//! Prologues are described as a list of pseudo operations in the order they execute. On Windows
//! x86_64 the list is lowered to an `UNWIND_INFO` structure on demand, see
//! <https://learn.microsoft.com/en-us/cpp/build/exception-handling-x64>.

/// Maximum number of `UNWIND_CODE` slots a lowered prologue may occupy.
pub const MAX_UNWIND_CODES: usize = 32;

/// Size of the largest `UNWIND_INFO` [`UnwindInfo::encode_windows_x64`] produces.
pub const MAX_WINDOWS_UNWIND_INFO_SIZE: usize = 4 + 2 * MAX_UNWIND_CODES;

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const UWOP_SAVE_NONVOL: u8 = 4;
const UWOP_SAVE_NONVOL_FAR: u8 = 5;
const UWOP_SAVE_XMM128: u8 = 8;
const UWOP_SAVE_XMM128_FAR: u8 = 9;

const UNWIND_INFO_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindPseudoOp {
    /// `push reg`, `reg_index` is the pushed general purpose register.
    PushReg,
    /// `mov [rsp + stack_offset], reg` of a general purpose register.
    SaveReg,
    /// `movdqa [rsp + stack_offset], xmm`, `reg_index` is the xmm register.
    SaveXmm128,
    /// `sub rsp, size`.
    AllocStack,
    /// `lea frame, [rsp + offset]`, `reg_index` is the frame register.
    SetFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindPushEntry {
    pub op: UnwindPseudoOp,
    /// Offset of the end of the instruction from the function start.
    pub prolog_offset: u32,
    pub reg_index: u32,
    pub stack_offset_or_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnwindInfo {
    pub prolog_size: u32,
    pub push_entries: Vec<UnwindPushEntry>,
}

impl UnwindInfo {
    pub fn new(prolog_size: u32, push_entries: Vec<UnwindPushEntry>) -> Self {
        Self {
            prolog_size,
            push_entries,
        }
    }

    /// Lowers the prologue description to a Windows x86_64 `UNWIND_INFO`.
    ///
    /// Returns the buffer and the number of bytes used, or `None` if the prologue cannot be
    /// expressed (too many codes, misaligned offsets, or a prologue longer than 255 bytes).
    pub fn encode_windows_x64(&self) -> Option<([u8; MAX_WINDOWS_UNWIND_INFO_SIZE], usize)> {
        let mut codes = [0_u16; MAX_UNWIND_CODES];
        let mut count = 0;
        let mut frame = 0_u8;

        let mut push = |code: u16| -> Option<()> {
            *codes.get_mut(count)? = code;
            count += 1;
            Some(())
        };

        // codes are stored in reverse execution order
        for entry in self.push_entries.iter().rev() {
            let offset = u8::try_from(entry.prolog_offset).ok()?;
            let reg = u8::try_from(entry.reg_index).ok().filter(|reg| *reg < 16)?;
            let value = entry.stack_offset_or_size;

            match entry.op {
                UnwindPseudoOp::PushReg => push(pack(offset, UWOP_PUSH_NONVOL, reg))?,
                UnwindPseudoOp::SaveReg => {
                    if value % 8 != 0 {
                        return None;
                    }
                    if let Ok(scaled) = u16::try_from(value / 8) {
                        push(pack(offset, UWOP_SAVE_NONVOL, reg))?;
                        push(scaled)?;
                    } else {
                        push(pack(offset, UWOP_SAVE_NONVOL_FAR, reg))?;
                        push_u32(&mut push, value)?;
                    }
                }
                UnwindPseudoOp::SaveXmm128 => {
                    if value % 16 != 0 {
                        return None;
                    }
                    if let Ok(scaled) = u16::try_from(value / 16) {
                        push(pack(offset, UWOP_SAVE_XMM128, reg))?;
                        push(scaled)?;
                    } else {
                        push(pack(offset, UWOP_SAVE_XMM128_FAR, reg))?;
                        push_u32(&mut push, value)?;
                    }
                }
                UnwindPseudoOp::AllocStack => {
                    if value == 0 || value % 8 != 0 {
                        return None;
                    }
                    if value <= 128 {
                        let info = u8::try_from(value / 8 - 1).ok()?;
                        push(pack(offset, UWOP_ALLOC_SMALL, info))?;
                    } else if let Ok(scaled) = u16::try_from(value / 8) {
                        push(pack(offset, UWOP_ALLOC_LARGE, 0))?;
                        push(scaled)?;
                    } else {
                        push(pack(offset, UWOP_ALLOC_LARGE, 1))?;
                        push_u32(&mut push, value)?;
                    }
                }
                UnwindPseudoOp::SetFrame => {
                    if value % 16 != 0 || value > 240 {
                        return None;
                    }
                    let scaled = u8::try_from(value / 16).ok()?;
                    frame = reg | (scaled << 4);
                    push(pack(offset, UWOP_SET_FPREG, 0))?;
                }
            }
        }

        let mut out = [0_u8; MAX_WINDOWS_UNWIND_INFO_SIZE];
        out[0] = UNWIND_INFO_VERSION;
        out[1] = u8::try_from(self.prolog_size).ok()?;
        out[2] = u8::try_from(count).ok()?;
        out[3] = frame;
        for (chunk, code) in out[4..].chunks_exact_mut(2).zip(&codes[..count]) {
            chunk.copy_from_slice(&code.to_le_bytes());
        }

        // the code array is padded to an even number of slots
        let len = 4 + 2 * count.next_multiple_of(2);
        Some((out, len))
    }

    /// Reconstructs the prologue description from a Windows x86_64 `UNWIND_INFO`, as emitted by
    /// code generators.
    ///
    /// Returns `None` for malformed input or operations without a pseudo op counterpart.
    pub fn decode_windows_x64(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..4)?;
        if header[0] & 0x7 != UNWIND_INFO_VERSION {
            return None;
        }
        let prolog_size = u32::from(header[1]);
        let count = usize::from(header[2]);
        let frame_reg = u32::from(header[3] & 0xf);
        let frame_offset = u32::from(header[3] >> 4) * 16;

        let codes: Vec<u16> = bytes
            .get(4..4 + 2 * count)?
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();

        let mut entries = Vec::with_capacity(count);
        let mut slots = codes.iter().copied();
        while let Some(code) = slots.next() {
            let [prolog_offset, op_info] = code.to_le_bytes();
            let prolog_offset = u32::from(prolog_offset);
            let op = op_info & 0xf;
            let info = u32::from(op_info >> 4);

            let (op, reg_index, stack_offset_or_size) = match (op, info) {
                (UWOP_PUSH_NONVOL, reg) => (UnwindPseudoOp::PushReg, reg, 0),
                (UWOP_ALLOC_SMALL, scaled) => (UnwindPseudoOp::AllocStack, 0, scaled * 8 + 8),
                (UWOP_ALLOC_LARGE, 0) => {
                    (UnwindPseudoOp::AllocStack, 0, u32::from(slots.next()?) * 8)
                }
                (UWOP_ALLOC_LARGE, 1) => (UnwindPseudoOp::AllocStack, 0, next_u32(&mut slots)?),
                (UWOP_SET_FPREG, _) => (UnwindPseudoOp::SetFrame, frame_reg, frame_offset),
                (UWOP_SAVE_NONVOL, reg) => {
                    (UnwindPseudoOp::SaveReg, reg, u32::from(slots.next()?) * 8)
                }
                (UWOP_SAVE_NONVOL_FAR, reg) => {
                    (UnwindPseudoOp::SaveReg, reg, next_u32(&mut slots)?)
                }
                (UWOP_SAVE_XMM128, reg) => {
                    (UnwindPseudoOp::SaveXmm128, reg, u32::from(slots.next()?) * 16)
                }
                (UWOP_SAVE_XMM128_FAR, reg) => {
                    (UnwindPseudoOp::SaveXmm128, reg, next_u32(&mut slots)?)
                }
                _ => return None,
            };

            entries.push(UnwindPushEntry {
                op,
                prolog_offset,
                reg_index,
                stack_offset_or_size,
            });
        }

        entries.reverse();
        Some(Self::new(prolog_size, entries))
    }
}

#[inline]
fn pack(prolog_offset: u8, op: u8, info: u8) -> u16 {
    u16::from_le_bytes([prolog_offset, op | (info << 4)])
}

fn push_u32(push: &mut impl FnMut(u16) -> Option<()>, value: u32) -> Option<()> {
    #[expect(clippy::cast_possible_truncation, reason = "split into halves")]
    let (low, high) = (value as u16, (value >> 16) as u16);
    push(low)?;
    push(high)
}

fn next_u32(slots: &mut impl Iterator<Item = u16>) -> Option<u32> {
    let low = u32::from(slots.next()?);
    let high = u32::from(slots.next()?);
    Some(low | (high << 16))
}
