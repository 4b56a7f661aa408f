// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Generates the native fault handler.
//!
//! The handler runs in signal (or vectored exception) context, so it is built from nothing but
//! loads, compares, branches, atomic adds and indirect calls through addresses that are resolved
//! when the handler is generated. In pseudo code it does the following:
//!
//! ```text
//! handlers_entered += 1
//! address, is_write = <read from the OS fault structures>
//! handled = false
//! for slot in table.ranges:
//!     if slot.is_active == 1 && slot.start <= address < slot.end && slot.callback != null:
//!         offset = (address - slot.start) & !(page_size - 1)
//!         handled |= slot.callback(offset, page_size, is_write, 0)
//! if handled || retry_from_access_violation():
//!     handlers_completed += 1
//!     resume
//! handlers_completed += 1
//! chain to the previous handler
//! ```

use core::ptr;

use anyhow::anyhow;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::types::{I8, I32, I64};
use cranelift_codegen::ir::{
    self, AbiParam, AtomicRmwOp, InstBuilder, MemFlags, Signature, UserFuncName, Value,
};
use cranelift_frontend::FunctionBuilder;
use unmap_guard::PartialUnmapState;

use crate::compiler::{CompiledFunction, CraneliftCompiler};
use crate::config::{FaultAbi, FaultAbiConfig, WriteFlagSource};
use crate::table::{MAX_TRACKED_RANGES, PreviousHandler, SignalHandlerConfig, TrackedRange};
use crate::{Error, Result};

const EXCEPTION_ACCESS_VIOLATION: u32 = 0xc000_0005;
const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// Addresses baked into the generated handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampolineTargets {
    pub table: usize,
    pub handlers_entered: usize,
    pub handlers_completed: usize,
    /// An `extern "C" fn() -> u8` returning non-zero if the faulting access should be retried.
    pub retry: usize,
    pub page_size: usize,
}

impl TrampolineTargets {
    pub fn new(
        table: &'static SignalHandlerConfig,
        state: &'static PartialUnmapState,
        retry: extern "C" fn() -> u8,
        page_size: usize,
    ) -> Self {
        debug_assert!(page_size.is_power_of_two());

        Self {
            table: ptr::from_ref(table) as usize,
            handlers_entered: state.handlers_entered_ptr() as usize,
            handlers_completed: state.handlers_completed_ptr() as usize,
            retry: retry as usize,
            page_size,
        }
    }

    /// Targets wired to the process-wide table and partial unmap state.
    pub fn global() -> Self {
        Self::new(
            SignalHandlerConfig::global(),
            PartialUnmapState::global(),
            unmap_guard::retry_from_access_violation,
            code_cache::page_size(),
        )
    }
}

#[derive(Debug)]
pub struct TrampolineSynthesizer<'a> {
    compiler: &'a CraneliftCompiler,
    config: FaultAbiConfig,
    targets: TrampolineTargets,
}

impl<'a> TrampolineSynthesizer<'a> {
    pub fn new(
        compiler: &'a CraneliftCompiler,
        config: FaultAbiConfig,
        targets: TrampolineTargets,
    ) -> Self {
        Self {
            compiler,
            config,
            targets,
        }
    }

    /// Generates the fault handler for the configured ABI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compile`] if an offset does not fit an address immediate or code
    /// generation fails.
    pub fn synthesize(&self) -> Result<CompiledFunction> {
        let compiled = match self.config.abi {
            FaultAbi::Posix => self.synthesize_posix()?,
            FaultAbi::Windows => self.synthesize_windows()?,
        };

        tracing::debug!(
            abi = ?self.config.abi,
            instructions = compiled.instruction_count(),
            code_size = compiled.code().len(),
            "synthesized fault handler"
        );
        Ok(compiled)
    }

    /// `extern "C" fn(signum: i32, info: *mut siginfo_t, context: *mut c_void)`
    fn synthesize_posix(&self) -> Result<CompiledFunction> {
        let pointer_type = self.compiler.pointer_type();
        let mut sig = Signature::new(self.compiler.call_conv());
        sig.params.push(AbiParam::new(I32).sext());
        sig.params.push(AbiParam::new(pointer_type));
        sig.params.push(AbiParam::new(pointer_type));

        let mut function_compiler = self.compiler.function_compiler();
        let func = ir::Function::with_name_signature(UserFuncName::default(), sig);
        let (mut builder, block0) = function_compiler.builder(func);
        let (signum, info, context) = {
            let params = builder.block_params(block0);
            (params[0], params[1], params[2])
        };

        self.bump_counter(&mut builder, self.targets.handlers_entered);
        let address = builder.ins().load(
            pointer_type,
            MemFlags::trusted(),
            info,
            offset32(self.config.address_offset)?,
        );
        let is_write = self.load_write_flag(&mut builder, info, context)?;
        let handled = self.scan_ranges(&mut builder, address, is_write)?;

        let resume_block = builder.create_block();
        let chain_block = builder.create_block();
        self.retry_unless_handled(&mut builder, handled, resume_block, chain_block);

        builder.switch_to_block(resume_block);
        self.bump_counter(&mut builder, self.targets.handlers_completed);
        builder.ins().return_(&[]);

        // The previous handler may never return, so the fault counts as completed before chaining.
        builder.switch_to_block(chain_block);
        self.bump_counter(&mut builder, self.targets.handlers_completed);
        self.chain_to_previous(&mut builder, signum, info, context)?;

        builder.seal_all_blocks();
        builder.finalize();

        function_compiler.finish()
    }

    /// `extern "system" fn(info: *mut EXCEPTION_POINTERS) -> i32`
    fn synthesize_windows(&self) -> Result<CompiledFunction> {
        let pointer_type = self.compiler.pointer_type();
        let mut sig = Signature::new(self.compiler.call_conv());
        sig.params.push(AbiParam::new(pointer_type));
        sig.returns.push(AbiParam::new(I32));

        let mut function_compiler = self.compiler.function_compiler();
        let func = ir::Function::with_name_signature(UserFuncName::default(), sig);
        let (mut builder, block0) = function_compiler.builder(func);
        let exception_pointers = builder.block_params(block0)[0];

        let record = builder.ins().load(
            pointer_type,
            MemFlags::trusted(),
            exception_pointers,
            0,
        );
        let context = builder.ins().load(
            pointer_type,
            MemFlags::trusted(),
            exception_pointers,
            offset32(size_of::<usize>())?,
        );

        // everything but access violations is somebody else's business
        let code = builder.ins().load(I32, MemFlags::trusted(), record, 0);
        let access_violation = builder
            .ins()
            .iconst(I32, i64::from(EXCEPTION_ACCESS_VIOLATION));
        let is_access_violation = builder.ins().icmp(IntCC::Equal, code, access_violation);
        let body_block = builder.create_block();
        let search_block = builder.create_block();
        builder
            .ins()
            .brif(is_access_violation, body_block, &[], search_block, &[]);

        builder.switch_to_block(search_block);
        let search = i32_imm(&mut builder, EXCEPTION_CONTINUE_SEARCH);
        builder.ins().return_(&[search]);

        builder.switch_to_block(body_block);
        self.bump_counter(&mut builder, self.targets.handlers_entered);
        let address = builder.ins().load(
            pointer_type,
            MemFlags::trusted(),
            record,
            offset32(self.config.address_offset)?,
        );
        let is_write = self.load_write_flag(&mut builder, record, context)?;
        let handled = self.scan_ranges(&mut builder, address, is_write)?;

        let resume_block = builder.create_block();
        let chain_block = builder.create_block();
        self.retry_unless_handled(&mut builder, handled, resume_block, chain_block);

        builder.switch_to_block(resume_block);
        self.bump_counter(&mut builder, self.targets.handlers_completed);
        let resume = i32_imm(&mut builder, EXCEPTION_CONTINUE_EXECUTION);
        builder.ins().return_(&[resume]);

        builder.switch_to_block(chain_block);
        self.bump_counter(&mut builder, self.targets.handlers_completed);
        let search = i32_imm(&mut builder, EXCEPTION_CONTINUE_SEARCH);
        builder.ins().return_(&[search]);

        builder.seal_all_blocks();
        builder.finalize();

        function_compiler.finish()
    }

    fn bump_counter(&self, builder: &mut FunctionBuilder<'_>, counter: usize) {
        let counter = builder
            .ins()
            .iconst(self.compiler.pointer_type(), address_imm(counter));
        let one = builder.ins().iconst(I64, 1);
        builder
            .ins()
            .atomic_rmw(I64, MemFlags::trusted(), AtomicRmwOp::Add, counter, one);
    }

    /// Emits the read of the access kind. `record` is the `siginfo_t` or `EXCEPTION_RECORD`,
    /// `context` the `ucontext_t` or `CONTEXT`. Returns an `i8` that is `1` for writes.
    fn load_write_flag(
        &self,
        builder: &mut FunctionBuilder<'_>,
        record: Value,
        context: Value,
    ) -> Result<Value> {
        let pointer_type = self.compiler.pointer_type();

        let (word, mask) = match self.config.write_flag {
            WriteFlagSource::Record { offset, mask } => {
                let word = builder
                    .ins()
                    .load(I32, MemFlags::trusted(), record, offset32(offset)?);
                (word, mask)
            }
            WriteFlagSource::Context { offset, mask } => {
                let word = builder
                    .ins()
                    .load(I32, MemFlags::trusted(), context, offset32(offset)?);
                (word, mask)
            }
            WriteFlagSource::ContextIndirect {
                pointer_offset,
                offset,
                mask,
            } => {
                let mcontext = builder.ins().load(
                    pointer_type,
                    MemFlags::trusted(),
                    context,
                    offset32(pointer_offset)?,
                );
                let word = builder
                    .ins()
                    .load(I32, MemFlags::trusted(), mcontext, offset32(offset)?);
                (word, mask)
            }
            WriteFlagSource::EsrScan { reserved_offset } => {
                return self.scan_esr_records(builder, context, reserved_offset);
            }
            WriteFlagSource::None => return Ok(builder.ins().iconst(I8, 0)),
        };

        let masked = builder.ins().band_imm(word, i64::from(mask));
        Ok(builder.ins().icmp_imm(IntCC::NotEqual, masked, 0))
    }

    /// Walks the `{ magic: u32, size: u32 }` records of the Linux AArch64 `__reserved` context
    /// area until it finds the ESR record, and extracts its WnR bit.
    fn scan_esr_records(
        &self,
        builder: &mut FunctionBuilder<'_>,
        context: Value,
        reserved_offset: usize,
    ) -> Result<Value> {
        let pointer_type = self.compiler.pointer_type();
        let reserved_offset = i64::from(offset32(reserved_offset)?);
        let scan_limit = i64::from(offset32(FaultAbiConfig::ESR_SCAN_LIMIT)?);

        let first = builder.ins().iadd_imm(context, reserved_offset);
        let limit = builder.ins().iadd_imm(first, scan_limit);

        let header_block = builder.create_block();
        let record_block = builder.create_block();
        let found_block = builder.create_block();
        let next_block = builder.create_block();
        let advance_block = builder.create_block();
        let done_block = builder.create_block();
        let record = builder.append_block_param(header_block, pointer_type);
        let is_write = builder.append_block_param(done_block, I8);

        builder.ins().jump(header_block, &[first]);

        // an ESR record is 16 bytes, anything shorter left in the area cannot be one
        builder.switch_to_block(header_block);
        let record_end = builder.ins().iadd_imm(record, 16);
        let in_bounds = builder
            .ins()
            .icmp(IntCC::UnsignedLessThanOrEqual, record_end, limit);
        let not_found = builder.ins().iconst(I8, 0);
        builder
            .ins()
            .brif(in_bounds, record_block, &[], done_block, &[not_found]);

        builder.switch_to_block(record_block);
        let magic = builder.ins().load(I32, MemFlags::trusted(), record, 0);
        let size = builder.ins().load(I32, MemFlags::trusted(), record, 4);
        let esr_magic = builder
            .ins()
            .iconst(I32, i64::from(FaultAbiConfig::ESR_MAGIC));
        let is_esr = builder.ins().icmp(IntCC::Equal, magic, esr_magic);
        builder
            .ins()
            .brif(is_esr, found_block, &[], next_block, &[]);

        builder.switch_to_block(found_block);
        let esr = builder.ins().load(I64, MemFlags::trusted(), record, 8);
        let wnr = builder
            .ins()
            .ushr_imm(esr, i64::from(FaultAbiConfig::ESR_WNR_BIT));
        let wnr = builder.ins().band_imm(wnr, 1);
        let wnr = builder.ins().ireduce(I8, wnr);
        builder.ins().jump(done_block, &[wnr]);

        // a zero magic terminates the list, a zero size would never make progress
        builder.switch_to_block(next_block);
        let is_terminator = builder.ins().icmp_imm(IntCC::Equal, magic, 0);
        let is_empty = builder.ins().icmp_imm(IntCC::Equal, size, 0);
        let stop = builder.ins().bor(is_terminator, is_empty);
        let not_found = builder.ins().iconst(I8, 0);
        builder
            .ins()
            .brif(stop, done_block, &[not_found], advance_block, &[]);

        builder.switch_to_block(advance_block);
        let size = builder.ins().uextend(pointer_type, size);
        let next = builder.ins().iadd(record, size);
        builder.ins().jump(header_block, &[next]);

        builder.switch_to_block(done_block);
        Ok(is_write)
    }

    /// Emits the linear scan over the tracked ranges. Returns an `i8` that is non-zero if a
    /// callback handled the fault.
    fn scan_ranges(
        &self,
        builder: &mut FunctionBuilder<'_>,
        address: Value,
        is_write: Value,
    ) -> Result<Value> {
        let pointer_type = self.compiler.pointer_type();

        let mut callback_sig = Signature::new(self.compiler.call_conv());
        callback_sig.params.push(AbiParam::new(I64));
        callback_sig.params.push(AbiParam::new(I64));
        callback_sig.params.push(AbiParam::new(I8).uext());
        callback_sig.params.push(AbiParam::new(I8).uext());
        callback_sig.returns.push(AbiParam::new(I8));
        let callback_sig = builder.import_signature(callback_sig);

        let page_mask = address_imm(!(self.targets.page_size - 1));
        let not_handled = builder.ins().iconst(I8, 0);
        let mut slot_block = builder.create_block();
        let mut handled = builder.append_block_param(slot_block, I8);
        builder.ins().jump(slot_block, &[not_handled]);

        for index in 0..MAX_TRACKED_RANGES {
            let bounds_block = builder.create_block();
            let invoke_block = builder.create_block();
            let next_block = builder.create_block();
            let next_handled = builder.append_block_param(next_block, I8);

            builder.switch_to_block(slot_block);
            let slot = builder.ins().iconst(
                pointer_type,
                address_imm(self.targets.table + SignalHandlerConfig::range_offset(index)),
            );
            let is_active = builder.ins().load(
                I32,
                MemFlags::trusted(),
                slot,
                offset32(TrackedRange::IS_ACTIVE_OFFSET)?,
            );
            let is_active =
                builder
                    .ins()
                    .icmp_imm(IntCC::Equal, is_active, i64::from(TrackedRange::ACTIVE));
            builder
                .ins()
                .brif(is_active, bounds_block, &[], next_block, &[handled]);

            builder.switch_to_block(bounds_block);
            let start = builder.ins().load(
                pointer_type,
                MemFlags::trusted(),
                slot,
                offset32(TrackedRange::START_OFFSET)?,
            );
            let end = builder.ins().load(
                pointer_type,
                MemFlags::trusted(),
                slot,
                offset32(TrackedRange::END_OFFSET)?,
            );
            let callback = builder.ins().load(
                pointer_type,
                MemFlags::trusted(),
                slot,
                offset32(TrackedRange::CALLBACK_OFFSET)?,
            );
            let above_start =
                builder
                    .ins()
                    .icmp(IntCC::UnsignedGreaterThanOrEqual, address, start);
            let below_end = builder.ins().icmp(IntCC::UnsignedLessThan, address, end);
            let has_callback = builder.ins().icmp_imm(IntCC::NotEqual, callback, 0);
            let matches = builder.ins().band(above_start, below_end);
            let matches = builder.ins().band(matches, has_callback);
            builder
                .ins()
                .brif(matches, invoke_block, &[], next_block, &[handled]);

            builder.switch_to_block(invoke_block);
            let offset = builder.ins().isub(address, start);
            let offset = builder.ins().band_imm(offset, page_mask);
            let offset = widen_to_i64(builder, offset);
            let page_size = builder
                .ins()
                .iconst(I64, address_imm(self.targets.page_size));
            let precise = builder.ins().iconst(I8, 0);
            let call = builder.ins().call_indirect(
                callback_sig,
                callback,
                &[offset, page_size, is_write, precise],
            );
            let result = builder.inst_results(call)[0];
            let claimed = builder.ins().icmp_imm(IntCC::NotEqual, result, 0);
            let now_handled = builder.ins().bor(handled, claimed);
            builder.ins().jump(next_block, &[now_handled]);

            slot_block = next_block;
            handled = next_handled;
        }

        builder.switch_to_block(slot_block);
        Ok(handled)
    }

    /// Branches to `resume_block` if the fault was handled or raced a partial unmap, and to
    /// `chain_block` otherwise.
    fn retry_unless_handled(
        &self,
        builder: &mut FunctionBuilder<'_>,
        handled: Value,
        resume_block: ir::Block,
        chain_block: ir::Block,
    ) {
        let retry_block = builder.create_block();
        builder
            .ins()
            .brif(handled, resume_block, &[], retry_block, &[]);

        builder.switch_to_block(retry_block);
        let mut retry_sig = Signature::new(self.compiler.call_conv());
        retry_sig.returns.push(AbiParam::new(I8));
        let retry_sig = builder.import_signature(retry_sig);
        let retry = builder
            .ins()
            .iconst(self.compiler.pointer_type(), address_imm(self.targets.retry));
        let call = builder.ins().call_indirect(retry_sig, retry, &[]);
        let should_retry = builder.inst_results(call)[0];
        builder
            .ins()
            .brif(should_retry, resume_block, &[], chain_block, &[]);
    }

    /// Calls the handler that was installed for `signum` before ours, if there was one.
    fn chain_to_previous(
        &self,
        builder: &mut FunctionBuilder<'_>,
        signum: Value,
        info: Value,
        context: Value,
    ) -> Result<()> {
        let pointer_type = self.compiler.pointer_type();

        let sigsegv = builder.ins().iconst(
            pointer_type,
            address_imm(self.targets.table + SignalHandlerConfig::SIGSEGV_OFFSET),
        );
        let sigbus = builder.ins().iconst(
            pointer_type,
            address_imm(self.targets.table + SignalHandlerConfig::SIGBUS_OFFSET),
        );
        let sigbus_signum = i32_imm(builder, self.config.sigbus);
        let is_sigbus = builder.ins().icmp(IntCC::Equal, signum, sigbus_signum);
        let previous = builder.ins().select(is_sigbus, sigbus, sigsegv);

        let action = builder.ins().load(
            pointer_type,
            MemFlags::trusted(),
            previous,
            offset32(PreviousHandler::ACTION_OFFSET)?,
        );

        let call_block = builder.create_block();
        let siginfo_block = builder.create_block();
        let plain_block = builder.create_block();
        let return_block = builder.create_block();
        builder
            .ins()
            .brif(action, call_block, &[], return_block, &[]);

        builder.switch_to_block(call_block);
        let takes_siginfo = builder.ins().load(
            I32,
            MemFlags::trusted(),
            previous,
            offset32(PreviousHandler::SIGINFO_OFFSET)?,
        );
        builder
            .ins()
            .brif(takes_siginfo, siginfo_block, &[], plain_block, &[]);

        builder.switch_to_block(siginfo_block);
        let mut siginfo_sig = Signature::new(self.compiler.call_conv());
        siginfo_sig.params.push(AbiParam::new(I32).sext());
        siginfo_sig.params.push(AbiParam::new(pointer_type));
        siginfo_sig.params.push(AbiParam::new(pointer_type));
        let siginfo_sig = builder.import_signature(siginfo_sig);
        builder
            .ins()
            .call_indirect(siginfo_sig, action, &[signum, info, context]);
        builder.ins().jump(return_block, &[]);

        builder.switch_to_block(plain_block);
        let mut plain_sig = Signature::new(self.compiler.call_conv());
        plain_sig.params.push(AbiParam::new(I32).sext());
        let plain_sig = builder.import_signature(plain_sig);
        builder.ins().call_indirect(plain_sig, action, &[signum]);
        builder.ins().jump(return_block, &[]);

        builder.switch_to_block(return_block);
        builder.ins().return_(&[]);

        Ok(())
    }
}

fn widen_to_i64(builder: &mut FunctionBuilder<'_>, value: Value) -> Value {
    if builder.func.dfg.value_type(value) == I64 {
        value
    } else {
        builder.ins().uextend(I64, value)
    }
}

/// `i32` constants are zero-extended into the 64 bit immediate.
fn i32_imm(builder: &mut FunctionBuilder<'_>, value: i32) -> Value {
    builder
        .ins()
        .iconst(I32, i64::from(u32::from_ne_bytes(value.to_ne_bytes())))
}

#[expect(
    clippy::cast_possible_wrap,
    reason = "immediates are raw bit patterns, the sign is irrelevant"
)]
fn address_imm(address: usize) -> i64 {
    address as i64
}

fn offset32(offset: usize) -> Result<i32> {
    i32::try_from(offset).map_err(|_| Error::Compile(anyhow!("offset {offset:#x} is too large")))
}

#[cfg(test)]
mod tests {
    use core::ffi::c_void;
    use core::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, AtomicUsize, Ordering};

    use code_cache::{CodeCache, CodeCacheConfig};

    use super::*;
    use crate::compiler::CompilerConfig;

    const PAGE_SIZE: usize = 0x1000;

    fn leak_targets(
        retry: extern "C" fn() -> u8,
    ) -> (
        &'static SignalHandlerConfig,
        &'static PartialUnmapState,
        TrampolineTargets,
    ) {
        let table = Box::leak(Box::new(SignalHandlerConfig::new()));
        let state = Box::leak(Box::new(PartialUnmapState::new()));
        let targets = TrampolineTargets::new(table, state, retry, PAGE_SIZE);
        (table, state, targets)
    }

    fn small_cache() -> CodeCache {
        CodeCache::new(CodeCacheConfig::default().with_capacity(1 << 20)).unwrap()
    }

    #[test]
    fn synthesizes_both_shapes() {
        let compiler = CraneliftCompiler::new(&CompilerConfig::default()).unwrap();
        let (_, _, targets) = leak_targets(never_retry);

        let shapes = [
            FaultAbiConfig {
                abi: FaultAbi::Posix,
                address_offset: 16,
                write_flag: WriteFlagSource::Context {
                    offset: 0xc0,
                    mask: 2,
                },
                sigbus: 7,
            },
            FaultAbiConfig {
                abi: FaultAbi::Posix,
                address_offset: 16,
                write_flag: WriteFlagSource::EsrScan {
                    reserved_offset: 464,
                },
                sigbus: 7,
            },
            FaultAbiConfig {
                abi: FaultAbi::Posix,
                address_offset: 24,
                write_flag: WriteFlagSource::ContextIndirect {
                    pointer_offset: 48,
                    offset: 8,
                    mask: 0x40,
                },
                sigbus: 10,
            },
            FaultAbiConfig {
                abi: FaultAbi::Windows,
                address_offset: 0x28,
                write_flag: WriteFlagSource::Record {
                    offset: 0x20,
                    mask: 1,
                },
                sigbus: 0,
            },
            FaultAbiConfig {
                abi: FaultAbi::Windows,
                address_offset: 0x28,
                write_flag: WriteFlagSource::None,
                sigbus: 0,
            },
        ];

        for config in shapes {
            let compiled = TrampolineSynthesizer::new(&compiler, config, targets)
                .synthesize()
                .unwrap();
            assert!(!compiled.code().is_empty(), "{config:?}");
            // 8 slots with at least a dozen instructions each
            assert!(compiled.instruction_count() > 8 * 12, "{config:?}");
        }
    }

    #[test]
    fn rejects_offsets_beyond_immediates() {
        let compiler = CraneliftCompiler::new(&CompilerConfig::default()).unwrap();
        let (_, _, targets) = leak_targets(never_retry);
        let config = FaultAbiConfig {
            abi: FaultAbi::Posix,
            address_offset: 1 << 40,
            write_flag: WriteFlagSource::None,
            sigbus: 7,
        };

        let res = TrampolineSynthesizer::new(&compiler, config, targets).synthesize();
        assert!(matches!(res, Err(Error::Compile(_))));
    }

    static POSIX_CALLS: AtomicUsize = AtomicUsize::new(0);
    static POSIX_OFFSET: AtomicU64 = AtomicU64::new(0);
    static POSIX_SIZE: AtomicU64 = AtomicU64::new(0);
    static POSIX_WRITE: AtomicU8 = AtomicU8::new(0xff);
    static POSIX_RETRY: AtomicU8 = AtomicU8::new(0);
    static POSIX_CHAINED_SIGINFO: AtomicI32 = AtomicI32::new(0);
    static POSIX_CHAINED_PLAIN: AtomicI32 = AtomicI32::new(0);

    unsafe extern "C" fn posix_callback(offset: u64, size: u64, write: u8, precise: u8) -> u8 {
        assert_eq!(precise, 0);
        POSIX_OFFSET.store(offset, Ordering::SeqCst);
        POSIX_SIZE.store(size, Ordering::SeqCst);
        POSIX_WRITE.store(write, Ordering::SeqCst);
        POSIX_CALLS.fetch_add(1, Ordering::SeqCst);
        1
    }

    extern "C" fn posix_retry() -> u8 {
        POSIX_RETRY.load(Ordering::SeqCst)
    }

    extern "C" fn previous_with_siginfo(signum: i32, info: *mut c_void, context: *mut c_void) {
        assert!(!info.is_null());
        assert!(!context.is_null());
        POSIX_CHAINED_SIGINFO.store(signum, Ordering::SeqCst);
    }

    extern "C" fn previous_plain(signum: i32) {
        POSIX_CHAINED_PLAIN.store(signum, Ordering::SeqCst);
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn posix_handler_dispatches_retries_and_chains() {
        type Handler = unsafe extern "C" fn(i32, *mut c_void, *mut c_void);
        const SIGSEGV: i32 = 11;
        const SIGBUS: i32 = 7;

        let compiler = CraneliftCompiler::new(&CompilerConfig::default()).unwrap();
        let (table, state, targets) = leak_targets(posix_retry);
        let config = FaultAbiConfig {
            abi: FaultAbi::Posix,
            address_offset: 8,
            write_flag: WriteFlagSource::Context { offset: 4, mask: 2 },
            sigbus: SIGBUS,
        };
        let compiled = TrampolineSynthesizer::new(&compiler, config, targets)
            .synthesize()
            .unwrap();

        let cache = small_cache();
        let ptr = cache
            .map(compiled.code(), compiled.unwind_info().clone())
            .unwrap();
        // Safety: the code was compiled for this signature
        let handler = unsafe { core::mem::transmute::<*const u8, Handler>(ptr.as_ptr()) };

        assert!(table.add_tracked_range(0x10_0000, 0x20_0000, posix_callback));

        let mut info = [0_usize; 4];
        let mut context = [0_u32; 4];
        let mut fault = |signum: i32, address: usize, write: bool| {
            info[1] = address;
            context[1] = if write { 0b110 } else { 0b100 };
            // Safety: both buffers cover the configured offsets
            unsafe {
                handler(
                    signum,
                    info.as_mut_ptr().cast(),
                    context.as_mut_ptr().cast(),
                );
            }
        };

        // inside the tracked range
        fault(SIGSEGV, 0x10_1234, true);
        assert_eq!(POSIX_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(POSIX_OFFSET.load(Ordering::SeqCst), 0x1000);
        assert_eq!(POSIX_SIZE.load(Ordering::SeqCst), 0x1000);
        assert_eq!(POSIX_WRITE.load(Ordering::SeqCst), 1);

        fault(SIGSEGV, 0x1f_ffff, false);
        assert_eq!(POSIX_CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(POSIX_OFFSET.load(Ordering::SeqCst), 0xf_f000);
        assert_eq!(POSIX_WRITE.load(Ordering::SeqCst), 0);

        // the end is exclusive, and nothing to chain to yet
        fault(SIGSEGV, 0x20_0000, true);
        assert_eq!(POSIX_CALLS.load(Ordering::SeqCst), 2);

        // raced a partial unmap
        table.sigsegv.set(
            previous_with_siginfo as extern "C" fn(i32, *mut c_void, *mut c_void) as usize,
            true,
        );
        table.sigbus.set(previous_plain as extern "C" fn(i32) as usize, false);
        POSIX_RETRY.store(1, Ordering::SeqCst);
        fault(SIGSEGV, 0x30_0000, true);
        assert_eq!(POSIX_CHAINED_SIGINFO.load(Ordering::SeqCst), 0);
        POSIX_RETRY.store(0, Ordering::SeqCst);

        // genuine faults go to the handler registered for the signal
        fault(SIGSEGV, 0x30_0000, true);
        assert_eq!(POSIX_CHAINED_SIGINFO.load(Ordering::SeqCst), SIGSEGV);
        assert_eq!(POSIX_CHAINED_PLAIN.load(Ordering::SeqCst), 0);

        fault(SIGBUS, 0x30_0000, false);
        assert_eq!(POSIX_CHAINED_PLAIN.load(Ordering::SeqCst), SIGBUS);

        // removed ranges are not dispatched anymore
        POSIX_CHAINED_SIGINFO.store(0, Ordering::SeqCst);
        assert!(table.remove_tracked_range(0x10_0000));
        fault(SIGSEGV, 0x10_1234, true);
        assert_eq!(POSIX_CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(POSIX_CHAINED_SIGINFO.load(Ordering::SeqCst), SIGSEGV);

        assert_eq!(state.handlers_in_flight(), 0);
        assert_eq!(state.handler_entered(), 8);

        cache.unmap(ptr);
    }

    static WINDOWS_CALLS: AtomicUsize = AtomicUsize::new(0);
    static WINDOWS_WRITE: AtomicU8 = AtomicU8::new(0xff);

    unsafe extern "C" fn windows_callback(_offset: u64, _size: u64, write: u8, _precise: u8) -> u8 {
        WINDOWS_WRITE.store(write, Ordering::SeqCst);
        WINDOWS_CALLS.fetch_add(1, Ordering::SeqCst);
        1
    }

    unsafe extern "C" fn declining_callback(
        _offset: u64,
        _size: u64,
        _write: u8,
        _precise: u8,
    ) -> u8 {
        0
    }

    extern "C" fn never_retry() -> u8 {
        0
    }

    // The generated code uses the host calling convention, so the exception handler shape can be
    // exercised on any 64 bit host.
    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn exception_handler_filters_and_dispatches() {
        type Handler = unsafe extern "C" fn(*mut c_void) -> i32;

        let compiler = CraneliftCompiler::new(&CompilerConfig::default()).unwrap();
        let (table, state, targets) = leak_targets(never_retry);
        let config = FaultAbiConfig {
            abi: FaultAbi::Windows,
            address_offset: 0x28,
            write_flag: WriteFlagSource::Record {
                offset: 0x20,
                mask: 1,
            },
            sigbus: 0,
        };
        let compiled = TrampolineSynthesizer::new(&compiler, config, targets)
            .synthesize()
            .unwrap();

        let cache = small_cache();
        let ptr = cache
            .map(compiled.code(), compiled.unwind_info().clone())
            .unwrap();
        // Safety: the code was compiled for this signature
        let handler = unsafe { core::mem::transmute::<*const u8, Handler>(ptr.as_ptr()) };

        assert!(table.add_tracked_range(0x4000, 0x8000, declining_callback));
        assert!(table.add_tracked_range(0x4000, 0x6000, windows_callback));

        let mut record = [0_u64; 8];
        let mut context = [0_u64; 4];
        let mut raise = |code: u32, address: u64, write: u64| {
            record[0] = u64::from(code);
            record[4] = write;
            record[5] = address;
            let mut pointers = [
                record.as_mut_ptr().cast::<c_void>(),
                context.as_mut_ptr().cast(),
            ];
            // Safety: the buffers mimic EXCEPTION_POINTERS and EXCEPTION_RECORD
            unsafe { handler(pointers.as_mut_ptr().cast()) }
        };

        // not an access violation
        assert_eq!(raise(0x8000_0003, 0x5000, 1), EXCEPTION_CONTINUE_SEARCH);
        assert_eq!(WINDOWS_CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(state.handlers_in_flight(), 0);

        // one callback declining does not stop another from handling the fault
        assert_eq!(
            raise(EXCEPTION_ACCESS_VIOLATION, 0x5000, 1),
            EXCEPTION_CONTINUE_EXECUTION
        );
        assert_eq!(WINDOWS_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(WINDOWS_WRITE.load(Ordering::SeqCst), 1);

        // DEP violations are not writes
        raise(EXCEPTION_ACCESS_VIOLATION, 0x5000, 8);
        assert_eq!(WINDOWS_WRITE.load(Ordering::SeqCst), 0);

        // only the declining callback covers this address
        assert_eq!(
            raise(EXCEPTION_ACCESS_VIOLATION, 0x7000, 1),
            EXCEPTION_CONTINUE_SEARCH
        );
        assert_eq!(WINDOWS_CALLS.load(Ordering::SeqCst), 2);

        assert_eq!(state.handlers_in_flight(), 0);
        assert_eq!(state.handler_entered(), 4);

        cache.unmap(ptr);
    }
}
