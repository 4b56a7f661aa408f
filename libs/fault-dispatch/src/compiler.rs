// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use anyhow::anyhow;
use code_cache::UnwindInfo;
use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir;
use cranelift_codegen::isa::{CallConv, OwnedTargetIsa, TargetIsa};
use cranelift_codegen::settings::{self, Configurable, Flags};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use parking_lot::Mutex;

use crate::{Error, Result};

/// How hard cranelift tries to optimize.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    None,
    Speed,
    #[default]
    SpeedAndSize,
}

impl OptLevel {
    fn as_str(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CompilerConfig {
    opt_level: OptLevel,
}

impl CompilerConfig {
    #[must_use]
    pub fn with_opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }

    pub fn opt_level(&self) -> OptLevel {
        self.opt_level
    }
}

/// Machine code for one function plus what is needed to map it.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    code: Vec<u8>,
    unwind_info: UnwindInfo,
    instruction_count: usize,
}

impl CompiledFunction {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn unwind_info(&self) -> &UnwindInfo {
        &self.unwind_info
    }

    /// Number of IR instructions the function was compiled from.
    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    pub fn into_parts(self) -> (Vec<u8>, UnwindInfo) {
        (self.code, self.unwind_info)
    }
}

struct CompilationContext {
    codegen_context: cranelift_codegen::Context,
    builder_context: FunctionBuilderContext,
}

impl CompilationContext {
    fn new() -> Self {
        Self {
            codegen_context: cranelift_codegen::Context::new(),
            builder_context: FunctionBuilderContext::new(),
        }
    }
}

/// Compiles functions for the host with cranelift.
pub struct CraneliftCompiler {
    isa: OwnedTargetIsa,
    contexts: Mutex<Vec<CompilationContext>>,
}

impl fmt::Debug for CraneliftCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CraneliftCompiler")
            .field("triple", self.isa.triple())
            .finish_non_exhaustive()
    }
}

impl CraneliftCompiler {
    /// Builds a compiler for the host ISA.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compile`] if cranelift does not support the host or rejects the settings.
    pub fn new(config: &CompilerConfig) -> Result<Self> {
        let isa_builder =
            cranelift_codegen::isa::lookup(target_lexicon::HOST).map_err(compile_error)?;
        let mut b = settings::builder();
        b.set("opt_level", config.opt_level.as_str())
            .map_err(compile_error)?;
        b.set("preserve_frame_pointers", "true")
            .map_err(compile_error)?;
        b.set("unwind_info", "true").map_err(compile_error)?;
        let isa = isa_builder.finish(Flags::new(b)).map_err(compile_error)?;

        tracing::debug!(triple = %isa.triple(), opt_level = ?config.opt_level, "created compiler");

        Ok(Self {
            isa,
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn target_isa(&self) -> &dyn TargetIsa {
        self.isa.as_ref()
    }

    pub fn pointer_type(&self) -> ir::Type {
        self.isa.pointer_type()
    }

    pub fn call_conv(&self) -> CallConv {
        self.isa.default_call_conv()
    }

    pub fn function_compiler(&self) -> FunctionCompiler<'_> {
        let saved_context = self.contexts.lock().pop();
        FunctionCompiler {
            compiler: self,
            ctx: saved_context.unwrap_or_else(CompilationContext::new),
        }
    }
}

/// Compiles a single function. The compilation context is recycled once finished.
pub struct FunctionCompiler<'a> {
    compiler: &'a CraneliftCompiler,
    ctx: CompilationContext,
}

impl fmt::Debug for FunctionCompiler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCompiler")
            .field("compiler", self.compiler)
            .finish_non_exhaustive()
    }
}

impl FunctionCompiler<'_> {
    /// Starts building `func`, returning a builder positioned in the sealed entry block.
    pub fn builder(&mut self, func: ir::Function) -> (FunctionBuilder<'_>, ir::Block) {
        self.ctx.codegen_context.func = func;
        let mut builder = FunctionBuilder::new(
            &mut self.ctx.codegen_context.func,
            &mut self.ctx.builder_context,
        );

        let block0 = builder.create_block();
        builder.append_block_params_for_function_params(block0);
        builder.switch_to_block(block0);
        builder.seal_block(block0);
        (builder, block0)
    }

    /// Compiles the function built through [`builder`](Self::builder).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compile`] if the function fails verification or code generation.
    pub fn finish(mut self) -> Result<CompiledFunction> {
        let compiler = self.compiler;
        let context = &mut self.ctx.codegen_context;

        let layout = &context.func.layout;
        let instruction_count = layout
            .blocks()
            .map(|block| layout.block_insts(block).count())
            .sum();

        let isa = compiler.target_isa();
        let compiled_code = context
            .compile(isa, &mut ControlPlane::default())
            .map_err(|e| Error::Compile(anyhow!("{e:?}")))?;

        let code = compiled_code.code_buffer().to_vec();

        #[cfg(all(windows, target_arch = "x86_64"))]
        let unwind_info = windows_unwind_info(compiled_code, isa)?;
        #[cfg(not(all(windows, target_arch = "x86_64")))]
        let unwind_info = UnwindInfo::default();

        self.ctx.codegen_context.clear();
        compiler.contexts.lock().push(self.ctx);

        Ok(CompiledFunction {
            code,
            unwind_info,
            instruction_count,
        })
    }
}

#[cfg(all(windows, target_arch = "x86_64"))]
fn windows_unwind_info(
    compiled_code: &cranelift_codegen::CompiledCode,
    isa: &dyn TargetIsa,
) -> Result<UnwindInfo> {
    use cranelift_codegen::isa::unwind::UnwindInfo as CraneliftUnwindInfo;

    match compiled_code
        .create_unwind_info(isa)
        .map_err(compile_error)?
    {
        Some(CraneliftUnwindInfo::WindowsX64(info)) => {
            let mut buf = vec![0; info.emit_size()];
            info.emit(&mut buf);
            Ok(UnwindInfo::decode_windows_x64(&buf).unwrap_or_default())
        }
        _ => Ok(UnwindInfo::default()),
    }
}

fn compile_error(err: impl fmt::Debug) -> Error {
    Error::Compile(anyhow!("{err:?}"))
}
