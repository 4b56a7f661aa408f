// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;

use code_cache::CodeCache;
use parking_lot::Mutex;
use unmap_guard::PartialUnmapState;

use crate::compiler::{CompilerConfig, CraneliftCompiler};
use crate::config::FaultAbiConfig;
use crate::table::{SignalHandlerConfig, TrackingCallback};
use crate::trampoline::{TrampolineSynthesizer, TrampolineTargets};
use crate::{Result, sys};

static GLOBAL: FaultDispatcher = FaultDispatcher::new();

/// Owns the process-wide fault handler.
///
/// Installing compiles the handler, maps it into the global [`CodeCache`] and registers it with
/// the OS. Tracked ranges live in [`SignalHandlerConfig::global`] and can be changed at any time,
/// whether the handler is installed or not.
pub struct FaultDispatcher {
    installed: Mutex<Option<Installed>>,
}

struct Installed {
    trampoline: NonNull<u8>,
    code_size: usize,
    cache: &'static CodeCache,
    registration: sys::Registration,
}

// Safety: the trampoline pointer is only used to unmap the code, which the cache synchronizes
unsafe impl Send for Installed {}

impl FaultDispatcher {
    const fn new() -> Self {
        Self {
            installed: Mutex::new(None),
        }
    }

    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Installs the fault handler for the host, does nothing if it is already installed.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not supported, the handler fails to compile or map, or the
    /// OS refuses to register it.
    pub fn install(&self) -> Result<()> {
        self.install_with(FaultAbiConfig::host()?, &CompilerConfig::default())
    }

    /// Like [`install`](Self::install), with explicit fault ABI and compiler settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler fails to compile or map, or the OS refuses to register it.
    pub fn install_with(&self, abi: FaultAbiConfig, config: &CompilerConfig) -> Result<()> {
        let mut installed = self.installed.lock();
        if installed.is_some() {
            tracing::trace!("fault handler already installed");
            return Ok(());
        }

        let compiler = CraneliftCompiler::new(config)?;
        let compiled =
            TrampolineSynthesizer::new(&compiler, abi, TrampolineTargets::global()).synthesize()?;
        let code_size = compiled.code().len();
        let (code, unwind_info) = compiled.into_parts();

        let cache = CodeCache::global()?;
        // mapping other code must never make the handler non-executable
        let trampoline = cache.map_isolated(&code, unwind_info)?;

        // Safety: the code was generated for the host fault ABI and stays mapped until uninstall
        let registration =
            match unsafe { sys::register(trampoline, SignalHandlerConfig::global()) } {
                Ok(registration) => registration,
                Err(err) => {
                    cache.unmap(trampoline);
                    return Err(err);
                }
            };

        tracing::info!(?trampoline, code_size, abi = ?abi.abi, "installed fault handler");

        *installed = Some(Installed {
            trampoline,
            code_size,
            cache,
            registration,
        });
        Ok(())
    }

    /// Restores the previous fault handler and unmaps ours, does nothing if it is not installed.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to restore the previous handler. The generated handler
    /// then stays mapped, since the OS may still call it.
    pub fn uninstall(&self) -> Result<()> {
        let mut installed = self.installed.lock();
        let Some(Installed {
            trampoline,
            code_size,
            cache,
            registration,
        }) = installed.take()
        else {
            return Ok(());
        };

        // Safety: the caller stopped relying on tracked ranges by uninstalling
        unsafe { sys::unregister(registration, SignalHandlerConfig::global()) }?;

        // faults delivered before the restore may still be executing the handler
        let state = PartialUnmapState::global();
        state.wait_for_quiescence(state.handlers_entered());
        cache.unmap(trampoline);

        tracing::info!(?trampoline, code_size, "uninstalled fault handler");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.installed.lock().is_some()
    }

    /// Address of the installed handler.
    pub fn trampoline(&self) -> Option<NonNull<u8>> {
        self.installed
            .lock()
            .as_ref()
            .map(|installed| installed.trampoline)
    }

    /// Routes faults in `start..end` to `callback`. Returns `false` if the range is empty or all
    /// slots are taken.
    pub fn add_tracked_range(&self, start: usize, end: usize, callback: TrackingCallback) -> bool {
        SignalHandlerConfig::global().add_tracked_range(start, end, callback)
    }

    /// Stops routing faults for the range starting at `start`. Returns `false` if there is no such
    /// range.
    pub fn remove_tracked_range(&self, start: usize) -> bool {
        SignalHandlerConfig::global().remove_tracked_range(start)
    }
}

impl fmt::Debug for FaultDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultDispatcher")
            .field(
                "installed",
                &self.installed.try_lock().map(|installed| installed.is_some()),
            )
            .finish()
    }
}

/// Installs the process-wide fault handler, see [`FaultDispatcher::install`].
///
/// # Errors
///
/// See [`FaultDispatcher::install`].
pub fn install() -> Result<()> {
    FaultDispatcher::global().install()
}

/// Removes the process-wide fault handler, see [`FaultDispatcher::uninstall`].
///
/// # Errors
///
/// See [`FaultDispatcher::uninstall`].
pub fn uninstall() -> Result<()> {
    FaultDispatcher::global().uninstall()
}

/// See [`FaultDispatcher::add_tracked_range`].
pub fn add_tracked_range(start: usize, end: usize, callback: TrackingCallback) -> bool {
    FaultDispatcher::global().add_tracked_range(start, end, callback)
}

/// See [`FaultDispatcher::remove_tracked_range`].
pub fn remove_tracked_range(start: usize) -> bool {
    FaultDispatcher::global().remove_tracked_range(start)
}
