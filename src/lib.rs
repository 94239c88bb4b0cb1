// Copyright 2026 the spi-nor developers
// Licensed under the Apache-2.0 and MIT licenses.

//! spi-nor
//!
//! This crate provides a hardware-agnostic driver for SPI NOR flash
//! memories. It translates byte-range operations — read, write, erase,
//! chip identification, status- and vendor-register access — into the
//! command/address/data sequences a SPI NOR device expects, honoring the
//! two hard constraints of such devices: a program never crosses a page
//! boundary, and an erase is decomposed into naturally aligned blocks
//! drawn from the supported block sizes.
//!
//! All hardware access goes through the [`FlashHal`] trait: one SPI
//! transaction, chip-select control, and a millisecond wait. Every
//! operation runs through the same state machine in one of two modes.
//! The blocking surface ([`Flash::write`], [`Flash::read`], ...) loops
//! the machine to completion inline. The non-blocking surface
//! ([`Flash::start_write`], [`Flash::start_read`], ...) issues one HAL
//! action and returns; the machine is re-entered from a SPI-completion
//! interrupt, a timer, or a BUSY-line edge handler via
//! [`Flash::trigger`], and the registered completion callback fires
//! exactly once per started operation.
//!
//! Command opcodes and device timings are not baked in: they arrive as
//! borrowed [`CommandTable`] and [`FlashConfig`] records, so one build of
//! the driver serves any single-I/O NOR device.

#![cfg_attr(not(feature = "std"), no_std)]

mod cmds;
mod config;
mod erase_plan;
mod flash;
mod id;
mod sreg;

pub use cmds::{Command, CommandTable};
pub use config::{Endianness, FlashConfig};
pub use flash::{Callback, Flash, Op};
pub use id::FlashId;
pub use sreg::StatusRegister;

/// The error type used by this crate.
///
/// Driver-detected conditions get their own variants; anything reported
/// by the HAL is passed through as `Access`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum Error<E> {
    /// The state machine reached an impossible state.
    #[cfg_attr(feature = "std", error("state machine reached an impossible state"))]
    Internal,

    /// [`Flash::trigger`] was called with no operation in flight.
    #[cfg_attr(feature = "std", error("no operation in flight"))]
    BadState,

    /// The busy pre-check found the device still busy with an earlier
    /// program or erase.
    #[cfg_attr(feature = "std", error("device still busy with a previous operation"))]
    HwBusy,

    /// A new request arrived while an operation was in flight.
    #[cfg_attr(feature = "std", error("driver busy with an operation"))]
    Busy,

    /// The erase range does not decompose into supported aligned blocks.
    #[cfg_attr(feature = "std", error("erase range not aligned to a supported block size"))]
    EraseUnaligned,

    /// No erase command exists for the block size the planner selected.
    #[cfg_attr(feature = "std", error("no erase command for the selected block size"))]
    BadConfig,

    /// The HAL reported an error; it is propagated as-is.
    #[cfg_attr(feature = "std", error("hardware access failed"))]
    Access(E),
}

pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Hardware abstraction consumed by the driver.
///
/// Implementations only move bytes, toggle a pin, and keep time; all
/// protocol knowledge stays in the driver. A blocking implementation
/// completes each call inline. A non-blocking implementation queues the
/// work and returns, then delivers the final result through
/// [`Flash::trigger`] once the transfer or delay has elapsed.
pub trait FlashHal {
    /// Error type reported by [`FlashHal::txrx`]. Forwarded to the caller
    /// as [`Error::Access`].
    type Error;

    /// Carry out one SPI transaction: transmit all of `tx` (if non-empty),
    /// then receive into `rx` (if non-empty), without releasing chip
    /// select in between.
    ///
    /// In non-blocking use this may return as soon as the transfer is
    /// queued. The driver keeps both buffers alive and untouched until
    /// the completion is delivered through [`Flash::trigger`], so a DMA
    /// implementation may capture them for the duration of the transfer.
    fn txrx(&mut self, tx: &[u8], rx: &mut [u8]) -> core::result::Result<(), Self::Error>;

    /// Assert (`true`) or deassert (`false`) chip select. Synchronous in
    /// both modes.
    fn chip_select(&mut self, assert: bool);

    /// Delay for `ms` milliseconds. A zero delay means the BUSY line is
    /// wired: return (or trigger) when the device indicates ready.
    ///
    /// In non-blocking use this returns immediately and the environment
    /// calls [`Flash::trigger`] when the delay or edge elapses.
    fn wait(&mut self, ms: u32);
}
