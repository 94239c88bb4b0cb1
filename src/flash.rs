// Copyright 2026 the spi-nor developers
// Licensed under the Apache-2.0 and MIT licenses.

//! The operation engine: one state machine sequencing every request into
//! HAL actions, driven either by an inline loop (blocking surface) or by
//! external completions (non-blocking surface).

use core::mem;
use core::slice;

use crate::erase_plan;
use crate::{CommandTable, Error, FlashConfig, FlashHal, FlashId, Result, StatusRegister};

/// Micro-states of the operation state machine.
///
/// Each high-level request expands into an ordered sequence of these;
/// every state issues exactly one HAL action. The tag of the state in
/// progress is reported to the completion callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// No operation in flight.
    Idle,

    // Block erase: write enable, then one erase command per block.
    EraseBlockWren,
    EraseBlockIssue,

    // Chip erase: write enable, then the chip erase command.
    EraseChipWren,
    EraseChipIssue,

    // Write: write enable, command and address, then payload, repeated
    // per page.
    WriteWren,
    WriteAddr,
    WriteData,

    // Status register write: write enable, then command and data.
    WriteSrWren,
    WriteSrData,

    // Vendor register write, with or without write enable and wait.
    WriteRegWren,
    WriteRegDataWait,
    WriteRegData,

    // Single-transaction reads.
    Read,
    FastRead,
    ReadSr,
    ReadSrBusy,
    ReadJedec,
    ReadProduct,
    ReadReg,
}

impl Op {
    /// Whether this state belongs to an operation that can leave the
    /// device busy or otherwise alter it.
    fn mutates_device(self) -> bool {
        !matches!(
            self,
            Op::Idle
                | Op::Read
                | Op::FastRead
                | Op::ReadSr
                | Op::ReadSrBusy
                | Op::ReadJedec
                | Op::ReadProduct
                | Op::ReadReg
        )
    }
}

/// Sub-states of the busy-check subengine run after long operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BusyCheck {
    Idle,
    Wait,
    ReadSr,
    Check,
}

/// Per-operation payload. Only the record matching the current `Op` is
/// ever live, which the tags keep honest.
enum Payload<'b> {
    None,
    /// Unwritten remainder of the program source.
    Write { src: &'b [u8] },
    /// Read destination.
    Read { dst: &'b mut [u8] },
    /// Unerased remainder of the erase range, in bytes.
    Erase { remaining: u32 },
    /// Destination for a status register read, raw or reduced to the
    /// busy flag.
    Sr { dst: &'b mut u8 },
    /// Destination for a JEDEC or product ID read.
    Id { dst: &'b mut [u8; 3] },
    /// Register number and destination for a vendor register read.
    Reg { reg: u8, dst: &'b mut u8 },
    /// Data for a status register write.
    WriteSr { data: u8 },
    /// Register number and data for a vendor register write.
    WriteReg { reg: u8, data: u8 },
}

const SCRATCH_LEN: usize = 16;

/// Working state of one in-flight operation.
struct Job<'b> {
    op: Op,
    /// Chip address the next payload byte lands at.
    addr: u32,
    payload: Payload<'b>,
    /// Remaining wait of the current busy-check round; halves per retry.
    wait_period_ms: u32,
    busy_pre_check: bool,
    busy_check: BusyCheck,
    /// Most recently read status register byte.
    sr_data: u8,
    /// Composition buffer for command, address and dummy bytes.
    scratch: [u8; SCRATCH_LEN],
}

impl<'b> Job<'b> {
    fn new(op: Op, addr: u32, payload: Payload<'b>) -> Self {
        Job {
            op,
            addr,
            payload,
            wait_period_ms: 0,
            busy_pre_check: false,
            busy_check: BusyCheck::Idle,
            sr_data: 0,
            scratch: [0; SCRATCH_LEN],
        }
    }
}

/// Completion callback for the non-blocking surface: receives the state
/// that finished or failed, and the operation result.
pub type Callback<'a, E> = &'a mut dyn FnMut(Op, Result<(), E>);

/// SPI NOR flash device handle.
///
/// Borrows a [`FlashConfig`], a [`CommandTable`] and a HAL, and drives at
/// most one operation at a time against them.
///
/// The blocking methods (`write`, `read`, `erase`, ...) run an operation
/// to completion before returning; they require a HAL whose actions
/// complete inline. The `start_*` methods issue the first HAL action and
/// return; the environment then feeds completions in via
/// [`Flash::trigger`] until the registered callback fires. Both surfaces
/// run the same state machine.
pub struct Flash<'a, H: FlashHal> {
    cfg: &'a FlashConfig,
    cmds: &'a CommandTable,
    hal: &'a mut H,
    job: Option<Job<'a>>,
    /// The device may still be busy finishing the previous program or
    /// erase; the next operation starts with a status register pre-check.
    could_be_busy: bool,
    on_complete: Option<Callback<'a, H::Error>>,
}

impl<'a, H: FlashHal> Flash<'a, H> {
    /// Create a new handle over the given configuration, command table
    /// and HAL.
    pub fn new(cfg: &'a FlashConfig, cmds: &'a CommandTable, hal: &'a mut H) -> Self {
        Flash {
            cfg,
            cmds,
            hal,
            job: None,
            could_be_busy: false,
            on_complete: None,
        }
    }

    /// Register the completion callback for non-blocking operations.
    ///
    /// When set, the callback receives the final result of every started
    /// operation, exactly once, from within the [`Flash::trigger`] call
    /// that finishes it; `trigger` then returns `Ok`. Without a callback
    /// the final result is returned from `trigger` instead.
    pub fn set_callback(&mut self, callback: Callback<'a, H::Error>) {
        self.on_complete = Some(callback);
    }

    /// Get the configuration this handle drives.
    pub fn config(&self) -> &FlashConfig {
        self.cfg
    }

    /// Get the command table this handle drives.
    pub fn commands(&self) -> &CommandTable {
        self.cmds
    }

    /// Whether a non-blocking operation is in flight. Performs no I/O.
    pub fn is_busy(&self) -> bool {
        self.job.is_some()
    }

    // Blocking surface.
    //
    // Each entry point stages a stack-local job and loops the state
    // machine to completion, synthesizing an immediate OK completion for
    // every HAL action.

    /// Write `data` to `addr`, splitting into page programs as needed.
    /// Each page is write-enabled, programmed, and busy-waited in turn.
    ///
    /// The range must have been erased beforehand; the driver does not
    /// check.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), H::Error> {
        self.check_idle()?;
        log::debug!("write: addr={:#08x} len={}", addr, data.len());
        self.run_blocking(Job::new(Op::WriteWren, addr, Payload::Write { src: data }))
    }

    /// Erase `len` bytes starting at `addr`.
    ///
    /// The range must decompose into supported, naturally aligned erase
    /// blocks or `Error::EraseUnaligned` is returned before any bus
    /// activity. Each step erases the largest block that fits.
    pub fn erase(&mut self, addr: u32, len: u32) -> Result<(), H::Error> {
        self.check_idle()?;
        self.check_erase_range(addr, len)?;
        log::debug!("erase: addr={:#08x} len={:#x}", addr, len);
        self.run_blocking(Job::new(
            Op::EraseBlockWren,
            addr,
            Payload::Erase { remaining: len },
        ))
    }

    /// Erase the entire chip.
    pub fn chip_erase(&mut self) -> Result<(), H::Error> {
        self.check_idle()?;
        log::debug!("chip erase");
        self.run_blocking(Job::new(Op::EraseChipWren, 0, Payload::None))
    }

    /// Read `data.len()` bytes starting at `addr`.
    pub fn read(&mut self, addr: u32, data: &mut [u8]) -> Result<(), H::Error> {
        self.check_idle()?;
        log::debug!("read: addr={:#08x} len={}", addr, data.len());
        self.run_blocking(Job::new(Op::Read, addr, Payload::Read { dst: data }))
    }

    /// Read `data.len()` bytes starting at `addr` using the fast-read
    /// command, which carries one extra dummy byte. Falls back to a
    /// normal read when the command table has no fast-read opcode.
    pub fn fast_read(&mut self, addr: u32, data: &mut [u8]) -> Result<(), H::Error> {
        self.check_idle()?;
        log::debug!("fast read: addr={:#08x} len={}", addr, data.len());
        self.run_blocking(Job::new(self.read_op(), addr, Payload::Read { dst: data }))
    }

    /// Write the status register.
    pub fn write_sr(&mut self, sr: u8) -> Result<(), H::Error> {
        self.check_idle()?;
        log::debug!("write sr: {:#04x}", sr);
        self.run_blocking(Job::new(Op::WriteSrWren, 0, Payload::WriteSr { data: sr }))
    }

    /// Read the raw status register byte.
    pub fn read_sr(&mut self) -> Result<u8, H::Error> {
        self.check_idle()?;
        let mut sr = 0u8;
        self.run_blocking(Job::new(Op::ReadSr, 0, Payload::Sr { dst: &mut sr }))?;
        Ok(sr)
    }

    /// Read the status register and reduce it to the busy flag.
    pub fn read_sr_busy(&mut self) -> Result<bool, H::Error> {
        self.check_idle()?;
        let mut busy = 0u8;
        self.run_blocking(Job::new(Op::ReadSrBusy, 0, Payload::Sr { dst: &mut busy }))?;
        Ok(busy != 0)
    }

    /// Read the 3-byte JEDEC ID.
    pub fn read_jedec_id(&mut self) -> Result<[u8; 3], H::Error> {
        self.check_idle()?;
        let mut id = [0u8; 3];
        self.run_blocking(Job::new(Op::ReadJedec, 0, Payload::Id { dst: &mut id }))?;
        Ok(id)
    }

    /// Read the 3-byte product ID.
    pub fn read_product_id(&mut self) -> Result<[u8; 3], H::Error> {
        self.check_idle()?;
        let mut id = [0u8; 3];
        self.run_blocking(Job::new(Op::ReadProduct, 0, Payload::Id { dst: &mut id }))?;
        Ok(id)
    }

    /// Read a vendor-specific register: transmit the register number as
    /// an opcode, receive one byte.
    pub fn read_reg(&mut self, reg: u8) -> Result<u8, H::Error> {
        self.check_idle()?;
        let mut data = 0u8;
        self.run_blocking(Job::new(Op::ReadReg, 0, Payload::Reg { reg, dst: &mut data }))?;
        Ok(data)
    }

    /// Write a vendor-specific register. With `write_en`, a write enable
    /// precedes the command and the driver busy-waits `wait_ms` typical
    /// milliseconds afterwards; without it the register write is issued
    /// bare.
    pub fn write_reg(
        &mut self,
        reg: u8,
        data: u8,
        write_en: bool,
        wait_ms: u32,
    ) -> Result<(), H::Error> {
        self.check_idle()?;
        log::debug!("write reg {:#04x}: {:#04x}", reg, data);
        self.run_blocking(self.stage_write_reg(reg, data, write_en, wait_ms))
    }

    /// Read and interpret the JEDEC ID.
    pub fn read_id(&mut self) -> Result<FlashId, H::Error> {
        let id = FlashId::from_jedec(self.read_jedec_id()?);
        log::debug!("read ID: {:?}", id);
        Ok(id)
    }

    /// Read and wrap the status register.
    pub fn read_status(&mut self) -> Result<StatusRegister, H::Error> {
        Ok(StatusRegister(self.read_sr()?))
    }

    // Non-blocking surface.
    //
    // Each entry point stages the same job the blocking surface would,
    // parks it in the handle after the first HAL action, and leaves the
    // rest to `trigger`. Destination buffers are held until completion
    // and must live as long as the handle.

    /// Start a write; see [`Flash::write`].
    pub fn start_write(&mut self, addr: u32, data: &'a [u8]) -> Result<(), H::Error> {
        self.check_idle()?;
        log::debug!("start write: addr={:#08x} len={}", addr, data.len());
        self.start(Job::new(Op::WriteWren, addr, Payload::Write { src: data }))
    }

    /// Start an erase; see [`Flash::erase`].
    pub fn start_erase(&mut self, addr: u32, len: u32) -> Result<(), H::Error> {
        self.check_idle()?;
        self.check_erase_range(addr, len)?;
        log::debug!("start erase: addr={:#08x} len={:#x}", addr, len);
        self.start(Job::new(
            Op::EraseBlockWren,
            addr,
            Payload::Erase { remaining: len },
        ))
    }

    /// Start a chip erase; see [`Flash::chip_erase`].
    pub fn start_chip_erase(&mut self) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(Job::new(Op::EraseChipWren, 0, Payload::None))
    }

    /// Start a read; see [`Flash::read`].
    pub fn start_read(&mut self, addr: u32, data: &'a mut [u8]) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(Job::new(Op::Read, addr, Payload::Read { dst: data }))
    }

    /// Start a fast read; see [`Flash::fast_read`].
    pub fn start_fast_read(&mut self, addr: u32, data: &'a mut [u8]) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(Job::new(self.read_op(), addr, Payload::Read { dst: data }))
    }

    /// Start a status register write; see [`Flash::write_sr`].
    pub fn start_write_sr(&mut self, sr: u8) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(Job::new(Op::WriteSrWren, 0, Payload::WriteSr { data: sr }))
    }

    /// Start a status register read into `dst`.
    pub fn start_read_sr(&mut self, dst: &'a mut u8) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(Job::new(Op::ReadSr, 0, Payload::Sr { dst }))
    }

    /// Start a status register read, storing 1 in `dst` if the busy flag
    /// is set and 0 otherwise.
    pub fn start_read_sr_busy(&mut self, dst: &'a mut u8) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(Job::new(Op::ReadSrBusy, 0, Payload::Sr { dst }))
    }

    /// Start a JEDEC ID read into `dst`.
    pub fn start_read_jedec_id(&mut self, dst: &'a mut [u8; 3]) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(Job::new(Op::ReadJedec, 0, Payload::Id { dst }))
    }

    /// Start a product ID read into `dst`.
    pub fn start_read_product_id(&mut self, dst: &'a mut [u8; 3]) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(Job::new(Op::ReadProduct, 0, Payload::Id { dst }))
    }

    /// Start a vendor register read into `dst`; see [`Flash::read_reg`].
    pub fn start_read_reg(&mut self, reg: u8, dst: &'a mut u8) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(Job::new(Op::ReadReg, 0, Payload::Reg { reg, dst }))
    }

    /// Start a vendor register write; see [`Flash::write_reg`].
    pub fn start_write_reg(
        &mut self,
        reg: u8,
        data: u8,
        write_en: bool,
        wait_ms: u32,
    ) -> Result<(), H::Error> {
        self.check_idle()?;
        self.start(self.stage_write_reg(reg, data, write_en, wait_ms))
    }

    /// Feed a HAL completion into the state machine.
    ///
    /// Call this once per completed `txrx` or `wait` of a started
    /// operation, from whatever context observes the completion: a SPI
    /// interrupt, a timer, or a BUSY-line edge handler. A non-OK `io`
    /// aborts the operation and finalizes with the error.
    ///
    /// Returns `Error::BadState` when no operation is in flight. While
    /// the operation continues, returns `Ok`. When it finishes, the
    /// result goes to the registered callback (and `trigger` returns
    /// `Ok`), or is returned directly when no callback is set.
    pub fn trigger(&mut self, io: core::result::Result<(), H::Error>) -> Result<(), H::Error> {
        let mut job = match self.job.take() {
            Some(job) => job,
            None => return Err(Error::BadState),
        };
        let tag = job.op;
        let res = self.advance(&mut job, io);
        if res.is_ok() && job.op != Op::Idle {
            self.job = Some(job);
            return Ok(());
        }

        if res.is_err() {
            self.hal.chip_select(false);
        }
        self.conclude(tag, &res);
        log::debug!("{:?} finished: {}", tag, if res.is_ok() { "ok" } else { "error" });
        match self.on_complete.as_mut() {
            Some(callback) => {
                callback(tag, res);
                Ok(())
            }
            None => res,
        }
    }

    // Execution harnesses.

    fn check_idle(&self) -> Result<(), H::Error> {
        if self.job.is_some() {
            Err(Error::Busy)
        } else {
            Ok(())
        }
    }

    fn check_erase_range(&self, addr: u32, len: u32) -> Result<(), H::Error> {
        let mask = erase_plan::supported_block_mask(self.cmds, self.cfg);
        if erase_plan::largest_erase_area(mask, addr, len) == 0 {
            log::debug!("erase: addr={:#08x} len={:#x} unaligned", addr, len);
            return Err(Error::EraseUnaligned);
        }
        Ok(())
    }

    fn read_op(&self) -> Op {
        if self.cmds.read_data_fast != 0 {
            Op::FastRead
        } else {
            Op::Read
        }
    }

    fn stage_write_reg(&self, reg: u8, data: u8, write_en: bool, wait_ms: u32) -> Job<'a> {
        let op = if write_en {
            Op::WriteRegWren
        } else {
            Op::WriteRegData
        };
        let mut job = Job::new(op, 0, Payload::WriteReg { reg, data });
        if write_en {
            job.wait_period_ms = wait_ms;
        }
        job
    }

    /// Run a staged job to completion by synthesizing an OK completion
    /// for every HAL action.
    fn run_blocking(&mut self, mut job: Job<'_>) -> Result<(), H::Error> {
        let tag = job.op;
        if self.could_be_busy {
            job.busy_pre_check = true;
        }
        let mut res = self.begin(&mut job);
        while res.is_ok() && job.op != Op::Idle {
            res = self.advance(&mut job, Ok(()));
        }
        if res.is_err() {
            self.hal.chip_select(false);
        }
        self.conclude(tag, &res);
        res
    }

    /// Issue the first HAL action of a staged job and park it; further
    /// progress comes through [`Flash::trigger`].
    fn start(&mut self, mut job: Job<'a>) -> Result<(), H::Error> {
        if self.could_be_busy {
            job.busy_pre_check = true;
        }
        match self.begin(&mut job) {
            Ok(()) => {
                self.job = Some(job);
                Ok(())
            }
            Err(e) => {
                // The operation never started; no callback will fire.
                self.hal.chip_select(false);
                Err(e)
            }
        }
    }

    /// Record whether the finished operation may leave the device busy.
    /// Only a successful completion updates the hint; errors leave it as
    /// it was, so an `HwBusy` abort keeps the pre-check armed.
    fn conclude(&mut self, tag: Op, res: &Result<(), H::Error>) {
        if res.is_ok() {
            self.could_be_busy = tag.mutates_device();
        }
    }

    // The state machine proper.

    /// Issue the single HAL action of the current state and return.
    fn begin(&mut self, job: &mut Job<'_>) -> Result<(), H::Error> {
        if job.op == Op::Idle {
            return Err(Error::BadState);
        }

        if job.busy_pre_check {
            log::trace!("pre-check: reading status register");
            self.hal.chip_select(true);
            return self
                .hal
                .txrx(
                    slice::from_ref(&self.cmds.read_sr),
                    slice::from_mut(&mut job.sr_data),
                )
                .map_err(Error::Access);
        }

        match job.op {
            Op::WriteWren
            | Op::EraseBlockWren
            | Op::EraseChipWren
            | Op::WriteSrWren
            | Op::WriteRegWren => {
                log::trace!("{:?}: write enable", job.op);
                self.hal.chip_select(true);
                self.hal
                    .txrx(slice::from_ref(&self.cmds.write_enable), &mut [])
                    .map_err(Error::Access)
            }

            Op::WriteAddr => {
                log::trace!("write: program at {:#08x}", job.addr);
                self.hal.chip_select(true);
                job.scratch[0] = self.cmds.page_program;
                self.cfg.compose_address(job.addr, &mut job.scratch[1..]);
                let n = 1 + self.cfg.address_len();
                self.hal.txrx(&job.scratch[..n], &mut []).map_err(Error::Access)
            }

            Op::WriteData => {
                // Payload continues on the CS assertion WriteAddr opened.
                let src = match &mut job.payload {
                    Payload::Write { src } => mem::take(src),
                    _ => return Err(Error::Internal),
                };
                let page_remaining = self.cfg.page_size - (job.addr & (self.cfg.page_size - 1));
                let n = (src.len() as u32).min(page_remaining) as usize;
                let (chunk, rest) = src.split_at(n);
                log::trace!("write: {} bytes, {} remaining", n, rest.len());
                job.payload = Payload::Write { src: rest };
                job.addr += n as u32;
                job.wait_period_ms = self.cfg.page_program_ms;
                job.busy_check = BusyCheck::Wait;
                self.hal.txrx(chunk, &mut []).map_err(Error::Access)
            }

            Op::EraseBlockIssue => {
                let remaining = match job.payload {
                    Payload::Erase { remaining } => remaining,
                    _ => return Err(Error::Internal),
                };
                let mask = erase_plan::supported_block_mask(self.cmds, self.cfg);
                let area = erase_plan::largest_erase_area(mask, job.addr, remaining);
                self.hal.chip_select(true);
                let opcode = match self.cmds.erase_opcode(self.cfg.page_size, area) {
                    Some(opcode) => opcode,
                    None => return Err(Error::BadConfig),
                };
                log::trace!("erase: {:#x} bytes at {:#08x}", area, job.addr);
                job.scratch[0] = opcode;
                self.cfg.compose_address(job.addr, &mut job.scratch[1..]);
                job.addr += area;
                job.payload = Payload::Erase {
                    remaining: remaining - area,
                };
                job.wait_period_ms = self.cfg.erase_time_ms(area);
                job.busy_check = BusyCheck::Wait;
                let n = 1 + self.cfg.address_len();
                self.hal.txrx(&job.scratch[..n], &mut []).map_err(Error::Access)
            }

            Op::EraseChipIssue => {
                log::trace!("chip erase: command");
                self.hal.chip_select(true);
                job.wait_period_ms = self.cfg.chip_erase_ms;
                job.busy_check = BusyCheck::Wait;
                self.hal
                    .txrx(slice::from_ref(&self.cmds.chip_erase), &mut [])
                    .map_err(Error::Access)
            }

            Op::WriteSrData => {
                let data = match job.payload {
                    Payload::WriteSr { data } => data,
                    _ => return Err(Error::Internal),
                };
                log::trace!("write sr: data");
                job.scratch[0] = self.cmds.write_sr;
                job.scratch[1] = data;
                self.hal.chip_select(true);
                job.wait_period_ms = self.cfg.sr_write_ms;
                job.busy_check = BusyCheck::Wait;
                self.hal.txrx(&job.scratch[..2], &mut []).map_err(Error::Access)
            }

            Op::WriteRegData | Op::WriteRegDataWait => {
                let (reg, data) = match job.payload {
                    Payload::WriteReg { reg, data } => (reg, data),
                    _ => return Err(Error::Internal),
                };
                log::trace!("write reg: data");
                job.scratch[0] = reg;
                job.scratch[1] = data;
                self.hal.chip_select(true);
                job.busy_check = if job.op == Op::WriteRegData {
                    BusyCheck::Idle
                } else {
                    // wait_period_ms was staged at request time.
                    BusyCheck::Wait
                };
                self.hal.txrx(&job.scratch[..2], &mut []).map_err(Error::Access)
            }

            Op::Read | Op::FastRead => {
                let fast = job.op == Op::FastRead;
                log::trace!("read: addr={:#08x} fast={}", job.addr, fast);
                self.hal.chip_select(true);
                job.scratch[0] = if fast {
                    self.cmds.read_data_fast
                } else {
                    self.cmds.read_data
                };
                self.cfg.compose_address(job.addr, &mut job.scratch[1..]);
                // Fast read carries one dummy byte beyond the configured ones.
                let n = 1 + self.cfg.address_len() + usize::from(fast);
                let Job { scratch, payload, .. } = job;
                match payload {
                    Payload::Read { dst } => self
                        .hal
                        .txrx(&scratch[..n], dst)
                        .map_err(Error::Access),
                    _ => Err(Error::Internal),
                }
            }

            Op::ReadSr | Op::ReadSrBusy => {
                log::trace!("read sr");
                self.hal.chip_select(true);
                self.hal
                    .txrx(
                        slice::from_ref(&self.cmds.read_sr),
                        slice::from_mut(&mut job.sr_data),
                    )
                    .map_err(Error::Access)
            }

            Op::ReadJedec => {
                log::trace!("read jedec id");
                self.hal.chip_select(true);
                match &mut job.payload {
                    Payload::Id { dst } => self
                        .hal
                        .txrx(slice::from_ref(&self.cmds.jedec_id), &mut dst[..])
                        .map_err(Error::Access),
                    _ => Err(Error::Internal),
                }
            }

            Op::ReadProduct => {
                log::trace!("read product id");
                self.hal.chip_select(true);
                match &mut job.payload {
                    Payload::Id { dst } => self
                        .hal
                        .txrx(slice::from_ref(&self.cmds.device_id), &mut dst[..])
                        .map_err(Error::Access),
                    _ => Err(Error::Internal),
                }
            }

            Op::ReadReg => {
                self.hal.chip_select(true);
                let Job { scratch, payload, .. } = job;
                match payload {
                    Payload::Reg { reg, dst } => {
                        log::trace!("read reg {:#04x}", reg);
                        scratch[0] = *reg;
                        self.hal
                            .txrx(&scratch[..1], slice::from_mut(&mut **dst))
                            .map_err(Error::Access)
                    }
                    _ => Err(Error::Internal),
                }
            }

            Op::Idle => Err(Error::Internal),
        }
    }

    /// Consume one HAL completion: run the busy-check subengine if one is
    /// pending, then advance the operation and issue its next action.
    fn advance(
        &mut self,
        job: &mut Job<'_>,
        io: core::result::Result<(), H::Error>,
    ) -> Result<(), H::Error> {
        io.map_err(Error::Access)?;

        if job.busy_pre_check {
            if StatusRegister(job.sr_data).busy(self.cmds.sr_busy_mask) {
                log::debug!("pre-check: device busy");
                self.hal.chip_select(false);
                return Err(Error::HwBusy);
            }
            log::trace!("pre-check: device ready");
            job.busy_pre_check = false;
            self.hal.chip_select(false);
            return self.begin(job);
        }

        match job.busy_check {
            BusyCheck::Wait => {
                self.hal.chip_select(false);
                // A zero period means the BUSY pin is wired: one wait and
                // no status polling.
                job.busy_check = if job.wait_period_ms == 0 {
                    BusyCheck::Idle
                } else {
                    BusyCheck::ReadSr
                };
                log::trace!("busy check: wait {} ms", job.wait_period_ms);
                self.hal.wait(job.wait_period_ms);
                return Ok(());
            }
            BusyCheck::ReadSr => {
                job.busy_check = BusyCheck::Check;
                self.hal.chip_select(true);
                return self
                    .hal
                    .txrx(
                        slice::from_ref(&self.cmds.read_sr),
                        slice::from_mut(&mut job.sr_data),
                    )
                    .map_err(Error::Access);
            }
            BusyCheck::Check => {
                self.hal.chip_select(false);
                if StatusRegister(job.sr_data).busy(self.cmds.sr_busy_mask) {
                    job.wait_period_ms = (job.wait_period_ms / 2).max(1);
                    log::trace!("busy check: still busy, wait {} ms", job.wait_period_ms);
                    job.busy_check = BusyCheck::ReadSr;
                    self.hal.wait(job.wait_period_ms);
                    return Ok(());
                }
                log::trace!("busy check: ready");
                job.busy_check = BusyCheck::Idle;
            }
            BusyCheck::Idle => (),
        }

        match job.op {
            Op::WriteWren => {
                self.hal.chip_select(false);
                job.op = Op::WriteAddr;
            }
            // Address and data share one CS assertion; no deassert here.
            Op::WriteAddr => {
                job.op = Op::WriteData;
            }
            Op::WriteData => {
                let done = matches!(&job.payload, Payload::Write { src } if src.is_empty());
                job.op = if done { Op::Idle } else { Op::WriteWren };
            }

            Op::EraseBlockWren => {
                self.hal.chip_select(false);
                job.op = Op::EraseBlockIssue;
            }
            Op::EraseBlockIssue => {
                let done = matches!(job.payload, Payload::Erase { remaining: 0 });
                job.op = if done { Op::Idle } else { Op::EraseBlockWren };
            }

            Op::EraseChipWren => {
                self.hal.chip_select(false);
                job.op = Op::EraseChipIssue;
            }

            Op::WriteSrWren => {
                self.hal.chip_select(false);
                job.op = Op::WriteSrData;
            }

            Op::WriteRegWren => {
                self.hal.chip_select(false);
                job.op = Op::WriteRegDataWait;
            }

            Op::ReadSr | Op::ReadSrBusy => {
                let sr = StatusRegister(job.sr_data);
                let value = if job.op == Op::ReadSrBusy {
                    sr.busy(self.cmds.sr_busy_mask) as u8
                } else {
                    sr.0
                };
                match &mut job.payload {
                    Payload::Sr { dst } => **dst = value,
                    _ => return Err(Error::Internal),
                }
                job.op = Op::Idle;
            }

            Op::EraseChipIssue
            | Op::WriteSrData
            | Op::WriteRegData
            | Op::WriteRegDataWait
            | Op::Read
            | Op::FastRead
            | Op::ReadJedec
            | Op::ReadProduct
            | Op::ReadReg => {
                job.op = Op::Idle;
            }

            Op::Idle => return Err(Error::Internal),
        }

        if job.op != Op::Idle {
            self.begin(job)
        } else {
            self.hal.chip_select(false);
            Ok(())
        }
    }
}
