//! Hand-over of compiled programs to the board.
//!
//! The vendor library is abstracted by the [`PbDriver`] trait, one method per library call.
//! [`write_pulse_program`] and [`write_pulse_program_and_start`] drive it in the order the board
//! expects and write every instruction exactly as compiled.

use log::{debug, info};

use crate::diagnostics::log_pb_insts;
use crate::error::Result;
use crate::instruction::{Flags, PbInstruction};

/// Operations of a pulse blaster driver. Failures are reported as [`crate::error::PbError::Driver`].
pub trait PbDriver {
    /// Opens the board for use.
    fn init(&mut self) -> Result<()>;
    /// Releases the board. A loaded program keeps running.
    fn close(&mut self) -> Result<()>;
    fn start_programming(&mut self) -> Result<()>;
    /// Writes one instruction, `opcode` being the wire value of [`crate::instruction::Opcode`].
    fn write_inst(&mut self, flags: Flags, opcode: u32, data: u32, length_ns: f64) -> Result<()>;
    fn stop_programming(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// Re-initializes the board and loads `pb_insts` into its instruction memory.
pub fn write_pulse_program<D: PbDriver + ?Sized>(driver: &mut D, pb_insts: &[PbInstruction]) -> Result<()> {
    driver.close()?;
    driver.init()?;
    driver.start_programming()?;
    log_pb_insts(pb_insts);
    for inst in pb_insts {
        let (flags, opcode, data, length) = inst.to_tuple();
        driver.write_inst(flags, opcode, data, length as f64)?;
    }
    driver.stop_programming()?;
    debug!("Wrote {} instructions", pb_insts.len());
    Ok(())
}

/// [`write_pulse_program`], then starts the program and releases the board.
pub fn write_pulse_program_and_start<D: PbDriver + ?Sized>(
    driver: &mut D,
    pb_insts: &[PbInstruction],
) -> Result<()> {
    write_pulse_program(driver, pb_insts)?;
    driver.start()?;
    driver.close()?;
    info!("Programmed pulse blaster and started");
    Ok(())
}
