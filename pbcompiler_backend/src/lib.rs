//! # PulseBlaster compiler backend
//!
//! Compiles per-channel pulse trains of a SpinCore PulseBlaster digital pattern generator into
//! the list of `(flags, opcode, data, length)` instructions the board executes.
//!
//! ## Compilation pipeline
//! 1. [`channel`]: every output is a [`channel::PulseBlasterChannel`], its pulses quantized to
//!    the board clock.
//! 2. [`timeline`]: pulse edges of all channels are merged into one time-ordered list of flag
//!    updates.
//! 3. [`instruction`]: the updates are folded into the minimal instruction list, simultaneous
//!    edges sharing one instruction. The program may be looped with [`instruction::make_continuous`].
//! 4. [`short_pulse`]: instructions shorter than the sequencer allows are rewritten with the
//!    board's short pulse feature.
//!
//! [`compiler::create_pb_insts`] runs the whole pipeline. [`diagnostics`] renders compiled
//! programs as bit strings, timing diagrams or sampled flags.
//!
//! ## Devices and experiments
//! [`device::Device`] holds the named channels of one board together with its edit and compile
//! caches, and [`experiment::Experiment`] is a collection of devices addressed by name. The
//! [`loader`] hands compiled programs to a [`loader::PbDriver`]. With the `python` feature,
//! `Experiment` is exported as a python class.
//!
//! ## Example
//! ```
//! use pbcompiler_backend::*;
//!
//! let mut exp = Experiment::new();
//! exp.add_pb_device("pb0", 500e6, 21).unwrap();
//! exp.add_channel("pb0", "aom", 0).unwrap();
//! exp.add_channel("pb0", "laser", 1).unwrap();
//! exp.high("pb0", "aom", 100., 50.).unwrap();
//! exp.pulse_train("pb0", "laser", &[0., 200.], &[100., 100.]).unwrap();
//! exp.set_all_off_padding("pb0", 1000.).unwrap();
//!
//! assert_eq!(exp.compile(true, 0).unwrap(), 1300);
//! let insts = exp.device_pb_insts("pb0").unwrap();
//! assert_eq!(insts.last().unwrap().opcode, Opcode::Branch);
//! ```

pub mod channel;
pub mod compiler;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod experiment;
pub mod instruction;
pub mod loader;
#[cfg(feature = "python")]
pub mod python;
pub mod short_pulse;
pub mod timeline;
pub mod utils;

pub use channel::*;
pub use compiler::*;
pub use device::*;
pub use diagnostics::*;
pub use error::*;
pub use experiment::*;
pub use instruction::*;
pub use loader::*;
pub use short_pulse::*;
pub use timeline::*;
