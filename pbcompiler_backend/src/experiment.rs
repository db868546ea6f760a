//! The experiment module provides the highest level of abstraction for managing pulse blaster
//! boards, and the single place by which methods are exposed to the orchestration layer (and
//! to python through the `python` feature).
//!
//! ## Overview
//!
//! The [`Experiment`] struct is a collection of devices addressed by name. Its behavior is
//! defined by the [`BaseExperiment`] trait, whose methods forward to the targeted
//! [`Device`] (see [`BaseDevice`]) after checking that it exists.
//!
//! ## Key Structures and Their Relationships
//!
//! - **Experiment**: what users interact with.
//! - **Device**: one board with its own clock, holding named channels.
//! - **Channel**: one physical output of a board, edited as a set of pulses.
//! - **Instruction**: compiled programs are lists of [`PbInstruction`]s, one list per device.
//!
//! Every operation returns a [`Result`]; unknown devices or channels are reported as
//! [`PbError::UnknownDevice`] and [`PbError::UnknownChannel`].

use indexmap::IndexMap;

use crate::device::*;
use crate::diagnostics::{ChannelsLookUp, PlotLines};
use crate::error::{PbError, Result};
use crate::instruction::*;
use crate::loader::{write_pulse_program, write_pulse_program_and_start, PbDriver};

/// This trait defines the behavior of the [`Experiment`] struct through default trait
/// implementations.
///
/// Trait methods are classified into the following categories:
/// 1. Experiment-targeted methods which alter or query all devices:
///     - [`add_pb_device`]
///     - [`compile`], [`total_run_time`], [`last_pulse_end`]
///     - [`is_edited`], [`is_compiled`], [`is_fresh_compiled`]
///     - [`clear_edit_cache`], [`clear_compile_cache`]
/// 2. Device-targeted methods:
///     - [`add_channel`], [`set_all_off_padding`], [`add_sync_out`], [`pwm`]
///     - [`device_compile`], [`device_pb_insts`], [`device_plot_lines`],
///       [`device_print_insts`], [`device_total_run_time`], [`device_channels_lookup`]
///     - [`device_clear_edit_cache`], [`device_clear_compile_cache`]
///     - [`device_write_pulse_program`]
/// 3. Channel-targeted methods: [`high`], [`pulse_train`]
/// 4. Internal helpers: [`devices`], [`devices_`], [`dev`], [`device_op`]
///
/// [`add_pb_device`]: BaseExperiment::add_pb_device
/// [`compile`]: BaseExperiment::compile
/// [`total_run_time`]: BaseExperiment::total_run_time
/// [`last_pulse_end`]: BaseExperiment::last_pulse_end
/// [`is_edited`]: BaseExperiment::is_edited
/// [`is_compiled`]: BaseExperiment::is_compiled
/// [`is_fresh_compiled`]: BaseExperiment::is_fresh_compiled
/// [`clear_edit_cache`]: BaseExperiment::clear_edit_cache
/// [`clear_compile_cache`]: BaseExperiment::clear_compile_cache
/// [`add_channel`]: BaseExperiment::add_channel
/// [`set_all_off_padding`]: BaseExperiment::set_all_off_padding
/// [`add_sync_out`]: BaseExperiment::add_sync_out
/// [`pwm`]: BaseExperiment::pwm
/// [`device_compile`]: BaseExperiment::device_compile
/// [`device_pb_insts`]: BaseExperiment::device_pb_insts
/// [`device_plot_lines`]: BaseExperiment::device_plot_lines
/// [`device_print_insts`]: BaseExperiment::device_print_insts
/// [`device_total_run_time`]: BaseExperiment::device_total_run_time
/// [`device_channels_lookup`]: BaseExperiment::device_channels_lookup
/// [`device_clear_edit_cache`]: BaseExperiment::device_clear_edit_cache
/// [`device_clear_compile_cache`]: BaseExperiment::device_clear_compile_cache
/// [`device_write_pulse_program`]: BaseExperiment::device_write_pulse_program
/// [`high`]: BaseExperiment::high
/// [`pulse_train`]: BaseExperiment::pulse_train
/// [`devices`]: BaseExperiment::devices
/// [`devices_`]: BaseExperiment::devices_
/// [`dev`]: BaseExperiment::dev
/// [`device_op`]: BaseExperiment::device_op
pub trait BaseExperiment {
    // FIELD methods
    fn devices(&self) -> &IndexMap<String, Device>;
    fn devices_(&mut self) -> &mut IndexMap<String, Device>;

    /// Borrows device `name`.
    ///
    /// # Example
    /// ```
    /// use pbcompiler_backend::experiment::*;
    /// use pbcompiler_backend::error::PbError;
    ///
    /// let mut exp = Experiment::new();
    /// exp.add_pb_device("pb0", 500e6, 21).unwrap();
    /// assert!(exp.dev("pb0").is_ok());
    /// assert_eq!(exp.dev("pb1").unwrap_err(), PbError::UnknownDevice("pb1".to_string()));
    /// ```
    fn dev(&self, name: &str) -> Result<&Device> {
        self.devices()
            .get(name)
            .ok_or_else(|| PbError::UnknownDevice(name.to_string()))
    }

    /// Executes the closure `f` on device `name`.
    ///
    /// # Errors
    ///
    /// [`PbError::UnknownDevice`] if the device is not registered, otherwise whatever `f`
    /// returns.
    fn device_op<F, R>(&mut self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Device) -> Result<R>,
    {
        let dev = self
            .devices_()
            .get_mut(name)
            .ok_or_else(|| PbError::UnknownDevice(name.to_string()))?;
        f(dev)
    }

    /// Registers a board, see [`Device::new`].
    ///
    /// # Errors
    ///
    /// [`PbError::DuplicateDevice`] if a device of the same name is already registered, or any
    /// error of [`Device::new`].
    fn add_pb_device(&mut self, name: &str, clock_frequency_hz: f64, short_pulse_bit_num: u32) -> Result<()> {
        if self.devices().contains_key(name) {
            return Err(PbError::DuplicateDevice(name.to_string()));
        }
        let dev = Device::new(name, clock_frequency_hz, short_pulse_bit_num)?;
        self.devices_().insert(name.to_string(), dev);
        Ok(())
    }

    /// See [`BaseDevice::add_channel`].
    fn add_channel(&mut self, dev_name: &str, chan_name: &str, number: u32) -> Result<()> {
        self.device_op(dev_name, |dev| dev.add_channel(chan_name, number))
    }

    /// See [`BaseDevice::high`].
    ///
    /// # Example
    /// ```
    /// use pbcompiler_backend::experiment::*;
    ///
    /// let mut exp = Experiment::new();
    /// exp.add_pb_device("pb0", 500e6, 21).unwrap();
    /// exp.add_channel("pb0", "aom", 0).unwrap();
    /// exp.high("pb0", "aom", 100., 50.).unwrap();
    /// assert!(exp.high("pb0", "aom", 120., 50.).is_err()); // overlaps
    /// assert_eq!(exp.last_pulse_end(), 150);
    /// ```
    fn high(&mut self, dev_name: &str, chan_name: &str, t_ns: f64, duration_ns: f64) -> Result<()> {
        self.device_op(dev_name, |dev| dev.high(chan_name, t_ns, duration_ns))
    }

    /// See [`BaseDevice::pulse_train`].
    fn pulse_train(
        &mut self,
        dev_name: &str,
        chan_name: &str,
        start_times_ns: &[f64],
        pulse_lengths_ns: &[f64],
    ) -> Result<()> {
        self.device_op(dev_name, |dev| {
            dev.pulse_train(chan_name, start_times_ns, pulse_lengths_ns)
        })
    }

    fn set_all_off_padding(&mut self, dev_name: &str, padding_ns: f64) -> Result<()> {
        self.device_op(dev_name, |dev| dev.set_all_off_padding(padding_ns))
    }

    /// See [`BaseDevice::add_sync_out`].
    fn add_sync_out(&mut self, dev_name: &str, chan_name: &str, sync_out_mhz: f64) -> Result<()> {
        self.device_op(dev_name, |dev| dev.add_sync_out(chan_name, sync_out_mhz))
    }

    /// See [`BaseDevice::pwm`].
    fn pwm(&mut self, dev_name: &str, chan_names: &[&str], frequency_hz: f64, duty_cycle_percent: f64) -> Result<()> {
        self.device_op(dev_name, |dev| dev.pwm(chan_names, frequency_hz, duty_cycle_percent))
    }

    /// Compiles every registered device with the same looping behavior.
    ///
    /// Returns the longest program duration in ns. Devices are compiled in registration order
    /// and compilation stops at the first error.
    ///
    /// # Example
    /// ```
    /// use pbcompiler_backend::experiment::*;
    ///
    /// let mut exp = Experiment::new();
    /// exp.add_pb_device("pb0", 500e6, 21).unwrap();
    /// exp.add_channel("pb0", "aom", 0).unwrap();
    /// exp.high("pb0", "aom", 0., 100.).unwrap();
    /// exp.set_all_off_padding("pb0", 20.).unwrap();
    /// assert_eq!(exp.compile(true, 0).unwrap(), 120);
    /// assert!(exp.is_fresh_compiled());
    /// ```
    fn compile(&mut self, continuous: bool, branch_to: usize) -> Result<u64> {
        for dev in self.devices_().values_mut() {
            dev.compile(continuous, branch_to)?;
        }
        Ok(self.total_run_time())
    }

    fn device_compile(&mut self, dev_name: &str, continuous: bool, branch_to: usize) -> Result<u64> {
        self.device_op(dev_name, |dev| dev.compile(continuous, branch_to))
    }

    /// Longest compiled program over all devices, `0` if none is compiled.
    fn total_run_time(&self) -> u64 {
        self.devices()
            .values()
            .filter_map(|dev| dev.total_run_time().ok())
            .max()
            .unwrap_or(0)
    }

    /// Latest edited pulse end over all devices.
    fn last_pulse_end(&self) -> u64 {
        self.devices()
            .values()
            .map(|dev| dev.last_pulse_end())
            .max()
            .unwrap_or(0)
    }

    /// Copy of the compiled instruction list of device `dev_name`.
    fn device_pb_insts(&self, dev_name: &str) -> Result<PbInstructions> {
        Ok(self.dev(dev_name)?.pb_insts()?.to_vec())
    }

    fn device_plot_lines(&self, dev_name: &str) -> Result<PlotLines> {
        self.dev(dev_name)?.plot_lines()
    }

    /// Bit-string dump of the compiled program of device `dev_name`, one instruction per line.
    fn device_print_insts(&self, dev_name: &str) -> Result<String> {
        self.dev(dev_name)?.format_insts()
    }

    fn device_total_run_time(&self, dev_name: &str) -> Result<u64> {
        self.dev(dev_name)?.total_run_time()
    }

    fn device_channels_lookup(&self, dev_name: &str) -> Result<ChannelsLookUp> {
        Ok(self.dev(dev_name)?.channels_lookup())
    }

    /// Loads the compiled program of device `dev_name` onto the board through `driver`, and
    /// starts it if `start` is set.
    fn device_write_pulse_program<D: PbDriver + ?Sized>(
        &self,
        dev_name: &str,
        driver: &mut D,
        start: bool,
    ) -> Result<()> {
        let pb_insts = self.dev(dev_name)?.pb_insts()?;
        if start {
            write_pulse_program_and_start(driver, pb_insts)
        } else {
            write_pulse_program(driver, pb_insts)
        }
    }

    /// Checks if any of the registered devices have been edited.
    /// Also see [`BaseDevice::is_edited`].
    fn is_edited(&self) -> bool {
        self.devices().values().any(|dev| dev.is_edited())
    }
    /// Checks if any of the registered devices have been compiled.
    fn is_compiled(&self) -> bool {
        self.devices().values().any(|dev| dev.is_compiled())
    }
    /// Checks if all registered devices are in a freshly compiled state.
    /// Also see [`BaseDevice::is_fresh_compiled`].
    fn is_fresh_compiled(&self) -> bool {
        self.devices().values().all(|dev| dev.is_fresh_compiled())
    }

    /// Clears edit and compile caches of all devices.
    fn clear_edit_cache(&mut self) {
        self.clear_compile_cache();
        self.devices_()
            .values_mut()
            .for_each(|dev| dev.clear_edit_cache());
    }
    fn clear_compile_cache(&mut self) {
        self.devices_()
            .values_mut()
            .for_each(|dev| dev.clear_compile_cache());
    }

    fn device_clear_edit_cache(&mut self, dev_name: &str) -> Result<()> {
        self.device_op(dev_name, |dev| {
            dev.clear_compile_cache();
            dev.clear_edit_cache();
            Ok(())
        })
    }
    fn device_clear_compile_cache(&mut self, dev_name: &str) -> Result<()> {
        self.device_op(dev_name, |dev| {
            dev.clear_compile_cache();
            Ok(())
        })
    }
}

/// A concrete struct consisting of a collection of devices.
///
/// **Refer to the [`BaseExperiment`] trait for method behavior.**
#[cfg_attr(feature = "python", pyo3::pyclass)]
#[derive(Clone, Debug, Default)]
pub struct Experiment {
    devices: IndexMap<String, Device>,
}

impl Experiment {
    pub fn new() -> Self {
        Self {
            devices: IndexMap::new(),
        }
    }
}

/// A macro implementing the field methods of [`BaseExperiment`] for a struct holding its
/// devices in a `devices: IndexMap<String, Device>` field.
///
/// Usage:
/// ```rust
/// use indexmap::IndexMap;
/// use pbcompiler_backend::device::*;
/// use pbcompiler_backend::experiment::*;
/// use pbcompiler_backend::impl_exp_boilerplate;
///
/// struct LabExperiment {
///     devices: IndexMap<String, Device>,
///     operator: String,
/// }
/// impl_exp_boilerplate!(LabExperiment);
///
/// let mut exp = LabExperiment { devices: IndexMap::new(), operator: "ana".to_string() };
/// exp.add_pb_device("pb0", 500e6, 21).unwrap();
/// assert_eq!(exp.devices().len(), 1);
/// ```
#[macro_export]
macro_rules! impl_exp_boilerplate {
    ($exp_type: ty) => {
        impl $crate::experiment::BaseExperiment for $exp_type {
            fn devices(&self) -> &::indexmap::IndexMap<String, $crate::device::Device> {
                &self.devices
            }
            fn devices_(&mut self) -> &mut ::indexmap::IndexMap<String, $crate::device::Device> {
                &mut self.devices
            }
        }
    };
}

impl_exp_boilerplate!(Experiment);

#[cfg(test)]
mod test {
    use crate::device::BaseDevice;
    use crate::error::PbError;
    use crate::experiment::*;
    use crate::instruction::*;

    fn two_device_experiment() -> Experiment {
        let mut exp = Experiment::new();
        exp.add_pb_device("pb0", 500e6, 21).unwrap();
        exp.add_pb_device("pb1", 100e6, 21).unwrap();
        exp.add_channel("pb0", "aom", 0).unwrap();
        exp.add_channel("pb0", "laser", 1).unwrap();
        exp.add_channel("pb1", "camera", 4).unwrap();
        exp
    }

    mod registry {
        use super::*;

        #[test]
        fn duplicates_and_unknown_names() {
            let mut exp = two_device_experiment();
            assert_eq!(
                exp.add_pb_device("pb0", 500e6, 21),
                Err(PbError::DuplicateDevice("pb0".to_string()))
            );
            assert_eq!(
                exp.add_channel("pb2", "aom", 0),
                Err(PbError::UnknownDevice("pb2".to_string()))
            );
            assert!(matches!(
                exp.add_channel("pb0", "aom", 5),
                Err(PbError::DuplicateChannel { .. })
            ));
            // channels are per device
            exp.add_channel("pb1", "aom", 0).unwrap();
            assert_eq!(
                exp.high("pb1", "laser", 0., 10.),
                Err(PbError::UnknownChannel {
                    device: "pb1".to_string(),
                    channel: "laser".to_string()
                })
            );
            assert!(matches!(
                exp.device_pb_insts("pb3"),
                Err(PbError::UnknownDevice(_))
            ));
        }

        #[test]
        fn channels_lookup() {
            let exp = two_device_experiment();
            let lookup = exp.device_channels_lookup("pb0").unwrap();
            assert_eq!(lookup.get(&0).map(String::as_str), Some("aom"));
            assert_eq!(lookup.get(&1).map(String::as_str), Some("laser"));
            assert_eq!(lookup.len(), 2);
        }
    }

    mod compile {
        use super::*;

        #[test]
        fn fixture_program() {
            let mut exp = two_device_experiment();
            exp.high("pb0", "aom", 6., 10.).unwrap();
            exp.pulse_train("pb0", "laser", &[2., 16.], &[8., 14.]).unwrap();
            exp.set_all_off_padding("pb0", 22.).unwrap();
            exp.device_compile("pb0", false, 0).unwrap();

            let insts = exp.device_pb_insts("pb0").unwrap();
            let raw: Vec<_> = insts.iter().map(|inst| (inst.flags, inst.length)).collect();
            assert_eq!(
                raw,
                vec![
                    (1 << 21, 10),
                    (2 << 21 | 0b10, 10),
                    (2 << 21 | 0b11, 10),
                    (3 << 21 | 0b01, 10),
                    (0b10, 14),
                    (0, 22),
                ]
            );
            assert!(insts.iter().all(|inst| inst.opcode == Opcode::Continue));
            assert_eq!(exp.device_total_run_time("pb0").unwrap(), 76);
            assert!(!exp.dev("pb1").unwrap().is_compiled());
            assert_eq!(
                exp.device_total_run_time("pb1"),
                Err(PbError::NotCompiled("pb1".to_string()))
            );
        }

        #[test]
        fn all_devices() {
            let mut exp = two_device_experiment();
            exp.high("pb0", "aom", 0., 100.).unwrap();
            exp.high("pb1", "camera", 0., 1000.).unwrap();
            exp.set_all_off_padding("pb1", 500.).unwrap();
            assert_eq!(exp.compile(true, 0).unwrap(), 1500);
            assert!(exp.is_fresh_compiled());
            assert_eq!(exp.device_total_run_time("pb0").unwrap(), 100);
            assert_eq!(
                exp.device_pb_insts("pb1").unwrap(),
                vec![PbInstruction::new(1 << 4, Opcode::Continue, 0, 1000), PbInstruction::new(0, Opcode::Branch, 0, 500)]
            );
            let dump = exp.device_print_insts("pb1").unwrap();
            assert_eq!(dump.lines().count(), 2);
            assert!(dump.contains("BRANCH"));
            let lines = exp.device_plot_lines("pb1").unwrap();
            assert_eq!(lines["camera"], (vec![0, 0, 0, 1000, 1000, 1500], vec![0, 0, 1, 1, 0, 0]));
        }

        #[test]
        fn branch_out_of_range() {
            let mut exp = two_device_experiment();
            exp.high("pb0", "aom", 0., 100.).unwrap();
            assert!(matches!(
                exp.device_compile("pb0", true, 10),
                Err(PbError::BranchOutOfRange { .. })
            ));
            assert!(!exp.is_compiled());
        }
    }

    mod caches {
        use super::*;

        #[test]
        fn edit_and_compile_state() {
            let mut exp = two_device_experiment();
            assert!(!exp.is_edited());
            exp.high("pb0", "aom", 0., 100.).unwrap();
            assert!(exp.is_edited());
            exp.compile(true, 0).unwrap();
            assert!(exp.is_compiled());
            assert!(exp.is_fresh_compiled());

            exp.high("pb0", "aom", 200., 100.).unwrap();
            assert!(!exp.is_fresh_compiled());
            exp.compile(true, 0).unwrap();
            assert!(exp.is_fresh_compiled());

            exp.device_clear_compile_cache("pb1").unwrap();
            assert!(!exp.is_fresh_compiled());
            assert!(exp.is_compiled());

            exp.clear_edit_cache();
            assert!(!exp.is_edited());
            assert!(!exp.is_compiled());
            assert_eq!(exp.total_run_time(), 0);
        }

        #[test]
        fn device_clear_edit_cache() {
            let mut exp = two_device_experiment();
            exp.high("pb0", "aom", 0., 100.).unwrap();
            exp.high("pb1", "camera", 0., 100.).unwrap();
            exp.device_clear_edit_cache("pb0").unwrap();
            assert!(!exp.dev("pb0").unwrap().is_edited());
            assert!(exp.dev("pb1").unwrap().is_edited());
            assert_eq!(exp.last_pulse_end(), 100);
        }
    }

    mod generated_channels {
        use super::*;

        #[test]
        fn sync_out_and_pwm() {
            let mut exp = two_device_experiment();
            exp.add_channel("pb0", "sync", 2).unwrap();
            exp.high("pb0", "aom", 0., 150.).unwrap();
            exp.add_sync_out("pb0", "sync", 10.).unwrap();
            exp.pwm("pb1", &["camera"], 1e5, 10.).unwrap();
            exp.compile(true, 0).unwrap();
            // 150 ns rounded up to two 100 ns periods
            assert_eq!(exp.device_total_run_time("pb0").unwrap(), 200);
            assert_eq!(exp.device_total_run_time("pb1").unwrap(), 10_000);
            let lines = exp.device_plot_lines("pb0").unwrap();
            assert_eq!(lines.keys().collect::<Vec<_>>(), vec!["aom", "sync"]);
        }
    }
}
