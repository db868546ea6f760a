//! Python bindings of [`Experiment`], compiled with the `python` feature.
//!
//! PyO3 does not export trait methods, so every [`BaseExperiment`] method gets a thin
//! `#[pymethods]` wrapper here. Compiler errors are raised as `ValueError`, and log records
//! are forwarded to python's `logging` module.
//!
//! ```python
//! from pbcompiler_backend import Experiment
//!
//! exp = Experiment()
//! exp.add_pb_device("pb0", 500e6, 21)
//! exp.add_channel("pb0", "aom", 0)
//! exp.high("pb0", "aom", 6., 10.)
//! exp.compile(continuous=True)
//! print(exp.device_print_insts("pb0"))
//! ```

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::device::BaseDevice;
use crate::diagnostics::replay_flags;
use crate::error::{PbError, Result};
use crate::experiment::*;
use crate::instruction::Flags;
use crate::loader::PbDriver;

impl From<PbError> for PyErr {
    fn from(err: PbError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

/// A python object with the methods of [`PbDriver`], e.g. a thin wrapper of the vendor's
/// `spinapi` module.
struct PyPbDriver<'py> {
    py: Python<'py>,
    driver: &'py PyAny,
}
impl PyPbDriver<'_> {
    fn call(&self, method: &str, args: impl IntoPy<Py<pyo3::types::PyTuple>>) -> Result<()> {
        self.driver
            .call_method1(method, args)
            .map(|_| ())
            .map_err(|err| PbError::Driver(format!("{method}: {}", err.value(self.py))))
    }
}
impl PbDriver for PyPbDriver<'_> {
    fn init(&mut self) -> Result<()> {
        self.call("init", ())
    }
    fn close(&mut self) -> Result<()> {
        self.call("close", ())
    }
    fn start_programming(&mut self) -> Result<()> {
        self.call("start_programming", ())
    }
    fn write_inst(&mut self, flags: Flags, opcode: u32, data: u32, length_ns: f64) -> Result<()> {
        self.call("write_inst", (flags, opcode, data, length_ns))
    }
    fn stop_programming(&mut self) -> Result<()> {
        self.call("stop_programming", ())
    }
    fn start(&mut self) -> Result<()> {
        self.call("start", ())
    }
    fn stop(&mut self) -> Result<()> {
        self.call("stop", ())
    }
}

#[pymethods]
impl Experiment {
    #[new]
    fn py_new() -> Self {
        Experiment::new()
    }

    fn add_pb_device(&mut self, name: &str, clock_frequency_hz: f64, short_pulse_bit_num: u32) -> PyResult<()> {
        Ok(BaseExperiment::add_pb_device(self, name, clock_frequency_hz, short_pulse_bit_num)?)
    }

    fn add_channel(&mut self, dev_name: &str, chan_name: &str, number: u32) -> PyResult<()> {
        Ok(BaseExperiment::add_channel(self, dev_name, chan_name, number)?)
    }

    fn high(&mut self, dev_name: &str, chan_name: &str, t_ns: f64, duration_ns: f64) -> PyResult<()> {
        Ok(BaseExperiment::high(self, dev_name, chan_name, t_ns, duration_ns)?)
    }

    fn pulse_train(
        &mut self,
        dev_name: &str,
        chan_name: &str,
        start_times_ns: Vec<f64>,
        pulse_lengths_ns: Vec<f64>,
    ) -> PyResult<()> {
        Ok(BaseExperiment::pulse_train(
            self,
            dev_name,
            chan_name,
            &start_times_ns,
            &pulse_lengths_ns,
        )?)
    }

    fn set_all_off_padding(&mut self, dev_name: &str, padding_ns: f64) -> PyResult<()> {
        Ok(BaseExperiment::set_all_off_padding(self, dev_name, padding_ns)?)
    }

    fn add_sync_out(&mut self, dev_name: &str, chan_name: &str, sync_out_mhz: f64) -> PyResult<()> {
        Ok(BaseExperiment::add_sync_out(self, dev_name, chan_name, sync_out_mhz)?)
    }

    fn pwm(
        &mut self,
        dev_name: &str,
        chan_names: Vec<&str>,
        frequency_hz: f64,
        duty_cycle_percent: f64,
    ) -> PyResult<()> {
        Ok(BaseExperiment::pwm(
            self,
            dev_name,
            &chan_names,
            frequency_hz,
            duty_cycle_percent,
        )?)
    }

    #[pyo3(signature = (continuous=true, branch_to=0))]
    fn compile(&mut self, continuous: bool, branch_to: usize) -> PyResult<u64> {
        Ok(BaseExperiment::compile(self, continuous, branch_to)?)
    }

    #[pyo3(signature = (dev_name, continuous=true, branch_to=0))]
    fn device_compile(&mut self, dev_name: &str, continuous: bool, branch_to: usize) -> PyResult<u64> {
        Ok(BaseExperiment::device_compile(self, dev_name, continuous, branch_to)?)
    }

    fn total_run_time(&self) -> u64 {
        BaseExperiment::total_run_time(self)
    }

    fn last_pulse_end(&self) -> u64 {
        BaseExperiment::last_pulse_end(self)
    }

    /// Compiled program as `(flags, opcode, data, length_ns)` tuples.
    fn device_pb_insts(&self, dev_name: &str) -> PyResult<Vec<(Flags, u32, u32, u64)>> {
        let pb_insts = BaseExperiment::device_pb_insts(self, dev_name)?;
        Ok(pb_insts.iter().map(|inst| inst.to_tuple()).collect())
    }

    /// `{channel_name: (times_ns, levels)}`
    fn device_plot_lines(&self, dev_name: &str, py: Python<'_>) -> PyResult<PyObject> {
        let dict = PyDict::new(py);
        for (name, line) in BaseExperiment::device_plot_lines(self, dev_name)? {
            dict.set_item(name, line)?;
        }
        Ok(dict.to_object(py))
    }

    /// `{channel_number: channel_name}`
    fn device_channels_lookup(&self, dev_name: &str, py: Python<'_>) -> PyResult<PyObject> {
        let dict = PyDict::new(py);
        for (number, name) in BaseExperiment::device_channels_lookup(self, dev_name)? {
            dict.set_item(number, name)?;
        }
        Ok(dict.to_object(py))
    }

    /// Output flags sampled every `tick_ns` as a numpy array.
    fn device_replay_flags(&self, dev_name: &str, tick_ns: u64, py: Python<'_>) -> PyResult<PyObject> {
        if tick_ns == 0 {
            return Err(PbError::InvalidParameter {
                name: "tick_ns",
                value: 0.,
            }
            .into());
        }
        let pb_insts = self.dev(dev_name)?.pb_insts()?;
        let arr = replay_flags(pb_insts, tick_ns);
        Ok(numpy::PyArray::from_array(py, &arr).to_object(py))
    }

    fn device_print_insts(&self, dev_name: &str) -> PyResult<String> {
        Ok(BaseExperiment::device_print_insts(self, dev_name)?)
    }

    fn device_total_run_time(&self, dev_name: &str) -> PyResult<u64> {
        Ok(BaseExperiment::device_total_run_time(self, dev_name)?)
    }

    /// Loads the compiled program of `dev_name` through `driver`, a python object providing
    /// `init`, `close`, `start_programming`, `write_inst(flags, opcode, data, length_ns)`,
    /// `stop_programming`, `start` and `stop`.
    #[pyo3(signature = (dev_name, driver, start=true))]
    fn device_write_pulse_program(&self, dev_name: &str, driver: &PyAny, start: bool, py: Python<'_>) -> PyResult<()> {
        let mut driver = PyPbDriver { py, driver };
        Ok(BaseExperiment::device_write_pulse_program(
            self,
            dev_name,
            &mut driver,
            start,
        )?)
    }

    fn is_edited(&self) -> bool {
        BaseExperiment::is_edited(self)
    }

    fn is_compiled(&self) -> bool {
        BaseExperiment::is_compiled(self)
    }

    fn is_fresh_compiled(&self) -> bool {
        BaseExperiment::is_fresh_compiled(self)
    }

    fn clear_edit_cache(&mut self) {
        BaseExperiment::clear_edit_cache(self)
    }

    fn clear_compile_cache(&mut self) {
        BaseExperiment::clear_compile_cache(self)
    }

    fn device_clear_edit_cache(&mut self, dev_name: &str) -> PyResult<()> {
        Ok(BaseExperiment::device_clear_edit_cache(self, dev_name)?)
    }

    fn device_clear_compile_cache(&mut self, dev_name: &str) -> PyResult<()> {
        Ok(BaseExperiment::device_clear_compile_cache(self, dev_name)?)
    }
}

#[pymodule]
fn pbcompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    pyo3_log::init();
    m.add_class::<Experiment>()?;
    Ok(())
}
