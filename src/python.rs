//! Python bindings.
//!
//! Exposes the board driver to the Python analysis code (blink detection,
//! SSVEP classification) as the `_core` extension module.

use std::cell::RefCell;
use std::time::Duration;

use log::warn;
use pyo3::exceptions::{
    PyConnectionError, PyIOError, PyTimeoutError, PyTypeError, PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::board::{OpenBci, StreamSummary};
use crate::config::{BoardConfig, DEFAULT_BAUD};
use crate::dispatch::StreamDispatcher;
use crate::errors::DriverError;
use crate::logging;
use crate::port::PortLocator;
use crate::protocol::{TestSignal, END_BYTE, SAMPLE_RATE_HZ, START_BYTE};
use crate::sample::Sample;

impl From<DriverError> for PyErr {
    fn from(e: DriverError) -> Self {
        let msg = e.to_string();
        match e {
            DriverError::DeviceStalled => PyTimeoutError::new_err(msg),
            DriverError::PortNotFound
            | DriverError::NotConnected
            | DriverError::ReconnectFailed(_) => PyConnectionError::new_err(msg),
            DriverError::InvalidArgument(_) => PyValueError::new_err(msg),
            DriverError::Io(_) | DriverError::Serial(_) => PyIOError::new_err(msg),
        }
    }
}

fn secs(value: f64, name: &str) -> PyResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| PyValueError::new_err(format!("{name}: {e}")))
}

/// One reading from the board.
///
/// Attributes:
///     packet_id: Packet counter (0-255, wrapping). Always even with a daisy module.
///     channel_data: EEG channels in microvolts (8, or 16 with a daisy module).
///     aux_data: Accelerometer channels in g.
#[pyclass(name = "Sample", frozen)]
struct PySample {
    #[pyo3(get)]
    packet_id: u8,
    #[pyo3(get)]
    channel_data: Vec<f64>,
    #[pyo3(get)]
    aux_data: Vec<f64>,
}

#[pymethods]
impl PySample {
    fn __repr__(&self) -> String {
        format!(
            "Sample(packet_id={}, channel_data={:?}, aux_data={:?})",
            self.packet_id, self.channel_data, self.aux_data
        )
    }

    fn __len__(&self) -> usize {
        self.channel_data.len()
    }

    /// Convert to dictionary for easy serialization.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("packet_id", self.packet_id)?;
        dict.set_item("channel_data", self.channel_data.clone())?;
        dict.set_item("aux_data", self.aux_data.clone())?;
        Ok(dict)
    }
}

impl From<&Sample> for PySample {
    fn from(s: &Sample) -> Self {
        PySample {
            packet_id: s.packet_id,
            channel_data: s.channel_data.clone(),
            aux_data: s.aux_data.clone(),
        }
    }
}

fn summary_dict<'py>(py: Python<'py>, summary: &StreamSummary) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("samples_delivered", summary.samples_delivered)?;
    dict.set_item("packets_malformed", summary.packets_malformed)?;
    dict.set_item("pairing_gaps", summary.pairing_gaps)?;
    dict.set_item("bytes_skipped", summary.bytes_skipped)?;
    dict.set_item("elapsed", summary.elapsed.as_secs_f64())?;
    Ok(dict)
}

/// A single callable or an iterable of callables, as an ordered list.
fn normalize_callbacks(callback: &Bound<'_, PyAny>) -> PyResult<Vec<Py<PyAny>>> {
    if callback.is_callable() {
        return Ok(vec![callback.clone().unbind()]);
    }
    let mut callbacks = Vec::new();
    for item in callback.try_iter()? {
        let item = item?;
        if !item.is_callable() {
            return Err(PyTypeError::new_err("every callback must be callable"));
        }
        callbacks.push(item.unbind());
    }
    if callbacks.is_empty() {
        return Err(PyValueError::new_err("at least one callback is required"));
    }
    Ok(callbacks)
}

/// OpenBCI board over a serial port.
///
/// Example:
///     >>> board = OpenBCIBoard(port="/dev/ttyUSB0")
///     >>> board.start_streaming(lambda s: print(s.channel_data), lapse=10.0)
///     >>> board.disconnect()
#[pyclass(name = "OpenBCIBoard", unsendable)]
struct PyOpenBci {
    inner: OpenBci,
}

#[pymethods]
impl PyOpenBci {
    /// Open the board. The port is auto-detected when omitted.
    #[new]
    #[pyo3(signature = (
        port=None,
        baud=DEFAULT_BAUD,
        daisy=false,
        filtering=true,
        scaling=true,
        logging=false,
        read_timeout=5.0,
        watchdog=true,
        reconnect_interval=2.0,
        max_dropped_before_reconnect=10
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        port: Option<String>,
        baud: u32,
        daisy: bool,
        filtering: bool,
        scaling: bool,
        logging: bool,
        read_timeout: f64,
        watchdog: bool,
        reconnect_interval: f64,
        max_dropped_before_reconnect: u32,
    ) -> PyResult<Self> {
        let config = BoardConfig {
            port,
            baud,
            daisy,
            filtering,
            scaling,
            logging,
            read_timeout: secs(read_timeout, "read_timeout")?,
            watchdog,
            reconnect_interval: secs(reconnect_interval, "reconnect_interval")?,
            max_dropped_before_reconnect,
            ..BoardConfig::default()
        };
        Ok(PyOpenBci {
            inner: OpenBci::open(config)?,
        })
    }

    /// Stream samples to `callback` (a callable or a list of callables).
    ///
    /// Blocks until `lapse` seconds have elapsed, `stop()` is called from a
    /// callback, a callback raises, or the device stalls.
    ///
    /// Returns:
    ///     Dict with samples_delivered, packets_malformed, pairing_gaps,
    ///     bytes_skipped and elapsed.
    ///
    /// Raises:
    ///     TimeoutError: If the device stops sending data.
    #[pyo3(signature = (callback, lapse=None))]
    fn start_streaming<'py>(
        &mut self,
        py: Python<'py>,
        callback: &Bound<'py, PyAny>,
        lapse: Option<f64>,
    ) -> PyResult<Bound<'py, PyDict>> {
        let callbacks = normalize_callbacks(callback)?;
        let lapse = lapse.map(|l| secs(l, "lapse")).transpose()?;
        let failure: RefCell<Option<PyErr>> = RefCell::new(None);
        let link = self.inner.link().clone();

        let mut dispatcher = StreamDispatcher::new();
        for cb in &callbacks {
            let failure = &failure;
            let link = link.clone();
            dispatcher.push(move |sample: &Sample| {
                if failure.borrow().is_some() {
                    return;
                }
                let outcome = py
                    .check_signals()
                    .and_then(|_| cb.call1(py, (PySample::from(sample),)).map(drop));
                if let Err(e) = outcome {
                    *failure.borrow_mut() = Some(e);
                    if let Err(e) = link.stop() {
                        warn!("failed to stop stream after callback error: {}", e);
                    }
                }
            });
        }

        let result = self.inner.start_streaming(&mut dispatcher, lapse);
        drop(dispatcher);
        if let Some(e) = failure.into_inner() {
            return Err(e);
        }
        summary_dict(py, &result?)
    }

    fn stop(&self) -> PyResult<()> {
        Ok(self.inner.stop()?)
    }

    /// Stop streaming and close the port. Safe to call more than once.
    fn disconnect(&mut self) -> PyResult<()> {
        Ok(self.inner.disconnect()?)
    }

    /// Returns False if a reconnect was already in progress.
    fn reconnect(&self) -> PyResult<bool> {
        Ok(self.inner.reconnect()?)
    }

    fn enable_filters(&self) -> PyResult<()> {
        Ok(self.inner.enable_filters()?)
    }

    fn disable_filters(&self) -> PyResult<()> {
        Ok(self.inner.disable_filters()?)
    }

    /// Switch a channel (1-based) on or off.
    fn set_channel(&self, channel: u8, on: bool) -> PyResult<()> {
        Ok(self.inner.set_channel(channel, on)?)
    }

    /// Route a test signal to all inputs.
    ///
    /// Args:
    ///     signal: 0 ground, 1 Vcc, 2/3 1x slow/fast pulse, 4/5 2x slow/fast pulse.
    fn test_signal(&self, signal: u8) -> PyResult<()> {
        Ok(self.inner.test_signal(TestSignal::from_index(signal)?)?)
    }

    #[getter]
    fn sample_rate(&self) -> f64 {
        self.inner.sample_rate()
    }

    #[getter]
    fn eeg_channels(&self) -> usize {
        self.inner.eeg_channel_count()
    }

    #[getter]
    fn aux_channels(&self) -> usize {
        self.inner.aux_channel_count()
    }

    #[getter]
    fn daisy(&self) -> bool {
        self.inner.link().daisy()
    }

    #[getter]
    fn port(&self) -> Option<String> {
        self.inner.link().port_name().map(str::to_string)
    }

    #[getter]
    fn streaming(&self) -> bool {
        self.inner.link().is_streaming()
    }

    #[getter]
    fn packets_dropped(&self) -> u32 {
        self.inner.packets_dropped()
    }

    fn __repr__(&self) -> String {
        format!(
            "OpenBCIBoard(port={:?}, channels={}, rate={}Hz)",
            self.inner.link().port_name().unwrap_or("?"),
            self.inner.eeg_channel_count(),
            self.inner.sample_rate()
        )
    }
}

/// Probe every serial port and return the one an OpenBCI board answers on.
#[pyfunction]
#[pyo3(signature = (baud=DEFAULT_BAUD, timeout=1.0))]
fn find_port(baud: u32, timeout: f64) -> PyResult<String> {
    Ok(PortLocator::new(baud, secs(timeout, "timeout")?).locate()?)
}

/// Forward driver logs to Python's `logging`, optionally setting the level.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::init_python_logging(py)?;
    logging::set_python_log_level_str(py, level)
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyOpenBci>()?;
    m.add_class::<PySample>()?;
    m.add_function(wrap_pyfunction!(find_port, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    m.add("START_BYTE", START_BYTE)?;
    m.add("END_BYTE", END_BYTE)?;
    m.add("DEFAULT_BAUD", DEFAULT_BAUD)?;
    m.add("SAMPLE_RATE", SAMPLE_RATE_HZ)?;

    Ok(())
}
