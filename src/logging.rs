//! Log setup.
//!
//! Rust binaries get an `env_logger` formatter on stderr. With the `python`
//! feature, records are forwarded to Python's `logging` module instead, so they
//! reach whatever handlers the host application configured. Both read their
//! default level from `OPENBCI_LOG`, then `RUST_LOG`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("OPENBCI_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

#[cfg_attr(not(feature = "python"), allow(dead_code))]
fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize stderr logging for Rust binaries. Later calls are no-ops.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
pub use bridge::{init_python_logging, set_python_log_level, set_python_log_level_str};

#[cfg(feature = "python")]
mod bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Python `logging` level numbers.
    fn py_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    struct PyLogger {
        max_level: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        /// Rust target (dotted) -> Python logger object
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    impl PyLogger {
        fn new(py: Python<'_>, max_level: LevelFilter) -> PyResult<Self> {
            let logging = py.import("logging")?;
            Ok(Self {
                max_level: Mutex::new(max_level),
                logging_mod: logging.unbind(),
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn max_level(&self) -> LevelFilter {
            self.max_level
                .lock()
                .map(|l| *l)
                .unwrap_or(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = self
                .loggers
                .lock()
                .map_err(|_| pyo3::exceptions::PyRuntimeError::new_err("logger cache poisoned"))?;
            if let Some(logger) = loggers.get(target) {
                return Ok(logger.clone_ref(py));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .call_method1("getLogger", (target,))?
                .unbind();
            loggers.insert(target.to_string(), logger.clone_ref(py));
            Ok(logger)
        }

        fn emit(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let logger = self.logger_for(py, &target)?;
            let logger = logger.bind(py);
            let level = py_level(record.level());
            if !logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                return Ok(());
            }
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    level,
                    record.file().unwrap_or("<rust>"),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none, // exc_info
                    &none, // func
                    &none, // extra
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.max_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.emit(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust log records into Python's `logging`. Later calls are no-ops.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut result = Ok(());
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => result = Err(e),
        });
        result
    }

    /// Change the minimum level forwarded to Python. Drops cached loggers so
    /// reconfigured Python handlers take effect.
    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut max) = logger.max_level.lock() {
                *max = level;
            }
            if let Ok(mut loggers) = logger.loggers.lock() {
                loggers.clear();
            }
        }
        log::set_max_level(level);
        Ok(())
    }

    /// Like `set_python_log_level`, from a level name; `None` or an unknown
    /// name falls back to the environment.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        set_python_log_level(py, parse_level(level).unwrap_or_else(env_level))
    }
}
