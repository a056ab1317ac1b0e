//! Python bindings for the nullsweep engine

use std::str::FromStr;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::engine::Engine;
use crate::format::{OutputFormat, ReportFormatter};
use crate::{transform, Architecture, BadByteSet};

/// Rewrite a payload so it contains none of the given bad bytes.
#[pyfunction]
#[pyo3(signature = (payload, arch="x86", bad_bytes="00", max_passes=None))]
fn purge(
    payload: Vec<u8>,
    arch: &str,
    bad_bytes: &str,
    max_passes: Option<usize>,
) -> PyResult<Vec<u8>> {
    let arch = Architecture::from_str(arch).map_err(PyValueError::new_err)?;
    let bad = BadByteSet::parse(bad_bytes).map_err(|e| PyValueError::new_err(e.to_string()))?;

    transform(&payload, arch, &bad, max_passes).map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Rewrite a payload and return a JSON report of what was done.
#[pyfunction]
#[pyo3(signature = (payload, arch="x86", bad_bytes="00", max_passes=None))]
fn inspect(
    payload: Vec<u8>,
    arch: &str,
    bad_bytes: &str,
    max_passes: Option<usize>,
) -> PyResult<String> {
    let arch = Architecture::from_str(arch).map_err(PyValueError::new_err)?;
    let bad = BadByteSet::parse(bad_bytes).map_err(|e| PyValueError::new_err(e.to_string()))?;

    let mut engine =
        Engine::new(arch, bad).map_err(|e| PyValueError::new_err(e.to_string()))?;
    if let Some(bound) = max_passes {
        engine = engine.with_iteration_bound(bound);
    }

    let result = engine
        .run(&payload)
        .map_err(|e| PyValueError::new_err(e.to_string()))?;

    OutputFormat::Json
        .get_formatter()
        .format(&result.report)
        .map_err(|e| PyValueError::new_err(e.to_string()))
}

/// The nullsweep Python module
#[pymodule]
fn nullsweep(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(purge, m)?)?;
    m.add_function(wrap_pyfunction!(inspect, m)?)?;
    Ok(())
}
