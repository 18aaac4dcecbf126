//! Python bindings for the Z80 call-graph analyser

use pyo3::prelude::*;
use pyo3::types::PyDict;
use pyo3::exceptions::{PyValueError, PyIOError};
use crate::{
    analysis::{analyze as run_analysis, AnalysisConfig},
    decoder::Z80Decoder,
    format::OutputFormat,
    image::{detect_loader, RawLoader, ImageLoader},
    strategy::Strategy,
    Address,
};

/// Analyse a Z80 image and render the result.
///
/// With `base` given the bytes are loaded raw at that address; otherwise an AMSDOS
/// header is honoured if present. `seeds` defaults to the entry point or the base.
#[pyfunction]
#[pyo3(signature = (
    data,
    base=None,
    seeds=None,
    strategy="recursive",
    output_format="json"
))]
fn analyze(
    data: Vec<u8>,
    base: Option<Address>,
    seeds: Option<Vec<Address>>,
    strategy: &str,
    output_format: &str,
) -> PyResult<String> {
    let loaded = match base {
        Some(base) => RawLoader::new(base).load(&data),
        None => detect_loader(&data, 0).load(&data),
    }
    .map_err(|e| PyValueError::new_err(format!("Failed to load image: {}", e)))?;

    let strategy = match strategy.to_lowercase().as_str() {
        "recursive" => Strategy::Recursive,
        "linear" => Strategy::Linear,
        _ => return Err(PyValueError::new_err(format!("Unknown strategy: {}", strategy))),
    };

    let output_format: OutputFormat = output_format
        .parse()
        .map_err(|e: String| PyValueError::new_err(e))?;

    let config = AnalysisConfig {
        seeds: seeds.unwrap_or_else(|| loaded.entry_point.into_iter().collect()),
        strategy,
        ..AnalysisConfig::default()
    };

    let analysis = run_analysis(&loaded.image, &Z80Decoder::new(), &config)
        .map_err(|e| PyValueError::new_err(format!("Analysis failed: {}", e)))?;

    output_format
        .get_formatter()
        .format(&analysis, &loaded.image)
        .map_err(|e| PyValueError::new_err(format!("Failed to format output: {}", e)))
}

/// Analyse a file on disk
#[pyfunction]
#[pyo3(signature = (
    file_path,
    base=None,
    seeds=None,
    strategy="recursive",
    output_format="json"
))]
fn analyze_file(
    file_path: &str,
    base: Option<Address>,
    seeds: Option<Vec<Address>>,
    strategy: &str,
    output_format: &str,
) -> PyResult<String> {
    let bytes = std::fs::read(file_path)
        .map_err(|e| PyIOError::new_err(format!("Failed to read file {}: {}", file_path, e)))?;

    analyze(bytes, base, seeds, strategy, output_format)
}

/// Python module initialization
#[pymodule]
fn z80_callgraph(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(analyze, m)?)?;
    m.add_function(wrap_pyfunction!(analyze_file, m)?)?;

    let py = m.py();
    let output_format = PyDict::new(py);
    for format in OutputFormat::available_formats() {
        output_format.set_item(format.to_string().to_uppercase(), format.to_string())?;
    }
    m.setattr("OutputFormat", output_format)?;

    let strategy = PyDict::new(py);
    strategy.set_item("RECURSIVE", "recursive")?;
    strategy.set_item("LINEAR", "linear")?;
    m.setattr("Strategy", strategy)?;

    Ok(())
}
