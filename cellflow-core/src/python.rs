//! Python bindings.
//!
//! Exposes a `Notebook` class. Cell bodies are Python callables invoked with
//! their declared inputs as keyword arguments and returning a dict of
//! outputs. Values cross the boundary as JSON through Python's `json` module.

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::{CellError, EngineError, GraphError};
use crate::graph::{Cell, GraphBuilder, Outputs};
use crate::reactive::{CellInputs, Engine, PassReport, RecordingSink, RenderPayload};

fn graph_err(e: GraphError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn engine_err(e: EngineError) -> PyErr {
    match e {
        EngineError::Graph(e) => graph_err(e),
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

fn to_py(py: Python<'_>, value: &Value) -> PyResult<PyObject> {
    let text = serde_json::to_string(value).map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(py.import_bound("json")?.call_method1("loads", (text,))?.unbind())
}

fn from_py(obj: &Bound<'_, PyAny>) -> PyResult<Value> {
    let text: String = obj
        .py()
        .import_bound("json")?
        .call_method1("dumps", (obj,))?
        .extract()?;
    serde_json::from_str(&text).map_err(|e| PyValueError::new_err(e.to_string()))
}

fn call_compute(func: &PyObject, inputs: &CellInputs) -> Result<Outputs, CellError> {
    Python::with_gil(|py| {
        let kwargs = PyDict::new_bound(py);
        for name in inputs.names() {
            kwargs.set_item(name, to_py(py, inputs.get(name)?).map_err(py_failure)?)
                .map_err(py_failure)?;
        }
        let result = func.bind(py).call((), Some(&kwargs)).map_err(py_failure)?;
        if result.is_none() {
            return Ok(Outputs::new());
        }
        match from_py(&result).map_err(py_failure)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(CellError::failed(format!(
                "cell must return a dict of outputs, got {other}"
            ))),
        }
    })
}

/// A render callable returning a string renders markdown, `None` renders
/// nothing and anything else renders as structured data. A raised exception
/// fails the cell.
fn call_render(func: &PyObject, outputs: &Outputs) -> Result<Vec<RenderPayload>, CellError> {
    Python::with_gil(|py| {
        let kwargs = PyDict::new_bound(py);
        for (name, value) in outputs.iter() {
            kwargs.set_item(name, to_py(py, value).map_err(py_failure)?)
                .map_err(py_failure)?;
        }
        let result = func.bind(py).call((), Some(&kwargs)).map_err(py_failure)?;
        if let Ok(markdown) = result.extract::<String>() {
            return Ok(vec![RenderPayload::Markdown(markdown)]);
        }
        match from_py(&result).map_err(py_failure)? {
            Value::Null => Ok(Vec::new()),
            data => Ok(vec![RenderPayload::Data(data)]),
        }
    })
}

fn py_failure(e: PyErr) -> CellError {
    CellError::failed(e.to_string())
}

/// Python-exposed notebook.
///
/// Cells are added first, then `finalize()` seals the graph and starts the
/// engine.
#[pyclass(name = "Notebook")]
pub struct PyNotebook {
    builder: Option<GraphBuilder>,
    engine: Option<Engine>,
    sink: RecordingSink,
    config: EngineConfig,
}

impl PyNotebook {
    fn engine(&self) -> PyResult<&Engine> {
        self.engine
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("notebook is not finalized"))
    }
}

fn pass_ids(reports: Vec<PassReport>) -> Vec<u64> {
    reports.into_iter().map(|r| r.pass).collect()
}

#[pymethods]
impl PyNotebook {
    /// Create an empty notebook. `config` is an optional JSON string.
    #[new]
    #[pyo3(signature = (config=None))]
    fn new(config: Option<&str>) -> PyResult<Self> {
        let config = match config {
            Some(text) => EngineConfig::from_json(text).map_err(engine_err)?,
            None => EngineConfig::default(),
        };
        Ok(Self {
            builder: Some(GraphBuilder::new()),
            engine: None,
            sink: RecordingSink::new(),
            config,
        })
    }

    /// Register a cell.
    #[pyo3(signature = (name, reads, writes, func, render=None))]
    fn add_cell(
        &mut self,
        name: String,
        reads: Vec<String>,
        writes: Vec<String>,
        func: PyObject,
        render: Option<PyObject>,
    ) -> PyResult<()> {
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| PyRuntimeError::new_err("notebook is already finalized"))?;

        let mut cell = Cell::new(name, reads, writes, move |inputs: &CellInputs| {
            call_compute(&func, inputs)
        });
        if let Some(render) = render {
            cell = cell.with_try_render(move |outputs: &Outputs| call_render(&render, outputs));
        }
        builder.register(cell).map_err(graph_err)?;
        Ok(())
    }

    /// Seal the graph and start the engine.
    fn finalize(&mut self) -> PyResult<()> {
        let builder = self
            .builder
            .take()
            .ok_or_else(|| PyRuntimeError::new_err("notebook is already finalized"))?;
        let engine = Engine::with_config(builder, self.sink.clone(), self.config.clone())
            .map_err(engine_err)?;
        self.engine = Some(engine);
        Ok(())
    }

    /// Evaluate every cell. Returns the ids of the passes run.
    fn run_all(&self, py: Python<'_>) -> PyResult<Vec<u64>> {
        let engine = self.engine()?;
        py.allow_threads(|| engine.run_all())
            .map(pass_ids)
            .map_err(graph_err)
    }

    /// Set a control value and recompute what depends on it.
    fn set_control(&self, py: Python<'_>, name: &str, value: &Bound<'_, PyAny>) -> PyResult<Vec<u64>> {
        let engine = self.engine()?;
        let value = from_py(value)?;
        py.allow_threads(|| engine.inject(name, value))
            .map(pass_ids)
            .map_err(graph_err)
    }

    /// Re-execute a cell and everything downstream of it.
    fn rerun(&self, py: Python<'_>, name: &str) -> PyResult<Vec<u64>> {
        let engine = self.engine()?;
        py.allow_threads(|| engine.rerun_cell(name))
            .map(pass_ids)
            .map_err(graph_err)
    }

    /// Current value of a variable.
    fn get(&self, py: Python<'_>, name: &str) -> PyResult<PyObject> {
        let engine = self.engine()?;
        let value = py.allow_threads(|| engine.value(name)).map_err(engine_err)?;
        to_py(py, &value)
    }

    /// Every render frame so far, as dicts.
    fn frames(&self, py: Python<'_>) -> PyResult<Vec<PyObject>> {
        self.sink
            .frames()
            .iter()
            .map(|frame| {
                let value = serde_json::to_value(frame).map_err(|e| PyValueError::new_err(e.to_string()))?;
                to_py(py, &value)
            })
            .collect()
    }

    fn __repr__(&self) -> String {
        match &self.engine {
            Some(engine) => format!("Notebook(cells={}, finalized=True)", engine.graph().len()),
            None => format!(
                "Notebook(cells={}, finalized=False)",
                self.builder.as_ref().map(GraphBuilder::len).unwrap_or(0)
            ),
        }
    }
}
