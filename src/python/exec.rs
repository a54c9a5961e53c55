use pyo3::exceptions::{PyOverflowError, PySyntaxError, PyValueError};
use pyo3::prelude::*;

use crate::kernel::interpreter::{Completeness, ExecuteOutcome};

/// Filename reported in tracebacks for user code
pub const CELL_FILENAME: &str = "<cell>";

/// Run a cell in `__main__`'s namespace
///
/// A cell that compiles as a single expression is evaluated and its value
/// returned (`None` values are dropped); anything else runs as statements.
pub fn run_cell<'py>(py: Python<'py>, code: &str) -> PyResult<Option<Bound<'py, PyAny>>> {
    let globals = py.import("__main__")?.dict();
    let builtins = py.import("builtins")?;
    let compile = builtins.getattr("compile")?;

    match compile.call1((code, CELL_FILENAME, "eval")) {
        Ok(expression) => {
            let value = builtins.getattr("eval")?.call1((expression, &globals))?;
            if value.is_none() {
                return Ok(None);
            }
            globals.set_item("_", &value)?;
            Ok(Some(value))
        }
        Err(err) if err.is_instance_of::<PySyntaxError>(py) => {
            let statements = compile.call1((code, CELL_FILENAME, "exec"))?;
            builtins.getattr("exec")?.call1((statements, &globals))?;
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Convert a Python exception into an error outcome with a formatted traceback
pub fn describe_error(py: Python<'_>, err: &PyErr) -> ExecuteOutcome {
    let ename = err
        .get_type(py)
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "Exception".to_string());
    let evalue = err
        .value(py)
        .str()
        .map(|value| value.to_string())
        .unwrap_or_default();

    let traceback = py
        .import("traceback")
        .and_then(|tb| {
            tb.call_method1(
                "format_exception",
                (err.get_type(py), err.value(py), err.traceback(py)),
            )
        })
        .and_then(|lines| lines.extract::<Vec<String>>())
        .unwrap_or_else(|_| vec![format!("{ename}: {evalue}")]);

    ExecuteOutcome::Error {
        ename,
        evalue,
        traceback,
    }
}

/// Classify a cell the way an interactive console would
pub fn is_complete(py: Python<'_>, code: &str) -> Completeness {
    let result = py
        .import("codeop")
        .and_then(|codeop| codeop.getattr("compile_command"))
        .and_then(|compile_cmd| compile_cmd.call1((code, CELL_FILENAME, "exec")));

    match result {
        Ok(obj) if obj.is_none() => Completeness::Incomplete, // None = needs more lines
        Ok(_) => Completeness::Complete,
        Err(e)
            if e.is_instance_of::<PySyntaxError>(py)
                || e.is_instance_of::<PyOverflowError>(py)
                || e.is_instance_of::<PyValueError>(py) =>
        {
            Completeness::Invalid
        }
        Err(_) => Completeness::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::python::test_support::python_lock;

    #[test]
    fn expressions_return_values_and_statements_do_not() {
        let _lock = python_lock();
        Python::attach(|py| {
            assert!(run_cell(py, "exec_test_value = 20 + 1").unwrap().is_none());
            let value = run_cell(py, "exec_test_value * 2").unwrap().unwrap();
            assert_eq!(value.extract::<i64>().unwrap(), 42);
            assert!(run_cell(py, "None").unwrap().is_none());
            assert!(run_cell(py, "").unwrap().is_none());
        });
    }

    #[test]
    fn expression_errors_run_only_once() {
        let _lock = python_lock();
        Python::attach(|py| {
            run_cell(py, "exec_test_calls = []").unwrap();
            let err = run_cell(py, "exec_test_calls.append(1) or 1 / 0").unwrap_err();
            assert!(err.is_instance_of::<pyo3::exceptions::PyZeroDivisionError>(py));
            let calls = run_cell(py, "len(exec_test_calls)").unwrap().unwrap();
            assert_eq!(calls.extract::<usize>().unwrap(), 1);
        });
    }

    #[test]
    fn describes_errors_with_traceback() {
        let _lock = python_lock();
        Python::attach(|py| {
            let err = run_cell(py, "raise ValueError('bad value')").unwrap_err();
            let ExecuteOutcome::Error {
                ename,
                evalue,
                traceback,
            } = describe_error(py, &err)
            else {
                panic!("expected an error outcome");
            };
            assert_eq!(ename, "ValueError");
            assert_eq!(evalue, "bad value");
            assert!(traceback.last().unwrap().contains("ValueError: bad value"));
            assert!(traceback.iter().any(|line| line.contains(CELL_FILENAME)));
        });
    }

    #[test]
    fn classifies_completeness() {
        let _lock = python_lock();
        Python::attach(|py| {
            assert_eq!(is_complete(py, "x = 1"), Completeness::Complete);
            assert_eq!(is_complete(py, "for i in range(3):"), Completeness::Incomplete);
            assert_eq!(is_complete(py, "x = = 1"), Completeness::Invalid);
        });
    }
}
