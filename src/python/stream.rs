//! `sys.stdout` / `sys.stderr` replacements publishing on iopub.

use pyo3::prelude::*;
use std::sync::Arc;

use crate::kernel::error::Result;
use crate::kernel::interpreter::Publisher;

/// File-like object forwarding writes as `stream` messages
#[pyclass(module = "pykernel", frozen)]
pub struct KernelStream {
    name: &'static str,
    publisher: Arc<dyn Publisher>,
}

impl KernelStream {
    pub fn new(name: &'static str, publisher: Arc<dyn Publisher>) -> Self {
        Self { name, publisher }
    }
}

#[pymethods]
impl KernelStream {
    fn write(&self, text: String) -> usize {
        if !text.is_empty() {
            self.publisher.publish(
                "stream",
                serde_json::json!({ "name": self.name, "text": text }),
            );
        }
        text.chars().count()
    }

    fn writelines(&self, lines: Vec<String>) {
        self.write(lines.concat());
    }

    fn flush(&self) {}

    fn isatty(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        true
    }

    fn readable(&self) -> bool {
        false
    }

    #[getter]
    fn encoding(&self) -> &'static str {
        "utf-8"
    }

    #[getter]
    fn name(&self) -> String {
        format!("<{}>", self.name)
    }
}

/// Scoped replacement of `sys.stdout` and `sys.stderr`
pub struct OutputRedirection {
    saved_stdout: Py<PyAny>,
    saved_stderr: Py<PyAny>,
}

impl OutputRedirection {
    pub fn install(py: Python<'_>, publisher: Arc<dyn Publisher>) -> Result<Self> {
        let sys = py.import("sys")?;
        let saved_stdout = sys.getattr("stdout")?.unbind();
        let saved_stderr = sys.getattr("stderr")?.unbind();

        sys.setattr("stdout", Py::new(py, KernelStream::new("stdout", publisher.clone()))?)?;
        sys.setattr("stderr", Py::new(py, KernelStream::new("stderr", publisher))?)?;

        Ok(Self {
            saved_stdout,
            saved_stderr,
        })
    }
}

impl Drop for OutputRedirection {
    fn drop(&mut self) {
        Python::attach(|py| {
            let restored = py.import("sys").and_then(|sys| {
                sys.setattr("stdout", self.saved_stdout.bind(py))?;
                sys.setattr("stderr", self.saved_stderr.bind(py))
            });
            if let Err(e) = restored {
                tracing::error!(error = %e, "failed to restore sys streams");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::python::test_support::{RecordingPublisher, python_lock};
    use std::ffi::CString;

    #[test]
    fn print_is_published_and_streams_restored() {
        let _lock = python_lock();
        let publisher = RecordingPublisher::new();
        Python::attach(|py| {
            let sys = py.import("sys").unwrap();
            let stdout = sys.getattr("stdout").unwrap();

            let guard = OutputRedirection::install(py, publisher.clone()).unwrap();
            let code = CString::new("import sys\nprint('hello')\nsys.stderr.write('oops')").unwrap();
            py.run(code.as_c_str(), None, None).unwrap();
            drop(guard);

            assert_eq!(sys.getattr("stdout").unwrap().as_ptr(), stdout.as_ptr());
        });

        assert_eq!(publisher.stream_text("stdout"), "hello\n");
        assert_eq!(publisher.stream_text("stderr"), "oops");
    }
}
