pub mod exec;
pub mod input;
pub mod stream;

use pyo3::prelude::*;
use serde_json::{Value, json};

use crate::kernel::debugger::Debugger;
use crate::kernel::error::KernelError;
use crate::kernel::interpreter::{
    Completeness, ExecuteOutcome, ExecuteRequest, ExecutionContext, Interpreter,
};
use input::{InputRedirection, StdinPolicy};
use stream::OutputRedirection;

/// Kernel interpreter backed by the process-wide embedded Python
#[derive(Debug, Default)]
pub struct PythonInterpreter;

impl PythonInterpreter {
    pub fn new() -> Self {
        Self
    }
}

fn kernel_failure(err: KernelError) -> ExecuteOutcome {
    ExecuteOutcome::Error {
        ename: "KernelError".to_string(),
        evalue: err.to_string(),
        traceback: vec![err.to_string()],
    }
}

impl Interpreter for PythonInterpreter {
    fn configure(&mut self) -> anyhow::Result<()> {
        Python::attach(|py| {
            // Make sure the modules the shims patch are importable up front
            py.import("getpass")?;
            py.import("traceback")?;
            py.import("codeop")?;
            Ok::<(), PyErr>(())
        })?;
        Ok(())
    }

    fn execute(&mut self, request: &ExecuteRequest, ctx: &ExecutionContext) -> ExecuteOutcome {
        Python::attach(|py| {
            let _output = match OutputRedirection::install(py, ctx.publisher.clone()) {
                Ok(guard) => guard,
                Err(e) => return kernel_failure(e),
            };
            let policy = match &ctx.input {
                Some(channel) => StdinPolicy::Allowed(channel.clone()),
                None => StdinPolicy::Disabled,
            };
            let _input = match InputRedirection::install(py, policy) {
                Ok(guard) => guard,
                Err(e) => return kernel_failure(e),
            };

            match exec::run_cell(py, &request.code) {
                Ok(Some(value)) => {
                    if !request.silent {
                        match value.repr() {
                            Ok(repr) => ctx.publish_execution_result(
                                json!({ "text/plain": repr.to_string() }),
                            ),
                            Err(err) => return exec::describe_error(py, &err),
                        }
                    }
                    ExecuteOutcome::Ok
                }
                Ok(None) => ExecuteOutcome::Ok,
                Err(err) => exec::describe_error(py, &err),
            }
        })
    }

    fn is_complete(&mut self, code: &str) -> Completeness {
        Python::attach(|py| exec::is_complete(py, code))
    }

    fn kernel_info(&self) -> Value {
        let versions = Python::attach(|py| {
            let sys = py.import("sys")?;
            let banner: String = sys.getattr("version")?.extract()?;
            let info = sys.getattr("version_info")?;
            let major: u32 = info.getattr("major")?.extract()?;
            let minor: u32 = info.getattr("minor")?.extract()?;
            let micro: u32 = info.getattr("micro")?.extract()?;
            Ok::<_, PyErr>((banner, format!("{major}.{minor}.{micro}")))
        });
        let (banner, version) = versions.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cannot read python version");
            (String::new(), String::new())
        });

        json!({
            "banner": format!("py-kernel {}\nPython {}", env!("CARGO_PKG_VERSION"), banner),
            "language_info": {
                "name": "python",
                "version": version,
                "mimetype": "text/x-python",
                "file_extension": ".py",
                "pygments_lexer": "ipython3",
                "codemirror_mode": { "name": "ipython", "version": 3 },
                "nbconvert_exporter": "python",
            },
        })
    }
}

/// Debugger factory for the Python kernel
///
/// The debug adapter is not bundled; the configured executable is only
/// recorded so frontends see why `debugger` is false.
pub fn make_python_debugger(config: &Value) -> Option<Box<dyn Debugger>> {
    let python = config.get("python").and_then(Value::as_str).unwrap_or("");
    tracing::info!(python, "debugger disabled for this kernel");
    None
}

/// The `pykernel` module exposing the redirection types to Python
#[pymodule]
pub mod pykernel {
    use super::*;

    #[pymodule_init]
    fn init(m: &Bound<PyModule>) -> PyResult<()> {
        m.add_class::<input::InputHook>()?;
        m.add_class::<stream::KernelStream>()?;
        m.add("INPUT_NOT_SUPPORTED", KernelError::StdinNotAllowed.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::Value;
    use std::sync::{Arc, Mutex, MutexGuard};

    use crate::kernel::interpreter::Publisher;

    static PYTHON_LOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that patch interpreter globals
    pub fn python_lock() -> MutexGuard<'static, ()> {
        PYTHON_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[derive(Default)]
    pub struct RecordingPublisher {
        pub messages: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingPublisher {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn of_type(&self, msg_type: &str) -> Vec<Value> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == msg_type)
                .map(|(_, content)| content.clone())
                .collect()
        }

        pub fn stream_text(&self, name: &str) -> String {
            self.of_type("stream")
                .iter()
                .filter(|c| c["name"] == name)
                .filter_map(|c| c["text"].as_str().map(str::to_string))
                .collect()
        }
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, msg_type: &str, content: Value) {
            self.messages
                .lock()
                .unwrap()
                .push((msg_type.to_string(), content));
        }
    }
}
