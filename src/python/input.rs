//! Redirects `input()` and `getpass.getpass()` to the frontend.
//!
//! `InputRedirection` swaps both entry points for `InputHook` objects for the
//! lifetime of one execution and puts the originals back when dropped.

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};
use std::sync::Arc;

use crate::kernel::error::{KernelError, Result};
use crate::kernel::input::InputChannel;

/// Whether the current request may read from the frontend
pub enum StdinPolicy {
    Allowed(Arc<dyn InputChannel>),
    Disabled,
}

/// Callable installed in place of `input` / `getpass`
#[pyclass(module = "pykernel", frozen)]
pub struct InputHook {
    channel: Option<Arc<dyn InputChannel>>,
    password: bool,
}

#[pymethods]
impl InputHook {
    /// `input([prompt])` or `getpass(prompt, stream)`. An explicit prompt is
    /// passed through `str()`, so `input(None)` shows `None`; `stream` is
    /// accepted and ignored.
    #[pyo3(signature = (*args, **kwargs))]
    fn __call__(
        &self,
        py: Python<'_>,
        args: &Bound<'_, PyTuple>,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<String> {
        let Some(channel) = self.channel.clone() else {
            return Err(PyRuntimeError::new_err(
                KernelError::StdinNotAllowed.to_string(),
            ));
        };

        let prompt = if !args.is_empty() {
            Some(args.get_item(0)?)
        } else if let Some(kwargs) = kwargs {
            kwargs.get_item("prompt")?
        } else {
            None
        };
        let prompt = match prompt {
            Some(prompt) => prompt.str()?.extract::<String>()?,
            None => String::new(),
        };
        let password = self.password;

        py.detach(move || channel.request_input(&prompt, password))
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }

    fn __repr__(&self) -> String {
        let target = if self.password { "getpass" } else { "input" };
        match self.channel {
            Some(_) => format!("<kernel {target}>"),
            None => format!("<kernel {target} (disabled)>"),
        }
    }
}

/// Scoped override of the interpreter's input entry points
pub struct InputRedirection {
    saved_input: Py<PyAny>,
    saved_getpass: Py<PyAny>,
}

impl InputRedirection {
    /// Install the hooks; fails if hooks from another redirection are still in place
    pub fn install(py: Python<'_>, policy: StdinPolicy) -> Result<Self> {
        let builtins = py.import("builtins")?;
        let getpass = py.import("getpass")?;

        let saved_input = builtins.getattr("input")?;
        let saved_getpass = getpass.getattr("getpass")?;
        if saved_input.is_instance_of::<InputHook>() || saved_getpass.is_instance_of::<InputHook>() {
            return Err(KernelError::AlreadyRedirected);
        }

        let channel = match policy {
            StdinPolicy::Allowed(channel) => Some(channel),
            StdinPolicy::Disabled => None,
        };
        let enabled = channel.is_some();
        let input_hook = Py::new(
            py,
            InputHook {
                channel: channel.clone(),
                password: false,
            },
        )?;
        let getpass_hook = Py::new(
            py,
            InputHook {
                channel,
                password: true,
            },
        )?;

        builtins.setattr("input", input_hook)?;
        if let Err(e) = getpass.setattr("getpass", getpass_hook) {
            builtins.setattr("input", &saved_input)?;
            return Err(e.into());
        }

        tracing::debug!(enabled, "input redirection installed");
        Ok(Self {
            saved_input: saved_input.unbind(),
            saved_getpass: saved_getpass.unbind(),
        })
    }

    fn restore(&self, py: Python<'_>) -> PyResult<()> {
        py.import("builtins")?
            .setattr("input", self.saved_input.bind(py))?;
        py.import("getpass")?
            .setattr("getpass", self.saved_getpass.bind(py))?;
        Ok(())
    }
}

impl Drop for InputRedirection {
    fn drop(&mut self) {
        Python::attach(|py| {
            if let Err(e) = self.restore(py) {
                tracing::error!(error = %e, "failed to restore input functions");
            }
        });
    }
}
