use anyhow::Result;
use clap::Parser;
use pyo3::prelude::*;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;

use py_kernel::bootstrap;
use py_kernel::kernel::config::{DEFAULT_IP, TransportLimits};
use py_kernel::kernel::transport::tcp::{self, Listeners};
use py_kernel::kernel::{Kernel, KernelConfig, get_user_name, history};
use py_kernel::python::{PythonInterpreter, make_python_debugger, pykernel};

/// Jupyter kernel hosting an embedded Python interpreter
#[derive(Parser, Debug)]
#[command(name = "py-kernel", version)]
struct Cli {
    /// Connection file written by the launching frontend
    #[arg(short = 'f', long = "connection-file", env = "PY_KERNEL_CONNECTION_FILE")]
    connection_file: Option<PathBuf>,

    /// Address to bind when no connection file is given
    #[arg(long, default_value = DEFAULT_IP)]
    ip: String,

    /// Python executable reported as sys.executable
    #[arg(long, env = "PY_KERNEL_PYTHON")]
    python: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    py_kernel::observability::init_tracing();
    let cli = Cli::parse();

    bootstrap::register_signal_handlers()?;

    // Register the pykernel module before initializing Python
    pyo3::append_to_inittab!(pykernel);
    Python::initialize();

    let executable = Python::attach(|py| -> Result<PathBuf> {
        let executable = bootstrap::set_program_name_python(py, cli.python.as_deref())?;
        bootstrap::set_python_argv(py, std::env::args_os())?;
        Ok(executable)
    })?;

    // Bound before the directive line so the advertised ports are ours
    let listeners = match &cli.connection_file {
        Some(path) => Listeners::bind(KernelConfig::from_file(path)?)?,
        None => Listeners::ephemeral(&cli.ip)?,
    };
    let config = listeners.config().clone();
    let context = tcp::serve(listeners, TransportLimits::default())?;
    let interpreter = Box::new(PythonInterpreter::new());
    let history = history::make_in_memory_history_manager();
    let debugger_config = json!({ "python": executable.to_string_lossy() });

    let kernel = Kernel::new(
        config,
        get_user_name(),
        context,
        interpreter,
        history,
        make_python_debugger,
        debugger_config,
    );

    bootstrap::print_directives(kernel.get_config(), &mut std::io::stdout().lock())?;
    let status = kernel.start();
    Ok(ExitCode::from(u8::try_from(status).unwrap_or(1)))
}
