//! A Jupyter-protocol kernel hosting an embedded Python interpreter.

pub mod bootstrap;
pub mod kernel;
pub mod observability;
pub mod python;
