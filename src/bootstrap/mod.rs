//! Process bring-up: signals, interpreter identity and the directive line.

pub mod directives;
pub mod program;
pub mod signals;

pub use directives::print_directives;
pub use program::{resolve_python_path, set_program_name_python, set_python_argv};
pub use signals::register_signal_handlers;
