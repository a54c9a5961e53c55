//! Program name and argv handed to the embedded interpreter.

use anyhow::{Result, anyhow};
use pyo3::prelude::*;
use pyo3::types::PyList;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const CANDIDATES: &[&str] = &["python3", "python"];

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        #[cfg(unix)]
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        #[cfg(not(unix))]
        Ok(metadata) => metadata.is_file(),
        Err(_) => false,
    }
}

/// Locate the Python executable hosting this kernel
///
/// Order: the explicit override, `PYTHONEXECUTABLE`, then the first
/// `python3`/`python` found on `PATH`.
pub fn resolve_python_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !is_executable(path) {
            return Err(anyhow!("{}: not an executable file", path.display()));
        }
        return Ok(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os("PYTHONEXECUTABLE").map(PathBuf::from)
        && is_executable(&path)
    {
        return Ok(path);
    }

    // PATH is not set - use a simple default
    let path_var = std::env::var_os("PATH")
        .unwrap_or_else(|| OsString::from("/usr/local/bin:/usr/bin:/bin"));
    for program in CANDIDATES {
        for dir in std::env::split_paths(&path_var) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            let candidate = dir.join(program);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(anyhow!("python: command not found"))
}

/// Resolve the executable and report it as `sys.executable`
///
/// Returns the resolved path for components that need to launch it again.
pub fn set_program_name_python(py: Python<'_>, explicit: Option<&Path>) -> Result<PathBuf> {
    let executable = resolve_python_path(explicit)?;
    py.import("sys")?
        .setattr("executable", executable.as_os_str())?;
    tracing::debug!(executable = %executable.display(), "python program name set");
    Ok(executable)
}

/// Expose the host argv as `sys.argv`; `sys.path` is left untouched
///
/// Arguments are decoded with the filesystem encoding, undecodable bytes
/// become surrogate escapes.
pub fn set_python_argv<I>(py: Python<'_>, args: I) -> PyResult<()>
where
    I: IntoIterator<Item = OsString>,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let argv = PyList::new(py, args)?;
    py.import("sys")?.setattr("argv", argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::python::test_support::python_lock;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn explicit_path_must_be_executable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(resolve_python_path(Some(file.path())).is_err());

        let mut perms = std::fs::metadata(file.path()).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(file.path(), perms).unwrap();
        assert_eq!(
            resolve_python_path(Some(file.path())).unwrap(),
            file.path().to_path_buf()
        );
    }

    #[test]
    fn argv_is_visible_to_python() {
        let _lock = python_lock();
        Python::attach(|py| {
            let sys = py.import("sys").unwrap();
            let saved_argv = sys.getattr("argv").unwrap();
            let saved_path: Vec<String> = sys.getattr("path").unwrap().extract().unwrap();

            set_python_argv(
                py,
                ["py-kernel", "-f", "kernel.json"].map(OsString::from),
            )
            .unwrap();
            let argv: Vec<String> = sys.getattr("argv").unwrap().extract().unwrap();
            assert_eq!(argv, vec!["py-kernel", "-f", "kernel.json"]);

            let path: Vec<String> = sys.getattr("path").unwrap().extract().unwrap();
            assert_eq!(path, saved_path);
            sys.setattr("argv", saved_argv).unwrap();
        });
    }

    #[test]
    fn program_name_becomes_sys_executable() {
        let _lock = python_lock();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"#!/bin/sh\n").unwrap();
        let mut perms = std::fs::metadata(file.path()).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(file.path(), perms).unwrap();

        Python::attach(|py| {
            let sys = py.import("sys").unwrap();
            let saved = sys.getattr("executable").unwrap();

            let resolved = set_program_name_python(py, Some(file.path())).unwrap();
            let executable: PathBuf = sys.getattr("executable").unwrap().extract().unwrap();
            assert_eq!(executable, resolved);
            sys.setattr("executable", saved).unwrap();
        });
    }
}
