//! External C++ compiler driver invocation.
//!
//! All process spawns go through one lock: the driver touches the
//! filesystem and process environment, and the compile step must be
//! serialized while the rest of the pipeline is serial anyway.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Mutex;

use crate::config::Configuration;
use crate::error::{HError, HResult};
use crate::rt_debug;

static DRIVER_LOCK: Mutex<()> = Mutex::new(());

/// Run the configured driver with the given arguments; returns the captured
/// output on success and a diagnostic message on spawn failure or non-zero
/// exit.
fn run(config: &Configuration, args: &[OsString], what: &str) -> Result<Output, String> {
    let _guard = DRIVER_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    rt_debug!(
        "jit",
        "executing job for {}: {} {}",
        what,
        config.cxx.display(),
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let output = Command::new(&config.cxx)
        .args(args)
        .output()
        .map_err(|e| format!("failed to run {}: {}", config.cxx.display(), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} failed: {}", what, stderr.trim()));
    }

    Ok(output)
}

/// Compile one C++ translation unit to a relocatable object.
pub(crate) fn compile_object(config: &Configuration, input: &Path, output: &Path) -> HResult<()> {
    let mut args: Vec<OsString> = config.cxx_flags().into_iter().map(Into::into).collect();

    for include in &config.cxx_include_paths {
        args.push("-I".into());
        args.push(include.clone().into());
    }

    if let Some(dir) = &config.cxx_resource_dir {
        args.push("-resource-dir".into());
        args.push(dir.clone().into());
    }

    // Position-independent code so the unit can live in a shared library.
    args.push("-fPIC".into());
    args.push("-c".into());
    args.push(input.as_os_str().to_os_string());
    args.push("-o".into());
    args.push(output.as_os_str().to_os_string());

    run(config, &args, "compilation")
        .map(|_| ())
        .map_err(HError::compile_failed)
}

/// Merge relocatable objects into one with a relocatable link.
pub(crate) fn link_relocatable(
    config: &Configuration,
    inputs: &[PathBuf],
    output: &Path,
) -> HResult<()> {
    let mut args: Vec<OsString> = vec!["-r".into(), "-nostdlib".into()];
    for input in inputs {
        args.push(input.clone().into());
    }
    args.push("-o".into());
    args.push(output.as_os_str().to_os_string());

    run(config, &args, "relocatable link")
        .map(|_| ())
        .map_err(HError::link_failed)
}

/// Link the final object into a shared library. Unresolved references are
/// left for the dynamic loader to satisfy against the host process.
pub(crate) fn link_shared(config: &Configuration, object: &Path, output: &Path) -> HResult<()> {
    let mut args: Vec<OsString> = vec!["-shared".into()];

    #[cfg(target_os = "macos")]
    {
        args.push("-Wl,-undefined".into());
        args.push("-Wl,dynamic_lookup".into());
    }

    args.push(object.as_os_str().to_os_string());
    args.push("-o".into());
    args.push(output.as_os_str().to_os_string());

    run(config, &args, "shared library link")
        .map(|_| ())
        .map_err(HError::driver_failed)
}

/// Version banner of the configured driver.
pub(crate) fn compiler_version(config: &Configuration) -> HResult<String> {
    let output = run(config, &["--version".into()], "version query")
        .map_err(HError::driver_failed)?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().to_string())
}

/// Whether the configured driver can be invoked at all.
pub(crate) fn compiler_available(config: &Configuration) -> bool {
    compiler_version(config).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_driver_reports_spawn_failure() {
        let config = Configuration {
            cxx: "/nonexistent/cxx-driver".into(),
            ..Default::default()
        };
        let err = compile_object(&config, Path::new("a.cc"), Path::new("a.o"))
            .expect_err("driver missing");
        assert!(err.description().contains("failed to run"));
        assert!(!compiler_available(&config));
    }

    #[test]
    fn test_compile_args_include_flag_set() {
        // The argument list derives from the configured flag sets.
        let config = Configuration {
            debug: true,
            ..Default::default()
        };
        assert!(config.cxx_flags().contains(&"-g".to_string()));
    }
}
