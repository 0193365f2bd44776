use crate::config::ProcessSpec;
use crate::error::{OverseerError, Result};
use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS; also the process group ID
    pub pid: u32,

    pub name: String,
}

/// Resolve the program to execute.
///
/// Bare names (`npm`) are left for PATH lookup; relative paths are taken
/// relative to the working directory.
fn resolve_program(spec: &ProcessSpec) -> Result<PathBuf> {
    let script = &spec.script;
    if script.components().count() == 1 && !script.is_absolute() {
        return Ok(script.clone());
    }

    let program = if script.is_absolute() {
        script.clone()
    } else {
        spec.cwd.join(script)
    };

    if !program.exists() {
        return Err(OverseerError::Launch(
            spec.name.clone(),
            format!("script does not exist: {}", program.display()),
        ));
    }
    Ok(program)
}

/// Spawn one OS process for `spec`.
///
/// The child inherits the supervisor's environment overlaid with `env`, runs in
/// `spec.cwd`, gets its own process group, and has stdout/stderr piped for the
/// log router.
pub fn spawn_process(spec: &ProcessSpec, env: &BTreeMap<String, String>) -> Result<SpawnedProcess> {
    if !spec.cwd.is_dir() {
        return Err(OverseerError::Launch(
            spec.name.clone(),
            format!("working directory does not exist: {}", spec.cwd.display()),
        ));
    }

    let program = resolve_program(spec)?;

    let mut command = std::process::Command::new(&program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Stop signals go to the whole group, so wrappers like `npm` take their children along
        .process_group(0);

    let child = Command::from(command)
        .spawn()
        .map_err(|e| OverseerError::Launch(spec.name.clone(), e.to_string()))?;

    let pid = child.id().ok_or_else(|| {
        OverseerError::Launch(spec.name.clone(), "process exited before reporting a PID".to_string())
    })?;

    Ok(SpawnedProcess {
        child,
        pid,
        name: spec.name.clone(),
    })
}
