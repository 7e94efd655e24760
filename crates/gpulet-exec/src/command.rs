//! Child command construction

use std::path::Path;
use std::process::Stdio;

use gpulet_core::{ExecConfig, ScriptType};
use tokio::process::Command;

/// Build the interpreter invocation for a script bound to the given devices.
///
/// Device restriction is advisory: the child sees its reservation through
/// `CUDA_VISIBLE_DEVICES` and is trusted to honor it.
pub fn build_command(
    script_path: &Path,
    script_type: ScriptType,
    devices: &[u32],
    config: &ExecConfig,
) -> Command {
    let interpreter = match script_type {
        ScriptType::Python => &config.python_path,
        ScriptType::Shell | ScriptType::Unknown => &config.shell_path,
    };

    let mut cmd = Command::new(interpreter);
    cmd.arg(script_path);

    if !devices.is_empty() {
        let gpu_ids: String = devices
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        cmd.env("CUDA_VISIBLE_DEVICES", &gpu_ids);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    // the child leads its own process group so the whole tree can be signalled
    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}
