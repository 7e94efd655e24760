//! Script type classification

use std::path::Path;

use gpulet_core::ScriptType;

/// Classify a script from its path and first line.
///
/// A recognized extension decides immediately; otherwise the shebang line is
/// consulted, and anything left over is treated as a shell script. Pure
/// function, no I/O.
pub fn classify(path: &Path, first_line: &str) -> ScriptType {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        match ext {
            "py" | "python" => return ScriptType::Python,
            "sh" | "bash" | "zsh" => return ScriptType::Shell,
            _ => {}
        }
    }

    let line = first_line.trim();
    if line.starts_with("#!") {
        if line.contains("python") {
            return ScriptType::Python;
        }
        // "sh" also matches bash and zsh interpreters
        if line.contains("sh") {
            return ScriptType::Shell;
        }
    }

    ScriptType::Shell
}
