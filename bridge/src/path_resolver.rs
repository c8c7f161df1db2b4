//! Locates the Codex executable and decides how to invoke it.
//!
//! npm installs `codex` as a symlink to a JavaScript entry point. Executing
//! that link directly depends on a shebang and a `node` on `PATH`, so when the
//! link resolves to a script we run it through the interpreter explicitly.

use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;

const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs", "cjs"];
const DEFAULT_INTERPRETER: &str = "node";

/// The concrete program plus any arguments that must precede the Codex
/// arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: OsString,
    pub prefix_args: Vec<OsString>,
    /// Path after following the symlink, for diagnostics.
    pub resolved_path: PathBuf,
}

impl ResolvedCommand {
    fn direct(configured: &str) -> Self {
        Self {
            program: OsString::from(configured),
            prefix_args: Vec::new(),
            resolved_path: PathBuf::from(configured),
        }
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(
            self.prefix_args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Resolves `configured` into something spawnable. Never fails: anything
/// that cannot be resolved is executed as given and the OS search applies.
pub fn resolve_command(configured: &str, interpreter: Option<&Path>) -> ResolvedCommand {
    match try_resolve(configured, interpreter) {
        Some(resolved) => resolved,
        None => {
            debug!("could not resolve {configured}, trying direct execution");
            ResolvedCommand::direct(configured)
        }
    }
}

fn try_resolve(configured: &str, interpreter: Option<&Path>) -> Option<ResolvedCommand> {
    let configured_path = Path::new(configured);
    let mut target = configured_path.to_path_buf();

    if let Ok(metadata) = std::fs::symlink_metadata(configured_path)
        && metadata.file_type().is_symlink()
    {
        let link_target = std::fs::read_link(configured_path).ok()?;
        target = if link_target.is_absolute() {
            link_target
        } else {
            let link_dir = configured_path.parent().unwrap_or_else(|| Path::new(""));
            link_dir.join(link_target)
        };
    }

    if !is_script(&target) {
        debug!("direct execution: {}", target.display());
        return Some(ResolvedCommand {
            program: target.clone().into_os_string(),
            prefix_args: Vec::new(),
            resolved_path: target,
        });
    }

    if !target.is_file() {
        debug!("resolved script not found: {}", target.display());
        return None;
    }

    let program = match interpreter {
        Some(path) => path.as_os_str().to_os_string(),
        None => which::which(DEFAULT_INTERPRETER)
            .map(PathBuf::into_os_string)
            .unwrap_or_else(|_| OsString::from(DEFAULT_INTERPRETER)),
    };
    debug!(
        interpreter = %program.to_string_lossy(),
        script = %target.display(),
        "executing codex script through interpreter"
    );
    Some(ResolvedCommand {
        program,
        prefix_args: vec![target.clone().into_os_string()],
        resolved_path: target,
    })
}

fn is_script(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn bare_command_falls_through_to_path_search() {
        let resolved = resolve_command("codex", None);
        assert_eq!(resolved.program, OsString::from("codex"));
        assert!(resolved.prefix_args.is_empty());
    }

    #[test]
    fn missing_script_degrades_to_direct_execution() {
        let resolved = resolve_command("/definitely/not/here/codex.js", None);
        assert_eq!(
            resolved,
            ResolvedCommand::direct("/definitely/not/here/codex.js")
        );
    }

    #[cfg(unix)]
    #[test]
    fn relative_symlink_to_script_runs_via_interpreter() {
        let dir = TempDir::new().expect("tempdir");
        let lib_dir = dir.path().join("lib");
        std::fs::create_dir_all(&lib_dir).expect("mkdir");
        std::fs::write(lib_dir.join("codex.js"), "console.log('hi')").expect("write");
        let bin_dir = dir.path().join("bin");
        std::fs::create_dir_all(&bin_dir).expect("mkdir");
        let link = bin_dir.join("codex");
        std::os::unix::fs::symlink("../lib/codex.js", &link).expect("symlink");

        let interpreter = PathBuf::from("/usr/local/bin/node-test");
        let resolved = resolve_command(&link.to_string_lossy(), Some(&interpreter));

        assert_eq!(resolved.program, interpreter.into_os_string());
        let expected_script = bin_dir.join("../lib/codex.js");
        assert_eq!(
            resolved.prefix_args,
            vec![expected_script.clone().into_os_string()]
        );
        assert_eq!(resolved.resolved_path, expected_script);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_to_binary_executes_target() {
        let dir = TempDir::new().expect("tempdir");
        let real = dir.path().join("codex-real");
        std::fs::write(&real, "#!/bin/sh\n").expect("write");
        let link = dir.path().join("codex");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");

        let resolved = resolve_command(&link.to_string_lossy(), None);
        assert_eq!(resolved.program, real.clone().into_os_string());
        assert!(resolved.prefix_args.is_empty());
    }
}
