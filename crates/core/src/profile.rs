//! Generated profile scripts
//!
//! Sidecars may ship a shell snippet (`profiled`) that must be sourced before
//! the application starts; it lands in `<profile_dir>/<name>.sh`. The resolved
//! application environment is exported from `<profile_dir>/starter.sh`.

use crate::variable::EnvMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Aggregate profile file for the main application
pub const STARTER_PROFILE: &str = "starter.sh";

/// Render `export KEY=value` lines, sorted by key, values shell-quoted
pub fn render_exports(env: &EnvMap) -> String {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|key| format!("export {}={}\n", key, shell_words::quote(&env[key])))
        .collect()
}

/// Write the profile snippet of sidecar `name`
pub fn write_sidecar_profile(profile_dir: &Path, name: &str, body: &str) -> io::Result<PathBuf> {
    let path = profile_dir.join(format!("{}.sh", name));
    write_executable(&path, body)?;
    debug!(path = %path.display(), "Wrote sidecar profile");
    Ok(path)
}

/// Write `starter.sh` exporting `env`
pub fn write_starter_profile(profile_dir: &Path, env: &EnvMap) -> io::Result<PathBuf> {
    let path = profile_dir.join(STARTER_PROFILE);
    write_executable(&path, &render_exports(env))?;
    debug!(path = %path.display(), exports = env.len(), "Wrote starter profile");
    Ok(path)
}

fn write_executable(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
