//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Binary self-updater (spec §4.8): write-access probing, platform-specific
//! atomic executable replacement, post-replacement validation by spawning the
//! new binary, and rollback from a named backup. The executor never silently
//! elevates privileges; it returns a structured result instead.

use crate::error::{Result, UpdateError};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

const COMPONENT: &str = "binary_updater";

/// What the caller may do in the executable's directory right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePermissions {
    pub executable_directory_writable: bool,
    pub elevation_required: bool,
    pub running_elevated: bool,
}

/// Probe write access to `executable_dir` with a throwaway temporary file.
pub fn can_self_update(executable_dir: &Path) -> bool {
    let probe = executable_dir.join(format!(".update-write-probe-{}", std::process::id()));
    match fs::write(&probe, b"") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

pub fn get_update_permissions(executable_dir: &Path) -> UpdatePermissions {
    let writable = can_self_update(executable_dir);
    let running_elevated = is_running_elevated();
    UpdatePermissions {
        executable_directory_writable: writable,
        elevation_required: !writable,
        running_elevated,
    }
}

#[cfg(unix)]
fn is_running_elevated() -> bool {
    // SAFETY: geteuid takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_running_elevated() -> bool {
    // Best-effort: without a Windows token-query dependency, assume non-elevated.
    false
}

/// Result of a platform-specific atomic replacement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceResult {
    pub replaced: bool,
    pub cleanup_script: Option<PathBuf>,
}

/// Replace the executable at `dst` with the contents of `src`, atomically
/// where the platform allows it. Permissions are copied from `src`.
#[cfg(unix)]
pub fn replace_executable(src: &Path, dst: &Path) -> Result<ReplaceResult> {
    use std::os::unix::fs::PermissionsExt;

    let tmp = dst.with_extension("update-tmp");
    fs::copy(src, &tmp).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "replace_executable", format!("staging copy: {e}")).with_cause(e)
    })?;

    let perms = fs::metadata(src)
        .map_err(|e| UpdateError::filesystem(COMPONENT, "replace_executable", format!("reading source permissions: {e}")).with_cause(e))?
        .permissions();
    fs::set_permissions(&tmp, fs::Permissions::from_mode(perms.mode())).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "replace_executable", format!("setting permissions: {e}")).with_cause(e)
    })?;

    fs::rename(&tmp, dst).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "replace_executable", format!("renaming over destination: {e}")).with_cause(e)
    })?;

    Ok(ReplaceResult { replaced: true, cleanup_script: None })
}

/// Windows replacement: rename the current executable aside to `.old`, copy
/// the new artifact into place, and on copy failure restore the original.
/// The `.old` file is left behind with a cleanup script the caller should
/// schedule to run after the process exits (it cannot delete its own image
/// while running).
#[cfg(windows)]
pub fn replace_executable(src: &Path, dst: &Path) -> Result<ReplaceResult> {
    let old = dst.with_extension("old");

    fs::rename(dst, &old).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "replace_executable", format!("renaming current executable aside: {e}")).with_cause(e)
    })?;

    if let Err(copy_err) = fs::copy(src, dst) {
        fs::rename(&old, dst).map_err(|restore_err| {
            UpdateError::filesystem(
                COMPONENT,
                "replace_executable",
                format!("copy failed ({copy_err}) and restoring original also failed: {restore_err}"),
            )
            .with_cause(restore_err)
        })?;
        return Err(UpdateError::filesystem(COMPONENT, "replace_executable", format!("copying new executable: {copy_err}")).with_cause(copy_err));
    }

    let cleanup_script = write_windows_cleanup_script(&old)?;
    Ok(ReplaceResult { replaced: true, cleanup_script: Some(cleanup_script) })
}

#[cfg(windows)]
fn write_windows_cleanup_script(old_path: &Path) -> Result<PathBuf> {
    let script_path = old_path.with_extension("cleanup.bat");
    let script = format!(
        ":loop\r\ndel \"{old}\"\r\nif exist \"{old}\" goto loop\r\ndel \"%~f0\"\r\n",
        old = old_path.display()
    );
    fs::write(&script_path, script).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "write_windows_cleanup_script", e.to_string()).with_cause(e)
    })?;
    Ok(script_path)
}

/// Spawn the newly installed binary with a version-printing argument under a
/// short timeout; the update is validated only if stdout contains `expected_version`.
pub fn validate_post_replacement(binary_path: &Path, version_arg: &str, expected_version: &str, timeout: Duration) -> Result<bool> {
    let start = Instant::now();
    let mut child = Command::new(binary_path)
        .arg(version_arg)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| {
            UpdateError::validation(COMPONENT, "validate_post_replacement", format!("spawning new binary: {e}")).with_cause(e)
        })?;

    loop {
        if let Some(status) = child.try_wait().map_err(|e| {
            UpdateError::validation(COMPONENT, "validate_post_replacement", format!("waiting on child: {e}")).with_cause(e)
        })? {
            let _ = status;
            break;
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        use std::io::Read;
        let _ = out.read_to_string(&mut stdout);
    }

    Ok(stdout.contains(expected_version))
}

/// Restore a named backup over the executable, used when post-replacement
/// validation fails.
pub fn rollback_from_backup(backup_path: &Path, dst: &Path) -> Result<()> {
    fs::copy(backup_path, dst).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "rollback_from_backup", format!("restoring backup: {e}")).with_cause(e)
    })?;
    Ok(())
}

/// How elevation must be requested on this platform. The caller is
/// responsible for actually invoking it; this module never elevates silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationMethod {
    WindowsUac,
    MacOsAppleScript,
    LinuxSudo,
}

#[cfg(target_os = "windows")]
pub fn elevation_method() -> ElevationMethod {
    ElevationMethod::WindowsUac
}

#[cfg(target_os = "macos")]
pub fn elevation_method() -> ElevationMethod {
    ElevationMethod::MacOsAppleScript
}

#[cfg(all(unix, not(target_os = "macos")))]
pub fn elevation_method() -> ElevationMethod {
    ElevationMethod::LinuxSudo
}

#[derive(Debug, Clone)]
pub struct ElevationRequired {
    pub method: ElevationMethod,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn can_self_update_true_for_writable_directory() {
        let dir = tempdir().unwrap();
        assert!(can_self_update(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn replace_executable_moves_new_content_into_place() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("new-binary");
        let dst = dir.path().join("installed-binary");
        fs::write(&src, b"new content").unwrap();
        fs::write(&dst, b"old content").unwrap();

        let result = replace_executable(&src, &dst).unwrap();
        assert!(result.replaced);
        assert_eq!(fs::read(&dst).unwrap(), b"new content");
    }

    #[test]
    fn rollback_from_backup_restores_previous_content() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("installed-binary");
        let backup = dir.path().join("backup-binary");
        fs::write(&dst, b"broken update").unwrap();
        fs::write(&backup, b"known good").unwrap();

        rollback_from_backup(&backup, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"known good");
    }
}
