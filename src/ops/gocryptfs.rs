//! gocryptfs mount assembly and mount-point probing.

use std::fs;
use std::io;
use std::path::Path;

use crate::jobs::CommandSpec;
use crate::vault::secrets::GocryptVolume;

/// Build the mount invocation. Consumes the volume so the passphrase moves
/// into the spec's stdin payload instead of the command line.
pub fn mount_command(volume: GocryptVolume, idle: Option<&str>, allow_other: bool) -> CommandSpec {
    let mut cmd = String::from("gocryptfs");
    if allow_other {
        cmd.push_str(" -allow_other");
    }
    if let Some(idle) = idle {
        cmd.push_str(&format!(" -i {idle}"));
    }
    cmd.push_str(&format!(
        " {} {}",
        expand_home(&volume.path),
        expand_home(&volume.mount_path)
    ));
    CommandSpec::new(cmd).with_stdin(volume.pw)
}

/// True when `path` is an existing directory with no entries.
pub fn is_empty_dir(path: &Path) -> io::Result<bool> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotADirectory,
            format!("{} is not a directory", path.display()),
        ));
    }
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).display().to_string();
        }
    }
    path.to_string()
}
