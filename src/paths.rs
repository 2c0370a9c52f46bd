//! Filesystem locations used by the broker.

use std::path::{Path, PathBuf};

/// Prefix of the local worker channel's socket file name.
pub const IPC_SOCKET_PREFIX: &str = ".s.rustica";

/// Default directory for the local worker channel.
///
/// Prefers the per-user runtime directory (`$XDG_RUNTIME_DIR` on Linux) and
/// falls back to the system temp directory.
pub fn default_ipc_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Path of the local worker channel for a given public port.
///
/// # Examples
///
/// ```
/// use std::path::{Path, PathBuf};
/// use rustica::paths::ipc_socket_path;
///
/// assert_eq!(
///     ipc_socket_path(Path::new("/run/rustica"), 8080),
///     PathBuf::from("/run/rustica/.s.rustica.8080"),
/// );
/// ```
pub fn ipc_socket_path(dir: &Path, port: u16) -> PathBuf {
    dir.join(format!("{}.{}", IPC_SOCKET_PREFIX, port))
}
