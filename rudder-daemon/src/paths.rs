use std::path::{Path, PathBuf};
use std::time::Duration;

use rudder_core::store::rudder_root;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_SOCKET: &str = "rudderd.sock";

pub fn socket_path(home: &Path) -> PathBuf {
    rudder_root(home).join(DAEMON_SOCKET)
}
