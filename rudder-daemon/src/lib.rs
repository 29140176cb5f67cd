//! Controller loop for rudder: scheduled and watch-triggered passes over
//! every Application tree, plus the Unix-socket command surface.

pub mod controller;
mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use controller::{Controller, PassOutcome};
pub use error::DaemonError;
pub use protocol::{
    is_running, request, request_status, request_stop, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{dispatch, execute_local, run, start_blocking, summarize};
