//! Supervise sleep-prevention subprocesses tied to the host process lifetime.
//!
//! wakeguard wraps the platform `caffeinate` executable. A [`Session`] owns at
//! most one run of the subprocess at a time and can be restarted indefinitely;
//! a [`Registry`] tracks every active session and stops them all before the
//! host process exits on a terminating signal. As a second line of defense,
//! sessions ask the child to watch the host PID, so even an unmaskable kill
//! of the host leaves no subprocess behind.

pub mod config;
pub mod exec;
pub mod logging;
pub mod opts;
pub mod process;
pub mod registry;
pub mod session;

pub use exec::{Executable, CAFFEINATE_PATH};
pub use opts::{Opt, OptKind, OptParseError};
pub use registry::{Registry, RegistryError, TermSignal};
pub use session::{ConfigUpdate, RunEnded, Session, SessionError};
