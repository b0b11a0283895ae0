/// Tracks every active session that opted into crash safety and owns the
/// termination-signal traps that stop them before the process exits.
///
/// The registry is an explicitly constructed, clonable handle; the
/// application entry point decides its scope and tests build isolated
/// instances. Sessions are held weakly and compared by identity, so a
/// session appears at most once and a dropped session never pins the list.
///
/// The OS-level signal handler never runs session code: tokio's signal
/// machinery only wakes a dedicated task, which runs the stop loop in an
/// ordinary execution context. That costs one scheduling hop between signal
/// receipt and cleanup.
use crate::session::Shared;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::signal::unix::{signal, SignalKind};

/// Terminating signals the registry can trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TermSignal {
    Abort,
    Hangup,
    Interrupt,
    Quit,
    Terminate,
}

impl TermSignal {
    /// Every signal trapped by default.
    pub const ALL: [TermSignal; 5] = [
        TermSignal::Abort,
        TermSignal::Hangup,
        TermSignal::Interrupt,
        TermSignal::Quit,
        TermSignal::Terminate,
    ];

    fn kind(self) -> SignalKind {
        match self {
            TermSignal::Abort => SignalKind::from_raw(nix::libc::SIGABRT),
            TermSignal::Hangup => SignalKind::hangup(),
            TermSignal::Interrupt => SignalKind::interrupt(),
            TermSignal::Quit => SignalKind::quit(),
            TermSignal::Terminate => SignalKind::terminate(),
        }
    }

    /// Raw signal number.
    pub fn number(self) -> i32 {
        self.kind().as_raw_value()
    }
}

impl fmt::Display for TermSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TermSignal::Abort => "SIGABRT",
            TermSignal::Hangup => "SIGHUP",
            TermSignal::Interrupt => "SIGINT",
            TermSignal::Quit => "SIGQUIT",
            TermSignal::Terminate => "SIGTERM",
        };
        f.write_str(name)
    }
}

/// Errors from wiring signal traps.
#[derive(Debug)]
pub enum RegistryError {
    /// A trap for this signal is already installed. Traps are permanent for
    /// the life of the process, so this is a wiring bug, not a runtime
    /// condition to recover from.
    DuplicateSignalAdded { signal: TermSignal },
    /// The OS refused to install the handler.
    Install {
        signal: TermSignal,
        source: std::io::Error,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateSignalAdded { signal } => {
                write!(f, "signal {} is already trapped", signal)
            }
            RegistryError::Install { signal, source } => {
                write!(f, "failed to install handler for {}: {}", signal, source)
            }
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Install { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    members: Mutex<Vec<Weak<Shared>>>,
    trapped: Mutex<HashSet<i32>>,
}

/// Clonable handle to one registry instance.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the active set unless already present. Identity
    /// check, not equality; a duplicate registration is a no-op.
    pub(crate) fn register(&self, shared: &Arc<Shared>) {
        let weak = Arc::downgrade(shared);
        let mut members = self.inner.members.lock().unwrap();
        members.retain(|m| m.strong_count() > 0);
        if members.iter().any(|m| Weak::ptr_eq(m, &weak)) {
            return;
        }
        members.push(weak);
        tracing::debug!(active = members.len(), "session registered");
    }

    /// Remove a session if present; a no-op otherwise.
    pub(crate) fn deregister(&self, shared: &Arc<Shared>) {
        let weak = Arc::downgrade(shared);
        let mut members = self.inner.members.lock().unwrap();
        members.retain(|m| m.strong_count() > 0 && !Weak::ptr_eq(m, &weak));
        tracing::debug!(active = members.len(), "session deregistered");
    }

    /// Number of currently registered sessions.
    pub fn active_count(&self) -> usize {
        let mut members = self.inner.members.lock().unwrap();
        members.retain(|m| m.strong_count() > 0);
        members.len()
    }

    /// Stop every currently registered session, each to completion.
    ///
    /// Strong references are collected first and the membership lock released
    /// before any stop runs, so one session's slow subprocess-exit wait never
    /// blocks unrelated registrations. No cross-session ordering is
    /// guaranteed; sessions are independent.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Shared>> = {
            let members = self.inner.members.lock().unwrap();
            members.iter().filter_map(Weak::upgrade).collect()
        };
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "stopping all registered sessions");
        for session in sessions {
            session.stop().await;
        }
    }

    /// Trap the given terminating signals. On receipt of any of them, a
    /// dedicated task stops every registered session and then lets default
    /// termination proceed, exiting with the conventional `128 + signo`.
    ///
    /// Each signal can be hooked once for the life of the process and traps
    /// are never removed: uninstalling a sleep-safety trap while sessions may
    /// still depend on it is unsafe. Must be called within a tokio runtime.
    pub fn trap(&self, signals: &[TermSignal]) -> Result<(), RegistryError> {
        for &sig in signals {
            {
                let mut trapped = self.inner.trapped.lock().unwrap();
                if !trapped.insert(sig.number()) {
                    return Err(RegistryError::DuplicateSignalAdded { signal: sig });
                }
            }
            let mut stream = signal(sig.kind()).map_err(|e| RegistryError::Install {
                signal: sig,
                source: e,
            })?;
            let registry = self.clone();
            tokio::spawn(async move {
                stream.recv().await;
                tracing::info!(signal = %sig, "terminating signal received, stopping sessions");
                registry.shutdown_all().await;
                std::process::exit(128 + sig.number());
            });
            tracing::debug!(signal = %sig, "trap installed");
        }
        Ok(())
    }

    /// Trap the full default set of terminating signals.
    pub fn trap_defaults(&self) -> Result<(), RegistryError> {
        self.trap(&TermSignal::ALL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Executable;
    use crate::opts::Opt;
    use crate::session::Session;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Write a stub executable that stands in for caffeinate.
    fn stub_executable(dir: &tempfile::TempDir, script: &str) -> Executable {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("fake-caffeinate");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Executable::at(&path)
    }

    #[tokio::test]
    async fn test_register_is_identity_deduplicated() {
        let registry = Registry::new();
        let session = Session::new(vec![Opt::Idle]);

        registry.register(session.shared());
        registry.register(session.shared());
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_sessions_register_independently() {
        let registry = Registry::new();
        let a = Session::new(vec![Opt::Idle]);
        let b = Session::new(vec![Opt::Idle]);

        registry.register(a.shared());
        registry.register(b.shared());
        assert_eq!(registry.active_count(), 2);
    }

    #[tokio::test]
    async fn test_deregister_absent_session_is_a_noop() {
        let registry = Registry::new();
        let session = Session::new(vec![Opt::Idle]);

        registry.deregister(session.shared());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_session_leaves_no_entry() {
        let registry = Registry::new();
        {
            let session = Session::new(vec![Opt::Idle]);
            registry.register(session.shared());
        }
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_start_registers_and_stop_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let mut session = Session::new(vec![Opt::Idle])
            .with_registry(registry.clone())
            .with_executable(stub_executable(&dir, "sleep 30"));

        session.start().await.unwrap();
        assert_eq!(registry.active_count(), 1);

        session.stop().await;
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_never_registers() {
        let registry = Registry::new();
        let mut session = Session::new(vec![Opt::Idle])
            .with_registry(registry.clone())
            .with_executable(Executable::at("/nonexistent-dir/no-caffeinate"));

        assert!(session.start().await.is_err());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_interception_off_skips_registration() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let mut session = Session::new(vec![Opt::Idle])
            .with_registry(registry.clone())
            .intercept_termination(false)
            .with_executable(stub_executable(&dir, "sleep 30"));

        session.start().await.unwrap();
        assert_eq!(registry.active_count(), 0);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let exec = stub_executable(&dir, "sleep 30");

        let mut sessions = Vec::new();
        for _ in 0..3 {
            let mut session = Session::new(vec![Opt::Idle])
                .with_registry(registry.clone())
                .with_executable(exec.clone());
            session.start().await.unwrap();
            sessions.push(session);
        }
        assert_eq!(registry.active_count(), 3);

        timeout(Duration::from_secs(10), registry.shutdown_all())
            .await
            .expect("shutdown did not complete");

        for session in &sessions {
            assert!(!session.is_active());
        }
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_with_no_sessions_is_a_noop() {
        let registry = Registry::new();
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_sessions_are_reusable_after_mass_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let mut session = Session::new(vec![Opt::Idle])
            .with_registry(registry.clone())
            .with_executable(stub_executable(&dir, "sleep 30"));

        session.start().await.unwrap();
        registry.shutdown_all().await;
        assert!(!session.is_active());

        session.start().await.unwrap();
        assert_eq!(registry.active_count(), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_trapping_a_signal_twice_fails() {
        let registry = Registry::new();
        registry.trap(&[TermSignal::Hangup]).unwrap();

        let err = registry.trap(&[TermSignal::Hangup]).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DuplicateSignalAdded {
                signal: TermSignal::Hangup
            }
        ));
    }

    #[tokio::test]
    async fn test_trap_reports_the_duplicate_within_a_batch() {
        let registry = Registry::new();
        let err = registry
            .trap(&[TermSignal::Quit, TermSignal::Quit])
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DuplicateSignalAdded {
                signal: TermSignal::Quit
            }
        ));
    }

    #[test]
    fn test_signal_numbers_match_the_platform() {
        assert_eq!(TermSignal::Abort.number(), nix::libc::SIGABRT);
        assert_eq!(TermSignal::Hangup.number(), nix::libc::SIGHUP);
        assert_eq!(TermSignal::Interrupt.number(), nix::libc::SIGINT);
        assert_eq!(TermSignal::Quit.number(), nix::libc::SIGQUIT);
        assert_eq!(TermSignal::Terminate.number(), nix::libc::SIGTERM);
    }
}
