use piperun_wrapper::WireExit;

/// Lifecycle of a spawned process. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessStatus {
    /// Spawn requested; for wrapped processes the handshake is still running.
    Starting,
    Running,
    Ended,
}

impl ProcessStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Ended => "ended",
        }
    }

    /// Whether moving from `self` to `next` is a single forward step.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running) | (Self::Running, Self::Ended)
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// Normal exit with a code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(i32),
}

impl ExitStatus {
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(_) => None,
        }
    }

    #[must_use]
    pub const fn signal(&self) -> Option<i32> {
        match self {
            Self::Exited(_) => None,
            Self::Signaled(signal) => Some(*signal),
        }
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

impl From<WireExit> for ExitStatus {
    fn from(wire: WireExit) -> Self {
        match wire {
            WireExit::Code(code) => Self::Exited(code),
            WireExit::Signal(signal) => Self::Signaled(signal),
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Exited(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward_one_step() {
        use ProcessStatus::{Ended, Running, Starting};

        assert!(Starting.can_advance_to(Running));
        assert!(Running.can_advance_to(Ended));
        assert!(!Starting.can_advance_to(Ended));
        assert!(!Ended.can_advance_to(Running));
        assert!(!Running.can_advance_to(Starting));
        assert!(!Ended.can_advance_to(Ended));
        assert!(Starting < Running && Running < Ended);
    }

    #[test]
    fn test_exit_status_accessors() {
        let exited = ExitStatus::Exited(42);
        assert_eq!(exited.code(), Some(42));
        assert_eq!(exited.signal(), None);
        assert!(!exited.success());
        assert!(ExitStatus::Exited(0).success());

        let killed = ExitStatus::Signaled(9);
        assert_eq!(killed.code(), None);
        assert_eq!(killed.signal(), Some(9));
        assert_eq!(killed.to_string(), "signal 9");
    }

    #[test]
    fn test_wire_exit_conversion() {
        assert_eq!(ExitStatus::from(WireExit::Code(3)), ExitStatus::Exited(3));
        assert_eq!(ExitStatus::from(WireExit::Signal(15)), ExitStatus::Signaled(15));
    }

    #[cfg(unix)]
    #[test]
    fn test_std_exit_status_conversion() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(
            ExitStatus::from(std::process::ExitStatus::from_raw(42 << 8)),
            ExitStatus::Exited(42)
        );
        assert_eq!(
            ExitStatus::from(std::process::ExitStatus::from_raw(9)),
            ExitStatus::Signaled(9)
        );
    }
}
