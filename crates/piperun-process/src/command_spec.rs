use piperun_utils::ProcessError;
use piperun_wrapper::LaunchCommand;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use tokio::process::Command;

// ============================================================================
// CommandSpec - what to run
// ============================================================================

/// Program, arguments, working directory and environment of a child process.
///
/// Arguments are discrete `OsString` elements and are never joined into a shell
/// string. Running through a shell is the caller's choice:
///
/// ```rust
/// use piperun_process::CommandSpec;
///
/// let spec = CommandSpec::new("sh")
///     .arg("-c")
///     .arg("echo 1; sleep 1; echo 2")
///     .env("LC_ALL", "C");
///
/// assert_eq!(spec.args.len(), 2);
/// assert_eq!(spec.display(), "sh -c 'echo 1; sleep 1; echo 2'");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Working directory; inherited when unset.
    pub cwd: Option<PathBuf>,
    /// Variables added to (or overriding) the inherited environment.
    pub env: BTreeMap<OsString, OsString>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Program name for logs and error messages.
    #[must_use]
    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Human-readable command line. Quoting is for display only.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(quote_for_display)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Tokio command for direct spawning. Stdio is left for the caller to set.
    #[must_use]
    pub fn to_tokio_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Form sent to the wrapper. The launch request is JSON, so every part must
    /// be valid UTF-8.
    pub fn to_launch_command(&self) -> Result<LaunchCommand, ProcessError> {
        let text = |value: &OsStr, what: &str| {
            value
                .to_str()
                .map(str::to_string)
                .ok_or_else(|| ProcessError::Spawn {
                    program: self.program_name(),
                    reason: format!("{what} is not valid UTF-8 and cannot be sent to the wrapper"),
                })
        };

        let program = text(&self.program, "program")?;
        let args = self
            .args
            .iter()
            .map(|arg| text(arg, "argument"))
            .collect::<Result<Vec<_>, _>>()?;
        let env = self
            .env
            .iter()
            .map(|(key, value)| Ok((text(key, "environment key")?, text(value, "environment value")?)))
            .collect::<Result<BTreeMap<_, _>, ProcessError>>()?;

        Ok(LaunchCommand {
            program,
            args,
            cwd: self.cwd.clone(),
            env,
        })
    }
}

fn quote_for_display(part: &OsStr) -> String {
    let text = part.to_string_lossy();
    let plain = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        text.into_owned()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .args(["exit 3"])
            .cwd("/tmp")
            .env("A", "1")
            .envs([("B", "2"), ("A", "3")]);

        assert_eq!(spec.program, OsString::from("sh"));
        assert_eq!(spec.args, vec![OsString::from("-c"), OsString::from("exit 3")]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.env.len(), 2);
        assert_eq!(spec.env.get(OsStr::new("A")), Some(&OsString::from("3")));
    }

    #[test]
    fn test_shell_metacharacters_are_kept_literally() {
        let spec = CommandSpec::new("echo").arg("$(whoami)").arg("a;b");
        assert_eq!(spec.args[0], OsString::from("$(whoami)"));
        assert_eq!(spec.display(), "echo '$(whoami)' 'a;b'");
    }

    #[test]
    fn test_display_quotes_only_when_needed() {
        let spec = CommandSpec::new("/bin/echo").arg("plain-arg").arg("").arg("it's");
        assert_eq!(spec.display(), r"/bin/echo plain-arg '' 'it'\''s'");
    }

    #[test]
    fn test_launch_command_carries_everything() {
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo $X")
            .cwd("/work")
            .env("X", "y");
        let launch = spec.to_launch_command().unwrap();

        assert_eq!(launch.program, "sh");
        assert_eq!(launch.args, vec!["-c".to_string(), "echo $X".to_string()]);
        assert_eq!(launch.cwd, Some(PathBuf::from("/work")));
        assert_eq!(launch.env.get("X").map(String::as_str), Some("y"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_argument_cannot_be_sent_to_wrapper() {
        use std::os::unix::ffi::OsStringExt;

        let spec = CommandSpec::new("cat").arg(OsString::from_vec(vec![0x66, 0x6f, 0xff]));
        match spec.to_launch_command() {
            Err(ProcessError::Spawn { program, reason }) => {
                assert_eq!(program, "cat");
                assert!(reason.contains("argument"));
            }
            other => panic!("Expected Spawn error, got {other:?}"),
        }
    }
}
