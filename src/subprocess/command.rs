use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// An executable and its argument list, no shell involved.
    Raw { program: String, args: Vec<String> },
    /// A script handed to the launcher's shell as `<shell> -c <script>`.
    Shell(String),
}

/// A complete description of one invocation.
///
/// `env` pairs are layered over the inherited environment; on a key
/// collision the caller's value wins, and among caller pairs the later one
/// wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub kind: CommandKind,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn raw<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        CommandSpecBuilder::new(program).args(args).build()
    }

    pub fn shell(script: &str) -> Self {
        CommandSpecBuilder::shell(script).build()
    }

    /// The executable of a raw command. Shell commands have none of their
    /// own; the launcher picks the shell.
    pub fn program(&self) -> Option<&str> {
        match &self.kind {
            CommandKind::Raw { program, .. } => Some(program),
            CommandKind::Shell(_) => None,
        }
    }

    /// Shell-quoted rendering of the command line.
    pub fn display(&self) -> String {
        match &self.kind {
            CommandKind::Raw { program, args } => {
                shell_words::join(std::iter::once(program).chain(args.iter()))
            }
            CommandKind::Shell(script) => script.clone(),
        }
    }
}

pub struct CommandSpecBuilder {
    command: CommandSpec,
}

impl CommandSpecBuilder {
    pub fn new(program: &str) -> Self {
        Self::from_kind(CommandKind::Raw {
            program: program.to_string(),
            args: Vec::new(),
        })
    }

    pub fn shell(script: &str) -> Self {
        Self::from_kind(CommandKind::Shell(script.to_string()))
    }

    fn from_kind(kind: CommandKind) -> Self {
        Self {
            command: CommandSpec {
                kind,
                env: Vec::new(),
                timeout: None,
                working_dir: None,
            },
        }
    }

    /// Append an argument. For shell commands the argument is quoted and
    /// appended to the script.
    pub fn arg(mut self, arg: &str) -> Self {
        match &mut self.command.kind {
            CommandKind::Raw { args, .. } => args.push(arg.to_string()),
            CommandKind::Shell(script) => {
                script.push(' ');
                script.push_str(&shell_words::quote(arg));
            }
        }
        self
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        args.into_iter().fold(self, |b, a| b.arg(a.as_ref()))
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.command.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.command
                .env
                .push((key.as_ref().to_string(), value.as_ref().to_string()));
        }
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.command.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn maybe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command.timeout = timeout;
        self
    }

    pub fn build(self) -> CommandSpec {
        self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_raw() {
        let cmd = CommandSpecBuilder::new("echo")
            .arg("hello")
            .args(["big", "world"])
            .env("A", "1")
            .timeout(Duration::from_secs(3))
            .build();

        assert_eq!(
            cmd.kind,
            CommandKind::Raw {
                program: "echo".to_string(),
                args: vec!["hello".into(), "big".into(), "world".into()],
            }
        );
        assert_eq!(cmd.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(cmd.timeout, Some(Duration::from_secs(3)));
        assert_eq!(cmd.program(), Some("echo"));
    }

    #[test]
    fn test_shell_command_has_no_program() {
        let cmd = CommandSpec::shell("echo hi");
        assert_eq!(cmd.program(), None);
        assert_eq!(cmd.display(), "echo hi");
    }

    #[test]
    fn test_builder_shell_quotes_args() {
        let cmd = CommandSpecBuilder::shell("printf '%s\\n'")
            .arg("two words")
            .build();
        assert_eq!(
            cmd.kind,
            CommandKind::Shell("printf '%s\\n' 'two words'".to_string())
        );
    }

    #[test]
    fn test_display_quotes_raw_args() {
        let cmd = CommandSpec::raw("ls", ["-l", "my dir"]);
        assert_eq!(cmd.display(), "ls -l 'my dir'");
    }

    #[test]
    fn test_env_keeps_insertion_order() {
        let cmd = CommandSpecBuilder::new("env")
            .envs([("K", "first"), ("K", "second")])
            .build();
        assert_eq!(cmd.env.last().unwrap().1, "second");
    }
}
