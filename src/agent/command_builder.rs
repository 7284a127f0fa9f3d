use std::path::PathBuf;

use tokio::process::Command;

/// Fluent builder for the agent argv.
///
/// The agent CLI has many flags and the invariants matter: print mode and
/// stream output are always on, and the permission mode must never allow
/// the agent to block on an interactive confirmation. A fire-and-forget
/// service has nobody at the keyboard.
#[derive(Debug, Clone)]
pub struct AgentCommandBuilder {
    binary_path: String,
    permission_mode: PermissionMode,
    system_prompt: Option<String>,
    working_dir: Option<PathBuf>,
}

/// Permission posture handed to the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Agent applies its own edit confirmations. Unusable under this
    /// service (nothing can answer the prompt) but kept for ad-hoc runs.
    Interactive,
    /// Confirmations suppressed; the agent proceeds autonomously.
    NonInteractive,
}

impl PermissionMode {
    fn flag_value(self) -> &'static str {
        match self {
            Self::Interactive => "default",
            Self::NonInteractive => "bypassPermissions",
        }
    }
}

impl AgentCommandBuilder {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            permission_mode: PermissionMode::NonInteractive,
            system_prompt: None,
            working_dir: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    /// Argv as strings, for logging and tests.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--permission-mode".to_string(),
            self.permission_mode.flag_value().to_string(),
        ];
        if let Some(prompt) = &self.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }
        args
    }

    /// Assemble the `tokio::process::Command`. The prompt itself goes to
    /// stdin, never onto the argv.
    pub fn build(&self) -> Command {
        let mut command = Command::new(&self.binary_path);
        command.args(self.args());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_argv_suppresses_confirmations() {
        let builder = AgentCommandBuilder::new("agent");
        let args = builder.args();
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        let mode_at = args.iter().position(|a| a == "--permission-mode").unwrap();
        assert_eq!(args[mode_at + 1], "bypassPermissions");
    }

    #[test]
    fn system_prompt_is_appended_when_present() {
        let args = AgentCommandBuilder::new("agent")
            .with_system_prompt("be terse")
            .args();
        let at = args
            .iter()
            .position(|a| a == "--append-system-prompt")
            .unwrap();
        assert_eq!(args[at + 1], "be terse");
    }

    #[test]
    fn no_system_prompt_flag_when_absent() {
        let args = AgentCommandBuilder::new("agent").args();
        assert!(!args.iter().any(|a| a == "--append-system-prompt"));
    }
}
