use rewind_core::IngestorConfig;
use std::time::Duration;

pub const DEFAULT_AGENT_BIN: &str = "claude";
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_HANG_PROBE: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_STDERR_TAIL_LINES: usize = 40;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Program plus leading arguments; the turn flags are appended after these.
    pub agent_command: Vec<String>,
    pub turn_timeout: Duration,
    pub hang_probe: Duration,
    pub shutdown_grace: Duration,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub stderr_tail_lines: usize,
    pub ingestor: IngestorConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_command: vec![DEFAULT_AGENT_BIN.to_string()],
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            hang_probe: DEFAULT_HANG_PROBE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            model: None,
            permission_mode: None,
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
            ingestor: IngestorConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Arguments passed to the agent program for one non-interactive turn.
    pub fn turn_args(&self, prompt: &str, resume_token: Option<&str>) -> Vec<String> {
        let mut args = self
            .agent_command
            .iter()
            .skip(1)
            .cloned()
            .collect::<Vec<_>>();
        args.extend([
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ]);
        if let Some(token) = resume_token.filter(|token| !token.trim().is_empty()) {
            args.push("--resume".to_string());
            args.push(token.to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(mode) = &self.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_args_follow_leading_arguments() {
        let config = SupervisorConfig {
            agent_command: vec!["npx".to_string(), "agent-cli".to_string()],
            model: Some("sonnet".to_string()),
            ..SupervisorConfig::default()
        };
        let args = config.turn_args("fix the bug", Some("sess-1"));
        assert_eq!(
            args,
            vec![
                "agent-cli",
                "-p",
                "fix the bug",
                "--output-format",
                "stream-json",
                "--verbose",
                "--resume",
                "sess-1",
                "--model",
                "sonnet",
            ]
        );
    }

    #[test]
    fn blank_resume_token_is_not_passed() {
        let config = SupervisorConfig::default();
        let args = config.turn_args("hi", Some("  "));
        assert!(!args.iter().any(|arg| arg == "--resume"));
        assert_eq!(config.agent_command, vec!["claude"]);
        assert_eq!(config.turn_timeout, Duration::from_secs(300));
        assert_eq!(config.hang_probe, Duration::from_secs(30));
    }
}
