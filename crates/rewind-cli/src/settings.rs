use rewind_agent::{SupervisorConfig, DEFAULT_AGENT_BIN, DEFAULT_HANG_PROBE, DEFAULT_TURN_TIMEOUT};
use std::{
	env,
	path::{Path, PathBuf},
	time::Duration,
};

const DEFAULT_LOG_DIR: &str = ".rewind/logs";
const FALLBACK_DB_PATH: &str = ".rewind/rewind.db";

#[derive(Debug, Default, Clone)]
pub struct AgentFlags {
	pub agent: Vec<String>,
	pub turn_timeout_secs: Option<u64>,
	pub hang_probe_secs: Option<u64>,
	pub model: Option<String>,
	pub permission_mode: Option<String>,
}

pub fn resolve_db_path(flag: Option<&Path>) -> PathBuf {
	db_path_from(flag, env_value("REWIND_DB"), dirs::data_dir())
}

fn db_path_from(flag: Option<&Path>, env: Option<String>, data_dir: Option<PathBuf>) -> PathBuf {
	if let Some(path) = flag {
		return path.to_path_buf();
	}
	if let Some(value) = env {
		return PathBuf::from(value);
	}
	match data_dir {
		Some(dir) => dir.join("rewind").join("rewind.db"),
		None => PathBuf::from(FALLBACK_DB_PATH),
	}
}

pub fn resolve_supervisor_config(flags: &AgentFlags) -> SupervisorConfig {
	SupervisorConfig {
		agent_command: agent_command_from(&flags.agent, env_value("REWIND_AGENT_BIN")),
		turn_timeout: secs_from(
			flags.turn_timeout_secs,
			env_value("REWIND_TURN_TIMEOUT_SECS"),
			DEFAULT_TURN_TIMEOUT,
		),
		hang_probe: secs_from(
			flags.hang_probe_secs,
			env_value("REWIND_HANG_PROBE_SECS"),
			DEFAULT_HANG_PROBE,
		),
		model: flags.model.clone().or_else(|| env_value("REWIND_MODEL")),
		permission_mode: flags
			.permission_mode
			.clone()
			.or_else(|| env_value("REWIND_PERMISSION_MODE")),
		..SupervisorConfig::default()
	}
}

fn agent_command_from(flag: &[String], env: Option<String>) -> Vec<String> {
	if !flag.is_empty() {
		return flag.to_vec();
	}
	if let Some(value) = env {
		let parts = value.split_whitespace().map(str::to_string).collect::<Vec<_>>();
		if !parts.is_empty() {
			return parts;
		}
	}
	vec![DEFAULT_AGENT_BIN.to_string()]
}

fn secs_from(flag: Option<u64>, env: Option<String>, default: Duration) -> Duration {
	if let Some(secs) = flag {
		return Duration::from_secs(secs);
	}
	env.and_then(|value| value.trim().parse::<u64>().ok())
		.map(Duration::from_secs)
		.unwrap_or(default)
}

pub fn resolve_log_dir(flag: Option<&str>) -> String {
	if let Some(flag) = flag.filter(|flag| !flag.trim().is_empty()) {
		return flag.to_string();
	}
	env_value("REWIND_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())
}

pub fn resolve_log_stdout() -> bool {
	env_value("REWIND_LOG_STDOUT")
		.and_then(|value| parse_bool_env(&value))
		.unwrap_or(false)
}

pub fn resolve_log_level() -> String {
	env_value("REWIND_LOG_LEVEL").unwrap_or_else(|| "info".to_string())
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
	match value.trim() {
		"1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON" => Some(true),
		"0" | "false" | "FALSE" | "no" | "NO" | "off" | "OFF" => Some(false),
		_ => None,
	}
}

fn env_value(key: &str) -> Option<String> {
	env::var(key).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn db_path_prefers_flag_then_env_then_data_dir() {
		let data_dir = Some(PathBuf::from("/data"));
		assert_eq!(
			db_path_from(Some(Path::new("/flag.db")), Some("/env.db".to_string()), data_dir.clone()),
			PathBuf::from("/flag.db")
		);
		assert_eq!(
			db_path_from(None, Some("/env.db".to_string()), data_dir.clone()),
			PathBuf::from("/env.db")
		);
		assert_eq!(db_path_from(None, None, data_dir), PathBuf::from("/data/rewind/rewind.db"));
		assert_eq!(db_path_from(None, None, None), PathBuf::from(FALLBACK_DB_PATH));
	}

	#[test]
	fn agent_command_splits_env_value() {
		assert_eq!(
			agent_command_from(&[], Some("npx  agent-cli".to_string())),
			vec!["npx", "agent-cli"]
		);
		assert_eq!(
			agent_command_from(&["my-agent".to_string()], Some("other".to_string())),
			vec!["my-agent"]
		);
		assert_eq!(agent_command_from(&[], None), vec![DEFAULT_AGENT_BIN]);
	}

	#[test]
	fn secs_fall_back_on_garbage() {
		let default = Duration::from_secs(300);
		assert_eq!(secs_from(Some(5), Some("9".to_string()), default), Duration::from_secs(5));
		assert_eq!(secs_from(None, Some(" 9 ".to_string()), default), Duration::from_secs(9));
		assert_eq!(secs_from(None, Some("soon".to_string()), default), default);
	}

	#[test]
	fn bool_env_values() {
		assert_eq!(parse_bool_env("yes"), Some(true));
		assert_eq!(parse_bool_env(" 0 "), Some(false));
		assert_eq!(parse_bool_env("maybe"), None);
	}
}
