use crate::settings::{resolve_log_level, resolve_log_stdout};
use std::{
	fs::OpenOptions,
	io::{self, Write},
	path::PathBuf,
	sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

type SharedFile = Arc<Mutex<std::fs::File>>;

pub struct LogGuard {
	file: Option<SharedFile>,
}

impl Drop for LogGuard {
	fn drop(&mut self) {
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = file.flush();
			}
		}
	}
}

struct MultiWriter {
	stderr_enabled: bool,
	file: Option<SharedFile>,
}

/// Installs the global subscriber. `RUST_LOG` wins over `REWIND_LOG_LEVEL`.
pub fn init_logging(log_dir: &str) -> Option<LogGuard> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(resolve_log_level()));
	let guard = match open_log_file(log_dir) {
		Ok(guard) => guard,
		Err(err) => {
			eprintln!("log_file_error: {err}");
			LogGuard { file: None }
		}
	};
	let file = guard.file.clone();
	let stderr_enabled = resolve_log_stdout();
	let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stderr_enabled));
	let subscriber = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_ansi(false)
		.with_writer(make_writer)
		.finish();
	if tracing::subscriber::set_global_default(subscriber).is_err() {
		return None;
	}
	Some(guard)
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
	if log_dir.trim().is_empty() {
		return Ok(LogGuard { file: None });
	}
	let dir = PathBuf::from(log_dir);
	std::fs::create_dir_all(&dir)?;
	let path = dir.join(format!("rewind-{}.log", std::process::id()));
	let file = OpenOptions::new().create(true).append(true).open(path)?;
	Ok(LogGuard {
		file: Some(Arc::new(Mutex::new(file))),
	})
}

impl MultiWriter {
	fn new(file: Option<SharedFile>, stderr_enabled: bool) -> Self {
		Self { stderr_enabled, file }
	}
}

impl Write for MultiWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if self.stderr_enabled {
			let _ = io::stderr().write_all(buf);
		}
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = file.write_all(buf);
			}
		}
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		if self.stderr_enabled {
			let _ = io::stderr().flush();
		}
		if let Some(file) = &self.file {
			if let Ok(mut file) = file.lock() {
				let _ = file.flush();
			}
		}
		Ok(())
	}
}
