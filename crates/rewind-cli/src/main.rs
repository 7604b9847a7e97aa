mod logging;
mod settings;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rewind_agent::Supervisor;
use rewind_core::{Checkpoint, ContentBlock, ConversationStatus, LocalFileSystem, Turn, TurnWarning};
use rewind_session::{
	ConversationHandle, ConversationState, ConversationView, FileOutcome, FileStatus, RevertOutcome, SessionHub,
};
use serde::Serialize;
use settings::{resolve_db_path, resolve_log_dir, resolve_supervisor_config, AgentFlags};
use std::{path::PathBuf, sync::Arc};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "rewind")]
#[command(about = "Checkpoint and revert file edits made by agent turns", long_about = None)]
struct Cli {
	/// SQLite database holding conversations and checkpoints
	#[arg(long, global = true)]
	db: Option<PathBuf>,
	#[arg(long, global = true)]
	log_dir: Option<String>,
	/// Print JSON instead of text
	#[arg(long, global = true)]
	json: bool,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Run one agent turn and print the finished turn
	Run(RunArgs),
	/// Show a conversation's state and turns
	View {
		#[arg(long)]
		conversation: String,
	},
	/// List checkpoints, or the revert set of one turn
	Checkpoints {
		#[arg(long)]
		conversation: String,
		#[arg(long)]
		turn: Option<String>,
	},
	/// Restore files to their state before a turn
	Revert {
		#[arg(long)]
		conversation: String,
		#[arg(long)]
		turn: String,
	},
	/// Undo the last revert
	Unrevert {
		#[arg(long)]
		conversation: String,
	},
	/// List turns left unfinished by crashed or stopped runs
	Recover {
		#[arg(long)]
		clear: Option<String>,
	},
	/// Delete every checkpoint of a conversation
	Cleanup {
		#[arg(long)]
		conversation: String,
	},
	/// Mark a conversation archived
	Archive {
		#[arg(long)]
		conversation: String,
	},
}

#[derive(Args, Debug)]
struct RunArgs {
	#[arg(long)]
	conversation: String,
	/// Working directory for a new conversation; defaults to the current directory
	#[arg(long)]
	cwd: Option<PathBuf>,
	/// Agent program and leading arguments, one per flag
	#[arg(long = "agent")]
	agent: Vec<String>,
	#[arg(long)]
	turn_timeout_secs: Option<u64>,
	#[arg(long)]
	hang_probe_secs: Option<u64>,
	#[arg(long)]
	model: Option<String>,
	#[arg(long)]
	permission_mode: Option<String>,
	#[arg(required = true, trailing_var_arg = true)]
	prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let _log_guard = logging::init_logging(&resolve_log_dir(cli.log_dir.as_deref()));

	let db_path = resolve_db_path(cli.db.as_deref());
	let hub = Arc::new(
		SessionHub::new(&db_path, Arc::new(LocalFileSystem))
			.with_context(|| format!("failed to open database {}", db_path.display()))?,
	);

	match cli.command {
		Commands::Run(args) => {
			let turn = run_turn(hub, args).await?;
			emit(cli.json, &turn, || print_turn(&turn))?;
		}
		Commands::View { conversation } => {
			let view = open(&hub, &conversation).await?.view().await?;
			emit(cli.json, &view, || print_view(&view))?;
		}
		Commands::Checkpoints { conversation, turn } => {
			let handle = open(&hub, &conversation).await?;
			let checkpoints = match turn {
				Some(turn) => handle.list_for_revert(turn).await?,
				None => handle.checkpoints().await?,
			};
			emit(cli.json, &checkpoints, || print_checkpoints(&checkpoints))?;
		}
		Commands::Revert { conversation, turn } => {
			let outcome = open(&hub, &conversation).await?.revert(turn).await?;
			emit(cli.json, &outcome, || match &outcome {
				RevertOutcome::NoCheckpointsFound { turn_id } => {
					println!("No checkpoints found for turn {turn_id}; nothing reverted");
				}
				RevertOutcome::Reverted(report) => {
					println!(
						"Reverted to turn {} ({} later turns stashed)",
						report.turn_id, report.truncated_turns
					);
					print_files(&report.files);
				}
			})?;
		}
		Commands::Unrevert { conversation } => {
			let report = open(&hub, &conversation).await?.unrevert().await?;
			emit(cli.json, &report, || {
				println!("Unreverted turn {} ({} turns restored)", report.turn_id, report.restored_turns);
				print_files(&report.files);
			})?;
		}
		Commands::Recover { clear } => match clear {
			Some(conversation) => {
				let cleared = hub.clear_recovery_state(&conversation)?;
				emit(cli.json, &cleared, || {
					if cleared {
						println!("Cleared recovery state for {conversation}");
					} else {
						println!("No recovery state for {conversation}");
					}
				})?;
			}
			None => {
				let states = hub.recovery_states()?;
				emit(cli.json, &states, || {
					if states.is_empty() {
						println!("No unfinished turns");
					}
					for state in &states {
						println!(
							"{} turn {} [{}] updated {}{}",
							state.conversation_id,
							state.turn_id,
							state.reason,
							state.updated_at.to_rfc3339(),
							state
								.resume_token
								.as_deref()
								.map(|token| format!(" resume={token}"))
								.unwrap_or_default()
						);
					}
				})?;
			}
		},
		Commands::Cleanup { conversation } => {
			let removed = open(&hub, &conversation).await?.cleanup().await?;
			emit(cli.json, &removed, || println!("Removed {removed} checkpoints"))?;
		}
		Commands::Archive { conversation } => {
			open(&hub, &conversation)
				.await?
				.set_status(ConversationStatus::Archived)
				.await?;
			emit(cli.json, &conversation, || println!("Archived {conversation}"))?;
		}
	}

	Ok(())
}

async fn open(hub: &SessionHub, conversation: &str) -> Result<ConversationHandle> {
	hub.conversation(conversation, None)
		.await
		.with_context(|| format!("failed to open conversation {conversation}"))
}

async fn run_turn(hub: Arc<SessionHub>, args: RunArgs) -> Result<Turn> {
	let cwd = match args.cwd {
		Some(cwd) => cwd,
		None => std::env::current_dir().context("failed to resolve current directory")?,
	};
	hub.conversation(&args.conversation, Some(cwd))
		.await
		.with_context(|| format!("failed to open conversation {}", args.conversation))?;

	let config = resolve_supervisor_config(&AgentFlags {
		agent: args.agent,
		turn_timeout_secs: args.turn_timeout_secs,
		hang_probe_secs: args.hang_probe_secs,
		model: args.model,
		permission_mode: args.permission_mode,
	});
	let supervisor = Arc::new(Supervisor::new(hub, config));
	let prompt = args.prompt.join(" ");
	let conversation = args.conversation.clone();

	let running = supervisor.clone();
	let mut task = tokio::spawn(async move { running.start(&conversation, &prompt).await });
	let joined = tokio::select! {
		joined = &mut task => joined,
		_ = tokio::signal::ctrl_c() => {
			warn!(event = "interrupt_received", conversation_id = %args.conversation);
			supervisor.shutdown().await;
			task.await
		}
	};
	let turn = joined
		.context("agent task failed")?
		.with_context(|| format!("turn failed for conversation {}", args.conversation))?;
	Ok(turn)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce()) -> Result<()> {
	if json {
		println!("{}", serde_json::to_string_pretty(value)?);
	} else {
		text();
	}
	Ok(())
}

fn print_turn(turn: &Turn) {
	println!("turn {} [{}]", turn.id, turn.completion);
	for block in &turn.blocks {
		match block {
			ContentBlock::Text { text } => println!("{text}"),
			ContentBlock::Thinking { .. } => {}
			ContentBlock::ToolInvocation(invocation) => {
				println!("  tool {} {} ({:?})", invocation.name, invocation.id, invocation.status);
			}
		}
	}
	print_warnings(&turn.warnings);
}

fn print_view(view: &ConversationView) {
	let state = match &view.state {
		ConversationState::Normal => "normal".to_string(),
		ConversationState::Reverted { turn_id } => format!("reverted to {turn_id}"),
	};
	println!("{} [{}] {}", view.conversation_id, view.status, state);
	if let Some(session) = &view.external_session_id {
		println!("session {session}");
	}
	for turn in &view.turns {
		let marker = if turn.has_checkpoints { "*" } else { " " };
		println!(
			"{marker} {:>3} {:<9} {:<11} {}",
			turn.index.0,
			turn.role.to_string(),
			turn.completion.to_string(),
			turn.id
		);
		print_warnings(&turn.warnings);
	}
}

fn print_warnings(warnings: &[TurnWarning]) {
	for warning in warnings {
		match warning {
			TurnWarning::Checkpoint { tool_use_id, path, message } => {
				println!(
					"  ! checkpoint {tool_use_id} {}: {message}",
					path.as_deref().unwrap_or("-")
				);
			}
			TurnWarning::Reconciliation { placeholder_id, final_id, message } => {
				println!("  ! turn id {placeholder_id} -> {final_id}: {message}");
			}
			TurnWarning::Stream { message } => println!("  ! stream: {message}"),
		}
	}
}

fn print_checkpoints(checkpoints: &[Checkpoint]) {
	if checkpoints.is_empty() {
		println!("No checkpoints");
	}
	for checkpoint in checkpoints {
		let after = if checkpoint.after_content.is_pending() {
			"pending"
		} else {
			"resolved"
		};
		println!(
			"#{} {} {} {} [{}{}]",
			checkpoint.sequence,
			checkpoint.turn_id,
			checkpoint.tool_kind,
			checkpoint.file_path,
			after,
			if checkpoint.abandoned { ", abandoned" } else { "" }
		);
	}
}

fn print_files(files: &[FileOutcome]) {
	for file in files {
		let drift = if file.drifted == Some(true) { " (modified since checkpoint)" } else { "" };
		match &file.status {
			FileStatus::Written => println!("  written {}{drift}", file.file_path),
			FileStatus::Skipped(reason) => println!("  skipped {}: {reason}", file.file_path),
			FileStatus::Failed(reason) => println!("  FAILED  {}: {reason}", file.file_path),
		}
	}
}
