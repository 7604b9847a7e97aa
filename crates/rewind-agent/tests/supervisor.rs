#![cfg(unix)]

use rewind_agent::{Supervisor, SupervisorConfig, SupervisorError};
use rewind_core::{AfterContent, LocalFileSystem, TurnCompletion};
use rewind_session::{RevertOutcome, SessionHub};
use rewind_storage::RecoveryReason;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1","model":"test"}"#;

struct Env {
    dir: TempDir,
    work: PathBuf,
    hub: Arc<SessionHub>,
}

impl Env {
    async fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let work = dir.path().join("work");
        fs::create_dir_all(&work).expect("workdir");
        let hub = Arc::new(
            SessionHub::new(dir.path().join("rewind.db"), Arc::new(LocalFileSystem))
                .expect("open hub"),
        );
        hub.conversation("conv-1", Some(work.clone()))
            .await
            .expect("create conversation");
        Self { dir, work, hub }
    }

    /// Writes a fake agent script. The agent is run as `sh <script>`.
    fn agent(&self, body: &str) -> SupervisorConfig {
        let script = self.dir.path().join("agent.sh");
        fs::write(&script, body).expect("write agent script");
        SupervisorConfig {
            agent_command: vec!["sh".to_string(), script.to_string_lossy().into_owned()],
            ..SupervisorConfig::default()
        }
    }

    fn supervisor(&self, config: SupervisorConfig) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(self.hub.clone(), config))
    }
}

fn write_turn_script(args_file: &Path) -> String {
    format!(
        r#"printf '%s\n' "$@" > '{args}'
echo '{INIT}'
printf '{{"type":"assistant","message":{{"id":"msg-%s","content":[{{"type":"text","text":"writing"}},{{"type":"tool_use","id":"tu-%s","name":"Write","input":{{"file_path":"out.txt","content":"hello"}}}}]}}}}\n' "$$" "$$"
printf '{{"type":"user","message":{{"content":[{{"type":"tool_result","tool_use_id":"tu-%s","content":"ok"}}]}}}}\n' "$$"
echo '{{"type":"result","subtype":"success","is_error":false,"session_id":"sess-1"}}'
"#,
        args = args_file.display(),
    )
}

async fn wait_for_pid(supervisor: &Supervisor) {
    for _ in 0..200 {
        if supervisor
            .status("conv-1")
            .is_some_and(|status| status.pid.is_some())
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent never started");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_turn_records_checkpoints_and_resumes_session() {
    let env = Env::new().await;
    fs::write(env.work.join("out.txt"), "seed").expect("seed file");
    let args_file = env.dir.path().join("args.txt");
    let supervisor = env.supervisor(env.agent(&write_turn_script(&args_file)));

    let turn = supervisor
        .start("conv-1", "write hello")
        .await
        .expect("first turn");
    assert_eq!(turn.completion, TurnCompletion::Completed);
    assert!(turn.id.starts_with("msg-"));
    assert_eq!(turn.text(), "writing");
    assert!(turn.stats.is_some());
    let args = fs::read_to_string(&args_file).expect("args");
    assert!(args.contains("write hello"));
    assert!(args.contains("stream-json"));
    assert!(!args.contains("--resume"));

    let handle = env.hub.conversation("conv-1", None).await.expect("handle");
    let checkpoints = handle.list_for_revert(turn.id.as_str()).await.expect("list");
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].before_content, "seed");
    assert_eq!(
        checkpoints[0].after_content,
        AfterContent::Resolved("hello".to_string())
    );

    supervisor
        .start("conv-1", "again")
        .await
        .expect("second turn");
    let args = fs::read_to_string(&args_file).expect("args");
    assert!(args.contains("--resume\nsess-1"));

    let outcome = handle.revert(turn.id.as_str()).await.expect("revert");
    assert!(matches!(outcome, RevertOutcome::Reverted(_)));
    assert_eq!(
        fs::read_to_string(env.work.join("out.txt")).expect("read"),
        "seed"
    );
    assert!(supervisor.status("conv-1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_zero_exit_keeps_partial_turn_for_recovery() {
    let env = Env::new().await;
    let supervisor = env.supervisor(env.agent(&format!(
        "echo '{INIT}'\necho 'rate limited' >&2\nexit 3\n"
    )));

    let err = supervisor
        .start("conv-1", "hi")
        .await
        .expect_err("non-zero exit");
    match err {
        SupervisorError::NonZeroExit { code, stderr_tail } => {
            assert_eq!(code, Some(3));
            assert!(stderr_tail.contains("rate limited"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let states = env.hub.recovery_states().expect("recovery");
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].reason, RecoveryReason::NonZeroExit);
    assert_eq!(states[0].resume_token.as_deref(), Some("sess-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_exit_resolves_with_partial_turn() {
    let env = Env::new().await;
    let supervisor = env.supervisor(env.agent(&format!(
        "echo '{INIT}'\necho '{{\"type\":\"assistant\",\"message\":{{\"id\":\"msg-1\",\"content\":[{{\"type\":\"text\",\"text\":\"half\"}}]}}}}'\nexit 130\n"
    )));

    let turn = supervisor.start("conv-1", "hi").await.expect("partial turn");
    assert_eq!(turn.completion, TurnCompletion::Interrupted);
    assert_eq!(turn.id, "msg-1");
    assert_eq!(turn.text(), "half");
    assert!(env.hub.recovery_states().expect("recovery").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn turn_ceiling_kills_the_agent() {
    let env = Env::new().await;
    let config = SupervisorConfig {
        turn_timeout: Duration::from_millis(300),
        ..env.agent(&format!("echo '{INIT}'\nexec sleep 10\n"))
    };
    let supervisor = env.supervisor(config);

    let err = supervisor.start("conv-1", "hi").await.expect_err("timeout");
    assert!(matches!(err, SupervisorError::Timeout(_)));
    let states = env.hub.recovery_states().expect("recovery");
    assert_eq!(states[0].reason, RecoveryReason::Timeout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_cancels_and_second_stop_is_a_no_op() {
    let env = Env::new().await;
    let supervisor = env.supervisor(env.agent("exec sleep 10\n"));

    let running = supervisor.clone();
    let task = tokio::spawn(async move { running.start("conv-1", "hi").await });
    wait_for_pid(&supervisor).await;

    let second = supervisor.start("conv-1", "overlap").await;
    assert!(matches!(second, Err(SupervisorError::AlreadyRunning(_))));

    assert!(supervisor.stop("conv-1"));
    let result = task.await.expect("join");
    assert!(matches!(result, Err(SupervisorError::Cancelled)));
    assert!(!supervisor.stop("conv-1"));

    let states = env.hub.recovery_states().expect("recovery");
    assert_eq!(states[0].reason, RecoveryReason::Cancelled);
    let view = env
        .hub
        .conversation("conv-1", None)
        .await
        .expect("handle")
        .view()
        .await
        .expect("view");
    assert_eq!(view.turns[1].completion, TurnCompletion::Interrupted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_agent_is_flagged_as_hanging() {
    let env = Env::new().await;
    let config = SupervisorConfig {
        hang_probe: Duration::from_millis(100),
        ..env.agent("exec sleep 10\n")
    };
    let supervisor = env.supervisor(config);

    let running = supervisor.clone();
    let task = tokio::spawn(async move { running.start("conv-1", "hi").await });
    wait_for_pid(&supervisor).await;

    let mut hanging = false;
    for _ in 0..100 {
        if supervisor
            .status("conv-1")
            .is_some_and(|status| status.hanging && status.bytes_received == 0)
        {
            hanging = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(hanging);
    assert!(supervisor.status("conv-1").is_some());

    supervisor.stop("conv-1");
    let _ = task.await.expect("join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_settles_live_turns() {
    let env = Env::new().await;
    let supervisor = env.supervisor(env.agent(&format!("echo '{INIT}'\nexec sleep 10\n")));

    let running = supervisor.clone();
    let task = tokio::spawn(async move { running.start("conv-1", "hi").await });
    wait_for_pid(&supervisor).await;

    assert_eq!(supervisor.shutdown().await, 1);
    assert!(supervisor.running().is_empty());
    let result = task.await.expect("join");
    assert!(matches!(result, Err(SupervisorError::Cancelled)));

    let states = env.hub.recovery_states().expect("recovery");
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].reason, RecoveryReason::Shutdown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_failure_fails_the_turn() {
    let env = Env::new().await;
    let config = SupervisorConfig {
        agent_command: vec![env.dir.path().join("missing-agent").to_string_lossy().into_owned()],
        ..SupervisorConfig::default()
    };
    let supervisor = env.supervisor(config);

    let err = supervisor.start("conv-1", "hi").await.expect_err("spawn");
    assert!(matches!(err, SupervisorError::Spawn { .. }));
    assert!(env.hub.recovery_states().expect("recovery").is_empty());

    let view = env
        .hub
        .conversation("conv-1", None)
        .await
        .expect("handle")
        .view()
        .await
        .expect("view");
    assert!(!view.turn_in_flight);
    assert_eq!(view.turns[1].completion, TurnCompletion::Failed);
}
