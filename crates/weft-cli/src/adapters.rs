//! Collaborators for running `weft` from a shell.
//!
//! - `FilePlanDecomposer`: plans are JSON task lists under `plans_dir`
//! - `CommandExecutor`: each executor is a shell command that gets the
//!   `ExecutionRequest` as JSON on stdin and reports through its exit code

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use weft_core::TaskSpec;
use weft_core::domain::{ErrorClass, ExecutionOutcome, Outputs};
use weft_core::ports::{
    Decomposer, DecompositionError, ExecutionRequest, Executor, PlanningContext,
};

/// Reads `<plans_dir>/<project>.json`.
///
/// After the n-th revise, `<project>.r<n>.json` is preferred when it exists.
#[derive(Debug, Clone)]
pub struct FilePlanDecomposer {
    plans_dir: PathBuf,
}

impl FilePlanDecomposer {
    pub fn new(plans_dir: impl Into<PathBuf>) -> Self {
        Self {
            plans_dir: plans_dir.into(),
        }
    }

    fn plan_path(&self, ctx: &PlanningContext) -> PathBuf {
        let revision = ctx.feedback.len();
        if revision > 0 {
            let revised = self
                .plans_dir
                .join(format!("{}.r{revision}.json", ctx.project));
            if revised.exists() {
                return revised;
            }
        }
        self.plans_dir.join(format!("{}.json", ctx.project))
    }
}

#[async_trait]
impl Decomposer for FilePlanDecomposer {
    async fn decompose(
        &self,
        goal: &str,
        ctx: &PlanningContext,
    ) -> Result<Vec<TaskSpec>, DecompositionError> {
        let path = self.plan_path(ctx);
        info!(job_id = %ctx.job_id, goal, plan = %path.display(), "reading plan");
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            DecompositionError::Malformed(format!("reading {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| DecompositionError::Malformed(format!("parsing {}: {e}", path.display())))
    }
}

pub const EXIT_TRANSIENT: i32 = 75;
pub const EXIT_SCHEMA_MISMATCH: i32 = 65;
pub const EXIT_MISSING_INPUT: i32 = 66;
pub const EXIT_INVALID_CONFIG: i32 = 78;

/// Asked when a command exits with `EXIT_MISSING_INPUT` but prints nothing.
pub const UNSTATED_QUESTION: &str = "the executor needs more input but did not say what";

/// Maps a non-zero exit code to an error class.
///
/// For `EXIT_MISSING_INPUT` the question is the trimmed stderr, or
/// `UNSTATED_QUESTION` when stderr is empty.
pub fn classify_exit(code: Option<i32>, stderr: &str) -> ErrorClass {
    match code {
        Some(EXIT_TRANSIENT) => ErrorClass::Unavailable,
        Some(EXIT_SCHEMA_MISMATCH) => ErrorClass::SchemaMismatch,
        Some(EXIT_MISSING_INPUT) => ErrorClass::MissingInput {
            question: match stderr.trim() {
                "" => UNSTATED_QUESTION.to_string(),
                text => text.to_string(),
            },
        },
        Some(EXIT_INVALID_CONFIG) => ErrorClass::InvalidConfig,
        // killed by a signal
        None => ErrorClass::Unavailable,
        Some(_) => ErrorClass::Internal,
    }
}

/// Executor identity → shell command.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    commands: BTreeMap<String, String>,
}

impl CommandExecutor {
    pub fn new(commands: BTreeMap<String, String>) -> Self {
        Self { commands }
    }

    async fn run(&self, command: &str, request: &ExecutionRequest) -> std::io::Result<ExecutionOutcome> {
        let input = serde_json::to_vec(request).map_err(std::io::Error::other)?;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // the command may exit without reading its input
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "executor did not read stdin");
            }
        }

        let (stdout, stderr) = tokio::join!(
            read_all(child.stdout.take()),
            read_all(child.stderr.take())
        );
        let (stdout, stderr) = (stdout?, stderr?);
        let status = child.wait().await?;

        if status.success() {
            return Ok(parse_outputs(&stdout));
        }
        let class = classify_exit(status.code(), &stderr);
        let message = match stderr.trim() {
            "" => format!("command exited with {status}"),
            text => text.to_string(),
        };
        Ok(ExecutionOutcome::failure(class, message))
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<String> {
    let mut text = String::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_string(&mut text).await?;
    }
    Ok(text)
}

fn parse_outputs(stdout: &str) -> ExecutionOutcome {
    if stdout.trim().is_empty() {
        return ExecutionOutcome::success(Outputs::new());
    }
    match serde_json::from_str::<Outputs>(stdout.trim()) {
        Ok(outputs) => ExecutionOutcome::success(outputs),
        Err(e) => ExecutionOutcome::failure(
            ErrorClass::SchemaMismatch,
            format!("stdout is not a JSON object of outputs: {e}"),
        ),
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, request: &ExecutionRequest, timeout: Duration) -> ExecutionOutcome {
        let Some(command) = self.commands.get(request.executor.as_str()) else {
            return ExecutionOutcome::failure(
                ErrorClass::InvalidConfig,
                format!("no command configured for executor '{}'", request.executor),
            );
        };
        info!(
            job_id = %request.job_id,
            task_id = %request.task.id,
            executor = %request.executor,
            attempt = request.attempt,
            "running executor command"
        );
        match tokio::time::timeout(timeout, self.run(command, request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(executor = %request.executor, error = %e, "executor command failed to run");
                ExecutionOutcome::failure(ErrorClass::Unavailable, e.to_string())
            }
            Err(_) => ExecutionOutcome::failure(
                ErrorClass::Timeout,
                format!("command ran longer than {}s", timeout.as_secs()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use weft_core::domain::{ExecutorId, JobId};

    fn request(executor: &str) -> ExecutionRequest {
        ExecutionRequest {
            job_id: "job-01J9Z3QK8W0000000000000000".parse::<JobId>().unwrap(),
            run_id: None,
            goal: "g".into(),
            project: "p".into(),
            task: TaskSpec::new("a", &[]),
            executor: ExecutorId::new(executor),
            attempt: 1,
            upstream_outputs: BTreeMap::new(),
            human_inputs: Vec::new(),
        }
    }

    fn executor(command: &str) -> CommandExecutor {
        CommandExecutor::new(BTreeMap::from([("general".to_string(), command.to_string())]))
    }

    #[rstest]
    #[case::transient(Some(75), "", ErrorClass::Unavailable)]
    #[case::schema(Some(65), "", ErrorClass::SchemaMismatch)]
    #[case::config(Some(78), "", ErrorClass::InvalidConfig)]
    #[case::signal(None, "", ErrorClass::Unavailable)]
    #[case::other(Some(1), "boom", ErrorClass::Internal)]
    #[case::question(Some(66), " Which region?\n", ErrorClass::MissingInput { question: "Which region?".into() })]
    #[case::silent_question(Some(66), "  \n", ErrorClass::MissingInput { question: UNSTATED_QUESTION.into() })]
    fn exit_codes(#[case] code: Option<i32>, #[case] stderr: &str, #[case] expected: ErrorClass) {
        assert_eq!(classify_exit(code, stderr), expected);
    }

    #[tokio::test]
    async fn stdout_json_becomes_outputs() {
        let outcome = executor(r#"cat > /dev/null; echo '{"report": "done"}'"#)
            .execute(&request("general"), Duration::from_secs(10))
            .await;
        match outcome {
            ExecutionOutcome::Success { outputs } => {
                assert_eq!(outputs.get("report"), Some(&serde_json::json!("done")));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_is_passed_on_stdin() {
        let outcome = executor(r#"grep -q '"attempt":1' && echo '{}'"#)
            .execute(&request("general"), Duration::from_secs(10))
            .await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn missing_input_exit_carries_question() {
        let outcome = executor("echo 'Which region?' >&2; exit 66")
            .execute(&request("general"), Duration::from_secs(10))
            .await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Failure { class: ErrorClass::MissingInput { ref question }, .. }
                if question == "Which region?"
        ));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let outcome = executor("sleep 5")
            .execute(&request("general"), Duration::from_millis(100))
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Failure { class: ErrorClass::Timeout, .. }));
    }

    #[tokio::test]
    async fn unknown_executor_is_a_config_error() {
        let outcome = executor("true")
            .execute(&request("coder"), Duration::from_secs(1))
            .await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Failure { class: ErrorClass::InvalidConfig, .. }
        ));
    }

    #[tokio::test]
    async fn revised_plan_file_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("p.json"),
            r#"[{"id": "a", "deps": []}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("p.r1.json"),
            r#"[{"id": "a", "deps": []}, {"id": "b", "deps": ["a"]}]"#,
        )
        .unwrap();
        let decomposer = FilePlanDecomposer::new(dir.path());
        let mut ctx = PlanningContext {
            job_id: "job-01J9Z3QK8W0000000000000000".parse().unwrap(),
            project: "p".into(),
            feedback: Vec::new(),
            previous_plan: Vec::new(),
            attempt: 1,
        };

        assert_eq!(decomposer.decompose("g", &ctx).await.unwrap().len(), 1);
        ctx.feedback.push("add b".into());
        assert_eq!(decomposer.decompose("g", &ctx).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_plan_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let decomposer = FilePlanDecomposer::new(dir.path());
        let ctx = PlanningContext {
            job_id: "job-01J9Z3QK8W0000000000000000".parse().unwrap(),
            project: "nothing".into(),
            feedback: Vec::new(),
            previous_plan: Vec::new(),
            attempt: 1,
        };
        assert!(matches!(
            decomposer.decompose("g", &ctx).await,
            Err(DecompositionError::Malformed(_))
        ));
    }
}
