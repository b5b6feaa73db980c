//! Remote aggregation through the distributed workflow CLI.
//!
//! The deployed aggregation job is driven by shelling out to the workflow
//! CLI. The measurement set goes in as an `input.json` file next to the
//! workflow sources, and the statistics come back on stdout, either as a
//! structured JSON line or buried in free-form log output.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::archive::balanced_object_end;
use crate::config::WorkflowConfig;
use crate::measurement::{Measurement, NetworkStatistics};

/// Target name that selects the production deployment.
pub const PRODUCTION_TARGET: &str = "production-settings";

/// Workflow CLI failures.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow tooling unavailable: {0}")]
    Unavailable(String),
    #[error("workflow input error: {0}")]
    Input(String),
    #[error("workflow command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("workflow command exited with {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
}

/// Runs the deployed aggregation job. Both methods return raw stdout.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Run the deployed job against `measurements`.
    async fn trigger(&self, measurements: &[Measurement]) -> Result<String, WorkflowError>;

    /// Simulate the job inside the workflow environment.
    async fn simulate(&self, measurements: &[Measurement]) -> Result<String, WorkflowError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowInput<'a> {
    data_points: &'a [Measurement],
}

#[derive(Deserialize)]
struct StatisticsEnvelope {
    #[serde(default)]
    statistics: Vec<NetworkStatistics>,
}

/// [`WorkflowRunner`] backed by the `cre` command-line tool.
pub struct CreCli {
    program: String,
    project_dir: PathBuf,
    workflow_dir: String,
    target: String,
    timeout: Duration,
    // Invocations share one input file.
    run_lock: Mutex<()>,
}

impl CreCli {
    pub fn new(config: &WorkflowConfig) -> Self {
        CreCli {
            program: config.cli.clone(),
            project_dir: config.project_dir.clone(),
            workflow_dir: config.workflow_dir.clone(),
            target: config.target.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            run_lock: Mutex::new(()),
        }
    }

    fn workflow_path(&self) -> PathBuf {
        self.project_dir.join(&self.workflow_dir)
    }

    /// Fails with [`WorkflowError::Unavailable`] if the CLI cannot be run.
    pub async fn probe(&self) -> Result<(), WorkflowError> {
        let output = self
            .run_command(&["--version"], None)
            .await
            .map_err(|e| WorkflowError::Unavailable(format!("{} --version: {}", self.program, e)))?;
        tracing::debug!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "workflow CLI available"
        );
        Ok(())
    }

    async fn invoke(&self, args: &[&str], measurements: &[Measurement]) -> Result<String, WorkflowError> {
        let _guard = self.run_lock.lock().await;
        self.probe().await?;

        let workflow_path = self.workflow_path();
        if !tokio::fs::try_exists(&workflow_path).await.unwrap_or(false) {
            return Err(WorkflowError::Unavailable(format!(
                "workflow directory not found: {}",
                workflow_path.display()
            )));
        }

        let input_file = workflow_path.join("input.json");
        let input = serde_json::to_vec_pretty(&WorkflowInput {
            data_points: measurements,
        })
        .map_err(|e| WorkflowError::Input(e.to_string()))?;
        tokio::fs::write(&input_file, input)
            .await
            .map_err(|e| WorkflowError::Input(format!("{}: {}", input_file.display(), e)))?;

        // The command runs inside the project dir, so the input path is
        // given relative to it.
        let mut full_args: Vec<&str> = args.to_vec();
        let input_arg = Path::new(&self.workflow_dir)
            .join("input.json")
            .to_string_lossy()
            .into_owned();
        full_args.extend(["--input", input_arg.as_str()]);

        tracing::info!(cli = %self.program, args = ?full_args, target = %self.target, "running workflow command");
        let result = self.run_command(&full_args, Some(self.project_dir.as_path())).await;

        if let Err(e) = tokio::fs::remove_file(&input_file).await {
            tracing::debug!(path = %input_file.display(), error = %e, "failed to remove workflow input");
        }

        let output = result?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_command(&self, args: &[&str], cwd: Option<&Path>) -> Result<Output, WorkflowError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).env("CRE_TARGET", &self.target).kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(WorkflowError::Unavailable(e.to_string())),
            Err(_) => return Err(WorkflowError::TimedOut(self.timeout)),
        };
        if !output.status.success() {
            return Err(WorkflowError::Failed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl WorkflowRunner for CreCli {
    async fn trigger(&self, measurements: &[Measurement]) -> Result<String, WorkflowError> {
        let name = deployed_workflow_name(&self.target);
        self.invoke(&["workflow", "trigger", name], measurements).await
    }

    async fn simulate(&self, measurements: &[Measurement]) -> Result<String, WorkflowError> {
        let dir = self.workflow_dir.clone();
        self.invoke(&["workflow", "simulate", dir.as_str()], measurements).await
    }
}

/// Name of the deployed job for a deployment target.
pub fn deployed_workflow_name(target: &str) -> &'static str {
    if target == PRODUCTION_TARGET {
        "verifi-workflow-production"
    } else {
        "verifi-workflow-staging"
    }
}

/// Extract statistics from workflow stdout.
///
/// The first line starting with `{` or `[` is taken as the structured
/// result: an array of statistics, or an object with a `statistics` array.
/// If no such line parses, the first balanced JSON object anywhere in the
/// output whose top-level keys include `statistics` is used instead.
/// Returns `None` when neither yields a non-empty list.
pub fn parse_workflow_output(stdout: &str) -> Option<Vec<NetworkStatistics>> {
    let structured = stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('{') || line.starts_with('['))
        .and_then(parse_structured_line);

    let statistics = match structured {
        Some(stats) => stats,
        None => scrape_statistics(stdout)?,
    };
    (!statistics.is_empty()).then_some(statistics)
}

fn parse_structured_line(line: &str) -> Option<Vec<NetworkStatistics>> {
    if line.starts_with('[') {
        serde_json::from_str(line).ok()
    } else {
        serde_json::from_str::<StatisticsEnvelope>(line)
            .ok()
            .map(|envelope| envelope.statistics)
    }
}

fn scrape_statistics(output: &str) -> Option<Vec<NetworkStatistics>> {
    let bytes = output.as_bytes();
    let mut pos = 0;
    while let Some(offset) = bytes[pos..].iter().position(|&b| b == b'{') {
        let start = pos + offset;
        let Some(end) = balanced_object_end(bytes, start) else {
            break;
        };
        if let Ok(serde_json::Value::Object(map)) =
            serde_json::from_str::<serde_json::Value>(&output[start..end])
        {
            if let Some(stats) = map.get("statistics") {
                return serde_json::from_value(stats.clone()).ok();
            }
        }
        // A balanced span is never rescanned from its inner braces.
        pos = end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS: &str = r#"{"networkName":"cafe","totalMeasurements":2,"averageSpeed":15.0,"medianSpeed":15.0,"minSpeed":10.0,"maxSpeed":20.0,"speedRange":10.0,"uniqueLocations":[{"lat":1.0,"lon":2.0}],"latestTimestamp":"2025-11-22T14:30:00.000Z"}"#;

    #[test]
    fn structured_object_line() {
        let out = format!("Workflow triggered\n{{\"statistics\":[{STATS}]}}\ndone\n");
        let stats = parse_workflow_output(&out).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].network_name, "cafe");
        assert_eq!(stats[0].average_speed, 15.0);
    }

    #[test]
    fn structured_array_line() {
        let out = format!("  [{STATS}]\n");
        assert_eq!(parse_workflow_output(&out).unwrap().len(), 1);
    }

    #[test]
    fn scrape_finds_statistics_object_in_logs() {
        let out = format!(
            "2025-11-22 INFO step {{\"phase\":\"compute\"}} ok\n[USER LOG] result: {{\"ok\":true,\"statistics\":[{STATS}]}} end"
        );
        let stats = parse_workflow_output(&out).unwrap();
        assert_eq!(stats[0].latest_timestamp, "2025-11-22T14:30:00.000Z");
    }

    #[test]
    fn scrape_ignores_nested_statistics_keys() {
        let out = "log {\"result\":{\"statistics\":[]}} trailing";
        assert_eq!(parse_workflow_output(out), None);
    }

    #[test]
    fn scrape_skips_balanced_garbage_in_one_pass() {
        let garbage = format!("{}{}", "{a".repeat(5000), "}".repeat(5000));
        assert_eq!(parse_workflow_output(&garbage), None);

        let out = format!("{garbage} then {{\"statistics\":[{STATS}]}}");
        let stats = parse_workflow_output(&out).unwrap();
        assert_eq!(stats[0].network_name, "cafe");
    }

    #[test]
    fn empty_or_missing_statistics_is_none() {
        assert_eq!(parse_workflow_output(""), None);
        assert_eq!(parse_workflow_output("simulation finished\n"), None);
        assert_eq!(parse_workflow_output("{\"statistics\":[]}"), None);
        assert_eq!(parse_workflow_output("{\"status\":\"queued\"}"), None);
        assert_eq!(parse_workflow_output("{ unbalanced"), None);
    }

    #[test]
    fn workflow_name_follows_target() {
        assert_eq!(deployed_workflow_name("production-settings"), "verifi-workflow-production");
        assert_eq!(deployed_workflow_name("staging-settings"), "verifi-workflow-staging");
        assert_eq!(deployed_workflow_name("anything"), "verifi-workflow-staging");
    }

    #[tokio::test]
    async fn missing_cli_is_unavailable() {
        let config = WorkflowConfig {
            cli: "verifi-test-no-such-cli".into(),
            ..WorkflowConfig::default()
        };
        let cli = CreCli::new(&config);
        let err = cli.trigger(&[]).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Unavailable(_)), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn trigger_writes_input_and_returns_stdout() {
        use std::os::unix::fs::PermissionsExt;

        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir(project.path().join("verifi-workflow")).unwrap();
        let script = project.path().join("fake-cre");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             if [ \"$1\" = \"--version\" ]; then echo 'cre v0.0.0'; exit 0; fi\n\
             echo \"$2 $3 target=$CRE_TARGET\"\n\
             cat \"$5\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = WorkflowConfig {
            cli: script.to_string_lossy().into_owned(),
            project_dir: project.path().to_path_buf(),
            ..WorkflowConfig::default()
        };
        let cli = CreCli::new(&config);
        let m = Measurement {
            network_name: "cafe".into(),
            speed_mbps: 10.0,
            lat: 1.0,
            lon: 2.0,
            timestamp: "2025-11-22T12:00:00Z".into(),
            reporter_id: "0x1".into(),
            reporter_address: None,
        };

        let stdout = cli.trigger(std::slice::from_ref(&m)).await.unwrap();
        assert!(stdout.starts_with("trigger verifi-workflow-staging target=staging-settings"));
        assert!(stdout.contains("\"dataPoints\""));
        assert!(stdout.contains("\"networkName\": \"cafe\""));
        assert!(!project.path().join("verifi-workflow/input.json").exists());

        let stdout = cli.simulate(&[m]).await.unwrap();
        assert!(stdout.starts_with("simulate verifi-workflow target=staging-settings"));
    }
}
