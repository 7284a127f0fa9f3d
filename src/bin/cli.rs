//! Thin HTTP client for the Capstan service.
//!
//! Exit codes: 0 success, 1 user error (bad arguments, unknown id),
//! 2 server unreachable, 3 server-reported failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use url::Url;

#[derive(Parser)]
#[command(name = "capstan", version, about = "Fire-and-forget agentic task runner")]
struct Cli {
    /// Server base URL.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8179")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a task.
    Run {
        /// The execution prompt for the agent.
        prompt: String,
        /// Working directory the agent runs in (absolute path).
        #[arg(long)]
        dir: String,
        /// Optional system prompt.
        #[arg(long)]
        system_prompt: Option<String>,
        /// Model tier: fast, balanced, or deep.
        #[arg(long)]
        tier: Option<String>,
        /// Block until the task is terminal, tailing the summary log.
        #[arg(long)]
        watch: bool,
    },
    /// Show one task.
    Status { task_id: i64 },
    /// List all tasks.
    List,
    /// Cancel a task.
    Cancel { task_id: i64 },
    /// Print a task's logs.
    Logs {
        task_id: i64,
        /// Print the detailed log instead of the summary log.
        #[arg(long)]
        detailed: bool,
        /// Only the last N lines.
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Submit a batch of tasks with dependencies from a JSON file.
    Orchestrate {
        /// Path to a JSON file: {"tasks": [{"task_identifier": ..., ...}]}
        file: PathBuf,
    },
    /// Show one orchestration with its member tasks.
    OrchestrationStatus { orch_id: i64 },
    /// List all orchestrations.
    ListOrchestrations,
}

enum CliError {
    User(String),
    Unreachable(String),
    Server(String),
}

impl CliError {
    fn report(&self) -> ExitCode {
        match self {
            Self::User(message) => {
                eprintln!("error: {message}");
                ExitCode::from(1)
            }
            Self::Unreachable(message) => {
                eprintln!("error: server unreachable: {message}");
                ExitCode::from(2)
            }
            Self::Server(message) => {
                eprintln!("error: server reported failure: {message}");
                ExitCode::from(3)
            }
        }
    }
}

struct Client {
    base: Url,
    http: reqwest::Client,
}

impl Client {
    fn new(server: &str) -> Result<Self, CliError> {
        let base = Url::parse(server)
            .map_err(|e| CliError::User(format!("invalid server URL {server:?}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CliError::Unreachable(e.to_string()))?;
        Ok(Self { base, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, CliError> {
        self.base
            .join(path)
            .map_err(|e| CliError::User(format!("bad path {path:?}: {e}")))
    }

    async fn get(&self, path: &str) -> Result<Value, CliError> {
        let response = self
            .http
            .get(self.endpoint(path)?)
            .send()
            .await
            .map_err(|e| CliError::Unreachable(e.to_string()))?;
        Self::decode(response).await
    }

    async fn get_text(&self, path: &str) -> Result<String, CliError> {
        let response = self
            .http
            .get(self.endpoint(path)?)
            .send()
            .await
            .map_err(|e| CliError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::status_error(
                response.status(),
                response.text().await.unwrap_or_default(),
            ));
        }
        response
            .text()
            .await
            .map_err(|e| CliError::Unreachable(e.to_string()))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, CliError> {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(&body)
            .send()
            .await
            .map_err(|e| CliError::Unreachable(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value, CliError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CliError::Unreachable(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::status_error(status, text));
        }
        serde_json::from_str(&text)
            .map_err(|e| CliError::Server(format!("malformed response: {e}")))
    }

    fn status_error(status: reqwest::StatusCode, body: String) -> CliError {
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                let error = v.get("error")?.as_str()?.to_string();
                Some(match v.get("field").and_then(|f| f.as_str()) {
                    Some(field) => format!("{field}: {error}"),
                    None => error,
                })
            })
            .unwrap_or_else(|| format!("HTTP {status}"));
        if status.is_client_error() {
            CliError::User(message)
        } else {
            CliError::Server(message)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => e.report(),
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let client = Client::new(&cli.server)?;
    match cli.command {
        Command::Run {
            prompt,
            dir,
            system_prompt,
            tier,
            watch,
        } => {
            let mut body = json!({
                "execution_prompt": prompt,
                "working_dir": dir,
            });
            if let Some(system_prompt) = system_prompt {
                body["system_prompt"] = json!(system_prompt);
            }
            if let Some(tier) = tier {
                body["model_tier"] = json!(tier);
            }
            let created = client.post("/tasks", body).await?;
            let task_id = created["task_id"].as_i64().unwrap_or_default();
            println!("task {task_id} submitted");
            if watch {
                return watch_task(&client, task_id).await;
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Status { task_id } => {
            let task = client.get(&format!("/tasks/{task_id}")).await?;
            print_task(&task, true);
            Ok(ExitCode::SUCCESS)
        }

        Command::List => {
            let tasks = client.get("/tasks").await?;
            for task in tasks.as_array().into_iter().flatten() {
                print_task(task, false);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Cancel { task_id } => {
            let result = client
                .post(&format!("/tasks/{task_id}/cancel"), json!({}))
                .await?;
            println!(
                "task {task_id} is now {}",
                result["status"].as_str().unwrap_or("unknown")
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::Logs {
            task_id,
            detailed,
            tail,
        } => {
            let mut path = format!("/tasks/{task_id}/logs?detailed={detailed}");
            if let Some(tail) = tail {
                path.push_str(&format!("&tail={tail}"));
            }
            let content = client.get_text(&path).await?;
            print!("{content}");
            Ok(ExitCode::SUCCESS)
        }

        Command::Orchestrate { file } => {
            let raw = std::fs::read_to_string(&file)
                .map_err(|e| CliError::User(format!("cannot read {}: {e}", file.display())))?;
            let body: Value = serde_json::from_str(&raw)
                .map_err(|e| CliError::User(format!("invalid JSON in {}: {e}", file.display())))?;
            let created = client.post("/orchestrations", body).await?;
            println!(
                "orchestration {} submitted",
                created["orchestration_id"].as_i64().unwrap_or_default()
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::OrchestrationStatus { orch_id } => {
            let orch = client.get(&format!("/orchestrations/{orch_id}")).await?;
            print_orchestration(&orch);
            for task in orch["tasks"].as_array().into_iter().flatten() {
                print!("  ");
                print_task(task, false);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::ListOrchestrations => {
            let orchs = client.get("/orchestrations").await?;
            for orch in orchs.as_array().into_iter().flatten() {
                print_orchestration(orch);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Poll until the task is terminal, printing new summary-log lines as they
/// appear.
async fn watch_task(client: &Client, task_id: i64) -> Result<ExitCode, CliError> {
    let mut printed_lines = 0usize;
    loop {
        let log = client
            .get_text(&format!("/tasks/{task_id}/logs?detailed=false"))
            .await
            .unwrap_or_default();
        for line in log.lines().skip(printed_lines) {
            println!("{line}");
            printed_lines += 1;
        }

        let task = client.get(&format!("/tasks/{task_id}")).await?;
        let status = task["status"].as_str().unwrap_or("unknown");
        if matches!(status, "completed" | "failed" | "skipped" | "cancelled") {
            return match status {
                "completed" => {
                    if let Some(summary) = task["final_summary"].as_str() {
                        println!("{summary}");
                    }
                    Ok(ExitCode::SUCCESS)
                }
                _ => Err(CliError::Server(
                    task["error_message"]
                        .as_str()
                        .unwrap_or("task did not complete")
                        .to_string(),
                )),
            };
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

fn print_task(task: &Value, verbose: bool) {
    println!(
        "task {} [{}] tier={} dir={}",
        task["task_id"],
        task["status"].as_str().unwrap_or("?"),
        task["model_tier"].as_str().unwrap_or("?"),
        task["working_dir"].as_str().unwrap_or("?"),
    );
    if let Some(action) = task["last_action"].as_str() {
        println!("  last action: {action}");
    }
    if verbose {
        if let Some(summary) = task["final_summary"].as_str() {
            println!("  summary: {summary}");
        }
        if let Some(error) = task["error_message"].as_str() {
            println!("  error: {error}");
        }
        if let Some(path) = task["summary_log_path"].as_str() {
            println!("  summary log: {path}");
        }
    }
}

fn print_orchestration(orch: &Value) {
    println!(
        "orchestration {} [{}] total={} completed={} failed={} skipped={}",
        orch["orchestration_id"],
        orch["status"].as_str().unwrap_or("?"),
        orch["total_tasks"],
        orch["completed_tasks"],
        orch["failed_tasks"],
        orch["skipped_tasks"],
    );
}
