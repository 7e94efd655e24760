//! CLI commands implementation

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Task response from API
#[derive(Debug, Deserialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub script_path: String,
    pub script_type: String,
    pub status: String,
    pub requested_gpus: u32,
    pub assigned_gpus: Vec<u32>,
    pub timeout_secs: u64,
    pub submitted_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub exit_code: Option<i32>,
    pub output_head: String,
    pub error_message: Option<String>,
}

/// Submit response from API
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub task_id: Uuid,
}

/// Cancel response from API
#[derive(Debug, Deserialize)]
pub struct CancelResponse {
    #[allow(dead_code)]
    pub task_id: Uuid,
    pub cancelled: bool,
}

/// GPU slot response from API
#[derive(Debug, Deserialize)]
pub struct GpuSlot {
    pub index: u32,
    pub busy: bool,
    pub owner_task: Option<Uuid>,
}

/// Status response from API
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub total_gpus: usize,
    pub available_gpus: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub finished_tasks: usize,
    pub scheduler_running: bool,
    pub idle_interval_secs: u64,
    pub retry_interval_secs: u64,
}

/// Submit a script for execution
pub async fn submit(
    client: &ApiClient,
    script: String,
    gpus: Option<u32>,
    timeout: Option<u64>,
) -> Result<()> {
    // The daemon reads the script from its own filesystem, so send an
    // absolute path when the file resolves locally
    let script_path = std::fs::canonicalize(&script)
        .map(|p| p.display().to_string())
        .unwrap_or(script);

    #[derive(Serialize)]
    struct SubmitRequest {
        script_path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        gpu_count: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    }

    let req = SubmitRequest {
        script_path: script_path.clone(),
        gpu_count: gpus,
        timeout_secs: timeout,
    };

    let response = client
        .client
        .post(client.url("/api/v1/tasks"))
        .json(&req)
        .send()
        .await?;

    if response.status().is_success() {
        let submitted: SubmitResponse = response.json().await?;
        println!("Task submitted");
        println!("  ID: {}", submitted.task_id);
        println!("  Script: {}", script_path);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to submit task: {}", error);
    }

    Ok(())
}

/// Get task status
pub async fn status(client: &ApiClient, task: Uuid) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/api/v1/tasks/{}", task)))
        .send()
        .await?;

    if response.status().is_success() {
        let task: TaskResponse = response.json().await?;
        print_task_details(&task);
    } else {
        let error = response.text().await?;
        eprintln!("Task not found: {}", error);
    }

    Ok(())
}

/// List all tasks
pub async fn ps(client: &ApiClient, status: Option<String>) -> Result<()> {
    let url = match &status {
        Some(filter) => client.url(&format!("/api/v1/tasks?status={}", filter)),
        None => client.url("/api/v1/tasks"),
    };

    let response = client.client.get(url).send().await?;

    if response.status().is_success() {
        let tasks: Vec<TaskResponse> = response.json().await?;

        if tasks.is_empty() {
            println!("No tasks found");
        } else {
            println!(
                "{:<36} {:<28} {:<8} {:<10} {:<10}",
                "ID", "SCRIPT", "TYPE", "STATUS", "GPUS"
            );
            println!("{}", "-".repeat(96));
            for task in tasks {
                let gpus = if task.assigned_gpus.is_empty() {
                    task.requested_gpus.to_string()
                } else {
                    format!("{:?}", task.assigned_gpus)
                };
                println!(
                    "{:<36} {:<28} {:<8} {:<10} {:<10}",
                    task.id,
                    short_name(&task.script_path),
                    task.script_type,
                    task.status,
                    gpus
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list tasks: {}", error);
    }

    Ok(())
}

/// Cancel a task
pub async fn cancel(client: &ApiClient, task: Uuid) -> Result<()> {
    let response = client
        .client
        .post(client.url(&format!("/api/v1/tasks/{}/cancel", task)))
        .send()
        .await?;

    if response.status().is_success() {
        let cancelled: CancelResponse = response.json().await?;
        if cancelled.cancelled {
            println!("Task {} cancelled", task);
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to cancel task: {}", error);
    }

    Ok(())
}

/// Show GPU inventory
pub async fn gpus(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/api/v1/gpus")).send().await?;

    if response.status().is_success() {
        let slots: Vec<GpuSlot> = response.json().await?;

        if slots.is_empty() {
            println!("No GPUs in the inventory");
        } else {
            let free = slots.iter().filter(|s| !s.busy).count();
            println!("GPUs: {} total, {} available", slots.len(), free);
            println!();
            for slot in slots {
                match slot.owner_task {
                    Some(owner) => println!("[{}] busy - task {}", slot.index, owner),
                    None => println!("[{}] free", slot.index),
                }
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get GPU info: {}", error);
    }

    Ok(())
}

/// Show system status
pub async fn top(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("gpulet v{}", status.version);
        println!();
        println!(
            "Tasks: {} pending, {} running, {} finished",
            status.pending_tasks, status.running_tasks, status.finished_tasks
        );
        println!(
            "GPUs: {} total, {} available",
            status.total_gpus, status.available_gpus
        );
        println!(
            "Scheduler: {}",
            if status.scheduler_running {
                "running"
            } else {
                "stopped"
            }
        );
        println!(
            "Intervals: idle {}s, retry {}s",
            status.idle_interval_secs, status.retry_interval_secs
        );
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

/// Helper to trim a script path down to its file name
fn short_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Helper to print task details
fn print_task_details(task: &TaskResponse) {
    println!("Task: {}", task.id);
    println!("  Script: {} ({})", task.script_path, task.script_type);
    println!("  Status: {}", task.status);
    println!(
        "  GPUs: requested {}, assigned {:?}",
        task.requested_gpus, task.assigned_gpus
    );
    println!("  Timeout: {}s", task.timeout_secs);
    println!("  Submitted: {}", task.submitted_at);
    if let Some(started) = &task.started_at {
        println!("  Started: {}", started);
    }
    if let Some(finished) = &task.finished_at {
        println!("  Finished: {}", finished);
    }
    if let Some(code) = task.exit_code {
        println!("  Exit code: {}", code);
    }
    if let Some(error) = &task.error_message {
        println!("  Error: {}", error);
    }
    if !task.output_head.is_empty() {
        println!();
        println!("Output:");
        println!("{}", task.output_head);
    }
}
