//! Command-line interface for autoship.
//!
//! Provides commands for starting runs, following their event logs,
//! checking status, cancelling, and administering stored projects.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config;
use crate::core::{CancelError, Orchestrator, ProjectStore};
use crate::domain::{PipelineEvent, ProjectStatus};

/// How often `run` polls the event log
const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// autoship - plan, build, test and ship generated applications
#[derive(Parser, Debug)]
#[command(name = "autoship")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a run and follow its events until it finishes
    Run {
        /// Natural-language description of the application
        request: String,
    },

    /// Show the status of a project
    Status {
        /// Project ID (UUID)
        project_id: String,
    },

    /// Print a project's event log
    Logs {
        /// Project ID (UUID)
        project_id: String,

        /// Only events with a sequence number greater than this
        #[arg(long, default_value = "0")]
        since: i64,
    },

    /// List recent projects
    Projects {
        /// Maximum number of projects to show
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Number of projects to skip
        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Cancel a running project
    Cancel {
        /// Project ID (UUID)
        project_id: String,
    },

    /// Delete a project and its events
    Delete {
        /// Project ID (UUID)
        project_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { request } => run(&request).await,
            Commands::Status { project_id } => show_status(&project_id).await,
            Commands::Logs { project_id, since } => show_logs(&project_id, since).await,
            Commands::Projects { limit, offset } => list_projects(limit, offset).await,
            Commands::Cancel { project_id } => cancel(&project_id).await,
            Commands::Delete { project_id } => delete(&project_id).await,
            Commands::Config => show_config().await,
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid project ID: {}", raw))
}

fn orchestrator() -> Result<Orchestrator> {
    Orchestrator::from_config(config::config()?)
}

fn store() -> Result<ProjectStore> {
    ProjectStore::open(&config::config()?.database_path)
}

fn print_event(event: &PipelineEvent) {
    println!(
        "{:>5}  {}  {:<12} {:<10} {}",
        event.seq,
        event.created_at.format("%H:%M:%S"),
        event.stage.as_str(),
        event.status.as_str(),
        event.message
    );
}

/// Start a run and stream its events until the project is terminal
async fn run(request: &str) -> Result<()> {
    let orchestrator = orchestrator()?;
    let started = orchestrator.start(request).await?;
    let id = started.project_id;
    eprintln!("[Project {} started]", id);

    let mut cursor = 0;
    let project = loop {
        for event in orchestrator.get_logs_since(id, cursor).await? {
            print_event(&event);
            cursor = event.seq;
        }

        let project = orchestrator
            .store()
            .get_project(id)
            .await?
            .with_context(|| format!("Project not found: {}", id))?;
        if project.status.is_terminal() {
            for event in orchestrator.get_logs_since(id, cursor).await? {
                print_event(&event);
            }
            break project;
        }
        tokio::time::sleep(FOLLOW_INTERVAL).await;
    };

    // Let the run task release its workspace before the process exits
    while orchestrator.is_running(id) {
        tokio::time::sleep(FOLLOW_INTERVAL / 5).await;
    }

    match project.status {
        ProjectStatus::Completed | ProjectStatus::CompletedWithWarnings => {
            if let Some(url) = &project.publish_ref {
                println!("\nPublished: {}", url);
            }
            if let Some(url) = &project.deploy_ref {
                println!("Deployed:  {}", url);
            }
            eprintln!("\n[Project {} finished: {}]", id, project.status);
        }
        status => {
            eprintln!(
                "\n[Project {} {}: {}]",
                id,
                status,
                project.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Show the status of a project
async fn show_status(raw_id: &str) -> Result<()> {
    let id = parse_id(raw_id)?;
    let view = orchestrator()?
        .get_status(id)
        .await?
        .with_context(|| format!("Project not found: {}", id))?;
    let project = &view.project;

    println!("Project ID: {}", project.id);
    println!("Name: {}", project.name);
    println!("Status: {}", project.status);
    println!("Current step: {}", project.current_step);
    println!("Retries: {}", project.retry_count);
    println!("Created: {}", project.created_at);
    println!("Updated: {}", project.updated_at);
    if let Some(result) = &project.test_result {
        println!(
            "Tests: {}/{} passed ({}%)",
            result.counts.passed,
            result.counts.total,
            result.percentage()
        );
    }
    if let Some(url) = &project.publish_ref {
        println!("Published: {}", url);
    }
    if let Some(url) = &project.deploy_ref {
        println!("Deployed: {}", url);
    }
    if let Some(error) = &project.error {
        println!("Error: {}", error);
    }
    if let Some(live) = &view.live {
        println!("Live: {} ({}%)", live.step, live.progress);
    }

    println!("\nStages:");
    for stage in &view.stages {
        match &stage.message {
            Some(message) => {
                println!("  {:<12} {:<10} {}", stage.stage.as_str(), stage.status, message)
            }
            None => println!("  {:<12} {}", stage.stage.as_str(), stage.status),
        }
    }

    Ok(())
}

/// Print the event log after a cursor
async fn show_logs(raw_id: &str, since: i64) -> Result<()> {
    let id = parse_id(raw_id)?;
    let store = store()?;
    if store.get_project(id).await?.is_none() {
        anyhow::bail!("Project not found: {}", id);
    }

    let events = store.events_since(id, since).await?;
    if events.is_empty() {
        println!("No events after {}", since);
        return Ok(());
    }
    for event in &events {
        print_event(event);
    }

    Ok(())
}

/// List recent projects
async fn list_projects(limit: u32, offset: u32) -> Result<()> {
    let projects = store()?.list_projects(limit, offset).await?;

    if projects.is_empty() {
        println!("No projects found");
        return Ok(());
    }

    println!("{:<38} {:<25} {:<30}", "PROJECT ID", "STATUS", "NAME");
    println!("{}", "-".repeat(93));

    for project in projects {
        let name: String = project.name.chars().take(30).collect();
        println!("{:<38} {:<25} {:<30}", project.id, project.status.as_str(), name);
    }

    Ok(())
}

async fn cancel(raw_id: &str) -> Result<()> {
    let id = parse_id(raw_id)?;
    match orchestrator()?.cancel(id).await {
        Ok(()) => {
            println!("Cancelled {}", id);
            Ok(())
        }
        Err(CancelError::Internal(e)) => Err(e),
        Err(e) => anyhow::bail!("{}", e),
    }
}

async fn delete(raw_id: &str) -> Result<()> {
    let id = parse_id(raw_id)?;
    if !store()?.delete_project(id).await? {
        anyhow::bail!("Project not found: {}", id);
    }
    println!("Deleted {}", id);
    Ok(())
}

/// Show resolved configuration (debug)
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("autoship configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Database:   {}", cfg.database_path.display());
    println!("  Workspaces: {}", cfg.sandbox.workspaces_dir.display());
    println!();
    println!("Pipeline:");
    println!("  Test threshold:        {}%", cfg.pipeline.test_threshold);
    println!("  Max retries:           {}", cfg.pipeline.max_retries);
    println!("  Progress grace:        {}s", cfg.pipeline.progress_grace.as_secs());
    println!("  Min request chars:     {}", cfg.pipeline.min_request_chars);
    println!("  Max models/endpoints:  {}/{}", cfg.pipeline.spec_limits.max_models, cfg.pipeline.spec_limits.max_endpoints);
    println!("  Collaborator timeout:  {}s", cfg.pipeline.collaborator_timeout.as_secs());
    println!();
    println!("Sandbox:");
    println!("  Install: {}", cfg.sandbox.install_command.join(" "));
    println!("  Test:    {}", cfg.sandbox.test_command.join(" "));
    println!();
    println!("Collaborators:");
    println!("  Model:     {} ({})", cfg.llm.model, cfg.llm.base_url);
    println!("  API key:   {}", if cfg.llm.api_key.is_some() { "set" } else { "missing" });
    println!("  Publisher: {}", if cfg.publish.github_token.is_some() { "github" } else { "none" });
    let deployer = if cfg.publish.railway_token.is_some() {
        "railway"
    } else if cfg.publish.manual_deploy {
        "manual"
    } else {
        "none"
    };
    println!("  Deployer:  {}", deployer);

    Ok(())
}
