//! Plan execution (`cadence run`).

use anyhow::{Context, Result, bail};
use cadence::Orchestrator;
use cadence::config::CadenceConfig;
use cadence::engine::OrchestrationEvent;
use cadence::logging::init_tracing;
use cadence::plan::load_plan_file;
use cadence::store::SqliteStore;
use cadence_common::{NodeExecution, PlanExecution, Principal, Status, parse_timeout};
use console::style;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::super::Cli;

pub struct RunOptions {
    pub plan: PathBuf,
    pub setup: Vec<String>,
    pub db: Option<PathBuf>,
    pub wait: String,
    pub json: bool,
}

/// Parse repeated `KEY=VALUE` arguments.
fn parse_setup(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut setup = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Setup value '{}' must look like KEY=VALUE", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Setup value '{}' has an empty key", pair);
        }
        setup.insert(key.to_string(), value.to_string());
    }
    Ok(setup)
}

fn status_style(status: Status) -> console::StyledObject<String> {
    let text = status.to_string();
    if status.is_positive() {
        style(text).green()
    } else if status.is_broken() {
        style(text).red().bold()
    } else if status.is_waiting() || status == Status::Paused {
        style(text).yellow()
    } else {
        style(text).dim()
    }
}

async fn print_events(mut events: broadcast::Receiver<OrchestrationEvent>) {
    loop {
        match events.recv().await {
            Ok(OrchestrationEvent::NodeStatusChanged { node_id, to, .. }) => {
                println!("  {} {}", style(&node_id).cyan(), status_style(to));
            }
            Ok(OrchestrationEvent::AdviseApplied { advise, .. }) => {
                println!("  {} {}", style("advise").dim(), style(advise).dim());
            }
            Ok(OrchestrationEvent::InterruptRegistered {
                interrupt_type,
                applied,
                ..
            }) => {
                let effect = if applied { "applied" } else { "no effect" };
                println!("  {} {} ({})", style("interrupt").magenta(), interrupt_type, effect);
            }
            Ok(OrchestrationEvent::PlanCompleted { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                println!("  {}", style(format!("... {} events skipped", missed)).dim());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_summary(pe: &PlanExecution, nodes: &[NodeExecution]) {
    println!();
    println!(
        "{} {} {}",
        style("Plan execution").bold(),
        style(&pe.uuid).dim(),
        status_style(pe.status)
    );
    for ne in nodes {
        let elapsed = match (ne.start_ts, ne.end_ts) {
            (Some(start), Some(end)) => format!("{}ms", (end - start).num_milliseconds()),
            _ => "-".to_string(),
        };
        let mut line = format!(
            "  {:<24} {:<18} attempt {:<2} {:>8}",
            ne.node_id,
            status_style(ne.effective_status()),
            ne.attempt(),
            elapsed
        );
        if let Some(failure) = &ne.failure_info {
            line.push_str(&format!("  {}", style(&failure.message).red()));
        }
        if ne.retried_by.is_some() {
            line.push_str(&format!("  {}", style("(retried)").dim()));
        }
        println!("{}", line);
    }
    println!();
}

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, options: RunOptions) -> Result<()> {
    let config = CadenceConfig::with_cli_args(project_dir, cli.verbose, cli.max_workers)?;
    let _log_guard = init_tracing(&config.logging())?;

    let plan = load_plan_file(&options.plan)?;
    let setup = parse_setup(&options.setup)?;
    let wait = parse_timeout(&options.wait)
        .with_context(|| format!("Invalid --wait value '{}'", options.wait))?;

    let mut builder = Orchestrator::builder().config(config.engine_config()?);
    if let Some(db) = &options.db {
        let store = SqliteStore::open(db)
            .with_context(|| format!("Failed to open execution database: {}", db.display()))?;
        builder = builder.store(Arc::new(store));
    }
    let orchestrator = builder.build();

    let printer = if options.json {
        None
    } else {
        println!(
            "{} {} ({} nodes)",
            style("Running").bold().cyan(),
            if plan.name.is_empty() { &plan.uuid } else { &plan.name },
            plan.len()
        );
        Some(tokio::spawn(print_events(orchestrator.subscribe())))
    };

    let user = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());
    let started = orchestrator
        .start_plan(Principal::user(user), plan, setup)
        .await?;
    let finished = orchestrator.wait_for_completion(&started.uuid, wait).await;
    if let Some(printer) = printer {
        printer.abort();
    }
    let pe = match finished {
        Ok(pe) => pe,
        Err(e) => {
            orchestrator.shutdown().await;
            return Err(e.into());
        }
    };
    let nodes = orchestrator.node_executions(&pe.uuid).await?;
    orchestrator.shutdown().await;

    if options.json {
        let report = serde_json::json!({
            "plan_execution": pe,
            "node_executions": nodes,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&pe, &nodes);
    }

    if !pe.status.is_positive() {
        bail!("Plan execution {} ended {}", pe.uuid, pe.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setup_pairs() {
        let setup = parse_setup(&["env=prod".to_string(), "tag=a=b".to_string()]).unwrap();
        assert_eq!(setup.get("env").map(String::as_str), Some("prod"));
        assert_eq!(setup.get("tag").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn test_parse_setup_rejects_malformed() {
        assert!(parse_setup(&["novalue".to_string()]).is_err());
        assert!(parse_setup(&["=x".to_string()]).is_err());
    }
}
