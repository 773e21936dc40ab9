//! Plan checking without execution (`cadence validate`).

use anyhow::Result;
use cadence::plan::{declared_children, load_plan_file};
use console::style;
use std::path::Path;

pub fn cmd_validate(plan_path: &Path) -> Result<()> {
    let plan = match load_plan_file(plan_path) {
        Ok(plan) => plan,
        Err(e) => {
            println!("{} {:#}", style("Invalid:").red().bold(), e);
            return Err(e);
        }
    };

    println!(
        "{} {} ({} nodes, root '{}')",
        style("Valid:").green().bold(),
        if plan.name.is_empty() { &plan.uuid } else { &plan.name },
        plan.len(),
        plan.root_node_id
    );
    for node in &plan.nodes {
        let children = declared_children(node);
        let mut line = format!("  {} {}", style(&node.uuid).cyan(), style(&node.step_type).dim());
        if !node.facilitators.is_empty() {
            let modes: Vec<&str> = node.facilitators.iter().map(|m| m.as_str()).collect();
            line.push_str(&format!(" [{}]", modes.join(", ")));
        }
        if !children.is_empty() {
            line.push_str(&format!(" -> {}", children.join(", ")));
        }
        if let Some(timeout) = &node.timeout {
            line.push_str(&format!(" (timeout {})", timeout.duration));
        }
        println!("{}", line);
    }
    Ok(())
}
