//! Configuration view and validation commands (`cadence config`).

use anyhow::Result;
use cadence::config::{CADENCE_DIR, CONFIG_FILE, CadenceConfig, CadenceToml};
use console::style;

use super::super::ConfigCommands;

fn print_toml(toml: &CadenceToml) {
    println!("[engine]");
    println!("  max_workers = {}", toml.engine.max_workers);
    println!("  max_conflict_retries = {}", toml.engine.max_conflict_retries);
    println!("  requeue_delay_ms = {}", toml.engine.requeue_delay_ms);
    println!("  max_requeues = {}", toml.engine.max_requeues);
    println!("  event_buffer = {}", toml.engine.event_buffer);
    println!();
    println!("[timeouts]");
    println!("  default = \"{}\"", toml.timeouts.default);
    println!();
    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  json = {}", toml.logging.json);
    if let Some(dir) = &toml.logging.log_dir {
        println!("  log_dir = \"{}\"", dir.display());
    }
    println!();
}

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let cadence_dir = project_dir.join(CADENCE_DIR);
    let config_path = cadence_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Cadence Configuration").bold());
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_toml(&CadenceToml::load(&config_path)?);
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!();
                println!("Using default configuration:");
                print_toml(&CadenceToml::default());
                println!("Run 'cadence config init' to create a {} file.", CONFIG_FILE);
                println!();
            }

            let config = CadenceConfig::new(project_dir.to_path_buf())?;
            println!("Effective values (with env overrides):");
            println!("  max_workers = {}", config.max_workers());
            println!("  logging.level = \"{}\"", config.logging().level);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let warnings = CadenceToml::load(&config_path)?.validate();
            if warnings.is_empty() {
                println!("{}", style("Configuration is valid.").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow().bold());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&cadence_dir)?;
            CadenceToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] max_workers, max_conflict_retries, requeue_delay_ms");
            println!("  - [timeouts] default");
            println!("  - [logging] level, json, log_dir");
            println!();
        }
    }

    Ok(())
}
