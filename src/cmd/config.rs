//! Configuration view and validation commands: `colloquy config`.

use std::path::Path;

use anyhow::{Context, Result};
use colloquy::config::{CONFIG_DIR, CONFIG_FILE, ColloquyConfig, ColloquyToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let colloquy_dir = project_dir.join(CONFIG_DIR);
    let config_path = colloquy_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Colloquy Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No colloquy.toml found at {}", config_path.display());
                println!("Using defaults. Run 'colloquy config init' to create one.");
            }
            println!();

            // Effective values include environment overrides.
            let mut effective = ColloquyToml::load_or_default(&colloquy_dir)?;
            let env_warnings = effective.apply_env_with(|key| std::env::var(key).ok());
            let rendered = toml::to_string_pretty(&effective).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();
            for warning in env_warnings {
                println!("warning: {}", warning);
            }

            let config = ColloquyConfig::new(project_dir.to_path_buf())?;
            let key_state = if config.search_api_key().is_some() { "set" } else { "not set" };
            println!(
                "Search API key (${}): {}",
                config.toml.search.api_key_env, key_state
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No colloquy.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ColloquyToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("colloquy.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&colloquy_dir)
                .with_context(|| format!("Failed to create {}", colloquy_dir.display()))?;
            ColloquyToml::default().save(&config_path)?;

            println!("Created colloquy.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [model] command, args, timeout_secs");
            println!("  - [dialogue] perspectives, rounds, perspective_labels");
            println!("  - [charts] max_attempts, execution_timeout_secs");
            println!();
        }
    }

    Ok(())
}
