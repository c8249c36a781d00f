use console::style;
use dialoguer::{Input, Select};
use std::fs;
use std::path::PathBuf;

use crate::config::generate::generate_starter_config;
use crate::config::{default_user_config_path, load_config};

/// `querytail config init`: write the starter config, or print it with `--stdout`
pub fn init(stdout: bool, output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    let path = output
        .or_else(default_user_config_path)
        .unwrap_or_else(|| PathBuf::from("/etc/querytail/config.yml"));

    write_config(&config_content, path)
}

fn write_config(config_content: &str, mut path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        if path.exists() {
            eprintln!("File already exists at {}", path.display());

            let options = &["Overwrite", "Choose a different path", "Print to stdout instead"];
            match prompt_choice(options)? {
                0 => {}
                2 => {
                    print!("{}", config_content);
                    return Ok(());
                }
                _ => {
                    path = prompt_path(&path)?;
                    continue;
                }
            }
        }

        let result = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
        .and_then(|_| fs::write(&path, config_content));

        match result {
            Ok(()) => {
                println!("Config file written to {}", style(path.display()).green());
                return Ok(());
            }
            Err(e) => {
                eprintln!("Cannot write to {}: {}", path.display(), e);

                let options = &["Choose a different path", "Print to stdout instead"];
                if prompt_choice(options)? == 1 {
                    print!("{}", config_content);
                    return Ok(());
                }
                path = prompt_path(&path)?;
            }
        }
    }
}

fn prompt_choice(options: &[&str]) -> Result<usize, dialoguer::Error> {
    Select::new()
        .with_prompt("What would you like to do?")
        .items(options)
        .default(0)
        .interact()
}

fn prompt_path(current: &std::path::Path) -> Result<PathBuf, dialoguer::Error> {
    let path_str: String = Input::new()
        .with_prompt("Config file path")
        .default(current.display().to_string())
        .interact_text()?;
    Ok(PathBuf::from(path_str))
}

/// `querytail config validate`
pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    match load_config(&path) {
        Ok(config) => {
            println!("{}", style("✓ Config is valid").green());
            for (source_id, source) in &config.sources {
                println!(
                    "  {} -> {} ({} file(s))",
                    source_id,
                    source.destination,
                    source.remote_files.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", style(format!("✗ Config validation failed:\n{}", e)).red());
            std::process::exit(1);
        }
    }
}
