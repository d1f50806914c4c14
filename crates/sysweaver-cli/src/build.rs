//! `sysweaver build`: run a template's install scripts in a jail

use crate::preview::Preview;
use crate::scripts::{self, OUTPUT_DIR};
use anyhow::{Context, Result, anyhow, bail};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use sysweaver_core::{Jail, JailError, system};

/// Jail config file looked up inside the template by default.
pub const DEFAULT_CONFIG_NAME: &str = "jail.toml";

/// Options of one build
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub template: PathBuf,
    pub output: PathBuf,
    pub config: Option<PathBuf>,
    pub verbose: bool,
    pub manual: bool,
}

pub fn run(options: &BuildOptions, interrupted: &AtomicBool) -> Result<()> {
    let template = options
        .template
        .canonicalize()
        .with_context(|| format!("template {} not found", options.template.display()))?;
    let config = options
        .config
        .clone()
        .unwrap_or_else(|| template.join(DEFAULT_CONFIG_NAME));

    println!("Building image from template: {}", template.display());
    println!("Using jail config: {}", config.display());
    println!("Output will be saved to: {}", options.output.display());

    system::check_all().context("preflight failed")?;

    let scripts = scripts::install_scripts(&template)?;
    let jail = Jail::from_file(&config, &template)
        .with_context(|| format!("failed to create jail from {}", config.display()))?;
    if options.verbose {
        jail.set_log_sink(std::io::stdout());
    }

    jail.start().context("failed to start jail")?;

    let result = build_in_jail(&jail, &scripts, options, interrupted);

    println!("Cleaning up jail...");
    let stopped = jail.stop();
    if let Some(report) = jail.last_teardown() {
        for warning in &report.warnings {
            eprintln!("Warning: {warning}");
        }
    }

    result?;
    stopped.context("failed to stop jail")?;
    println!("Build completed successfully!");
    Ok(())
}

fn build_in_jail(
    jail: &Jail,
    scripts: &[String],
    options: &BuildOptions,
    interrupted: &AtomicBool,
) -> Result<()> {
    let output_in_jail = jail.chroot_dir().join(OUTPUT_DIR);
    std::fs::create_dir_all(&output_in_jail)
        .with_context(|| format!("failed to create {}", output_in_jail.display()))?;

    println!("Found {} installation scripts", scripts.len());
    for (index, name) in scripts.iter().enumerate() {
        if interrupted.load(Ordering::Relaxed) {
            bail!("interrupted before {name}");
        }

        println!("==============================");
        println!("Executing script [{}/{}]: {name}", index + 1, scripts.len());
        println!("==============================");

        let started = Instant::now();
        let path = scripts::jail_path(name);
        let outcome = if options.verbose {
            println!("--- Live output ---");
            jail.execute_command("/bin/sh", &[path.as_str()]).map(|()| Vec::new())
        } else {
            jail.execute_command_with_output("/bin/sh", &[path.as_str()])
        };
        let seconds = started.elapsed().as_secs_f64();

        match outcome {
            Ok(output) => {
                println!("Script completed successfully in {seconds:.2} seconds");
                print!("{}", Preview::of(&output));
            }
            Err(e) => {
                println!("Script failed ({seconds:.2} seconds): {e}");
                if let Some(output) = e.output().filter(|o| !o.is_empty()) {
                    println!("--- Output begin ---");
                    println!("{}", String::from_utf8_lossy(output).trim_end());
                    println!("--- Output end ---");
                }
                if options.manual {
                    manual_shell(jail, "Entering manual mode for debugging. Type 'exit' to quit.");
                }
                return Err(anyhow!(e).context(format!("install script {name} failed")));
            }
        }
    }
    println!("All installation scripts completed successfully!");

    if options.manual {
        manual_shell(jail, "Entering manual mode. Type 'exit' to quit and continue.");
    }

    println!("Copying build outputs from jail...");
    let copied = scripts::collect_outputs(&output_in_jail, &options.output)?;
    if copied.is_empty() {
        println!("Warning: no output files found in /{OUTPUT_DIR} inside the jail");
    }
    for path in &copied {
        println!("Copied {}", path.display());
    }
    Ok(())
}

fn manual_shell(jail: &Jail, banner: &str) {
    println!("\n{banner}");
    match jail.interactive_shell() {
        Ok(()) | Err(JailError::Execution { .. }) => {}
        Err(e) => eprintln!("Error in interactive shell: {e}"),
    }
    println!("Exited from manual mode.");
}
