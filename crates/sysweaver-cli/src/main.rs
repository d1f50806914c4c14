//! sysweaver CLI - build OS images from templates inside disposable jails

mod build;
mod preview;
mod scripts;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use sysweaver_core::isolation::JailLayout;
use sysweaver_core::{JailConfig, system::Preflight};

#[derive(Parser)]
#[command(name = "sysweaver")]
#[command(author, version, about = "Build custom Linux images from templates")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a template
    Build {
        /// Template directory
        template: PathBuf,

        /// Output directory for the built image
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Jail config (defaults to <template>/jail.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Open a shell in the jail after the scripts, or on failure
        #[arg(short, long)]
        manual: bool,
    },

    /// Check that this host can run jails
    Check,

    /// Check a template and its jail config without starting anything
    Validate {
        /// Template directory
        template: PathBuf,

        /// Jail config (defaults to <template>/jail.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "sysweaver=debug"
    } else {
        "sysweaver=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    match cli.command {
        Commands::Build {
            template,
            output,
            config,
            manual,
        } => {
            let interrupted = Arc::new(AtomicBool::new(false));
            for signal in [SIGINT, SIGTERM] {
                signal_hook::flag::register(signal, Arc::clone(&interrupted))
                    .context("failed to install signal handler")?;
            }

            let options = build::BuildOptions {
                template,
                output,
                config,
                verbose: cli.verbose,
                manual,
            };
            build::run(&options, &interrupted)
        }

        Commands::Check => {
            let preflight = Preflight::probe();
            println!(
                "CAP_SYS_ADMIN: {}",
                if preflight.sys_admin { "ok" } else { "missing" }
            );
            for (tool, path) in &preflight.tools {
                match path {
                    Some(path) => println!("{tool}: {}", path.display()),
                    None => println!("{tool}: not found"),
                }
            }
            preflight.ensure()?;
            println!("Host is ready.");
            Ok(())
        }

        Commands::Validate { template, config } => {
            let config = config.unwrap_or_else(|| template.join(build::DEFAULT_CONFIG_NAME));
            let mut jail_config = JailConfig::load(&config)?;
            jail_config.template_dir.clone_from(&template);
            jail_config.validate()?;
            jail_config.check_paths_exist()?;

            let layout = JailLayout::new(&jail_config);
            if !layout.scripts_source().is_dir() {
                anyhow::bail!("template has no {} directory", layout.scripts_source().display());
            }
            let scripts = scripts::install_scripts(&template)?;
            println!("Template {} is valid", template.display());
            for name in &scripts {
                println!("  {}", scripts::jail_path(name));
            }
            Ok(())
        }
    }
}
