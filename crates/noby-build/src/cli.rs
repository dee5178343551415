//! noby CLI.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use noby_common::{LayerKey, NobyPaths, TagName};
use noby_store::BackendKind;

use crate::build::{BuildOptions, StepOutcome};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::env::parse_overrides;
use crate::nobyfile::{BuildPlan, DEFAULT_FILE};

/// noby - layered filesystem image builder
#[derive(Parser)]
#[command(name = "noby")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for noby data
    #[arg(long, global = true, env = "NOBY_ROOT", default_value = "/var/lib/noby")]
    pub root: PathBuf,

    /// Snapshot backend (auto, btrfs, directory)
    #[arg(long, global = true, env = "NOBY_BACKEND")]
    pub backend: Option<BackendKind>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// noby commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Build an image from a build file
    Build {
        /// Build file, relative to the context directory
        #[arg(short, long, default_value = DEFAULT_FILE)]
        file: PathBuf,

        /// Tag for the final layer
        #[arg(short, long)]
        tag: Option<TagName>,

        /// Environment override (NAME=VALUE, or NAME to pass it through)
        #[arg(short = 'e', long = "env", value_name = "NAME=VALUE")]
        env: Vec<String>,

        /// Kill commands running longer than this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Build context directory
        path: PathBuf,
    },

    /// Run a command in a throwaway snapshot of an image
    Run {
        /// Tag or layer key
        tag: String,

        /// Command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// List tags
    Tags,

    /// Point a tag at a layer
    Tag {
        /// Tag to set
        tag: TagName,

        /// Tag or layer key to point at
        reference: String,
    },

    /// Remove a tag
    Untag {
        /// Tag to remove
        tag: TagName,
    },

    /// List layers
    Layers,

    /// Delete an unreferenced layer
    Rmi {
        /// Layer key
        key: LayerKey,
    },

    /// Delete layers no tag keeps alive
    Gc,

    /// Delete every layer and tag
    Wipe {
        /// Don't ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

impl Cli {
    /// Engine configuration from the store's `config.toml` and global flags.
    pub fn config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::load(NobyPaths::with_root(&self.root))?;
        if let Some(backend) = self.backend {
            config = config.with_backend(backend);
        }
        Ok(config)
    }

    /// Execute the CLI command.
    pub async fn execute(self) -> Result<ExitCode> {
        let mut config = self.config()?;

        match self.command {
            Commands::Build {
                file,
                tag,
                env,
                timeout,
                path,
            } => {
                if timeout.is_some() {
                    config = config.with_exec_timeout(timeout);
                }
                let plan = BuildPlan::load(&path, &file)?;
                let overrides = parse_overrides(&env)?;
                let engine = Engine::open(&config)?;

                let options = BuildOptions::default();
                let abort = options.abort_handle();
                let watcher = tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("Interrupted, stopping after the current instruction");
                        abort.store(true, Ordering::SeqCst);
                    }
                });

                let result = engine
                    .build(&plan, &path, &overrides, tag.as_ref(), options)
                    .await;
                watcher.abort();
                let report = result?;

                for step in &report.steps {
                    let marker = match step.outcome {
                        StepOutcome::Cached => "cached",
                        StepOutcome::Built => "built ",
                    };
                    println!("[{marker}] {} {}", step.key.short(), step.instruction);
                }

                match &report.final_key {
                    Some(key) => {
                        println!();
                        println!("Build complete!");
                        println!("  Layer:   {key}");
                        if let Some(tag) = &report.tag {
                            println!("  Tag:     {tag}");
                        }
                        println!(
                            "  Layers:  {} reused, {} created",
                            report.reused(),
                            report.created()
                        );
                    }
                    None => println!("Nothing to do"),
                }

                Ok(ExitCode::SUCCESS)
            }

            Commands::Run { tag, command } => {
                let engine = Engine::open(&config)?;
                let outcome = engine.run(&tag, &shell_command(&command)).await?;

                print!("{}", outcome.stdout);
                eprint!("{}", outcome.stderr);
                io::stdout().flush()?;

                Ok(exit_code(outcome.exit_code))
            }

            Commands::Tags => {
                let engine = Engine::open(&config)?;
                let tags = engine.list_tags()?;

                if tags.is_empty() {
                    println!("No tags");
                    return Ok(ExitCode::SUCCESS);
                }

                for (tag, key) in tags {
                    println!("{tag}\t{key}");
                }
                Ok(ExitCode::SUCCESS)
            }

            Commands::Tag { tag, reference } => {
                let engine = Engine::open(&config)?;
                let key = engine.tag(&tag, &reference).await?;
                println!("Tagged {} as {tag}", key.short());
                Ok(ExitCode::SUCCESS)
            }

            Commands::Untag { tag } => {
                let engine = Engine::open(&config)?;
                let key = engine.untag(&tag).await?;
                println!("Untagged {tag} (was {})", key.short());
                Ok(ExitCode::SUCCESS)
            }

            Commands::Layers => {
                let engine = Engine::open(&config)?;
                let layers = engine.list_layers()?;

                if layers.is_empty() {
                    println!("No layers");
                    return Ok(ExitCode::SUCCESS);
                }

                for layer in layers {
                    println!(
                        "{}  {:<16}  {}  {}",
                        layer.key.short(),
                        layer.parent.as_ref().map_or("scratch", LayerKey::short),
                        layer.created.format("%Y-%m-%d %H:%M:%S"),
                        layer.instruction
                    );
                }
                Ok(ExitCode::SUCCESS)
            }

            Commands::Rmi { key } => {
                let engine = Engine::open(&config)?;
                engine.delete_layer(&key).await?;
                println!("Deleted {}", key.short());
                Ok(ExitCode::SUCCESS)
            }

            Commands::Gc => {
                let engine = Engine::open(&config)?;
                let removed = engine.collect_garbage().await?;
                for key in &removed {
                    println!("Deleted {}", key.short());
                }
                println!("Removed {} layer(s)", removed.len());
                Ok(ExitCode::SUCCESS)
            }

            Commands::Wipe { yes } => {
                if !yes {
                    println!(
                        "This will delete every layer and tag under {}.",
                        config.paths.root.display()
                    );
                    print!("Continue? [y/N] ");
                    io::stdout().flush()?;

                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;

                    if !input.trim().eq_ignore_ascii_case("y") {
                        println!("Aborted");
                        return Ok(ExitCode::FAILURE);
                    }
                }

                let engine = Engine::open(&config)?;
                engine.wipe().await?;
                println!("Store wiped");
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

/// Command line for `noby run`.
///
/// A single argument is a shell command line and is passed as is; several
/// arguments are an argv and each is quoted for the shell.
fn shell_command(args: &[String]) -> String {
    if let [line] = args {
        return line.clone();
    }
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Exit status of `noby run`: the command's own, or 129 when it had none.
fn exit_code(code: Option<i32>) -> ExitCode {
    match code.map(u8::try_from) {
        Some(Ok(code)) => ExitCode::from(code),
        _ => ExitCode::from(129),
    }
}
