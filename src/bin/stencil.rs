//! stencil command line interface
//!
//! # Usage
//!
//! ```bash
//! # Compile a template and print its bytecode
//! stencil compile templates/page.tpl --level maximum
//!
//! # Render a template against a JSON context
//! stencil render templates/page.tpl --context '{"user": {"name": "ada"}}'
//! ```
//!
//! Referenced templates (`extends`, `include`, `import`) are resolved
//! relative to the directory of the given file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use stencil::{telemetry, Engine, EngineConfig, OptimizationLevel, RenderContext};

#[derive(Parser)]
#[command(name = "stencil")]
#[command(version)]
#[command(about = "Compile templates to bytecode and render them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file
    #[arg(long, short, global = true, env = "STENCIL_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a template and print the disassembled bytecode
    Compile {
        file: PathBuf,

        /// Optimization level: none, basic, advanced, maximum
        #[arg(long, short)]
        level: Option<OptimizationLevel>,

        #[arg(long, short = 'o', default_value = "text", value_enum)]
        format: OutputFormat,
    },

    /// Render a template against a JSON context
    Render {
        file: PathBuf,

        /// Context as a JSON object
        #[arg(long, default_value = "{}")]
        context: String,

        /// Optimization level: none, basic, advanced, maximum
        #[arg(long, short)]
        level: Option<OptimizationLevel>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile {
            file,
            level,
            format,
        } => cmd_compile(cli.config.as_deref(), &file, level, format).await,
        Commands::Render {
            file,
            context,
            level,
        } => cmd_render(cli.config.as_deref(), &file, &context, level).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Engine rooted at the file's directory; returns it with the file's
/// template path.
async fn open(
    config: Option<&Path>,
    file: &Path,
    level: Option<OptimizationLevel>,
) -> Result<(Engine, String)> {
    let mut config = match config {
        Some(path) => EngineConfig::from_file(path)?,
        None => {
            let mut config = EngineConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    if let Some(level) = level {
        config.compiler.optimization_level = level;
    }
    config.templates_root = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("not a template file: {}", file.display()))?
        .to_string();

    let engine = Engine::new(config).await?;
    engine.load_template(&name).await?;
    Ok((engine, name))
}

async fn cmd_compile(
    config: Option<&Path>,
    file: &Path,
    level: Option<OptimizationLevel>,
    format: OutputFormat,
) -> Result<()> {
    let (engine, name) = open(config, file, level).await?;
    let compiled = engine
        .compiled(&name)
        .await
        .with_context(|| format!("compiling {}", file.display()))?;
    match format {
        OutputFormat::Text => {
            let meta = &compiled.metadata;
            println!("; {} ({} -> {})", meta.template_path, meta.optimization_level, meta.effective_level);
            println!("; key {}", meta.cache_key);
            for pass in &meta.passes_applied {
                println!("; pass {}", pass.name);
            }
            print!("{}", compiled.bytecode.disassemble());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(compiled.as_ref())?);
        }
    }
    Ok(())
}

async fn cmd_render(
    config: Option<&Path>,
    file: &Path,
    context: &str,
    level: Option<OptimizationLevel>,
) -> Result<()> {
    let json: serde_json::Value = serde_json::from_str(context).context("parsing --context")?;
    anyhow::ensure!(json.is_object(), "--context must be a JSON object");
    let (engine, name) = open(config, file, level).await?;
    let output = engine
        .render(&name, &RenderContext::from_json(&json))
        .await
        .with_context(|| format!("rendering {}", file.display()))?;
    print!("{output}");
    Ok(())
}
