use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use djvm::analysis;
use djvm::report::{build_invocation, build_sarif};
use djvm::{ClassSource, SandboxConfiguration, SandboxError, SandboxSettings, SourceSet};

/// CLI arguments for djvm execution.
#[derive(Parser, Debug)]
#[command(
    name = "djvm",
    about = "Validate and rewrite JVM classes for deterministic sandboxed execution.",
    version
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a class graph and print the findings as SARIF.
    Validate {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Write the sandboxed form of a class graph.
    Rewrite {
        #[command(flatten)]
        inputs: Inputs,
        #[arg(long, value_name = "DIR")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct Inputs {
    /// Dotted class name; every class in the sources when omitted.
    #[arg(long = "class", value_name = "NAME")]
    classes: Vec<String>,
    /// Directory or JAR; replaces the sources of the settings file.
    #[arg(long = "source", value_name = "PATH")]
    sources: Vec<PathBuf>,
    /// TOML settings file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli)
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Validate { inputs, output } => validate(&inputs, output.as_deref()),
        Command::Rewrite { inputs, output } => rewrite(&inputs, &output),
    }
}

fn validate(inputs: &Inputs, output: Option<&Path>) -> Result<()> {
    let started_at = Instant::now();
    let (configuration, roots) = prepare(inputs)?;
    let context = analysis::discover(&configuration, &roots)?;
    let errors = context.messages.error_count();
    let sarif = build_sarif(&context, build_invocation(errors == 0));

    let mut writer = output_writer(output)?;
    serde_json::to_writer_pretty(&mut writer, &sarif)
        .context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;

    info!(
        total_ms = started_at.elapsed().as_millis() as u64,
        classes = context.classes().len(),
        errors,
        "validation finished"
    );
    if errors > 0 {
        anyhow::bail!("validation found {} error(s)", errors);
    }
    Ok(())
}

fn rewrite(inputs: &Inputs, output: &Path) -> Result<()> {
    let (configuration, roots) = prepare(inputs)?;
    let context = match analysis::validate(&configuration, &roots) {
        Ok(context) => context,
        Err(SandboxError::Validation { messages }) => {
            if !inputs.quiet {
                for message in messages.sorted() {
                    eprintln!("{}", message);
                }
            }
            anyhow::bail!("validation found {} error(s)", messages.error_count());
        }
        Err(error) => return Err(error.into()),
    };

    for class in context.classes() {
        let path = output.join(format!("{}.class", class.sandbox_name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, &class.byte_code.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    if !inputs.quiet {
        eprintln!(
            "rewrote {} class(es) into {}",
            context.classes().len(),
            output.display()
        );
    }
    Ok(())
}

fn prepare(inputs: &Inputs) -> Result<(Arc<SandboxConfiguration>, Vec<ClassSource>)> {
    let settings = match &inputs.config {
        Some(path) => SandboxSettings::load(path)?,
        None => SandboxSettings::default(),
    };
    for entry in &inputs.sources {
        if !entry.exists() {
            anyhow::bail!("source not found: {}", entry.display());
        }
    }
    let mut builder = settings.builder()?;
    let sources = if inputs.sources.is_empty() {
        SourceSet::from_paths(&settings.sources)?
    } else {
        let sources = SourceSet::from_paths(&inputs.sources)?;
        builder = builder.sources(sources.clone());
        sources
    };
    let roots = if inputs.classes.is_empty() {
        sources
            .class_names()?
            .iter()
            .map(|name| ClassSource::from_class_name(&name.replace('/', "."), None))
            .collect()
    } else {
        inputs
            .classes
            .iter()
            .map(|name| ClassSource::from_class_name(name, None))
            .collect()
    };
    Ok((Arc::new(builder.build()), roots))
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}
