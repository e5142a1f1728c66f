//! neural-gauge: run a single prompt against a local model.
//!
//! Loads the configured model, streams the generated pieces to stdout as
//! they are produced, and reports throughput and memory usage at the end.

use std::io::Write;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use neural_gauge::config::{Cli, Config};
use neural_gauge::inference::llama_ffi::StubBackend;
use neural_gauge::inference::sink::StepTiming;
use neural_gauge::{GenerationRequest, SessionManager};

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Logs go to stderr so stdout carries only
    // generated text (or the JSON outcome).
    let filter = if cli.verbose {
        "neural_gauge=debug"
    } else {
        "neural_gauge=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("neural-gauge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration, then apply command-line overrides.
    let mut config = Config::load(&cli.config)?;
    if let Some(model) = cli.model {
        config.model.model_path = model;
    }
    let max_tokens = cli.max_tokens.unwrap_or(config.generation.max_tokens);

    info!(
        model = %config.model.model_path.display(),
        n_ctx = config.model.n_ctx,
        n_batch = config.model.n_batch,
        n_threads = config.model.n_threads,
        max_tokens,
        "Configuration loaded"
    );

    let model_path = config.model.model_path.clone();
    let manager = SessionManager::new(StubBackend::new(), config.model);
    manager
        .load(&model_path)
        .with_context(|| format!("loading {}", model_path.display()))?;

    let report = manager.memory_report();
    info!(
        model_bytes = report.model_bytes,
        context_bytes = report.context_bytes,
        total_mb = report.total_mb(),
        "Memory in use"
    );

    let request = GenerationRequest::new(cli.prompt, max_tokens);
    let stream = !cli.json;
    let mut stdout = std::io::stdout();
    let mut print_piece = |piece: &str, _timing: StepTiming| {
        if stream {
            // A closed stdout only loses the echo; generation carries on.
            let _ = stdout.write_all(piece.as_bytes());
            let _ = stdout.flush();
        }
    };

    let outcome = manager.generate_with(&request, &mut print_piece)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!();
    }

    info!(
        request_id = %outcome.request_id,
        tokens = outcome.tokens_generated,
        stop_reason = ?outcome.stop_reason,
        prefill_ms = outcome.prefill_ms,
        tokens_per_sec = outcome.tokens_per_sec(),
        ram_mb = manager.memory_usage_mb(),
        "Done"
    );

    manager.dispose();

    if let Some(failure) = outcome.failure {
        anyhow::bail!(failure);
    }
    Ok(())
}
