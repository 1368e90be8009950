//! Glyph CLI: OCR inference server, client, and weight archive tools.

mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use glyph_archive::ConvertOutcome;
use glyph_core::Config;
use glyph_daemon::{Client, ClientError};

/// Timeout for status and shutdown calls. These never wait on the
/// inference queue, so anything slow means the server is gone.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Image extensions the batch command picks up.
const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp", "gif"];

fn init_tracing() {
    let filter = EnvFilter::try_from_env("GLYPH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    init_tracing();

    let cli = cli::Cli::parse();
    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("glyph: {e}");
            return ExitCode::FAILURE;
        }
    };

    match &cli.command {
        cli::Command::Serve { .. } => run_serve(&config),
        cli::Command::Ocr { image, output } => run_ocr(&config, image, output),
        cli::Command::Batch { dir, output } => run_batch(&config, dir, output),
        cli::Command::Status => run_status(&config),
        cli::Command::Shutdown => run_shutdown(&config),
        cli::Command::Convert { .. } => run_convert(&config),
    }
}

fn run_serve(config: &Config) -> ExitCode {
    info!(endpoint = %config.endpoint(), model_dir = %config.model_dir.display(), "starting server");

    // the inference path uses block_in_place, which needs the
    // multi-thread runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!(%e, "failed to build tokio runtime");
            eprintln!("runtime error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(glyph_daemon::run(config)) {
        Ok(()) => {
            info!("server shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            warn!(%e, "server error");
            eprintln!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_ocr(config: &Config, image: &Path, output: &Path) -> ExitCode {
    let client = Client::from_config(config);
    match client.ocr(image, output) {
        Ok(reply) => {
            println!(
                "Recognized {} in {:.2}s",
                image.display(),
                reply.processing_time
            );
            println!("Results saved to {}", reply.save_path);
            ExitCode::SUCCESS
        }
        Err(e) => {
            report_client_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn run_batch(config: &Config, dir: &Path, output: &Path) -> ExitCode {
    let probe = Client::from_config(config).with_timeout(PROBE_TIMEOUT);
    if !probe.is_server_running() {
        eprintln!(
            "glyph: no server at {} (start one with `glyph serve`)",
            config.endpoint()
        );
        return ExitCode::FAILURE;
    }
    let client = Client::from_config(config);

    let images = match collect_images(dir) {
        Ok(images) => images,
        Err(e) => {
            eprintln!("glyph: cannot read {}: {e}", dir.display());
            return ExitCode::FAILURE;
        }
    };
    if images.is_empty() {
        println!("No supported images in {}", dir.display());
        return ExitCode::SUCCESS;
    }

    let mut failed = 0usize;
    for image in &images {
        debug!(image = %image.display(), "batch ocr");
        match client.ocr(image, output) {
            Ok(reply) => println!(
                "  {} ({:.2}s) -> {}",
                image.display(),
                reply.processing_time,
                reply.save_path
            ),
            Err(e) => {
                failed += 1;
                eprintln!("  {} failed: {e}", image.display());
            }
        }
    }

    println!("Processed {}/{} image(s)", images.len() - failed, images.len());
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_status(config: &Config) -> ExitCode {
    let client = Client::from_config(config).with_timeout(PROBE_TIMEOUT);
    match client.status() {
        Ok(status) => {
            println!("Server running at {}:{}", status.host, status.port);
            println!(
                "Model loaded: {}",
                if status.model_loaded { "yes" } else { "no" }
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            debug!(%e, "status probe failed");
            println!("No server running at {}", config.endpoint());
            ExitCode::FAILURE
        }
    }
}

fn run_shutdown(config: &Config) -> ExitCode {
    let client = Client::from_config(config).with_timeout(PROBE_TIMEOUT);
    match client.shutdown() {
        Ok(reply) => {
            println!("{}", reply.message);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("glyph: shutdown failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_convert(config: &Config) -> ExitCode {
    let archives = match glyph_archive::find_archives(&config.model_dir) {
        Ok(archives) => archives,
        Err(e) => {
            eprintln!("glyph: cannot scan {}: {e}", config.model_dir.display());
            return ExitCode::FAILURE;
        }
    };
    if archives.is_empty() {
        println!("No archives in {}", config.model_dir.display());
        return ExitCode::SUCCESS;
    }

    let mut failures = 0usize;
    for path in &archives {
        // header-only probe first, so archives without BF16 are never
        // fully read
        match glyph_archive::has_bf16(path) {
            Ok(false) => {
                println!("  {}: no BF16 tensors, skipped", path.display());
                continue;
            }
            Ok(true) => {}
            Err(e) => {
                failures += 1;
                eprintln!("  {}: {e}", path.display());
                continue;
            }
        }

        match glyph_archive::widen_archive(path) {
            Ok(ConvertOutcome::Converted { widened }) => {
                println!("  {}: widened {widened} tensor(s)", path.display());
            }
            Ok(ConvertOutcome::NoBf16) => {
                println!("  {}: no BF16 tensors, skipped", path.display());
            }
            Ok(ConvertOutcome::BackupExists) => {
                println!(
                    "  {}: backup already present, refusing to convert again",
                    path.display()
                );
            }
            Err(e) => {
                failures += 1;
                eprintln!("  {}: {e}", path.display());
            }
        }
    }

    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn report_client_error(e: &ClientError) {
    match e {
        ClientError::Rejected { error, details } => {
            eprintln!("glyph: server rejected request: {error}");
            if let Some(details) = details {
                eprintln!("  {details}");
            }
        }
        ClientError::Io(_) => {
            eprintln!("glyph: cannot reach server: {e} (is one running? try `glyph serve`)");
        }
        _ => eprintln!("glyph: {e}"),
    }
}

fn collect_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let supported = path.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SUPPORTED_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(ext)));
        if supported {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}
