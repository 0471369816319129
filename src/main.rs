use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use std::path::PathBuf;
use std::process::ExitCode;

use modeloci::archive::ArchiveReader;
use modeloci::error::ErrorCategory;
use modeloci::notifier::init_logging;
use modeloci::{
    manifest, ArchiveError, ModelConfig, ModelPacker, ModelUnpacker, Notifier, PackOptions,
};
use oci_spec::image::MediaType;

#[derive(Parser)]
#[command(author, version, about = "OCI-style content-addressed archives for model directories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Package a model directory into a tar archive next to it
    Pack {
        #[arg(long, help = "Directory containing the model files")]
        model_dir: PathBuf,

        #[arg(long, help = "Model name")]
        name: String,

        #[arg(long = "version", help = "Model version")]
        model_version: String,

        #[arg(long, default_value = "pytorch", help = "ML framework (e.g. pytorch, tensorflow, onnx)")]
        framework: String,

        #[arg(long, default_value = "transformer", help = "Model architecture description")]
        architecture: String,

        #[arg(long, default_value = "{}", help = "Extra metadata as a JSON object")]
        metadata: String,

        #[arg(long, help = "Worker threads for layer construction [default: available cores]")]
        jobs: Option<usize>,

        #[arg(long, help = "Per-file size ceiling in bytes [default: 4 GiB]")]
        max_file_size: Option<u64>,

        #[arg(long, value_parser = clap::value_parser!(u32).range(0..=9), help = "gzip level 0-9 [default: 6]")]
        compression_level: Option<u32>,

        #[arg(long = "media-type", value_name = "TITLE=TYPE", value_parser = parse_media_type, help = "Override the media type of one layer")]
        media_types: Vec<(String, String)>,
    },
    /// Unpack an archive into a directory
    Unpack {
        #[arg(long, help = "Path to the archive")]
        archive: PathBuf,

        #[arg(long, help = "Directory to unpack into")]
        output: PathBuf,
    },
    /// Show config and layers, and verify every layer digest
    Inspect {
        #[arg(long, help = "Path to the archive")]
        archive: PathBuf,
    },
    /// Store one more file as a layer blob in an existing archive
    AddLayer {
        #[arg(long, help = "Path to the archive")]
        archive: PathBuf,

        #[arg(long, help = "File to add")]
        file: PathBuf,

        #[arg(long, help = "Layer media type [default: tar+gzip layer]")]
        media_type: Option<String>,

        #[arg(long, help = "Also rewrite manifest.json so it references the new layer")]
        rebuild_manifest: bool,
    },
}

fn parse_media_type(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((title, media_type)) if !title.is_empty() && !media_type.is_empty() => {
            Ok((title.to_string(), media_type.to_string()))
        }
        _ => Err(format!("expected TITLE=TYPE, got '{}'", raw)),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose.into());
    debug!("Beautiful progress: {}", cli.verbose == 0);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<ArchiveError>().map(ArchiveError::category) {
        Some(ErrorCategory::Input) => 2,
        Some(ErrorCategory::Format) => 3,
        Some(ErrorCategory::Security) => 4,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Pack {
            model_dir,
            name,
            model_version,
            framework,
            architecture,
            metadata,
            jobs,
            max_file_size,
            compression_level,
            media_types,
        } => {
            let metadata = match serde_json::from_str::<serde_json::Value>(&metadata) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => {
                    eprintln!("Error: invalid JSON for --metadata: expected an object");
                    return Ok(ExitCode::from(2));
                }
                Err(e) => {
                    eprintln!("Error: invalid JSON for --metadata: {}", e);
                    return Ok(ExitCode::from(2));
                }
            };

            let mut options = PackOptions::default();
            if let Some(jobs) = jobs {
                options.jobs = jobs;
            }
            if let Some(limit) = max_file_size {
                options.max_file_size = limit;
            }
            if let Some(level) = compression_level {
                options.compression_level = level;
            }
            options.media_types.extend(media_types);

            info!("Packing {} as {}-{}", model_dir.display(), name, model_version);
            let config = ModelConfig::new(&name, &model_version, &framework, &architecture)
                .with_metadata(metadata);
            let packer = ModelPacker::new(Notifier::new(cli.verbose)).with_options(options);
            let archive = packer.pack(&model_dir, &config)?;

            println!("Packaged model: {}", archive.display());
            println!("  Name        : {}", name);
            println!("  Version     : {}", model_version);
            println!("  Framework   : {}", framework);
            println!("  Archive     : {}", archive.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Unpack { archive, output } => {
            let unpacker = ModelUnpacker::new(Notifier::new(cli.verbose));
            let config = unpacker.unpack(&archive, &output)?;

            println!("Unpacked to: {}", output.display());
            println!("  Model    : {} v{}", config.model_name, config.version);
            println!("  Framework: {}", config.framework);
            Ok(ExitCode::SUCCESS)
        }
        Command::Inspect { archive } => {
            let unpacker = ModelUnpacker::new(Notifier::new(cli.verbose));
            let inspection = unpacker.inspect(&archive)?;

            if let Some(config) = &inspection.config {
                println!("Model    : {}", config.model_name);
                println!("Version  : {}", config.version);
                println!("Framework: {}", config.framework);
                println!("Arch     : {}", config.architecture);
                if !config.metadata.is_empty() {
                    println!("Metadata : {}", serde_json::to_string(&config.metadata)?);
                }
            }

            let layers = inspection.manifest.layers();
            println!("\nLayers ({}):", layers.len());
            for layer in layers {
                let title = modeloci::layer::layer_title(layer).unwrap_or("(unknown)");
                let digest = layer.digest().to_string();
                println!(
                    "  {:<40}  {:6.1} KB  {}...",
                    title,
                    layer.size() as f64 / 1024.0,
                    truncate(&digest, 23)
                );
            }

            println!(
                "\nLayer verification ({} layers):",
                inspection.verification.len()
            );
            for verdict in &inspection.verification {
                let status = if verdict.valid { "OK" } else { "FAIL" };
                println!("  {}  {}...", status, truncate(&verdict.digest.to_string(), 30));
            }
            if inspection.all_valid() {
                println!("All layers verified.");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("WARNING: some layers failed verification!");
                Ok(ExitCode::from(1))
            }
        }
        Command::AddLayer {
            archive,
            file,
            media_type,
            rebuild_manifest,
        } => {
            let packer = ModelPacker::new(Notifier::new(cli.verbose));
            let media_type = media_type
                .as_deref()
                .map(MediaType::from)
                .unwrap_or(MediaType::ImageLayerGzip);
            let descriptor = packer.add_layer_as(&archive, &file, media_type)?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);

            if rebuild_manifest {
                let current = ArchiveReader::open(&archive)?.manifest()?;
                if current.layers().iter().any(|l| l.digest() == descriptor.digest()) {
                    info!("Manifest already references {}", descriptor.digest());
                } else {
                    let extended = manifest::extend_manifest(&current, vec![descriptor])?;
                    packer
                        .replace_manifest(&archive, &extended)
                        .with_context(|| format!("rebuilding manifest of {}", archive.display()))?;
                    println!("Manifest rebuilt: {} layers", extended.layers().len());
                }
            } else {
                println!("Manifest unchanged; pass --rebuild-manifest to reference the new layer.");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn truncate(s: &str, n: usize) -> &str {
    s.get(..n).unwrap_or(s)
}
