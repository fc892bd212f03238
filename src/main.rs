use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use slate_notes::domain::models::{FileInfo, ProtocolVariant};
use slate_notes::domain::settings::SettingsService;
use slate_notes::domain::strokes;
use slate_notes::infrastructure::logging;
use slate_notes::presentation::SvgRenderer;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Variant {
    Spark,
    Slate,
    IntuosPro,
}

impl From<Variant> for ProtocolVariant {
    fn from(value: Variant) -> Self {
        match value {
            Variant::Spark => ProtocolVariant::Spark,
            Variant::Slate => ProtocolVariant::Slate,
            Variant::IntuosPro => ProtocolVariant::IntuosPro,
        }
    }
}

/// Convert a raw note downloaded from a smartpad into SVG or JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Raw note file as received over the bulk transfer channel
    input: PathBuf,

    /// Where to write the result (stdout if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Device family the note came from
    #[arg(long, value_enum, default_value = "slate")]
    variant: Variant,

    /// Write the decoded strokes as JSON instead of SVG
    #[arg(long)]
    json: bool,

    /// Settings file to use instead of the per-user one
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    let _guard = logging::init_logger(&settings.get().log_settings)?;

    let data = std::fs::read(&cli.input)
        .with_context(|| format!("Failed to read {}", cli.input.display()))?;
    let variant = ProtocolVariant::from(cli.variant);
    let info = FileInfo {
        stroke_count: 0,
        timestamp: Utc::now().timestamp(),
    };

    let drawing = strokes::decode_container(&data, variant, info)
        .with_context(|| format!("Failed to decode {}", cli.input.display()))?;
    info!(
        "Decoded {} stroke(s) from {} bytes",
        drawing.strokes.len(),
        data.len()
    );

    let rendered = if cli.json {
        serde_json::to_string_pretty(&drawing)?
    } else {
        SvgRenderer::new(settings.get().render.clone()).render(&drawing)
    };

    match &cli.output {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => print!("{}", rendered),
    }

    Ok(())
}
