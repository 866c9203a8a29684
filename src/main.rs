use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use omnimod::cli;

#[derive(Parser)]
#[command(name = "omnimod")]
#[command(about = "OmniMod - multimodal embedding fusion and answer grading tools", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade model predictions against ground truth with an LLM judge
    Judge {
        /// JSON file with {image_id, text_question, ground_truth, predict} records
        #[arg(short, long)]
        input: String,

        /// JSON file the graded records are appended to
        #[arg(short, long)]
        output: String,

        /// Chat model used as the judge
        #[arg(short, long, default_value = "gpt-4o-mini")]
        model: String,

        /// OpenAI-compatible API base URL
        #[arg(long, default_value = "https://api.openai.com/v1")]
        base_url: String,

        /// Sampling temperature of the judge
        #[arg(long, default_value = "0.1")]
        temperature: f32,

        /// JSON file holding API keys (defaults to OPENAI_API_KEY)
        #[arg(long)]
        api_key_file: Option<String>,

        /// Entry of the key file to read
        #[arg(long, default_value = "openai")]
        api_key_name: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "omnimod=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Judge {
            input,
            output,
            model,
            base_url,
            temperature,
            api_key_file,
            api_key_name,
        } => {
            let summary = cli::judge(
                input,
                output,
                model,
                base_url,
                temperature,
                api_key_file,
                api_key_name,
            )?;
            println!("{}", summary);
        }
    }

    Ok(())
}
