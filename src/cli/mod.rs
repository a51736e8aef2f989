use crate::recipes::RunConfig;
use clap::Parser;
use std::path::PathBuf;

/// Train, evaluate, compare and run inference with multimodal tensor models
#[derive(Parser, Debug)]
#[command(name = "mmrecipes")]
#[command(about = "Workflow recipes for multimodal medical tensor models")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Recipe to run (train, test, compare, infer, find_learning_rate, ...)
    #[arg(short, long, default_value = "train")]
    pub mode: String,

    /// Run identifier, names the output subfolder
    #[arg(long, default_value = "no_id")]
    pub id: String,

    /// Folder that receives a subfolder per run id
    #[arg(short, long, default_value = "./recipes_output")]
    pub output_folder: PathBuf,

    /// Directory of per-sample tensor files
    #[arg(short, long, default_value = "./tensors")]
    pub tensors: PathBuf,

    /// CSV whose first column lists the sample ids to use
    #[arg(long)]
    pub sample_csv: Option<PathBuf>,

    /// Id column style of written TSVs; `genetics` writes FID and IID
    #[arg(long, default_value = "standard")]
    pub tsv_style: String,

    /// JSON file of tensor map definitions
    #[arg(long)]
    pub tensor_maps: Option<PathBuf>,

    /// Saved model to load instead of building a new one
    #[arg(long)]
    pub model_file: Option<PathBuf>,

    /// Saved models to compare
    #[arg(long, num_args = 1..)]
    pub model_files: Vec<PathBuf>,

    /// Input tensor map names
    #[arg(short, long, num_args = 1..)]
    pub input_tensors: Vec<String>,

    /// Output tensor map names
    #[arg(long, num_args = 1..)]
    pub output_tensors: Vec<String>,

    /// Tensor maps only used to color embedding plots
    #[arg(long, num_args = 1..)]
    pub protected_tensors: Vec<String>,

    /// Layer whose activations are embedded or inferred
    #[arg(long, default_value = "embed")]
    pub hidden_layer: String,

    /// Batch size
    #[arg(short, long, default_value = "32")]
    pub batch_size: usize,

    /// Number of training epochs
    #[arg(short, long, default_value = "12")]
    pub epochs: usize,

    /// Training batches per epoch
    #[arg(long, default_value = "72")]
    pub training_steps: usize,

    /// Validation batches per epoch
    #[arg(long, default_value = "18")]
    pub validation_steps: usize,

    /// Test batches gathered for evaluation
    #[arg(long, default_value = "32")]
    pub test_steps: usize,

    /// Learning rate
    #[arg(long, default_value = "0.0002")]
    pub learning_rate: f64,

    /// Learning rate schedule (triangular, triangular2, cosine)
    #[arg(long)]
    pub learning_rate_schedule: Option<String>,

    /// Early stopping patience
    #[arg(long, default_value = "8")]
    pub patience: usize,

    /// Keep the last epoch's weights instead of the best ones
    #[arg(long)]
    pub save_last_model: bool,

    /// Dense layer widths after the merge
    #[arg(long, num_args = 0.., default_values_t = [64, 32])]
    pub dense_layers: Vec<usize>,

    /// Width of each input encoder
    #[arg(long, default_value = "32")]
    pub encoder_size: usize,

    /// Dropout rate
    #[arg(long, default_value = "0.0")]
    pub dropout: f64,

    /// Random seed
    #[arg(long, default_value = "2026")]
    pub seed: u64,

    /// Validation ratio
    #[arg(long, default_value = "0.2")]
    pub valid_ratio: f32,

    /// Test ratio
    #[arg(long, default_value = "0.1")]
    pub test_ratio: f32,

    /// Embedding visualization after evaluation (tsne)
    #[arg(long)]
    pub embed_visualization: Option<String>,

    /// Point opacity of embedding plots
    #[arg(long, default_value = "0.5")]
    pub alpha: f32,
}

impl Cli {
    pub fn into_run_config(self) -> RunConfig {
        RunConfig {
            mode: self.mode,
            id: self.id,
            output_folder: self.output_folder,
            tensors: self.tensors,
            sample_csv: self.sample_csv,
            tsv_style: self.tsv_style,
            model_file: self.model_file,
            model_files: self.model_files,
            tensor_maps: self.tensor_maps,
            input_tensors: self.input_tensors,
            output_tensors: self.output_tensors,
            protected_tensors: self.protected_tensors,
            hidden_layer: self.hidden_layer,
            batch_size: self.batch_size,
            epochs: self.epochs,
            training_steps: self.training_steps,
            validation_steps: self.validation_steps,
            test_steps: self.test_steps,
            learning_rate: self.learning_rate,
            learning_rate_schedule: self.learning_rate_schedule,
            patience: self.patience,
            save_last_model: self.save_last_model,
            dense_layers: self.dense_layers,
            encoder_size: self.encoder_size,
            dropout: self.dropout,
            seed: self.seed,
            valid_ratio: self.valid_ratio,
            test_ratio: self.test_ratio,
            embed_visualization: self.embed_visualization,
            alpha: self.alpha,
        }
    }
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity; `RUST_LOG` overrides it
pub fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
