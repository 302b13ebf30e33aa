use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use single_diffexp::data::{ExpressionMatrix, Grouping, SampleDescription};
use single_diffexp::de::{self, GeneSummary, LrtSpec, PairwiseTest, TwoSampleTest, WaldSpec};
use single_diffexp::TestConfig;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::process;

#[derive(Parser)]
#[command(
    name = "diffexp",
    about = "Differential expression tests on single-cell count tables",
    long_about = "Runs per-gene differential expression tests on a cells x genes count table \
                 annotated by a per-cell sample description, and writes one summary row per gene."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// Cells x genes CSV; first column holds cell ids, the header holds gene names
    #[arg(long, value_name = "CSV")]
    counts: String,

    /// Per-cell annotations; first column holds cell ids in the order of the counts
    #[arg(long, value_name = "CSV")]
    obs: String,

    /// Annotation columns to read as numbers
    #[arg(long, value_delimiter = ',', value_name = "COLS")]
    numeric: Vec<String>,

    /// TOML run configuration
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Output CSV; written to stdout when absent
    #[arg(long, short, value_name = "FILE")]
    output: Option<String>,

    /// Only report genes with a q-value below this threshold
    #[arg(long, value_name = "Q")]
    qval_thres: Option<f64>,

    /// Worker threads (overrides the configuration)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum TwoSampleChoice {
    TTest,
    Rank,
    Wald,
    Lrt,
}

impl From<TwoSampleChoice> for TwoSampleTest {
    fn from(choice: TwoSampleChoice) -> Self {
        match choice {
            TwoSampleChoice::TTest => TwoSampleTest::TTest,
            TwoSampleChoice::Rank => TwoSampleTest::Rank,
            TwoSampleChoice::Wald => TwoSampleTest::Wald,
            TwoSampleChoice::Lrt => TwoSampleTest::Lrt,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PairwiseChoice {
    ZTest,
    TTest,
    Rank,
    Wald,
    Lrt,
}

impl From<PairwiseChoice> for PairwiseTest {
    fn from(choice: PairwiseChoice) -> Self {
        match choice {
            PairwiseChoice::ZTest => PairwiseTest::ZTest,
            PairwiseChoice::TTest => PairwiseTest::TTest,
            PairwiseChoice::Rank => PairwiseTest::Rank,
            PairwiseChoice::Wald => PairwiseTest::Wald,
            PairwiseChoice::Lrt => PairwiseTest::Lrt,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the two groups of one annotation column
    TwoSample {
        #[command(flatten)]
        common: CommonArgs,

        /// Annotation column with exactly two groups
        #[arg(long)]
        grouping: String,

        #[arg(long, value_enum, default_value = "t-test")]
        test: TwoSampleChoice,
    },

    /// Compare every pair of groups
    Pairwise {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long)]
        grouping: String,

        #[arg(long, value_enum, default_value = "z-test")]
        test: PairwiseChoice,
    },

    /// Compare every group against all other cells
    VersusRest {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long)]
        grouping: String,

        #[arg(long, value_enum, default_value = "t-test")]
        test: TwoSampleChoice,
    },

    /// Wald test of a factor in a negative binomial model
    Wald {
        #[command(flatten)]
        common: CommonArgs,

        /// Location model, e.g. "~ 1 + condition"
        #[arg(long)]
        formula: String,

        /// Factor whose coefficients are tested
        #[arg(long)]
        factor: String,
    },

    /// Likelihood ratio test between two nested models
    Lrt {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long)]
        full: String,

        #[arg(long)]
        reduced: String,
    },
}

impl Commands {
    fn common(&self) -> &CommonArgs {
        match self {
            Commands::TwoSample { common, .. }
            | Commands::Pairwise { common, .. }
            | Commands::VersusRest { common, .. }
            | Commands::Wald { common, .. }
            | Commands::Lrt { common, .. } => common,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.command.common().verbose);

    if let Err(e) = run(&cli.command) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn run(command: &Commands) -> anyhow::Result<()> {
    let common = command.common();
    let config = load_config(common)?;
    let (data, description) = load_inputs(common)?;

    let rows = match command {
        Commands::TwoSample { grouping, test, .. } => {
            let grouping = Grouping::from_description(&description, grouping)?;
            de::two_sample(&data, &grouping, (*test).into(), &config)?
                .summary_threshold(common.qval_thres, None, None, None)
        }
        Commands::Pairwise { grouping, test, .. } => {
            let grouping = Grouping::from_description(&description, grouping)?;
            de::pairwise(&data, &grouping, (*test).into(), &config)?
                .summary_threshold(common.qval_thres, None, None, None)
        }
        Commands::VersusRest { grouping, test, .. } => {
            let grouping = Grouping::from_description(&description, grouping)?;
            de::versus_rest(&data, &grouping, (*test).into(), &config)?
                .summary_threshold(common.qval_thres, None, None, None)
        }
        Commands::Wald { formula, factor, .. } => {
            let spec = WaldSpec::factor(&description, formula, factor);
            de::wald(&data, &spec, &config)?.summary_threshold(common.qval_thres, None, None, None)
        }
        Commands::Lrt { full, reduced, .. } => {
            let spec = LrtSpec::new(&description, full, reduced);
            de::lrt(&data, &spec, &config)?.summary_threshold(common.qval_thres, None, None, None)
        }
    };

    info!("writing {} genes", rows.len());
    write_rows(&rows, common.output.as_deref())
}

fn load_config(common: &CommonArgs) -> anyhow::Result<TestConfig> {
    let mut config = match &common.config {
        Some(path) => TestConfig::from_file(path).with_context(|| format!("failed to load configuration {}", path))?,
        None => TestConfig::default(),
    };
    if let Some(n) = common.threads {
        config = config.with_threads(n);
        config.validate()?;
    }
    Ok(config)
}

fn load_inputs(common: &CommonArgs) -> anyhow::Result<(ExpressionMatrix, SampleDescription)> {
    let counts = File::open(&common.counts).with_context(|| format!("failed to open {}", common.counts))?;
    let (cell_ids, data) = ExpressionMatrix::from_csv_reader(BufReader::new(counts))
        .with_context(|| format!("failed to read counts from {}", common.counts))?;

    let numeric: Vec<&str> = common.numeric.iter().map(|s| s.as_str()).collect();
    let obs = File::open(&common.obs).with_context(|| format!("failed to open {}", common.obs))?;
    let (obs_ids, description) = SampleDescription::from_csv_reader(BufReader::new(obs), &numeric)
        .with_context(|| format!("failed to read annotations from {}", common.obs))?;

    if obs_ids.len() != cell_ids.len() {
        anyhow::bail!(
            "counts have {} cells but annotations have {} rows",
            cell_ids.len(),
            obs_ids.len()
        );
    }
    if let Some(row) = cell_ids.iter().zip(&obs_ids).position(|(a, b)| a != b) {
        anyhow::bail!(
            "cell ids differ at row {}: '{}' in counts, '{}' in annotations",
            row + 1,
            cell_ids[row],
            obs_ids[row]
        );
    }

    info!(
        "loaded {} cells x {} genes with {} annotation columns",
        data.n_cells(),
        data.n_genes(),
        description.column_names().len()
    );
    Ok((data, description))
}

fn write_rows(rows: &[GeneSummary], output: Option<&str>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("failed to create {}", path))?;
            let mut writer = BufWriter::new(file);
            de::write_summary_csv(rows, &mut writer)?;
            writer.flush()?;
        }
        None => {
            let stdout = io::stdout();
            de::write_summary_csv(rows, stdout.lock())?;
        }
    }
    Ok(())
}
