use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use otu_query::app::App;
use otu_query::config::ConfigLoader;
use otu_query::error::OtuError;
use otu_query::filter::OtuQueryParams;
use otu_query::output::JsonOutput;
use otu_query::query::SortSpec;
use otu_query::request::QueryRequest;

#[derive(Parser)]
#[command(name = "otu-query")]
#[command(about = "Filtered OTU/sample queries and BIOM export over an amplicon database")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Describe a query and the loaded dataset")]
    Describe(ParamsArgs),
    #[command(about = "Next taxonomy level to choose and its options")]
    Options(OptionsArgs),
    #[command(about = "List matching samples")]
    Samples(SamplesArgs),
    #[command(about = "List matching OTUs")]
    Otus(OtusArgs),
    #[command(about = "Write a zipped BIOM export")]
    Export(ExportArgs),
    #[command(about = "Generate a BIOM export in memory and report its size")]
    Bench(ParamsArgs),
}

#[derive(Args, Clone)]
struct ParamsArgs {
    /// JSON query request; an empty query when omitted.
    #[arg(long)]
    params: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct OptionsArgs {
    #[command(flatten)]
    params: ParamsArgs,

    #[arg(long)]
    force_cache: bool,
}

#[derive(Args, Clone)]
struct SamplesArgs {
    #[command(flatten)]
    params: ParamsArgs,

    #[arg(long = "header")]
    headers: Vec<String>,

    /// Sort by column index; prefix with `-` for descending, e.g. `-2`.
    #[arg(long = "sort", allow_hyphen_values = true)]
    sort: Vec<String>,
}

#[derive(Args, Clone)]
struct OtusArgs {
    #[command(flatten)]
    params: ParamsArgs,

    #[arg(long)]
    kingdom: Option<i64>,
}

#[derive(Args, Clone)]
struct ExportArgs {
    #[command(flatten)]
    params: ParamsArgs,

    #[arg(long)]
    dir: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<OtuError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &OtuError) -> u8 {
    match error {
        OtuError::MissingConfig | OtuError::ConfigRead(_) | OtuError::ConfigParse(_) => 2,
        OtuError::UnknownField(_)
        | OtuError::TermType { .. }
        | OtuError::UnknownOperator(_)
        | OtuError::UnknownMode(_)
        | OtuError::InvalidSort { .. }
        | OtuError::InvalidRequest(_)
        | OtuError::InvalidTaxonomyState(_) => 2,
        OtuError::Database(_) | OtuError::MissingMetadata(_) | OtuError::OntologyNotFound { .. } => {
            3
        }
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = App::new(config)?;

    match cli.command {
        Commands::Describe(args) => {
            let params = load_params(&app, &args)?;
            JsonOutput::print_describe(&app.describe(&params)?).into_diagnostic()
        }
        Commands::Options(args) => {
            let params = load_params(&app, &args.params)?;
            JsonOutput::print_options(&app.options(&params, args.force_cache)?).into_diagnostic()
        }
        Commands::Samples(args) => {
            let params = load_params(&app, &args.params)?;
            let sorting = args
                .sort
                .iter()
                .map(|spec| parse_sort(spec))
                .collect::<miette::Result<Vec<_>>>()?;
            JsonOutput::print_samples(&app.samples(&params, &args.headers, &sorting)?)
                .into_diagnostic()
        }
        Commands::Otus(args) => {
            let params = load_params(&app, &args.params)?;
            JsonOutput::print_otus(&app.otus(&params, args.kingdom)?).into_diagnostic()
        }
        Commands::Export(args) => {
            let params = load_params(&app, &args.params)?;
            JsonOutput::print_export(&app.export(&params, args.dir)?).into_diagnostic()
        }
        Commands::Bench(args) => {
            let params = load_params(&app, &args)?;
            let result = app.bench(&params)?;
            eprintln!("BIOM output complete, total size={}", result.bytes);
            JsonOutput::print_bench(&result).into_diagnostic()
        }
    }
}

fn load_params(app: &App, args: &ParamsArgs) -> miette::Result<OtuQueryParams> {
    let request = match &args.params {
        Some(path) => QueryRequest::from_path(path)?,
        None => QueryRequest::default(),
    };
    Ok(app.params(request)?)
}

fn parse_sort(spec: &str) -> miette::Result<SortSpec> {
    let (desc, index) = match spec.strip_prefix('-') {
        Some(index) => (true, index),
        None => (false, spec),
    };
    let col_idx = index
        .parse::<usize>()
        .map_err(|_| miette::Report::msg(format!("invalid sort column: {spec}")))?;
    Ok(SortSpec { col_idx, desc })
}
