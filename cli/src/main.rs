//! Agencygraph CLI: build, sync and upload against a relationship service
//!
//! `build` works offline from a JSON record dump; `sync` and `upload` talk to
//! the service through the library's HTTP transport.

use agencygraph::{
    EngineConfig, FetchPipeline, HierarchyGraph, HierarchySync, HierarchyView, HttpTransport,
    RelationQuery, RelationRecord, RelationStatus, StaticCredentials, TraversalState, UploadFile,
    UploadJob, UploadJobMonitor, VisibleSet,
};
use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const ACCOUNT: &str = "default";

#[derive(Parser)]
#[command(name = "agencygraph", version, about = "Agency hierarchy sync and inspection")]
struct Cli {
    /// YAML engine config
    #[arg(long, global = true, env = "AGENCYGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Service base URL (overrides the config)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, clap::ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(clap::Args)]
struct ViewArgs {
    /// Expand every node down to this depth
    #[arg(long, default_value_t = 1)]
    expand_depth: usize,

    /// Show only the subtree under this producer
    #[arg(long)]
    scope: Option<String>,

    /// Show every child instead of one page
    #[arg(long)]
    all_children: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a hierarchy from a JSON record file
    Build {
        /// Array of relation records, or an object with a `data` array
        #[arg(long)]
        input: PathBuf,

        #[command(flatten)]
        view: ViewArgs,
    },
    /// Fetch a firm's relations from the service and build its hierarchy
    Sync {
        #[arg(long)]
        firm: String,

        /// Only relations added on or after this date
        #[arg(long)]
        since: Option<String>,

        /// Only relations added before this date
        #[arg(long)]
        until: Option<String>,

        /// active, inactive or pending
        #[arg(long)]
        status: Option<String>,

        /// Bearer token for the service
        #[arg(long, env = "AGENCYGRAPH_TOKEN", hide_env_values = true)]
        token: String,

        #[command(flatten)]
        view: ViewArgs,
    },
    /// Upload a roster file and follow the import job
    Upload {
        file: PathBuf,

        #[arg(long, env = "AGENCYGRAPH_TOKEN", hide_env_values = true)]
        token: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordFile {
    Flat(Vec<RelationRecord>),
    Wrapped { data: Vec<RelationRecord> },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match load_config(&cli) {
        Ok(config) => match cli.command {
            Commands::Build { ref input, ref view } => run_build(&config, input, view, &cli.format),
            Commands::Sync {
                ref firm,
                ref since,
                ref until,
                ref status,
                ref token,
                ref view,
            } => {
                let mut query = RelationQuery::for_firm(firm);
                query.since = since.clone();
                query.until = until.clone();
                match status.as_deref().map(parse_status).transpose() {
                    Ok(status) => {
                        query.status = status;
                        run_sync(config, &query, token, view, &cli.format).await
                    }
                    Err(e) => Err(e),
                }
            }
            Commands::Upload { ref file, ref token } => run_upload(config, file, token, &cli.format).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_yaml_file(path)?,
        None => EngineConfig::default(),
    };
    let mut config = config.apply_env();
    if let Some(url) = &cli.url {
        config.base_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn parse_status(raw: &str) -> Result<RelationStatus, Box<dyn std::error::Error>> {
    RelationStatus::parse(raw).ok_or_else(|| format!("unknown status {:?}", raw).into())
}

fn pipeline(config: EngineConfig, token: &str) -> Result<Arc<FetchPipeline>, Box<dyn std::error::Error>> {
    let transport = HttpTransport::new(&config.base_url, config.request_timeout())?;
    let credentials = StaticCredentials::new().with_token(ACCOUNT, token);
    Ok(Arc::new(FetchPipeline::new(
        config,
        Arc::new(transport),
        Arc::new(credentials),
        ACCOUNT,
    )))
}

fn run_build(
    config: &EngineConfig,
    input: &Path,
    view: &ViewArgs,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(input)?;
    let records = match serde_json::from_str(&text)? {
        RecordFile::Flat(records) => records,
        RecordFile::Wrapped { data } => data,
    };
    let graph = Arc::new(agencygraph::HierarchyGraphBuilder::new().build(&records));
    print_graph(config, graph, view, format)
}

async fn run_sync(
    config: EngineConfig,
    query: &RelationQuery,
    token: &str,
    view: &ViewArgs,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let view_config = config.clone();
    let sync = HierarchySync::new(pipeline(config, token)?);
    let graph = sync.sync(query).await?;
    print_graph(&view_config, graph, view, format)
}

async fn run_upload(
    config: EngineConfig,
    path: &Path,
    token: &str,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let content_type = match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
        Some(ext) if ext == "csv" => "text/csv",
        Some(ext) if ext == "txt" => "text/plain",
        _ => "application/octet-stream",
    };
    let file = UploadFile::new(name, content_type, std::fs::read(path)?);

    let mut monitor = UploadJobMonitor::new(pipeline(config, token)?);
    let json = matches!(format, OutputFormat::Json);
    let mut report = |job: &UploadJob| {
        if !json {
            println!("job {}: {:?}", job.id, job.status);
        }
    };
    let job = monitor.run(&file, Some(&mut report)).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job.progress)?),
        _ => println!("Upload {} completed", job.id),
    }
    Ok(())
}

fn print_graph(
    config: &EngineConfig,
    graph: Arc<HierarchyGraph>,
    args: &ViewArgs,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = TraversalState {
        children_page_size: config.default_children_page_size,
        show_all_children: args.all_children,
        scope_root_id: args.scope.clone(),
        ..TraversalState::default()
    };
    let mut view = HierarchyView::with_state(Arc::clone(&graph), state);
    let visible = view.expand_to_depth(args.expand_depth);

    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "report": graph.report(),
                "visible": &*visible,
                "nodes": visible
                    .nodes
                    .iter()
                    .filter_map(|n| graph.get(&n.id))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Csv => {
            println!("id,depth,name,status,descendants,active,inactive,pending,duplicate_group");
            for row in rows(&graph, &visible) {
                let cells: Vec<String> = row.iter().map(|c| format_csv_value(c)).collect();
                println!("{}", cells.join(","));
            }
        }
        OutputFormat::Table => {
            let report = graph.report();
            println!(
                "{} records, {} nodes, {} roots ({} synthetic), {} synthetic attachments, {} duplicate groups",
                report.record_count,
                report.node_count,
                report.root_count(),
                report.synthetic_roots,
                report.synthetic_attachments(),
                report.duplicate_groups
            );

            let mut table = Table::new();
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec![
                "Id", "Depth", "Name", "Status", "Descendants", "Active", "Inactive", "Pending", "Duplicates",
            ]);
            for (node, row) in visible.nodes.iter().zip(rows(&graph, &visible)) {
                let mut row = row;
                row[2] = format!("{}{}", "  ".repeat(node.depth), row[2]);
                if let Some(window) = node.window.filter(|w| w.is_paged()) {
                    row[2].push_str(&format!(" [page {}/{}]", window.page + 1, window.page_count));
                }
                table.add_row(row);
            }
            println!("{}", table);
            println!("{} visible node(s)", visible.len());
        }
    }
    Ok(())
}

fn rows(graph: &HierarchyGraph, visible: &VisibleSet) -> Vec<Vec<String>> {
    visible
        .nodes
        .iter()
        .filter_map(|v| graph.get(&v.id).map(|node| (v, node)))
        .map(|(v, node)| {
            vec![
                node.id.clone(),
                v.depth.to_string(),
                node.name.clone(),
                node.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                node.metrics.descendant_count.to_string(),
                node.branch_summary.active.to_string(),
                node.branch_summary.inactive.to_string(),
                node.branch_summary.pending.to_string(),
                node.duplicate_group_id.clone().unwrap_or_default(),
            ]
        })
        .collect()
}

fn format_csv_value(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
