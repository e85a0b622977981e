use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wikibot_core::api::{ProjectClient, WikiApi};
use wikibot_core::config::{
    BotConfig, Credentials, NewProject, Project, create_project, list_projects, load_config,
    load_project,
};
use wikibot_core::conflict::{
    ConflictResolver, ConsoleResolver, KeepExistingResolver, RecordingResolver,
};
use wikibot_core::interwiki::{SyncOptions, SyncReport, reset_checkpoint, run_sync, stored_checkpoint};
use wikibot_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, normalize_for_display,
    resolve_paths,
};
use wikibot_core::storage::SqliteStore;

#[derive(Debug, Parser)]
#[command(
    name = "wikibot",
    version,
    about = "Interwiki link maintenance bot for multi-language MediaWiki families"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "NAME", help = "Project file to use (overrides config)")]
    project: Option<String>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    project: Option<String>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            project: cli.project.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    #[command(about = "List configured projects")]
    Projects,
    #[command(name = "make:project", about = "Create a project file under projects/")]
    MakeProject(MakeProjectArgs),
    #[command(about = "Log in to one language edition with the bot credentials")]
    Login(LoginArgs),
    #[command(about = "Synchronize interwiki links across the project's language editions")]
    Interwiki(InterwikiArgs),
    #[command(about = "Show the stored interwiki checkpoint")]
    Checkpoint(CheckpointArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct MakeProjectArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    title: String,
    #[arg(long, value_name = "CODE")]
    default_language: String,
    #[arg(long, value_name = "URL", help = "API endpoint; `{language}` is replaced per edition")]
    api_url: String,
    #[arg(long, help = "Overwrite an existing project file")]
    force: bool,
}

#[derive(Debug, Args)]
struct LoginArgs {
    #[arg(value_name = "LANGUAGE")]
    language: Option<String>,
}

#[derive(Debug, Args)]
struct InterwikiArgs {
    #[arg(value_name = "LANGUAGE", help = "Edition whose titles seed the pass (default: project language)")]
    language: Option<String>,
    #[arg(long, value_name = "TITLE", help = "Sync a single title without touching the checkpoint")]
    title: Option<String>,
    #[arg(long, help = "Show the edits that would be made without saving")]
    dry_run: bool,
    #[arg(long, help = "Keep the first title found instead of prompting on conflicts")]
    non_interactive: bool,
    #[arg(long, help = "Clear the stored checkpoint and start from the first title")]
    reset: bool,
    #[arg(long, value_name = "N", help = "Stop after N listing batches")]
    max_batches: Option<usize>,
    #[arg(long, value_name = "TEXT", help = "Edit summary (default: config or built-in)")]
    summary: Option<String>,
    #[arg(long, help = "Print the final report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct CheckpointArgs {
    #[arg(value_name = "LANGUAGE")]
    language: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Projects) => run_projects(&runtime),
        Some(Commands::MakeProject(args)) => run_make_project(&runtime, args),
        Some(Commands::Login(args)) => run_login(&runtime, args),
        Some(Commands::Interwiki(args)) => run_interwiki(&runtime, args),
        Some(Commands::Checkpoint(args)) => run_checkpoint(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized wikibot runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("projects_dir: {}", normalize_path(&paths.projects_dir));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_projects(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let projects = list_projects(&paths.projects_dir)?;

    println!("projects_dir: {}", normalize_path(&paths.projects_dir));
    println!("projects.count: {}", projects.len());
    if projects.is_empty() {
        println!("projects: <none> (run `wikibot make:project`)");
    }
    for project in &projects {
        println!(
            "project: {} | {} | {} | {}",
            project.name,
            project.title,
            project.default_language,
            project.api_url.as_deref().unwrap_or("<per-language>")
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_make_project(runtime: &RuntimeOptions, args: MakeProjectArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let path = create_project(
        &paths.projects_dir,
        &NewProject {
            name: args.name,
            title: args.title,
            default_language: args.default_language,
            api_url: args.api_url,
        },
        args.force,
    )?;

    println!("Project file created");
    println!("path: {}", normalize_path(&path));
    Ok(())
}

fn run_login(runtime: &RuntimeOptions, args: LoginArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let (config, project) = load_active_project(runtime, &paths)?;
    let language = args
        .language
        .unwrap_or_else(|| project.default_language.clone());
    let api_url = project.api_url(&language)?;

    let mut client = ProjectClient::new(project, &config, Credentials::from_env());
    client.login(&language)?;

    println!("Logged in");
    println!("project: {}", client.project().name);
    println!("language: {language}");
    println!("api_url: {api_url}");
    Ok(())
}

fn run_interwiki(runtime: &RuntimeOptions, args: InterwikiArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let (config, project) = load_active_project(runtime, &paths)?;
    let language = args
        .language
        .unwrap_or_else(|| project.default_language.clone());
    let mut store = SqliteStore::open(&paths.db_path)?;

    if args.reset {
        reset_checkpoint(&mut store, &language)?;
    }

    let mut options = SyncOptions::new(
        &language,
        args.summary.unwrap_or_else(|| config.summary()),
    );
    options.dry_run = args.dry_run;
    options.single_title = args.title;
    options.max_batches = args.max_batches;

    let credentials = Credentials::from_env();
    if credentials.is_none() && !options.dry_run {
        tracing::warn!("WIKI_BOT_USER/WIKI_BOT_PASS not set; edits will be made anonymously");
    }
    let mut client = ProjectClient::new(project, &config, credentials);
    let inner: Box<dyn ConflictResolver> = if args.non_interactive {
        Box::new(KeepExistingResolver)
    } else {
        Box::new(ConsoleResolver::stdio())
    };
    let mut resolver = RecordingResolver::new(inner);

    let report = run_sync(&mut client, &mut store, &mut resolver, &options)?;
    tracing::info!(
        titles = report.titles,
        saved = report.pages_saved,
        requests = client.request_count(),
        "interwiki pass finished"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&client.project().name, &language, &options, &report);
        for conflict in resolver.seen() {
            println!(
                "conflict: {} | {} | {}",
                conflict.language, conflict.existing, conflict.candidate
            );
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn run_checkpoint(runtime: &RuntimeOptions, args: CheckpointArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let language = match args.language {
        Some(language) => language,
        None => load_active_project(runtime, &paths)?.1.default_language,
    };
    let store = SqliteStore::open(&paths.db_path)?;

    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("language: {language}");
    match stored_checkpoint(&store, &language)? {
        Some(checkpoint) => {
            println!(
                "checkpoint.continue: {}",
                checkpoint.continue_token.as_deref().unwrap_or("<none>")
            );
            println!(
                "checkpoint.apcontinue: {}",
                checkpoint.ap_continue.as_deref().unwrap_or("<none>")
            );
        }
        None => println!("checkpoint: <none>"),
    }
    Ok(())
}

fn print_report(project: &str, language: &str, options: &SyncOptions, report: &SyncReport) {
    for preview in &report.previews {
        print!("{}", preview.diff);
    }
    println!("interwiki sync");
    println!("project: {project}");
    println!("language: {language}");
    println!("dry_run: {}", format_flag(options.dry_run));
    if let Some(checkpoint) = &report.resumed_from {
        println!(
            "resumed_from: {}",
            checkpoint.ap_continue.as_deref().unwrap_or("<none>")
        );
    }
    println!("batches: {}", report.batches);
    println!("titles: {}", report.titles);
    println!("clusters: {}", report.clusters);
    println!("pages_saved: {}", report.pages_saved);
    println!("pages_unchanged: {}", report.pages_unchanged);
    if options.dry_run {
        println!("pages_pending: {}", report.previews.len());
    }
    println!("missing: {}", report.missing);
    println!("rejected: {}", report.rejected);
    println!("conflicts_prompted: {}", report.conflicts_prompted);
    println!("requests: {}", report.request_count);
    println!("exhausted: {}", format_flag(report.exhausted));
}

fn load_active_project(runtime: &RuntimeOptions, paths: &ResolvedPaths) -> Result<(BotConfig, Project)> {
    let config = load_config(&paths.config_path)?;
    let Some(name) = runtime.project.clone().or_else(|| config.project_name()) else {
        bail!(
            "no project selected: pass --project, set WIKIBOT_PROJECT, or set [bot].project in {}",
            normalize_path(&paths.config_path)
        );
    };
    let project = load_project(&paths.projects_dir, &name)?;
    Ok((config, project))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
