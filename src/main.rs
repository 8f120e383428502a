use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use funnel_dispatch::config::{DispatcherConfig, ReclaimerConfig, StoreConfig, TelegramConfig};
use funnel_dispatch::funnel::{
    Courier, Dispatcher, FunnelGraph, InactivityReclaimer, RetryPolicy, ScheduleRecord,
    spawn_dispatcher,
};
use funnel_dispatch::gateway::{CatalogRenderer, TelegramGateway};
use funnel_dispatch::store::{LibSqlBackend, ScheduleStore};

#[derive(Parser)]
#[command(
    name = "funnel-dispatch",
    version,
    about = "Two-track follow-up funnel dispatcher"
)]
struct Cli {
    /// Schedule database path (overrides FUNNEL_DB_PATH)
    #[arg(long, global = true)]
    db_path: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher loop until Ctrl-C (default)
    Run,
    /// Run a single dispatch cycle and exit
    Once,
    /// List users whose last send exhausted its retries
    Failed,
    /// Print one user's schedule record
    Show { user_id: String },
    /// Clear a user's tracks, form state and stop flag
    Reset { user_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "funnel_dispatch=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let mut store_config = StoreConfig::from_env();
    if let Some(path) = cli.db_path {
        store_config.db_path = path;
    }

    let store: Arc<dyn ScheduleStore> = Arc::new(
        LibSqlBackend::new_local(&store_config.db_path)
            .await
            .with_context(|| format!("opening schedule database at {}", store_config.db_path.display()))?,
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(store, &store_config, true).await,
        Command::Once => run(store, &store_config, false).await,
        Command::Failed => {
            let failed = store.list_failed().await?;
            if failed.is_empty() {
                eprintln!("No users with exhausted retries.");
            }
            for record in &failed {
                print_record(record);
            }
            Ok(())
        }
        Command::Show { user_id } => {
            let record = store
                .get_record(&user_id)
                .await?
                .with_context(|| format!("no schedule record for {user_id}"))?;
            print_record(&record);
            Ok(())
        }
        Command::Reset { user_id } => {
            let reclaimer = InactivityReclaimer::new(store, &ReclaimerConfig::from_env());
            reclaimer.reset(&user_id).await?;
            eprintln!("Reset {user_id}");
            Ok(())
        }
    }
}

async fn run(store: Arc<dyn ScheduleStore>, store_config: &StoreConfig, forever: bool) -> Result<()> {
    let dispatcher_config = DispatcherConfig::from_env();
    let reclaimer_config = ReclaimerConfig::from_env();

    let graph = match &store_config.graph_path {
        Some(path) => FunnelGraph::from_json_file(path)?,
        None => FunnelGraph::shipped(),
    };
    let renderer = match &store_config.messages_path {
        Some(path) => CatalogRenderer::from_json_file(path)?,
        None => CatalogRenderer::builtin(),
    };
    let gateway = TelegramGateway::new(TelegramConfig::from_env()?, dispatcher_config.send_timeout);

    eprintln!("Funnel Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", store_config.db_path.display());
    eprintln!("   Messages: {} templates", renderer.len());
    eprintln!(
        "   Poll: every {}s, conflict grace {}m, recovery delay {}m",
        dispatcher_config.poll_interval.as_secs(),
        dispatcher_config.conflict_grace.as_secs() / 60,
        dispatcher_config.recovery_delay.as_secs() / 60,
    );

    let courier = Arc::new(Courier::new(
        Arc::new(gateway),
        Arc::new(renderer),
        RetryPolicy::default(),
        dispatcher_config.send_timeout,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(graph),
        courier,
        &dispatcher_config,
    ));

    if !forever {
        let report = dispatcher.run_cycle().await;
        eprintln!(
            "Cycle: {} scanned, {} sent, {} retrying, {} exhausted, {} store errors",
            report.scanned, report.sent, report.retried, report.exhausted, report.store_errors
        );
        return Ok(());
    }

    let reclaimer = dispatcher_config
        .reclaim_sweep
        .then(|| Arc::new(InactivityReclaimer::new(Arc::clone(&store), &reclaimer_config)));
    let handle = spawn_dispatcher(dispatcher, reclaimer, dispatcher_config.poll_interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested; stopping dispatcher");
    handle.abort();
    Ok(())
}

fn print_record(record: &ScheduleRecord) {
    let slot = |s: Option<&funnel_dispatch::funnel::TrackSlot>| {
        s.map(|s| match s.attempt {
            0 => format!("{} @ {}", s.message_id, s.run_at.to_rfc3339()),
            n => format!("{} @ {} (retry {n})", s.message_id, s.run_at.to_rfc3339()),
        })
            .unwrap_or_else(|| "-".to_string())
    };
    println!("{}", record.user_id);
    println!("   destination: {}", record.chat_destination);
    println!("   entry point: {}", record.entry_point.map_or("-", |e| e.as_str()));
    println!("   main:        {}", slot(record.main_track.as_ref()));
    println!("   reminder:    {}", slot(record.reminder_track.as_ref()));
    println!("   stopped:     {}", record.stopped);
    println!("   form state:  {}", record.form_state.as_deref().unwrap_or("-"));
    println!("   last active: {}", record.last_activity_at.to_rfc3339());
    if let Some(last) = &record.last_send {
        println!(
            "   last send:   {} {} @ {}",
            last.message_id,
            last.status,
            last.sent_at.to_rfc3339()
        );
    }
}
