use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use duskbell::cli::{self, Args};
use duskbell::config::Config;
use duskbell::dedupe::JsonFileStore;
use duskbell::notify::{CommandNotifier, LogNotifier, Notifier};
use duskbell::orchestrator;
use duskbell::redact;
use duskbell::rule::{self, Rule};
use duskbell::scheduler::run_scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    if args.help {
        cli::print_help();
        return Ok(());
    }

    // Initialize logging
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "duskbell=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Duskbell v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Rules: {}", config.rules_path.display());
    info!("  Cache: {}", config.cache_path.display());

    let needs_notifier = !args.dry_run && !args.preview;

    // Handle --validate mode
    if args.validate {
        info!("Validating configuration...");
        let checked = config
            .validate(needs_notifier)
            .and_then(|()| rule::load_rules(&config.rules_path));
        match checked {
            Ok(rules) => {
                info!("Configuration is valid ({} rules)", rules.len());
                return Ok(());
            }
            Err(e) => {
                error!("{:#}", e);
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = config.validate(needs_notifier) {
        error!("{}", e);
        std::process::exit(1);
    }

    let rules = rule::load_rules(&config.rules_path)?;
    if rules.is_empty() {
        warn!("No valid rules in {}", config.rules_path.display());
    }

    if args.preview {
        print_preview(&rules);
        return Ok(());
    }

    if args.dry_run {
        info!("Dry run: messages are logged, cache is left untouched");
        return run(&args, &config, &rules, &LogNotifier).await;
    }

    let Some(command) = config.notify_command.as_deref() else {
        // validate() rejects this combination
        anyhow::bail!("DUSKBELL_NOTIFY_CMD not set");
    };
    let notifier = CommandNotifier::new(command, config.notify_timeout())?;
    info!("Delivery command: {}", notifier.program());

    run(&args, &config, &rules, &notifier).await
}

/// Run once or keep watching, persisting the dedupe store unless dry-running
async fn run<N: Notifier>(args: &Args, config: &Config, rules: &[Rule], notifier: &N) -> Result<()> {
    let mut store = JsonFileStore::load(&config.cache_path);
    let persist = !args.dry_run;

    if !args.watch {
        let summary = orchestrator::run_once(rules, Utc::now(), &mut store, notifier).await;
        if persist && summary.sent > 0 {
            if let Err(e) = store.save() {
                error!("Failed to save cache: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        ctrl_c.cancel();
    });

    let store = run_scheduler(
        rules,
        config.poll_interval(),
        cancel,
        store,
        |mut store, now| async move {
            let summary = orchestrator::run_once(rules, now, &mut store, notifier).await;
            if persist && summary.sent > 0 {
                if let Err(e) = store.save() {
                    // Entries stay in memory; the next successful save catches up
                    error!("Failed to save cache: {}", e);
                }
            }
            store
        },
    )
    .await;

    if persist {
        store.save()?;
        info!("Cache flushed to {}", config.cache_path.display());
    }
    Ok(())
}

fn print_preview(rules: &[Rule]) {
    for (rule, upcoming) in orchestrator::preview(rules, Utc::now()) {
        let target = redact::identity(&rule.identity);
        match upcoming {
            Ok(up) => println!(
                "{}  {}  event {}  sunset {}  display {}",
                target,
                rule.schedule,
                rule::weekday_token(rule.event_weekday),
                up.sunset.format("%Y-%m-%d %H:%M UTC"),
                up.hhmm
            ),
            Err(e) => println!("{}  {}  {}", target, rule.schedule, e),
        }
    }
}
