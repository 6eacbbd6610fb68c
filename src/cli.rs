use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::config::{self, AppConfig, SyncConfig};
use crate::error::SyncError;
use crate::model::link::Link;
use crate::model::priority::PriorityStatus;
use crate::providers::azure_devops::AzureDevOpsProvider;
use crate::providers::Provider;
use crate::store::links::LinkStore;
use crate::store::tasks::{JsonTaskStore, TaskRepository};
use crate::sync::{HoursMap, SyncEngine, SyncPreview, SyncResult};
use crate::translate::StateTranslator;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Test,
    Assigned,
    Import(u64),
    Tasks,
    Preview { task_id: String, json: bool },
    Sync { task_id: String, hours: HoursMap },
    SyncAll { hours: HoursMap },
    SetStatus { task_id: String, status: PriorityStatus },
    Unlink(String),
    Activity(String),
}

/// Parse `prisync` arguments (without the program name).
pub fn parse_command(args: &[String]) -> Result<Command> {
    let Some((name, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };
    let (positional, hours, json) = split_flags(rest)?;

    let one = |what: &str| -> Result<String> {
        match positional.as_slice() {
            [value] => Ok(value.clone()),
            [] => bail!("Missing {what}. Run `prisync help` for usage."),
            _ => bail!("Too many arguments for `prisync {name}`"),
        }
    };
    let no_hours = |cmd: Command| -> Result<Command> {
        if !hours.is_empty() {
            bail!("--hours only applies to `sync` and `sync-all`");
        }
        Ok(cmd)
    };

    match name.as_str() {
        "help" | "-h" | "--help" => Ok(Command::Help),
        "test" => no_hours(Command::Test),
        "assigned" => no_hours(Command::Assigned),
        "tasks" => no_hours(Command::Tasks),
        "import" => {
            let raw = one("work item id")?;
            let id = raw
                .trim_start_matches('#')
                .parse::<u64>()
                .with_context(|| format!("Invalid work item id: {raw}"))?;
            no_hours(Command::Import(id))
        }
        "preview" => no_hours(Command::Preview {
            task_id: one("task id")?,
            json,
        }),
        "sync" => Ok(Command::Sync {
            task_id: one("task id")?,
            hours,
        }),
        "sync-all" => {
            if !positional.is_empty() {
                bail!("`prisync sync-all` takes no positional arguments");
            }
            Ok(Command::SyncAll { hours })
        }
        "set-status" => match positional.as_slice() {
            [task_id, status] => {
                let status = status.parse::<PriorityStatus>().map_err(anyhow::Error::msg)?;
                no_hours(Command::SetStatus {
                    task_id: task_id.clone(),
                    status,
                })
            }
            _ => bail!("Usage: prisync set-status <task-id> <ON_TRACK|AT_RISK|BLOCKED|DONE>"),
        },
        "unlink" => no_hours(Command::Unlink(one("task id")?)),
        "activity" => no_hours(Command::Activity(one("task id")?)),
        other => bail!("Unknown command `{other}`. Run `prisync help` for usage."),
    }
}

fn split_flags(args: &[String]) -> Result<(Vec<String>, HoursMap, bool)> {
    let mut positional = Vec::new();
    let mut hours = HoursMap::new();
    let mut json = false;
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--hours" | "-H" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    bail!("Missing value for --hours flag");
                };
                let (id, h) = parse_hours_arg(value)?;
                hours.insert(id, h);
            }
            "--json" => json = true,
            flag if flag.starts_with("--") => bail!("Unknown flag {flag}"),
            _ => positional.push(args[i].clone()),
        }
        i += 1;
    }

    Ok((positional, hours, json))
}

/// Parse `<child-id>=<hours>`, e.g. `43=2.5` or `#43=2.5`.
pub fn parse_hours_arg(value: &str) -> Result<(u64, f64)> {
    let Some((id, hours)) = value.split_once('=') else {
        bail!("Expected <task-id>=<hours>, got `{value}`");
    };
    let id = id
        .trim()
        .trim_start_matches('#')
        .parse::<u64>()
        .with_context(|| format!("Invalid task id in `{value}`"))?;
    let hours = hours
        .trim()
        .parse::<f64>()
        .with_context(|| format!("Invalid hours in `{value}`"))?;
    if !hours.is_finite() || hours < 0.0 {
        bail!("Hours must be a non-negative number, got `{value}`");
    }
    Ok((id, hours))
}

struct Workspace {
    config: AppConfig,
    tasks: Arc<JsonTaskStore>,
    links: Arc<LinkStore>,
}

impl Workspace {
    fn open(config: AppConfig) -> Result<Self> {
        let dir = config::data_dir(&config);
        let tasks = JsonTaskStore::open(&dir)
            .with_context(|| format!("Failed to open task store in {}", dir.display()))?;
        let links = LinkStore::open(dir.join("links.json"))
            .with_context(|| format!("Failed to open link store in {}", dir.display()))?;
        Ok(Self {
            config,
            tasks: Arc::new(tasks),
            links: Arc::new(links),
        })
    }
}

fn gateway(cfg: &SyncConfig) -> Result<AzureDevOpsProvider> {
    let translator = StateTranslator::new(&cfg.state_mapping);
    Ok(AzureDevOpsProvider::new(cfg, translator.terminal_states())?)
}

fn engine(ws: &Workspace) -> Result<SyncEngine> {
    let cfg = SyncConfig::enabled(&ws.config)?;
    let provider = gateway(&cfg)?;
    Ok(SyncEngine::new(
        cfg,
        Arc::new(provider),
        ws.tasks.clone(),
        ws.links.clone(),
    )?)
}

pub async fn run(command: Command) -> Result<()> {
    if command == Command::Help {
        print_help();
        return Ok(());
    }
    let ws = Workspace::open(config::load_config()?)?;

    match command {
        Command::Help => print_help(),
        Command::Test => {
            let cfg = SyncConfig::from_app_config(&ws.config)?;
            let provider = gateway(&cfg)?;
            if provider.test_connection().await? {
                println!("Connected to {} {}/{}", provider.name(), cfg.organization, cfg.project);
                if !cfg.sync_enabled {
                    println!("Sync is disabled; set sync_enabled = true to turn it on.");
                }
            } else {
                bail!("Azure DevOps rejected the connection. Check organization, project and pat.");
            }
        }
        Command::Assigned => {
            let items = engine(&ws)?.assigned().await?;
            if items.is_empty() {
                println!("Nothing assigned.");
            }
            let (org, project) = item_scope(&ws.config);
            for item in items {
                let linked = if ws.links.find_by_work_item(&org, &project, item.id).is_empty() {
                    ""
                } else {
                    " [linked]"
                };
                println!(
                    "#{:<7} {:<10} {:<12} {}{linked}",
                    item.id, item.work_item_type, item.state, item.title
                );
            }
        }
        Command::Import(id) => {
            let (task_id, link) = engine(&ws)?.import_as_new_task(id).await?;
            println!(
                "Imported work item #{} as task {task_id} (state {})",
                link.work_item_id, link.last_synced_state
            );
        }
        Command::Tasks => {
            for task in ws.tasks.list()? {
                let link = ws
                    .links
                    .get(&task.id)
                    .map(|l| format!("#{}", l.work_item_id))
                    .unwrap_or_else(|| "-".into());
                let done = task.checklist.iter().filter(|i| i.completed).count();
                println!(
                    "{}  {:<9} {:<8} [{done}/{}] {}",
                    task.id,
                    task.status,
                    link,
                    task.checklist.len(),
                    task.title
                );
            }
        }
        Command::Preview { task_id, json } => {
            let preview = engine(&ws)?.compute_preview(&task_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&preview)?);
            } else {
                print_preview(&preview);
            }
        }
        Command::Sync { task_id, hours } => {
            let result = engine(&ws)?.execute_sync(&task_id, &hours).await;
            match result {
                Ok(result) => print_result(&task_id, &result),
                Err(e) => return Err(explain(e)),
            }
        }
        Command::SyncAll { hours } => {
            let outcomes = engine(&ws)?.sync_all(&hours).await;
            let mut failed = 0;
            for outcome in outcomes {
                match outcome.result {
                    Ok(result) => print_result(&outcome.task_id, &result),
                    Err(e) => {
                        failed += 1;
                        println!("{} (#{}): {}", outcome.task_id, outcome.work_item_id, explain(e));
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} link(s) did not sync");
            }
        }
        Command::SetStatus { task_id, status } => {
            let mut task = ws
                .tasks
                .get(&task_id)?
                .ok_or_else(|| SyncError::TaskNotFound {
                    task_id: task_id.clone(),
                })?;
            task.status = status;
            task.updated_at = chrono::Utc::now();
            ws.tasks.update(&task)?;
            println!("{task_id} is now {status}");
        }
        Command::Unlink(task_id) => {
            let link = unlink(&ws, &task_id)?;
            println!("Unlinked {task_id} from work item #{}", link.work_item_id);
        }
        Command::Activity(task_id) => {
            for entry in ws.tasks.activity(&task_id)? {
                println!("{} {} {}", entry.timestamp.to_rfc3339(), entry.actor, entry.action);
                for change in entry.changes {
                    println!("    {change}");
                }
            }
        }
    }

    Ok(())
}

/// Works with sync disabled or credentials gone, which is when orphans get cleared.
fn unlink(ws: &Workspace, task_id: &str) -> Result<Link> {
    Ok(ws.links.unlink(task_id)?)
}

fn item_scope(config: &AppConfig) -> (String, String) {
    config
        .azure_devops
        .as_ref()
        .map(|c| (c.organization.clone(), c.project.clone()))
        .unwrap_or_default()
}

fn explain(e: SyncError) -> anyhow::Error {
    match &e {
        SyncError::MissingHours { task_ids } => {
            let flags = task_ids
                .iter()
                .map(|id| format!("--hours {id}=<hours>"))
                .collect::<Vec<_>>()
                .join(" ");
            anyhow::Error::new(e).context(format!("Re-run with {flags}"))
        }
        SyncError::OrphanedLink { task_id, .. } => {
            let hint = format!("Run `prisync unlink {task_id}` to clear it");
            anyhow::Error::new(e).context(hint)
        }
        _ => e.into(),
    }
}

fn print_preview(preview: &SyncPreview) {
    println!(
        "Task {} <-> work item #{} \"{}\"",
        preview.task_id, preview.work_item_id, preview.work_item_title
    );
    println!(
        "  local: {}   remote: {}   last synced: {}",
        preview.local_state, preview.remote_state, preview.last_synced_state
    );
    if !preview.has_changes {
        println!("  Already in sync.");
    }
    if preview.from_remote.will_update {
        println!("  From Azure DevOps:");
        for change in &preview.from_remote.changes {
            println!("    - {change}");
        }
    }
    if preview.to_remote.will_update {
        println!("  To Azure DevOps:");
        for change in &preview.to_remote.changes {
            println!("    - {change}");
        }
    }
    let needs_hours: Vec<_> = preview.tasks.iter().filter(|t| t.will_close).collect();
    if !needs_hours.is_empty() {
        println!("  Hours required (--hours <id>=<hours>):");
        for t in needs_hours {
            println!("    #{} {}", t.task_id, t.text);
        }
    }
    if !preview.links.is_empty() {
        println!("  Links:");
        for link in &preview.links {
            println!("    {}: {}", link.title, link.url);
        }
    }
}

fn print_result(task_id: &str, result: &SyncResult) {
    if result.is_noop() {
        println!("{task_id}: already in sync");
        return;
    }
    if result.is_partial() {
        let local = if result.local_applied {
            "local changes applied, "
        } else {
            ""
        };
        println!(
            "{task_id}: {local}Azure DevOps update failed ({}). Run sync again to retry.",
            result.remote_error.as_deref().unwrap_or("unknown error")
        );
        return;
    }
    println!("{task_id}: {} change(s) applied", result.applied_count());
    for change in result.from_remote.iter().chain(&result.to_remote) {
        println!("    - {change}");
    }
    for change in &result.carried {
        println!("    - {change} (earlier run)");
    }
    for skipped in &result.skipped {
        println!("    ! skipped {skipped}");
    }
}

pub fn print_help() {
    println!("prisync: keep priorities in step with Azure DevOps work items\n");
    println!("USAGE:");
    println!("  prisync test                        Check the configured connection");
    println!("  prisync assigned                    List work items assigned to you");
    println!("  prisync import <work-item-id>       Create a task linked to a work item");
    println!("  prisync tasks                       List local tasks and their links");
    println!("  prisync preview <task-id> [--json]  Show what a sync would change");
    println!("  prisync sync <task-id> [--hours <child-id>=<hours>]...");
    println!("  prisync sync-all [--hours <child-id>=<hours>]...");
    println!("  prisync set-status <task-id> <STATUS>");
    println!("  prisync unlink <task-id>            Clear a link (e.g. an orphaned one)");
    println!("  prisync activity <task-id>          Show the sync audit trail");
    println!();
    println!("Config is read from ~/.prisync/config.toml (override with PRISYNC_CONFIG).");
    println!("Logging is controlled by PRISYNC_LOG and PRISYNC_LOG_FORMAT=json.");
}
