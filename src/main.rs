use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

use plansync::approval::ApprovalOutcome;
use plansync::cache::CacheStorage;
use plansync::config::Config;
use plansync::connectivity::{tcp_reachability, Connectivity, ConnectivityMonitor};
use plansync::db::Database;
use plansync::queue::SyncQueue;
use plansync::realtime::{Callbacks, RealtimeTransport, SubscriptionManager};
use plansync::remote::{Filter, RestClient};
use plansync::resource::ResourceKind;
use plansync::session::Session;
use plansync::sync::{LoadOptions, MutationOutcome, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "plansync")]
#[command(about = "Offline-first sync for a shared planner workspace")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/plansync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Inspect the local cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Read a collection, cache first
  Fetch {
    kind: ResourceKind,
    /// Ignore any cached copy
    #[arg(long)]
    skip_cache: bool,
    /// Lifetime of the cached result
    #[arg(long)]
    ttl_secs: Option<u64>,
    /// Extra equality filter, e.g. --where status=done
    #[arg(long = "where", value_parser = parse_filter)]
    filters: Vec<Filter>,
  },
  /// Inspect or replay offline changes
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Create a record
  Create {
    kind: ResourceKind,
    #[arg(long = "set", value_parser = parse_assignment, required = true)]
    fields: Vec<(String, Value)>,
  },
  /// Change a record, or request the change from its author
  Edit {
    kind: ResourceKind,
    id: String,
    #[arg(long = "set", value_parser = parse_assignment, required = true)]
    fields: Vec<(String, Value)>,
    /// Explanation shown to the author
    #[arg(long)]
    reason: Option<String>,
  },
  /// Delete a record, or request the deletion from its author
  Delete {
    kind: ResourceKind,
    id: String,
    #[arg(long)]
    reason: Option<String>,
  },
  /// Edits waiting for your approval
  Inbox,
  Approve { edit_id: String },
  Reject { edit_id: String },
  /// Print live changes as JSON lines until Ctrl-C
  Watch { kind: ResourceKind },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  Get { key: String },
  Purge { key: String },
  Clear,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  List,
  Replay,
  /// Put a failed change back in line for the next replay
  Retry { id: i64 },
}

fn parse_assignment(s: &str) -> std::result::Result<(String, Value), String> {
  let (field, raw) = s
    .split_once('=')
    .ok_or_else(|| format!("expected field=value, got {}", s))?;
  // Bare words are strings; numbers, booleans, null and JSON literals keep their type
  let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
  Ok((field.to_string(), value))
}

fn parse_filter(s: &str) -> std::result::Result<Filter, String> {
  let (column, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected column=value, got {}", s))?;
  Ok(Filter::eq(column, value))
}

fn to_object(fields: Vec<(String, Value)>) -> Value {
  Value::Object(fields.into_iter().collect::<Map<_, _>>())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = plansync::logging::init(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let db = match &config.cache.path {
    Some(path) => Database::open(path)?,
    None => Database::open_default()?,
  };

  match args.command {
    Command::Cache { action } => cache_command(&db, action),
    Command::Queue {
      action: QueueAction::List,
    } => list_queue(&db),
    Command::Queue {
      action: QueueAction::Retry { id },
    } => {
      SyncQueue::new(db).retry(id)?;
      println!("Change #{} will be retried on the next replay", id);
      Ok(())
    }
    command => {
      let client = Client::connect(&config, db)?;
      client.run(command).await
    }
  }
}

fn cache_command(db: &Database, action: CacheAction) -> Result<()> {
  let storage = plansync::cache::SqliteStorage::new(db.clone());
  match action {
    CacheAction::Get { key } => match storage.get::<Value>(&key)? {
      Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
      None => println!("(absent)"),
    },
    CacheAction::Purge { key } => {
      storage.delete(&key)?;
      println!("Purged {}", key);
    }
    CacheAction::Clear => {
      storage.clear()?;
      println!("Cache cleared");
    }
  }
  Ok(())
}

fn list_queue(db: &Database) -> Result<()> {
  let queued = SyncQueue::new(db.clone()).all()?;
  if queued.is_empty() {
    println!("No queued changes");
  }
  for mutation in queued {
    let status = match (mutation.synced, &mutation.failure) {
      (true, _) => "synced",
      (false, Some(_)) => "failed",
      (false, None) => "pending",
    };
    println!(
      "#{:<5} {:<8} {:<7} {}/{}  {}{}",
      mutation.id,
      status,
      mutation.operation,
      mutation.resource_kind,
      mutation.resource_id,
      mutation.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
      mutation
        .failure
        .as_ref()
        .map(|error| format!("  ({})", error))
        .unwrap_or_default()
    );
  }
  Ok(())
}

struct Client {
  config: Config,
  api_key: String,
  session: Arc<Session>,
  monitor: Arc<ConnectivityMonitor>,
  engine: Arc<SyncEngine>,
}

impl Client {
  fn connect(config: &Config, db: Database) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let session = Arc::new(Session::from_config(config));
    let rest = Arc::new(RestClient::new(&config.remote.url, &api_key, &session)?);
    let monitor = Arc::new(ConnectivityMonitor::new(Connectivity::Online));

    let engine = SyncEngine::new(
      Arc::clone(&session),
      rest.clone(),
      rest,
      db,
      Arc::clone(&monitor),
    )
    .with_default_ttl(config.cache.default_ttl());

    Ok(Self {
      config: config.clone(),
      api_key,
      session,
      monitor,
      engine: Arc::new(engine),
    })
  }

  async fn run(self, command: Command) -> Result<()> {
    match command {
      Command::Fetch {
        kind,
        skip_cache,
        ttl_secs,
        filters,
      } => {
        let options = LoadOptions {
          filters,
          ttl: ttl_secs.map(Duration::from_secs),
          skip_cache,
        };
        let fetched = self.engine.load_rows(kind, &options).await?;
        if fetched.result.is_stale() {
          let when = fetched
            .result
            .cached_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
          eprintln!("Offline: showing cached {} from {}", kind, when);
        }
        println!("{}", serde_json::to_string_pretty(&fetched.result.data)?);

        // Let the background refresh land in the cache before exiting
        if let Some(revalidation) = fetched.revalidation {
          revalidation.fresh().await;
        }
      }
      Command::Queue {
        action: QueueAction::Replay,
      } => {
        let report = self.engine.replay_queue().await?;
        println!("Synced {} queued change(s)", report.synced.len());
        for failure in &report.failed {
          eprintln!("Change #{} refused by the server: {}", failure.mutation_id, failure.error);
        }
        if let Some(failure) = report.interrupted {
          return Err(eyre!(
            "replay stopped at queued change #{}: {}",
            failure.mutation_id,
            failure.error
          ));
        }
      }
      Command::Create { kind, fields } => {
        print_outcome(self.engine.create(kind, to_object(fields)).await?)?;
      }
      Command::Edit {
        kind,
        id,
        fields,
        reason,
      } => {
        print_outcome(self.engine.edit(kind, &id, to_object(fields), reason).await?)?;
      }
      Command::Delete { kind, id, reason } => {
        print_outcome(self.engine.delete(kind, &id, reason).await?)?;
      }
      Command::Inbox => {
        let edits = self.engine.approvals().inbox().await?;
        if edits.is_empty() {
          println!("Nothing waiting for approval");
        }
        for edit in edits {
          println!(
            "{}  {} wants to {} {}/{}{}",
            edit.id,
            edit.requester_id,
            edit.operation,
            edit.resource_kind,
            edit.resource_id,
            edit
              .rationale
              .map(|reason| format!(" ({})", reason))
              .unwrap_or_default()
          );
        }
      }
      Command::Approve { edit_id } => match self.engine.approvals().approve(&edit_id).await? {
        ApprovalOutcome::RejectedStale => {
          println!("Record changed since the request was made; edit {} rejected", edit_id)
        }
        _ => println!("Approved {}", edit_id),
      },
      Command::Reject { edit_id } => {
        self.engine.approvals().reject(&edit_id).await?;
        println!("Rejected {}", edit_id);
      }
      Command::Watch { kind } => self.watch(kind).await?,
      Command::Cache { .. }
      | Command::Queue {
        action: QueueAction::List | QueueAction::Retry { .. },
      } => {}
    }
    Ok(())
  }

  async fn watch(&self, kind: ResourceKind) -> Result<()> {
    if let Some(addr) = reachability_target(&self.config.remote.url).await {
      self.monitor.spawn(tcp_reachability(addr, Duration::from_secs(10)));
    }
    let _replay = self.engine.spawn_reconnect_handler();

    let transport = RealtimeTransport::new(
      &self.config.remote.realtime_url(),
      &self.api_key,
      self.session.access_token.clone(),
      self.config.realtime.heartbeat(),
    )?;
    let manager = SubscriptionManager::new(Arc::new(transport), Arc::clone(&self.session))
      .with_reconnect_delay(self.config.realtime.reconnect_delay())
      .with_connectivity(Arc::clone(&self.monitor));

    let callbacks = Callbacks::new()
      .on_insert(|row| println!("{}", json!({"event": "insert", "record": row})))
      .on_update(|row| println!("{}", json!({"event": "update", "record": row})))
      .on_delete(|row| println!("{}", json!({"event": "delete", "record": row})));
    let subscription = manager.subscribe(kind, None, callbacks);
    info!(topic = subscription.topic(), "watching");

    tokio::signal::ctrl_c().await?;
    subscription.unsubscribe();
    Ok(())
  }
}

/// Host and port of the remote store, for the TCP reachability probe.
async fn reachability_target(remote_url: &str) -> Option<SocketAddr> {
  let url = Url::parse(remote_url).ok()?;
  let host = url.host_str()?.to_string();
  let port = url.port_or_known_default()?;
  tokio::net::lookup_host((host, port)).await.ok()?.next()
}

fn print_outcome(outcome: MutationOutcome) -> Result<()> {
  match outcome {
    MutationOutcome::Applied(row) => println!("{}", serde_json::to_string_pretty(&row)?),
    MutationOutcome::Queued(id) => println!("Offline: change queued as #{}", id),
    MutationOutcome::Deleted => println!("Deleted"),
    MutationOutcome::Requested(edit_id) => {
      println!("You are not the author; approval requested ({})", edit_id)
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_assignment_keeps_json_types() {
    assert_eq!(parse_assignment("amount=12.5").unwrap(), ("amount".to_string(), json!(12.5)));
    assert_eq!(parse_assignment("title=Groceries v2").unwrap().1, json!("Groceries v2"));
    assert_eq!(parse_assignment("done=true").unwrap().1, json!(true));
    assert!(parse_assignment("title").is_err());
  }

  #[test]
  fn test_args_parse_edit() {
    let args = Args::parse_from([
      "plansync", "edit", "note", "n1", "--set", "title=Groceries v2", "--reason", "typo fix",
    ]);
    match args.command {
      Command::Edit {
        kind, id, fields, reason,
      } => {
        assert_eq!(kind, ResourceKind::Notes);
        assert_eq!(id, "n1");
        assert_eq!(fields.len(), 1);
        assert_eq!(reason.as_deref(), Some("typo fix"));
      }
      other => panic!("unexpected command {:?}", other),
    }
  }
}
