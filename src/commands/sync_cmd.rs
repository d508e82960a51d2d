//! Sync CLI commands: drain the queue, inspect it, and pull server state.

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use uuid::Uuid;

use platelog::config::Config;
use platelog::db::{LocalMealRepository, QueueRepository};
use platelog::sync::{HttpTransport, SyncQueueProcessor};

/// Everything sync commands may need. Transport and processor are absent
/// when no server is configured; queue inspection still works then.
pub struct SyncContext<'a> {
    pub queue: &'a QueueRepository,
    pub local: &'a LocalMealRepository,
    pub transport: Option<&'a HttpTransport>,
    pub processor: Option<&'a SyncQueueProcessor>,
}

/// Sync with remote server
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and queue status
    Status,

    /// Pull meals from the server into the local view
    Pull {
        /// Only meals changed after this time (RFC 3339)
        #[arg(long)]
        since: Option<String>,

        /// Page size
        #[arg(long, default_value = "500")]
        limit: i64,
    },

    /// Put a permanently failed change back on the retry schedule
    Retry {
        /// Operation ID (UUID)
        operation_id: String,
    },

    /// Drop a queued change without sending it
    Discard {
        /// Operation ID (UUID)
        operation_id: String,
    },
}

impl SyncCommand {
    pub async fn run(
        &self,
        ctx: SyncContext<'_>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            None => self.drain(&ctx).await,
            Some(SyncSubcommand::Status) => self.status(&ctx, config).await,
            Some(SyncSubcommand::Pull { since, limit }) => self.pull(&ctx, since, *limit).await,
            Some(SyncSubcommand::Retry { operation_id }) => {
                self.retry(&ctx, operation_id).await
            }
            Some(SyncSubcommand::Discard { operation_id }) => {
                self.discard(&ctx, operation_id).await
            }
        }
    }

    async fn drain(&self, ctx: &SyncContext<'_>) -> Result<(), Box<dyn std::error::Error>> {
        let processor = ctx.processor.ok_or(NOT_CONFIGURED)?;

        println!("Syncing with server...");
        let report = processor.drain().await?;

        if report.attempted == 0 {
            println!("Nothing to sync.");
            return Ok(());
        }

        println!("  {} change(s) attempted", report.attempted);
        println!("  {} delivered", report.completed);
        if report.conflicts > 0 {
            println!("  {} resolved against newer server versions", report.conflicts);
        }
        if report.rescheduled > 0 {
            println!("  {} will retry later", report.rescheduled);
        }
        if report.failed_terminal > 0 {
            println!(
                "  {} failed permanently (see 'platelog sync status')",
                report.failed_terminal
            );
        }
        Ok(())
    }

    async fn status(
        &self,
        ctx: &SyncContext<'_>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        match config.sync.credentials() {
            None => {
                println!("Status: Not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  sync:");
                println!("    server_url: \"https://localhost:8080\"");
                println!("    api_key: \"your-api-key\"");
                println!();
                println!("Or set environment variables:");
                println!("  PLATELOG_SERVER_URL");
                println!("  PLATELOG_API_KEY");
            }
            Some((server_url, api_key)) => {
                println!("Server:  {}", server_url);
                println!("API Key: {}...", key_preview(api_key));
                println!();

                print!("Server status: ");
                match ctx.transport {
                    Some(transport) if transport.check_health().await => println!("✓ reachable"),
                    Some(_) => println!("✗ unreachable"),
                    None => println!("✗ not configured"),
                }
            }
        }

        println!();
        println!("Queued changes: {}", ctx.queue.pending_count().await?);

        let stuck = ctx.queue.needs_attention().await?;
        if !stuck.is_empty() {
            println!();
            println!("Permanently failed (retry or discard by operation ID):");
            for record in &stuck {
                println!(
                    "  {}  {} {}  {}",
                    record.operation_id,
                    record.operation_type,
                    record.target_id,
                    record.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Ok(())
    }

    async fn pull(
        &self,
        ctx: &SyncContext<'_>,
        since: &Option<String>,
        limit: i64,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let transport = ctx.transport.ok_or(NOT_CONFIGURED)?;

        let since = since
            .as_ref()
            .map(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| format!("Invalid time '{}'. Use RFC 3339.", s))
            })
            .transpose()?;

        let page = transport.fetch_meals(since, limit).await?;
        for meal in &page.meals {
            ctx.local.adopt_server(meal).await?;
        }

        println!("Pulled {} meal(s).", page.meals.len());
        if page.has_more {
            println!("More changes available; run 'platelog sync pull' again.");
        }
        Ok(())
    }

    async fn retry(
        &self,
        ctx: &SyncContext<'_>,
        operation_id: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let operation_id = parse_operation_id(operation_id)?;
        if !ctx.queue.retry_now(operation_id).await? {
            return Err(format!("No failed change with ID {}", operation_id).into());
        }

        println!("Change {} queued for retry.", operation_id);
        if let Some(processor) = ctx.processor {
            let report = processor.drain().await?;
            if report.completed > 0 {
                println!("Delivered.");
            }
        }
        Ok(())
    }

    async fn discard(
        &self,
        ctx: &SyncContext<'_>,
        operation_id: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let operation_id = parse_operation_id(operation_id)?;
        let record = ctx
            .queue
            .get(operation_id)
            .await?
            .ok_or_else(|| format!("No queued change with ID {}", operation_id))?;

        ctx.queue.complete(operation_id).await?;
        println!(
            "Discarded {} {} for meal {}.",
            record.operation_type, operation_id, record.target_id
        );
        println!("The local view may now differ from the server; 'platelog sync pull' reconciles.");
        Ok(())
    }
}

const NOT_CONFIGURED: &str =
    "sync is not configured; set sync.server_url and sync.api_key in the config file";

fn parse_operation_id(s: &str) -> Result<Uuid, String> {
    Uuid::parse_str(s).map_err(|_| format!("Invalid operation UUID: {}", s))
}

// Keys are not guaranteed ASCII; taking chars keeps the cut on a boundary.
fn key_preview(key: &str) -> String {
    key.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_preview_handles_multibyte_keys() {
        assert_eq!(key_preview("abcdefghij"), "abcdefgh");
        assert_eq!(key_preview("äßç"), "äßç");
        assert_eq!(key_preview("ключ-секрет"), "ключ-сек");
    }

    #[test]
    fn test_parse_operation_id_rejects_garbage() {
        assert!(parse_operation_id("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_operation_id(&id.to_string()).unwrap(), id);
    }
}
