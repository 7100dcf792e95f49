//! One-shot governance status query against a running bot.
//!
//! Usage: `govstat [--json] [--audit <guild_id>] [--follow]`
//!
//! `--follow` keeps the connection open and prints audit entries as the bot
//! records them.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use log::debug;
use std::time::Duration;

use gatekeeper::commands::format_status_message;
use gatekeeper::core::TenantId;
use gatekeeper::features::audit::AuditRecord;
use gatekeeper::ipc::{get_socket_path, BotEvent, IpcClient};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Audit entries shown with `--audit`
const AUDIT_LIMIT: usize = 20;

struct Args {
    json: bool,
    audit_tenant: Option<TenantId>,
    follow: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        json: false,
        audit_tenant: None,
        follow: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => args.json = true,
            "--follow" => args.follow = true,
            "--audit" => {
                let id = iter
                    .next()
                    .ok_or_else(|| anyhow!("--audit needs a guild id"))?;
                let id: u64 = id.parse().with_context(|| format!("invalid guild id: {id}"))?;
                args.audit_tenant = Some(TenantId(id));
            }
            other => return Err(anyhow!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = parse_args()?;
    let socket_path = get_socket_path();
    debug!("Querying bot at {socket_path}");

    let mut client = IpcClient::connect_to(&socket_path)
        .await
        .with_context(|| format!("is the bot running? (socket: {socket_path})"))?;

    let status = client.fetch_status(REPLY_TIMEOUT).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{}", format_status_message(&status));
    }

    if let Some(tenant_id) = args.audit_tenant {
        let records = client
            .fetch_recent_audit(tenant_id, AUDIT_LIMIT, REPLY_TIMEOUT)
            .await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else {
            println!("\nRecent audit entries for {tenant_id}:");
            for record in &records {
                print_record(record);
            }
        }
    }

    if args.follow {
        println!("\nFollowing audit entries (Ctrl-C to stop)...");
        while let Some(event) = client.recv().await {
            match event {
                BotEvent::AuditLogged { record } if args.json => {
                    println!("{}", serde_json::to_string(&record)?)
                }
                BotEvent::AuditLogged { record } => print_record(&record),
                other => debug!("Ignoring {:?}", other),
            }
        }
        println!("Bot closed the connection");
    }

    Ok(())
}

fn print_record(record: &AuditRecord) {
    let target = record
        .target_id
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<6} {:<20} actor {:<20} target {}",
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.tenant_id,
        record.action.to_string(),
        record.actor_id,
        target
    );
}
