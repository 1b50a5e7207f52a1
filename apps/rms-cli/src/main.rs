//! Command-line front end for `rms_sync`. Talks to the sync engine
//! in-process against a local SQLite store — there is no daemon or IPC
//! layer here, only the library calls spec.md §4 describes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rms_blobstore::{BlobStore, HttpGatewayBlobStore};
use rms_sync::config::EngineConfig;
use rms_sync::context::SyncContext;
use rms_sync::engine::SyncEngine;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rms-cli")]
#[command(about = "CLI for the recordmoney sync engine", long_about = None)]
struct Cli {
    /// Path to the local sync-state database.
    #[arg(long, global = true, default_value = "rms-sync.db")]
    db: PathBuf,

    /// Pinning-gateway base URLs, comma free, repeatable.
    #[arg(long, global = true, default_value = "http://localhost:9000")]
    gateway: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap this device: generate keys, go solo-synced, create the
    /// Personal Ledger group.
    Setup {
        /// Display name for this device's owner.
        name: String,
    },

    /// Print this device's sync mode and id.
    Status,

    /// Run one publish + fetch/merge cycle against every known peer.
    Sync,

    /// Device pairing (spec.md §4.6).
    #[command(subcommand)]
    Pair(PairCommands),

    /// Group lifecycle (spec.md §4.7).
    #[command(subcommand)]
    Group(GroupCommands),

    /// List the malformed-content reports collected so far.
    Reports,
}

#[derive(Subcommand)]
enum PairCommands {
    /// Start pairing as the initiator; prints a QR payload as JSON.
    Init,
    /// Poll the initiator's pending invite for the joiner's response and
    /// confirm once the printed emoji fingerprint matches.
    Confirm { invite_id: Uuid },
    /// Join an existing pairing session from a QR payload (as JSON).
    Join { qr_json: String },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Create a new group owned by `self_person_uuid`.
    Create { name: String, self_person_uuid: Uuid },
    /// Remove a member from a group, rotating its GroupKey.
    RemoveMember { group_uuid: Uuid, group_name: String, member_person_uuid: Uuid },
}

async fn build_ctx(db: &PathBuf, gateways: Vec<String>) -> Result<SyncContext> {
    let store = rms_store::Store::open(db).await.context("opening sync store")?;
    let blob_store: Arc<dyn BlobStore> =
        Arc::new(HttpGatewayBlobStore::new(gateways.clone(), Duration::from_secs(30)));
    Ok(SyncContext::new(store, blob_store, EngineConfig::new(gateways)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let ctx = build_ctx(&cli.db, cli.gateway).await?;

    match cli.command {
        Commands::Setup { name } => {
            let provider_cfg = rms_sync::device::ProviderConfig { gateway_urls: ctx.config.gateway_urls.clone() };
            rms_sync::device::setup_device(&ctx, &provider_cfg, &name, Some(&|step| println!("... {step}")))
                .await
                .context("setup_device failed")?;
            let self_person_uuid = Uuid::new_v4();
            rms_sync::group::create_personal_ledger(&ctx, self_person_uuid).await?;
            println!("device ready, self person uuid: {self_person_uuid}");
        }

        Commands::Status => {
            let mode = rms_sync::device::sync_status(&ctx).await?;
            let device_id = ctx.device_id().await.ok();
            println!("mode: {mode:?}");
            println!("device id: {}", device_id.unwrap_or_else(|| "<none>".into()));
        }

        Commands::Sync => {
            let engine = SyncEngine::new(ctx);
            let result = engine.sync().await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "published": result.published,
                "mutations_applied": result.mutations_applied,
                "conflicts_detected": result.conflicts_detected,
                "peers_synced": result.peers_synced,
                "peers_failed": result.peers_failed,
            }))?);
        }

        Commands::Reports => {
            let reports = ctx.malformed_reports();
            for report in reports {
                println!(
                    "[{}] {} (mutation={:?}, target={:?})",
                    report.reported_at, report.reason, report.mutation_uuid, report.target_uuid
                );
            }
        }

        Commands::Pair(pair_cmd) => run_pair(&ctx, pair_cmd).await?,
        Commands::Group(group_cmd) => run_group(&ctx, group_cmd).await?,
    }

    Ok(())
}

async fn run_pair(ctx: &SyncContext, cmd: PairCommands) -> Result<()> {
    match cmd {
        PairCommands::Init => {
            let (invite_id, qr) = rms_sync::pairing::initiate_pairing(ctx, None).await?;
            println!("invite id: {invite_id}");
            println!("{}", serde_json::to_string_pretty(&qr)?);
        }
        PairCommands::Confirm { invite_id } => {
            let emojis = rms_sync::pairing::poll_until_response(ctx, invite_id).await?;
            println!("emoji fingerprint: {}", emojis.join(" "));
            print!("does this match the joiner's screen? [y/N] ");
            use std::io::Write;
            std::io::stdout().flush().ok();
            let mut answer = String::new();
            std::io::stdin().read_line(&mut answer)?;
            let matched = answer.trim().eq_ignore_ascii_case("y");
            rms_sync::pairing::confirm_as_initiator(ctx, invite_id, matched).await?;
            if matched {
                println!("paired");
            } else {
                return Err(anyhow!("emoji mismatch, pairing rejected"));
            }
        }
        PairCommands::Join { qr_json } => {
            let qr: rms_proto::QrPayload = serde_json::from_str(&qr_json).context("parsing QR payload")?;
            let emojis = rms_sync::pairing::join_pairing(ctx, &qr).await?;
            println!("emoji fingerprint: {}", emojis.join(" "));
            print!("does this match the initiator's screen? [y/N] ");
            use std::io::Write;
            std::io::stdout().flush().ok();
            let mut answer = String::new();
            std::io::stdin().read_line(&mut answer)?;
            if !answer.trim().eq_ignore_ascii_case("y") {
                return Err(anyhow!("emoji mismatch, pairing aborted"));
            }
            let a_ipns_public = rms_crypto::Ed25519PublicKey::from_bytes(qr.ipns_public_key.as_slice())?;
            let a_auth_public = rms_crypto::P256PublicKey::from_bytes(qr.auth_public_key.as_slice())?;
            rms_sync::pairing::complete_as_joiner(ctx, &a_ipns_public, &a_auth_public).await?;
            println!("paired");
        }
    }
    Ok(())
}

async fn run_group(ctx: &SyncContext, cmd: GroupCommands) -> Result<()> {
    match cmd {
        GroupCommands::Create { name, self_person_uuid } => {
            let group = rms_sync::group::create_group(ctx, &name, self_person_uuid).await?;
            println!("group {} created: {}", group.uuid, group.name);
        }
        GroupCommands::RemoveMember { group_uuid, group_name, member_person_uuid } => {
            let group = rms_proto::Group {
                uuid: group_uuid,
                name: group_name,
                members: vec![],
                is_personal_ledger: false,
            };
            // The CLI has no person-to-device directory to resolve remaining
            // members' auth public keys, so the PeerDirectory rewrite is
            // skipped here; a real client wires its own LocalStore in.
            rms_sync::group::remove_member(ctx, &group, member_person_uuid, &[]).await?;
            println!("member {member_person_uuid} removed from {group_uuid}, group key rotated");
        }
    }
    Ok(())
}
