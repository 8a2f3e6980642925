use chatvault::config::WorkflowConfig;
use chatvault::controller::{ConfirmTrigger, WorkflowController};
use chatvault::keystore::{FileKeyStore, KeyStore};
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "chatvault")]
#[command(about = "Decrypts an encrypted message-store archive in two passes")]
struct Args {
    /// Endpoint of the decrypt service (ws/wss streams progress, http/https
    /// uses the single-call fallback)
    #[arg(long, default_value = "ws://127.0.0.1:8777")]
    endpoint: String,

    /// Account the archive belongs to
    #[arg(long)]
    account: String,

    /// 64-character hex database key
    #[arg(long)]
    db_key: String,

    /// Path to the encrypted archive
    #[arg(long)]
    path: String,

    /// Media XOR key (1-2 hex digits, optional 0x prefix)
    #[arg(long)]
    xor_key: Option<String>,

    /// Media AES key (at least 16 characters)
    #[arg(long)]
    aes_key: Option<String>,

    /// Stop after the database pass without decrypting media
    #[arg(long)]
    skip_media: bool,

    /// Directory for persisted key bundles
    #[arg(long)]
    key_store: Option<PathBuf>,

    /// Use the single-call HTTP fallback even for a websocket endpoint
    #[arg(long)]
    force_sync: bool,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        if let Err(e) = run(args).await {
            error!("{e:#}");
            std::process::exit(1);
        }
    });
}

async fn run(args: Args) -> anyhow::Result<()> {
    let key_store: Option<Arc<dyn KeyStore>> = match &args.key_store {
        Some(path) => match FileKeyStore::new(path.clone()).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(
                    "Key store unavailable at {}: {e}; continuing without persistence",
                    path.display()
                );
                None
            }
        },
        None => None,
    };

    let config = WorkflowConfig {
        endpoint: args.endpoint.clone(),
        account: args.account.clone(),
        force_sync: args.force_sync,
    };
    let mut controller = WorkflowController::from_config(config, key_store);
    controller.load_stored_keys().await;

    let cancel = controller.cancel_handle();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            info!("Interrupt received; cancelling the running operation");
            cancel.cancel();
        }
    });

    let report = controller
        .submit_database_credentials(&args.db_key, &args.path)
        .await?;
    if report.cancelled {
        info!("Database pass cancelled; exiting");
        return Ok(());
    }
    if let Some(warning) = &report.warning {
        warn!("{warning}");
    }
    info!(
        "Database pass done: {} ok, {} failed, {} skipped",
        report.operation.succeeded, report.operation.failed, report.operation.skipped
    );

    let xor_input = args.xor_key.as_deref().unwrap_or("");
    let aes_input = args.aes_key.as_deref().unwrap_or("");

    if args.skip_media {
        controller
            .confirm_media_keys(xor_input, aes_input, ConfirmTrigger::Skip)
            .await?;
        info!("Media decrypt skipped at the operator's request");
        return Ok(());
    }

    controller
        .confirm_media_keys(xor_input, aes_input, ConfirmTrigger::Next)
        .await?;

    let report = controller.run_media_batch_decrypt().await?;
    if report.cancelled {
        info!("Media pass cancelled; exiting");
        return Ok(());
    }
    if let Some(warning) = &report.warning {
        warn!("{warning}");
    }
    info!(
        "Media pass done: {} ok, {} failed, {} skipped",
        report.operation.succeeded, report.operation.failed, report.operation.skipped
    );

    Ok(())
}
