use anyhow::{Context, Result};
use device_console::{
    config::AppConfig,
    controller::UpdateController,
    update_service_client::{HttpUpdateServiceClient, PackageUpload},
};
use env_logger::{Builder, Env, Target};
use log::{error, info, warn};
use std::io::Write;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize()?;

    let package_path = std::env::args()
        .nth(1)
        .context("usage: device-console <package.tar.gz.enc>")?;

    let client =
        HttpUpdateServiceClient::new().context("failed to create update service client")?;
    let controller = UpdateController::new(client);

    // echo the console timeline to stdout as it grows
    let mut lines = controller.timeline().follow();
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            println!("{}", line.render());
        }
    });

    controller.initialize().await;

    let package = PackageUpload::from_path(&package_path).await?;
    controller.choose_package(package);
    controller.upload().await?;

    let view = controller.view();
    if view.start_update_enabled {
        controller.start_update().await?;
    } else {
        warn!(
            "start update is not available (current: {}, target: {})",
            view.current_version, view.target_version
        );
    }

    let log_path = controller
        .save_logs(&AppConfig::get().export.log_dir)
        .await?;
    info!("update logs saved to {}", log_path.display());

    Ok(())
}

fn initialize() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));

    Ok(())
}
