use anyhow::{bail, Context, Result};
use droid_hands::client::ChatClient;
use droid_hands::{AdbDevice, Agent, GroundingClient, Settings, VisionAssistant};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Usage:
///   cargo run --example android_task -- "Turn on Wi-Fi" [app name]
///   cargo run --example android_task -- --resume <task dir>
///
/// Reads `droid-hands.toml` (or `DROID_HANDS_CONFIG`) when present, and
/// `GROUNDING_*` / `ASSISTANT_*` variables from the environment or `.env`.
#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("DROID_HANDS_CONFIG").unwrap_or_else(|_| "droid-hands.toml".into());
    let mut settings = if std::path::Path::new(&config_path).exists() {
        Settings::load(&config_path)?
    } else {
        Settings::default()
    };

    let adb = AdbDevice::new();
    if settings.agent.device_id.is_empty() {
        let devices = adb.list_devices().await.context("listing adb devices")?;
        let Some(first) = devices.into_iter().next() else {
            bail!("no adb device attached");
        };
        settings.agent.device_id = first;
    }
    let (w, h) = adb.screen_size(&settings.agent.device_id).await;
    tracing::info!(device = %settings.agent.device_id, width = w, height = h, "using device");

    let grounding = GroundingClient::new(ChatClient::new(settings.grounding.clone())?);
    let assistant = VisionAssistant::new(ChatClient::new(settings.assistant.clone())?);
    let agent = Agent::new(adb, grounding, assistant.clone(), assistant.clone(), settings.agent.clone())
        .with_evaluator(assistant.clone())
        .with_loading_detector(assistant);

    let abort = agent.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let report = match args.as_slice() {
        [flag, dir] if flag == "--resume" => agent.resume(&PathBuf::from(dir)).await?,
        [task] => agent.run(task, None).await?,
        [task, app] => agent.run(task, Some(app.as_str())).await?,
        _ => bail!("usage: android_task <task> [app name] | --resume <task dir>"),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
