use blue_dro::domain::settings::SettingsService;
use blue_dro::infrastructure::logging;

fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!("Starting BlueDRO");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(settings))
}

#[cfg(windows)]
async fn run(settings: SettingsService) -> anyhow::Result<()> {
    use blue_dro::infrastructure::bluetooth::winrt::WinRtBackend;
    use std::sync::Arc;

    blue_dro::presentation::console::run(Arc::new(WinRtBackend::new()), settings).await
}

#[cfg(not(windows))]
async fn run(_settings: SettingsService) -> anyhow::Result<()> {
    anyhow::bail!("BlueDRO needs the Windows Bluetooth LE stack")
}
