use std::time::Duration;
use tracing::{error, info, warn};
use ftms_treadmill::{FitnessMachine, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 FTMS Telemetry Monitor Example");

    let machine = FitnessMachine::with_default_adapter().await?;
    machine.initialize().await?;

    let _state_log = machine.on_connection_state_change(|state| {
        info!("Connection: {}", state.message());
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    machine
        .start_scan(move |device| {
            tx.send(device.clone()).ok();
        })
        .await?;

    info!("Waiting for a fitness machine...");
    let Ok(Some(device)) = tokio::time::timeout(Duration::from_secs(15), rx.recv()).await else {
        warn!("No fitness machine found");
        return Ok(());
    };

    if let Err(e) = machine.connect(&device).await {
        error!("❌ Failed to connect to {}: {}", device.display_name(), e);
        return Err(e);
    }
    machine.read_speed_range().await?;

    let _telemetry = machine.subscribe_telemetry(|reading| {
        println!(
            "🏃 {:5.2} km/h │ {:7.3} km │ {:5} s │ {:5} kcal │ {:6} steps",
            reading.speed_kmh,
            reading.distance_km,
            reading.elapsed_seconds,
            reading.energy_kcal,
            reading.steps
        );
    })?;

    machine.request_control().await?;
    machine.start().await?;
    let sent = machine.set_target_speed(3.0).await?;
    info!("Belt started at {:.1} km/h", sent);

    info!("Press Ctrl+C to stop");
    let mut link = machine.watch_connection_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Stopping");
            if let Err(e) = machine.stop().await {
                warn!("Stop command failed: {}", e);
            }
        }
        _ = link.wait_for(|s| !s.is_connected()) => {
            warn!("Link lost");
        }
    }

    machine.destroy().await;
    Ok(())
}
