use std::time::Duration;
use tracing::info;
use ftms_treadmill::{
    mock::{sample_devices, treadmill_frame},
    FitnessMachine, MockTransport, Result, TREADMILL_DATA_UUID,
};

/// Walk through a whole session against the in-memory transport
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🧪 FTMS Mock Session Example");

    let machine = FitnessMachine::new(MockTransport::new());
    machine.initialize().await?;

    let connected = machine.connect(&sample_devices()[0]).await?;
    info!("✅ Connected to: {}", connected.device.display_name());

    let _telemetry = machine.subscribe_telemetry(|reading| {
        println!(
            "🏃 {:4.1} km/h │ {:6.3} km │ {:4} s",
            reading.speed_kmh, reading.distance_km, reading.elapsed_seconds
        );
    })?;

    machine.read_speed_range().await?;
    machine.request_control().await?;
    machine.start().await?;

    let mut distance_m = 0.0;
    for second in 1..=10u16 {
        let speed = machine.set_target_speed(2.0 + f64::from(second) * 0.25).await?;
        distance_m += speed / 3.6;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let frame = treadmill_frame(speed, distance_m as u32, second);
        machine.transport().notify(TREADMILL_DATA_UUID, frame);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    machine.stop().await?;
    machine.disconnect().await?;
    info!("👋 Session finished");
    Ok(())
}
