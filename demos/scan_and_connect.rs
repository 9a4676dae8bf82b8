use std::time::Duration;
use tracing::{error, info, warn};
use ftms_treadmill::{DeviceDescriptor, FitnessMachine, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🔍 FTMS Scan and Connect Example");

    let machine = FitnessMachine::with_default_adapter().await?;
    machine.initialize().await?;
    info!("Bluetooth: {}", machine.bluetooth_state().message());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    machine
        .start_scan(move |device| {
            tx.send(device.clone()).ok();
        })
        .await?;

    info!("Scanning for 10 seconds...");
    let mut devices: Vec<DeviceDescriptor> = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            Some(device) = rx.recv() => {
                info!("📡 Found {} ({}) rssi {:?}", device.display_name(), device.address, device.rssi);
                devices.push(device);
            }
        }
    }
    machine.stop_scan().await?;

    DeviceDescriptor::sort_by_signal(&mut devices);
    let Some(strongest) = devices.first() else {
        warn!("No fitness machines found");
        return Ok(());
    };

    let connected = match machine.connect(strongest).await {
        Ok(connected) => {
            info!("✅ Connected to: {}", connected.device.display_name());
            connected
        }
        Err(e) => {
            error!("❌ Failed to connect: {}", e);
            return Err(e);
        }
    };

    println!("Telemetry:     {}", connected.has_telemetry);
    println!("Control point: {}", connected.has_control_point);
    println!("Speed range:   {}", connected.has_speed_range);

    let range = machine.read_speed_range().await?;
    println!(
        "Speeds:        {:.1} - {:.1} km/h in {:.1} km/h steps",
        range.min_kmh, range.max_kmh, range.increment_kmh
    );

    machine.disconnect().await?;
    info!("👋 Disconnected");
    Ok(())
}
