use anyhow::{bail, Context, Result};
use clap::Parser;
use hello_fairy::domain::effects::{self, EffectKind};
use hello_fairy::domain::settings::SettingsService;
use hello_fairy::infrastructure::logging::init_logger;
use hello_fairy::{
    Color, CommandTicket, ControllerConfig, ControllerEvent, DeviceController, DryRunTransport,
    IntentStatus, MessageSeverity,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "hello_fairy_controller")]
#[command(about = "Hello Fairy curtain light controller\n\nBuilds the light's BLE frames for an intent and plays them through a dry-run transport.", long_about = None)]
struct Cli {
    /// Bluetooth address of the light (defaults to the last one used)
    address: Option<String>,

    /// Advertised name the simulated device reports
    #[arg(long, default_value = "Hello Fairy BLE256")]
    name: String,

    /// Solid color, as "#RRGGBB" or "R,G,B"
    #[arg(long)]
    color: Option<String>,

    /// Brightness 0-255; 0 turns the light off
    #[arg(long)]
    brightness: Option<u8>,

    /// Effect to play, by name
    #[arg(long)]
    effect: Option<String>,

    /// Turn the light off
    #[arg(long)]
    off: bool,

    /// Store the current state in the light's memory
    #[arg(long)]
    save: bool,

    /// Print the effect catalog and exit
    #[arg(long)]
    list_effects: bool,

    /// Load settings from this file instead of the user config directory
    #[arg(long)]
    settings: Option<PathBuf>,

    /// ATT MTU the simulated link negotiates
    #[arg(long)]
    mtu: Option<u16>,

    /// Make the first N writes fail, to watch retries
    #[arg(long, default_value_t = 0)]
    flaky: usize,
}

/// Parse "#RRGGBB" / "RRGGBB" or "R,G,B"
fn parse_color(text: &str) -> Result<Color> {
    let text = text.trim();
    if text.contains(',') {
        let channels = text
            .split(',')
            .map(|c| c.trim().parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Invalid color channel in {:?}", text))?;
        let &[r, g, b] = channels.as_slice() else {
            bail!("Expected three channels, got {}", channels.len());
        };
        return Ok(Color::try_from_channels(r, g, b)?);
    }

    let hex = text.trim_start_matches('#');
    if hex.len() != 6 {
        bail!("Expected #RRGGBB, got {:?}", text);
    }
    let value = u32::from_str_radix(hex, 16).with_context(|| format!("Invalid hex color {:?}", text))?;
    Ok(Color::new((value >> 16) as u8, (value >> 8) as u8, value as u8))
}

fn print_effects() {
    for effect in effects::EFFECTS {
        let kind = match effect.kind {
            EffectKind::Scene { scene_id } => format!("scene {}", scene_id),
            EffectKind::Animation { frames, .. } => format!("animation, {} frames", frames),
        };
        println!("{:>4}  {:<12} {}", effect.id, effect.name, kind);
    }
}

fn print_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::ConnectionStatus(status) => println!("[status] {:?}", status),
        ControllerEvent::StateChanged(state) => println!(
            "[state] {} brightness={} frame={}",
            state.mode.name(),
            state.brightness,
            state.frame_number
        ),
        ControllerEvent::CommandFailed { id, error } => println!("[failed] {}: {}", id, error),
        ControllerEvent::Notification(frame) => println!(
            "[notify] {:02X} {:02X} {:02X?}",
            frame.header, frame.command, frame.payload
        ),
        ControllerEvent::LogMessage(msg) => {
            let tag = match msg.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Success => "ok",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "error",
            };
            println!("[{}] {}", tag, msg.message);
        }
    }
}

async fn wait_for(controller: &DeviceController, tickets: &[CommandTicket]) {
    loop {
        let pending = tickets
            .iter()
            .any(|t| controller.ticket_status(t) == IntentStatus::Queued);
        if !pending {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_effects {
        print_effects();
        return Ok(());
    }

    let mut settings_service = match &cli.settings {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Settings loaded from {}", settings_service.path().display());

    let address = match cli.address.clone().or(settings.last_connected_address.clone()) {
        Some(address) => address,
        None => bail!("No device address given and none remembered"),
    };
    let color = cli.color.as_deref().map(parse_color).transpose()?;

    let transport = Arc::new(DryRunTransport::new(cli.name.clone(), cli.mtu));
    transport.fail_writes(cli.flaky);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let controller = DeviceController::new(transport.clone(), ControllerConfig::from(&settings), event_tx);
    controller.connect(&address).await?;
    if let Err(e) = settings_service.add_known_address(&address) {
        warn!("Could not remember {}: {}", address, e);
    }

    let mut tickets = Vec::new();
    if cli.off {
        tickets.push(controller.turn_off()?);
    } else {
        match (color, cli.brightness) {
            (Some(color), brightness) => tickets.push(controller.set_color(color, brightness.unwrap_or(255))?),
            (None, Some(brightness)) => tickets.push(controller.set_brightness(brightness)?),
            (None, None) => {}
        }
        if let Some(name) = &cli.effect {
            tickets.push(controller.select_effect(name)?);
        }
    }
    if cli.save {
        tickets.push(controller.save_state()?);
    }

    wait_for(&controller, &tickets).await;
    for ticket in &tickets {
        info!("Batch {:?}: {:?}", ticket.batch, controller.ticket_status(ticket));
    }
    println!("{} frame(s) written", transport.written().len());

    controller.disconnect().await;
    drop(controller);
    let _ = printer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_color_formats() {
        assert_eq!(parse_color("#FF0000").unwrap(), Color::RED);
        assert_eq!(parse_color("00ff7f").unwrap(), Color::new(0, 255, 127));
        assert_eq!(parse_color(" 1, 2 ,3 ").unwrap(), Color::new(1, 2, 3));
    }

    #[test]
    fn test_parse_color_rejects_garbage() {
        assert!(parse_color("256,0,0").is_err());
        assert!(parse_color("1,2").is_err());
        assert!(parse_color("#12345").is_err());
        assert!(parse_color("red").is_err());
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["hello_fairy_controller", "AA:BB", "--color", "#00FF00", "--brightness", "40", "--flaky", "2"]);
        assert_eq!(cli.address.as_deref(), Some("AA:BB"));
        assert_eq!(cli.brightness, Some(40));
        assert_eq!(cli.flaky, 2);
        assert!(!cli.off);
    }
}
