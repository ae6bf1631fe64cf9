use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, WrapErr};
use scsi_probe::probe::{
    Authorization, CapabilityProbe, CapabilityReport, ConsoleInteraction, ProbeConfig, Unattended,
    UserInteraction,
};
use scsi_probe::scsi::{RetryPolicy, ScsiDevice};
use scsi_probe::usb::{enumerate_usb_storage_devices, open_usb_device};
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "scsi-probe", about = "Discover what a SCSI device actually supports")]
struct Args {
    /// Index into the list of attached USB mass storage devices
    #[arg(default_value_t = 0)]
    device: usize,
    /// List attached devices and exit
    #[arg(long)]
    list: bool,
    /// Never prompt; removable media are not tested
    #[arg(long)]
    unattended: bool,
    /// Run the linear READ LONG search without asking
    #[arg(long)]
    exhaustive_long_search: bool,
    /// Try vendor specific read commands without asking
    #[arg(long)]
    vendor_commands: bool,
    /// Attempts while waiting for a unit to become ready
    #[arg(long, default_value_t = 20)]
    retries: u32,
    #[arg(long, default_value_t = 2000)]
    retry_delay_ms: u64,
    /// Per-command timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,
    /// -v for info, -vv for debug, -vvv for every command
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> ProbeConfig {
        let granted = |yes: bool| {
            if yes {
                Authorization::Always
            } else if self.unattended {
                Authorization::Never
            } else {
                Authorization::Ask
            }
        };
        ProbeConfig {
            timeout: Duration::from_secs(self.timeout),
            retry: RetryPolicy {
                max_attempts: self.retries,
                delay: Duration::from_millis(self.retry_delay_ms),
            },
            exhaustive_long_search: granted(self.exhaustive_long_search),
            vendor_commands: granted(self.vendor_commands),
            ..ProbeConfig::default()
        }
    }
}

fn probe<T, U>(
    device: ScsiDevice<T>,
    interaction: U,
    config: ProbeConfig,
) -> Result<CapabilityReport>
where
    T: scsi_probe::scsi::Transport,
    U: UserInteraction,
{
    let (report, _device) = CapabilityProbe::new(device, interaction, config).run()?;
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let mut devices = enumerate_usb_storage_devices().await?;
    if args.list {
        for (index, device) in devices.enumerate() {
            println!(
                "{index}: {:04x}:{:04x} {} {}",
                device.vendor_id(),
                device.product_id(),
                device.manufacturer_string().unwrap_or_default(),
                device.product_string().unwrap_or_default()
            );
        }
        return Ok(());
    }

    let device_info = devices
        .nth(args.device)
        .ok_or_eyre("no USB mass storage device at that index")?;
    info!(
        vendor_id = device_info.vendor_id(),
        product_id = device_info.product_id(),
        "probing"
    );
    let drive = open_usb_device(device_info).await?;

    let config = args.config();
    let cancel = config.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping at the next safe point");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let unattended = args.unattended;
    let report = tokio::task::spawn_blocking(move || {
        let device = ScsiDevice::new(drive);
        if unattended {
            probe(device, Unattended, config)
        } else {
            probe(device, ConsoleInteraction::stdio(), config)
        }
    })
    .await
    .wrap_err("probe task panicked")??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
