//! CLI entry point for illumination_cal
//!
//! Provides command-line access to:
//! - single-curve and laser x power calibrations
//! - setting a sample power through the calibrated buckets
//! - inspecting and compacting the calibration history
//!
//! # Usage
//!
//! ```bash
//! illumination_cal calibrate --laser 488 --laser-power 100
//! illumination_cal protocol
//! illumination_cal set-power 488 12.5
//! illumination_cal show --select last_combinations
//! illumination_cal compact
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use illumination_cal::calibration::{
    CalibrationProtocol1D, CalibrationProtocol2D, CsvPlotExporter,
};
use illumination_cal::config::{Settings, DEFAULT_CONFIG_PATH};
use illumination_cal::control::PowerControlEngine;
use illumination_cal::hardware::{DeviceRegistry, Instruments};
use illumination_cal::storage::{CalibrationStore, IndexQuery, TimeSelector};

#[derive(Parser)]
#[command(name = "illumination_cal")]
#[command(about = "Attenuation calibration and power control for laser illumination", long_about = None)]
struct Cli {
    /// Configuration file (TOML format)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep the attenuator once, fit the curve and store it
    Calibrate {
        /// Laser to enable for the sweep (its wavelength is used for the record)
        #[arg(long)]
        laser: Option<String>,
        /// Wavelength in nm (defaults to [calibration] or the laser's wavelength)
        #[arg(long)]
        wavelength: Option<f64>,
        /// Laser output power in mW (defaults to [calibration])
        #[arg(long)]
        laser_power: Option<f64>,
    },

    /// Run the laser x power protocol from the [protocol] section
    Protocol,

    /// Deliver a sample power with a calibrated laser
    SetPower {
        /// Laser name
        laser: String,
        /// Requested sample power in mW
        power: f64,
    },

    /// Print stored calibrations
    Show {
        /// Device (defaults to the configured device)
        #[arg(long)]
        device: Option<String>,
        /// Wavelength in nm
        #[arg(long)]
        wavelength: Option<f64>,
        /// Laser output power in mW
        #[arg(long)]
        laser_power: Option<f64>,
        /// latest, last_date, last_combinations, all, YYYY-MM-DD or "YYYY-MM-DD HH:MM"
        #[arg(long, default_value = "last_combinations")]
        select: String,
    },

    /// Back up the history and keep only the latest row per combination
    Compact,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    let store = CalibrationStore::with_options(
        &settings.storage.database,
        settings.storage.store_options(),
    );

    match cli.command {
        Commands::Calibrate {
            laser,
            wavelength,
            laser_power,
        } => calibrate(&settings, store, laser, wavelength, laser_power).await,
        Commands::Protocol => run_protocol(&settings, store).await,
        Commands::SetPower { laser, power } => set_power(&settings, store, &laser, power).await,
        Commands::Show {
            device,
            wavelength,
            laser_power,
            select,
        } => {
            let mut query =
                IndexQuery::any().device(device.unwrap_or_else(|| settings.device.name.clone()));
            if let Some(wavelength) = wavelength {
                query = query.wavelength(wavelength);
            }
            if let Some(laser_power) = laser_power {
                query = query.laser_power(laser_power);
            }
            show(&store, &query, &select.parse::<TimeSelector>()?).await
        }
        Commands::Compact => {
            let backup = store.restart().await?;
            println!("Backup written to {}", backup.display());
            Ok(())
        }
    }
}

fn instruments(settings: &Settings) -> Result<Instruments> {
    Ok(DeviceRegistry::with_builtin().build(settings)?)
}

fn runner(
    settings: &Settings,
    instruments: &Instruments,
    store: CalibrationStore,
) -> Result<CalibrationProtocol1D> {
    let exporter = CsvPlotExporter::new(settings.storage.plot_dir());
    Ok(CalibrationProtocol1D::from_settings(settings, instruments, store)?
        .with_plotter(Arc::new(exporter)))
}

async fn calibrate(
    settings: &Settings,
    store: CalibrationStore,
    laser: Option<String>,
    wavelength: Option<f64>,
    laser_power: Option<f64>,
) -> Result<()> {
    let instruments = instruments(settings)?;
    let target = settings.calibration.as_ref();
    let laser_power = laser_power
        .or(target.map(|t| t.laser_power))
        .context("no laser power given; pass --laser-power or add a [calibration] section")?;

    let mut laser_wavelength = None;
    if let Some(name) = &laser {
        let device = instruments.lasers.get(name).with_context(|| {
            let known: Vec<&str> = instruments.lasers.keys().map(String::as_str).collect();
            format!("laser '{}' is not configured. Configured lasers: {}", name, known.join(", "))
        })?;
        device.set_power(laser_power).await?;
        device.set_enabled(true).await?;
        laser_wavelength = Some(device.wavelength());
    }
    let wavelength = wavelength
        .or(laser_wavelength)
        .or(target.map(|t| t.wavelength))
        .context("no wavelength given; pass --wavelength, --laser or add a [calibration] section")?;

    let outcome = runner(settings, &instruments, store)?
        .run(wavelength, laser_power)
        .await?;
    if let Some(name) = &laser {
        if let Some(device) = instruments.lasers.get(name) {
            device.set_enabled(false).await?;
        }
    }

    println!("{}", outcome.report);
    if let Some(plot) = outcome.plot {
        println!("Curve written to {}", plot.display());
    }
    Ok(())
}

async fn run_protocol(settings: &Settings, store: CalibrationStore) -> Result<()> {
    let instruments = instruments(settings)?;
    let runner = runner(settings, &instruments, store)?;
    let report = CalibrationProtocol2D::from_settings(settings, &instruments, runner)?
        .run()
        .await?;

    for laser in &report.calibrated {
        println!(
            "{} ({} nm): {} calibrations",
            laser.laser,
            laser.wavelength,
            laser.outcomes.len()
        );
    }
    if !report.skipped.is_empty() {
        println!("Skipped: {}", report.skipped.join(", "));
    }
    Ok(())
}

async fn set_power(
    settings: &Settings,
    store: CalibrationStore,
    laser: &str,
    power: f64,
) -> Result<()> {
    let instruments = instruments(settings)?;
    let mut engine = PowerControlEngine::from_settings(settings, &instruments, store)?;
    engine.set_laser(laser).await?;
    for (laser_power, (min, max)) in engine.power_ranges() {
        info!("laser power {} mW reaches [{}, {}] mW", laser_power, min, max);
    }

    let setting = engine.set_power(power).await?;
    println!(
        "laser {} at {} mW, attenuator at {:.4}, sample power {:.4} mW{}",
        laser,
        setting.laser_power,
        setting.control_value,
        setting.applied_power,
        if setting.clamped { " (clamped)" } else { "" }
    );
    Ok(())
}

async fn show(store: &CalibrationStore, query: &IndexQuery, selector: &TimeSelector) -> Result<()> {
    let records = store.load(query, selector).await?;
    for record in records {
        let key = record
            .key_pairs()
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        let parameters = record
            .parameters
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{}  {}", key, parameters);
    }
    Ok(())
}
