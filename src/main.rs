//! Interactive console wired to a simulated rig.
//!
//! Connects a simulated cryostat, binds a temperature quantity, registers a
//! background auto-recorder and a pauseable warm-up sequence, then hands
//! control to a stdin REPL. `help` lists the commands; `quit` exits after a
//! clean shutdown.

use clap::Parser;
use labrig::config::Settings;
use labrig::console::Console;
use labrig::instrument::{InstrumentBuilder, Property};
use labrig::logging;
use labrig::quantity::Quantity;
use labrig::recorder::{AutoRecorder, CsvSink, Recorder};
use labrig::registry::{ConnectionAddress, ConnectionRegistry};
use labrig::sequence::Sequence;
use labrig::transport::{self, SimulatedInstrument, Transport, TransportError, TransportFactory};
use labrig::wait::{self, Wait, WaitResult};
use std::io::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "labrig", about = "Laboratory rig console (simulated instruments)")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<String>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

fn simulated_factory() -> TransportFactory {
    transport::factory(|address: String| async move {
        if address.contains("CRYO") {
            Ok(Box::new(
                SimulatedInstrument::new("LABRIG,DemoCryostat,sn001,1.0")
                    .with_ramping_register("KELV?", 15.0, 0.5)
                    .with_register("SETP?", 15.0)
                    .with_setter("SETP", "SETP?")
                    .with_noise(0.05),
            ) as Box<dyn Transport>)
        } else {
            Err(TransportError::Open(
                address,
                "no simulated device at this address".to_string(),
            ))
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::new(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }
    logging::init(&settings)?;

    let registry = ConnectionRegistry::with_holdoff(settings.timing.io_holdoff);
    let factory = simulated_factory();

    let cryostat = InstrumentBuilder::new("DemoCryostat")
        .identity("LABRIG,DemoCryostat")
        .property("temperature", Property::get_only("KELV?", "K"))
        .property("setpoint", Property::get_set("SETP?", "SETP {value}", "K"))
        .connect(&registry, &ConnectionAddress::new("SIM::CRYO::INSTR"), &factory)
        .await?;

    let temperature = Quantity::from_property(&["Temperature"], &cryostat, "temperature")?
        .verified()
        .await?;
    let setpoint = Arc::new(Quantity::from_property(&["Setpoint"], &cryostat, "setpoint")?);

    let mut console = Console::new();

    let sink = CsvSink::create(settings.storage.data_dir.join("bench_log"));
    let recorder = Recorder::new(vec![temperature.clone()], Box::new(sink)).await?;
    console.add_recorder(AutoRecorder::new("bench", recorder));

    let wait_settings = Wait::new(settings.timing.poll_interval, settings.timing.wait_timeout);
    let warmup_temperature = temperature.clone();
    let warmup_setpoint = setpoint.clone();
    let warmup = Sequence::new("warmup", move |mut ctx| async move {
        for target in [20.0, 30.0, 40.0] {
            ctx.checkpoint().await?;
            warmup_setpoint.write(&[target]).await?;
            tracing::info!(kelvin = target, "setpoint moved, waiting for settle");
            match ctx
                .wait_until(&warmup_temperature, wait::at_least(target), &wait_settings)
                .await?
            {
                WaitResult::Satisfied => tracing::info!(kelvin = target, "settled"),
                WaitResult::TimedOut => anyhow::bail!("never settled at {target} K"),
                WaitResult::Aborted => return Ok(()),
            }
        }
        Ok(())
    });
    console.add_sequence(Arc::new(warmup));

    println!("labrig console — 'help' for commands, 'quit' to exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line == "quit" || line == "exit" {
            break;
        }
        match console.dispatch(line).await {
            Ok(reply) if !reply.is_empty() => println!("{reply}"),
            Ok(_) => {}
            Err(e) => println!("error: {e}"),
        }
    }

    console.shutdown().await;
    drop(temperature);
    drop(setpoint);
    drop(cryostat);
    registry.shutdown().await;
    Ok(())
}
