use canseek_core::bruteforce::{PayloadSpec, SweepPlan, brute_force};
use canseek_core::calibration::{CalibrationSet, calibrate_interactive};
use canseek_core::config::SessionConfig;
use canseek_core::corpus::{Corpus, load_log};
use canseek_core::finding::FindingLog;
use canseek_core::localizer::{Localization, Localizer, SearchMode};
use canseek_core::message::CanMessage;
use canseek_core::mutation::mutation_scan;
use canseek_core::observer::{CalibratedSensor, CommandSensor, Observer};
use canseek_core::omission::omission_scan;
use canseek_core::scan::{IdentifyTrigger, LivenessCheck, ScanReport, ScanSettings};
use canseek_core::transport::CommandTransport;

use clap::{Parser, Subcommand};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "canseek.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Find the bus frame behind a physical effect", long_about = None)]
struct Cli {
    /// Session configuration (TOML). Defaults to ./canseek.toml when present.
    #[clap(long, global = true, value_parser)]
    config: Option<PathBuf>,
    /// Persisted calibration record; calibrates interactively when absent.
    #[clap(long, global = true, value_parser)]
    calibration: Option<PathBuf>,
    /// Number of sensor channels to use.
    #[clap(long, global = true)]
    channels: Option<usize>,
    /// Print results as JSON.
    #[clap(long, global = true)]
    json: bool,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bisect a recorded log down to the frame that switches a channel
    Identify {
        /// candump or python-can log file
        file: PathBuf,
        /// Delay between messages in seconds (overrides log timestamps)
        #[clap(long, short)]
        delay: Option<f64>,
        /// Find both the ON and the OFF frame
        #[clap(long)]
        dual: bool,
        #[clap(long, default_value_t = 0)]
        channel: usize,
    },
    /// Sweep an identifier range and localize sensor changes
    Bruteforce {
        /// Hex payload, payloads separated by ':', or "random"
        payloads: String,
        /// Delay between frames in seconds
        #[clap(long, short, default_value_t = 0.1)]
        delay: f64,
        #[clap(long, value_parser = parse_u32)]
        min: Option<u32>,
        #[clap(long, value_parser = parse_u32)]
        max: Option<u32>,
        /// Scan J1939 PGNs instead of raw identifiers
        #[clap(long)]
        j1939: bool,
        #[clap(long, value_parser = parse_u8)]
        source_min: Option<u8>,
        #[clap(long, value_parser = parse_u8)]
        source_max: Option<u8>,
        /// Localize the responsible frame when the sensor changes
        #[clap(long)]
        ident: bool,
        /// Only localize changes on this channel (default: first changed channel)
        #[clap(long)]
        ident_channel: Option<usize>,
        #[clap(long)]
        dual: bool,
        /// Send the verification frame after every N frames
        #[clap(long)]
        verify_every: Option<usize>,
        /// Seconds to wait for the verification response
        #[clap(long, default_value_t = 1.0)]
        verify_timeout: f64,
        /// Frame known to switch the verification channel ON, as ID#DATA
        #[clap(long)]
        verify_message: Option<String>,
        #[clap(long, default_value_t = 0)]
        verify_channel: usize,
        /// RNG seed for random payloads
        #[clap(long)]
        seed: Option<u64>,
    },
    /// Leave each identifier out of a log in turn to find the one the effect needs
    Absence {
        file: PathBuf,
        #[clap(long, short)]
        delay: Option<f64>,
        #[clap(long, default_value_t = 0)]
        channel: usize,
    },
    /// Flip payload bits of one frame and localize sensor changes
    Mutate {
        /// Base frame as ID#DATA
        frame: String,
        #[clap(long)]
        start_bit: usize,
        #[clap(long)]
        end_bit: usize,
        #[clap(long, short, default_value_t = 0.1)]
        delay: f64,
        #[clap(long)]
        ident: bool,
        #[clap(long)]
        ident_channel: Option<usize>,
        #[clap(long)]
        dual: bool,
    },
    /// Print the calibrated sensor state
    Monitor {
        #[clap(long, default_value_t = 100)]
        interval_ms: u64,
        /// Stop after this many samples
        #[clap(long)]
        samples: Option<u64>,
    },
    /// Record ON/OFF reference readings and save them
    Calibrate { out: PathBuf },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_u32(s)?;
    u8::try_from(value).map_err(|_| format!("{s} does not fit in a byte"))
}

fn confirm_on_stdin(prompt: &str) -> std::io::Result<()> {
    eprint!("{prompt} ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stdin closed",
        ));
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<SessionConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            SessionConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_config_path.exists() {
                info!("Loading default configuration {default_config_path:?}");
                SessionConfig::load_from_file(&default_config_path)
            } else {
                info!("No configuration file, using built-in defaults");
                Ok(SessionConfig::default())
            }
        }
    }
}

fn sensor_driver(config: &SessionConfig, channels: usize) -> Result<CommandSensor, anyhow::Error> {
    if config.sensor.command.is_empty() {
        anyhow::bail!("No sensor command configured ([sensor] command)");
    }
    Ok(CommandSensor::new(config.sensor.command.clone(), channels))
}

fn calibrated_sensor(
    cli_calibration: Option<&Path>,
    config: &SessionConfig,
    channels: usize,
) -> Result<CalibratedSensor<CommandSensor>, anyhow::Error> {
    let mut driver = sensor_driver(config, channels)?;
    let calibrations = match cli_calibration.or(config.sensor.calibration_file.as_deref()) {
        Some(path) => {
            info!("Loading calibration from {path:?}");
            CalibrationSet::load(path, channels)?
        }
        None => calibrate_interactive(&mut driver, channels, confirm_on_stdin)?,
    };
    Ok(CalibratedSensor::new(
        driver,
        calibrations,
        config.timing.poll_interval(),
    )?)
}

/// Sensor and bus for the commands that drive the target.
fn connect(
    cli_calibration: Option<&Path>,
    config: &SessionConfig,
    channels: usize,
) -> Result<(CalibratedSensor<CommandSensor>, CommandTransport), anyhow::Error> {
    let sensor = calibrated_sensor(cli_calibration, config, channels)?;
    let transport = CommandTransport::new(config.transport.command.clone())?;
    Ok((sensor, transport))
}

/// A corpus that fails to parse is reported and treated as nothing to do.
fn load_corpus(file: &Path, delay: Option<f64>) -> Option<Corpus> {
    match load_log(file, delay) {
        Ok(corpus) if corpus.is_empty() => {
            warn!("No messages parsed from {file:?}");
            None
        }
        Ok(corpus) => {
            info!(
                messages = corpus.len(),
                ids = corpus.distinct_ids().len(),
                "Parsed {file:?}"
            );
            Some(corpus)
        }
        Err(e) => {
            error!("{e}");
            None
        }
    }
}

fn identify_trigger(ident: bool, channel: Option<usize>) -> IdentifyTrigger {
    match (ident, channel) {
        (false, _) => IdentifyTrigger::Off,
        (true, Some(channel)) => IdentifyTrigger::Channel(channel),
        (true, None) => IdentifyTrigger::FirstChanged,
    }
}

fn search_mode(dual: bool) -> SearchMode {
    if dual { SearchMode::Dual } else { SearchMode::Single }
}

fn print_scan_report(report: &ScanReport, json: bool) -> Result<(), anyhow::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("Sent {} frames, {} sensor changes", report.sent, report.edges.len());
    for edge in &report.edges {
        println!(
            "  after #{} ({}): {} -> {}",
            edge.sent_index, edge.trigger, edge.before, edge.after
        );
    }
    print_findings(&report.findings);
    for (channel, polarity) in &report.exhausted {
        println!("  channel {channel}: no {polarity} frame found in history");
    }
    Ok(())
}

fn print_findings(findings: &FindingLog) {
    for finding in findings.iter() {
        println!(
            "{} message on channel {}: {} (arb id 0x{:08x}, data {:02x?})",
            finding.polarity,
            finding.channel,
            finding.frame,
            finding.message.arb_id(),
            finding.message.data()
        );
    }
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    let channels = cli.channels.unwrap_or(config.sensor.channels);
    let localizer_settings = config.timing.localizer();

    let calibration = cli.calibration.as_deref();

    match cli.command {
        Commands::Identify {
            file,
            delay,
            dual,
            channel,
        } => {
            let Some(corpus) = load_corpus(&file, delay) else {
                return Ok(());
            };
            let (mut sensor, mut transport) = connect(calibration, &config, channels)?;
            let start = Instant::now();
            let localization = Localizer::new(
                &mut sensor,
                &mut transport,
                channel,
                localizer_settings,
            )
            .localize(&corpus, search_mode(dual))?;
            info!("Localization took {:.1?}", start.elapsed());

            let mut findings = FindingLog::new();
            findings.record_localization(channel, &localization);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&findings)?);
            } else {
                print_findings(&findings);
                if let Localization::Exhausted { polarity, rounds, .. } = localization {
                    println!("No responsible {polarity} message found after {rounds} rounds");
                }
            }
        }
        Commands::Bruteforce {
            payloads,
            delay,
            min,
            max,
            j1939,
            source_min,
            source_max,
            ident,
            ident_channel,
            dual,
            verify_every,
            verify_timeout,
            verify_message,
            verify_channel,
            seed,
        } => {
            let payloads: PayloadSpec = payloads.parse()?;
            let delay = canseek_core::message::clamp_delay(delay);
            let mut plan = if j1939 {
                SweepPlan::j1939(payloads, delay)
            } else {
                SweepPlan::standard(payloads, delay)
            };
            let default_source = config.scan.default_source_address;
            plan.sources = source_min.unwrap_or(default_source)..=source_max.unwrap_or(default_source);
            plan.ids = min.unwrap_or(*plan.ids.start())..=max.unwrap_or(*plan.ids.end());

            let liveness = match (verify_every, verify_message) {
                (Some(interval), Some(text)) => Some(LivenessCheck {
                    interval,
                    timeout: canseek_core::message::clamp_delay(verify_timeout),
                    message: CanMessage::parse_frame(&text, Duration::ZERO)?,
                    channel: verify_channel,
                }),
                (Some(_), None) => anyhow::bail!("--verify-every needs --verify-message"),
                (None, _) => None,
            };
            let settings = ScanSettings {
                history_len: ScanSettings::history_len_for(config.scan.history_latency(), delay),
                identify: identify_trigger(ident, ident_channel),
                search_mode: search_mode(dual),
                liveness,
                localizer: localizer_settings,
            };
            let seed = seed.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or_default()
            });
            info!(seed, "Random generator seeded");

            let (mut sensor, mut transport) = connect(calibration, &config, channels)?;
            let report = brute_force(
                &mut sensor,
                &mut transport,
                plan,
                settings,
                ChaCha8Rng::seed_from_u64(seed),
            )?;
            print_scan_report(&report, cli.json)?;
        }
        Commands::Absence {
            file,
            delay,
            channel,
        } => {
            let Some(corpus) = load_corpus(&file, delay) else {
                return Ok(());
            };
            let (mut sensor, mut transport) = connect(calibration, &config, channels)?;
            let report = omission_scan(
                &mut sensor,
                &mut transport,
                &corpus,
                channel,
                localizer_settings.signal_delay,
                localizer_settings.repeat_delay,
            )?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                match report.responsible {
                    Some(id) => println!("Found id: 0x{id:08x}"),
                    None => println!(
                        "Effect reproduced without each of {} ids, none is solely responsible",
                        report.tested.len()
                    ),
                }
            }
        }
        Commands::Mutate {
            frame,
            start_bit,
            end_bit,
            delay,
            ident,
            ident_channel,
            dual,
        } => {
            let delay = canseek_core::message::clamp_delay(delay);
            let base = CanMessage::parse_frame(&frame, delay)?;
            let (mut sensor, mut transport) = connect(calibration, &config, channels)?;
            let settings = ScanSettings {
                history_len: ScanSettings::history_len_for(config.scan.history_latency(), delay),
                identify: identify_trigger(ident, ident_channel),
                search_mode: search_mode(dual),
                liveness: None,
                localizer: localizer_settings,
            };
            let report =
                mutation_scan(&mut sensor, &mut transport, base, start_bit..=end_bit, settings)?;
            print_scan_report(&report, cli.json)?;
        }
        Commands::Monitor {
            interval_ms,
            samples,
        } => {
            let mut sensor = calibrated_sensor(calibration, &config, channels)?;
            let interval = Duration::from_millis(interval_ms);
            let mut taken = 0u64;
            while samples.is_none_or(|limit| taken < limit) {
                let mut line = Vec::with_capacity(channels);
                for channel in 0..sensor.channel_count() {
                    let margin = sensor.margin(channel)?;
                    line.push((margin < 0.0, margin));
                }
                if cli.json {
                    let values: Vec<serde_json::Value> = line
                        .iter()
                        .map(|(on, margin)| serde_json::json!({ "on": on, "margin": margin }))
                        .collect();
                    println!("{}", serde_json::Value::Array(values));
                } else {
                    let text: Vec<String> = line
                        .iter()
                        .map(|(on, margin)| {
                            format!("{} {:.2}", if *on { "ON " } else { "OFF" }, margin)
                        })
                        .collect();
                    println!("{}", text.join(" | "));
                }
                taken += 1;
                std::thread::sleep(interval);
            }
        }
        Commands::Calibrate { out } => {
            let mut driver = sensor_driver(&config, channels)?;
            let calibrations = calibrate_interactive(&mut driver, channels, confirm_on_stdin)?;
            calibrations.save(&out)?;
            info!("Calibration for {channels} channel(s) written to {out:?}");
        }
    }

    Ok(())
}
