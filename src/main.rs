use anyhow::{bail, Context};
use chrono::Local;
use clap::Parser;
use seven_link::args::{convert_filter, Action, Args};
use seven_link::cycle::CycleConfig;
use seven_link::demux::Correlation;
use seven_link::record::{CommandReply, PingSettings, SystemSettings};
use seven_link::sweep::{element_commands, starting_commands, SweepPlan, SweepReport};
use seven_link::{Client, ClientConfig, Command, Record, RecordType, Via};
use std::fs::File;
use std::io::BufWriter;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Time for the projector capacitors to discharge after lowering the power
const DISCHARGE_WAIT: Duration = Duration::from_secs(8);
/// Shorter wait before element recordings, the projector is already at zero power
const ELEMENT_DISCHARGE_WAIT: Duration = Duration::from_secs(4);
const BEAMFORMED: Command = Command::ModeType { mode: 0, method: 0 };
/// Snippet window used while calibrating, and the one restored afterwards
const CAL_SNIPPET_WINDOW: (u32, u32) = (1, 15);
const DEFAULT_SNIPPET_WINDOW: (u32, u32) = (0, 50);

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let until = Instant::now() + duration;
    while !stop.load(Ordering::Relaxed) && Instant::now() < until {
        thread::sleep(Duration::from_millis(100));
    }
}

fn send(client: &Client, name: &str, values: &[String], udp: bool) -> anyhow::Result<()> {
    let values: Vec<&str> = values.iter().map(String::as_str).collect();
    let via = if udp { Via::Udp } else { Via::Tcp };
    let port = client.send_named(name, &values, via)?;
    info!(port, "sent {}", name);
    if via == Via::Tcp {
        match client.replies().recv_timeout(client.config().reply_timeout) {
            Ok(record) => match CommandReply::from_record(&record) {
                Ok(reply) => println!("{:?}", reply),
                Err(_) => println!("reply record {}", record.record_type),
            },
            Err(_) => warn!("no reply from the device"),
        }
    }
    Ok(())
}

fn settings(client: &Client) -> anyhow::Result<()> {
    let settings = client
        .request_settings(client.config().reply_timeout)?
        .context("device did not report its settings")?;
    println!("frequency   {:>10.0} Hz", settings.frequency);
    println!("ping rate   {:>10.2} /s", settings.ping_rate);
    println!("range       {:>10.1} m", settings.range);
    println!("power       {:>10.1} dB", settings.power);
    println!("gain        {:>10.1} dB", settings.gain);
    println!("absorption  {:>10.2} dB/km", settings.absorption);
    println!("spreading   {:>10.2} dB", settings.spreading);
    match settings.enumerator() {
        Some(e) => println!("enumerator  {:>10}", e),
        None => println!("enumerator     unknown"),
    }
    Ok(())
}

fn capture(
    client: &mut Client,
    records: Vec<u32>,
    output: PathBuf,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let file = File::create(&output).with_context(|| format!("creating {}", output.display()))?;
    let records = records.into_iter().map(RecordType::from).collect();
    let subscription = client.capture_udp(records, BufWriter::new(file))?;
    info!(port = subscription.port, "writing to {}", output.display());
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
    client.unsubscribe()?;
    Ok(())
}

fn calibrate(
    client: &mut Client,
    output: Option<PathBuf>,
    pings: u32,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let sonar = client.config().device_id;
    let mut plan = SweepPlan::for_sonar(sonar).context("no sweep defined for this sonar")?;
    plan.pings_per_setting = pings;
    let start = starting_commands(sonar).context("no starting settings for this sonar")?;

    let original = client
        .request_settings(client.config().reply_timeout)?
        .context("device did not report its settings")?;
    if let Some(enumerator) = original.enumerator() {
        client.set_enumerator(enumerator);
    }
    let output = output.unwrap_or_else(|| default_output(&original, "cal"));

    client.command(&Command::Absorption(0.0), Via::Tcp)?;
    client.command(&Command::Spreading(0.0), Via::Tcp)?;
    for command in &start {
        client.command(command, Via::Tcp)?;
    }
    let (control, width) = CAL_SNIPPET_WINDOW;
    client.command(&Command::SnippetWindow { control, width }, Via::Tcp)?;
    info!("discharging the projector capacitors");
    sleep_unless_stopped(DISCHARGE_WAIT, stop);

    let file = File::create(&output).with_context(|| format!("creating {}", output.display()))?;
    client.capture_udp(
        vec![
            RecordType::Ping,
            RecordType::Bathymetry,
            RecordType::Backscatter,
            RecordType::RawDetection,
        ],
        BufWriter::new(file),
    )?;
    info!("writing to {}", output.display());
    let report = client.run_sweep(&plan, stop);
    let unsubscribed = client.unsubscribe();

    // Put back what the survey was using, whatever happened above
    client.command(&Command::Absorption(original.absorption), Via::Tcp)?;
    client.command(&Command::Spreading(original.spreading), Via::Tcp)?;
    let (control, width) = DEFAULT_SNIPPET_WINDOW;
    client.command(&Command::SnippetWindow { control, width }, Via::Tcp)?;

    let report = report?;
    unsubscribed?;
    log_report("calibration", &plan, &report);
    Ok(())
}

/// `<date>_<kHz>kHz_<tag>.s7k` in the working directory
fn default_output(settings: &SystemSettings, tag: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}_{:03}kHz_{}.s7k",
        Local::now().format("%Y%m%d%H%M"),
        (settings.frequency / 1000.0).round() as u32,
        tag
    ))
}

fn log_report(what: &str, plan: &SweepPlan, report: &SweepReport) {
    if report.interrupted {
        warn!("{} interrupted", what);
    }
    info!(
        complete = report.complete(),
        total = plan.settings(),
        "{} done",
        what
    );
    for setting in report.settings.iter().filter(|s| !s.complete) {
        warn!(
            power = setting.power,
            gain = setting.gain,
            pings = setting.pings,
            "setting is short of pings"
        );
    }
}

/// Commands returning the sonar to beamformed operation at the settings it had before
fn restore_commands(original: &SystemSettings) -> Vec<Command> {
    vec![
        BEAMFORMED,
        Command::Absorption(original.absorption),
        Command::Spreading(original.spreading),
        Command::Power(original.power),
        Command::Gain(original.gain),
        Command::Range(original.range),
        Command::PingRate(original.ping_rate),
    ]
}

fn elements(
    client: &mut Client,
    output: Option<PathBuf>,
    pings: u32,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let sonar = client.config().device_id;
    let setup = element_commands(sonar).context("no element setup for this sonar")?;
    let mut plan = SweepPlan::for_elements();
    plan.pings_per_setting = pings;

    let original = client
        .request_settings(client.config().reply_timeout)?
        .context("device did not report its settings")?;
    if let Some(enumerator) = original.enumerator() {
        client.set_enumerator(enumerator);
    }
    let output = output.unwrap_or_else(|| default_output(&original, "elem"));

    for command in &setup {
        client.command(command, Via::Tcp)?;
    }
    info!("discharging the projector capacitors");
    sleep_unless_stopped(ELEMENT_DISCHARGE_WAIT, stop);

    let file = File::create(&output).with_context(|| format!("creating {}", output.display()))?;
    client.capture_udp(
        vec![RecordType::Ping, RecordType::ElementSamples],
        BufWriter::new(file),
    )?;
    info!("collecting element data to {}", output.display());
    let report = client.run_sweep(&plan, stop);
    let unsubscribed = client.unsubscribe();

    for command in restore_commands(&original) {
        client.command(&command, Via::Tcp)?;
    }

    let report = report?;
    unsubscribed?;
    log_report("element collection", &plan, &report);
    Ok(())
}

/// Mean water column amplitude ahead of the first strong return.
///
/// Samples are (amplitude u16, phase i16) per beam, sample major, at the end of the record.
fn water_column_noise(record: &Record) -> Option<f32> {
    let data = record.data();
    let beams = u16::from_le_bytes(data.get(14..16)?.try_into().ok()?) as usize;
    let samples = u32::from_le_bytes(data.get(16..20)?.try_into().ok()?) as usize;
    let len = beams.checked_mul(samples)?.checked_mul(4)?;
    if beams == 0 || samples == 0 || len > data.len() {
        return None;
    }
    let body = &data[data.len() - len..];
    let per_sample: Vec<f32> = body
        .chunks_exact(beams * 4)
        .map(|row| {
            let sum: f32 = row
                .chunks_exact(4)
                .map(|s| u16::from_le_bytes([s[0], s[1]]) as f32)
                .sum();
            sum / beams as f32
        })
        .collect();
    let (peak, _) = per_sample
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    let quiet = peak.checked_sub(10).filter(|&n| n > 0)?;
    Some(per_sample[..quiet].iter().sum::<f32>() / quiet as f32)
}

fn monitor(client: &mut Client, noise_period: u64, stop: &AtomicBool) -> anyhow::Result<()> {
    client.subscribe_udp(vec![RecordType::Ping, RecordType::Bathymetry])?;
    let cycle = client.start_diagnostic_cycle(
        CycleConfig {
            period: Duration::from_secs(noise_period),
            ..CycleConfig::default()
        },
        water_column_noise,
    )?;
    while !stop.load(Ordering::Relaxed) {
        let Ok(bundle) = client.bundles().recv_timeout(Duration::from_millis(500)) else {
            continue;
        };
        if let Correlation::Matched(ping, bathy) =
            bundle.correlate(RecordType::Ping, RecordType::Bathymetry)
        {
            let Ok(settings) = PingSettings::from_record(ping) else {
                continue;
            };
            println!(
                "ping {:>6}  {:>6.0} Hz  power {:>5.1}  gain {:>4.1}  bathy {:>6} B  noise {}",
                bundle.sequence,
                settings.frequency,
                settings.power,
                settings.gain,
                bathy.data().len(),
                cycle
                    .estimate()
                    .map_or_else(|| "n/a".to_string(), |n| format!("{:.1}", n)),
            );
        }
    }
    cycle.stop()?;
    client.unsubscribe()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))?;
    }

    let config = ClientConfig {
        device_ip: args.device_ip,
        device_port: args.device_port,
        device_id: args.sonar,
        own_ip: args.own_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
        ..ClientConfig::default()
    };
    let mut client = Client::connect(config)
        .with_context(|| format!("contacting {}:{}", args.device_ip, args.device_port))?;

    let result = match args.command {
        Action::Send { name, values, udp } => send(&client, &name, &values, udp),
        Action::Settings => settings(&client),
        Action::Capture { records, output } => capture(&mut client, records, output, &stop),
        Action::Calibrate { output, pings } => calibrate(&mut client, output, pings, &stop),
        Action::Monitor { noise_period } => monitor(&mut client, noise_period, &stop),
        Action::Elements { output, pings } => elements(&mut client, output, pings, &stop),
        Action::Beamform => client
            .command(&BEAMFORMED, Via::Tcp)
            .map(|_| ())
            .map_err(Into::into),
        Action::Reset { port, kind } => client.stop_request(port, kind).map_err(Into::into),
    };
    let closed = client.close();
    result?;
    if let Err(e) = closed {
        bail!("closing the connection: {}", e);
    }
    Ok(())
}
