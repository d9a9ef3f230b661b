// svlink: stream IEC 61850-9-2 Sampled Values onto a Layer-2 segment.
//
// Three subcommands: `inject` synthesizes a balanced phasor set, `replay`
// transmits a COMTRADE recording, `listen` prints decoded GOOSE traffic.
// Raw sockets usually require elevated privileges.

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use svlink_core::iec61850::goose::{self, GooseMessage};
use svlink_core::iec61850::sampled_value::{PhasorChannel, SV_CHANNELS};
use svlink_core::link::{DatalinkLink, RawLink};
use svlink_core::replay::{ReplayStats, StreamConfig, SvReplay, SvSource};

#[derive(Debug, Parser)]
#[command(name = "svlink")]
#[command(about = "IEC 61850-9-2 Sampled Value streamer with GOOSE stop monitoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct NetArgs {
    /// Network interface to transmit on
    #[arg(long, default_value = "eth0")]
    iface: String,

    /// Destination MAC address
    #[arg(long, default_value = "01:0C:CD:01:00:00")]
    dst_mac: String,

    /// Source MAC address; auto-detected from the interface when omitted
    #[arg(long, default_value = "")]
    src_mac: String,

    #[arg(long, default_value_t = 4)]
    vlan_id: u16,

    #[arg(long, default_value_t = 4)]
    vlan_priority: u8,

    /// APPID, decimal or 0x-prefixed hex
    #[arg(long, default_value = "0x4000", value_parser = parse_u16_maybe_hex)]
    app_id: u16,

    #[arg(long, default_value = "TestSV01")]
    sv_id: String,

    /// Output sample rate in Hz
    #[arg(long, default_value_t = 4800)]
    rate: u16,

    /// Stop the stream when a received gocbRef contains this substring
    #[arg(long, default_value = "STOP")]
    stop_goose_ref: String,

    /// Enable the GOOSE stop listener
    #[arg(long, default_value_t = false)]
    goose_stop: bool,

    /// Report progress every N frames (0 disables)
    #[arg(long, default_value_t = 1000)]
    progress: u64,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Transmit synthetic phasors as an SV stream
    Inject {
        #[command(flatten)]
        net: NetArgs,

        /// Phase current magnitude in amperes
        #[arg(long, default_value_t = 100.0)]
        current_mag: f64,

        /// Phase voltage magnitude in volts
        #[arg(long, default_value_t = 69500.0)]
        voltage_mag: f64,

        /// Nominal system frequency in Hz
        #[arg(long, default_value_t = 60.0)]
        nominal_freq: f64,
    },
    /// Replay a COMTRADE recording as an SV stream
    Replay {
        #[command(flatten)]
        net: NetArgs,

        /// Path to the COMTRADE .cfg file
        #[arg(long)]
        cfg: std::path::PathBuf,

        /// Path to the .dat file; derived from the cfg path when omitted
        #[arg(long)]
        dat: Option<std::path::PathBuf>,

        /// Channel mapping NAME=IDX with IDX in 0-7; repeatable
        #[arg(long = "map", value_name = "NAME=IDX")]
        map: Vec<String>,

        /// Loop the recording instead of stopping at the end
        #[arg(long, default_value_t = false)]
        loop_playback: bool,
    },
    /// Print decoded GOOSE traffic on an interface
    Listen {
        #[arg(long, default_value = "eth0")]
        iface: String,
    },
}

fn parse_u16_maybe_hex(s: &str) -> Result<u16, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse::<u16>()
    };
    parsed.map_err(|_| format!("invalid 16-bit value: {}", s))
}

/// Balanced three-phase set: currents on channels 0-2, voltages on 4-6,
/// neutrals left at zero.
fn balanced_phasors(current_mag: f64, voltage_mag: f64) -> [PhasorChannel; SV_CHANNELS] {
    [
        PhasorChannel::new(current_mag, 0.0),
        PhasorChannel::new(current_mag, -120.0),
        PhasorChannel::new(current_mag, 120.0),
        PhasorChannel::new(0.0, 0.0),
        PhasorChannel::new(voltage_mag, 0.0),
        PhasorChannel::new(voltage_mag, -120.0),
        PhasorChannel::new(voltage_mag, 120.0),
        PhasorChannel::new(0.0, 0.0),
    ]
}

fn parse_channel_map(entries: &[String]) -> Result<Vec<(String, usize)>, String> {
    entries
        .iter()
        .map(|entry| {
            let (name, index) = entry
                .rsplit_once('=')
                .ok_or_else(|| format!("expected NAME=IDX, got {:?}", entry))?;
            let index = index
                .parse::<usize>()
                .map_err(|_| format!("invalid SV channel index in {:?}", entry))?;
            Ok((name.to_string(), index))
        })
        .collect()
}

fn stream_config(net: NetArgs, source: SvSource, loop_playback: bool) -> StreamConfig {
    StreamConfig {
        iface: net.iface,
        dst_mac: net.dst_mac,
        src_mac: net.src_mac,
        vlan_id: net.vlan_id,
        vlan_priority: net.vlan_priority,
        app_id: net.app_id,
        sv_id: net.sv_id,
        sample_rate: net.rate,
        source,
        stop_goose_ref: net.stop_goose_ref,
        goose_monitoring: net.goose_stop,
        loop_playback,
        progress_interval: net.progress,
        verbose: true,
        align_to_second: true,
    }
}

fn run_stream(config: StreamConfig) -> ExitCode {
    info!(
        "stream config: iface {}, dst {}, VLAN id {} pri {}, APPID 0x{:04X}, svID {}, {} Hz",
        config.iface,
        config.dst_mac,
        config.vlan_id,
        config.vlan_priority,
        config.app_id,
        config.sv_id,
        config.sample_rate
    );

    let mut replay = SvReplay::new(config);
    replay.set_goose_observer(|msg: &GooseMessage| {
        info!(
            "GOOSE: gocbRef {} (stNum {}, sqNum {})",
            msg.gocb_ref, msg.st_num, msg.sq_num
        );
    });

    if let Err(e) = replay.configure() {
        error!("configuration failed: {}", e);
        return ExitCode::FAILURE;
    }

    let stop = replay.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\ninterrupted, stopping stream...");
        stop.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to install Ctrl-C handler: {}", e);
    }

    info!("starting transmission (Ctrl-C to stop)");
    match replay.run() {
        Ok(stats) => {
            print_stats(&stats);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_stats(stats: &ReplayStats) {
    println!("\n=== Stream statistics ===");
    if stats.total_source_samples > 0 {
        println!(
            "Source: {} samples @ {} Hz, resampled to {} @ {} Hz",
            stats.total_source_samples,
            stats.source_sample_rate,
            stats.samples_interpolated,
            stats.output_sample_rate
        );
    }
    println!("Packets sent:   {}", stats.packets_sent);
    println!("Packets failed: {}", stats.packets_failed);
    println!("Elapsed:        {:.3} s", stats.elapsed_secs);
    println!("Average rate:   {:.1} packets/s", stats.average_rate());
    if stats.stopped_by_goose {
        println!(
            "Stopped by GOOSE: {}",
            stats.goose_stop_reason.as_deref().unwrap_or("")
        );
    }
}

fn run_listen(iface: &str) -> ExitCode {
    let mut link = match DatalinkLink::open(iface) {
        Ok(link) => link,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to install Ctrl-C handler: {}", e);
    }

    info!("listening for GOOSE on {} (Ctrl-C to stop)", iface);
    while running.load(Ordering::SeqCst) {
        match link.recv_frame() {
            Ok(Some(frame)) if goose::is_goose_frame(&frame) => {
                match GooseMessage::from_frame(&frame) {
                    Ok(msg) => println!(
                        "GOOSE appID 0x{:04X} gocbRef {} datSet {} stNum {} sqNum {} ttl {}ms",
                        msg.app_id,
                        msg.gocb_ref,
                        msg.dat_set,
                        msg.st_num,
                        msg.sq_num,
                        msg.time_allowed_to_live
                    ),
                    Err(e) => warn!("undecodable GOOSE frame: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("receive error: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Inject {
            net,
            current_mag,
            voltage_mag,
            nominal_freq,
        } => {
            let source = SvSource::Phasors {
                channels: balanced_phasors(current_mag, voltage_mag),
                nominal_freq_hz: nominal_freq,
            };
            run_stream(stream_config(net, source, false))
        }
        Commands::Replay {
            net,
            cfg,
            dat,
            map,
            loop_playback,
        } => {
            let channel_map = match parse_channel_map(&map) {
                Ok(map) => map,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            if channel_map.is_empty() {
                warn!("no channel mappings given; all SV channels will be zero");
            }
            let source = SvSource::Comtrade {
                cfg_path: cfg,
                dat_path: dat,
                channel_map,
            };
            run_stream(stream_config(net, source, loop_playback))
        }
        Commands::Listen { iface } => run_listen(&iface),
    }
}
