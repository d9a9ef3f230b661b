// SV stream engine.
//
// Drives one outgoing Sampled Value stream: synthetic phasors or a resampled
// COMTRADE recording, one frame per sample period on an absolute-time
// schedule, with an optional GOOSE listener that cancels the run when a
// configured control-block reference shows up on the wire.

use crate::comtrade::{Comtrade, ComtradeError};
use crate::iec61850::ethernet::{FrameFieldError, MacAddr, VlanTag};
use crate::iec61850::goose::{self, GooseMessage};
use crate::iec61850::sampled_value::{PhasorChannel, SvStream, SV_CHANNELS};
use crate::link::{DatalinkLink, LinkError, RawLink};
use crate::resample;
use crate::timer::PeriodicTimer;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Inter-poll sleep of the GOOSE listener. The listener never blocks longer
/// than this, so cancellation is observed promptly.
pub const GOOSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Where the eight SV channel values come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SvSource {
    /// Synthesize from phasor magnitudes/angles at a nominal frequency.
    Phasors {
        channels: [PhasorChannel; SV_CHANNELS],
        nominal_freq_hz: f64,
    },
    /// Replay a COMTRADE recording, resampled to the output rate.
    Comtrade {
        cfg_path: PathBuf,
        dat_path: Option<PathBuf>,
        /// `(comtrade channel name, sv channel index 0-7)`; unmapped SV
        /// channels stay zero-filled.
        channel_map: Vec<(String, usize)>,
    },
}

/// The balanced three-phase set the injector defaults to:
/// 100 A currents and 69.5 kV phase voltages, neutrals at zero.
pub fn default_phasors() -> [PhasorChannel; SV_CHANNELS] {
    [
        PhasorChannel::new(100.0, 0.0),      // IA
        PhasorChannel::new(100.0, -120.0),   // IB
        PhasorChannel::new(100.0, 120.0),    // IC
        PhasorChannel::new(0.0, 0.0),        // IN
        PhasorChannel::new(69500.0, 0.0),    // VA
        PhasorChannel::new(69500.0, -120.0), // VB
        PhasorChannel::new(69500.0, 120.0),  // VC
        PhasorChannel::new(0.0, 0.0),        // VN
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub iface: String,
    pub dst_mac: String,
    /// Source MAC; auto-resolved from the interface when empty or all-zero.
    pub src_mac: String,
    pub vlan_id: u16,
    pub vlan_priority: u8,
    pub app_id: u16,
    pub sv_id: String,
    /// Output sample rate in Hz.
    pub sample_rate: u16,
    pub source: SvSource,
    /// Substring that, found in a received gocbRef, stops the stream.
    pub stop_goose_ref: String,
    pub goose_monitoring: bool,
    pub loop_playback: bool,
    /// Report progress every this many successful sends; 0 disables.
    pub progress_interval: u64,
    pub verbose: bool,
    /// Phase-align the first frame to the next wall-clock second.
    pub align_to_second: bool,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            iface: "eth0".to_string(),
            dst_mac: "01:0C:CD:01:00:00".to_string(),
            src_mac: String::new(),
            vlan_id: 4,
            vlan_priority: 4,
            app_id: 0x4000,
            sv_id: "TestSV01".to_string(),
            sample_rate: 4800,
            source: SvSource::Phasors {
                channels: default_phasors(),
                nominal_freq_hz: 60.0,
            },
            stop_goose_ref: "STOP".to_string(),
            goose_monitoring: true,
            loop_playback: false,
            progress_interval: 1000,
            verbose: true,
            align_to_second: true,
        }
    }
}

#[derive(Debug)]
pub enum ReplayError {
    NotConfigured,
    AlreadyRunning,
    Config(String),
    Comtrade(ComtradeError),
    Frame(FrameFieldError),
    Link(LinkError),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReplayError::NotConfigured => write!(f, "stream not configured; call configure first"),
            ReplayError::AlreadyRunning => write!(f, "stream is already running"),
            ReplayError::Config(msg) => write!(f, "{}", msg),
            ReplayError::Comtrade(e) => write!(f, "COMTRADE load failed: {}", e),
            ReplayError::Frame(e) => write!(f, "{}", e),
            ReplayError::Link(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReplayError::Comtrade(e) => Some(e),
            ReplayError::Frame(e) => Some(e),
            ReplayError::Link(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ComtradeError> for ReplayError {
    fn from(e: ComtradeError) -> ReplayError {
        ReplayError::Comtrade(e)
    }
}

impl From<FrameFieldError> for ReplayError {
    fn from(e: FrameFieldError) -> ReplayError {
        ReplayError::Frame(e)
    }
}

impl From<LinkError> for ReplayError {
    fn from(e: LinkError) -> ReplayError {
        ReplayError::Link(e)
    }
}

/// Snapshot of a finished (or aborted) run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStats {
    pub packets_sent: u64,
    pub packets_failed: u64,
    pub source_sample_rate: u32,
    pub output_sample_rate: u32,
    pub total_source_samples: usize,
    pub samples_interpolated: usize,
    pub elapsed_secs: f64,
    pub stopped_by_goose: bool,
    pub goose_stop_reason: Option<String>,
}

impl ReplayStats {
    pub fn average_rate(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.packets_sent as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

/// Cross-thread run state. Counters are writer-exclusive per field and read
/// relaxed; `running` is the only coordination point.
#[derive(Default)]
struct SharedState {
    packets_sent: AtomicU64,
    packets_failed: AtomicU64,
    stopped_by_goose: AtomicBool,
    goose_stop_reason: Mutex<Option<String>>,
}

type GooseObserver = Arc<dyn Fn(&GooseMessage) + Send + Sync>;
type ProgressObserver = Box<dyn Fn(u64, f64) + Send>;

pub struct SvReplay {
    config: StreamConfig,
    configured: bool,
    running: Arc<AtomicBool>,
    shared: Arc<SharedState>,
    last_error: String,

    // Validated during configure
    dst_mac: MacAddr,
    src_mac: MacAddr,
    vlan: VlanTag,

    // COMTRADE mode only: resampled INT32 data, [channel][sample]
    resampled: Vec<Vec<i32>>,
    num_samples: usize,
    total_source_samples: usize,
    source_rate: f64,

    goose_observer: Option<GooseObserver>,
    progress_observer: Option<ProgressObserver>,
}

impl SvReplay {
    pub fn new(config: StreamConfig) -> SvReplay {
        SvReplay {
            config,
            configured: false,
            running: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(SharedState::default()),
            last_error: String::new(),
            dst_mac: MacAddr::ZERO,
            src_mac: MacAddr::ZERO,
            vlan: VlanTag {
                priority: 0,
                dei: false,
                id: 0,
            },
            resampled: Vec::new(),
            num_samples: 0,
            total_source_samples: 0,
            source_rate: 0.0,
            goose_observer: None,
            progress_observer: None,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Handle for external cancellation (e.g. a signal handler): storing
    /// `false` makes the transmit loop exit after its in-flight send.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Observer invoked from the listener thread for every decoded GOOSE.
    pub fn set_goose_observer(&mut self, observer: impl Fn(&GooseMessage) + Send + Sync + 'static) {
        self.goose_observer = Some(Arc::new(observer));
    }

    /// Observer invoked every `progress_interval` successful sends with the
    /// running packet count and elapsed seconds.
    pub fn set_progress_observer(&mut self, observer: impl Fn(u64, f64) + Send + 'static) {
        self.progress_observer = Some(Box::new(observer));
    }

    /// Validate the configuration and, in replay mode, load and prepare the
    /// recording. On failure the instance stays unconfigured and unrun.
    pub fn configure(&mut self) -> Result<(), ReplayError> {
        if self.is_running() {
            return self.fail(ReplayError::AlreadyRunning);
        }
        self.configured = false;

        if self.config.iface.is_empty() {
            return self.fail(ReplayError::Config(
                "interface name cannot be empty".to_string(),
            ));
        }
        if self.config.sample_rate == 0 {
            return self.fail(ReplayError::Config(
                "sample rate must be greater than 0".to_string(),
            ));
        }
        if self.config.sv_id.is_empty() || self.config.sv_id.len() > 127 {
            return self.fail(ReplayError::Config(format!(
                "svID must be 1-127 characters, got {}",
                self.config.sv_id.len()
            )));
        }

        self.vlan = match VlanTag::new(self.config.vlan_priority, false, self.config.vlan_id) {
            Ok(vlan) => vlan,
            Err(e) => return self.fail(e.into()),
        };
        self.dst_mac = match MacAddr::parse(&self.config.dst_mac) {
            Ok(mac) => mac,
            Err(e) => return self.fail(e.into()),
        };
        self.src_mac = match self.resolve_src_mac() {
            Ok(mac) => mac,
            Err(e) => return self.fail(e),
        };

        match self.config.source.clone() {
            SvSource::Phasors {
                nominal_freq_hz, ..
            } => {
                if nominal_freq_hz <= 0.0 {
                    return self.fail(ReplayError::Config(
                        "nominal frequency must be greater than 0".to_string(),
                    ));
                }
                self.resampled.clear();
                self.num_samples = 0;
                self.total_source_samples = 0;
                self.source_rate = 0.0;
            }
            SvSource::Comtrade {
                cfg_path,
                dat_path,
                channel_map,
            } => {
                if let Err(e) = self.prepare_comtrade(&cfg_path, dat_path.as_deref(), &channel_map)
                {
                    return self.fail(e);
                }
            }
        }

        self.configured = true;
        self.last_error.clear();
        Ok(())
    }

    fn resolve_src_mac(&self) -> Result<MacAddr, ReplayError> {
        if !self.config.src_mac.is_empty() {
            let mac = MacAddr::parse(&self.config.src_mac)?;
            if !mac.is_zero() {
                return Ok(mac);
            }
        }
        // Auto-detect from the interface
        let link = DatalinkLink::open(&self.config.iface).map_err(|e| {
            ReplayError::Config(format!(
                "failed to open {} to detect source MAC: {}",
                self.config.iface, e
            ))
        })?;
        match link.mac_address() {
            Some(mac) if !mac.is_zero() => Ok(mac),
            _ => Err(ReplayError::Config(format!(
                "failed to detect MAC address for interface {}",
                self.config.iface
            ))),
        }
    }

    fn prepare_comtrade(
        &mut self,
        cfg_path: &std::path::Path,
        dat_path: Option<&std::path::Path>,
        channel_map: &[(String, usize)],
    ) -> Result<(), ReplayError> {
        let recording = Comtrade::load(cfg_path, dat_path)?;
        if recording.total_samples() == 0 {
            return Err(ReplayError::Config(
                "COMTRADE recording contains no samples".to_string(),
            ));
        }

        let num_samples = recording.total_samples();
        let mut analog = vec![vec![0.0f64; num_samples]; SV_CHANNELS];

        for (name, sv_index) in channel_map {
            if *sv_index >= SV_CHANNELS {
                return Err(ReplayError::Config(format!(
                    "SV channel index {} for {:?} is outside 0-{}",
                    sv_index,
                    name,
                    SV_CHANNELS - 1
                )));
            }
            let channel = recording.analog_channel(name).ok_or_else(|| {
                let available: Vec<&str> = recording
                    .config()
                    .analog_channels
                    .iter()
                    .map(|ch| ch.name.as_str())
                    .collect();
                ReplayError::Config(format!(
                    "COMTRADE channel {:?} not found; available: {}",
                    name,
                    available.join(", ")
                ))
            })?;

            for (i, sample) in recording.samples().iter().enumerate() {
                if let Some(value) = sample.analog.get(channel.index) {
                    analog[*sv_index][i] = *value;
                }
            }
        }

        let source_rate = recording.sample_rate_at(0);
        let output_rate = self.config.sample_rate as f64;

        let resampled = if (source_rate - output_rate).abs() > 0.1 {
            if self.config.verbose {
                info!("resampling {} Hz -> {} Hz", source_rate, output_rate);
            }
            resample::resample(&analog, source_rate, output_rate)
        } else {
            analog
        };

        self.num_samples = resampled[0].len();
        self.resampled = resampled
            .into_iter()
            .map(|channel| channel.into_iter().map(|v| v as i32).collect())
            .collect();
        self.total_source_samples = num_samples;
        self.source_rate = source_rate;

        if self.config.verbose {
            info!(
                "loaded {:?}: {} samples @ {} Hz, {} mapped channels, {} output samples @ {} Hz",
                recording.config().station_name,
                num_samples,
                source_rate,
                channel_map.len(),
                self.num_samples,
                output_rate
            );
        }
        Ok(())
    }

    /// Open the links on the configured interface and run to completion.
    pub fn run(&mut self) -> Result<ReplayStats, ReplayError> {
        if !self.configured {
            return self.fail(ReplayError::NotConfigured);
        }
        let tx = match DatalinkLink::open(&self.config.iface) {
            Ok(link) => Box::new(link) as Box<dyn RawLink>,
            Err(e) => return self.fail(e.into()),
        };
        let rx = if self.config.goose_monitoring {
            match DatalinkLink::open(&self.config.iface) {
                Ok(link) => Some(Box::new(link) as Box<dyn RawLink>),
                Err(e) => {
                    warn!("GOOSE monitoring disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        self.run_with_links(tx, rx)
    }

    /// Run the transmit loop over explicit links. This is the seam the
    /// integration tests drive with scripted links.
    pub fn run_with_links(
        &mut self,
        mut tx: Box<dyn RawLink>,
        rx: Option<Box<dyn RawLink>>,
    ) -> Result<ReplayStats, ReplayError> {
        if !self.configured {
            return self.fail(ReplayError::NotConfigured);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return self.fail(ReplayError::AlreadyRunning);
        }

        self.shared.packets_sent.store(0, Ordering::Relaxed);
        self.shared.packets_failed.store(0, Ordering::Relaxed);
        self.shared.stopped_by_goose.store(false, Ordering::SeqCst);
        if let Ok(mut reason) = self.shared.goose_stop_reason.lock() {
            *reason = None;
        }

        let listener = rx.map(|link| {
            let running = Arc::clone(&self.running);
            let shared = Arc::clone(&self.shared);
            let stop_ref = self.config.stop_goose_ref.clone();
            let observer = self.goose_observer.clone();
            thread::spawn(move || goose_listener_loop(link, running, shared, stop_ref, observer))
        });

        let start = Instant::now();
        self.transmission_loop(tx.as_mut(), start);
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = listener {
            if handle.join().is_err() {
                warn!("GOOSE listener thread panicked");
            }
        }
        let elapsed = start.elapsed();

        let stats = ReplayStats {
            packets_sent: self.shared.packets_sent.load(Ordering::Relaxed),
            packets_failed: self.shared.packets_failed.load(Ordering::Relaxed),
            source_sample_rate: self.source_rate as u32,
            output_sample_rate: self.config.sample_rate as u32,
            total_source_samples: self.total_source_samples,
            samples_interpolated: self.num_samples,
            elapsed_secs: elapsed.as_secs_f64(),
            stopped_by_goose: self.shared.stopped_by_goose.load(Ordering::SeqCst),
            goose_stop_reason: self
                .shared
                .goose_stop_reason
                .lock()
                .ok()
                .and_then(|reason| reason.clone()),
        };

        if self.config.verbose {
            info!(
                "run finished: {} sent, {} failed, {:.3}s elapsed, {:.1} frames/s{}",
                stats.packets_sent,
                stats.packets_failed,
                stats.elapsed_secs,
                stats.average_rate(),
                match &stats.goose_stop_reason {
                    Some(reason) => format!(", stopped by GOOSE {}", reason),
                    None => String::new(),
                }
            );
        }
        Ok(stats)
    }

    fn transmission_loop(&self, tx: &mut dyn RawLink, start: Instant) {
        let period = Duration::from_nanos((1e9 / self.config.sample_rate as f64) as u64);

        // One-shot phase alignment to the wall clock; everything after runs
        // on the monotonic clock only.
        if self.config.align_to_second {
            sleep_to_second_boundary();
        }
        let t0 = Instant::now();
        let mut timer = PeriodicTimer::new();
        timer.start_at(t0);
        timer.wait_period(period);

        let mut sv = SvStream::new(
            self.dst_mac,
            self.src_mac,
            self.vlan,
            self.config.app_id,
            self.config.sv_id.clone(),
            self.config.sample_rate,
        );
        let qualities = [0u32; SV_CHANNELS];
        let mut sample_idx = 0usize;

        while self.running.load(Ordering::SeqCst) {
            let samples = match &self.config.source {
                SvSource::Phasors {
                    channels,
                    nominal_freq_hz,
                } => sv.synthesize(channels, *nominal_freq_hz),
                SvSource::Comtrade { .. } => {
                    let mut values = [0i32; SV_CHANNELS];
                    for (value, channel) in values.iter_mut().zip(&self.resampled) {
                        *value = channel[sample_idx];
                    }
                    values
                }
            };

            let frame = sv.build_frame(&samples, &qualities);
            match tx.send_frame(&frame) {
                Ok(_) => {
                    let sent = self.shared.packets_sent.fetch_add(1, Ordering::Relaxed) + 1;
                    if self.config.progress_interval > 0
                        && sent % self.config.progress_interval == 0
                    {
                        let elapsed = start.elapsed().as_secs_f64();
                        if self.config.verbose {
                            info!(
                                "sent {} frames in {:.1}s (sample {}/{}, smpCnt {})",
                                sent,
                                elapsed,
                                sample_idx,
                                self.num_samples,
                                sv.smp_cnt()
                            );
                        }
                        if let Some(observer) = &self.progress_observer {
                            observer(sent, elapsed);
                        }
                    }
                }
                Err(e) => {
                    let failed = self.shared.packets_failed.fetch_add(1, Ordering::Relaxed) + 1;
                    if self.config.verbose && failed % 100 == 1 {
                        warn!("failed to send frame ({} total failures): {}", failed, e);
                    }
                }
            }

            sv.advance();
            if matches!(self.config.source, SvSource::Comtrade { .. }) {
                sample_idx += 1;
                if sample_idx >= self.num_samples {
                    if self.config.loop_playback {
                        sample_idx = 0;
                    } else {
                        break;
                    }
                }
            }

            timer.wait_period(period);
        }
    }

    fn fail<T>(&mut self, err: ReplayError) -> Result<T, ReplayError> {
        self.last_error = err.to_string();
        Err(err)
    }
}

/// Sleep until the next wall-clock second boundary so the first frame lands
/// on a whole second.
fn sleep_to_second_boundary() {
    if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
        let to_boundary = 1_000_000_000u64 - now.subsec_nanos() as u64;
        thread::sleep(Duration::from_nanos(to_boundary));
    }
}

fn goose_listener_loop(
    mut link: Box<dyn RawLink>,
    running: Arc<AtomicBool>,
    shared: Arc<SharedState>,
    stop_ref: String,
    observer: Option<GooseObserver>,
) {
    info!(
        "GOOSE monitoring started (stopping on gocbRef containing {:?})",
        stop_ref
    );

    while running.load(Ordering::SeqCst) {
        match link.recv_frame() {
            Ok(Some(frame)) => {
                if goose::is_goose_frame(&frame) {
                    if let Ok(msg) = GooseMessage::from_frame(&frame) {
                        debug!(
                            "GOOSE received: appID 0x{:04X}, gocbRef {}, stNum {}, sqNum {}",
                            msg.app_id, msg.gocb_ref, msg.st_num, msg.sq_num
                        );
                        if let Some(observer) = &observer {
                            observer(&msg);
                        }
                        if msg.gocb_ref.contains(&stop_ref) {
                            info!("stop GOOSE detected: {}", msg.gocb_ref);
                            if let Ok(mut reason) = shared.goose_stop_reason.lock() {
                                *reason = Some(msg.gocb_ref.clone());
                            }
                            shared.stopped_by_goose.store(true, Ordering::SeqCst);
                            running.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("GOOSE receive error: {}", e),
        }
        thread::sleep(GOOSE_POLL_INTERVAL);
    }

    info!("GOOSE monitoring stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phasor_config() -> StreamConfig {
        StreamConfig {
            src_mac: "AA:BB:CC:DD:EE:FF".to_string(),
            verbose: false,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn test_configure_accepts_valid_phasor_config() {
        let mut replay = SvReplay::new(phasor_config());
        assert!(replay.configure().is_ok());
        assert!(replay.last_error().is_empty());
    }

    #[test]
    fn test_configure_rejects_empty_interface() {
        let mut replay = SvReplay::new(StreamConfig {
            iface: String::new(),
            ..phasor_config()
        });
        let err = replay.configure().unwrap_err();
        assert!(matches!(err, ReplayError::Config(_)));
        assert!(replay.last_error().contains("interface"));
    }

    #[test]
    fn test_configure_rejects_zero_sample_rate() {
        let mut replay = SvReplay::new(StreamConfig {
            sample_rate: 0,
            ..phasor_config()
        });
        assert!(replay.configure().is_err());
        assert!(replay.last_error().contains("sample rate"));
    }

    #[test]
    fn test_configure_rejects_vlan_out_of_range() {
        let mut replay = SvReplay::new(StreamConfig {
            vlan_id: 4096,
            ..phasor_config()
        });
        assert!(matches!(
            replay.configure().unwrap_err(),
            ReplayError::Frame(FrameFieldError::VlanIdOutOfRange(4096))
        ));

        let mut replay = SvReplay::new(StreamConfig {
            vlan_priority: 8,
            ..phasor_config()
        });
        assert!(matches!(
            replay.configure().unwrap_err(),
            ReplayError::Frame(FrameFieldError::VlanPriorityOutOfRange(8))
        ));
    }

    #[test]
    fn test_configure_rejects_bad_dst_mac() {
        let mut replay = SvReplay::new(StreamConfig {
            dst_mac: "01:0C:CD".to_string(),
            ..phasor_config()
        });
        assert!(matches!(
            replay.configure().unwrap_err(),
            ReplayError::Frame(FrameFieldError::InvalidMac(_))
        ));
    }

    #[test]
    fn test_configure_rejects_bad_sv_id() {
        let mut replay = SvReplay::new(StreamConfig {
            sv_id: String::new(),
            ..phasor_config()
        });
        assert!(replay.configure().is_err());

        let mut replay = SvReplay::new(StreamConfig {
            sv_id: "X".repeat(128),
            ..phasor_config()
        });
        assert!(replay.configure().is_err());
    }

    #[test]
    fn test_run_requires_configure() {
        let mut replay = SvReplay::new(phasor_config());
        assert!(matches!(
            replay.run().unwrap_err(),
            ReplayError::NotConfigured
        ));
    }
}
