// IEEE C37.111 (COMTRADE) waveform ingest.
//
// A recording is a `.cfg` descriptor plus a `.dat` sample store. The
// configuration grammar and the three dat encodings are handled here; all
// analog values are stored primary-referred in engineering units.

pub mod config;
pub mod data;

pub use config::{AnalogChannel, ComtradeConfig, DataFormat, DigitalChannel, SampleRate};
pub use data::ComtradeSample;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Errors raised while loading a COMTRADE recording. Cfg diagnostics carry
/// the 1-based line number of the offending line.
#[derive(Debug)]
pub enum ComtradeError {
    Io { path: PathBuf, source: io::Error },
    Cfg { line: usize, reason: String },
    UnknownFormat { line: usize, token: String },
    TruncatedData { record: usize },
}

impl fmt::Display for ComtradeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ComtradeError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ComtradeError::Cfg { line, reason } => {
                write!(f, "cfg line {}: {}", line, reason)
            }
            ComtradeError::UnknownFormat { line, token } => {
                write!(f, "cfg line {}: unknown data format {:?}", line, token)
            }
            ComtradeError::TruncatedData { record } => {
                write!(f, "dat record {} is truncated", record)
            }
        }
    }
}

impl std::error::Error for ComtradeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ComtradeError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A fully loaded recording: parsed configuration plus every sample scaled
/// to primary-referred engineering units. Immutable after `load`.
#[derive(Debug, Clone)]
pub struct Comtrade {
    config: ComtradeConfig,
    samples: Vec<ComtradeSample>,
}

impl Comtrade {
    /// Load and parse a recording. When `dat_path` is `None` the data file
    /// is the cfg path with its extension replaced by `.dat`.
    pub fn load(cfg_path: &Path, dat_path: Option<&Path>) -> Result<Comtrade, ComtradeError> {
        let cfg_text = fs::read_to_string(cfg_path).map_err(|source| ComtradeError::Io {
            path: cfg_path.to_path_buf(),
            source,
        })?;
        let mut config = ComtradeConfig::parse(&cfg_text)?;

        let dat_path = match dat_path {
            Some(p) => p.to_path_buf(),
            None => cfg_path.with_extension("dat"),
        };

        let samples = match config.data_format {
            DataFormat::Ascii => {
                let text = fs::read_to_string(&dat_path).map_err(|source| ComtradeError::Io {
                    path: dat_path.clone(),
                    source,
                })?;
                data::parse_ascii(&text, &config)
            }
            DataFormat::Binary | DataFormat::Binary32 => {
                let bytes = fs::read(&dat_path).map_err(|source| ComtradeError::Io {
                    path: dat_path.clone(),
                    source,
                })?;
                if config.data_format == DataFormat::Binary {
                    data::parse_binary(&bytes, &config)?
                } else {
                    data::parse_binary32(&bytes, &config)?
                }
            }
        };

        config.total_samples = samples.len();
        Ok(Comtrade { config, samples })
    }

    pub fn config(&self) -> &ComtradeConfig {
        &self.config
    }

    pub fn samples(&self) -> &[ComtradeSample] {
        &self.samples
    }

    pub fn total_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn get_sample(&self, index: usize) -> Option<&ComtradeSample> {
        self.samples.get(index)
    }

    /// Look up an analog channel by identifier.
    pub fn analog_channel(&self, name: &str) -> Option<&AnalogChannel> {
        self.config
            .analog_channels
            .iter()
            .find(|ch| ch.name == name)
    }

    /// Sample rate in Hz of the rate segment containing `sample_index`.
    pub fn sample_rate_at(&self, sample_index: usize) -> f64 {
        self.config.sample_rate_at(sample_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("svlink-{}-{}", std::process::id(), name))
    }

    const TWO_CHANNEL_CFG: &str = "\
STATION,DEV1,1999
2,2A,0D
1,VA,A,,kV,1.0,0.0,0.0,-1000,1000,1,1,P
2,VB,B,,kV,1.0,0.0,0.0,-1000,1000,1,1,P
60
1
4800,2
01/01/2024,00:00:00.000000
01/01/2024,00:00:00.000000
ASCII
1.0
";

    #[test]
    fn test_load_ascii_recording() {
        let cfg = temp_path("load.cfg");
        let dat = temp_path("load.dat");
        let mut f = fs::File::create(&cfg).unwrap();
        f.write_all(TWO_CHANNEL_CFG.as_bytes()).unwrap();
        let mut f = fs::File::create(&dat).unwrap();
        f.write_all(b"1,0.0,100,200\n2,0.000208333,101,201\n").unwrap();

        let rec = Comtrade::load(&cfg, Some(&dat)).unwrap();
        assert_eq!(rec.total_samples(), 2);
        assert_eq!(rec.config().total_samples, 2);
        assert_eq!(rec.sample_rate_at(0), 4800.0);
        assert_eq!(rec.get_sample(0).unwrap().analog, vec![100.0, 200.0]);
        assert_eq!(rec.get_sample(1).unwrap().analog, vec![101.0, 201.0]);
        assert!(rec.get_sample(2).is_none());
        assert!(rec.analog_channel("VA").is_some());
        assert!(rec.analog_channel("VX").is_none());

        fs::remove_file(&cfg).ok();
        fs::remove_file(&dat).ok();
    }

    #[test]
    fn test_dat_path_defaults_to_cfg_extension() {
        let cfg = temp_path("default.cfg");
        let dat = temp_path("default.dat");
        fs::write(&cfg, TWO_CHANNEL_CFG).unwrap();
        fs::write(&dat, "1,0.0,5,6\n").unwrap();

        let rec = Comtrade::load(&cfg, None).unwrap();
        assert_eq!(rec.total_samples(), 1);

        fs::remove_file(&cfg).ok();
        fs::remove_file(&dat).ok();
    }

    #[test]
    fn test_missing_cfg_is_io_error() {
        let err = Comtrade::load(Path::new("/nonexistent/file.cfg"), None).unwrap_err();
        assert!(matches!(err, ComtradeError::Io { .. }));
    }
}
