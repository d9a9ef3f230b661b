// COMTRADE .dat sample stores.
//
// Three encodings share one record shape: sample number, raw timestamp, one
// value per analog channel, then the digital states. ASCII carries one token
// per digital channel; the binary encodings bit-pack them LSB-first into
// 16-bit (BINARY) or 32-bit (BINARY32) words. Binary records are read
// little-endian regardless of host order.

use super::config::ComtradeConfig;
use super::ComtradeError;
use serde::{Deserialize, Serialize};

/// One sample across every channel, analog values primary-referred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComtradeSample {
    pub number: u32,
    /// Microseconds since recording start: raw * timeFactor * 1e6.
    pub timestamp_us: u64,
    pub analog: Vec<f64>,
    pub digital: Vec<bool>,
}

fn timestamp_us(raw_seconds: f64, time_factor: f64) -> u64 {
    (raw_seconds * time_factor * 1e6) as u64
}

/// Parse ASCII records. Lines that do not parse are skipped, matching the
/// tolerated-malformation policy for this encoding.
pub(super) fn parse_ascii(text: &str, config: &ComtradeConfig) -> Vec<ComtradeSample> {
    let expected = 2 + config.num_analog + config.num_digital;
    let mut samples = Vec::new();

    'lines: for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < expected {
            continue;
        }

        let number = match fields[0].parse::<u32>() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let raw_seconds = match fields[1].parse::<f64>() {
            Ok(t) => t,
            Err(_) => continue,
        };

        let mut analog = Vec::with_capacity(config.num_analog);
        for (ch, field) in config
            .analog_channels
            .iter()
            .zip(&fields[2..2 + config.num_analog])
        {
            match field.parse::<f64>() {
                Ok(raw) => analog.push(ch.scale(raw)),
                Err(_) => continue 'lines,
            }
        }

        let mut digital = Vec::with_capacity(config.num_digital);
        for field in &fields[2 + config.num_analog..expected] {
            match field.parse::<i64>() {
                Ok(v) => digital.push(v != 0),
                Err(_) => continue 'lines,
            }
        }

        samples.push(ComtradeSample {
            number,
            timestamp_us: timestamp_us(raw_seconds, config.time_factor),
            analog,
            digital,
        });
    }

    samples
}

/// Parse BINARY records: u32 sample number, u32 raw timestamp, i16 per
/// analog channel, u16 digital words.
pub(super) fn parse_binary(
    bytes: &[u8],
    config: &ComtradeConfig,
) -> Result<Vec<ComtradeSample>, ComtradeError> {
    let digital_words = config.num_digital.div_ceil(16);
    let record_size = 8 + config.num_analog * 2 + digital_words * 2;
    parse_binary_records(bytes, config, record_size, |record, config| {
        let mut analog = Vec::with_capacity(config.num_analog);
        for (i, ch) in config.analog_channels.iter().enumerate() {
            let at = 8 + i * 2;
            let raw = i16::from_le_bytes([record[at], record[at + 1]]);
            analog.push(ch.scale(raw as f64));
        }

        let digital_offset = 8 + config.num_analog * 2;
        let mut digital = Vec::with_capacity(config.num_digital);
        for w in 0..digital_words {
            let at = digital_offset + w * 2;
            let word = u16::from_le_bytes([record[at], record[at + 1]]);
            for bit in 0..16 {
                if w * 16 + bit >= config.num_digital {
                    break;
                }
                digital.push(word & (1 << bit) != 0);
            }
        }
        (analog, digital)
    })
}

/// Parse BINARY32 records: the same layout with i32 analogs and u32 digital
/// words.
pub(super) fn parse_binary32(
    bytes: &[u8],
    config: &ComtradeConfig,
) -> Result<Vec<ComtradeSample>, ComtradeError> {
    let digital_words = config.num_digital.div_ceil(32);
    let record_size = 8 + config.num_analog * 4 + digital_words * 4;
    parse_binary_records(bytes, config, record_size, |record, config| {
        let mut analog = Vec::with_capacity(config.num_analog);
        for (i, ch) in config.analog_channels.iter().enumerate() {
            let at = 8 + i * 4;
            let raw = i32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]]);
            analog.push(ch.scale(raw as f64));
        }

        let digital_offset = 8 + config.num_analog * 4;
        let mut digital = Vec::with_capacity(config.num_digital);
        for w in 0..digital_words {
            let at = digital_offset + w * 4;
            let word =
                u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]]);
            for bit in 0..32 {
                if w * 32 + bit >= config.num_digital {
                    break;
                }
                digital.push(word & (1 << bit) != 0);
            }
        }
        (analog, digital)
    })
}

fn parse_binary_records(
    bytes: &[u8],
    config: &ComtradeConfig,
    record_size: usize,
    decode: impl Fn(&[u8], &ComtradeConfig) -> (Vec<f64>, Vec<bool>),
) -> Result<Vec<ComtradeSample>, ComtradeError> {
    if bytes.len() % record_size != 0 {
        return Err(ComtradeError::TruncatedData {
            record: bytes.len() / record_size,
        });
    }

    let mut samples = Vec::with_capacity(bytes.len() / record_size);
    for record in bytes.chunks_exact(record_size) {
        let number = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let raw_time = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
        let (analog, digital) = decode(record, config);
        samples.push(ComtradeSample {
            number,
            timestamp_us: timestamp_us(raw_time as f64, config.time_factor),
            analog,
            digital,
        });
    }
    Ok(samples)
}
