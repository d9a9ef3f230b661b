// COMTRADE .cfg grammar: a comma-separated, line-oriented descriptor in a
// fixed order (station line, channel counts, channel definitions, line
// frequency, rate segments, timestamps, data format, time factor).

use super::ComtradeError;
use serde::{Deserialize, Serialize};

/// Sample store encoding named on the data-format line (case-sensitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    Ascii,
    Binary,
    Binary32,
}

impl DataFormat {
    fn from_token(token: &str) -> Option<DataFormat> {
        match token {
            "ASCII" => Some(DataFormat::Ascii),
            "BINARY" => Some(DataFormat::Binary),
            "BINARY32" => Some(DataFormat::Binary32),
            _ => None,
        }
    }
}

/// Analog channel definition. `a` and `b` are the linear calibration of the
/// raw value into secondary units; `primary`/`secondary` form the CT/PT
/// ratio applied on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalogChannel {
    pub index: usize,
    pub name: String,
    pub phase: String,
    pub units: String,
    pub a: f64,
    pub b: f64,
    pub skew: f64,
    pub min: f64,
    pub max: f64,
    pub primary: f64,
    pub secondary: f64,
    pub ps: char,
}

impl AnalogChannel {
    /// CT/PT ratio; unity when the secondary rating is zero.
    pub fn ct_pt_ratio(&self) -> f64 {
        if self.secondary != 0.0 {
            self.primary / self.secondary
        } else {
            1.0
        }
    }

    /// Raw sample value to primary-referred engineering units.
    pub fn scale(&self, raw: f64) -> f64 {
        (self.a * raw + self.b) * self.ct_pt_ratio()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigitalChannel {
    pub index: usize,
    pub name: String,
    pub normal_state: u8,
}

/// One segment of the sample-rate partition: `rate_hz` applies up to (but
/// excluding) `end_sample`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRate {
    pub rate_hz: f64,
    pub end_sample: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComtradeConfig {
    pub station_name: String,
    pub rec_device_id: String,
    pub revision_year: u32,
    pub total_channels: usize,
    pub num_analog: usize,
    pub num_digital: usize,
    pub analog_channels: Vec<AnalogChannel>,
    pub digital_channels: Vec<DigitalChannel>,
    pub line_freq: f64,
    pub sample_rates: Vec<SampleRate>,
    pub start_date: String,
    pub start_time: String,
    pub data_format: DataFormat,
    pub time_factor: f64,
    pub total_samples: usize,
}

/// Line cursor that tracks the 1-based line number for diagnostics.
struct CfgLines<'a> {
    inner: std::str::Lines<'a>,
    line: usize,
}

impl<'a> CfgLines<'a> {
    fn new(text: &'a str) -> CfgLines<'a> {
        CfgLines {
            inner: text.lines(),
            line: 0,
        }
    }

    fn next_line(&mut self, what: &str) -> Result<&'a str, ComtradeError> {
        match self.inner.next() {
            Some(line) => {
                self.line += 1;
                Ok(line)
            }
            None => Err(ComtradeError::Cfg {
                line: self.line + 1,
                reason: format!("missing {}", what),
            }),
        }
    }

    fn try_next_line(&mut self) -> Option<&'a str> {
        let line = self.inner.next()?;
        self.line += 1;
        Some(line)
    }

    fn err(&self, reason: impl Into<String>) -> ComtradeError {
        ComtradeError::Cfg {
            line: self.line,
            reason: reason.into(),
        }
    }
}

fn split_fields(line: &str) -> Vec<&str> {
    line.split(',').map(str::trim).collect()
}

/// Strip a trailing channel-kind letter from a count field ("12A" -> "12").
fn strip_count_suffix(token: &str) -> &str {
    token.trim_end_matches(|c: char| c.is_ascii_alphabetic())
}

impl ComtradeConfig {
    pub fn parse(text: &str) -> Result<ComtradeConfig, ComtradeError> {
        let mut lines = CfgLines::new(text);

        // Line 1: station name, recording device id, optional revision year
        let first = lines.next_line("station line")?;
        let fields = split_fields(first);
        if fields.len() < 2 {
            return Err(lines.err("expected station name and device id"));
        }
        let station_name = fields[0].to_string();
        let rec_device_id = fields[1].to_string();
        let revision_year = if fields.len() >= 3 && !fields[2].is_empty() {
            fields[2]
                .parse::<u32>()
                .map_err(|_| lines.err(format!("invalid revision year {:?}", fields[2])))?
        } else {
            1991
        };

        // Line 2: total channels, analog count, digital count
        let counts = lines.next_line("channel counts")?;
        let fields = split_fields(counts);
        if fields.len() < 3 {
            return Err(lines.err("expected total, analog and digital channel counts"));
        }
        let total_channels = fields[0]
            .parse::<usize>()
            .map_err(|_| lines.err(format!("invalid channel count {:?}", fields[0])))?;
        let num_analog = strip_count_suffix(fields[1])
            .parse::<usize>()
            .map_err(|_| lines.err(format!("invalid analog count {:?}", fields[1])))?;
        let num_digital = strip_count_suffix(fields[2])
            .parse::<usize>()
            .map_err(|_| lines.err(format!("invalid digital count {:?}", fields[2])))?;

        let mut analog_channels = Vec::with_capacity(num_analog);
        for _ in 0..num_analog {
            let line = lines.next_line("analog channel line")?;
            analog_channels.push(parse_analog_line(line, &lines)?);
        }

        let mut digital_channels = Vec::with_capacity(num_digital);
        for _ in 0..num_digital {
            let line = lines.next_line("digital channel line")?;
            digital_channels.push(parse_digital_line(line, &lines)?);
        }

        // Line frequency
        let freq_line = lines.next_line("line frequency")?;
        let line_freq = freq_line
            .trim()
            .parse::<f64>()
            .map_err(|_| lines.err(format!("invalid line frequency {:?}", freq_line.trim())))?;

        // Sample-rate partition
        let count_line = lines.next_line("sample rate count")?;
        let num_rates = count_line
            .trim()
            .parse::<usize>()
            .map_err(|_| lines.err(format!("invalid sample rate count {:?}", count_line.trim())))?;

        let mut sample_rates = Vec::with_capacity(num_rates);
        for _ in 0..num_rates {
            let line = lines.next_line("sample rate entry")?;
            let fields = split_fields(line);
            if fields.len() < 2 {
                return Err(lines.err("expected rate and end sample"));
            }
            let rate_hz = fields[0]
                .parse::<f64>()
                .map_err(|_| lines.err(format!("invalid sample rate {:?}", fields[0])))?;
            let end_sample = fields[1]
                .parse::<usize>()
                .map_err(|_| lines.err(format!("invalid end sample {:?}", fields[1])))?;
            sample_rates.push(SampleRate {
                rate_hz,
                end_sample,
            });
        }

        // Start date/time of the first data point
        let start_line = lines.next_line("start date")?;
        let fields = split_fields(start_line);
        let (start_date, start_time) = if fields.len() >= 2 {
            (fields[0].to_string(), fields[1].to_string())
        } else {
            (String::new(), String::new())
        };

        // Trigger date/time, unused
        let _ = lines.try_next_line();

        // Data format token, case-sensitive
        let format_line = lines.next_line("data file type")?;
        let token = format_line.trim();
        let data_format = DataFormat::from_token(token).ok_or(ComtradeError::UnknownFormat {
            line: lines.line,
            token: token.to_string(),
        })?;

        // Optional time factor, defaults to 1.0
        let time_factor = match lines.try_next_line() {
            Some(line) if !line.trim().is_empty() => line
                .trim()
                .parse::<f64>()
                .map_err(|_| lines.err(format!("invalid time factor {:?}", line.trim())))?,
            _ => 1.0,
        };

        Ok(ComtradeConfig {
            station_name,
            rec_device_id,
            revision_year,
            total_channels,
            num_analog,
            num_digital,
            analog_channels,
            digital_channels,
            line_freq,
            sample_rates,
            start_date,
            start_time,
            data_format,
            time_factor,
            total_samples: 0,
        })
    }

    /// Rate of the first segment whose `end_sample` exceeds the index; the
    /// last segment's rate past the end; 0 for an empty partition.
    pub fn sample_rate_at(&self, sample_index: usize) -> f64 {
        for sr in &self.sample_rates {
            if sample_index < sr.end_sample {
                return sr.rate_hz;
            }
        }
        self.sample_rates.last().map_or(0.0, |sr| sr.rate_hz)
    }
}

fn parse_analog_line(line: &str, lines: &CfgLines) -> Result<AnalogChannel, ComtradeError> {
    let fields = split_fields(line);
    if fields.len() < 13 {
        return Err(lines.err(format!(
            "analog channel line has {} fields, expected 13",
            fields.len()
        )));
    }

    let num = |i: usize| -> Result<f64, ComtradeError> {
        fields[i]
            .parse::<f64>()
            .map_err(|_| lines.err(format!("invalid analog channel field {:?}", fields[i])))
    };

    // Disk index is 1-based
    let index = fields[0]
        .parse::<usize>()
        .map_err(|_| lines.err(format!("invalid channel index {:?}", fields[0])))?
        .saturating_sub(1);

    Ok(AnalogChannel {
        index,
        name: fields[1].to_string(),
        phase: fields[2].to_string(),
        units: fields[4].to_string(),
        a: num(5)?,
        b: num(6)?,
        skew: num(7)?,
        min: num(8)?,
        max: num(9)?,
        primary: num(10)?,
        secondary: num(11)?,
        ps: fields[12].chars().next().unwrap_or('P'),
    })
}

fn parse_digital_line(line: &str, lines: &CfgLines) -> Result<DigitalChannel, ComtradeError> {
    let fields = split_fields(line);
    if fields.len() < 5 {
        return Err(lines.err(format!(
            "digital channel line has {} fields, expected at least 5",
            fields.len()
        )));
    }

    let index = fields[0]
        .parse::<usize>()
        .map_err(|_| lines.err(format!("invalid channel index {:?}", fields[0])))?
        .saturating_sub(1);
    let normal_state = fields[4]
        .parse::<u8>()
        .map_err(|_| lines.err(format!("invalid normal state {:?}", fields[4])))?;

    Ok(DigitalChannel {
        index,
        name: fields[1].to_string(),
        normal_state,
    })
}
