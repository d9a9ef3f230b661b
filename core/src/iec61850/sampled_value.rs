// IEC 61850-9-2LE Sampled Value frame builder.
//
// Produces one complete Ethernet frame per sampling period: outer MAC header,
// 802.1Q tag, SV EtherType wrapper (APPID, length, reserved words) and the
// BER-encoded SAVPDU carrying a single ASDU with eight INT32 channels plus
// their quality words.

use super::ethernet::{MacAddr, VlanTag, ETHERTYPE_SV};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};

/// Fixed channel count of the 9-2LE eight-channel dataset
/// (IA, IB, IC, IN, VA, VB, VC, VN).
pub const SV_CHANNELS: usize = 8;

/// smpSynch value for a stream aligned to a local clock only.
pub const SMP_SYNCH_LOCAL: u8 = 1;

/// A phasor given as magnitude and angle in degrees, used to synthesize
/// instantaneous channel values in injection mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhasorChannel {
    pub magnitude: f64,
    pub angle_deg: f64,
}

impl PhasorChannel {
    pub fn new(magnitude: f64, angle_deg: f64) -> PhasorChannel {
        PhasorChannel {
            magnitude,
            angle_deg,
        }
    }

    /// Instantaneous value at time `t` seconds for the given nominal
    /// frequency: round(mag * sqrt(2) * cos(2*pi*f*t + angle)).
    pub fn instantaneous(&self, t: f64, nominal_freq_hz: f64) -> i32 {
        let omega = 2.0 * PI * nominal_freq_hz;
        let angle = self.angle_deg.to_radians();
        (self.magnitude * SQRT_2 * (omega * t + angle).cos()).round() as i32
    }
}

/// State of one outgoing SV stream.
///
/// `smp_cnt` lives in `[0, smp_rate)` and wraps to zero when it reaches
/// `smp_rate`, resetting once per second at the configured rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvStream {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub vlan: VlanTag,
    pub app_id: u16,
    pub sv_id: String,
    pub conf_rev: u32,
    pub smp_synch: u8,
    pub smp_rate: u16,
    smp_cnt: u16,
}

impl SvStream {
    pub fn new(
        dst_mac: MacAddr,
        src_mac: MacAddr,
        vlan: VlanTag,
        app_id: u16,
        sv_id: String,
        smp_rate: u16,
    ) -> SvStream {
        SvStream {
            dst_mac,
            src_mac,
            vlan,
            app_id,
            sv_id,
            conf_rev: 1,
            smp_synch: SMP_SYNCH_LOCAL,
            smp_rate,
            smp_cnt: 0,
        }
    }

    pub fn smp_cnt(&self) -> u16 {
        self.smp_cnt
    }

    /// Advance the sample counter, wrapping at `smp_rate`.
    pub fn advance(&mut self) {
        self.smp_cnt += 1;
        if self.smp_cnt >= self.smp_rate {
            self.smp_cnt = 0;
        }
    }

    /// Synthesize the eight instantaneous INT32 samples for the current
    /// sample count from phasor magnitudes and angles.
    pub fn synthesize(
        &self,
        phasors: &[PhasorChannel; SV_CHANNELS],
        nominal_freq_hz: f64,
    ) -> [i32; SV_CHANNELS] {
        let t = self.smp_cnt as f64 / self.smp_rate as f64;
        let mut samples = [0i32; SV_CHANNELS];
        for (sample, phasor) in samples.iter_mut().zip(phasors.iter()) {
            *sample = phasor.instantaneous(t, nominal_freq_hz);
        }
        samples
    }

    /// Build the complete Ethernet frame for the current sample count.
    pub fn build_frame(
        &self,
        samples: &[i32; SV_CHANNELS],
        qualities: &[u32; SV_CHANNELS],
    ) -> Vec<u8> {
        let savpdu = self.encode_savpdu(samples, qualities);

        let mut frame = Vec::with_capacity(26 + 4 + savpdu.len());
        frame.extend_from_slice(&self.dst_mac.octets());
        frame.extend_from_slice(&self.src_mac.octets());
        frame.extend_from_slice(&self.vlan.encode());
        frame.extend_from_slice(&ETHERTYPE_SV.to_be_bytes());
        frame.extend_from_slice(&self.app_id.to_be_bytes());

        // Length covers APPID+length+reserved words plus the tagged SAVPDU.
        let total_len = (4 + 1 + ber_length_size(savpdu.len()) + savpdu.len() + 4) as u16;
        frame.extend_from_slice(&total_len.to_be_bytes());

        // Reserved1 + Reserved2
        frame.extend_from_slice(&[0u8; 4]);

        frame.push(0x60);
        push_ber_length(&mut frame, savpdu.len());
        frame.extend_from_slice(&savpdu);
        frame
    }

    fn encode_savpdu(&self, samples: &[i32; SV_CHANNELS], qualities: &[u32; SV_CHANNELS]) -> Vec<u8> {
        // ASDU body
        let mut asdu = Vec::with_capacity(32 + self.sv_id.len() + 8 * SV_CHANNELS);

        // svID (VisibleString)
        asdu.push(0x80);
        asdu.push(self.sv_id.len() as u8);
        asdu.extend_from_slice(self.sv_id.as_bytes());

        // smpCnt
        asdu.push(0x82);
        asdu.push(0x02);
        asdu.extend_from_slice(&self.smp_cnt.to_be_bytes());

        // confRev
        asdu.push(0x83);
        asdu.push(0x04);
        asdu.extend_from_slice(&self.conf_rev.to_be_bytes());

        // smpSynch
        asdu.push(0x85);
        asdu.push(0x01);
        asdu.push(self.smp_synch);

        // smpRate, required by 9-2LE
        asdu.push(0x86);
        asdu.push(0x02);
        asdu.extend_from_slice(&self.smp_rate.to_be_bytes());

        // seqData: 8 x (INT32 sample + quality word), big-endian
        asdu.push(0x87);
        asdu.push((8 * SV_CHANNELS) as u8);
        for ch in 0..SV_CHANNELS {
            asdu.extend_from_slice(&samples[ch].to_be_bytes());
            asdu.extend_from_slice(&qualities[ch].to_be_bytes());
        }

        // ASDU wrapped in a SEQUENCE
        let mut seq_asdu = Vec::with_capacity(asdu.len() + 3);
        seq_asdu.push(0x30);
        push_ber_length(&mut seq_asdu, asdu.len());
        seq_asdu.extend_from_slice(&asdu);

        // SAVPDU: noASDU then the sequence of ASDUs
        let mut savpdu = Vec::with_capacity(seq_asdu.len() + 6);
        savpdu.push(0x80);
        savpdu.push(0x01);
        savpdu.push(1); // noASDU
        savpdu.push(0xA2);
        push_ber_length(&mut savpdu, seq_asdu.len());
        savpdu.extend_from_slice(&seq_asdu);
        savpdu
    }
}

fn ber_length_size(len: usize) -> usize {
    if len > 255 {
        3
    } else if len > 127 {
        2
    } else {
        1
    }
}

/// Append a BER definite length, short form where it fits.
fn push_ber_length(buf: &mut Vec<u8>, len: usize) {
    if len > 255 {
        buf.push(0x82);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len > 127 {
        buf.push(0x81);
        buf.push(len as u8);
    } else {
        buf.push(len as u8);
    }
}
