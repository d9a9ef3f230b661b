// Rate conversion by linear interpolation.
//
// Each channel is interpolated independently from the source rate to the
// output cadence. No anti-alias filtering is applied; downsampling a source
// well above the target Nyquist rate will alias.

/// Resample every channel of `[channel][sample]` data from `input_rate` to
/// `output_rate`. The output length per channel is
/// `ceil(input_samples * output_rate / input_rate)`.
pub fn resample(input: &[Vec<f64>], input_rate: f64, output_rate: f64) -> Vec<Vec<f64>> {
    if input.is_empty() || input[0].is_empty() {
        return input.to_vec();
    }

    let input_samples = input[0].len();
    let ratio = output_rate / input_rate;
    let output_samples = (input_samples as f64 * ratio).ceil() as usize;

    input
        .iter()
        .map(|channel| {
            (0..output_samples)
                .map(|i| interpolate(channel, i as f64 / ratio))
                .collect()
        })
        .collect()
}

/// Linear interpolation at fractional index `x`, clamped to the ends.
pub fn interpolate(data: &[f64], x: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let last = data.len() - 1;
    if x <= 0.0 {
        return data[0];
    }
    if x >= last as f64 {
        return data[last];
    }
    let i = x.floor() as usize;
    let frac = x - i as f64;
    data[i] * (1.0 - frac) + data[i + 1] * frac
}
