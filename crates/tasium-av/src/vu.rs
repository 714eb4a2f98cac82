//! VU metering: mean-square level integrated over 1/25 s windows.

/// One meter. Levels are reported in dB relative to full scale, floored
/// at -999 dB.
pub struct VuMeter {
    accumulator: f64,
    samples: usize,
    vu: f64,
}

impl Default for VuMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl VuMeter {
    pub fn new() -> Self {
        Self {
            accumulator: 0.0,
            samples: 0,
            vu: -999.0,
        }
    }

    /// Current level in dB.
    pub fn level(&self) -> f64 {
        self.vu
    }

    /// Feed samples. `None` counts silent samples without touching the
    /// accumulator. Stereo input is sampled on every other slot so each
    /// meter tracks one channel. `scale` converts samples to full-scale
    /// units. When `frozen` is set the windows still advance but the
    /// reported level stays put.
    pub fn process(
        &mut self,
        samples: Option<&[f32]>,
        count: usize,
        stereo: bool,
        rate: f64,
        scale: f64,
        frozen: bool,
    ) {
        let limit = ((rate / 25.0) as usize).max(1);
        if self.samples >= limit {
            self.update(frozen);
        }
        match samples {
            Some(data) => {
                let sscale = scale * scale;
                let step = if stereo { 2 } else { 1 };
                for i in 0..count {
                    let s = data[step * i] as f64;
                    self.accumulator += sscale * s * s;
                    self.samples += 1;
                    if self.samples >= limit {
                        self.update(frozen);
                    }
                }
            }
            None => {
                for _ in 0..count {
                    self.samples += 1;
                    if self.samples >= limit {
                        self.update(frozen);
                    }
                }
            }
        }
    }

    fn update(&mut self, frozen: bool) {
        if frozen {
            return;
        }
        if self.samples == 0 {
            self.vu = -999.0;
            self.accumulator = 0.0;
            return;
        }
        let power = self.accumulator.max(1e-120);
        self.vu = (10.0 / std::f64::consts::LN_10) * (power.ln() - (self.samples as f64).ln());
        self.vu = self.vu.max(-999.0);
        self.accumulator = 0.0;
        self.samples = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scale_sine_reads_near_minus_three_db() {
        let mut vu = VuMeter::new();
        let rate = 48000.0;
        let tone: Vec<f32> = (0..48000)
            .map(|i| (i as f32 * 0.05).sin() * 32768.0)
            .collect();
        vu.process(Some(&tone), tone.len(), false, rate, 1.0 / 32768.0, false);
        // Mean square of a full-scale sine is 1/2 -> ~-3.01 dB.
        assert!((vu.level() + 3.01).abs() < 0.2, "level {}", vu.level());
    }

    #[test]
    fn silence_pushes_level_down() {
        let mut vu = VuMeter::new();
        let silent = vec![0.0f32; 9600];
        vu.process(Some(&silent), silent.len(), false, 48000.0, 1.0 / 32768.0, false);
        assert!(vu.level() <= -999.0);
    }

    #[test]
    fn frozen_meter_keeps_its_reading() {
        let mut vu = VuMeter::new();
        let loud = vec![20000.0f32; 4800];
        vu.process(Some(&loud), loud.len(), false, 48000.0, 1.0 / 32768.0, false);
        let before = vu.level();
        let silent = vec![0.0f32; 9600];
        vu.process(Some(&silent), silent.len(), false, 48000.0, 1.0 / 32768.0, true);
        assert_eq!(vu.level(), before);
    }

    #[test]
    fn none_input_counts_as_silence() {
        let mut vu = VuMeter::new();
        vu.process(None, 4800, false, 48000.0, 1.0, false);
        assert!(vu.level() <= -999.0);
    }
}
