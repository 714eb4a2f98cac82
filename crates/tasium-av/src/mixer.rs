//! Music/voice mixer with drift-corrected output rate.
//!
//! The emulated core submits music buffers at its own pace; an audio
//! driver (or the dummy pump) drains mixed 16-bit PCM with
//! [`AudioMixer::get_mixed`]. Producer/consumer phase is kept by nudging
//! the effective playback rate by 1 Hz whenever the music ring overruns
//! or runs dry, within ±[`MAX_VOICE_ADJUST`] Hz of the nominal rate.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::dumper::SampleSink;
use crate::resampler::CubicResampler;
use crate::vu::VuMeter;

pub const MUSIC_BUFFERS: usize = 8;
pub const MAX_VOICE_ADJUST: u32 = 200;
/// i16 slots in one music buffer (stereo pairs count as two slots).
pub const MUSIC_BUFSIZE: usize = 8192;
/// f32 slots in each voice ring.
pub const VOICE_BUFSIZE: usize = 65536;

const DEFAULT_VOICE_RATE: u32 = 40000;

struct MusicBuffer {
    samples: Vec<i16>,
    rate: f64,
    stereo: bool,
    size: usize,
}

struct VoiceRing {
    buffer: Vec<f32>,
    get: usize,
    put: usize,
}

impl VoiceRing {
    fn new() -> Self {
        Self {
            buffer: vec![0.0; VOICE_BUFSIZE],
            get: 0,
            put: 0,
        }
    }

    fn used(&self) -> usize {
        if self.get > self.put {
            VOICE_BUFSIZE - (self.get - self.put)
        } else {
            self.put - self.get
        }
    }

    fn free(&self) -> usize {
        if self.get > self.put {
            self.get - self.put - 1
        } else {
            VOICE_BUFSIZE - (self.put - self.get) - 1
        }
    }
}

/// Where the mix loop reads music from on this iteration.
struct MusicView {
    index: Option<usize>,
    pointer: usize,
    total: usize,
    stereo: bool,
    rate: f64,
}

struct MixerState {
    music: Vec<MusicBuffer>,
    /// Last buffer fully written by the producer; `MUSIC_BUFFERS` while
    /// nothing has been submitted yet.
    last_complete_music: usize,
    /// Buffer the consumer is currently playing; sentinel when unseen.
    last_complete_music_seen: usize,
    music_ptr: usize,
    voicep: VoiceRing,
    voicer: VoiceRing,
    voice_rate_play: u32,
    orig_voice_rate_play: u32,
    voice_rate_rec: u32,
    dummy_play_active: bool,
    dummy_rec_active: bool,
    music_volume: f32,
    voicep_volume: f32,
    voicer_volume: f32,
    last_adjust: bool,
    resampler: CubicResampler,
    vu_mleft: VuMeter,
    vu_mright: VuMeter,
    vu_vout: VuMeter,
    vu_vin: VuMeter,
    sink: Option<Box<dyn SampleSink>>,
}

impl MixerState {
    /// Acknowledge `played` samples and pick the buffer to read next,
    /// applying the rubber-band rate correction.
    fn get_music(&mut self, played: usize) -> MusicView {
        let midx2 = self.last_complete_music;
        if midx2 >= MUSIC_BUFFERS {
            return MusicView {
                index: None,
                pointer: 0,
                total: 64,
                stereo: false,
                rate: 48000.0,
            };
        }
        let mut midx = self.last_complete_music_seen;
        if midx >= MUSIC_BUFFERS {
            midx = 0;
            self.last_complete_music_seen = 0;
            self.music_ptr = 0;
        } else {
            self.music_ptr += played;
            if (midx2 + 1) % MUSIC_BUFFERS == midx {
                // The producer is about to overwrite the buffer being
                // played: skip ahead and slow the consumer down.
                if !self.last_adjust
                    && self.voice_rate_play
                        > self.orig_voice_rate_play.saturating_sub(MAX_VOICE_ADJUST)
                {
                    self.voice_rate_play -= 1;
                    tracing::debug!(rate = self.voice_rate_play, "music overrun, slowing output");
                }
                self.last_adjust = true;
                midx = (midx + 1) % MUSIC_BUFFERS;
                self.last_complete_music_seen = midx;
                self.music_ptr = 0;
            } else if self.music_ptr >= self.music[midx].size && midx != midx2 {
                // Current buffer finished and another is queued.
                midx = (midx + 1) % MUSIC_BUFFERS;
                self.last_complete_music_seen = midx;
                self.music_ptr = 0;
                self.last_adjust = false;
            } else if self.music_ptr >= self.music[midx].size && midx == midx2 {
                // Ran dry: speed the consumer up and emit silence.
                if !self.last_adjust
                    && self.voice_rate_play < self.orig_voice_rate_play + MAX_VOICE_ADJUST
                {
                    self.voice_rate_play += 1;
                    tracing::debug!(rate = self.voice_rate_play, "music underrun, speeding output");
                }
                self.last_adjust = true;
            } else {
                self.last_adjust = false;
            }
        }
        let buffer = &self.music[midx];
        if self.music_ptr < buffer.size {
            MusicView {
                index: Some(midx),
                pointer: self.music_ptr,
                total: buffer.size,
                stereo: buffer.stereo,
                rate: buffer.rate,
            }
        } else {
            // Nothing to play; rate 0 buffers do exist, fall back to 48 kHz.
            MusicView {
                index: None,
                pointer: 0,
                total: 64,
                stereo: buffer.stereo,
                rate: if buffer.rate < 100.0 { 48000.0 } else { buffer.rate },
            }
        }
    }

    fn get_voice(&mut self, mut samples: Option<&mut [f32]>, count: usize) {
        let mut get = self.voicep.get;
        for i in 0..count {
            let available = get != self.voicep.put;
            if let Some(out) = samples.as_deref_mut() {
                out[i] = if available {
                    self.voicep_volume * self.voicep.buffer[get]
                } else {
                    0.0
                };
            }
            if available {
                get += 1;
                if get == VOICE_BUFSIZE {
                    get = 0;
                }
            }
        }
        self.voicep.get = get;
    }

    fn put_voice(&mut self, samples: Option<&[f32]>, count: usize, frozen: bool) {
        self.vu_vin.process(
            samples,
            count,
            false,
            self.voice_rate_rec as f64,
            self.voicer_volume as f64,
            frozen,
        );
        let mut put = self.voicer.put;
        for i in 0..count {
            self.voicer.buffer[put] = match samples {
                Some(s) => self.voicer_volume * s[i],
                None => 0.0,
            };
            put += 1;
            if put == VOICE_BUFSIZE {
                put = 0;
            }
        }
        self.voicer.put = put;
    }
}

pub struct AudioMixer {
    state: Mutex<MixerState>,
    vu_frozen: AtomicBool,
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioMixer {
    pub fn new() -> Self {
        let music = (0..MUSIC_BUFFERS)
            .map(|_| MusicBuffer {
                samples: vec![0; MUSIC_BUFSIZE],
                rate: 48000.0,
                stereo: false,
                size: 0,
            })
            .collect();
        Self {
            state: Mutex::new(MixerState {
                music,
                last_complete_music: MUSIC_BUFFERS,
                last_complete_music_seen: MUSIC_BUFFERS + 1,
                music_ptr: 0,
                voicep: VoiceRing::new(),
                voicer: VoiceRing::new(),
                voice_rate_play: DEFAULT_VOICE_RATE,
                orig_voice_rate_play: DEFAULT_VOICE_RATE,
                voice_rate_rec: DEFAULT_VOICE_RATE,
                dummy_play_active: true,
                dummy_rec_active: true,
                music_volume: 1.0,
                voicep_volume: 32767.0,
                voicer_volume: 1.0 / 32768.0,
                last_adjust: false,
                resampler: CubicResampler::new(),
                vu_mleft: VuMeter::new(),
                vu_mright: VuMeter::new(),
                vu_vout: VuMeter::new(),
                vu_vin: VuMeter::new(),
                sink: None,
            }),
            vu_frozen: AtomicBool::new(false),
        }
    }

    /// Attach the dump-pipeline consumer fed by [`submit_buffer`]
    /// (Self::submit_buffer).
    pub fn set_sink(&self, sink: Box<dyn SampleSink>) {
        self.state.lock().sink = Some(sink);
    }

    /// Configure driver rates. A zero rate means "no driver bound" for
    /// that direction: the 40 kHz fallback applies and the dummy pump
    /// takes over that direction.
    pub fn voice_rate(&self, rate_rec: u32, rate_play: u32) {
        let mut st = self.state.lock();
        st.voice_rate_rec = if rate_rec != 0 { rate_rec } else { DEFAULT_VOICE_RATE };
        st.dummy_rec_active = rate_rec == 0;
        let play = if rate_play != 0 { rate_play } else { DEFAULT_VOICE_RATE };
        st.voice_rate_play = play;
        st.orig_voice_rate_play = play;
        st.dummy_play_active = rate_play == 0;
    }

    /// Current `(record, playback)` rates, drift correction included.
    pub fn voice_rates(&self) -> (u32, u32) {
        let st = self.state.lock();
        (st.voice_rate_rec, st.voice_rate_play)
    }

    /// Nominal playback rate before drift correction.
    pub fn orig_voice_rate(&self) -> u32 {
        self.state.lock().orig_voice_rate_play
    }

    pub(crate) fn dummy_directions(&self) -> (bool, bool) {
        let st = self.state.lock();
        (st.dummy_play_active, st.dummy_rec_active)
    }

    pub fn music_volume(&self) -> f32 {
        self.state.lock().music_volume
    }

    pub fn set_music_volume(&self, volume: f32) {
        self.state.lock().music_volume = volume;
    }

    pub fn voicep_volume(&self) -> f32 {
        self.state.lock().voicep_volume / 32767.0
    }

    pub fn set_voicep_volume(&self, volume: f32) {
        self.state.lock().voicep_volume = volume * 32767.0;
    }

    pub fn voicer_volume(&self) -> f32 {
        self.state.lock().voicer_volume * 32768.0
    }

    pub fn set_voicer_volume(&self, volume: f32) {
        self.state.lock().voicer_volume = volume / 32768.0;
    }

    /// Free slots in the voice playback ring.
    pub fn voice_p_status(&self) -> usize {
        self.state.lock().voicep.free()
    }

    /// Used slots in the voice playback ring.
    pub fn voice_p_status2(&self) -> usize {
        self.state.lock().voicep.used()
    }

    /// Used slots in the voice record ring.
    pub fn voice_r_status(&self) -> usize {
        self.state.lock().voicer.used()
    }

    /// Queue voice samples for playback.
    pub fn play_voice(&self, samples: &[f32]) {
        let mut st = self.state.lock();
        let mut put = st.voicep.put;
        for &s in samples {
            st.voicep.buffer[put] = s;
            put += 1;
            if put == VOICE_BUFSIZE {
                put = 0;
            }
        }
        st.voicep.put = put;
    }

    /// Drain recorded voice samples.
    pub fn record_voice(&self, samples: &mut [f32]) {
        let mut st = self.state.lock();
        let mut get = st.voicer.get;
        for s in samples.iter_mut() {
            *s = st.voicer.buffer[get];
            get += 1;
            if get == VOICE_BUFSIZE {
                get = 0;
            }
        }
        st.voicer.get = get;
    }

    /// Driver-side voice output tap; `None` discards while still
    /// advancing the ring.
    pub fn get_voice(&self, samples: Option<&mut [f32]>, count: usize) {
        self.state.lock().get_voice(samples, count);
    }

    /// Driver-side voice input; `None` records silence.
    pub fn put_voice(&self, samples: Option<&[f32]>, count: usize) {
        let frozen = self.vu_frozen.load(Ordering::Relaxed);
        self.state.lock().put_voice(samples, count, frozen);
    }

    /// Submit one music buffer from the emulated core. Every sample pair
    /// is forwarded to the dump sink first; the buffer is then clipped to
    /// the ring slot size and published to the consumer.
    pub fn submit_buffer(&self, samples: &[i16], stereo: bool, rate: f64) {
        let mut st = self.state.lock();
        if let Some(sink) = st.sink.as_mut() {
            if stereo {
                for pair in samples.chunks_exact(2) {
                    sink.on_sample(pair[0], pair[1]);
                }
            } else {
                for &s in samples {
                    sink.on_sample(s, s);
                }
            }
        }
        let channels = if stereo { 2 } else { 1 };
        let count = (samples.len() / channels).min(MUSIC_BUFSIZE / channels);
        let bidx = if st.last_complete_music > MUSIC_BUFFERS - 2 {
            0
        } else {
            st.last_complete_music + 1
        };
        st.music[bidx].samples[..count * channels]
            .copy_from_slice(&samples[..count * channels]);
        st.music[bidx].stereo = stereo;
        st.music[bidx].rate = rate;
        st.music[bidx].size = count;
        st.last_complete_music = bidx;
    }

    /// Main mix path: resampled music plus voice playback, clamped into
    /// 16-bit PCM. `out` is filled completely; underruns mix silence.
    pub fn get_mixed(&self, out: &mut [i16], stereo: bool) {
        let frozen = self.vu_frozen.load(Ordering::Relaxed);
        let out_channels = if stereo { 2 } else { 1 };
        let mut st = self.state.lock();
        let mut filled = 0;
        let mut remaining = out.len() / out_channels;
        let mut music = [0f32; 256];
        let mut mixed = [0f32; 256];
        while remaining > 0 {
            let view = st.get_music(0);
            let rate_play = st.voice_rate_play as f64;
            let ratio = rate_play / view.rate;
            let produced;
            if view.stereo {
                let indata = (view.total - view.pointer).min(128);
                let outdata = remaining.min(128);
                for i in 0..2 * indata {
                    music[i] = match view.index {
                        Some(b) => {
                            st.music_volume * st.music[b].samples[2 * view.pointer + i] as f32
                        }
                        None => 0.0,
                    };
                }
                let (consumed, prod) = st.resampler.resample(
                    &music[..2 * indata],
                    &mut mixed[..2 * outdata],
                    ratio,
                    true,
                );
                produced = prod;
                st.get_music(consumed);
                st.get_voice(Some(&mut music[..produced]), produced);

                if produced > 0 {
                    st.vu_mleft
                        .process(Some(&mixed[..2 * produced]), produced, true, rate_play, 1.0 / 32768.0, frozen);
                    st.vu_mright
                        .process(Some(&mixed[1..2 * produced]), produced, true, rate_play, 1.0 / 32768.0, frozen);
                    st.vu_vout
                        .process(Some(&music[..produced]), produced, false, rate_play, 1.0 / 32768.0, frozen);
                }

                for i in 0..2 * produced {
                    mixed[i] = (mixed[i] + music[i / 2]).clamp(-32767.0, 32766.0);
                }
                if stereo {
                    for i in 0..2 * produced {
                        out[2 * filled + i] = mixed[i] as i16;
                    }
                } else {
                    for i in 0..produced {
                        out[filled + i] = ((mixed[2 * i] + mixed[2 * i + 1]) / 2.0) as i16;
                    }
                }
            } else {
                let indata = (view.total - view.pointer).min(256);
                let outdata = remaining.min(256);
                for i in 0..indata {
                    music[i] = match view.index {
                        Some(b) => st.music_volume * st.music[b].samples[view.pointer + i] as f32,
                        None => 0.0,
                    };
                }
                let (consumed, prod) =
                    st.resampler
                        .resample(&music[..indata], &mut mixed[..outdata], ratio, false);
                produced = prod;
                st.get_music(consumed);
                st.get_voice(Some(&mut music[..produced]), produced);

                if produced > 0 {
                    st.vu_mleft
                        .process(Some(&mixed[..produced]), produced, false, rate_play, 1.0 / 32768.0, frozen);
                    st.vu_mright
                        .process(Some(&mixed[..produced]), produced, false, rate_play, 1.0 / 32768.0, frozen);
                    st.vu_vout
                        .process(Some(&music[..produced]), produced, false, rate_play, 1.0 / 32768.0, frozen);
                }

                for i in 0..produced {
                    mixed[i] = (mixed[i] + music[i]).clamp(-32767.0, 32766.0);
                }
                if stereo {
                    for i in 0..produced {
                        out[2 * (filled + i)] = mixed[i] as i16;
                        out[2 * (filled + i) + 1] = mixed[i] as i16;
                    }
                } else {
                    for i in 0..produced {
                        out[filled + i] = mixed[i] as i16;
                    }
                }
            }
            filled += produced;
            remaining -= produced;
        }
    }

    /// Freeze or resume VU level reporting.
    pub fn freeze_vu(&self, frozen: bool) {
        self.vu_frozen.store(frozen, Ordering::Relaxed);
    }

    /// Current `(music left, music right, voice out, voice in)` VU levels
    /// in dB.
    pub fn vu_levels(&self) -> (f64, f64, f64, f64) {
        let st = self.state.lock();
        (
            st.vu_mleft.level(),
            st.vu_mright.level(),
            st.vu_vout.level(),
            st.vu_vin.level(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mixed_output_follows_submitted_music() {
        let mixer = AudioMixer::new();
        mixer.voice_rate(48000, 48000);
        let tone = vec![1000i16; 4096];
        mixer.submit_buffer(&tone, false, 48000.0);
        let mut out = vec![0i16; 2048];
        mixer.get_mixed(&mut out, false);
        // Skip the resampler warm-up, then the tone must come through.
        assert!(out[16..1000].iter().all(|&s| (s - 1000).abs() <= 1));
    }

    #[test]
    fn stereo_buffers_mix_to_both_channels() {
        let mixer = AudioMixer::new();
        mixer.voice_rate(48000, 48000);
        let mut pairs = Vec::new();
        for _ in 0..2048 {
            pairs.push(2000i16);
            pairs.push(-2000i16);
        }
        mixer.submit_buffer(&pairs, true, 48000.0);
        let mut out = vec![0i16; 2048];
        mixer.get_mixed(&mut out, true);
        assert!(out[40] > 1500);
        assert!(out[41] < -1500);
    }

    #[test]
    fn voice_playback_is_mixed_and_scaled() {
        let mixer = AudioMixer::new();
        mixer.voice_rate(48000, 48000);
        // Half-scale voice over silence.
        mixer.play_voice(&vec![0.5f32; 512]);
        assert_eq!(mixer.voice_p_status2(), 512);
        let mut out = vec![0i16; 256];
        mixer.get_mixed(&mut out, false);
        assert!(out.iter().skip(8).all(|&s| (s as i32 - 16383).abs() <= 2));
    }

    #[test]
    fn voice_record_roundtrip() {
        let mixer = AudioMixer::new();
        mixer.voice_rate(48000, 48000);
        let input = vec![16384.0f32; 64];
        mixer.put_voice(Some(&input), input.len());
        assert_eq!(mixer.voice_r_status(), 64);
        let mut out = vec![0.0f32; 64];
        mixer.record_voice(&mut out);
        // voicer volume scales into ±1 floats.
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-4));
    }

    #[test]
    fn sink_receives_samples_in_submission_order() {
        let mixer = AudioMixer::new();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let tap = captured.clone();
        mixer.set_sink(Box::new(move |l: i16, r: i16| {
            tap.lock().push((l, r));
        }));
        mixer.submit_buffer(&[1, 2, 3], false, 48000.0);
        mixer.submit_buffer(&[4, 5, 6, 7], true, 48000.0);
        let got = captured.lock().clone();
        assert_eq!(got, vec![(1, 1), (2, 2), (3, 3), (4, 5), (6, 7)]);
    }

    #[test]
    fn overrun_slows_playback_rate() {
        let mixer = AudioMixer::new();
        mixer.voice_rate(48000, 48000);
        mixer.submit_buffer(&vec![0i16; 64], false, 48000.0);
        // Latch the consumer onto buffer 0.
        let mut out = vec![0i16; 16];
        mixer.get_mixed(&mut out, false);
        // Producer laps the ring right up to the consumer's buffer.
        for _ in 0..7 {
            mixer.submit_buffer(&vec![0i16; 64], false, 48000.0);
        }
        mixer.get_mixed(&mut out, false);
        assert!(mixer.voice_rates().1 < 48000);
        assert!(mixer.voice_rates().1 >= 48000 - MAX_VOICE_ADJUST);
    }

    #[test]
    fn underrun_speeds_playback_rate() {
        let mixer = AudioMixer::new();
        mixer.voice_rate(48000, 48000);
        mixer.submit_buffer(&vec![0i16; 64], false, 48000.0);
        // Consume far more than one buffer's worth.
        let mut out = vec![0i16; 512];
        mixer.get_mixed(&mut out, false);
        mixer.get_mixed(&mut out, false);
        assert!(mixer.voice_rates().1 > 48000);
        assert!(mixer.voice_rates().1 <= 48000 + MAX_VOICE_ADJUST);
    }

    #[test]
    fn balanced_stream_keeps_rate_near_nominal() {
        let mixer = AudioMixer::new();
        mixer.voice_rate(48000, 48000);
        let buf = vec![100i16; 960];
        let mut out = vec![0i16; 960];
        for _ in 0..50 {
            mixer.submit_buffer(&buf, false, 48000.0);
            mixer.get_mixed(&mut out, false);
        }
        let (_, play) = mixer.voice_rates();
        assert!((48000 - MAX_VOICE_ADJUST..=48000 + MAX_VOICE_ADJUST).contains(&play));
    }

    #[test]
    fn vu_meters_track_music_level() {
        let mixer = AudioMixer::new();
        mixer.voice_rate(48000, 48000);
        for _ in 0..4 {
            let loud: Vec<i16> = (0..4800).map(|i| if i % 2 == 0 { 20000 } else { -20000 }).collect();
            mixer.submit_buffer(&loud, false, 48000.0);
            let mut out = vec![0i16; 4800];
            mixer.get_mixed(&mut out, false);
        }
        let (mleft, mright, _, _) = mixer.vu_levels();
        assert!(mleft > -10.0, "mleft {mleft}");
        assert_eq!(mleft, mright);
    }
}
