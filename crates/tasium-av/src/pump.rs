//! Dummy audio pump: stands in for a missing audio driver so music and
//! voice producers never stall.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::mixer::AudioMixer;

const MAX_BATCH: usize = 16384;

/// Background thread consuming the mix output (and feeding silent voice
/// input) at roughly real time while no driver is bound. Shut down is a
/// flag checked every 10 ms; dropping the pump joins the thread.
pub struct DummyPump {
    quit: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DummyPump {
    pub fn spawn(mixer: Arc<AudioMixer>) -> Self {
        let quit = Arc::new(AtomicBool::new(false));
        let quit_flag = quit.clone();
        let handle = std::thread::spawn(move || {
            let mut out = vec![0i16; MAX_BATCH];
            let mut last = Instant::now();
            while !quit_flag.load(Ordering::Relaxed) {
                let now = Instant::now();
                // One sample per 25 us, matching the 40 kHz fallback rate.
                let samples = ((now - last).as_micros() / 25).min(MAX_BATCH as u128) as usize;
                last = now;
                let (play, rec) = mixer.dummy_directions();
                if play {
                    mixer.get_mixed(&mut out[..samples], false);
                }
                if rec {
                    mixer.put_voice(None, samples);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });
        Self {
            quit,
            handle: Some(handle),
        }
    }

    /// Signal the pump thread and join it.
    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DummyPump {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_consumes_music_while_no_driver_is_bound() {
        let mixer = Arc::new(AudioMixer::new());
        // Rates of zero leave both dummy directions active.
        mixer.voice_rate(0, 0);
        let mut pump = DummyPump::spawn(mixer.clone());
        for _ in 0..4 {
            mixer.submit_buffer(&vec![500i16; 800], false, 40000.0);
            std::thread::sleep(Duration::from_millis(15));
        }
        pump.stop();
        // Silence was recorded into the voice ring while pumping.
        assert!(mixer.voice_r_status() > 0);
    }

    #[test]
    fn stop_is_idempotent_and_joins() {
        let mixer = Arc::new(AudioMixer::new());
        let mut pump = DummyPump::spawn(mixer);
        pump.stop();
        pump.stop();
    }

    #[test]
    fn driver_rates_disable_the_pump_directions() {
        let mixer = Arc::new(AudioMixer::new());
        mixer.voice_rate(48000, 48000);
        let mut pump = DummyPump::spawn(mixer.clone());
        std::thread::sleep(Duration::from_millis(25));
        pump.stop();
        // With a driver bound in both directions the pump must not have
        // recorded anything.
        assert_eq!(mixer.voice_r_status(), 0);
    }
}
