//! Movie state machine: translates the emulator core's polling sequence
//! into recorded subframes (read-write mode) or deterministic replays
//! (read-only mode).
//!
//! Frames are numbered from 1; `current_frame == 0` means "before start".
//! `current_frame_first_subframe` indexes the first subframe of the frame
//! being executed inside the owned [`ControllerFrameVector`].

use crate::controller::{
    ControllerFrame, ControllerFrameVector, PollcounterVector, PortTypeSet,
};
use crate::error::MovieError;

/// Hook the embedded core uses to mark a frame as non-lag even when no
/// input was polled. Implementations use interior mutability; the handler
/// is shared between the core and the movie.
pub trait PollFlag {
    fn get(&self) -> bool;
    fn set(&self, value: bool);
}

/// Movie-side savestate payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieState {
    pub project_id: String,
    pub current_frame: u64,
    pub lag_frames: u64,
    pub pollcounters: Vec<u32>,
}

/// Trusted savestate payload for the fast save/load hot path. Carries the
/// subframe pointer directly instead of recomputing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastState {
    pub current_frame: u64,
    pub first_subframe: u64,
    pub lag_frames: u64,
    pub pollcounters: Vec<u32>,
}

pub struct Movie {
    data: ControllerFrameVector,
    pollcounters: PollcounterVector,
    current_controls: ControllerFrame,
    readonly: bool,
    rerecords: String,
    project_id: String,
    current_frame: u64,
    current_frame_first_subframe: u64,
    lag_frames: u64,
    seqno: u64,
    cached_frame: u64,
    cached_subframe: u64,
    pflag_handler: Option<Box<dyn PollFlag>>,
}

impl Movie {
    pub fn new(types: &PortTypeSet) -> Self {
        let data = ControllerFrameVector::new(types);
        let current_controls = data.blank_frame(false);
        Self {
            pollcounters: PollcounterVector::new(types),
            current_controls,
            data,
            readonly: false,
            rerecords: "0".to_string(),
            project_id: String::new(),
            current_frame: 0,
            current_frame_first_subframe: 0,
            lag_frames: 0,
            seqno: 0,
            cached_frame: 1,
            cached_subframe: 0,
            pflag_handler: None,
        }
    }

    pub fn set_pflag_handler(&mut self, handler: Box<dyn PollFlag>) {
        self.pflag_handler = Some(handler);
    }

    pub fn readonly_mode(&self) -> bool {
        self.readonly
    }

    pub fn rerecord_count(&self) -> &str {
        &self.rerecords
    }

    pub fn set_rerecord_count(&mut self, count: &str) {
        self.rerecords = count.to_string();
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn set_project_id(&mut self, id: &str) {
        self.project_id = id.to_string();
    }

    /// Monotonic movie identity; bumped on every full reload so callers can
    /// invalidate caches.
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn lag_frames(&self) -> u64 {
        self.lag_frames
    }

    /// Number of whole (sync) frames in the movie data.
    pub fn frame_count(&self) -> u64 {
        self.data.count_frames() as u64
    }

    pub fn data(&self) -> &ControllerFrameVector {
        &self.data
    }

    pub fn set_controls(&mut self, controls: ControllerFrame) {
        self.current_controls = controls;
    }

    /// Controls in effect for the current frame. In read-write mode these
    /// are the pending controls; in read-only mode the frame is
    /// reconstructed the same way polling would read it.
    pub fn get_controls(&self) -> ControllerFrame {
        if !self.readonly {
            return self.current_controls.clone();
        }
        let mut c = self.data.blank_frame(false);
        if self.current_frame == 0 {
            return c;
        }
        let changes = self.count_changes(self.current_frame_first_subframe);
        if changes == 0 {
            return c;
        }
        for i in 0..self.data.types().indices() {
            let polls = self.pollcounters.get_polls(i) as u64;
            let index = if changes > polls { polls } else { changes - 1 };
            let v = self
                .data
                .frame((self.current_frame_first_subframe + index) as usize)
                .axis2(i);
            c.set_axis2(i, v);
        }
        c
    }

    pub fn get_drdy(&self, port: u32, controller: u32, control: u32) -> bool {
        self.pollcounters.get_drdy_triple(port, controller, control)
    }

    pub fn set_all_drdy(&mut self) {
        self.pollcounters.set_all_drdy();
    }

    /// 1-based ordinal of the next poll on the most-polled control.
    pub fn next_poll_number(&self) -> u32 {
        self.pollcounters.max_polls() + 1
    }

    pub fn pollcounters(&self) -> &PollcounterVector {
        &self.pollcounters
    }

    #[inline]
    fn count_changes(&self, first_subframe: u64) -> u64 {
        self.data.subframe_count(first_subframe as usize) as u64
    }

    /// The current controls always share the vector's type set, so this
    /// append cannot fail.
    fn push(&mut self, frame: ControllerFrame) {
        let _ = self.data.append(&frame);
    }

    /// Poll one control. This is the callback the emulator core's
    /// `get_input` is routed through.
    pub fn next_input(&mut self, port: u32, controller: u32, control: u32) -> i16 {
        self.pollcounters.clear_drdy_triple(port, controller, control);

        if self.readonly {
            // At the end of the movie, return neutral but still record the
            // poll.
            if self.current_frame_first_subframe >= self.data.len() as u64 {
                self.pollcounters
                    .increment_polls_triple(port, controller, control);
                return 0;
            }
            // Before the beginning, return neutral.
            if self.current_frame == 0 {
                return 0;
            }
            let changes = self.count_changes(self.current_frame_first_subframe);
            let polls = self.pollcounters.get_polls_triple(port, controller, control) as u64;
            let index = if changes > polls { polls } else { changes - 1 };
            let value = self
                .data
                .frame((self.current_frame_first_subframe + index) as usize)
                .axis3(port, controller, control);
            self.pollcounters
                .increment_polls_triple(port, controller, control);
            value
        } else {
            // Frame 0 must not be added to the movie.
            if self.current_frame == 0 {
                return 0;
            }
            // At movie end, insert complete input with the sync flag set:
            // this is the first subframe of the frame.
            if self.current_frame_first_subframe >= self.data.len() as u64 {
                let frame = self.current_controls.copy_with_sync(true);
                self.push(frame);
                self.pollcounters
                    .increment_polls_triple(port, controller, control);
                return self
                    .data
                    .frame(self.current_frame_first_subframe as usize)
                    .axis3(port, controller, control);
            }
            let new_value = self.current_controls.axis3(port, controller, control);
            let pollcounter =
                self.pollcounters.get_polls_triple(port, controller, control) as u64;
            let len = self.data.len() as u64;
            if self.current_frame_first_subframe + pollcounter < len {
                // The poll lands on an existing subframe: write the value
                // there and propagate it to all later subframes.
                for j in self.current_frame_first_subframe + pollcounter..len {
                    self.data
                        .frame_mut(j as usize)
                        .set_axis3(port, controller, control, new_value);
                }
            } else if new_value
                != self.data.frame(len as usize - 1).axis3(port, controller, control)
            {
                // Extend with copies of the last subframe until the polled
                // position exists, then change it.
                while self.current_frame_first_subframe + pollcounter
                    >= self.data.len() as u64
                {
                    let copy = self.data.frame(self.data.len() - 1).copy_with_sync(false);
                    self.push(copy);
                }
                self.data
                    .frame_mut((self.current_frame_first_subframe + pollcounter) as usize)
                    .set_axis3(port, controller, control, new_value);
            }
            self.pollcounters
                .increment_polls_triple(port, controller, control);
            new_value
        }
    }

    /// Advance to the next frame, counting lag and materializing a subframe
    /// for unpolled frames in read-write mode.
    pub fn next_frame(&mut self) {
        // Frame 0 must not be counted as lag.
        let pflag = self.pflag_handler.as_ref().is_some_and(|h| h.get());
        if self.current_frame != 0 && !pflag {
            self.lag_frames += 1;
        } else if let Some(h) = &self.pflag_handler {
            h.set(false);
        }

        // If no control was polled, the frame is lag; in read-write mode a
        // dummy sync record still has to be written for it.
        if self.current_frame != 0 && !self.pollcounters.has_polled() && !self.readonly {
            let frame = self.current_controls.copy_with_sync(true);
            self.push(frame);
        }

        self.pollcounters.clear();

        // First subframe is undefined for frame 0 and 0 for frame 1.
        if self.current_frame != 0 {
            self.current_frame_first_subframe +=
                self.count_changes(self.current_frame_first_subframe);
        } else {
            self.current_frame_first_subframe = 0;
        }
        self.current_frame += 1;
    }

    /// Switch between read-only (replay) and read-write (record) mode.
    /// Entering read-write mode truncates the movie to what has provably
    /// been read and propagates sticky values over the rest of the frame.
    pub fn set_readonly_mode(&mut self, enable: bool) {
        let was_readonly = self.readonly;
        self.readonly = enable;
        if !(was_readonly && !enable) {
            return;
        }
        self.clear_caches();
        // Before the first frame: nothing has been consumed, so recording
        // starts from scratch.
        if self.current_frame == 0 {
            self.data.clear();
            return;
        }
        // Current frame past the movie end: pad with blank frames so the
        // frame being executed exists.
        if self.current_frame_first_subframe >= self.data.len() as u64 {
            while (self.data.count_frames() as u64) < self.current_frame {
                let frame = self.data.blank_frame(true);
                self.push(frame);
            }
            self.current_frame_first_subframe = self.data.len() as u64 - 1;
        }

        // Keep only what was readable, then propagate values whose poll
        // counters stopped short of the frame end.
        let next_frame_first_subframe = self.current_frame_first_subframe
            + self.count_changes(self.current_frame_first_subframe);
        let max_readable = (self.current_frame_first_subframe
            + self.pollcounters.max_polls() as u64)
            .min(next_frame_first_subframe);
        self.data.resize(max_readable as usize);
        let next_frame_first_subframe = max_readable;

        // Index 0 is the sync flag and must keep its recorded pattern.
        for i in 1..self.data.types().indices() {
            let polls = (self.pollcounters.get_polls(i) as u64).max(1);
            let first = self.current_frame_first_subframe + polls;
            if first >= next_frame_first_subframe {
                continue;
            }
            let value = self.data.frame(first as usize - 1).axis2(i);
            for j in first..next_frame_first_subframe {
                self.data.frame_mut(j as usize).set_axis2(i, value);
            }
        }
    }

    /// Replace the movie data, switching to read-only playback from the
    /// start. The first subframe of a non-empty vector must be a sync
    /// subframe.
    pub fn load(
        &mut self,
        rerecords: &str,
        project_id: &str,
        input: ControllerFrameVector,
    ) -> Result<(), MovieError> {
        if !input.is_empty() && !input.frame(0).sync() {
            return Err(MovieError::BadFirstFrame);
        }
        self.seqno += 1;
        self.clear_caches();
        self.readonly = true;
        self.rerecords = rerecords.to_string();
        self.project_id = project_id.to_string();
        self.current_frame = 0;
        self.current_frame_first_subframe = 0;
        self.pollcounters = PollcounterVector::new(input.types());
        self.lag_frames = 0;
        // Forces the internal type of the current controls to match the
        // loaded vector.
        self.current_controls = input.blank_frame(false);
        self.data = input;
        tracing::debug!(
            seqno = self.seqno,
            subframes = self.data.len(),
            "movie data loaded"
        );
        Ok(())
    }

    pub fn save_state(&self) -> MovieState {
        MovieState {
            project_id: self.project_id.clone(),
            current_frame: self.current_frame,
            lag_frames: self.lag_frames,
            pollcounters: self.pollcounters.save_state(),
        }
    }

    /// Restore a savestate, cross-checking it against the movie that
    /// produced it when `old_movie` is given.
    pub fn restore_state(
        &mut self,
        frame: u64,
        lag_frames: u64,
        polls: &[u32],
        readonly: bool,
        old_movie: Option<(&ControllerFrameVector, &str)>,
    ) -> Result<(), MovieError> {
        if !self.pollcounters.check(polls) {
            return Err(MovieError::WrongCounterCount {
                expected: self.pollcounters.types().indices() as usize,
                actual: polls.len(),
            });
        }
        if let Some((old_data, old_project_id)) = old_movie {
            if old_project_id != self.project_id
                || !old_data.compatible(&self.data, frame, polls)
            {
                return Err(MovieError::IncompatibleSave);
            }
        }
        let mut first_subframe = 0u64;
        for _ in 1..frame {
            first_subframe += self.count_changes(first_subframe);
        }
        self.readonly = true;
        self.current_frame = frame;
        self.current_frame_first_subframe = first_subframe;
        self.lag_frames = lag_frames;
        self.pollcounters.load_state(polls)?;
        self.set_readonly_mode(readonly);
        Ok(())
    }

    /// Savestate hot path: trusts the stored subframe pointer instead of
    /// recomputing it.
    pub fn fast_save(&self) -> FastState {
        FastState {
            current_frame: self.current_frame,
            first_subframe: self.current_frame_first_subframe,
            lag_frames: self.lag_frames,
            pollcounters: self.pollcounters.save_state(),
        }
    }

    /// Load a [`FastState`], skipping the compatibility check and forcing
    /// read-write mode.
    pub fn fast_load(&mut self, state: &FastState) -> Result<(), MovieError> {
        self.readonly = true;
        self.current_frame = state.current_frame;
        self.current_frame_first_subframe =
            state.first_subframe.min(self.data.len() as u64);
        self.lag_frames = state.lag_frames;
        self.pollcounters.load_state(&state.pollcounters)?;
        self.set_readonly_mode(false);
        Ok(())
    }

    /// Rewind to before the first frame without touching the movie data.
    pub fn reset_state(&mut self) {
        self.readonly = true;
        self.current_frame = 0;
        self.current_frame_first_subframe = 0;
        self.pollcounters.clear();
        self.lag_frames = 0;
        self.clear_caches();
    }

    fn clear_caches(&mut self) {
        self.cached_frame = 1;
        self.cached_subframe = 0;
    }

    /// Number of subframes in the given 1-based frame. Linear scans are
    /// accelerated by a cursor caching the last looked-up frame.
    pub fn frame_subframes(&mut self, frame: u64) -> u64 {
        if frame < self.cached_frame {
            self.clear_caches();
        }
        let mut subframe = self.cached_subframe;
        for _ in self.cached_frame..frame {
            subframe += self.count_changes(subframe);
        }
        self.cached_frame = frame;
        self.cached_subframe = subframe;
        self.count_changes(subframe)
    }

    /// Read one subframe of the given 1-based frame, clamping the subframe
    /// number to the frame length. Out-of-range frames read as blank sync
    /// frames.
    pub fn read_subframe(&mut self, frame: u64, subframe: u64) -> ControllerFrame {
        if frame < self.cached_frame {
            self.clear_caches();
        }
        let mut first = self.cached_subframe;
        for _ in self.cached_frame..frame {
            first += self.count_changes(first);
        }
        self.cached_frame = frame;
        self.cached_subframe = first;
        let max = self.count_changes(first);
        if max == 0 {
            return self.data.blank_frame(true);
        }
        let subframe = subframe.min(max - 1);
        self.data.frame((first + subframe) as usize).to_owned()
    }

    /// Editor hook: read one sub-control of the current frame while in
    /// read-only mode.
    pub fn read_subframe_at_index(
        &self,
        subframe: u32,
        port: u32,
        controller: u32,
        control: u32,
    ) -> i16 {
        if !self.readonly
            || self.current_frame_first_subframe >= self.data.len() as u64
            || self.current_frame == 0
        {
            return 0;
        }
        let changes = self.count_changes(self.current_frame_first_subframe);
        let index = if changes > subframe as u64 {
            subframe as u64
        } else {
            changes - 1
        };
        self.data
            .frame((self.current_frame_first_subframe + index) as usize)
            .axis3(port, controller, control)
    }

    /// Editor hook: poke one sub-control of the current frame while in
    /// read-only mode, extending the tail of the vector with blank
    /// subframes as needed. Writes past the current frame are dropped.
    pub fn write_subframe_at_index(
        &mut self,
        subframe: u32,
        port: u32,
        controller: u32,
        control: u32,
        value: i16,
    ) {
        if !self.readonly || self.current_frame == 0 {
            return;
        }
        let mut extended = false;
        while self.current_frame > self.data.count_frames() as u64 {
            extended = true;
            let frame = self.data.blank_frame(true);
            self.push(frame);
        }
        if extended {
            self.clear_caches();
            self.current_frame_first_subframe = self.data.len() as u64 - 1;
        }
        let changes = self.count_changes(self.current_frame_first_subframe);
        if self.current_frame < self.data.count_frames() as u64 {
            // Not the last frame: only existing subframes are writable.
            if (subframe as u64) < changes {
                self.data
                    .frame_mut((self.current_frame_first_subframe + subframe as u64) as usize)
                    .set_axis3(port, controller, control, value);
            }
        } else if (subframe as u64) < changes {
            self.data
                .frame_mut((self.current_frame_first_subframe + subframe as u64) as usize)
                .set_axis3(port, controller, control, value);
        } else {
            // Writing past the recorded tail of the last frame: create the
            // needed subframes first.
            if self.current_frame_first_subframe >= self.data.len() as u64 {
                let frame = self.data.blank_frame(true);
                self.push(frame);
            }
            while self.count_changes(self.current_frame_first_subframe) <= subframe as u64 {
                let frame = self.data.blank_frame(false);
                self.push(frame);
            }
            self.data
                .frame_mut((self.current_frame_first_subframe + subframe as u64) as usize)
                .set_axis3(port, controller, control, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::controller::{
        ButtonDesc, ControllerDesc, GenericPort, PortIndexMap, PortType, SystemPort,
    };

    fn pad_set() -> PortTypeSet {
        let desc = ControllerDesc::new(
            "gamepad",
            "gamepad",
            "ABsSudlr".chars().map(|c| ButtonDesc::button(c, "btn")).collect(),
        );
        let types: Vec<Arc<dyn PortType>> = vec![
            Arc::new(SystemPort::new()),
            Arc::new(GenericPort::new("gamepad", "Gamepad", 1, desc, &[0])),
        ];
        PortTypeSet::make(types.clone(), PortIndexMap::linear(&types)).unwrap()
    }

    struct Flag(AtomicBool);

    impl PollFlag for Arc<Flag> {
        fn get(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }

        fn set(&self, value: bool) {
            self.0.store(value, Ordering::Relaxed)
        }
    }

    #[test]
    fn load_rejects_nonsync_first_subframe() {
        let set = pad_set();
        let mut v = ControllerFrameVector::new(&set);
        let f = v.blank_frame(false);
        v.append(&f).unwrap();
        let mut m = Movie::new(&set);
        assert_eq!(
            m.load("0", "proj", v),
            Err(MovieError::BadFirstFrame)
        );
    }

    #[test]
    fn load_bumps_seqno_and_resets_position() {
        let set = pad_set();
        let mut m = Movie::new(&set);
        assert_eq!(m.seqno(), 0);
        m.load("15", "proj", ControllerFrameVector::new(&set)).unwrap();
        assert_eq!(m.seqno(), 1);
        assert!(m.readonly_mode());
        assert_eq!(m.current_frame(), 0);
        assert_eq!(m.lag_frames(), 0);
        assert_eq!(m.rerecord_count(), "15");
        assert_eq!(m.project_id(), "proj");
    }

    #[test]
    fn pflag_handler_suppresses_lag_counting() {
        let set = pad_set();
        let mut m = Movie::new(&set);
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        m.set_pflag_handler(Box::new(flag.clone()));

        m.next_frame(); // enter frame 1
        flag.set(true); // core reports real polling happened
        m.next_input(1, 0, 0);
        m.next_frame(); // frame 1 -> 2; pflag set, so not lag
        assert_eq!(m.lag_frames(), 0);
        assert!(!flag.get(), "pflag is consumed on frame advance");

        m.next_input(1, 0, 0);
        m.next_frame(); // pflag clear now: lag
        assert_eq!(m.lag_frames(), 1);
    }

    #[test]
    fn reset_state_keeps_data() {
        let set = pad_set();
        let mut m = Movie::new(&set);
        m.next_frame();
        m.next_input(1, 0, 0);
        m.next_frame();
        let subframes = m.data().len();
        assert!(subframes > 0);
        m.reset_state();
        assert!(m.readonly_mode());
        assert_eq!(m.current_frame(), 0);
        assert_eq!(m.data().len(), subframes);
    }
}
