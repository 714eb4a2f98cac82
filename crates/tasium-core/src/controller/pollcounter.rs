use super::typeset::PortTypeSet;
use super::INVALID_INDEX;
use crate::error::MovieError;

const DRDY: u32 = 0x8000_0000;
const COUNT_MASK: u32 = 0x7FFF_FFFF;

/// One 32-bit slot per flat control index: bit 31 is the data-ready flag,
/// the low 31 bits count polls within the current emulated frame. A
/// separate flag records whether the frame parameters were polled.
#[derive(Clone)]
pub struct PollcounterVector {
    types: PortTypeSet,
    ctrs: Vec<u32>,
    framepflag: bool,
}

impl PollcounterVector {
    pub fn new(types: &PortTypeSet) -> Self {
        Self {
            types: types.clone(),
            ctrs: vec![0; types.indices() as usize],
            framepflag: false,
        }
    }

    pub fn types(&self) -> &PortTypeSet {
        &self.types
    }

    /// Zero all counters and clear every DRDY bit and the framep flag.
    pub fn clear(&mut self) {
        self.ctrs.fill(0);
        self.framepflag = false;
    }

    pub fn set_all_drdy(&mut self) {
        for c in &mut self.ctrs {
            *c |= DRDY;
        }
    }

    pub fn clear_drdy(&mut self, index: u32) {
        if let Some(c) = self.ctrs.get_mut(index as usize) {
            *c &= COUNT_MASK;
        }
    }

    pub fn clear_drdy_triple(&mut self, port: u32, controller: u32, control: u32) {
        let i = self.types.triple_to_index(port, controller, control);
        if i != INVALID_INDEX {
            self.clear_drdy(i);
        }
    }

    pub fn get_drdy(&self, index: u32) -> bool {
        self.ctrs
            .get(index as usize)
            .is_some_and(|c| c & DRDY != 0)
    }

    /// Unmapped controls always report ready.
    pub fn get_drdy_triple(&self, port: u32, controller: u32, control: u32) -> bool {
        let i = self.types.triple_to_index(port, controller, control);
        if i != INVALID_INDEX { self.get_drdy(i) } else { true }
    }

    /// Has any control been polled this frame (or the frame parameters)?
    pub fn has_polled(&self) -> bool {
        self.framepflag || self.ctrs.iter().any(|c| c & COUNT_MASK != 0)
    }

    pub fn get_polls(&self, index: u32) -> u32 {
        self.ctrs.get(index as usize).map_or(0, |c| c & COUNT_MASK)
    }

    pub fn get_polls_triple(&self, port: u32, controller: u32, control: u32) -> u32 {
        let i = self.types.triple_to_index(port, controller, control);
        if i != INVALID_INDEX { self.get_polls(i) } else { 0 }
    }

    /// Increment a poll counter, returning its previous value. The count
    /// saturates below the DRDY bit instead of overflowing into it.
    pub fn increment_polls(&mut self, index: u32) -> u32 {
        let Some(c) = self.ctrs.get_mut(index as usize) else {
            return 0;
        };
        let old = *c & COUNT_MASK;
        if old < COUNT_MASK {
            *c += 1;
        }
        old
    }

    pub fn increment_polls_triple(&mut self, port: u32, controller: u32, control: u32) -> u32 {
        let i = self.types.triple_to_index(port, controller, control);
        if i != INVALID_INDEX {
            self.increment_polls(i)
        } else {
            0
        }
    }

    /// Highest poll count; the framep flag counts as one poll.
    pub fn max_polls(&self) -> u32 {
        let base = if self.framepflag { 1 } else { 0 };
        self.ctrs
            .iter()
            .map(|c| c & COUNT_MASK)
            .fold(base, u32::max)
    }

    pub fn set_framepflag(&mut self, value: bool) {
        self.framepflag = value;
    }

    pub fn get_framepflag(&self) -> bool {
        self.framepflag
    }

    /// Counters as a flat array for savestates.
    pub fn save_state(&self) -> Vec<u32> {
        self.ctrs.clone()
    }

    /// Restore counters saved by [`save_state`](Self::save_state).
    pub fn load_state(&mut self, mem: &[u32]) -> Result<(), MovieError> {
        if !self.check(mem) {
            return Err(MovieError::WrongCounterCount {
                expected: self.ctrs.len(),
                actual: mem.len(),
            });
        }
        self.ctrs.copy_from_slice(mem);
        Ok(())
    }

    /// Would [`load_state`](Self::load_state) accept this array?
    pub fn check(&self, mem: &[u32]) -> bool {
        mem.len() == self.ctrs.len()
    }
}
