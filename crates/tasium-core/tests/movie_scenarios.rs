//! End-to-end recording/replay scenarios against the movie state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tasium_core::controller::{
    ButtonDesc, ControllerDesc, ControllerFrameVector, GenericPort, PortIndexMap, PortType,
    PortTypeSet, SystemPort,
};
use tasium_core::error::MovieError;
use tasium_core::movie::{Movie, PollFlag};

/// Stand-in for the emulator core's "input was latched" flag.
struct CoreFlag(AtomicBool);

impl CoreFlag {
    fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self, value: bool) {
        self.0.store(value, Ordering::Relaxed)
    }
}

/// Local wrapper so `PollFlag` (defined in `tasium_core`) can be implemented
/// for a shared handle without violating the orphan rule on `Arc<CoreFlag>`.
struct SharedFlag(Arc<CoreFlag>);

impl PollFlag for SharedFlag {
    fn get(&self) -> bool {
        self.0.get()
    }

    fn set(&self, value: bool) {
        self.0.set(value)
    }
}

const BUTTONS: &str = "ABsSudlr";

fn pad_set() -> PortTypeSet {
    let desc = ControllerDesc::new(
        "gamepad",
        "gamepad",
        BUTTONS.chars().map(|c| ButtonDesc::button(c, "btn")).collect(),
    );
    let types: Vec<Arc<dyn PortType>> = vec![
        Arc::new(SystemPort::new()),
        Arc::new(GenericPort::new("gamepad", "Gamepad", 1, desc, &[0])),
    ];
    PortTypeSet::make(types.clone(), PortIndexMap::linear(&types)).expect("valid port set")
}

/// Run one emulated frame in which the core polls every button once.
fn emulate_frame_polling_all(movie: &mut Movie) -> Vec<i16> {
    movie.next_frame();
    (0..BUTTONS.len() as u32)
        .map(|b| movie.next_input(1, 0, b))
        .collect()
}

fn press(movie: &mut Movie, set: &PortTypeSet, buttons: &[u32]) {
    let mut controls = tasium_core::controller::ControllerFrame::blank(set);
    for &b in buttons {
        controls.set_axis3(1, 0, b, 1);
    }
    movie.set_controls(controls);
}

#[test]
fn record_to_replay_round_trip() {
    let set = pad_set();
    let mut movie = Movie::new(&set);
    movie.set_readonly_mode(false);

    // Frame 1 presses A, frame 2 presses A+Start, frame 3 presses nothing.
    press(&mut movie, &set, &[0]);
    emulate_frame_polling_all(&mut movie);
    press(&mut movie, &set, &[0, 3]);
    emulate_frame_polling_all(&mut movie);
    press(&mut movie, &set, &[]);
    emulate_frame_polling_all(&mut movie);

    assert_eq!(movie.data().count_frames(), 3);
    assert_eq!(movie.data().len(), 3);
    let lines: Vec<String> = (0..3).map(|i| movie.data().frame(i).serialize()).collect();
    assert_eq!(lines, ["F|A.......", "F|A..S....", "F|........"]);

    // Replay the recording and observe identical inputs.
    let recorded = movie.data().clone();
    let mut replay = Movie::new(&set);
    replay.load("1", "proj", recorded).expect("loadable movie");
    let f1 = emulate_frame_polling_all(&mut replay);
    let f2 = emulate_frame_polling_all(&mut replay);
    let f3 = emulate_frame_polling_all(&mut replay);
    assert_eq!(f1, [1, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(f2, [1, 0, 0, 1, 0, 0, 0, 0]);
    assert_eq!(f3, [0; 8]);
    // Reads past the end return neutral.
    let f4 = emulate_frame_polling_all(&mut replay);
    assert_eq!(f4, [0; 8]);
}

#[test]
fn lag_frame_appends_dummy_record() {
    let set = pad_set();
    let mut movie = Movie::new(&set);
    movie.set_readonly_mode(false);
    let flag = Arc::new(CoreFlag(AtomicBool::new(false)));
    movie.set_pflag_handler(Box::new(SharedFlag(flag.clone())));

    // Frame 1 polls every control; the core latches input.
    press(&mut movie, &set, &[0]);
    emulate_frame_polling_all(&mut movie);
    flag.set(true);
    // Frame 2: the emulator polls nothing and never latches.
    movie.next_frame();
    // Frame 3 polls again.
    emulate_frame_polling_all(&mut movie);
    flag.set(true);
    movie.next_frame();

    assert_eq!(movie.lag_frames(), 1);
    assert_eq!(movie.data().count_frames(), 3);
    assert_eq!(movie.data().len(), 3);
}

#[test]
fn multiple_polls_create_subframes() {
    let set = pad_set();
    let mut movie = Movie::new(&set);
    movie.set_readonly_mode(false);

    press(&mut movie, &set, &[0]);
    movie.next_frame();
    // Poll button A three times in one frame; the value is stable, so no
    // extra subframes appear.
    assert_eq!(movie.next_input(1, 0, 0), 1);
    assert_eq!(movie.next_input(1, 0, 0), 1);
    assert_eq!(movie.next_input(1, 0, 0), 1);
    assert_eq!(movie.data().len(), 1);

    // Releasing A before a fourth poll forces new subframes up to the
    // polled position.
    press(&mut movie, &set, &[]);
    assert_eq!(movie.next_input(1, 0, 0), 0);
    assert_eq!(movie.data().len(), 4);
    assert_eq!(movie.data().subframe_count(0), 4);
    assert!(movie.data().frame(0).sync());
    assert!(!movie.data().frame(1).sync());
    assert_eq!(movie.data().frame(2).axis3(1, 0, 0), 1);
    assert_eq!(movie.data().frame(3).axis3(1, 0, 0), 0);

    // An unpolled control written mid-frame propagates over the whole
    // frame instead of adding subframes.
    press(&mut movie, &set, &[1]);
    assert_eq!(movie.next_input(1, 0, 1), 1);
    assert_eq!(movie.data().len(), 4);
    for i in 0..4 {
        assert_eq!(movie.data().frame(i).axis3(1, 0, 1), 1);
    }
}

#[test]
fn replay_consumes_subframes_per_poll() {
    let set = pad_set();
    let mut source = ControllerFrameVector::new(&set);
    // One frame of three subframes with button B = 0, 1, 0.
    for (i, b) in [0i16, 1, 0].iter().enumerate() {
        let mut f = source.blank_frame(i == 0);
        f.set_axis3(1, 0, 1, *b);
        source.append(&f).expect("matching types");
    }

    let mut movie = Movie::new(&set);
    movie.load("0", "proj", source).expect("loadable movie");
    movie.next_frame();
    assert_eq!(movie.next_input(1, 0, 1), 0);
    assert_eq!(movie.next_input(1, 0, 1), 1);
    assert_eq!(movie.next_input(1, 0, 1), 0);
    // Further polls pin at the last subframe.
    assert_eq!(movie.next_input(1, 0, 1), 0);
    // An unpolled control reads the first subframe.
    assert_eq!(movie.next_input(1, 0, 0), 0);
}

#[test]
fn readonly_to_readwrite_truncates_and_propagates() {
    let set = pad_set();
    let mut source = ControllerFrameVector::new(&set);
    // Frame 1: subframes with button B = 1, 0, 1, 1 and Up set only on
    // subframe 1; frame 2: one blank.
    for (i, b) in [1i16, 0, 1, 1].iter().enumerate() {
        let mut f = source.blank_frame(i == 0);
        f.set_axis3(1, 0, 1, *b);
        if i == 1 {
            f.set_axis3(1, 0, 4, 1);
        }
        source.append(&f).expect("matching types");
    }
    let tail = source.blank_frame(true);
    source.append(&tail).expect("matching types");

    let mut movie = Movie::new(&set);
    movie.load("0", "proj", source).expect("loadable movie");
    movie.next_frame();
    // Poll B twice (reads subframes 0 and 1), A once. Up is never polled.
    movie.next_input(1, 0, 1);
    movie.next_input(1, 0, 1);
    movie.next_input(1, 0, 0);

    movie.set_readonly_mode(false);

    // Truncated to max_polls() = 2 subframes of frame 1; frame 2 is gone.
    assert_eq!(movie.data().len(), 2);
    // Recorded B pattern survives up to the read point.
    assert_eq!(movie.data().frame(0).axis3(1, 0, 1), 1);
    assert_eq!(movie.data().frame(1).axis3(1, 0, 1), 0);
    // Unpolled Up is sticky from its first subframe: the stray press on
    // subframe 1 is overwritten.
    assert_eq!(movie.data().frame(1).axis3(1, 0, 4), 0);
    // Sticky propagation invariant over the whole remaining frame.
    for index in 1..set.indices() {
        let p = movie.pollcounters().get_polls(index).max(1) as usize;
        if p >= movie.data().len() {
            continue;
        }
        let sticky = movie.data().frame(p - 1).axis2(index);
        for j in p..movie.data().len() {
            assert_eq!(movie.data().frame(j).axis2(index), sticky, "index {index}");
        }
    }
}

#[test]
fn savestate_roundtrip_replays_identically() {
    let set = pad_set();
    let mut movie = Movie::new(&set);
    movie.set_readonly_mode(false);
    movie.set_project_id("proj");

    press(&mut movie, &set, &[0]);
    emulate_frame_polling_all(&mut movie);
    press(&mut movie, &set, &[4]);
    emulate_frame_polling_all(&mut movie);

    let state = movie.save_state();
    assert_eq!(state.current_frame, 2);

    press(&mut movie, &set, &[7]);
    emulate_frame_polling_all(&mut movie);
    let final_inputs = emulate_frame_polling_all(&mut movie);

    // Restore and re-run the tail in read-only mode.
    let old = movie.data().clone();
    movie
        .restore_state(
            state.current_frame,
            state.lag_frames,
            &state.pollcounters,
            true,
            Some((&old, "proj")),
        )
        .expect("state restores");
    assert_eq!(movie.current_frame(), 2);
    let f3 = emulate_frame_polling_all(&mut movie);
    assert_eq!(f3, [0, 0, 0, 0, 0, 0, 0, 1]);
    let f4 = emulate_frame_polling_all(&mut movie);
    assert_eq!(f4, final_inputs);
}

#[test]
fn restore_state_rejects_wrong_movie() {
    let set = pad_set();
    let mut movie = Movie::new(&set);
    movie.set_readonly_mode(false);
    movie.set_project_id("proj");
    press(&mut movie, &set, &[0]);
    emulate_frame_polling_all(&mut movie);
    let state = movie.save_state();

    // Counter count mismatch.
    assert!(matches!(
        movie.restore_state(1, 0, &state.pollcounters[1..], true, None),
        Err(MovieError::WrongCounterCount { .. })
    ));

    // Project id mismatch.
    let old = movie.data().clone();
    assert_eq!(
        movie.restore_state(1, 0, &state.pollcounters, true, Some((&old, "other"))),
        Err(MovieError::IncompatibleSave)
    );

    // Diverging input data.
    let mut forked = movie.data().clone();
    forked.frame_mut(0).set_axis3(1, 0, 5, 1);
    assert_eq!(
        movie.restore_state(1, 0, &state.pollcounters, true, Some((&forked, "proj"))),
        Err(MovieError::IncompatibleSave)
    );
}

#[test]
fn fast_save_load_hot_path() {
    let set = pad_set();
    let mut movie = Movie::new(&set);
    movie.set_readonly_mode(false);

    press(&mut movie, &set, &[2]);
    emulate_frame_polling_all(&mut movie);
    press(&mut movie, &set, &[2, 6]);
    emulate_frame_polling_all(&mut movie);
    let snapshot = movie.fast_save();

    press(&mut movie, &set, &[]);
    emulate_frame_polling_all(&mut movie);
    assert_eq!(movie.current_frame(), 3);

    movie.fast_load(&snapshot).expect("fast load");
    assert_eq!(movie.current_frame(), 2);
    // Fast load lands in read-write mode.
    assert!(!movie.readonly_mode());
    press(&mut movie, &set, &[1]);
    let inputs = emulate_frame_polling_all(&mut movie);
    assert_eq!(inputs, [0, 1, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn subframe_editor_pokes_current_frame() {
    let set = pad_set();
    let mut source = ControllerFrameVector::new(&set);
    for i in 0..2 {
        let blank = source.blank_frame(i == 0);
        source.append(&blank).expect("matching types");
    }
    let mut movie = Movie::new(&set);
    movie.load("0", "proj", source).expect("loadable movie");
    movie.next_frame();

    movie.write_subframe_at_index(0, 1, 0, 4, 1);
    assert_eq!(movie.read_subframe_at_index(0, 1, 0, 4), 1);
    // Subframe numbers beyond the frame clamp on read.
    assert_eq!(movie.read_subframe_at_index(9, 1, 0, 4), 1);

    // Poll once so the read point survives the mode switch, then confirm
    // editor writes are ignored in read-write mode.
    assert_eq!(movie.next_input(1, 0, 4), 1);
    movie.set_readonly_mode(false);
    assert_eq!(movie.data().len(), 1);
    movie.write_subframe_at_index(0, 1, 0, 5, 1);
    assert_eq!(movie.data().frame(0).axis3(1, 0, 5), 0);
}

#[test]
fn editor_extends_tail_with_blank_subframes() {
    let set = pad_set();
    let mut source = ControllerFrameVector::new(&set);
    let blank = source.blank_frame(true);
    source.append(&blank).expect("matching types");
    let mut movie = Movie::new(&set);
    movie.load("0", "proj", source).expect("loadable movie");
    movie.next_frame();

    // Writing to subframe 2 of a one-subframe final frame grows the tail.
    movie.write_subframe_at_index(2, 1, 0, 0, 1);
    assert_eq!(movie.data().len(), 3);
    assert_eq!(movie.data().subframe_count(0), 3);
    assert_eq!(movie.data().frame(2).axis3(1, 0, 0), 1);
    assert_eq!(movie.read_subframe_at_index(2, 1, 0, 0), 1);
}

#[test]
fn frame_vector_structure_invariants() {
    let set = pad_set();
    let mut movie = Movie::new(&set);
    movie.set_readonly_mode(false);

    for frame in 0..20u32 {
        press(&mut movie, &set, &[frame % 8]);
        movie.next_frame();
        for poll in 0..=(frame % 3) {
            movie.next_input(1, 0, poll);
        }
    }
    movie.next_frame();

    let data = movie.data();
    let sync_total: usize = (0..data.len())
        .filter(|&i| data.frame(i).sync())
        .map(|i| data.subframe_count(i))
        .sum();
    assert_eq!(sync_total, data.len());
    assert_eq!(
        data.count_frames(),
        (0..data.len()).filter(|&i| data.frame(i).sync()).count()
    );
}
