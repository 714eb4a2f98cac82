use std::fmt::Write as _;

/// What a single control on a controller is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Takes a slot but carries no input.
    Null,
    /// Digital button.
    Button,
    /// Absolute axis.
    Axis,
    /// Relative axis (mouse-like).
    RelativeAxis,
    /// Throttle axis; does not pair with a partner axis.
    ThrottleAxis,
}

impl ControlKind {
    pub fn is_analog(self) -> bool {
        matches!(self, Self::Axis | Self::RelativeAxis | Self::ThrottleAxis)
    }
}

/// One button or axis on a controller.
#[derive(Debug, Clone)]
pub struct ButtonDesc {
    pub kind: ControlKind,
    /// Single-character symbol used in serialized records and HUD display.
    pub symbol: char,
    pub name: String,
    pub rmin: i16,
    pub rmax: i16,
    /// Whether the neutral position is the center of the range.
    pub centers: bool,
}

impl ButtonDesc {
    pub fn button(symbol: char, name: &str) -> Self {
        Self {
            kind: ControlKind::Button,
            symbol,
            name: name.to_string(),
            rmin: 0,
            rmax: 1,
            centers: false,
        }
    }

    pub fn axis(name: &str) -> Self {
        Self {
            kind: ControlKind::Axis,
            symbol: ' ',
            name: name.to_string(),
            rmin: -32768,
            rmax: 32767,
            centers: true,
        }
    }

    pub fn relative_axis(name: &str) -> Self {
        Self {
            kind: ControlKind::RelativeAxis,
            ..Self::axis(name)
        }
    }
}

/// Descriptor for one controller on a port.
#[derive(Debug, Clone)]
pub struct ControllerDesc {
    /// Controller class, e.g. `"gamepad"` or `"mouse"`.
    pub class: String,
    /// Concrete controller type name.
    pub kind_name: String,
    /// Controls in flat control-number order (analog axes first).
    pub buttons: Vec<ButtonDesc>,
}

impl ControllerDesc {
    pub fn new(class: &str, kind_name: &str, buttons: Vec<ButtonDesc>) -> Self {
        Self {
            class: class.to_string(),
            kind_name: kind_name.to_string(),
            buttons,
        }
    }

    /// Number of distinct analog actions (paired axes count once).
    pub fn analog_actions(&self) -> u32 {
        let mut count = 0;
        let mut i = 0;
        while i < self.buttons.len() {
            match self.buttons[i].kind {
                ControlKind::ThrottleAxis => {
                    count += 1;
                    i += 1;
                }
                k if k.is_analog() => {
                    count += 1;
                    // A same-kind neighbour forms the paired second axis.
                    if self.buttons.get(i + 1).is_some_and(|b| b.kind == k) {
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                _ => i += 1,
            }
        }
        count
    }

    /// Control numbers of the `i`th analog action: `(first, second)` where
    /// the second axis is absent for unpaired axes.
    pub fn analog_action(&self, action: u32) -> Option<(u32, Option<u32>)> {
        let mut seen = 0;
        let mut i = 0;
        while i < self.buttons.len() {
            let kind = self.buttons[i].kind;
            if !kind.is_analog() {
                i += 1;
                continue;
            }
            let pair = kind != ControlKind::ThrottleAxis
                && self.buttons.get(i + 1).is_some_and(|b| b.kind == kind);
            if seen == action {
                let second = if pair { Some((i + 1) as u32) } else { None };
                return Some((i as u32, second));
            }
            seen += 1;
            i += if pair { 2 } else { 1 };
        }
        None
    }
}

/// Capability set of a port type: byte-packed storage layout plus the text
/// serialization of one subrecord.
///
/// Implementations are shared as `Arc<dyn PortType>`; two ports are the same
/// type exactly when the `Arc`s point at the same object.
pub trait PortType: Send + Sync {
    /// Internal name of the port type.
    fn name(&self) -> &str;
    /// Human-readable name.
    fn human_name(&self) -> &str;
    /// Bytes one subrecord of this port occupies.
    fn storage_size(&self) -> usize;
    /// Controllers attached to this port.
    fn controllers(&self) -> &[ControllerDesc];
    /// Is this type legal for the given non-first port slot?
    fn legal(&self, port: u32) -> bool;
    /// Write one control into the packed subrecord. Buttons store
    /// zero/nonzero only.
    fn write(&self, buffer: &mut [u8], controller: u32, control: u32, value: i16);
    /// Read one control from the packed subrecord. Buttons return 0 or 1.
    fn read(&self, buffer: &[u8], controller: u32, control: u32) -> i16;
    /// Append the text form of the subrecord, including the leading `|`
    /// separators this port owns.
    fn serialize(&self, buffer: &[u8], out: &mut String);
    /// Parse the text form into the packed subrecord, returning the number
    /// of text bytes consumed. `None` means this is a blank port with no
    /// storage: the caller must not advance past the field separator.
    ///
    /// Parsing stops at `|`, CR, LF or NUL in the final field; that byte is
    /// not consumed.
    fn deserialize(&self, buffer: &mut [u8], text: &[u8]) -> Option<usize>;
    /// Short printable form of one controller's subrecord for the HUD.
    fn display(&self, buffer: &[u8], controller: u32) -> String;
    /// Number of used control indices on the given controller.
    fn used_indices(&self, controller: u32) -> u32 {
        self.controllers()
            .get(controller as usize)
            .map_or(0, |c| c.buttons.len() as u32)
    }
    /// Is the given controller present on this port?
    fn is_present(&self, controller: u32) -> bool {
        (controller as usize) < self.controllers().len()
    }
}

#[inline]
fn at(text: &[u8], idx: usize) -> u8 {
    text.get(idx).copied().unwrap_or(0)
}

#[inline]
pub(crate) fn is_terminator(b: u8) -> bool {
    matches!(b, b'|' | b'\r' | b'\n' | 0)
}

/// Read one button field. Any of `.`, space, tab or a field terminator means
/// released; anything else means pressed. Advances past the consumed byte.
pub fn read_button_value(text: &[u8], idx: &mut usize) -> bool {
    let ch = at(text, *idx);
    if !is_terminator(ch) {
        *idx += 1;
    }
    !is_terminator(ch) && ch != b'.' && ch != b' ' && ch != b'\t'
}

/// Read one axis field: optional blanks, optional sign, decimal digits.
/// The result is truncated to 16 bits.
pub fn read_axis_value(text: &[u8], idx: &mut usize) -> i16 {
    while !is_terminator(at(text, *idx)) {
        let ch = at(text, *idx);
        if ch != b' ' && ch != b'\t' {
            break;
        }
        *idx += 1;
    }
    let ch = at(text, *idx);
    if is_terminator(ch) {
        return 0;
    }
    let negative = ch == b'-';
    if ch == b'-' || ch == b'+' {
        *idx += 1;
    }
    let mut value: i32 = 0;
    loop {
        let ch = at(text, *idx);
        if is_terminator(ch) || !ch.is_ascii_digit() {
            break;
        }
        value = value.wrapping_mul(10).wrapping_add((ch - b'0') as i32);
        *idx += 1;
    }
    if negative {
        value = value.wrapping_neg();
    }
    value as i16
}

/// Skip to the end of the current field, optionally consuming the `|`.
pub(crate) fn skip_rest_of_field(text: &[u8], idx: &mut usize, include_pipe: bool) {
    while !is_terminator(at(text, *idx)) {
        *idx += 1;
    }
    if include_pipe && at(text, *idx) == b'|' {
        *idx += 1;
    }
}

/// Standard packed port: per controller, `buttons` digital bits packed
/// LSB-first at the front of the record, followed by one big-endian `i16`
/// per analog axis.
pub struct GenericPort {
    name: String,
    hname: String,
    controllers: Vec<ControllerDesc>,
    controller_count: u32,
    axes: u32,
    buttons: u32,
    storage: usize,
    legal_for: Vec<u32>,
    symbols: Vec<char>,
}

impl GenericPort {
    /// Build a port with `controller_count` identical controllers described
    /// by `desc`. Analog controls must precede buttons in `desc`.
    pub fn new(
        name: &str,
        hname: &str,
        controller_count: u32,
        desc: ControllerDesc,
        legal_for: &[u32],
    ) -> Self {
        let axes = desc.buttons.iter().filter(|b| b.kind.is_analog()).count() as u32;
        let buttons = desc
            .buttons
            .iter()
            .filter(|b| b.kind == ControlKind::Button)
            .count() as u32;
        debug_assert!(
            desc.buttons
                .iter()
                .position(|b| b.kind == ControlKind::Button)
                .is_none_or(|first| desc.buttons[first..]
                    .iter()
                    .all(|b| !b.kind.is_analog())),
            "analog controls must precede buttons"
        );
        let symbols = desc
            .buttons
            .iter()
            .filter(|b| b.kind == ControlKind::Button)
            .map(|b| b.symbol)
            .collect();
        let storage = 2 * controller_count as usize * axes as usize
            + (controller_count as usize * buttons as usize).div_ceil(8);
        Self {
            name: name.to_string(),
            hname: hname.to_string(),
            controllers: vec![desc; controller_count as usize],
            controller_count,
            axes,
            buttons,
            storage,
            legal_for: legal_for.to_vec(),
            symbols,
        }
    }

    #[inline]
    fn button_offset(&self) -> usize {
        (self.controller_count as usize * self.buttons as usize).div_ceil(8)
    }

    #[inline]
    fn axis_pos(&self, controller: u32, control: u32) -> usize {
        self.button_offset() + 2 * (controller as usize * self.axes as usize + control as usize)
    }
}

impl PortType for GenericPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn human_name(&self) -> &str {
        &self.hname
    }

    fn storage_size(&self) -> usize {
        self.storage
    }

    fn controllers(&self) -> &[ControllerDesc] {
        &self.controllers
    }

    fn legal(&self, port: u32) -> bool {
        self.legal_for.contains(&port)
    }

    fn write(&self, buffer: &mut [u8], controller: u32, control: u32, value: i16) {
        if controller >= self.controller_count {
            return;
        }
        if control < self.axes {
            let pos = self.axis_pos(controller, control);
            buffer[pos] = (value as u16 >> 8) as u8;
            buffer[pos + 1] = value as u8;
        } else if control < self.axes + self.buttons {
            let bit =
                controller as usize * self.buttons as usize + (control - self.axes) as usize;
            if value != 0 {
                buffer[bit / 8] |= 1 << (bit % 8);
            } else {
                buffer[bit / 8] &= !(1 << (bit % 8));
            }
        }
    }

    fn read(&self, buffer: &[u8], controller: u32, control: u32) -> i16 {
        if controller >= self.controller_count {
            return 0;
        }
        if control < self.axes {
            let pos = self.axis_pos(controller, control);
            (((buffer[pos] as u16) << 8) | buffer[pos + 1] as u16) as i16
        } else if control < self.axes + self.buttons {
            let bit =
                controller as usize * self.buttons as usize + (control - self.axes) as usize;
            ((buffer[bit / 8] >> (bit % 8)) & 1) as i16
        } else {
            0
        }
    }

    fn serialize(&self, buffer: &[u8], out: &mut String) {
        for j in 0..self.controller_count {
            out.push('|');
            for i in 0..self.buttons {
                let bit = j as usize * self.buttons as usize + i as usize;
                if buffer[bit / 8] & (1 << (bit % 8)) != 0 {
                    out.push(self.symbols[i as usize]);
                } else {
                    out.push('.');
                }
            }
            for i in 0..self.axes {
                let pos = self.axis_pos(j, i);
                let v = (((buffer[pos] as u16) << 8) | buffer[pos + 1] as u16) as i16;
                let _ = write!(out, " {v}");
            }
        }
    }

    fn deserialize(&self, buffer: &mut [u8], text: &[u8]) -> Option<usize> {
        if self.controller_count == 0 {
            return None;
        }
        buffer[..self.storage].fill(0);
        let mut ptr = 0;
        for j in 0..self.controller_count {
            for i in 0..self.buttons {
                let bit = j as usize * self.buttons as usize + i as usize;
                if read_button_value(text, &mut ptr) {
                    buffer[bit / 8] |= 1 << (bit % 8);
                }
            }
            for i in 0..self.axes {
                let v = read_axis_value(text, &mut ptr);
                let pos = self.axis_pos(j, i);
                buffer[pos] = (v as u16 >> 8) as u8;
                buffer[pos + 1] = v as u8;
            }
            skip_rest_of_field(text, &mut ptr, j + 1 < self.controller_count);
        }
        Some(ptr)
    }

    fn display(&self, buffer: &[u8], controller: u32) -> String {
        if controller >= self.controller_count {
            return String::new();
        }
        let mut out = String::new();
        for i in 0..self.axes {
            let pos = self.axis_pos(controller, i);
            let v = (((buffer[pos] as u16) << 8) | buffer[pos + 1] as u16) as i16;
            let _ = write!(out, "{v} ");
        }
        for i in 0..self.buttons {
            let bit = controller as usize * self.buttons as usize + i as usize;
            if buffer[bit / 8] & (1 << (bit % 8)) != 0 {
                out.push(self.symbols[i as usize]);
            } else {
                out.push('-');
            }
        }
        out
    }
}

/// The system pseudo-port occupying byte 0 of every record. Its single
/// framesync button is bit 0 of byte 0, which doubles as the subframe sync
/// flag. Serializes as a bare `F`/`.` without a leading `|`.
pub struct SystemPort {
    controllers: Vec<ControllerDesc>,
}

impl SystemPort {
    pub fn new() -> Self {
        Self {
            controllers: vec![ControllerDesc::new(
                "(system)",
                "system",
                vec![ButtonDesc::button('F', "framesync")],
            )],
        }
    }
}

impl Default for SystemPort {
    fn default() -> Self {
        Self::new()
    }
}

impl PortType for SystemPort {
    fn name(&self) -> &str {
        "system"
    }

    fn human_name(&self) -> &str {
        "system"
    }

    fn storage_size(&self) -> usize {
        1
    }

    fn controllers(&self) -> &[ControllerDesc] {
        &self.controllers
    }

    fn legal(&self, _port: u32) -> bool {
        // Only ever valid as port 0, which is exempt from the legality check.
        false
    }

    fn write(&self, buffer: &mut [u8], controller: u32, control: u32, value: i16) {
        if controller == 0 && control == 0 {
            if value != 0 {
                buffer[0] |= 1;
            } else {
                buffer[0] &= !1;
            }
        }
    }

    fn read(&self, buffer: &[u8], controller: u32, control: u32) -> i16 {
        if controller == 0 && control == 0 {
            (buffer[0] & 1) as i16
        } else {
            0
        }
    }

    fn serialize(&self, buffer: &[u8], out: &mut String) {
        out.push(if buffer[0] & 1 != 0 { 'F' } else { '.' });
    }

    fn deserialize(&self, buffer: &mut [u8], text: &[u8]) -> Option<usize> {
        buffer[0] = 0;
        let mut ptr = 0;
        if read_button_value(text, &mut ptr) {
            buffer[0] |= 1;
        }
        skip_rest_of_field(text, &mut ptr, false);
        Some(ptr)
    }

    fn display(&self, buffer: &[u8], controller: u32) -> String {
        if controller != 0 {
            return String::new();
        }
        if buffer[0] & 1 != 0 { "F".into() } else { "-".into() }
    }
}
