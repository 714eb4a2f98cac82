use super::port::skip_rest_of_field;
use super::typeset::PortTypeSet;
use super::CONTROLLER_FRAME_SIZE;
use crate::error::InputError;

/// Sync flag of a raw record: bit 0 of byte 0.
#[inline]
pub(crate) fn sync_of(data: &[u8]) -> bool {
    data[0] & 1 != 0
}

fn set_sync_of(data: &mut [u8], sync: bool) {
    if sync {
        data[0] |= 1;
    } else {
        data[0] &= !1;
    }
}

fn read_axis3(types: &PortTypeSet, data: &[u8], port: u32, controller: u32, control: u32) -> i16 {
    if port >= types.ports() {
        return 0;
    }
    let off = types.port_offset_raw(port);
    types.port_type_raw(port).read(&data[off..], controller, control)
}

fn write_axis3(
    types: &PortTypeSet,
    data: &mut [u8],
    port: u32,
    controller: u32,
    control: u32,
    value: i16,
) {
    if port >= types.ports() {
        return;
    }
    let off = types.port_offset_raw(port);
    types
        .port_type_raw(port)
        .write(&mut data[off..], controller, control, value);
}

fn read_axis2(types: &PortTypeSet, data: &[u8], index: u32) -> i16 {
    match types.index_to_triple(index) {
        Ok(t) if t.valid => read_axis3(types, data, t.port, t.controller, t.control),
        _ => 0,
    }
}

fn write_axis2(types: &PortTypeSet, data: &mut [u8], index: u32, value: i16) {
    if let Ok(t) = types.index_to_triple(index) {
        if t.valid {
            write_axis3(types, data, t.port, t.controller, t.control, value);
        }
    }
}

fn serialize_record(types: &PortTypeSet, data: &[u8]) -> String {
    let mut out = String::new();
    for port in 0..types.ports() {
        let off = types.port_offset_raw(port);
        types.port_type_raw(port).serialize(&data[off..], &mut out);
    }
    out
}

fn deserialize_record(types: &PortTypeSet, data: &mut [u8], text: &[u8]) {
    let mut offset = 0;
    for port in 0..types.ports() {
        let poff = types.port_offset_raw(port);
        let field = text.get(offset..).unwrap_or(&[]);
        let consumed = types.port_type_raw(port).deserialize(&mut data[poff..], field);
        // A blank port took no input; its (absent) field separator belongs
        // to the next port.
        if let Some(n) = consumed {
            offset += n;
            skip_rest_of_field(text, &mut offset, false);
            if text.get(offset) == Some(&b'|') {
                offset += 1;
            }
        }
    }
}

fn display_record(types: &PortTypeSet, data: &[u8], port: u32, controller: u32) -> String {
    if port >= types.ports() {
        return String::new();
    }
    let off = types.port_offset_raw(port);
    types.port_type_raw(port).display(&data[off..], controller)
}

/// One subframe of input with dedicated inline storage.
#[derive(Clone)]
pub struct ControllerFrame {
    types: PortTypeSet,
    data: [u8; CONTROLLER_FRAME_SIZE],
}

impl ControllerFrame {
    /// All-zero frame (sync clear, everything released/neutral).
    pub fn blank(types: &PortTypeSet) -> Self {
        Self {
            types: types.clone(),
            data: [0; CONTROLLER_FRAME_SIZE],
        }
    }

    pub fn port_types(&self) -> &PortTypeSet {
        &self.types
    }

    /// Record size in bytes.
    pub fn size(&self) -> usize {
        self.types.size()
    }

    /// The used portion of the record.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.types.size()]
    }

    pub fn sync(&self) -> bool {
        sync_of(&self.data)
    }

    pub fn set_sync(&mut self, sync: bool) {
        set_sync_of(&mut self.data, sync);
    }

    pub fn axis3(&self, port: u32, controller: u32, control: u32) -> i16 {
        read_axis3(&self.types, &self.data, port, controller, control)
    }

    /// Write a control; silently ignored when the port is out of range.
    pub fn set_axis3(&mut self, port: u32, controller: u32, control: u32, value: i16) {
        write_axis3(&self.types, &mut self.data, port, controller, control, value);
    }

    pub fn axis2(&self, index: u32) -> i16 {
        read_axis2(&self.types, &self.data, index)
    }

    pub fn set_axis2(&mut self, index: u32, value: i16) {
        write_axis2(&self.types, &mut self.data, index, value);
    }

    /// Text form of the whole record, ports concatenated in order.
    pub fn serialize(&self) -> String {
        serialize_record(&self.types, &self.data)
    }

    /// Parse a text record. Parsing stops at the first CR, LF or NUL.
    pub fn deserialize(&mut self, text: &str) {
        deserialize_record(&self.types, &mut self.data, text.as_bytes());
    }

    /// HUD display string for one controller.
    pub fn display(&self, port: u32, controller: u32) -> String {
        display_record(&self.types, &self.data, port, controller)
    }

    pub fn is_present(&self, port: u32, controller: u32) -> bool {
        port < self.types.ports() && self.types.port_type_raw(port).is_present(controller)
    }

    /// Dedicated copy with the sync flag forced to the given value.
    pub fn copy_with_sync(&self, sync: bool) -> Self {
        let mut c = self.clone();
        c.set_sync(sync);
        c
    }

    /// Bytewise XOR of two frames over the same port type set.
    pub fn xor(&self, other: &Self) -> Result<Self, InputError> {
        if self.types != other.types {
            return Err(InputError::TypeMismatch);
        }
        let mut out = self.clone();
        for i in 0..self.types.size() {
            out.data[i] ^= other.data[i];
        }
        Ok(out)
    }
}

impl PartialEq for ControllerFrame {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types && self.bytes() == other.bytes()
    }
}

impl Eq for ControllerFrame {}

impl std::fmt::Debug for ControllerFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ControllerFrame({:?})", self.serialize())
    }
}

/// Read-only view of a subframe stored inside a frame vector page.
#[derive(Clone, Copy)]
pub struct FrameRef<'a> {
    pub(crate) types: &'a PortTypeSet,
    pub(crate) data: &'a [u8],
}

impl<'a> FrameRef<'a> {
    pub fn sync(&self) -> bool {
        sync_of(self.data)
    }

    pub fn axis3(&self, port: u32, controller: u32, control: u32) -> i16 {
        read_axis3(self.types, self.data, port, controller, control)
    }

    pub fn axis2(&self, index: u32) -> i16 {
        read_axis2(self.types, self.data, index)
    }

    pub fn serialize(&self) -> String {
        serialize_record(self.types, self.data)
    }

    pub fn display(&self, port: u32, controller: u32) -> String {
        display_record(self.types, self.data, port, controller)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Dedicated copy with the sync flag forced to the given value.
    pub fn copy_with_sync(&self, sync: bool) -> ControllerFrame {
        let mut c = self.to_owned();
        c.set_sync(sync);
        c
    }

    pub fn to_owned(&self) -> ControllerFrame {
        let mut frame = ControllerFrame::blank(self.types);
        frame.data[..self.data.len()].copy_from_slice(self.data);
        frame
    }
}

/// Mutable view of a subframe stored inside a frame vector page.
pub struct FrameMut<'a> {
    pub(crate) types: &'a PortTypeSet,
    pub(crate) data: &'a mut [u8],
}

impl<'a> FrameMut<'a> {
    pub fn sync(&self) -> bool {
        sync_of(self.data)
    }

    pub fn set_sync(&mut self, sync: bool) {
        set_sync_of(self.data, sync);
    }

    pub fn axis3(&self, port: u32, controller: u32, control: u32) -> i16 {
        read_axis3(self.types, self.data, port, controller, control)
    }

    pub fn set_axis3(&mut self, port: u32, controller: u32, control: u32, value: i16) {
        write_axis3(self.types, self.data, port, controller, control, value);
    }

    pub fn axis2(&self, index: u32) -> i16 {
        read_axis2(self.types, self.data, index)
    }

    pub fn set_axis2(&mut self, index: u32, value: i16) {
        write_axis2(self.types, self.data, index, value);
    }

    /// Overwrite this subframe from a dedicated frame. The view never owns
    /// its storage, so the port type sets must match.
    pub fn copy_from(&mut self, frame: &ControllerFrame) -> Result<(), InputError> {
        if *self.types != *frame.port_types() {
            return Err(InputError::TypeMismatch);
        }
        self.data.copy_from_slice(frame.bytes());
        Ok(())
    }

    pub fn to_owned(&self) -> ControllerFrame {
        FrameRef {
            types: self.types,
            data: self.data,
        }
        .to_owned()
    }
}
