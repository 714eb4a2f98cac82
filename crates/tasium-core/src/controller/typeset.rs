use std::sync::Arc;

use parking_lot::Mutex;

use super::{CONTROLLER_FRAME_SIZE, INVALID_INDEX, PortType};
use crate::error::InputError;

/// Mapping of one flat control index back to its `(port, controller,
/// control)` triple.
///
/// Invalid entries exist so that index assignments stay backward compatible
/// across port reconfigurations; index 0 always maps to (0, 0, 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexTriple {
    pub valid: bool,
    pub port: u32,
    pub controller: u32,
    pub control: u32,
}

impl IndexTriple {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            port: 0,
            controller: 0,
            control: 0,
        }
    }
}

/// Control index assignments for a port type sequence.
#[derive(Debug, Clone, Default)]
pub struct PortIndexMap {
    /// Flat index -> triple.
    pub indices: Vec<IndexTriple>,
    /// Logical controller id -> (port, controller).
    pub logical_map: Vec<(u32, u32)>,
    /// Legacy physical controller id -> (port, controller).
    pub pcid_map: Vec<(u32, u32)>,
}

impl PortIndexMap {
    /// The obvious dense map: every control of every controller of every
    /// port in order, with all non-system controllers as logical pads.
    pub fn linear(types: &[Arc<dyn PortType>]) -> Self {
        let mut indices = Vec::new();
        let mut logical = Vec::new();
        for (p, ptype) in types.iter().enumerate() {
            for c in 0..ptype.controllers().len() as u32 {
                for i in 0..ptype.used_indices(c) {
                    indices.push(IndexTriple {
                        valid: true,
                        port: p as u32,
                        controller: c,
                        control: i,
                    });
                }
                if p > 0 {
                    logical.push((p as u32, c));
                }
            }
        }
        Self {
            indices,
            pcid_map: logical.clone(),
            logical_map: logical,
        }
    }
}

struct SetInner {
    types: Vec<Arc<dyn PortType>>,
    offsets: Vec<usize>,
    total_size: usize,
    indices: Vec<IndexTriple>,
    logical_map: Vec<(u32, u32)>,
    pcid_map: Vec<(u32, u32)>,
    port_multiplier: usize,
    controller_multiplier: usize,
    indices_tab: Vec<u32>,
}

/// An immutable, canonicalized sequence of port types forming the packed
/// layout of one subframe record.
///
/// Sets are interned: [`PortTypeSet::make`] with an identical type sequence
/// returns the same underlying object, so equality is pointer equality.
#[derive(Clone)]
pub struct PortTypeSet {
    inner: Arc<SetInner>,
}

impl PartialEq for PortTypeSet {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for PortTypeSet {}

impl std::fmt::Debug for PortTypeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.inner.types.iter().map(|t| t.name()))
            .finish()
    }
}

static INTERNED: Mutex<Vec<(Vec<usize>, PortTypeSet)>> = Mutex::new(Vec::new());

fn identity_key(types: &[Arc<dyn PortType>]) -> Vec<usize> {
    types
        .iter()
        .map(|t| Arc::as_ptr(t) as *const () as usize)
        .collect()
}

impl PortTypeSet {
    /// Build (or look up) the set for the given type sequence and control
    /// map. Calling again with the same type sequence returns the same
    /// object regardless of the map argument.
    pub fn make(
        types: Vec<Arc<dyn PortType>>,
        control_map: PortIndexMap,
    ) -> Result<Self, InputError> {
        if types.is_empty() {
            return Err(InputError::IllegalTypes);
        }
        for (i, t) in types.iter().enumerate() {
            if i > 0 && !t.legal((i - 1) as u32) {
                return Err(InputError::IllegalTypes);
            }
        }

        let key = identity_key(&types);
        let mut interned = INTERNED.lock();
        if let Some((_, set)) = interned.iter().find(|(k, _)| *k == key) {
            return Ok(set.clone());
        }

        let mut controller_multiplier = 1usize;
        for t in &types {
            for c in 0..t.controllers().len() as u32 {
                controller_multiplier = controller_multiplier.max(t.used_indices(c) as usize);
            }
        }
        let mut port_multiplier = 1usize;
        for t in &types {
            port_multiplier = port_multiplier.max(controller_multiplier * t.controllers().len());
        }

        let mut offsets = Vec::with_capacity(types.len());
        let mut total_size = 0usize;
        for t in &types {
            offsets.push(total_size);
            total_size += t.storage_size();
        }
        if total_size == 0 || total_size > CONTROLLER_FRAME_SIZE {
            return Err(InputError::IllegalTypes);
        }

        let mut indices_tab = vec![INVALID_INDEX; port_multiplier * types.len()];
        for (j, t) in control_map.indices.iter().enumerate() {
            if !t.valid {
                continue;
            }
            let place = t.port as usize * port_multiplier
                + t.controller as usize * controller_multiplier
                + t.control as usize;
            if place < indices_tab.len() {
                indices_tab[place] = j as u32;
            }
        }

        let set = Self {
            inner: Arc::new(SetInner {
                types,
                offsets,
                total_size,
                indices: control_map.indices,
                logical_map: control_map.logical_map,
                pcid_map: control_map.pcid_map,
                port_multiplier,
                controller_multiplier,
                indices_tab,
            }),
        };
        interned.push((key, set.clone()));
        Ok(set)
    }

    /// Byte offset of the given port's subrecord.
    pub fn port_offset(&self, port: u32) -> Result<usize, InputError> {
        self.inner
            .offsets
            .get(port as usize)
            .copied()
            .ok_or(InputError::BadPortIndex {
                port,
                ports: self.ports(),
            })
    }

    /// Type of the given port.
    pub fn port_type(&self, port: u32) -> Result<&Arc<dyn PortType>, InputError> {
        self.inner
            .types
            .get(port as usize)
            .ok_or(InputError::BadPortIndex {
                port,
                ports: self.ports(),
            })
    }

    #[inline]
    pub(crate) fn port_offset_raw(&self, port: u32) -> usize {
        self.inner.offsets[port as usize]
    }

    #[inline]
    pub(crate) fn port_type_raw(&self, port: u32) -> &dyn PortType {
        &*self.inner.types[port as usize]
    }

    /// Number of ports in the set.
    pub fn ports(&self) -> u32 {
        self.inner.types.len() as u32
    }

    /// Total record size in bytes.
    pub fn size(&self) -> usize {
        self.inner.total_size
    }

    /// Total flat control index count.
    pub fn indices(&self) -> u32 {
        self.inner.indices.len() as u32
    }

    /// Triple for a flat control index. The triple may be marked invalid.
    pub fn index_to_triple(&self, index: u32) -> Result<IndexTriple, InputError> {
        self.inner
            .indices
            .get(index as usize)
            .copied()
            .ok_or(InputError::BadIndex {
                index,
                indices: self.indices(),
            })
    }

    /// Flat control index for a triple, or [`INVALID_INDEX`] if unmapped.
    pub fn triple_to_index(&self, port: u32, controller: u32, control: u32) -> u32 {
        let inner = &self.inner;
        let place = port as usize * inner.port_multiplier
            + controller as usize * inner.controller_multiplier
            + control as usize;
        let Some(&pindex) = inner.indices_tab.get(place) else {
            return INVALID_INDEX;
        };
        if pindex == INVALID_INDEX {
            return INVALID_INDEX;
        }
        let t = inner.indices[pindex as usize];
        if !t.valid || t.port != port || t.controller != controller || t.control != control {
            return INVALID_INDEX;
        }
        pindex
    }

    /// Number of logical controllers.
    pub fn number_of_controllers(&self) -> u32 {
        self.inner.logical_map.len() as u32
    }

    /// Physical `(port, controller)` pair for a logical controller id.
    pub fn lcid_to_pcid(&self, lcid: u32) -> Result<(u32, u32), InputError> {
        self.inner
            .logical_map
            .get(lcid as usize)
            .copied()
            .ok_or(InputError::BadLogicalController { lcid })
    }

    /// Number of legacy PCIDs.
    pub fn number_of_legacy_pcids(&self) -> u32 {
        self.inner.pcid_map.len() as u32
    }

    /// `(port, controller)` pair for a legacy PCID.
    pub fn legacy_pcid_to_pair(&self, pcid: u32) -> Result<(u32, u32), InputError> {
        self.inner
            .pcid_map
            .get(pcid as usize)
            .copied()
            .ok_or(InputError::BadLegacyPcid { pcid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ButtonDesc, ControllerDesc, GenericPort, SystemPort};

    fn gamepad_types() -> Vec<Arc<dyn PortType>> {
        let desc = ControllerDesc::new(
            "gamepad",
            "gamepad",
            "ABsSudlr".chars().map(|c| ButtonDesc::button(c, "btn")).collect(),
        );
        vec![
            Arc::new(SystemPort::new()),
            Arc::new(GenericPort::new("gamepad", "Gamepad", 1, desc, &[0])),
        ]
    }

    #[test]
    fn make_is_canonical() {
        let types = gamepad_types();
        let a = PortTypeSet::make(types.clone(), PortIndexMap::linear(&types)).unwrap();
        let b = PortTypeSet::make(types.clone(), PortIndexMap::linear(&types)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size(), 2);
        assert_eq!(a.indices(), 9);
        assert_eq!(a.ports(), 2);
    }

    #[test]
    fn distinct_sequences_are_distinct() {
        let types = gamepad_types();
        let a = PortTypeSet::make(types.clone(), PortIndexMap::linear(&types)).unwrap();
        let shorter = vec![types[0].clone()];
        let b = PortTypeSet::make(shorter.clone(), PortIndexMap::linear(&shorter)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn illegal_slot_is_rejected() {
        let desc = ControllerDesc::new(
            "gamepad",
            "gamepad",
            vec![ButtonDesc::button('A', "a")],
        );
        // Legal only for slot 1, placed at slot 0.
        let types: Vec<Arc<dyn PortType>> = vec![
            Arc::new(SystemPort::new()),
            Arc::new(GenericPort::new("gamepad", "Gamepad", 1, desc, &[1])),
        ];
        let map = PortIndexMap::linear(&types);
        assert_eq!(PortTypeSet::make(types, map), Err(InputError::IllegalTypes));
    }

    #[test]
    fn triple_index_roundtrip() {
        let types = gamepad_types();
        let set = PortTypeSet::make(types.clone(), PortIndexMap::linear(&types)).unwrap();
        for idx in 0..set.indices() {
            let t = set.index_to_triple(idx).unwrap();
            assert!(t.valid);
            assert_eq!(set.triple_to_index(t.port, t.controller, t.control), idx);
        }
        assert_eq!(set.triple_to_index(0, 0, 0), 0);
        assert_eq!(set.triple_to_index(5, 0, 0), INVALID_INDEX);
        assert_eq!(set.triple_to_index(1, 0, 8), INVALID_INDEX);
        assert!(set.index_to_triple(set.indices()).is_err());
    }

    #[test]
    fn logical_controller_lookup() {
        let types = gamepad_types();
        let set = PortTypeSet::make(types.clone(), PortIndexMap::linear(&types)).unwrap();
        assert_eq!(set.number_of_controllers(), 1);
        assert_eq!(set.lcid_to_pcid(0), Ok((1, 0)));
        assert_eq!(
            set.lcid_to_pcid(1),
            Err(InputError::BadLogicalController { lcid: 1 })
        );
        assert_eq!(set.legacy_pcid_to_pair(0), Ok((1, 0)));
        assert_eq!(
            set.legacy_pcid_to_pair(7),
            Err(InputError::BadLegacyPcid { pcid: 7 })
        );
    }
}
