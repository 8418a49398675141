//! Sparse hierarchical spatial index.
//!
//! An arena-backed octree over the 256³ torus. Regions are vacuum until an
//! event excites a cell inside them; materializing a cell subdivides every
//! ancestor on the path from the root. Parents and children are arena
//! indices, so pruning a cell is an index update plus a walk back up the
//! path, merging regions that became empty.
//!
//! Cells are also reachable through a coordinate-keyed map of handles, which
//! keeps neighbour lookups O(1). Handles carry a generation so a handle to a
//! pruned cell never aliases a later allocation in the same slot.

use std::collections::HashMap;

use crate::constants::{AXIS_PERIOD, TREE_DEPTH};
use crate::coord::QuantizedCoordinate;
use crate::error::{FieldError, Result};
use crate::excitation::FieldExcitation;

/// Coordinate-keyed handle into the index arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

/// Axis-aligned cube of grid cells, in offsets from the grid minimum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub origin: [u32; 3],
    pub size: u32,
}

impl Region {
    fn root() -> Self {
        Self {
            origin: [0; 3],
            size: AXIS_PERIOD as u32,
        }
    }

    fn octant(&self, offsets: [u32; 3]) -> usize {
        let half = self.size / 2;
        let mut i = 0;
        for axis in 0..3 {
            if offsets[axis] - self.origin[axis] >= half {
                i |= 1 << axis;
            }
        }
        i
    }

    fn child(&self, octant: usize) -> Self {
        let half = self.size / 2;
        let mut origin = self.origin;
        for (axis, o) in origin.iter_mut().enumerate() {
            if octant & (1 << axis) != 0 {
                *o += half;
            }
        }
        Self { origin, size: half }
    }

    pub fn contains(&self, offsets: [u32; 3]) -> bool {
        (0..3).all(|axis| {
            offsets[axis] >= self.origin[axis] && offsets[axis] < self.origin[axis] + self.size
        })
    }
}

/// A materialized unit cell.
#[derive(Clone, Debug)]
pub struct Cell {
    coord: QuantizedCoordinate,
    excitation: FieldExcitation,
    version: u64,
    frozen: bool,
}

impl Cell {
    pub fn coord(&self) -> QuantizedCoordinate {
        self.coord
    }

    pub fn excitation(&self) -> &FieldExcitation {
        &self.excitation
    }

    /// Bumped on every excitation write. Observers compare it to detect races.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Frozen cells belong to a collapsed entity and are skipped by evolution.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

struct OctNode {
    region: Region,
    parent: Option<u32>,
    children: [Option<u32>; 8],
    cell: Option<Cell>,
}

impl OctNode {
    fn new(region: Region, parent: Option<u32>) -> Self {
        Self {
            region,
            parent,
            children: [None; 8],
            cell: None,
        }
    }

    fn is_leaf_empty(&self) -> bool {
        self.cell.is_none() && self.children.iter().all(Option::is_none)
    }
}

struct Slot {
    generation: u32,
    node: Option<OctNode>,
}

/// Outcome of a pruning pass.
#[derive(Clone, Debug, Default)]
pub struct PruneReport {
    /// Cells returned to vacuum.
    pub removed: Vec<QuantizedCoordinate>,
    /// Interior regions merged back into their parents.
    pub merged_regions: usize,
}

pub struct SpatialIndex {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: u32,
    cells: HashMap<QuantizedCoordinate, NodeHandle>,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialIndex {
    pub fn new() -> Self {
        let mut index = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: 0,
            cells: HashMap::new(),
        };
        index.root = index.alloc(OctNode::new(Region::root(), None));
        index
    }

    /// Number of materialized cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Live tree nodes, interior regions included.
    pub fn region_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn handle(&self, coord: QuantizedCoordinate) -> Option<NodeHandle> {
        self.cells.get(&coord).copied()
    }

    pub fn contains(&self, coord: QuantizedCoordinate) -> bool {
        self.cells.contains_key(&coord)
    }

    /// Create or superpose onto the cell at `coord`, subdividing ancestor
    /// regions down to unit resolution as needed.
    pub fn materialize(
        &mut self,
        coord: QuantizedCoordinate,
        delta: &FieldExcitation,
    ) -> Result<NodeHandle> {
        if !delta.is_finite() {
            return Err(FieldError::NonFinite { coord });
        }
        if let Some(handle) = self.handle(coord) {
            if let Some(cell) = self.cell_slot_mut(handle) {
                cell.excitation.absorb(delta);
                cell.version += 1;
            }
            return Ok(handle);
        }

        let offsets = coord.grid_offsets();
        let mut current = self.root;
        for _ in 0..TREE_DEPTH {
            let region = self.node(current).region;
            let octant = region.octant(offsets);
            current = match self.node(current).children[octant] {
                Some(child) => child,
                None => {
                    let child = self.alloc(OctNode::new(region.child(octant), Some(current)));
                    self.node_mut(current).children[octant] = Some(child);
                    child
                }
            };
        }

        self.node_mut(current).cell = Some(Cell {
            coord,
            excitation: delta.clone(),
            version: 1,
            frozen: false,
        });
        let handle = NodeHandle {
            index: current,
            generation: self.slots[current as usize].generation,
        };
        self.cells.insert(coord, handle);
        Ok(handle)
    }

    /// Materialize from raw grid integers, rejecting anything off the grid.
    pub fn materialize_raw(&mut self, raw: [i64; 3], delta: &FieldExcitation) -> Result<NodeHandle> {
        let coord = QuantizedCoordinate::new(raw[0], raw[1], raw[2])?;
        self.materialize(coord, delta)
    }

    /// Put a cell back exactly as persisted, version included.
    pub fn restore(
        &mut self,
        coord: QuantizedCoordinate,
        excitation: FieldExcitation,
        version: u64,
    ) -> Result<NodeHandle> {
        let handle = self.materialize(coord, &excitation)?;
        self.reset(handle, excitation, version);
        Ok(handle)
    }

    /// Overwrite a cell's excitation and version without counting a write.
    pub fn reset(&mut self, handle: NodeHandle, excitation: FieldExcitation, version: u64) -> bool {
        match self.cell_slot_mut(handle) {
            Some(cell) => {
                cell.excitation = excitation;
                cell.version = version;
                true
            }
            None => false,
        }
    }

    /// Already-materialized face neighbours of `coord` (at most six).
    /// Vacuum neighbours are omitted, never created.
    pub fn neighbors(&self, coord: QuantizedCoordinate) -> Vec<NodeHandle> {
        coord
            .face_neighbors()
            .iter()
            .filter_map(|n| self.cells.get(n).copied())
            .collect()
    }

    /// Find a cell by descending the tree rather than through the handle map.
    pub fn locate(&self, coord: QuantizedCoordinate) -> Option<NodeHandle> {
        let offsets = coord.grid_offsets();
        let mut current = self.root;
        loop {
            let node = self.node(current);
            if !node.region.contains(offsets) {
                return None;
            }
            if node.region.size == 1 {
                return node.cell.as_ref().map(|_| NodeHandle {
                    index: current,
                    generation: self.slots[current as usize].generation,
                });
            }
            current = node.children[node.region.octant(offsets)]?;
        }
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&Cell> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_ref()?.cell.as_ref()
    }

    pub fn get_at(&self, coord: QuantizedCoordinate) -> Option<&Cell> {
        self.get(self.handle(coord)?)
    }

    /// Node-scoped write access. Every call counts as an excitation write and
    /// bumps the cell's version.
    pub fn write(&mut self, handle: NodeHandle) -> Option<&mut FieldExcitation> {
        let cell = self.cell_slot_mut(handle)?;
        cell.version += 1;
        Some(&mut cell.excitation)
    }

    pub fn set_frozen(&mut self, handle: NodeHandle, frozen: bool) -> bool {
        match self.cell_slot_mut(handle) {
            Some(cell) => {
                cell.frozen = frozen;
                true
            }
            None => false,
        }
    }

    /// All cells, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeHandle, &Cell)> + '_ {
        self.cells
            .values()
            .filter_map(move |h| self.get(*h).map(|cell| (*h, cell)))
    }

    /// Handles sorted by linear grid index, for deterministic passes.
    pub fn sorted_handles(&self) -> Vec<NodeHandle> {
        let mut coords: Vec<QuantizedCoordinate> = self.cells.keys().copied().collect();
        coords.sort_by_key(|c| c.linear_index());
        coords.into_iter().map(|c| self.cells[&c]).collect()
    }

    /// Total energy (amplitudes plus vacuum baselines) over every cell.
    pub fn total_energy(&self) -> f64 {
        self.iter().map(|(_, c)| c.excitation.energy()).sum()
    }

    pub fn prune(&mut self, threshold: f64) -> PruneReport {
        self.prune_where(threshold, |_| false)
    }

    /// Return cells whose stored energy fell below `threshold` to vacuum,
    /// except those `protect` claims. Regions left empty are merged upward.
    pub fn prune_where(
        &mut self,
        threshold: f64,
        protect: impl Fn(&Cell) -> bool,
    ) -> PruneReport {
        let doomed: Vec<QuantizedCoordinate> = self
            .iter()
            .filter(|(_, cell)| cell.excitation.stored_energy() < threshold && !protect(cell))
            .map(|(_, cell)| cell.coord)
            .collect();

        let mut report = PruneReport::default();
        for coord in doomed {
            if let Some(merged) = self.remove(coord) {
                report.merged_regions += merged;
                report.removed.push(coord);
            }
        }
        report
    }

    /// Drop the cell at `coord` and merge regions it leaves empty. Returns
    /// how many regions were merged, or `None` for a dark cell.
    pub fn remove(&mut self, coord: QuantizedCoordinate) -> Option<usize> {
        let handle = self.cells.remove(&coord)?;
        let mut merged = 0;
        let mut parent = self.node(handle.index).parent;
        let mut child = handle.index;
        self.release(child);
        while let Some(p) = parent {
            if let Some(slot) = self.node_mut(p).children.iter_mut().find(|c| **c == Some(child)) {
                *slot = None;
            }
            if p == self.root || !self.node(p).is_leaf_empty() {
                break;
            }
            child = p;
            parent = self.node(p).parent;
            self.release(p);
            merged += 1;
        }
        Some(merged)
    }

    fn alloc(&mut self, node: OctNode) -> u32 {
        match self.free.pop() {
            Some(i) => {
                self.slots[i as usize].node = Some(node);
                i
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }

    // Arena indices reachable from the tree always point at live slots.
    fn node(&self, index: u32) -> &OctNode {
        match self.slots[index as usize].node.as_ref() {
            Some(node) => node,
            None => unreachable!("dangling arena index {index}"),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut OctNode {
        match self.slots[index as usize].node.as_mut() {
            Some(node) => node,
            None => unreachable!("dangling arena index {index}"),
        }
    }

    fn cell_slot_mut(&mut self, handle: NodeHandle) -> Option<&mut Cell> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_mut()?.cell.as_mut()
    }
}
