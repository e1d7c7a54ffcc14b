// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Read-only walker for the flattened Apple Device Tree.
//!
//! The boot stage hands the hypervisor the ADT exactly as firmware produced
//! it: a recursive blob of nodes, each a header followed by its properties
//! and then its children. Properties carry a fixed 32-byte NUL-padded name,
//! a little-endian size and a 4-byte-aligned value. Every node names itself
//! through its `name` property.

use core::str;
use zerocopy::{FromBytes, Immutable, KnownLayout, little_endian::U32};

const PROPERTY_NAME_LEN: usize = 32;
const VALUE_ALIGN: usize = 4;

/// Cell counts fall back to two (64-bit addresses) when a bus node does not
/// spell them out, which matches every Apple SoC this hypervisor targets.
const DEFAULT_CELLS: usize = 2;

#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct NodeHeader {
    property_count: U32,
    child_count: U32,
}

#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct PropertyHeader {
    name: [u8; PROPERTY_NAME_LEN],
    size: U32,
}

impl PropertyHeader {
    /// Bit 31 of the size field flags a placeholder the firmware fills in.
    const SIZE_MASK: u32 = 0x7fff_ffff;

    fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(PROPERTY_NAME_LEN);
        str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn value_size(&self) -> usize {
        (self.size.get() & Self::SIZE_MASK) as usize
    }
}

/// A parsed handle on a complete device tree blob.
#[derive(Clone, Copy)]
pub struct Adt<'a> {
    data: &'a [u8],
}

impl<'a> Adt<'a> {
    /// Wraps a device tree blob, checking that the root node parses.
    pub fn new(data: &'a [u8]) -> Option<Self> {
        let adt = Self { data };
        // A malformed blob is rejected up front so that later walks can't
        // run off the end.
        skip_node(data, 0)?;
        Some(adt)
    }

    /// Returns the root node.
    pub fn root(&self) -> Node<'a> {
        Node {
            data: self.data,
            offset: 0,
        }
    }

    /// Looks up a node by an absolute path such as `/arm-io/pmgr`.
    pub fn node_by_path(&self, path: &str) -> Option<Node<'a>> {
        let mut node = self.root();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            node = node.child(component)?;
        }
        Some(node)
    }

    /// Returns the MMIO base address of the device at `path`, translating the
    /// node's first `reg` entry through the `ranges` of every bus on the way
    /// up to the root.
    pub fn device_base(&self, path: &str) -> Option<u64> {
        let mut chain: arrayvec::ArrayVec<Node<'a>, 8> = arrayvec::ArrayVec::new();
        let mut node = self.root();
        chain.push(node);
        for component in path.split('/').filter(|c| !c.is_empty()) {
            node = node.child(component)?;
            chain.push(node);
        }

        let device = chain.pop()?;
        let parent = *chain.last()?;
        let address_cells = parent.cell_count("#address-cells");
        let reg = device.property("reg")?;
        let mut address = read_cells(reg, address_cells)?;

        // Walk buses towards the root, mapping the address into each parent
        // address space in turn.
        while chain.len() >= 2 {
            let bus = chain.pop()?;
            let bus_parent = *chain.last()?;
            address = translate(
                address,
                bus,
                bus.cell_count("#address-cells"),
                bus_parent.cell_count("#address-cells"),
                bus.cell_count("#size-cells"),
            )?;
        }
        Some(address)
    }
}

/// Maps `address` from the child address space of `bus` into its parent's,
/// using the bus's `ranges` property. A missing or empty `ranges` is treated
/// as an identity mapping.
fn translate(
    address: u64,
    bus: Node,
    child_cells: usize,
    parent_cells: usize,
    size_cells: usize,
) -> Option<u64> {
    let Some(mut ranges) = bus.property("ranges") else {
        return Some(address);
    };
    if ranges.is_empty() {
        return Some(address);
    }

    let entry_size = (child_cells + parent_cells + size_cells) * 4;
    while ranges.len() >= entry_size {
        let child_base = read_cells(ranges, child_cells)?;
        let parent_base = read_cells(&ranges[child_cells * 4..], parent_cells)?;
        let size = read_cells(&ranges[(child_cells + parent_cells) * 4..], size_cells)?;
        if address >= child_base && address - child_base < size {
            return Some(parent_base + (address - child_base));
        }
        ranges = &ranges[entry_size..];
    }
    None
}

fn read_cells(bytes: &[u8], cells: usize) -> Option<u64> {
    match cells {
        1 => Some(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?).into()),
        2 => Some(u64::from_le_bytes(bytes.get(..8)?.try_into().ok()?)),
        _ => None,
    }
}

fn align_up(value: usize) -> usize {
    (value + VALUE_ALIGN - 1) & !(VALUE_ALIGN - 1)
}

/// Returns the offset one past the node starting at `offset`, or `None` if
/// the blob is truncated.
fn skip_node(data: &[u8], offset: usize) -> Option<usize> {
    let (header, _) = NodeHeader::read_from_prefix(data.get(offset..)?).ok()?;
    let mut cursor = offset + size_of::<NodeHeader>();
    for _ in 0..header.property_count.get() {
        cursor = skip_property(data, cursor)?;
    }
    for _ in 0..header.child_count.get() {
        cursor = skip_node(data, cursor)?;
    }
    Some(cursor)
}

fn skip_property(data: &[u8], offset: usize) -> Option<usize> {
    let (header, _) = PropertyHeader::read_from_prefix(data.get(offset..)?).ok()?;
    let end = offset + size_of::<PropertyHeader>() + align_up(header.value_size());
    (end <= data.len()).then_some(end)
}

/// One node of the device tree.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Node<'a> {
    fn header(&self) -> NodeHeader {
        // The offset was produced by a successful walk, so the read succeeds.
        NodeHeader::read_from_prefix(&self.data[self.offset..])
            .unwrap()
            .0
    }

    /// The node's name, from its `name` property.
    pub fn name(&self) -> &'a str {
        self.property("name")
            .and_then(|value| {
                let len = value.iter().position(|&b| b == 0).unwrap_or(value.len());
                str::from_utf8(&value[..len]).ok()
            })
            .unwrap_or("")
    }

    /// Returns the raw value of the named property.
    pub fn property(&self, name: &str) -> Option<&'a [u8]> {
        let header = self.header();
        let mut cursor = self.offset + size_of::<NodeHeader>();
        for _ in 0..header.property_count.get() {
            let (property, _) = PropertyHeader::read_from_prefix(self.data.get(cursor..)?).ok()?;
            let value_start = cursor + size_of::<PropertyHeader>();
            let value = self.data.get(value_start..value_start + property.value_size())?;
            if property.name() == name {
                return Some(value);
            }
            cursor = value_start + align_up(property.value_size());
        }
        None
    }

    /// Returns the named property as a little-endian u32.
    pub fn property_u32(&self, name: &str) -> Option<u32> {
        Some(u32::from_le_bytes(
            self.property(name)?.get(..4)?.try_into().ok()?,
        ))
    }

    /// Returns the named property as a little-endian u64.
    pub fn property_u64(&self, name: &str) -> Option<u64> {
        Some(u64::from_le_bytes(
            self.property(name)?.get(..8)?.try_into().ok()?,
        ))
    }

    fn cell_count(&self, name: &str) -> usize {
        self.property_u32(name)
            .map_or(DEFAULT_CELLS, |cells| cells as usize)
    }

    /// Iterates over the node's direct children.
    pub fn children(&self) -> Children<'a> {
        let header = self.header();
        let mut cursor = self.offset + size_of::<NodeHeader>();
        for _ in 0..header.property_count.get() {
            // The constructor validated the whole blob.
            cursor = skip_property(self.data, cursor).unwrap();
        }
        Children {
            data: self.data,
            offset: cursor,
            remaining: header.child_count.get(),
        }
    }

    /// Finds the direct child with the given name.
    pub fn child(&self, name: &str) -> Option<Node<'a>> {
        self.children().find(|child| child.name() == name)
    }
}

/// Iterator over the children of a node.
pub struct Children<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for Children<'a> {
    type Item = Node<'a>;

    fn next(&mut self) -> Option<Node<'a>> {
        if self.remaining == 0 {
            return None;
        }
        let node = Node {
            data: self.data,
            offset: self.offset,
        };
        self.offset = skip_node(self.data, self.offset)?;
        self.remaining -= 1;
        Some(node)
    }
}

#[cfg(test)]
pub mod test_blob {
    //! Builder for synthetic device tree blobs used across the unit tests.

    pub fn property(name: &str, value: &[u8]) -> Vec<u8> {
        assert!(name.len() < 32);
        let mut bytes = Vec::new();
        let mut name_field = [0u8; 32];
        name_field[..name.len()].copy_from_slice(name.as_bytes());
        bytes.extend_from_slice(&name_field);
        bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
        bytes.extend_from_slice(value);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
    }

    pub fn node(name: &str, mut properties: Vec<Vec<u8>>, children: &[Vec<u8>]) -> Vec<u8> {
        properties.insert(0, property("name", name.as_bytes()));
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(properties.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(children.len() as u32).to_le_bytes());
        for prop in properties {
            bytes.extend_from_slice(&prop);
        }
        for child in children {
            bytes.extend_from_slice(child);
        }
        bytes
    }
}
