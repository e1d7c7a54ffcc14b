// Copyright The m1hv Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Structures describing the power domain tree: one node per CPU, cluster and
//! system domain.
//!
//! Every mutator of shared node state ends with a clean+invalidate of the
//! lines holding the node. Cores read this bookkeeping with their data caches
//! disabled while powering down, so visibility through main memory is part of
//! each setter's contract, not left to the callers.

use super::{CPU_POWER_LEVEL, LocalState, MAX_POWER_LEVEL};
use crate::aarch64::clean_invalidate_object;
use crate::platform::{MAX_CORE_COUNT, MAX_NON_CPU_DOMAIN_COUNT};
use arm_psci::{AffinityInfo, EntryPoint};
use arrayvec::ArrayVec;
use core::{
    fmt::{self, Debug, Formatter},
    ops::Range,
    slice::{Iter, IterMut},
};
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// Represents a cluster or system power domain node.
#[derive(Debug)]
pub struct NonCpuPowerNode {
    /// Parent node index, or None for the root system node.
    parent: Option<usize>,
    /// Power level of the node: 1 for clusters, 2 for the system.
    level: usize,
    /// Coordinated local power state of the node.
    local_state: LocalState,
    /// Range of descendant CPU indices.
    cpu_range: Range<usize>,
    /// Power state most recently requested at this node's level by each
    /// descendant CPU. Stays OFF until a core affirmatively votes otherwise.
    requested_states: ArrayVec<LocalState, MAX_CORE_COUNT>,
}

impl NonCpuPowerNode {
    fn new(parent: Option<usize>, level: usize) -> Self {
        Self {
            parent,
            level,
            local_state: LocalState::Off,
            cpu_range: 0..0,
            requested_states: ArrayVec::new(),
        }
    }

    /// Assigns the next descendant CPU index. CPUs are assigned in ascending
    /// index order while the tree is built.
    fn assign_cpu(&mut self, cpu_index: usize) {
        if self.cpu_range.is_empty() {
            self.cpu_range = cpu_index..cpu_index + 1;
        } else {
            debug_assert_eq!(self.cpu_range.end, cpu_index);
            self.cpu_range.end += 1;
        }

        self.requested_states.push(LocalState::Off);
    }

    /// Stores the power state a descendant CPU requests at this level.
    pub fn set_requested_power_state(&mut self, cpu_index: usize, state: LocalState) {
        assert!(self.cpu_range.contains(&cpu_index));
        self.requested_states[cpu_index - self.cpu_range.start] = state;
        clean_invalidate_object(self);
    }

    /// Returns the power state a descendant CPU last requested at this level.
    pub fn requested_power_state(&self, cpu_index: usize) -> LocalState {
        assert!(self.cpu_range.contains(&cpu_index));
        self.requested_states[cpu_index - self.cpu_range.start]
    }

    /// Sets the node's local state to the deepest state permitted by its
    /// descendants' requests. Numerically smaller values are shallower, so
    /// the permitted state is the minimum of the requests: the node follows
    /// its shallowest child.
    pub fn set_minimal_allowed_state(&mut self) {
        self.local_state = *self.requested_states.iter().min().unwrap();
        clean_invalidate_object(self);
    }

    /// Gets the local power state of the node.
    pub fn local_state(&self) -> LocalState {
        self.local_state
    }

    /// Sets the local power state of the node.
    pub fn set_local_state(&mut self, local_state: LocalState) {
        self.local_state = local_state;
        clean_invalidate_object(self);
    }

    /// The power level this node sits at.
    pub fn level(&self) -> usize {
        self.level
    }

    /// The lowest CPU index whose ancestor path passes through this node.
    pub fn first_cpu_index(&self) -> usize {
        self.cpu_range.start
    }

    /// The count of CPUs under this node.
    pub fn num_cpu_siblings(&self) -> usize {
        self.cpu_range.len()
    }
}

/// Represents a CPU power domain node. A CPU node needs no lock of its own
/// beyond the mutex in the containing array: each is owned by the CPU it
/// describes, and only `affinity_info` is observed from other cores.
#[derive(Debug)]
pub struct CpuPowerNode {
    /// Parent cluster node index.
    parent: usize,
    /// Current affinity info of the CPU.
    affinity_info: AffinityInfo,
    /// Local power state of the CPU node.
    local_state: LocalState,
    /// Entry point of the guest on waking up.
    entry_point: Option<EntryPoint>,
    /// Deepest level affected by an in-flight power-down suspend.
    suspend_level: Option<usize>,
}

impl CpuPowerNode {
    fn new(parent: usize) -> Self {
        Self {
            parent,
            affinity_info: AffinityInfo::Off,
            local_state: LocalState::Off,
            entry_point: None,
            suspend_level: None,
        }
    }

    /// Gets the affinity info of the CPU.
    pub fn affinity_info(&self) -> AffinityInfo {
        self.affinity_info
    }

    /// Sets the affinity info of the CPU.
    pub fn set_affinity_info(&mut self, affinity_info: AffinityInfo) {
        self.affinity_info = affinity_info;
        clean_invalidate_object(self);
    }

    /// Gets the local state of the CPU.
    pub fn local_state(&self) -> LocalState {
        self.local_state
    }

    /// Sets the local state of the CPU.
    pub fn set_local_state(&mut self, local_state: LocalState) {
        self.local_state = local_state;
        clean_invalidate_object(self);
    }

    /// Stores the guest entry point for the CPU's next wake-up.
    pub fn set_entry_point(&mut self, entry_point: EntryPoint) {
        assert_eq!(self.entry_point, None);
        self.entry_point = Some(entry_point);
        clean_invalidate_object(self);
    }

    /// Gets and clears the stored entry point of the CPU.
    pub fn pop_entry_point(&mut self) -> Option<EntryPoint> {
        self.entry_point.take()
    }

    /// The deepest level the last power-down suspend targeted, if one is in
    /// flight.
    pub fn suspend_level(&self) -> Option<usize> {
        self.suspend_level
    }

    /// Records the target level of a power-down suspend.
    pub fn set_suspend_level(&mut self, level: usize) {
        self.suspend_level = Some(level);
        clean_invalidate_object(self);
    }

    /// Clears the recorded suspend level once the CPU is back up.
    pub fn clear_suspend_level(&mut self) {
        self.suspend_level = None;
        clean_invalidate_object(self);
    }
}

/// Holds the locks of a CPU's ancestor nodes. To rule out deadlock between
/// cores, ancestors are always locked from level 1 upward; dropping this
/// releases them in the exact reverse order.
#[derive(Debug)]
pub struct AncestorPowerDomains<'a> {
    list: ArrayVec<SpinMutexGuard<'a, NonCpuPowerNode>, MAX_POWER_LEVEL>,
}

impl<'a> AncestorPowerDomains<'a> {
    /// Locks the node at `index` and its ancestors up to `max_level`.
    fn new_with_max_level(
        index: usize,
        max_level: usize,
        mutexes: &'a [SpinMutex<NonCpuPowerNode>],
    ) -> Self {
        let mut list = ArrayVec::new();
        let mut parent = Some(index);
        let mut level = CPU_POWER_LEVEL + 1;

        while let Some(index) = parent {
            assert!(level <= MAX_POWER_LEVEL);
            if level > max_level {
                break;
            }

            let locked = mutexes[index].lock();
            parent = locked.parent;
            list.push(locked);
            level += 1;
        }

        Self { list }
    }

    /// Creates an immutable iterator starting from the lowest level.
    pub fn iter(&self) -> Iter<'_, SpinMutexGuard<'a, NonCpuPowerNode>> {
        self.list.iter()
    }

    /// Creates a mutable iterator starting from the lowest level.
    pub fn iter_mut(&mut self) -> IterMut<'_, SpinMutexGuard<'a, NonCpuPowerNode>> {
        self.list.iter_mut()
    }
}

impl Drop for AncestorPowerDomains<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.list.pop() {
            drop(guard);
        }
    }
}

/// Stores the CPU and non-CPU power nodes and controls access to them.
///
/// The arrays are sized for the widest supported SoC; the populated prefix is
/// determined by the topology descriptor at construction.
pub struct PowerDomainTree {
    non_cpu_power_nodes: ArrayVec<SpinMutex<NonCpuPowerNode>, MAX_NON_CPU_DOMAIN_COUNT>,
    cpu_power_nodes: ArrayVec<SpinMutex<CpuPowerNode>, MAX_CORE_COUNT>,
}

impl PowerDomainTree {
    /// Creates the power domain tree from a topology descriptor: the count of
    /// children of each node in BFS order from the root.
    pub fn new(topology: &[usize]) -> Self {
        let mut non_cpu_power_nodes: ArrayVec<
            SpinMutex<NonCpuPowerNode>,
            MAX_NON_CPU_DOMAIN_COUNT,
        > = ArrayVec::new();
        let mut node_count: usize = 1;
        let mut parent_node_index: usize = 0;
        let mut parent_node = None;

        for level in (CPU_POWER_LEVEL + 1..=MAX_POWER_LEVEL).rev() {
            let mut next_level_node_count = 0;

            for _ in 0..node_count {
                let child_count = topology[parent_node_index];

                for _ in 0..child_count {
                    non_cpu_power_nodes.push(SpinMutex::new(NonCpuPowerNode::new(
                        parent_node,
                        level,
                    )));
                }

                parent_node = Some(parent_node_index);
                next_level_node_count += child_count;
                parent_node_index += 1;
            }

            node_count = next_level_node_count;
        }

        // The last processed level's children are the CPUs; their indices
        // restart at zero in their own array.
        let mut cpu_power_nodes = ArrayVec::new();
        let mut cpu_index = 0;
        for num_children in &topology[parent_node_index..] {
            for _ in 0..*num_children {
                cpu_power_nodes.push(SpinMutex::new(CpuPowerNode::new(parent_node_index - 1)));
                Self::assign_cpu(&non_cpu_power_nodes, parent_node_index - 1, cpu_index);
                cpu_index += 1;
            }

            parent_node_index += 1;
        }

        debug_assert_eq!(parent_node_index, topology.len());

        PowerDomainTree {
            non_cpu_power_nodes,
            cpu_power_nodes,
        }
    }

    /// Records the CPU in the descendant range of every ancestor, walking the
    /// parent chain up to the root.
    fn assign_cpu(
        non_cpu_power_nodes: &[SpinMutex<NonCpuPowerNode>],
        parent_index: usize,
        cpu_index: usize,
    ) {
        let mut node = non_cpu_power_nodes[parent_index].lock();
        node.assign_cpu(cpu_index);
        if let Some(parent_index) = node.parent {
            Self::assign_cpu(non_cpu_power_nodes, parent_index, cpu_index);
        }
    }

    /// The number of CPU nodes in the tree.
    pub fn cpu_count(&self) -> usize {
        self.cpu_power_nodes.len()
    }

    /// Returns a lock-guarded CPU node by its index.
    pub fn locked_cpu_node(&self, cpu_index: usize) -> SpinMutexGuard<'_, CpuPowerNode> {
        self.cpu_power_nodes[cpu_index].lock()
    }

    /// Locks all ancestor nodes of a CPU, runs the closure and unlocks the
    /// nodes again.
    pub fn with_ancestors_locked<F, T>(&self, cpu: &mut CpuPowerNode, f: F) -> T
    where
        F: FnOnce(&mut CpuPowerNode, AncestorPowerDomains<'_>) -> T,
    {
        self.with_ancestors_locked_to_max_level(cpu, MAX_POWER_LEVEL, f)
    }

    /// Locks the ancestor nodes of a CPU up to `max_level`, runs the closure
    /// and unlocks the nodes again. All coordination goes through here, so
    /// the locks are always taken in ascending level order.
    pub fn with_ancestors_locked_to_max_level<F, T>(
        &self,
        cpu: &mut CpuPowerNode,
        max_level: usize,
        f: F,
    ) -> T
    where
        F: FnOnce(&mut CpuPowerNode, AncestorPowerDomains<'_>) -> T,
    {
        let lock_list = AncestorPowerDomains::new_with_max_level(
            cpu.parent,
            max_level,
            &self.non_cpu_power_nodes,
        );
        f(cpu, lock_list)
    }
}

impl Debug for PowerDomainTree {
    /// Outputs the tree in Graphviz DOT format.
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "digraph {{")?;
        for (index, node) in self.non_cpu_power_nodes.iter().enumerate() {
            if let Some(locked) = node.try_lock() {
                writeln!(f, "NC{index} [label=\"{locked:#?}\"]")?;
                if let Some(parent) = locked.parent {
                    writeln!(f, "NC{parent} -> NC{index}")?;
                }
            } else {
                writeln!(f, "NC{index} [label=\"NonCpuPowerNode is locked\"]")?;
            }
        }

        for (index, cpu) in self.cpu_power_nodes.iter().enumerate() {
            if let Some(locked) = cpu.try_lock() {
                writeln!(f, "C{index} [label=\"{locked:#?}\"]")?;
                writeln!(f, "NC{} -> C{}", locked.parent, index)?;
            } else {
                writeln!(f, "C{index} [label=\"CpuPowerNode is locked\"]")?;
            }
        }

        writeln!(f, "}}")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::TOPOLOGY;

    #[test]
    fn non_cpu_power_node() {
        let mut node = NonCpuPowerNode::new(Some(1), 1);
        assert_eq!(node.parent, Some(1));
        assert_eq!(node.level(), 1);
        assert_eq!(LocalState::Off, node.local_state());
        assert!(node.cpu_range.is_empty());
        assert!(node.requested_states.is_empty());

        node.assign_cpu(2);
        node.assign_cpu(3);
        assert_eq!(node.first_cpu_index(), 2);
        assert_eq!(node.num_cpu_siblings(), 2);
        assert_eq!(node.requested_power_state(2), LocalState::Off);
        assert_eq!(node.requested_power_state(3), LocalState::Off);

        node.set_requested_power_state(3, LocalState::On);
        assert_eq!(node.requested_power_state(3), LocalState::On);

        node.set_minimal_allowed_state();
        assert_eq!(LocalState::On, node.local_state());

        node.set_requested_power_state(3, LocalState::Off);
        node.set_minimal_allowed_state();
        assert_eq!(LocalState::Off, node.local_state());

        node.set_local_state(LocalState::On);
        assert_eq!(LocalState::On, node.local_state());
    }

    #[test]
    fn non_cpu_power_node_minimum_is_shallowest_request() {
        // The coordinated state of a node is the numeric minimum of its
        // children's requests, whatever the mix.
        let requests = [
            LocalState::Off,
            LocalState::IdleStandby,
            LocalState::Off,
            LocalState::IdleStandby,
        ];
        let mut node = NonCpuPowerNode::new(None, 2);
        for (cpu_index, state) in requests.iter().enumerate() {
            node.assign_cpu(cpu_index);
            node.set_requested_power_state(cpu_index, *state);
        }

        node.set_minimal_allowed_state();
        assert_eq!(node.local_state(), LocalState::IdleStandby);

        node.set_requested_power_state(2, LocalState::On);
        node.set_minimal_allowed_state();
        assert_eq!(node.local_state(), LocalState::On);
    }

    #[test]
    #[should_panic]
    fn non_cpu_power_node_invalid_cpu_request() {
        let mut node = NonCpuPowerNode::new(Some(1), 1);
        node.assign_cpu(2);
        node.assign_cpu(3);
        node.set_requested_power_state(4, LocalState::On);
    }

    #[test]
    fn cpu_power_node() {
        let mut node = CpuPowerNode::new(3);
        assert_eq!(3, node.parent);
        assert_eq!(AffinityInfo::Off, node.affinity_info());
        assert_eq!(LocalState::Off, node.local_state());
        assert_eq!(None, node.pop_entry_point());
        assert_eq!(None, node.suspend_level());

        node.set_affinity_info(AffinityInfo::On);
        assert_eq!(AffinityInfo::On, node.affinity_info());

        node.set_local_state(LocalState::On);
        assert_eq!(LocalState::On, node.local_state());

        node.set_entry_point(EntryPoint::Entry64 {
            entry_point_address: 1,
            context_id: 2,
        });
        assert_eq!(
            Some(EntryPoint::Entry64 {
                entry_point_address: 1,
                context_id: 2
            }),
            node.pop_entry_point()
        );
        assert_eq!(None, node.pop_entry_point());

        node.set_suspend_level(MAX_POWER_LEVEL);
        assert_eq!(Some(MAX_POWER_LEVEL), node.suspend_level());
        node.clear_suspend_level();
        assert_eq!(None, node.suspend_level());
    }

    #[test]
    #[should_panic]
    fn cpu_power_node_overwrite_entry() {
        let mut node = CpuPowerNode::new(3);

        node.set_entry_point(EntryPoint::Entry64 {
            entry_point_address: 1,
            context_id: 2,
        });
        node.set_entry_point(EntryPoint::Entry64 {
            entry_point_address: 1,
            context_id: 2,
        });
    }

    #[test]
    fn power_domain_tree_two_die_shape() {
        // The two-die descriptor is the single-die cluster list doubled under
        // one root.
        let tree = PowerDomainTree::new(TOPOLOGY);

        let non_cpu_parents = [None, Some(0), Some(0), Some(0), Some(0), Some(0), Some(0)];
        let non_cpu_levels = [2, 1, 1, 1, 1, 1, 1];
        let non_cpu_ranges = [0..20, 0..2, 2..6, 6..10, 10..12, 12..16, 16..20];
        let cpu_parents = [1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 5, 5, 5, 5, 6, 6, 6, 6];

        assert_eq!(non_cpu_parents.len(), tree.non_cpu_power_nodes.len());
        assert_eq!(cpu_parents.len(), tree.cpu_power_nodes.len());
        assert_eq!(tree.cpu_count(), 20);

        for (((node, parent), range), level) in tree
            .non_cpu_power_nodes
            .iter()
            .zip(non_cpu_parents)
            .zip(non_cpu_ranges)
            .zip(non_cpu_levels)
        {
            let locked = node.lock();
            assert_eq!(parent, locked.parent);
            assert_eq!(range.start, locked.first_cpu_index());
            assert_eq!(range.len(), locked.num_cpu_siblings());
            assert_eq!(level, locked.level());
        }

        for (node, parent) in tree.cpu_power_nodes.iter().zip(cpu_parents) {
            assert_eq!(parent, node.lock().parent);
        }
    }

    #[test]
    fn power_domain_tree_single_core_degenerate() {
        // One cluster with one core: every node covers exactly CPU 0 and
        // coordination is a passthrough of that CPU's requests.
        let tree = PowerDomainTree::new(&[1, 1, 1]);

        assert_eq!(tree.cpu_count(), 1);
        assert_eq!(tree.non_cpu_power_nodes.len(), 2);
        for node in &tree.non_cpu_power_nodes {
            let locked = node.lock();
            assert_eq!(locked.first_cpu_index(), 0);
            assert_eq!(locked.num_cpu_siblings(), 1);
        }

        let mut cpu = tree.locked_cpu_node(0);
        tree.with_ancestors_locked(&mut cpu, |_cpu, mut ancestors| {
            for node in ancestors.iter_mut() {
                node.set_requested_power_state(0, LocalState::IdleStandby);
                node.set_minimal_allowed_state();
                assert_eq!(node.local_state(), LocalState::IdleStandby);
            }
        });
    }

    #[test]
    fn power_domain_tree_ancestor_chain_lengths() {
        let tree = PowerDomainTree::new(TOPOLOGY);

        // Every CPU's parent chain reaches the system node in exactly
        // MAX_POWER_LEVEL steps.
        for cpu_index in 0..tree.cpu_count() {
            let mut cpu = tree.locked_cpu_node(cpu_index);
            tree.with_ancestors_locked(&mut cpu, |_cpu, ancestors| {
                assert_eq!(MAX_POWER_LEVEL, ancestors.iter().len());
                let levels: Vec<usize> = ancestors.iter().map(|node| node.level()).collect();
                assert_eq!(levels, [1, 2]);
            });
        }

        let mut cpu = tree.locked_cpu_node(4);
        tree.with_ancestors_locked_to_max_level(&mut cpu, 1, |_cpu, ancestors| {
            assert_eq!(1, ancestors.iter().len());
        });
    }
}
