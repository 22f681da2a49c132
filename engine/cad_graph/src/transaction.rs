//! The transaction / graph builder.
//!
//! A `Transaction` is a write-only, batched description of graph
//! structure. Nothing touches the live runtime until commit, and commit
//! validates the whole batch before mutating anything - a structurally
//! broken transaction is rejected outright rather than half-applied.
//!
//! Builder handles (`SurfaceRef`, `NodeRef`, `RootRef`) mutably borrow
//! the transaction, so they are transaction-scoped by construction and
//! released exactly once; the transaction itself is move-only and is
//! consumed by commit.

use rustc_hash::{FxHashMap, FxHashSet};

use cad_ir::{ConstantValue, ControlRef, RuntimeError, VarType};

/// How a value group obtains its initial or connected value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ValueGroupSource {
    #[default]
    None,
    /// Fed through the surface's portal socket with this index.
    Socket(usize),
    /// Starts from a constant.
    Default(ConstantValue),
}

/// One value group of a surface under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDef {
    pub var_type: VarType,
    pub source: ValueGroupSource,
}

/// What a node instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A compiled custom node block.
    Custom { block_id: u64 },
    /// A nested group surface.
    Group { surface_id: u64 },
}

/// One socket wiring a node to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketDef {
    pub group: usize,
    pub written: bool,
    pub read: bool,
    pub extractor: bool,
}

/// One node of a surface under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub kind: NodeKind,
    pub sockets: Vec<SocketDef>,
}

/// One surface under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceDef {
    pub id: u64,
    pub name: String,
    pub groups: Vec<GroupDef>,
    pub nodes: Vec<NodeDef>,
    /// Group indices exposed as this surface's portals, in portal order.
    /// On the root surface these are the instrument's external I/O.
    pub portals: Vec<usize>,
}

/// A batched, declarative description of graph structure.
///
/// Move-only: commit consumes it.
#[derive(Debug, Default)]
pub struct Transaction {
    surfaces: Vec<SurfaceDef>,
}

/// Lookup into already-committed state, used during validation for
/// references that point outside the transaction.
pub trait GraphLookup {
    /// Controls of a compiled block, in control order.
    fn block_controls(&self, block_id: u64) -> Option<&[ControlRef]>;
    /// Portal value types of a committed surface, in portal order.
    fn surface_portals(&self, surface_id: u64) -> Option<Vec<VarType>>;
}

impl Transaction {
    pub fn new() -> Self {
        Transaction::default()
    }

    /// Begin describing a surface.
    pub fn build_surface(&mut self, id: u64, name: impl Into<String>) -> SurfaceRef<'_> {
        self.surfaces.push(SurfaceDef {
            id,
            name: name.into(),
            groups: Vec::new(),
            nodes: Vec::new(),
            portals: Vec::new(),
        });
        let index = self.surfaces.len() - 1;
        SurfaceRef { txn: self, index }
    }

    /// The surfaces described so far.
    pub fn surfaces(&self) -> &[SurfaceDef] {
        &self.surfaces
    }

    /// Consume the transaction into its surface definitions.
    pub fn into_surfaces(self) -> Vec<SurfaceDef> {
        self.surfaces
    }

    /// Validate every structural invariant of the batch.
    ///
    /// Called by commit before any live state changes; an error here
    /// means nothing was applied.
    pub fn validate(&self, lookup: &dyn GraphLookup) -> Result<(), RuntimeError> {
        let mut seen = FxHashSet::default();
        for surface in &self.surfaces {
            if !seen.insert(surface.id) {
                return Err(RuntimeError::new(format!(
                    "surface {} described twice in one transaction",
                    surface.id
                )));
            }
        }

        let in_txn: FxHashMap<u64, &SurfaceDef> =
            self.surfaces.iter().map(|s| (s.id, s)).collect();

        for surface in &self.surfaces {
            validate_surface(surface, &in_txn, lookup)?;
        }
        Ok(())
    }
}

fn validate_surface(
    surface: &SurfaceDef,
    in_txn: &FxHashMap<u64, &SurfaceDef>,
    lookup: &dyn GraphLookup,
) -> Result<(), RuntimeError> {
    let err = |message: String| Err(RuntimeError::new(message));

    for (index, portal) in surface.portals.iter().enumerate() {
        if *portal >= surface.groups.len() {
            return err(format!(
                "surface {}: portal {index} references missing group {portal}",
                surface.id
            ));
        }
    }

    for (index, group) in surface.groups.iter().enumerate() {
        match &group.source {
            ValueGroupSource::None => {}
            ValueGroupSource::Socket(socket) => {
                if *socket >= surface.portals.len() {
                    return err(format!(
                        "surface {}: group {index} fed by missing portal socket {socket}",
                        surface.id
                    ));
                }
            }
            ValueGroupSource::Default(constant) => {
                if constant.var_type() != group.var_type {
                    return err(format!(
                        "surface {}: group {index} default is {}, group stores {}",
                        surface.id,
                        constant.var_type(),
                        group.var_type
                    ));
                }
            }
        }
    }

    for (node_index, node) in surface.nodes.iter().enumerate() {
        for socket in &node.sockets {
            if socket.group >= surface.groups.len() {
                return err(format!(
                    "surface {}: node {node_index} socket references missing group {}",
                    surface.id, socket.group
                ));
            }
        }

        match node.kind {
            NodeKind::Custom { block_id } => {
                let Some(controls) = lookup.block_controls(block_id) else {
                    return err(format!(
                        "surface {}: node {node_index} references unknown block {block_id}",
                        surface.id
                    ));
                };
                if controls.len() != node.sockets.len() {
                    return err(format!(
                        "surface {}: node {node_index} has {} sockets, block {block_id} exposes {} controls",
                        surface.id,
                        node.sockets.len(),
                        controls.len()
                    ));
                }
                for (socket, control) in node.sockets.iter().zip(controls) {
                    let group_ty = &surface.groups[socket.group].var_type;
                    let control_ty = control.control_type.var_type();
                    if *group_ty != control_ty {
                        return err(format!(
                            "surface {}: socket for control `{}` wires {} to {}",
                            surface.id, control.name, group_ty, control_ty
                        ));
                    }
                    if socket.written && !control.written {
                        return err(format!(
                            "surface {}: socket claims writes, control `{}` never writes",
                            surface.id, control.name
                        ));
                    }
                    if socket.read && !control.read {
                        return err(format!(
                            "surface {}: socket claims reads, control `{}` never reads",
                            surface.id, control.name
                        ));
                    }
                    if socket.extractor != control.control_type.is_extractor() {
                        return err(format!(
                            "surface {}: extractor flag mismatch on control `{}`",
                            surface.id, control.name
                        ));
                    }
                }
            }
            NodeKind::Group { surface_id } => {
                let portals: Vec<VarType> = if let Some(child) = in_txn.get(&surface_id) {
                    child
                        .portals
                        .iter()
                        .map(|g| child.groups[*g].var_type.clone())
                        .collect()
                } else if let Some(portals) = lookup.surface_portals(surface_id) {
                    portals
                } else {
                    return err(format!(
                        "surface {}: node {node_index} references unknown surface {surface_id}",
                        surface.id
                    ));
                };
                if portals.len() != node.sockets.len() {
                    return err(format!(
                        "surface {}: node {node_index} has {} sockets, surface {surface_id} exposes {} portals",
                        surface.id,
                        node.sockets.len(),
                        portals.len()
                    ));
                }
                for (socket, portal_ty) in node.sockets.iter().zip(&portals) {
                    let group_ty = &surface.groups[socket.group].var_type;
                    if group_ty != portal_ty {
                        return err(format!(
                            "surface {}: portal socket wires {} to {}",
                            surface.id, group_ty, portal_ty
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Builder handle for one surface. Transaction-scoped.
pub struct SurfaceRef<'t> {
    txn: &'t mut Transaction,
    index: usize,
}

impl SurfaceRef<'_> {
    fn def(&mut self) -> &mut SurfaceDef {
        &mut self.txn.surfaces[self.index]
    }

    /// Add a value group; returns its group index.
    pub fn add_value_group(&mut self, var_type: VarType, source: ValueGroupSource) -> usize {
        let def = self.def();
        def.groups.push(GroupDef { var_type, source });
        def.groups.len() - 1
    }

    /// Add a custom node running the given block.
    pub fn add_custom_node(&mut self, block_id: u64) -> NodeRef<'_> {
        let def = self.def();
        def.nodes.push(NodeDef {
            kind: NodeKind::Custom { block_id },
            sockets: Vec::new(),
        });
        let node = def.nodes.len() - 1;
        NodeRef {
            txn: self.txn,
            surface: self.index,
            node,
        }
    }

    /// Add a nested group surface node.
    pub fn add_group_node(&mut self, surface_id: u64) -> NodeRef<'_> {
        let def = self.def();
        def.nodes.push(NodeDef {
            kind: NodeKind::Group { surface_id },
            sockets: Vec::new(),
        });
        let node = def.nodes.len() - 1;
        NodeRef {
            txn: self.txn,
            surface: self.index,
            node,
        }
    }

    /// Describe this surface's external I/O.
    pub fn root(&mut self) -> RootRef<'_> {
        RootRef {
            txn: self.txn,
            surface: self.index,
        }
    }
}

/// Builder handle for one node. Transaction-scoped.
pub struct NodeRef<'t> {
    txn: &'t mut Transaction,
    surface: usize,
    node: usize,
}

impl NodeRef<'_> {
    /// Wire the node's next control/portal to a group.
    ///
    /// Sockets are added in the child's control order.
    pub fn add_value_socket(
        &mut self,
        group: usize,
        written: bool,
        read: bool,
        is_extractor: bool,
    ) -> usize {
        let sockets = &mut self.txn.surfaces[self.surface].nodes[self.node].sockets;
        sockets.push(SocketDef {
            group,
            written,
            read,
            extractor: is_extractor,
        });
        sockets.len() - 1
    }
}

/// Builder handle for a surface's external socket list.
pub struct RootRef<'t> {
    txn: &'t mut Transaction,
    surface: usize,
}

impl RootRef<'_> {
    /// Expose a group as the surface's next portal.
    pub fn add_socket(&mut self, group: usize) -> usize {
        let portals = &mut self.txn.surfaces[self.surface].portals;
        portals.push(group);
        portals.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cad_ir::{ControlType, FormTag};

    struct TestLookup {
        blocks: FxHashMap<u64, Vec<ControlRef>>,
        surfaces: FxHashMap<u64, Vec<VarType>>,
    }

    impl TestLookup {
        fn new() -> Self {
            TestLookup {
                blocks: FxHashMap::default(),
                surfaces: FxHashMap::default(),
            }
        }

        fn with_block(mut self, id: u64, controls: Vec<ControlRef>) -> Self {
            self.blocks.insert(id, controls);
            self
        }
    }

    impl GraphLookup for TestLookup {
        fn block_controls(&self, block_id: u64) -> Option<&[ControlRef]> {
            self.blocks.get(&block_id).map(Vec::as_slice)
        }

        fn surface_portals(&self, surface_id: u64) -> Option<Vec<VarType>> {
            self.surfaces.get(&surface_id).cloned()
        }
    }

    fn audio_control(name: &str, written: bool, read: bool) -> ControlRef {
        let mut control = ControlRef::new(name, ControlType::Audio);
        control.written = written;
        control.read = read;
        control
    }

    /// Block 7: an `inp -> out` processor.
    fn lookup_with_processor() -> TestLookup {
        TestLookup::new().with_block(
            7,
            vec![
                audio_control("inp", false, true),
                audio_control("out", true, false),
            ],
        )
    }

    fn well_formed() -> Transaction {
        let mut txn = Transaction::new();
        let mut surface = txn.build_surface(1, "main");
        let input = surface.add_value_group(VarType::Num, ValueGroupSource::Socket(0));
        let output = surface.add_value_group(
            VarType::Num,
            ValueGroupSource::Default(ConstantValue::mono(0.0, FormTag::None)),
        );
        let mut node = surface.add_custom_node(7);
        node.add_value_socket(input, false, true, false);
        node.add_value_socket(output, true, false, false);
        let mut root = surface.root();
        root.add_socket(input);
        root.add_socket(output);
        txn
    }

    #[test]
    fn test_well_formed_transaction_validates() {
        let txn = well_formed();
        assert!(txn.validate(&lookup_with_processor()).is_ok());
    }

    #[test]
    fn test_builder_records_structure() {
        let txn = well_formed();
        let surfaces = txn.into_surfaces();
        assert_eq!(surfaces.len(), 1);
        let surface = &surfaces[0];
        assert_eq!(surface.name, "main");
        assert_eq!(surface.groups.len(), 2);
        assert_eq!(surface.nodes.len(), 1);
        assert_eq!(surface.nodes[0].sockets.len(), 2);
        assert_eq!(surface.portals, vec![0, 1]);
    }

    #[test]
    fn test_dangling_socket_group_rejected() {
        let mut txn = Transaction::new();
        let mut surface = txn.build_surface(1, "main");
        let mut node = surface.add_custom_node(7);
        node.add_value_socket(3, false, true, false);
        let err = txn.validate(&lookup_with_processor()).unwrap_err();
        assert!(err.message.contains("missing group"));
    }

    #[test]
    fn test_unknown_block_rejected() {
        let mut txn = Transaction::new();
        let mut surface = txn.build_surface(1, "main");
        let group = surface.add_value_group(VarType::Num, ValueGroupSource::None);
        let mut node = surface.add_custom_node(99);
        node.add_value_socket(group, false, true, false);
        let err = txn.validate(&lookup_with_processor()).unwrap_err();
        assert!(err.message.contains("unknown block"));
    }

    #[test]
    fn test_socket_count_must_match_controls() {
        let mut txn = Transaction::new();
        let mut surface = txn.build_surface(1, "main");
        let group = surface.add_value_group(VarType::Num, ValueGroupSource::None);
        let mut node = surface.add_custom_node(7);
        node.add_value_socket(group, false, true, false);
        let err = txn.validate(&lookup_with_processor()).unwrap_err();
        assert!(err.message.contains("exposes 2 controls"));
    }

    #[test]
    fn test_group_type_must_match_control() {
        let lookup = TestLookup::new().with_block(
            7,
            vec![{
                let mut c = ControlRef::new("m", ControlType::Midi);
                c.read = true;
                c
            }],
        );
        let mut txn = Transaction::new();
        let mut surface = txn.build_surface(1, "main");
        let group = surface.add_value_group(VarType::Num, ValueGroupSource::None);
        let mut node = surface.add_custom_node(7);
        node.add_value_socket(group, false, true, false);
        let err = txn.validate(&lookup).unwrap_err();
        assert!(err.message.contains("wires num to midi"));
    }

    #[test]
    fn test_default_type_must_match_group() {
        let mut txn = Transaction::new();
        let mut surface = txn.build_surface(1, "main");
        surface.add_value_group(
            VarType::Midi,
            ValueGroupSource::Default(ConstantValue::mono(1.0, FormTag::None)),
        );
        let err = txn.validate(&TestLookup::new()).unwrap_err();
        assert!(err.message.contains("default"));
    }

    #[test]
    fn test_duplicate_surface_rejected() {
        let mut txn = Transaction::new();
        txn.build_surface(1, "a");
        txn.build_surface(1, "b");
        let err = txn.validate(&TestLookup::new()).unwrap_err();
        assert!(err.message.contains("twice"));
    }

    #[test]
    fn test_group_node_against_sibling_surface() {
        let mut txn = Transaction::new();
        {
            let mut child = txn.build_surface(2, "child");
            let portal = child.add_value_group(VarType::Num, ValueGroupSource::Socket(0));
            child.root().add_socket(portal);
        }
        {
            let mut parent = txn.build_surface(1, "parent");
            let group = parent.add_value_group(VarType::Num, ValueGroupSource::None);
            let mut node = parent.add_group_node(2);
            node.add_value_socket(group, false, true, false);
        }
        assert!(txn.validate(&TestLookup::new()).is_ok());
    }

    #[test]
    fn test_group_node_portal_count_mismatch() {
        let mut txn = Transaction::new();
        {
            let mut child = txn.build_surface(2, "child");
            let portal = child.add_value_group(VarType::Num, ValueGroupSource::Socket(0));
            child.root().add_socket(portal);
        }
        {
            let mut parent = txn.build_surface(1, "parent");
            let _group = parent.add_value_group(VarType::Num, ValueGroupSource::None);
            let _node = parent.add_group_node(2);
            // No sockets added for the child's one portal.
        }
        let err = txn.validate(&TestLookup::new()).unwrap_err();
        assert!(err.message.contains("portals"));
    }
}
