//! Recursive, redirect-capable command autocomplete graph.
//!
//! Nodes live in an arena owned by the [`CommandGraph`]; children and
//! redirects are indices into it, which makes shared children and
//! redirect-induced cycles unremarkable and keeps the wire round-trip a
//! straightforward breadth-first renumbering. Index equality is node
//! identity, which is what the merge bookkeeping in the core module relies
//! on.

use crate::error::CommandError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

/// Index of a node within its owning [`CommandGraph`].
pub type NodeId = usize;

/// Node kind, encoded in the low two bits of the wire flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The unnamed entry point of a graph.
    Root,
    /// Matches one fixed token.
    Literal,
    /// Consumes typed user input through a named parser.
    Argument,
}

/// Built-in suggestion providers an argument node may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestionProvider {
    AskServer,
    Recipes,
    Sounds,
    Entities,
}

impl SuggestionProvider {
    pub fn identifier(&self) -> &'static str {
        match self {
            SuggestionProvider::AskServer => "minecraft:ask_server",
            SuggestionProvider::Recipes => "minecraft:all_recipes",
            SuggestionProvider::Sounds => "minecraft:available_sounds",
            SuggestionProvider::Entities => "minecraft:summonable_entities",
        }
    }

    pub fn from_identifier(identifier: &str) -> Option<Self> {
        match identifier {
            "minecraft:ask_server" => Some(SuggestionProvider::AskServer),
            "minecraft:all_recipes" => Some(SuggestionProvider::Recipes),
            "minecraft:available_sounds" => Some(SuggestionProvider::Sounds),
            "minecraft:summonable_entities" => Some(SuggestionProvider::Entities),
            _ => None,
        }
    }
}

/// One node of the autocomplete graph.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandNode {
    pub kind: NodeKind,
    /// Required for literals and arguments; absent on the root.
    pub name: Option<String>,
    /// Parser identifier (e.g. `brigadier:string`); arguments only.
    pub parser: Option<String>,
    /// Parser-specific properties blob; arguments only.
    pub parser_properties: Option<Value>,
    pub suggestions: Option<SuggestionProvider>,
    /// Whether a command ends at this node. Non-executable nodes still
    /// participate in autocomplete traversal.
    pub executable: bool,
    pub redirect: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl CommandNode {
    pub fn root() -> Self {
        Self {
            kind: NodeKind::Root,
            name: None,
            parser: None,
            parser_properties: None,
            suggestions: None,
            executable: false,
            redirect: None,
            children: Vec::new(),
        }
    }

    pub fn literal(name: &str) -> Self {
        Self {
            kind: NodeKind::Literal,
            name: Some(name.to_string()),
            parser: None,
            parser_properties: None,
            suggestions: None,
            executable: false,
            redirect: None,
            children: Vec::new(),
        }
    }

    pub fn argument(name: &str, parser: &str, properties: Option<Value>) -> Self {
        Self {
            kind: NodeKind::Argument,
            name: Some(name.to_string()),
            parser: Some(parser.to_string()),
            parser_properties: properties,
            suggestions: None,
            executable: false,
            redirect: None,
            children: Vec::new(),
        }
    }
}

// Wire flag layout of the declare_commands packet: bits 0..2 node type,
// bit 2 has_command, bit 3 has_redirect, bit 4 has_custom_suggestions,
// bits 5..8 reserved.
const NODE_TYPE_MASK: u8 = 0x03;
const NODE_TYPE_ROOT: u8 = 0;
const NODE_TYPE_LITERAL: u8 = 1;
const NODE_TYPE_ARGUMENT: u8 = 2;
const FLAG_HAS_COMMAND: u8 = 0x04;
const FLAG_HAS_REDIRECT: u8 = 0x08;
const FLAG_HAS_SUGGESTIONS: u8 = 0x10;

/// Flat wire representation of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedCommandNode {
    pub flags: u8,
    #[serde(default)]
    pub children: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggests: Option<String>,
}

/// Payload of the `declare_commands` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareCommands {
    pub nodes: Vec<SerializedCommandNode>,
    #[serde(rename = "rootIndex")]
    pub root_index: u32,
}

/// Arena-backed command graph.
#[derive(Debug, Clone)]
pub struct CommandGraph {
    nodes: Vec<CommandNode>,
    root: NodeId,
}

impl Default for CommandGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandGraph {
    /// A graph holding a single root node.
    pub fn new() -> Self {
        Self {
            nodes: vec![CommandNode::root()],
            root: 0,
        }
    }

    /// A graph whose root is a literal. This is the shape of a command's
    /// autocomplete subtree before it is grafted under a full graph's root.
    pub fn literal_root(name: &str) -> Self {
        Self {
            nodes: vec![CommandNode::literal(name)],
            root: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&CommandNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut CommandNode> {
        self.nodes.get_mut(id)
    }

    /// Adds a detached node to the arena.
    pub fn add_node(&mut self, node: CommandNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Adds a literal child under `parent` and returns its id.
    pub fn literal(&mut self, parent: NodeId, name: &str) -> NodeId {
        let id = self.add_node(CommandNode::literal(name));
        self.add_child(parent, id);
        id
    }

    /// Adds an argument child under `parent` and returns its id.
    pub fn argument(
        &mut self,
        parent: NodeId,
        name: &str,
        parser: &str,
        properties: Option<Value>,
    ) -> NodeId {
        let id = self.add_node(CommandNode::argument(name, parser, properties));
        self.add_child(parent, id);
        id
    }

    /// Links `child` under `parent`. Nodes may have multiple parents; a
    /// duplicate link is ignored.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        let node = &mut self.nodes[parent];
        if !node.children.contains(&child) {
            node.children.push(child);
        }
    }

    /// Unlinks `child` from `parent`; the node stays in the arena and is
    /// simply no longer reachable through this parent.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent].children.retain(|c| *c != child);
    }

    pub fn set_executable(&mut self, id: NodeId, executable: bool) {
        self.nodes[id].executable = executable;
    }

    pub fn set_redirect(&mut self, id: NodeId, target: NodeId) {
        self.nodes[id].redirect = Some(target);
    }

    pub fn set_suggestions(&mut self, id: NodeId, provider: SuggestionProvider) {
        self.nodes[id].suggestions = Some(provider);
    }

    /// Copies the subtree of `other` reachable from `from` into this arena
    /// and returns the id of the copied root. Redirects inside the subtree
    /// are remapped along with the children.
    pub fn graft(&mut self, other: &CommandGraph, from: NodeId) -> Result<NodeId, CommandError> {
        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        let mut queue = VecDeque::new();

        other
            .node(from)
            .ok_or(CommandError::IndexOutOfRange {
                index: from,
                len: other.len(),
            })?;
        queue.push_back(from);
        remap.insert(from, 0); // placeholder, fixed below

        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            order.push(id);
            let node = other.node(id).ok_or(CommandError::IndexOutOfRange {
                index: id,
                len: other.len(),
            })?;
            for &child in &node.children {
                if !remap.contains_key(&child) {
                    remap.insert(child, 0);
                    queue.push_back(child);
                }
            }
            if let Some(redirect) = node.redirect {
                if !remap.contains_key(&redirect) {
                    remap.insert(redirect, 0);
                    queue.push_back(redirect);
                }
            }
        }

        for &old_id in &order {
            let mut copy = other.nodes[old_id].clone();
            copy.children.clear();
            copy.redirect = None;
            let new_id = self.add_node(copy);
            remap.insert(old_id, new_id);
        }
        for &old_id in &order {
            let source = &other.nodes[old_id];
            let children: Vec<NodeId> = source.children.iter().map(|c| remap[c]).collect();
            let redirect = source.redirect.map(|r| remap[&r]);
            let target = &mut self.nodes[remap[&old_id]];
            target.children = children;
            target.redirect = redirect;
        }

        Ok(remap[&from])
    }

    /// Flattens the graph into the wire form.
    ///
    /// The walk is a breadth-first queue from the root that unconditionally
    /// enqueues children and redirect targets, identity-keyed so every
    /// reachable node is numbered exactly once. The ordering is
    /// deterministic for a given graph; clients consume indices only.
    pub fn serialize(&self) -> Result<DeclareCommands, CommandError> {
        let mut order: Vec<NodeId> = Vec::new();
        let mut index_of: HashMap<NodeId, u32> = HashMap::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut queue = VecDeque::new();

        seen.insert(self.root);
        queue.push_back(self.root);

        while let Some(id) = queue.pop_front() {
            index_of.insert(id, order.len() as u32);
            order.push(id);

            let node = self.node(id).ok_or(CommandError::IndexOutOfRange {
                index: id,
                len: self.len(),
            })?;
            for &child in &node.children {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
            if let Some(redirect) = node.redirect {
                if seen.insert(redirect) {
                    queue.push_back(redirect);
                }
            }
        }

        let mut nodes = Vec::with_capacity(order.len());
        for &id in &order {
            let node = &self.nodes[id];

            let mut flags = match node.kind {
                NodeKind::Root => NODE_TYPE_ROOT,
                NodeKind::Literal => NODE_TYPE_LITERAL,
                NodeKind::Argument => NODE_TYPE_ARGUMENT,
            };
            if node.executable {
                flags |= FLAG_HAS_COMMAND;
            }
            if node.redirect.is_some() {
                flags |= FLAG_HAS_REDIRECT;
            }
            if node.suggestions.is_some() {
                flags |= FLAG_HAS_SUGGESTIONS;
            }

            let name = match node.kind {
                NodeKind::Root => None,
                NodeKind::Literal | NodeKind::Argument => Some(
                    node.name
                        .clone()
                        .ok_or_else(|| {
                            CommandError::MalformedGraph(format!(
                                "{:?} node {id} has no name",
                                node.kind
                            ))
                        })?,
                ),
            };
            let parser = match node.kind {
                NodeKind::Argument => Some(node.parser.clone().ok_or_else(|| {
                    CommandError::MalformedGraph(format!("argument node {id} has no parser"))
                })?),
                _ => None,
            };

            nodes.push(SerializedCommandNode {
                flags,
                children: node.children.iter().map(|c| index_of[c]).collect(),
                redirect: node.redirect.map(|r| index_of[&r]),
                name,
                parser,
                properties: match node.kind {
                    NodeKind::Argument => node.parser_properties.clone(),
                    _ => None,
                },
                suggests: node
                    .suggestions
                    .map(|s| s.identifier().to_string()),
            });
        }

        Ok(DeclareCommands {
            nodes,
            root_index: index_of[&self.root],
        })
    }

    /// Rebuilds a graph from the wire form, resolving all indices. Every
    /// child and redirect index is bounds-checked; the designated root is
    /// whatever entry `root_index` names.
    pub fn deserialize(packet: &DeclareCommands) -> Result<Self, CommandError> {
        let len = packet.nodes.len();
        let check = |index: u32| -> Result<NodeId, CommandError> {
            let index = index as usize;
            if index < len {
                Ok(index)
            } else {
                Err(CommandError::IndexOutOfRange { index, len })
            }
        };

        let mut nodes = Vec::with_capacity(len);
        for (i, entry) in packet.nodes.iter().enumerate() {
            let kind = match entry.flags & NODE_TYPE_MASK {
                NODE_TYPE_ROOT => NodeKind::Root,
                NODE_TYPE_LITERAL => NodeKind::Literal,
                NODE_TYPE_ARGUMENT => NodeKind::Argument,
                other => {
                    return Err(CommandError::MalformedGraph(format!(
                        "node {i} has unknown node type {other}"
                    )))
                }
            };

            let name = match kind {
                NodeKind::Root => None,
                NodeKind::Literal | NodeKind::Argument => Some(
                    entry
                        .name
                        .clone()
                        .ok_or_else(|| {
                            CommandError::MalformedGraph(format!("node {i} is missing its name"))
                        })?,
                ),
            };
            let parser = match kind {
                NodeKind::Argument => Some(entry.parser.clone().ok_or_else(|| {
                    CommandError::MalformedGraph(format!("argument node {i} is missing its parser"))
                })?),
                _ => None,
            };

            let redirect = if entry.flags & FLAG_HAS_REDIRECT != 0 {
                let index = entry.redirect.ok_or_else(|| {
                    CommandError::MalformedGraph(format!(
                        "node {i} has the redirect flag but no redirect index"
                    ))
                })?;
                Some(check(index)?)
            } else {
                None
            };

            let suggestions = if entry.flags & FLAG_HAS_SUGGESTIONS != 0 {
                let identifier = entry.suggests.as_deref().ok_or_else(|| {
                    CommandError::MalformedGraph(format!(
                        "node {i} has the suggestions flag but no provider"
                    ))
                })?;
                Some(SuggestionProvider::from_identifier(identifier).ok_or_else(|| {
                    CommandError::MalformedGraph(format!(
                        "node {i} names unknown suggestion provider {identifier}"
                    ))
                })?)
            } else {
                None
            };

            let mut children = Vec::with_capacity(entry.children.len());
            for &child in &entry.children {
                children.push(check(child)?);
            }

            nodes.push(CommandNode {
                kind,
                name,
                parser,
                parser_properties: match kind {
                    NodeKind::Argument => entry.properties.clone(),
                    _ => None,
                },
                suggestions,
                executable: entry.flags & FLAG_HAS_COMMAND != 0,
                redirect,
                children,
            });
        }

        Ok(Self {
            nodes,
            root: check(packet.root_index)?,
        })
    }
}
