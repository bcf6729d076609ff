use super::{ListCrdt, generate_item_uuid};
use crate::registers::{LwwMapDelta, LwwMapState, MapOp};
use deltasync_core::{
    Clock,
    DeltaCrdt,
    LamportClock,
    Listeners,
    Packable,
    Result,
    StateUpdate,
    Value,
    codec::{ByteReader, CodecError, InconsistentSnafu},
    errors::{
        InvalidValueSnafu,
        ListenerRejectedSnafu,
        MissingItemSnafu,
        OutOfBoundsSnafu,
        WrongTypeSnafu,
    },
    value::Inject,
};
use snafu::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// One tree node.
///
/// An empty `parent` marks a root. Deleted nodes keep their value and stay
/// in the graph as tombstones so descendants still resolve their ancestor
/// chain; only `visible` flips.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtNode {
    pub value: Value,
    pub uuid: Vec<u8>,
    pub parent: Vec<u8>,
    pub visible: bool,
}
impl CtNode {
    pub(crate) fn encode(&self) -> Value {
        Value::List(vec![
            self.value.clone(),
            Value::Bytes(self.uuid.clone()),
            Value::Bytes(self.parent.clone()),
            Value::Int(i64::from(self.visible)),
        ])
    }

    pub(crate) fn decode(value: &Value) -> Result<Self> {
        let Value::List(parts) = value else {
            return WrongTypeSnafu {
                what: "tree node",
                expected: "a (value, uuid, parent, visible) sequence",
            }
            .fail();
        };
        let [node_value, uuid, parent, visible] = parts.as_slice() else {
            return WrongTypeSnafu {
                what: "tree node",
                expected: "a (value, uuid, parent, visible) sequence",
            }
            .fail();
        };
        let Value::Bytes(uuid) = uuid else {
            return WrongTypeSnafu {
                what: "tree node uuid",
                expected: "a byte sequence",
            }
            .fail();
        };
        let Value::Bytes(parent) = parent else {
            return WrongTypeSnafu {
                what: "tree node parent",
                expected: "a byte sequence",
            }
            .fail();
        };
        let Value::Int(visible) = visible else {
            return WrongTypeSnafu {
                what: "tree node visibility",
                expected: "an integer flag",
            }
            .fail();
        };
        ensure!(
            !uuid.is_empty(),
            InvalidValueSnafu {
                what: "tree node uuid",
                reason: "must not be empty".to_string(),
            }
        );
        ensure!(
            matches!(visible, 0 | 1),
            InvalidValueSnafu {
                what: "tree node visibility",
                reason: "must be 0 or 1".to_string(),
            }
        );
        Ok(Self {
            value: node_value.clone(),
            uuid: uuid.clone(),
            parent: parent.clone(),
            visible: *visible == 1,
        })
    }
}

/// An ordered list derived from a parent-linked tree.
///
/// Nodes live in an embedded last-writer-wins map keyed by node uuid; the
/// list order is a depth-first traversal from the roots, siblings ordered by
/// their serialized form. Nodes caught in a parent cycle, and nodes whose
/// ancestor chain is incomplete, are excluded from the traversal on every
/// replica alike and surfaced through [[CausalTree::read_excluded]].
#[derive(Clone, Debug, PartialEq)]
pub struct CausalTree<C: Clock = LamportClock> {
    clock: C,
    map: LwwMapState<C>,
    cache: Vec<CtNode>,
    excluded: Vec<CtNode>,
    listeners: Listeners<StateUpdate<LwwMapDelta, C::Timestamp>>,
}
impl CausalTree<LamportClock> {
    pub fn new() -> Self {
        Self::with_clock(LamportClock::new())
    }
}
impl Default for CausalTree<LamportClock> {
    fn default() -> Self {
        Self::new()
    }
}
impl<C: Clock> CausalTree<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            map: LwwMapState::new(),
            cache: Vec::new(),
            excluded: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    /// All reachable nodes in traversal order, tombstones included.
    pub fn read_full(&self) -> &[CtNode] {
        &self.cache
    }

    /// Nodes excluded from the traversal: cycle members, their descendants,
    /// and orphans. Sorted by serialized form.
    pub fn read_excluded(&self) -> &[CtNode] {
        &self.excluded
    }

    /// The base operation: write one node wholesale.
    pub fn put(
        &mut self,
        value: Value,
        writer: Value,
        item_uuid: Vec<u8>,
        parent_uuid: Vec<u8>,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        ensure!(
            !item_uuid.is_empty(),
            InvalidValueSnafu {
                what: "tree node uuid",
                reason: "must not be empty".to_string(),
            }
        );
        let node = CtNode {
            value,
            uuid: item_uuid,
            parent: parent_uuid,
            visible: true,
        };
        self.put_node(node, writer)
    }

    /// Insert a new first node.
    ///
    /// Existing roots are re-parented under the new node; all emitted
    /// updates are returned as a batch so the caller propagates them
    /// together.
    pub fn put_first(
        &mut self,
        value: Value,
        writer: Value,
    ) -> Result<Vec<StateUpdate<LwwMapDelta, C::Timestamp>>> {
        let former_roots: Vec<CtNode> = self
            .cache
            .iter()
            .filter(|node| node.parent.is_empty())
            .cloned()
            .collect();
        let new_uuid = generate_item_uuid();
        let mut updates = vec![self.put(value, writer.clone(), new_uuid.clone(), Vec::new())?];
        for root in former_roots {
            let update = self.put_node(
                CtNode {
                    parent: new_uuid.clone(),
                    ..root
                },
                writer.clone(),
            )?;
            updates.push(update);
        }
        Ok(updates)
    }

    /// Insert a new node under `parent_uuid` with a generated uuid.
    pub fn put_after(
        &mut self,
        value: Value,
        writer: Value,
        parent_uuid: &[u8],
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        ensure!(
            self.node(parent_uuid).is_some(),
            MissingItemSnafu {
                what: format!("parent node {}", hex::encode(parent_uuid)),
            }
        );
        self.put(value, writer, generate_item_uuid(), parent_uuid.to_vec())
    }

    /// Insert after the current last visible node, or as a root when the
    /// tree is empty.
    pub fn append(
        &mut self,
        value: Value,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let last_visible = self
            .cache
            .iter()
            .rev()
            .find(|node| node.visible)
            .map(|node| node.uuid.clone());
        match last_visible {
            Some(parent_uuid) => self.put_after(value, writer, &parent_uuid),
            None => self.put(value, writer, generate_item_uuid(), Vec::new()),
        }
    }

    /// Re-parent one node; value and visibility are unchanged.
    pub fn move_item(
        &mut self,
        item_uuid: &[u8],
        new_parent_uuid: Vec<u8>,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let node = self.node(item_uuid).context(MissingItemSnafu {
            what: format!("tree node {}", hex::encode(item_uuid)),
        })?;
        self.put_node(
            CtNode {
                parent: new_parent_uuid,
                ..node
            },
            writer,
        )
    }

    /// Tombstone one node: it disappears from [[CausalTree::read]] but its
    /// descendants keep their ancestor chain.
    pub fn delete(
        &mut self,
        item_uuid: &[u8],
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let node = self.node(item_uuid).context(MissingItemSnafu {
            what: format!("tree node {}", hex::encode(item_uuid)),
        })?;
        self.put_node(
            CtNode {
                visible: false,
                ..node
            },
            writer,
        )
    }

    /// Look up a node by uuid, whether reachable or excluded.
    pub fn node(&self, item_uuid: &[u8]) -> Option<CtNode> {
        let key = Value::Bytes(item_uuid.to_vec());
        let value = self.map.visible_value(&key)?;
        CtNode::decode(value).ok()
    }

    /// Rebuild the traversal caches from the underlying map.
    ///
    /// Runs after every accepted update: a parent change moves whole
    /// subtrees and a value change can reorder siblings, so there is no
    /// sound local patch on the flattened order.
    pub fn calculate_cache(&mut self) -> Result<()> {
        let mut nodes: BTreeMap<Vec<u8>, CtNode> = BTreeMap::new();
        for (key, value) in self.map.iter_visible() {
            let node = CtNode::decode(value)?;
            ensure!(
                matches!(key, Value::Bytes(uuid) if uuid == &node.uuid),
                InvalidValueSnafu {
                    what: "tree node",
                    reason: "uuid does not match its key".to_string(),
                }
            );
            nodes.insert(node.uuid.clone(), node);
        }

        let mut children: BTreeMap<&[u8], Vec<&CtNode>> = BTreeMap::new();
        let mut roots: Vec<&CtNode> = Vec::new();
        for node in nodes.values() {
            if node.parent.is_empty() {
                roots.push(node);
            } else {
                children.entry(&node.parent).or_default().push(node);
            }
        }
        let serialized = |node: &CtNode| node.encode().pack();
        roots.sort_unstable_by_key(|node| node.encode().pack());
        for siblings in children.values_mut() {
            siblings.sort_unstable_by_key(|node| node.encode().pack());
        }

        // Iterative depth-first walk; anything never reached is excluded.
        let mut ordered: Vec<CtNode> = Vec::with_capacity(nodes.len());
        let mut reached: BTreeSet<&[u8]> = BTreeSet::new();
        let mut stack: Vec<&CtNode> = roots.into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            if !reached.insert(&node.uuid) {
                continue;
            }
            ordered.push(node.clone());
            if let Some(siblings) = children.get(node.uuid.as_slice()) {
                stack.extend(siblings.iter().rev().copied());
            }
        }

        let mut excluded: Vec<CtNode> = nodes
            .values()
            .filter(|node| !reached.contains(node.uuid.as_slice()))
            .cloned()
            .collect();
        excluded.sort_unstable_by_key(serialized);

        self.cache = ordered;
        self.excluded = excluded;
        Ok(())
    }

    fn put_node(
        &mut self,
        node: CtNode,
        writer: Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let ts = self.clock.tick();
        let delta = StateUpdate::new(
            self.clock.uuid().clone(),
            ts,
            LwwMapDelta {
                op: MapOp::Set,
                key: Value::Bytes(node.uuid.clone()),
                value: node.encode(),
                writer,
            },
        );
        self.update(&delta)?;
        Ok(delta)
    }

    fn validate_payload(data: &LwwMapDelta) -> Result<()> {
        LwwMapState::<C>::validate(data)?;
        let Value::Bytes(key_uuid) = &data.key else {
            return WrongTypeSnafu {
                what: "tree node key",
                expected: "a byte sequence",
            }
            .fail();
        };
        if data.op == MapOp::Set {
            let node = CtNode::decode(&data.value)?;
            ensure!(
                &node.uuid == key_uuid,
                InvalidValueSnafu {
                    what: "tree node",
                    reason: "uuid does not match its key".to_string(),
                }
            );
        }
        Ok(())
    }

    fn visible_nodes(&self) -> impl Iterator<Item = &CtNode> {
        self.cache.iter().filter(|node| node.visible)
    }
}
impl<C: Clock> DeltaCrdt for CausalTree<C> {
    type Clock = C;
    type Payload = LwwMapDelta;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&self) -> Vec<Value> {
        self.visible_nodes()
            .map(|node| node.value.clone())
            .collect()
    }

    fn update(&mut self, delta: &StateUpdate<LwwMapDelta, C::Timestamp>) -> Result<&mut Self> {
        self.ensure_same_clock(delta)?;
        Self::validate_payload(delta.data())?;
        self.invoke_listeners(delta).context(ListenerRejectedSnafu)?;
        self.clock.absorb(delta.ts());
        let transition = self.map.apply(delta.data(), delta.ts());
        if transition.was != transition.now {
            self.calculate_cache()
                .expect("Applied nodes are validated on entry");
        }
        Ok(self)
    }

    fn history(
        &self,
        from: Option<&C::Timestamp>,
        until: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.map
            .history_deltas(self.clock.uuid(), None, from, until)
    }

    fn listeners(&self) -> &Listeners<StateUpdate<LwwMapDelta, C::Timestamp>> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<StateUpdate<LwwMapDelta, C::Timestamp>> {
        &mut self.listeners
    }
}
impl<C: Clock> ListCrdt for CausalTree<C> {
    fn list_len(&self) -> usize {
        self.visible_nodes().count()
    }

    fn read_list(&self) -> Vec<Value> {
        self.read()
    }

    fn append_value(
        &mut self,
        value: Value,
        writer: &Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        self.append(value, writer.clone())
    }

    fn remove_at(
        &mut self,
        index: usize,
        writer: &Value,
    ) -> Result<StateUpdate<LwwMapDelta, C::Timestamp>> {
        let uuid = self
            .visible_nodes()
            .nth(index)
            .map(|node| node.uuid.clone());
        let Some(uuid) = uuid else {
            return OutOfBoundsSnafu {
                index,
                len: self.list_len(),
            }
            .fail();
        };
        self.delete(&uuid, writer.clone())
    }
}
impl<C: Clock> Packable for CausalTree<C> {
    fn pack_into(&self, out: &mut Vec<u8>) {
        self.clock.pack_into(out);
        self.map.pack_into(out);
    }

    fn unpack_from(reader: &mut ByteReader<'_>, inject: &Inject) -> Result<Self, CodecError> {
        let clock = C::unpack_from(reader, inject)?;
        let map = LwwMapState::unpack_from(reader, inject)?;
        let mut tree = Self {
            clock,
            map,
            cache: Vec::new(),
            excluded: Vec::new(),
            listeners: Listeners::new(),
        };
        tree.calculate_cache().map_err(|error| {
            InconsistentSnafu {
                reason: error.to_string(),
            }
            .build()
        })?;
        Ok(tree)
    }
}
