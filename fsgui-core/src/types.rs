use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Process-unique opaque identifier, assigned on node creation and reused
/// verbatim across save/restore. No ordering is implied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Decode a `Ref`-kind parameter's bound value: a `Value::String` holding
    /// a UUID. Mirrors `TriggerTree::from_value`'s leaf case, which is the
    /// only other place a parameter value decodes into an instance id.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id_str = value.as_str()?;
        Some(Self(Uuid::parse_str(id_str).ok()?))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a node publishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datatype {
    Float,
    Point2d,
    Bool,
    BinId,
    Spikes,
    DiscreteDistribution,
    Timestamp,
}

/// Node lifecycle classes: source / filter / action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeClass {
    Source,
    Filter,
    Action,
}

/// One entry in a node type's parameter schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
    pub default: Value,
    pub live_editable: bool,
}

impl ParamDescriptor {
    pub fn new(name: impl Into<String>, kind: ParamKind, default: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            default,
            live_editable: false,
        }
    }

    pub fn live_editable(mut self) -> Self {
        self.live_editable = true;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ParamKind {
    Int { lower: i64, upper: i64 },
    Float { lower: f64, upper: f64 },
    Bool,
    String,
    Enum(Vec<String>),
    /// A homogeneous list of another kind, e.g. a channel-index list
    /// (`List(Int)`) or a per-channel manual mean vector (`List(Float)`).
    List(Box<ParamKind>),
    /// A reference to another node, constrained by the datatype it must publish.
    Ref(Datatype),
    TriggerTree,
    TrackGeometry,
}

/// A bound value for one parameter.
pub type ParamValues = BTreeMap<String, Value>;

/// Boolean gate kind in a trigger tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOp {
    And,
    Or,
    Nand,
}

/// A finite rose tree of boolean gates over boolean-producing node references.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TriggerTree {
    Gate {
        op: GateOp,
        children: Vec<TriggerTree>,
    },
    Leaf {
        instance_id: InstanceId,
    },
}

impl TriggerTree {
    /// BFS over the tree, collecting every referenced leaf instance id.
    /// This is exactly what the graph controller uses to resolve a
    /// trigger-tree parameter into the node's children.
    pub fn leaf_ids(&self) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(self);
        while let Some(node) = queue.pop_front() {
            match node {
                TriggerTree::Leaf { instance_id } => out.push(*instance_id),
                TriggerTree::Gate { children, .. } => {
                    for child in children {
                        queue.push_back(child);
                    }
                }
            }
        }
        out
    }

    /// Decode a tree from its `Value` encoding: `{"leaf": "<uuid>"}` for a
    /// leaf, `{"op": "and"|"or"|"nand", "children": [...]}` for a gate.
    /// This is the wire form a `TriggerTree`-kind parameter is bound to,
    /// shared by every kernel that evaluates one and by the controller's
    /// reference resolution (both need the same leaf set).
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = match value {
            Value::Map(m) => m,
            _ => return None,
        };
        if let Some(Value::String(id_str)) = map.get("leaf") {
            let instance_id = InstanceId(Uuid::parse_str(id_str).ok()?);
            return Some(TriggerTree::Leaf { instance_id });
        }
        let op = match map.get("op")?.as_str()? {
            "and" => GateOp::And,
            "or" => GateOp::Or,
            "nand" => GateOp::Nand,
            _ => return None,
        };
        let children = map
            .get("children")?
            .as_list()?
            .iter()
            .filter_map(TriggerTree::from_value)
            .collect();
        Some(TriggerTree::Gate { op, children })
    }

    /// Encode back to the same `Value` shape `from_value` reads.
    pub fn to_value(&self) -> Value {
        match self {
            TriggerTree::Leaf { instance_id } => {
                let mut map = BTreeMap::new();
                map.insert("leaf".to_string(), Value::String(instance_id.to_string()));
                Value::Map(map)
            }
            TriggerTree::Gate { op, children } => {
                let op_str = match op {
                    GateOp::And => "and",
                    GateOp::Or => "or",
                    GateOp::Nand => "nand",
                };
                let mut map = BTreeMap::new();
                map.insert("op".to_string(), Value::String(op_str.to_string()));
                map.insert(
                    "children".to_string(),
                    Value::List(children.iter().map(TriggerTree::to_value).collect()),
                );
                Value::Map(map)
            }
        }
    }

    /// Fold the gate over the current cached boolean for each leaf.
    /// Pure in `cached`: identical inputs always yield the same result.
    pub fn evaluate(&self, cached: &BTreeMap<InstanceId, bool>) -> bool {
        match self {
            TriggerTree::Leaf { instance_id } => cached.get(instance_id).copied().unwrap_or(false),
            TriggerTree::Gate { op, children } => {
                let mut values = children.iter().map(|c| c.evaluate(cached));
                match op {
                    GateOp::And => values.all(|v| v),
                    GateOp::Or => values.any(|v| v),
                    GateOp::Nand => !values.all(|v| v),
                }
            }
        }
    }
}

/// Controller-side lifecycle status of a node instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Unbuilt,
    Built,
    Error(String),
}

/// A node instance as the controller tracks it. The worker handle itself
/// lives alongside this in the controller's map, not inside it, so that
/// `NodeInstance` stays `Clone`/`Serialize` for `get_save_config`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInstance {
    pub instance_id: InstanceId,
    pub type_id: String,
    pub nickname: String,
    pub params: ParamValues,
    pub status: NodeStatus,
}

impl NodeInstance {
    pub fn is_built(&self) -> bool {
        matches!(self.status, NodeStatus::Built)
    }
}

/// One node instance's persisted config blob (the YAML document's per-node record).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfigBlob {
    pub type_id: String,
    pub instance_id: InstanceId,
    pub nickname: String,
    #[serde(default)]
    pub params: ParamValues,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_tree_s5() {
        // AND(X, OR(Y, NAND(Z)))
        let x = InstanceId::new();
        let y = InstanceId::new();
        let z = InstanceId::new();
        let tree = TriggerTree::Gate {
            op: GateOp::And,
            children: vec![
                TriggerTree::Leaf { instance_id: x },
                TriggerTree::Gate {
                    op: GateOp::Or,
                    children: vec![
                        TriggerTree::Leaf { instance_id: y },
                        TriggerTree::Gate {
                            op: GateOp::Nand,
                            children: vec![TriggerTree::Leaf { instance_id: z }],
                        },
                    ],
                },
            ],
        };

        let cached = BTreeMap::from([(x, true), (y, false), (z, false)]);
        assert!(tree.evaluate(&cached));

        let cached = BTreeMap::from([(x, true), (y, false), (z, true)]);
        assert!(!tree.evaluate(&cached));

        let cached = BTreeMap::from([(x, false), (y, false), (z, false)]);
        assert!(!tree.evaluate(&cached));
    }

    #[test]
    fn trigger_tree_pure() {
        let x = InstanceId::new();
        let tree = TriggerTree::Leaf { instance_id: x };
        let cached = BTreeMap::from([(x, true)]);
        assert_eq!(tree.evaluate(&cached), tree.evaluate(&cached));
    }

    #[test]
    fn trigger_tree_value_round_trip() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        let tree = TriggerTree::Gate {
            op: GateOp::Nand,
            children: vec![
                TriggerTree::Leaf { instance_id: a },
                TriggerTree::Leaf { instance_id: b },
            ],
        };
        let decoded = TriggerTree::from_value(&tree.to_value()).unwrap();
        let mut ids = decoded.leaf_ids();
        ids.sort();
        let mut expect = vec![a, b];
        expect.sort();
        assert_eq!(ids, expect);
    }

    #[test]
    fn instance_id_from_value_round_trips() {
        let id = InstanceId::new();
        let value = Value::String(id.to_string());
        assert_eq!(InstanceId::from_value(&value), Some(id));
        assert_eq!(InstanceId::from_value(&Value::Bool(false)), None);
        assert_eq!(InstanceId::from_value(&Value::String("not-a-uuid".to_string())), None);
    }

    #[test]
    fn leaf_ids_collects_all_leaves() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        let tree = TriggerTree::Gate {
            op: GateOp::Or,
            children: vec![
                TriggerTree::Leaf { instance_id: a },
                TriggerTree::Leaf { instance_id: b },
            ],
        };
        let mut ids = tree.leaf_ids();
        ids.sort();
        let mut expect = vec![a, b];
        expect.sort();
        assert_eq!(ids, expect);
    }
}
