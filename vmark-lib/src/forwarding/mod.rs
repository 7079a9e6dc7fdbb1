pub mod codec;
pub mod dataplane;
pub mod engine;
pub mod reconcile;
pub mod rule;
pub mod store;
pub mod table;

pub use codec::{decode_key, decode_value, encode_key, encode_value, Action};
pub use dataplane::{Dataplane, MemoryDataplane};
pub use engine::{RuleBrief, RuleEngine, RuleSummary, RuleView, ShowFilter, ShowOutput};
pub use reconcile::{reconcile, ReconcileReport, SkippedRule};
pub use rule::{Rule, RuleParams, INVERSE_PREFIX, NAME_MAX_LEN, VLAN_MAX, VLAN_MIN};
pub use store::SnapshotStore;
pub use table::ForwardingTable;
