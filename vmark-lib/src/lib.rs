pub mod error;
pub mod forwarding;
pub mod paths;
pub mod twamp;

pub use error::{NodeError, Result};
pub use forwarding::{
    Dataplane, ForwardingTable, MemoryDataplane, Rule, RuleEngine, RuleParams, ShowFilter,
};
pub use twamp::{Responder, ResponderConfig, SenderConfig, SessionReport};
