pub mod controller;
pub mod machine;

pub use controller::{CallController, Snapshot};
pub use machine::{CallStateMachine, Command, NegotiateOp};
