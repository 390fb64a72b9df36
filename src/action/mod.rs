pub mod compiler;
pub mod parser;
pub mod render;
pub mod repair;
pub mod types;

pub use compiler::{compile, compile_batch, CompileOptions};
pub use parser::{parse, ParseProfile};
pub use types::{
    ActionArg, ActionType, CoordinateSpace, DeviceOperation, InputMode, OperationGroup,
    ParsedAction, Point,
};
