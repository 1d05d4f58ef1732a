#![forbid(unsafe_code)]

mod codegen;
mod jump_table;

pub use codegen::{emit_llvm_ir, LlvmArtifacts, LlvmBackendError};
pub use jump_table::{analyze_switch, JumpTable, JumpTableMetrics, SwitchLowering};
