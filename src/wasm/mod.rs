//! Bridge to the precompiled flag evaluation module.
//!
//! The module is a WASI binary. All communication goes through its linear memory:
//!
//! 1. the [`WasmInput`] is encoded as JSON;
//! 2. `malloc(len + 1)` reserves room inside the module;
//! 3. the bytes and a NUL terminator are written at the returned pointer;
//! 4. `evaluate(ptr, len)` returns an `i64` packing `(output_ptr << 32) | output_len`;
//! 5. `free(ptr)` releases the input, whether evaluation succeeded or not;
//! 6. the output bytes are read back and decoded into a [`WasmEvaluationResponse`].
mod bridge;
mod models;

pub use bridge::WasmBridge;
pub use models::{WasmEvaluationResponse, WasmFlagContext, WasmInput};

use crate::Result;

/// Something that evaluates flags from a [`WasmInput`].
///
/// [`WasmBridge`] is the production implementation.
pub trait EvaluationEngine: Send + Sync {
    /// Load the engine. Must be called before [`EvaluationEngine::evaluate`].
    fn initialize(&self) -> Result<()>;

    /// Evaluate one flag.
    fn evaluate(&self, input: &WasmInput<'_>) -> Result<WasmEvaluationResponse>;

    /// Release all resources. Calling it more than once is a no-op.
    fn dispose(&self);
}
