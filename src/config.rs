//! Compilation options (spec.md §6 `options`).
//!
//! Mirrors `config::CompilerConfig` in the teacher crate: a plain struct
//! with a `Default` impl and a small builder API, rather than a stringly
//! typed map of settings.

/// How aggressively the optimizer (C5) rewrites the IR before codegen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum OptimizerLevel {
    /// No optimization: the IR generator's output goes straight to codegen.
    O0,
    /// Constant folding, constant propagation, dead-code elimination.
    O1,
    /// All passes in spec.md §4.3, in their fixed order.
    #[default]
    O2,
}

/// Options threaded through `compile()`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompilerOptions {
    pub optimizer_level: OptimizerLevel,
    /// Whether emitted EVM instructions carry debug annotations (source
    /// span + originating IR instruction). See SPEC_FULL.md §0.3.
    pub emit_debug_info: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            optimizer_level: OptimizerLevel::default(),
            emit_debug_info: true,
        }
    }
}

impl CompilerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimizer_level(mut self, level: OptimizerLevel) -> Self {
        self.optimizer_level = level;
        self
    }

    pub fn with_debug_info(mut self, emit: bool) -> Self {
        self.emit_debug_info = emit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_run_full_optimizer() {
        let opts = CompilerOptions::default();
        assert_eq!(opts.optimizer_level, OptimizerLevel::O2);
        assert!(opts.emit_debug_info);
    }

    #[test]
    fn builder_overrides_fields() {
        let opts = CompilerOptions::new()
            .with_optimizer_level(OptimizerLevel::O0)
            .with_debug_info(false);
        assert_eq!(opts.optimizer_level, OptimizerLevel::O0);
        assert!(!opts.emit_debug_info);
    }
}
