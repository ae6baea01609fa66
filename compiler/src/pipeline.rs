// pipeline.rs — Compilation state and pass orchestration
//
// Holds the program being annotated with the accumulated diagnostics and runs
// the minimal set of passes for a given terminal PassId. Structural
// verification runs first, as a pre-pass outside the PassId graph.
//
// Preconditions: none; malformed programs are reported by the pre-pass.
// Postconditions: attributes produced by every required pass are written, or
//                 has_error is set.
// Failure modes: any pass emitting diagnostics.
// Side effects: calls on_pass_complete after each pass for immediate display.

use std::time::Instant;

use crate::defaults::{default_loop_nest, default_sequence, default_storage};
use crate::diag::Diagnostic;
use crate::pass::{descriptor, required_passes, PassId};
use crate::program::{verify_structure, Program};

// ── State ───────────────────────────────────────────────────────────────────

/// Program under annotation and everything the passes reported.
pub struct CompilationState {
    pub program: Program,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

impl CompilationState {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            diagnostics: Vec::new(),
            has_error: false,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed due to diagnostics of a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    pub failing_pass: PassId,
}

/// Per-pass post-processing: callback, accumulate, verbose, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = !diags.is_empty();
    state.diagnostics.extend(diags);
    if verbose {
        eprintln!(
            "lowattr: {} complete, {:.1}ms",
            descriptor(pass_id).name,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → verbose → error check.
///
/// Postconditions: attributes of all passes in `required_passes(terminal)` are
///   written, or `state.has_error` is true.
/// Failure modes: structural errors (has_error set, Ok returned) or the first
///   pass producing diagnostics.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    let passes = required_passes(terminal);

    // Structural verification: everything below indexes operands and
    // domains without further checks.
    let structural = verify_structure(&state.program);
    state.has_error |= !structural.is_empty();
    state.diagnostics.extend(structural);
    if state.has_error {
        return Ok(());
    }

    for &pass_id in &passes {
        let t = Instant::now();
        let diags = match pass_id {
            PassId::DefaultSequence => default_sequence(&mut state.program),
            PassId::DefaultLoopNest => default_loop_nest(&mut state.program),
            PassId::DefaultStorage => default_storage(&mut state.program),
        };
        let elapsed = t.elapsed();
        finish_pass(
            state,
            pass_id,
            diags,
            elapsed,
            verbose,
            &mut on_pass_complete,
        )?;
    }
    Ok(())
}

/// Infer every missing lowering attribute of `program`.
///
/// Runs on a copy: on failure `program` is left untouched and the diagnostics
/// of the failing step are returned.
pub fn infer_default_attributes(program: &mut Program) -> Result<(), Vec<Diagnostic>> {
    let mut state = CompilationState::new(program.clone());
    let result = run_pipeline(&mut state, PassId::DefaultStorage, false, |_, _| {});
    if result.is_err() || state.has_error {
        return Err(state.diagnostics);
    }
    *program = state.program;
    Ok(())
}
