//! Variant selection
//!
//! `VariantEngine::select` maps a specialization key to a ready variant.
//! The guiding rule is that selection never blocks on an optimized
//! variant: when the best match is still compiling in the background, the
//! key is normalized toward its unoptimized form and selection retries.
//! Each normalization strictly shrinks the key, so the loop is bounded.

use std::sync::Arc;

use crate::key::ShaderKey;
use crate::program::{build_variant, ShaderProgram};
use crate::store::FindResult;
use crate::variant::{determine_wave_size, ShaderVariant};
use crate::VariantEngine;

/// Upper bound on key normalization rounds. Two axes can be normalized
/// (inlined uniforms, then the whole opt segment), so two retries suffice;
/// the bound is doubled as a safety margin.
pub const MAX_SELECT_RETRIES: usize = 4;

/// Why a key could not be served as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyConflict {
    /// The matching optimized variant has not finished compiling.
    OptimizedPending,
    /// The per-program ceiling on inlined-uniform variants was hit.
    TooManyInlineVariants,
}

/// Shrink `key` toward a form that can be served without blocking.
pub fn normalize_key_on_conflict(mut key: ShaderKey, conflict: KeyConflict) -> ShaderKey {
    match conflict {
        KeyConflict::OptimizedPending => key.clear_opt(),
        KeyConflict::TooManyInlineVariants => key.clear_inlined_uniforms(),
    }
    key
}

#[derive(thiserror::Error, Debug)]
pub enum SelectError {
    #[error("shader variant compilation failed")]
    CompilationFailed,
    #[error("variant selection did not converge after {MAX_SELECT_RETRIES} attempts")]
    RetriesExhausted,
}

enum VariantCheck {
    Usable(Arc<ShaderVariant>),
    Conflict(KeyConflict),
    Failed,
}

impl VariantEngine {
    /// Select (or create) the variant of `program` matching `key`.
    ///
    /// `current` is the caller's currently bound variant; when it already
    /// matches, no locks are taken. `previous_stage` is the program that
    /// feeds this one on merged hardware stages (LS+HS, ES+GS) and must be
    /// supplied whenever the key requests a merged linkage.
    pub fn select(
        self: &Arc<Self>,
        program: &Arc<ShaderProgram>,
        current: Option<&Arc<ShaderVariant>>,
        previous_stage: Option<&Arc<ShaderProgram>>,
        key: &ShaderKey,
    ) -> Result<Arc<ShaderVariant>, SelectError> {
        let mut key = *key;
        if self.options.no_opt_variant {
            key.clear_opt();
        }

        for _ in 0..MAX_SELECT_RETRIES {
            let inline = key.opt.inline_uniforms;

            // Fast path: the bound variant still matches.
            if let Some(cur) = current {
                if cur.key.matches(&key, inline) {
                    match self.check_variant(cur) {
                        VariantCheck::Usable(v) => return Ok(v),
                        VariantCheck::Conflict(c) => {
                            key = normalize_key_on_conflict(key, c);
                            continue;
                        }
                        VariantCheck::Failed => return Err(SelectError::CompilationFailed),
                    }
                }
            }

            // The initial compile job takes the program mutex; waiting for
            // it before locking keeps the two from deadlocking.
            program.ready.wait();

            let mut state = program.lock_state();
            match state.store.find(&key, inline, self.options.max_inline_variant_count) {
                FindResult::Found(v) => {
                    drop(state);
                    match self.check_variant(&v) {
                        VariantCheck::Usable(v) => return Ok(v),
                        VariantCheck::Conflict(c) => {
                            key = normalize_key_on_conflict(key, c);
                            continue;
                        }
                        VariantCheck::Failed => return Err(SelectError::CompilationFailed),
                    }
                }
                FindResult::TooManyVariants => {
                    drop(state);
                    key = normalize_key_on_conflict(key, KeyConflict::TooManyInlineVariants);
                    continue;
                }
                FindResult::Missing => {}
            }

            // Build a new variant. The program mutex stays held so every
            // other selecting thread observes the variant before racing to
            // compile the same key.
            let is_pure_mono =
                self.options.use_monolithic_shaders || !key.mono.is_default();
            let is_optimized = !is_pure_mono && !key.opt_is_default(inline);
            let is_monolithic = is_pure_mono || !key.opt_is_default(inline);

            if let Some(prev) = previous_stage {
                prev.ready.wait();
            }
            if !is_monolithic {
                if let Some(prev) = previous_stage {
                    let mut prev_key = ShaderKey::new(prev.stage);
                    match program.stage {
                        crate::key::ShaderStage::TessCtrl => prev_key.as_ls = true,
                        crate::key::ShaderStage::Geometry => {
                            prev_key.as_es = !key.as_ngg;
                            prev_key.as_ngg = key.as_ngg;
                        }
                        _ => {}
                    }
                    prev.ensure_main_part(self, &prev_key)
                        .map_err(|_| SelectError::CompilationFailed)?;
                }
                program
                    .ensure_main_part_locked(&mut state, self, &key.main_part_key())
                    .map_err(|_| SelectError::CompilationFailed)?;
            }

            let merged = key.as_ls || key.as_es;
            let wave_size =
                determine_wave_size(&self.device, program.info.has_divergent_loop, merged);
            let variant = ShaderVariant::new(
                key,
                wave_size,
                is_monolithic,
                is_optimized,
                previous_stage.cloned(),
            );
            state.store.push(variant.clone());

            if is_optimized {
                // Compile in the background at low priority and serve the
                // unoptimized form in the meantime.
                drop(state);
                let engine = self.clone();
                let program_ref = program.clone();
                let target = variant.clone();
                let handle = self.queue.submit_low_priority(variant.ready_fence(), move || {
                    build_variant(&engine, &program_ref, &target);
                });
                variant.set_job(handle);

                // Even in synchronous mode the unoptimized form is what gets
                // returned; the wait only makes the outcome deterministic.
                if self.options.sync_compile {
                    variant.wait_ready();
                }
                key = normalize_key_on_conflict(key, KeyConflict::OptimizedPending);
                continue;
            }

            // The variant is in the store, so the mutex can be released
            // before the compile; concurrent lookups land on its fence.
            drop(state);
            build_variant(self, program, &variant);
            if variant.compilation_failed() {
                return Err(SelectError::CompilationFailed);
            }
            return Ok(variant);
        }

        tracing::error!("variant selection exhausted its retry budget");
        Err(SelectError::RetriesExhausted)
    }

    fn check_variant(&self, variant: &Arc<ShaderVariant>) -> VariantCheck {
        if !variant.ready() {
            if variant.is_optimized {
                return VariantCheck::Conflict(KeyConflict::OptimizedPending);
            }
            variant.wait_ready();
        }
        if variant.compilation_failed() {
            VariantCheck::Failed
        } else {
            VariantCheck::Usable(variant.clone())
        }
    }
}
