use std::sync::Arc;

use dyngrant_core_types::{Capability, ExecutionContext, GrantError};

use crate::GrantEngine;

/// Execution contexts on whose behalf a grant is requested, innermost first.
#[derive(Clone, Debug, Default)]
pub struct AccessContext {
    frames: Vec<Arc<ExecutionContext>>,
}

impl AccessContext {
    pub fn new(frames: Vec<Arc<ExecutionContext>>) -> Self {
        Self { frames }
    }

    pub fn single(frame: Arc<ExecutionContext>) -> Self {
        Self {
            frames: vec![frame],
        }
    }

    pub fn frames(&self) -> &[Arc<ExecutionContext>] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Decides whether a caller may hand out the requested capabilities.
///
/// Invoked by [`GrantEngine::grant`] before any engine lock is taken.
pub trait GrantAuthorizer: Send + Sync {
    fn check_grant(
        &self,
        engine: &GrantEngine,
        caller: &AccessContext,
        requested: &[Capability],
    ) -> Result<(), GrantError>;
}

/// Requires every caller frame to hold `GrantAuthority(token)` for each requested
/// token, evaluated through the engine's own effective capabilities.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelfAuthorizer;

impl GrantAuthorizer for SelfAuthorizer {
    fn check_grant(
        &self,
        engine: &GrantEngine,
        caller: &AccessContext,
        requested: &[Capability],
    ) -> Result<(), GrantError> {
        for frame in caller.frames() {
            let handle = engine.for_context(Some(frame))?;
            for token in requested {
                let authority = Capability::grant_authority(token.clone());
                if !engine.implies(&handle, &authority)? {
                    return Err(GrantError::Security(format!(
                        "caller {} ({}) lacks {authority}",
                        frame.origin(),
                        frame.identities()
                    )));
                }
            }
        }
        Ok(())
    }
}
