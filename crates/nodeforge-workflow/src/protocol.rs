//! Idempotent mutation with compensation
//!
//! Every concrete provisioning resource is observed as a pair of booleans,
//! e.g. a kernel module is `(loaded, persisted)`. [`PairedMutation`] turns a
//! [`PairedResource`] into a step handler that
//!
//! 1. records which axes already held before the run (`already<Axis>`),
//! 2. applies only the missing axes, re-observing between the two,
//! 3. flags each axis it actually changed (`<axis>ByThisStep`),
//! 4. on rollback undoes only flagged axes, second before first, and only
//!    while the host still shows the change.

use crate::context::StepContext;
use crate::error::Result;
use crate::report::Metadata;
use crate::state::StepState;
use crate::step::{Outcome, Step, StepHandler};
use async_trait::async_trait;
use tracing::{debug, info};

/// Key set when any axis was changed by the step
pub const MODIFIED_BY_THIS_STEP: &str = "modifiedByThisStep";

/// One boolean dimension of a resource's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Axis {
    name: &'static str,
}

impl Axis {
    /// `name` is the capitalized axis name, e.g. `"Loaded"`
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `"Loaded"` becomes `"alreadyLoaded"`
    pub fn already_key(&self) -> String {
        format!("already{}", self.name)
    }

    /// `"Loaded"` becomes `"loadedByThisStep"`
    pub fn by_this_step_key(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => format!(
                "{}{}ByThisStep",
                first.to_ascii_lowercase(),
                chars.as_str()
            ),
            None => "ByThisStep".to_string(),
        }
    }
}

/// Observed state of a resource along its two axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    pub first: bool,
    pub second: bool,
}

impl Observation {
    pub fn new(first: bool, second: bool) -> Self {
        Self { first, second }
    }

    pub fn is_complete(&self) -> bool {
        self.first && self.second
    }
}

/// Result of undoing an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// The change was undone
    Reverted,
    /// The change is deliberately kept (e.g. a Helm upgrade)
    Retained,
}

/// A host resource described by two boolean axes
#[async_trait]
pub trait PairedResource: Send + Sync {
    /// Human-readable name used in logs
    fn describe(&self) -> String;

    /// The two axes, in the order they are applied
    fn axes(&self) -> (Axis, Axis);

    async fn observe(&self, ctx: &StepContext) -> Result<Observation>;

    async fn apply_first(&self, ctx: &StepContext, state: &mut StepState) -> Result<()>;

    async fn apply_second(&self, ctx: &StepContext, state: &mut StepState) -> Result<()>;

    async fn revert_first(&self, ctx: &StepContext, state: &mut StepState) -> Result<Compensation>;

    async fn revert_second(&self, ctx: &StepContext, state: &mut StepState)
        -> Result<Compensation>;

    /// Clean up whatever a failed `apply_*` left behind. Returns whether
    /// anything was undone.
    async fn compensate_partial(&self, ctx: &StepContext, state: &mut StepState) -> Result<bool> {
        let _ = (ctx, state);
        Ok(false)
    }

    /// Add resource-specific metadata to reports
    fn annotate(&self, metadata: &mut Metadata) {
        let _ = metadata;
    }
}

/// Step handler implementing the idempotent mutation protocol over a
/// [`PairedResource`]
pub struct PairedMutation<R> {
    resource: R,
}

impl<R: PairedResource> PairedMutation<R> {
    pub fn new(resource: R) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }
}

fn record(metadata: &mut Metadata, key: String, value: bool) {
    metadata.insert(key, value.to_string());
}

#[async_trait]
impl<R: PairedResource> StepHandler for PairedMutation<R> {
    async fn execute(
        &self,
        ctx: &StepContext,
        state: &mut StepState,
        metadata: &mut Metadata,
    ) -> Result<Outcome> {
        let (first, second) = self.resource.axes();
        let name = self.resource.describe();
        self.resource.annotate(metadata);

        let before = self.resource.observe(ctx).await?;
        state.set(first.already_key(), before.first);
        state.set(second.already_key(), before.second);
        record(metadata, first.already_key(), before.first);
        record(metadata, second.already_key(), before.second);
        record(metadata, MODIFIED_BY_THIS_STEP.to_string(), false);

        if before.is_complete() {
            debug!(resource = %name, "Already in desired state");
            return Ok(Outcome::Unchanged);
        }

        if !before.first {
            self.resource.apply_first(ctx, state).await?;
            state.set(first.by_this_step_key(), true);
            state.set(MODIFIED_BY_THIS_STEP, true);
            record(metadata, first.by_this_step_key(), true);
            record(metadata, MODIFIED_BY_THIS_STEP.to_string(), true);
            info!(resource = %name, axis = first.name(), "Applied");
        }

        let current = if before.first {
            before
        } else {
            self.resource.observe(ctx).await?
        };
        if !current.second {
            self.resource.apply_second(ctx, state).await?;
            state.set(second.by_this_step_key(), true);
            state.set(MODIFIED_BY_THIS_STEP, true);
            record(metadata, second.by_this_step_key(), true);
            record(metadata, MODIFIED_BY_THIS_STEP.to_string(), true);
            info!(resource = %name, axis = second.name(), "Applied");
        }

        Ok(Outcome::Changed)
    }

    async fn rollback(
        &self,
        ctx: &StepContext,
        state: &mut StepState,
        metadata: &mut Metadata,
    ) -> Result<Outcome> {
        let (first, second) = self.resource.axes();
        let name = self.resource.describe();
        self.resource.annotate(metadata);

        let (Some(already_first), Some(already_second)) = (
            state.get_bool(&first.already_key()),
            state.get_bool(&second.already_key()),
        ) else {
            debug!(resource = %name, "Nothing recorded, nothing to roll back");
            return Ok(Outcome::Unchanged);
        };
        if already_first && already_second {
            debug!(resource = %name, "Pre-existing state left untouched");
            return Ok(Outcome::Unchanged);
        }

        let mut undone = false;
        let flagged_second = state.flag(&second.by_this_step_key());
        let flagged_first = state.flag(&first.by_this_step_key());

        if flagged_second || flagged_first {
            let current = self.resource.observe(ctx).await?;

            if flagged_second {
                if current.second {
                    match self.resource.revert_second(ctx, state).await? {
                        Compensation::Reverted => {
                            undone = true;
                            record(metadata, format!("{}Reverted", second.name()), true);
                            info!(resource = %name, axis = second.name(), "Reverted");
                        }
                        Compensation::Retained => {
                            record(metadata, format!("{}Retained", second.name()), true);
                            info!(resource = %name, axis = second.name(), "Change retained");
                        }
                    }
                }
                state.remove(&second.by_this_step_key());
            }

            if flagged_first {
                if current.first {
                    match self.resource.revert_first(ctx, state).await? {
                        Compensation::Reverted => {
                            undone = true;
                            record(metadata, format!("{}Reverted", first.name()), true);
                            info!(resource = %name, axis = first.name(), "Reverted");
                        }
                        Compensation::Retained => {
                            record(metadata, format!("{}Retained", first.name()), true);
                            info!(resource = %name, axis = first.name(), "Change retained");
                        }
                    }
                }
                state.remove(&first.by_this_step_key());
            }
        }

        if self.resource.compensate_partial(ctx, state).await? {
            undone = true;
            record(metadata, "partialCompensated".to_string(), true);
        }

        state.remove(MODIFIED_BY_THIS_STEP);
        Ok(if undone {
            Outcome::Changed
        } else {
            Outcome::Unchanged
        })
    }
}

/// Build a step running the idempotent mutation protocol over `resource`
pub fn paired_step<R: PairedResource + 'static>(
    id: impl Into<String>,
    resource: R,
) -> Result<Step> {
    Step::builder(id)
        .handler(PairedMutation::new(resource))
        .build()
}
