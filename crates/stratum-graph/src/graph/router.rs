//! Decision logic evaluated at conditional edges.
//!
//! A router is a pure function of the context: the same context content
//! always yields the same label. Labels are mapped to targets by the
//! conditional edge that owns the router.

use std::sync::Arc;

use tracing::debug;

use stratum_core::config::RoutingConfig;
use stratum_core::context::Context;

/// Pure function from context to route label.
pub trait Router: Send + Sync {
    fn route(&self, ctx: &Context) -> String;
}

impl<F> Router for F
where
    F: Fn(&Context) -> String + Send + Sync,
{
    fn route(&self, ctx: &Context) -> String {
        self(ctx)
    }
}

type RuleFn = Arc<dyn Fn(&Context) -> Option<String> + Send + Sync>;

struct Rule {
    name: String,
    decide: RuleFn,
}

/// Ordered predicate chain: the first rule that fires wins, otherwise the
/// nominal label function decides.
#[derive(Clone)]
pub struct PriorityRouter {
    rules: Vec<Arc<Rule>>,
    nominal: Arc<dyn Fn(&Context) -> String + Send + Sync>,
}

impl PriorityRouter {
    pub fn new(nominal: impl Fn(&Context) -> String + Send + Sync + 'static) -> Self {
        Self {
            rules: Vec::new(),
            nominal: Arc::new(nominal),
        }
    }

    /// Append a rule that routes to `label` when `predicate` holds.
    pub fn when(
        self,
        name: impl Into<String>,
        predicate: impl Fn(&Context) -> bool + Send + Sync + 'static,
        label: impl Into<String>,
    ) -> Self {
        let label = label.into();
        self.rule(name, move |ctx| predicate(ctx).then(|| label.clone()))
    }

    /// Append a rule that may pick its label from the context.
    pub fn rule(
        mut self,
        name: impl Into<String>,
        decide: impl Fn(&Context) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(Arc::new(Rule {
            name: name.into(),
            decide: Arc::new(decide),
        }));
        self
    }

    /// Rule names in evaluation order.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// The chosen label and the rule that produced it (`"nominal"` if none fired).
    pub fn decide(&self, ctx: &Context) -> (String, &str) {
        for rule in &self.rules {
            if let Some(label) = (rule.decide)(ctx) {
                return (label, rule.name.as_str());
            }
        }
        ((self.nominal)(ctx), "nominal")
    }

    /// The standard stage router.
    ///
    /// In priority order: a pending restart goes to its target; reaching the
    /// error threshold, a missing or empty plan, or an exhausted fan-out go to
    /// `fallback`; otherwise the first plan stage that has not finished, or
    /// `done` once every stage has.
    pub fn stage(
        config: &RoutingConfig,
        fallback: impl Into<String>,
        done: impl Into<String>,
    ) -> Self {
        let fallback = fallback.into();
        let done = done.into();
        let threshold = config.error_threshold;

        Self::new(move |ctx| next_plan_stage(ctx).unwrap_or_else(|| done.clone()))
            .rule("restart_requested", |ctx| {
                ctx.restart.as_ref().map(|signal| signal.target.clone())
            })
            .when(
                "error_threshold_reached",
                error_threshold_reached(threshold),
                fallback.clone(),
            )
            .when("missing_execution_plan", missing_execution_plan, fallback.clone())
            .when("fan_out_exhausted", fan_out_exhausted, fallback)
    }
}

impl Router for PriorityRouter {
    fn route(&self, ctx: &Context) -> String {
        let (label, rule) = self.decide(ctx);
        debug!(
            correlation_id = %ctx.correlation_id,
            rule,
            label = %label,
            "Router decision"
        );
        label
    }
}

pub fn restart_requested(ctx: &Context) -> bool {
    ctx.restart.is_some()
}

/// True once `threshold` or more errors have accumulated.
pub fn error_threshold_reached(threshold: usize) -> impl Fn(&Context) -> bool + Send + Sync {
    move |ctx| ctx.errors.len() >= threshold
}

pub fn missing_execution_plan(ctx: &Context) -> bool {
    !ctx.has_plan()
}

pub fn fan_out_exhausted(ctx: &Context) -> bool {
    ctx.fan_out_exhausted()
}

/// First stage of the plan whose node has not reached a terminal status.
pub fn next_plan_stage(ctx: &Context) -> Option<String> {
    ctx.execution_plan
        .as_ref()?
        .order
        .iter()
        .find(|stage| !ctx.status(stage).is_terminal())
        .cloned()
}
