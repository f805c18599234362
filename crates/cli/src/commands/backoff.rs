// `tether backoff`: print the retry schedule a policy produces.

use clap::{Args, ValueEnum};
use serde::Serialize;
use tether_core::gateway::retry::{
    calculate_backoff, create_aggressive_retry_policy, create_lenient_retry_policy, create_strict_retry_policy,
    RetryPolicy,
};

use super::Context;
use crate::exit_code::ExitCode;
use crate::output;

#[derive(Debug, Args)]
pub struct BackoffArgs {
    /// Preset policy; defaults to the `[retry]` section of the config.
    #[arg(long, value_enum)]
    policy: Option<PolicyPreset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyPreset {
    Strict,
    Lenient,
    Aggressive,
}

impl PolicyPreset {
    fn policy(self) -> RetryPolicy {
        match self {
            Self::Strict => create_strict_retry_policy(),
            Self::Lenient => create_lenient_retry_policy(),
            Self::Aggressive => create_aggressive_retry_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackoffSchedule {
    pub policy: RetryPolicy,
    pub attempts: Vec<BackoffStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackoffStep {
    pub attempt: u32,
    pub backoff_ms: u64,
}

pub fn run(args: BackoffArgs, ctx: &Context) -> anyhow::Result<ExitCode> {
    let policy = match args.policy {
        Some(preset) => preset.policy(),
        None => ctx.config()?.retry,
    };
    let schedule = schedule(policy);
    output::print_output(ctx.format, &schedule, format_human)?;
    Ok(ExitCode::Success)
}

/// One step per allowed retry; attempt `n` waits before the `n`th resubmission.
fn schedule(policy: RetryPolicy) -> BackoffSchedule {
    let attempts = (1..=policy.max_retries)
        .map(|attempt| BackoffStep { attempt, backoff_ms: calculate_backoff(attempt, &policy) })
        .collect();
    BackoffSchedule { policy, attempts }
}

fn format_human(schedule: &BackoffSchedule) -> String {
    let mut lines = vec![format!(
        "max {} retries at relocation level {}",
        schedule.policy.max_retries,
        schedule.policy.relocation_level.as_u8()
    )];
    for step in &schedule.attempts {
        lines.push(format!("  attempt {:>2}: {:>6} ms", step.attempt, step.backoff_ms));
    }
    lines.join("\n")
}
