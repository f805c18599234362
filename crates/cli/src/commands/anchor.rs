// `tether anchor`: encode and decode signed anchor tokens.

use clap::{Args, Subcommand, ValueEnum};
use serde::Serialize;
use tether_core::anchor::{AnchorCodec, Bias};
use tether_core::Anchor;

use super::Context;
use crate::exit_code::{ExitCode, UsageError};
use crate::output;

#[derive(Debug, Subcommand)]
pub enum AnchorCommand {
    /// Encode a block position into an opaque token
    Encode(EncodeArgs),
    /// Decode a token back into its block position
    Decode(DecodeArgs),
}

#[derive(Debug, Args)]
pub struct KeyArgs {
    /// Signing key; falls back to the built-in key when unset.
    #[arg(long, env = "TETHER_ANCHOR_KEY", hide_env_values = true)]
    anchor_key: Option<String>,
}

impl KeyArgs {
    fn codec(&self) -> AnchorCodec {
        match &self.anchor_key {
            Some(key) => AnchorCodec::new(key),
            None => AnchorCodec::default(),
        }
    }
}

#[derive(Debug, Args)]
pub struct EncodeArgs {
    /// Block id the anchor lives in.
    #[arg(long)]
    block: String,

    /// Char offset inside the block.
    #[arg(long)]
    offset: usize,

    #[arg(long, value_enum, default_value_t = BiasArg::After)]
    bias: BiasArg,

    #[command(flatten)]
    key: KeyArgs,
}

#[derive(Debug, Args)]
pub struct DecodeArgs {
    token: String,

    #[command(flatten)]
    key: KeyArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BiasArg {
    Before,
    After,
}

impl From<BiasArg> for Bias {
    fn from(bias: BiasArg) -> Self {
        match bias {
            BiasArg::Before => Bias::Before,
            BiasArg::After => Bias::After,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnchorToken {
    pub token: String,
    pub anchor: Anchor,
}

pub fn run(cmd: AnchorCommand, ctx: &Context) -> anyhow::Result<ExitCode> {
    let token = match cmd {
        AnchorCommand::Encode(args) => encode(&args)?,
        AnchorCommand::Decode(args) => decode(&args)?,
    };
    output::print_output(ctx.format, &token, format_human)?;
    Ok(ExitCode::Success)
}

fn encode(args: &EncodeArgs) -> anyhow::Result<AnchorToken> {
    let anchor = Anchor::new(args.block.clone(), args.offset, args.bias.into());
    let token = args.key.codec().encode(&anchor).map_err(|e| UsageError(e.to_string()))?;
    Ok(AnchorToken { token, anchor })
}

fn decode(args: &DecodeArgs) -> anyhow::Result<AnchorToken> {
    let anchor = args
        .key
        .codec()
        .try_decode(&args.token)
        .map_err(|e| UsageError(format!("anchor token rejected: {e}")))?;
    Ok(AnchorToken { token: args.token.trim().to_string(), anchor })
}

fn format_human(token: &AnchorToken) -> String {
    format!("{}\n  {}", token.token, token.anchor)
}
