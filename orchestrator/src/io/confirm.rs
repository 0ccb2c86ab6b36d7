//! Operator confirmation gates.
//!
//! Every destructive or submitting action asks a [`Confirm`] first. The CLI
//! uses [`TerminalConfirm`], or [`AnnouncedConfirm`] under `--yes`; library
//! callers and tests pass a silent [`FixedConfirm`].

use std::io::{BufRead, Write};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// A question put to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    /// Short description of what happens on approval.
    pub action: String,
    /// Material to review before deciding (generated script, failure list).
    pub details: Option<String>,
}

impl ConfirmRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

pub trait Confirm {
    /// `Ok(true)` to proceed, `Ok(false)` to decline.
    fn confirm(&self, request: &ConfirmRequest) -> Result<bool>;
}

/// Non-interactive policy: always approve or always decline.
#[derive(Debug, Clone, Copy)]
pub struct FixedConfirm(pub bool);

impl Confirm for FixedConfirm {
    fn confirm(&self, request: &ConfirmRequest) -> Result<bool> {
        debug!(action = %request.action, approved = self.0, "fixed confirmation");
        Ok(self.0)
    }
}

/// Fixed policy that still prints what it decided on to stdout.
#[derive(Debug, Clone, Copy)]
pub struct AnnouncedConfirm(pub bool);

impl Confirm for AnnouncedConfirm {
    fn confirm(&self, request: &ConfirmRequest) -> Result<bool> {
        let stdout = std::io::stdout();
        announce(request, self.0, &mut stdout.lock())?;
        Ok(self.0)
    }
}

fn write_details<W: Write>(request: &ConfirmRequest, out: &mut W) -> Result<()> {
    if let Some(details) = &request.details {
        write!(out, "{details}").context("write confirmation details")?;
        if !details.ends_with('\n') {
            writeln!(out).context("write confirmation details")?;
        }
    }
    Ok(())
}

fn announce<W: Write>(request: &ConfirmRequest, approved: bool, out: &mut W) -> Result<()> {
    write_details(request, out)?;
    let decision = if approved { "approved" } else { "declined" };
    writeln!(out, "[{}] {decision} (--yes)", request.action).context("write decision")?;
    out.flush().context("flush decision")
}

/// Prints the details and asks `[Y/YES/N/NO]` on stdin until answered.
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, request: &ConfirmRequest) -> Result<bool> {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        ask(request, &mut stdin.lock(), &mut stdout.lock())
    }
}

fn ask<R: BufRead, W: Write>(request: &ConfirmRequest, input: &mut R, out: &mut W) -> Result<bool> {
    write_details(request, out)?;
    loop {
        write!(out, "[{}] Continue? [Y/YES/N/NO] ", request.action).context("write prompt")?;
        out.flush().context("flush prompt")?;
        let mut answer = String::new();
        if input.read_line(&mut answer).context("read answer")? == 0 {
            bail!("stdin closed while waiting for confirmation");
        }
        match answer.trim().to_uppercase().as_str() {
            "Y" | "YES" => return Ok(true),
            "N" | "NO" => return Ok(false),
            _ => continue,
        }
    }
}
