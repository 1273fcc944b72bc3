//! Command verification.
//!
//! After an ambiguous exchange failure, the orchestrator asks the pod
//! whether the command landed by sending a no-op `CancelDelivery(NONE)`
//! with the nonce it now believes the pod expects:
//!
//! | probe reply          | meaning                                   |
//! |----------------------|-------------------------------------------|
//! | accepted             | pod consumed the original nonce: success  |
//! | nonce out of sync    | pod never advanced: certain failure       |
//! | anything else        | still no information: uncertain failure   |
//!
//! Only meaningful for commands whose message block carries the nonce.

use log::{info, warn};

use crate::error::{CommandError, Error, Result};
use crate::pod::DeliveryTypes;

use super::commands::PodCommand;
use super::responses::Response;

/// Sends one command with the session's addressing and nonce bookkeeping.
///
/// Implemented by the orchestrator's session core; tests script it.
pub trait CommandChannel {
    fn send(&mut self, command: PodCommand) -> core::result::Result<Response, CommandError>;
}

/// Outcome of the nonce probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerificationResult {
    Success,
    CertainFailure,
    UncertainFailure,
}

/// The no-op command used as the probe.
pub fn probe_command() -> PodCommand {
    PodCommand::CancelDelivery {
        types: DeliveryTypes::NONE,
        beep: false,
    }
}

/// Probe the pod to classify the preceding failure.
pub fn verify_command(channel: &mut impl CommandChannel) -> CommandVerificationResult {
    warn!("verify: probing nonce with cancel-none");
    match channel.send(probe_command()) {
        Ok(_) => {
            info!("verify: command resolved to success");
            CommandVerificationResult::Success
        }
        Err(e) if e.is_nonce_out_of_sync() => {
            info!("verify: command resolved to certain failure");
            CommandVerificationResult::CertainFailure
        }
        Err(e) => {
            warn!("verify: command unresolved ({e})");
            CommandVerificationResult::UncertainFailure
        }
    }
}

/// Run `command`, resolving any ambiguous failure with [`verify_command`].
///
/// `Ok(Some(_))` is the command's own reply; `Ok(None)` means the reply was
/// lost but the probe showed the pod executed the command.
pub fn execute_and_verify(
    channel: &mut impl CommandChannel,
    command: PodCommand,
) -> Result<Option<Response>> {
    let name = command.name();
    let cause = match channel.send(command) {
        Ok(response) => return Ok(Some(response)),
        Err(e) if e.certain => return Err(Error::CertainCommandFailure(e)),
        Err(e) => e,
    };

    warn!("verify: {name} failed ambiguously: {cause}");
    match verify_command(channel) {
        CommandVerificationResult::Success => Ok(None),
        CommandVerificationResult::CertainFailure => Err(Error::CertainCommandFailure(
            CommandError {
                certain: true,
                ..cause
            },
        )),
        CommandVerificationResult::UncertainFailure => Err(Error::UncertainCommandFailure(cause)),
    }
}
