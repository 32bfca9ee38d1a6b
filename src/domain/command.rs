use super::event::ParticipatedEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the coordinator decided for a whole global transaction.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum Outcome {
    Confirm,
    Cancel,
}

impl Outcome {
    /// Builds the command this outcome sends to one participant leg.
    pub fn command_for(&self, participation: &ParticipatedEvent) -> CoordinateCommand {
        let method = match self {
            Outcome::Confirm => CommandMethod::Confirm {
                method_name: participation.confirm_method.clone(),
            },
            Outcome::Cancel => CommandMethod::Cancel {
                method_name: participation.cancel_method.clone(),
            },
        };
        CoordinateCommand {
            global_tx_id: participation.tx.global_tx_id.clone(),
            local_tx_id: participation.tx.local_tx_id.clone(),
            service_name: participation.tx.service_name.clone(),
            method,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Confirm => f.write_str("confirm"),
            Outcome::Cancel => f.write_str("cancel"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CommandMethod {
    Confirm { method_name: String },
    Cancel { method_name: String },
}

impl CommandMethod {
    pub fn outcome(&self) -> Outcome {
        match self {
            CommandMethod::Confirm { .. } => Outcome::Confirm,
            CommandMethod::Cancel { .. } => Outcome::Cancel,
        }
    }

    pub fn method_name(&self) -> &str {
        match self {
            CommandMethod::Confirm { method_name } | CommandMethod::Cancel { method_name } => {
                method_name
            }
        }
    }
}

/// Coordinator to participant: run `method` for this leg.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct CoordinateCommand {
    pub global_tx_id: String,
    pub local_tx_id: String,
    pub service_name: String,
    pub method: CommandMethod,
}
