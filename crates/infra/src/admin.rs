//! Text command console for operators.
//!
//! Per-processor commands:
//!
//! ```text
//! size
//! flush on|off
//! active on|off
//! wake
//! clear [high|normal|low]          (default low: everything)
//! update <id> [user] [priority]
//! delete <id> [user] [priority]
//! dump
//! persist
//! ```
//!
//! Process-wide commands: `pause`, `resume`, `list`.
//!
//! For `update`/`delete` a single trailing argument is taken as a priority
//! when it parses as one, otherwise as the user. `-` means "no user".

use thiserror::Error;

use eventproc_core::{DataId, EventKind, Priority, ProcessorError};
use eventproc_events::EnqueueOutcome;

use crate::persist::NO_USER;
use crate::registry::ProcessRegistry;

/// Malformed or unexecutable console input. Nothing was changed.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown processor '{0}'")]
    UnknownProcessor(String),

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Size,
    Flush(bool),
    Active(bool),
    Wake,
    Clear(Priority),
    Submit {
        kind: EventKind,
        data_id: DataId,
        user: Option<String>,
        priority: Priority,
    },
    Dump,
    Persist,
    Pause,
    Resume,
    List,
}

impl AdminCommand {
    pub fn parse(input: &str) -> Result<Self, AdminError> {
        let mut words = input.split_whitespace();
        let verb = words.next().ok_or(AdminError::Empty)?.to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        let command = match verb.as_str() {
            "size" => AdminCommand::Size,
            "flush" => AdminCommand::Flush(parse_switch(args.first().copied())?),
            "active" => AdminCommand::Active(parse_switch(args.first().copied())?),
            "wake" => AdminCommand::Wake,
            "clear" => AdminCommand::Clear(match args.first() {
                Some(p) => parse_priority(p)?,
                None => Priority::Low,
            }),
            "update" => parse_submit(EventKind::Update, &args)?,
            "delete" => parse_submit(EventKind::Delete, &args)?,
            "dump" => AdminCommand::Dump,
            "persist" => AdminCommand::Persist,
            "pause" => AdminCommand::Pause,
            "resume" => AdminCommand::Resume,
            "list" => AdminCommand::List,
            other => return Err(AdminError::UnknownCommand(other.to_string())),
        };

        let max_args = match &command {
            AdminCommand::Flush(_) | AdminCommand::Active(_) | AdminCommand::Clear(_) => 1,
            AdminCommand::Submit { .. } => 3,
            _ => 0,
        };
        if args.len() > max_args {
            return Err(AdminError::InvalidArgument(format!(
                "too many arguments for '{verb}'"
            )));
        }
        Ok(command)
    }

    /// Commands that act on the whole process rather than one instance.
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            AdminCommand::Pause | AdminCommand::Resume | AdminCommand::List
        )
    }

    /// Run the command and describe the result.
    ///
    /// Per-instance commands need `target`; global commands ignore it.
    pub fn execute(
        &self,
        registry: &ProcessRegistry,
        target: Option<&str>,
    ) -> Result<String, AdminError> {
        if let Some(message) = self.execute_global(registry) {
            return Ok(message);
        }

        let name = target.ok_or(AdminError::MissingArgument("processor"))?;
        let processor = registry
            .get(name)
            .ok_or_else(|| AdminError::UnknownProcessor(name.to_string()))?;

        let message = match self {
            AdminCommand::Size => processor.report().to_string(),
            AdminCommand::Flush(on) => {
                processor.set_flush(*on)?;
                format!("flush mode {}", if *on { "enabled" } else { "disabled" })
            }
            AdminCommand::Active(on) => {
                processor.set_active(*on);
                format!("{} mode", if *on { "active" } else { "passive" })
            }
            AdminCommand::Wake => {
                processor.wake();
                "worker woken".to_string()
            }
            AdminCommand::Clear(threshold) => {
                let discarded = processor.purge(*threshold);
                format!("cleared {discarded} events")
            }
            AdminCommand::Submit {
                kind,
                data_id,
                user,
                priority,
            } => match processor.submit(*kind, data_id.clone(), user.clone(), *priority) {
                EnqueueOutcome::Enqueued { position } => {
                    format!("{kind} {data_id} enqueued at position {position}")
                }
                EnqueueOutcome::NoOp => format!("{kind} {data_id} already covered by queued event"),
                EnqueueOutcome::Cancelled => format!("{kind} {data_id} cancelled pending create"),
            },
            AdminCommand::Dump => processor.dump().to_string(),
            AdminCommand::Persist => {
                let summary = processor.persist_now();
                format!(
                    "persisted {} events, {} failed",
                    summary.written, summary.failed
                )
            }
            AdminCommand::Pause | AdminCommand::Resume | AdminCommand::List => String::new(),
        };
        Ok(message)
    }

    fn execute_global(&self, registry: &ProcessRegistry) -> Option<String> {
        let message = match self {
            AdminCommand::Pause => {
                registry.set_pause(true);
                "all processors paused".to_string()
            }
            AdminCommand::Resume => {
                registry.set_pause(false);
                "all processors resumed".to_string()
            }
            AdminCommand::List => {
                let lines: Vec<String> = registry
                    .instances()
                    .iter()
                    .map(|p| p.report().to_string())
                    .collect();
                if lines.is_empty() {
                    "no processors running".to_string()
                } else {
                    lines.join("\n")
                }
            }
            _ => return None,
        };
        Some(message)
    }
}

fn parse_switch(arg: Option<&str>) -> Result<bool, AdminError> {
    match arg.map(str::to_ascii_lowercase).as_deref() {
        Some("on" | "true" | "1") => Ok(true),
        Some("off" | "false" | "0") => Ok(false),
        Some(other) => Err(AdminError::InvalidArgument(format!(
            "expected on|off, got '{other}'"
        ))),
        None => Err(AdminError::MissingArgument("on|off")),
    }
}

fn parse_priority(arg: &str) -> Result<Priority, AdminError> {
    arg.parse()
        .map_err(|_| AdminError::InvalidArgument(format!("unknown priority '{arg}'")))
}

fn parse_user(arg: &str) -> Option<String> {
    (arg != NO_USER).then(|| arg.to_string())
}

fn parse_submit(kind: EventKind, args: &[&str]) -> Result<AdminCommand, AdminError> {
    let id = args.first().ok_or(AdminError::MissingArgument("id"))?;
    let data_id =
        DataId::new(*id).map_err(|e| AdminError::InvalidArgument(e.to_string()))?;

    let (user, priority) = match &args[1..] {
        [] => (None, Priority::Normal),
        [single] => match single.parse::<Priority>() {
            Ok(priority) => (None, priority),
            Err(_) => (parse_user(single), Priority::Normal),
        },
        [user, priority, ..] => (parse_user(user), parse_priority(priority)?),
    };

    Ok(AdminCommand::Submit {
        kind,
        data_id,
        user,
        priority,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(kind: EventKind, id: &str, user: Option<&str>, priority: Priority) -> AdminCommand {
        AdminCommand::Submit {
            kind,
            data_id: DataId::new(id).unwrap(),
            user: user.map(str::to_owned),
            priority,
        }
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(AdminCommand::parse("size").unwrap(), AdminCommand::Size);
        assert_eq!(AdminCommand::parse("  WAKE ").unwrap(), AdminCommand::Wake);
        assert_eq!(AdminCommand::parse("flush on").unwrap(), AdminCommand::Flush(true));
        assert_eq!(AdminCommand::parse("active off").unwrap(), AdminCommand::Active(false));
        assert!(AdminCommand::parse("list").unwrap().is_global());
    }

    #[test]
    fn clear_defaults_to_everything() {
        assert_eq!(
            AdminCommand::parse("clear").unwrap(),
            AdminCommand::Clear(Priority::Low)
        );
        assert_eq!(
            AdminCommand::parse("clear normal").unwrap(),
            AdminCommand::Clear(Priority::Normal)
        );
    }

    #[test]
    fn submit_arguments_are_positional() {
        assert_eq!(
            AdminCommand::parse("update doc-1").unwrap(),
            submit(EventKind::Update, "doc-1", None, Priority::Normal)
        );
        assert_eq!(
            AdminCommand::parse("update doc-1 high").unwrap(),
            submit(EventKind::Update, "doc-1", None, Priority::High)
        );
        assert_eq!(
            AdminCommand::parse("delete doc-1 alice").unwrap(),
            submit(EventKind::Delete, "doc-1", Some("alice"), Priority::Normal)
        );
        assert_eq!(
            AdminCommand::parse("delete doc-1 - low").unwrap(),
            submit(EventKind::Delete, "doc-1", None, Priority::Low)
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(AdminCommand::parse(""), Err(AdminError::Empty)));
        assert!(matches!(
            AdminCommand::parse("explode"),
            Err(AdminError::UnknownCommand(_))
        ));
        assert!(matches!(
            AdminCommand::parse("flush"),
            Err(AdminError::MissingArgument(_))
        ));
        assert!(matches!(
            AdminCommand::parse("flush maybe"),
            Err(AdminError::InvalidArgument(_))
        ));
        assert!(matches!(
            AdminCommand::parse("update"),
            Err(AdminError::MissingArgument("id"))
        ));
        assert!(matches!(
            AdminCommand::parse("update doc-1 alice urgent"),
            Err(AdminError::InvalidArgument(_))
        ));
        assert!(matches!(
            AdminCommand::parse("wake now"),
            Err(AdminError::InvalidArgument(_))
        ));
    }

    #[test]
    fn instance_commands_need_a_known_target() {
        let registry = ProcessRegistry::new();
        assert!(matches!(
            AdminCommand::Size.execute(&registry, None),
            Err(AdminError::MissingArgument("processor"))
        ));
        assert!(matches!(
            AdminCommand::Size.execute(&registry, Some("ghost")),
            Err(AdminError::UnknownProcessor(_))
        ));
        assert_eq!(
            AdminCommand::List.execute(&registry, None).unwrap(),
            "no processors running"
        );
    }
}
